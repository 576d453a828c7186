use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStatsSnapshot {
    /// Nodes faulted in from the backing store
    pub node_loads: u64,
    /// Node records written back
    pub node_saves: u64,
    /// Node records deleted from the backing store
    pub node_deletes: u64,
    /// Keys decoded from their serialized form
    pub key_decodes: u64,
    /// Values decoded from their serialized form
    pub value_decodes: u64,
    /// Keys serialized ahead of a flush
    pub key_encodes: u64,
    /// Values serialized ahead of a flush
    pub value_encodes: u64,
    /// Full nodes split during insertion
    pub splits: u64,
    /// Rotations performed while rebalancing
    pub rotations: u64,
    /// Clean nodes dropped from the node cache
    pub evictions: u64,
}

/// Thread-safe statistics tracking for tree operations.
#[derive(Default, Debug)]
pub struct TreeStats {
    pub(super) node_loads: AtomicU64,
    pub(super) node_saves: AtomicU64,
    pub(super) node_deletes: AtomicU64,
    pub(super) key_decodes: AtomicU64,
    pub(super) value_decodes: AtomicU64,
    pub(super) key_encodes: AtomicU64,
    pub(super) value_encodes: AtomicU64,
    pub(super) splits: AtomicU64,
    pub(super) rotations: AtomicU64,
    pub(super) evictions: AtomicU64,
}

impl TreeStats {
    /// Returns the number of keys decoded so far.
    pub fn key_decodes(&self) -> u64 {
        self.key_decodes.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of values decoded so far.
    pub fn value_decodes(&self) -> u64 {
        self.value_decodes.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of nodes loaded so far.
    pub fn node_loads(&self) -> u64 {
        self.node_loads.load(AtomicOrdering::Relaxed)
    }

    pub(super) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Captures all counters.
    pub fn snapshot(&self) -> TreeStatsSnapshot {
        TreeStatsSnapshot {
            node_loads: self.node_loads.load(AtomicOrdering::Relaxed),
            node_saves: self.node_saves.load(AtomicOrdering::Relaxed),
            node_deletes: self.node_deletes.load(AtomicOrdering::Relaxed),
            key_decodes: self.key_decodes.load(AtomicOrdering::Relaxed),
            value_decodes: self.value_decodes.load(AtomicOrdering::Relaxed),
            key_encodes: self.key_encodes.load(AtomicOrdering::Relaxed),
            value_encodes: self.value_encodes.load(AtomicOrdering::Relaxed),
            splits: self.splits.load(AtomicOrdering::Relaxed),
            rotations: self.rotations.load(AtomicOrdering::Relaxed),
            evictions: self.evictions.load(AtomicOrdering::Relaxed),
        }
    }
}
