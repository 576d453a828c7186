use std::fmt;

use lru::LruCache;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::types::{RecordId, RecordVersion, Result, TesseraError};

use super::node::Node;
use super::stats::TreeStats;

/// Handle of a node inside a tree's node table.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeRef(u64);

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Table entry for one node. The slot outlives the node's content: evicted
/// nodes keep their address and parent link and are faulted back in on access.
pub(crate) struct Slot<K, V> {
    pub rid: RecordId,
    pub version: RecordVersion,
    pub parent: Option<NodeRef>,
    pub node: Option<Node<K, V>>,
}

/// Arena of tree nodes keyed by handle, with address lookup, the dirty set
/// and recency order of resident nodes.
pub(crate) struct NodeTable<K, V> {
    slots: FxHashMap<NodeRef, Slot<K, V>>,
    by_rid: FxHashMap<RecordId, NodeRef>,
    dirty: FxHashSet<NodeRef>,
    resident: LruCache<NodeRef, ()>,
    next: u64,
}

impl<K, V> NodeTable<K, V> {
    pub fn new() -> Self {
        Self {
            slots: FxHashMap::default(),
            by_rid: FxHashMap::default(),
            dirty: FxHashSet::default(),
            resident: LruCache::unbounded(),
            next: 0,
        }
    }

    fn allocate(&mut self) -> NodeRef {
        let r = NodeRef(self.next);
        self.next += 1;
        r
    }

    /// Adds a node that has never been stored. It starts dirty.
    pub fn insert_fresh(&mut self, node: Node<K, V>) -> NodeRef {
        let r = self.allocate();
        self.slots.insert(
            r,
            Slot {
                rid: RecordId::INVALID,
                version: RecordVersion::default(),
                parent: None,
                node: Some(node),
            },
        );
        self.dirty.insert(r);
        self.resident.put(r, ());
        r
    }

    /// Returns the handle for a stored node, creating an unloaded slot on
    /// first sight, and records `parent` as its parent.
    pub fn attach(&mut self, rid: RecordId, parent: Option<NodeRef>) -> NodeRef {
        if let Some(&r) = self.by_rid.get(&rid) {
            if let Some(slot) = self.slots.get_mut(&r) {
                slot.parent = parent;
            }
            return r;
        }
        let r = self.allocate();
        self.slots.insert(
            r,
            Slot {
                rid,
                version: RecordVersion::default(),
                parent,
                node: None,
            },
        );
        self.by_rid.insert(rid, r);
        r
    }

    pub fn slot(&self, r: NodeRef) -> Result<&Slot<K, V>> {
        self.slots
            .get(&r)
            .ok_or_else(|| TesseraError::Corruption(format!("dangling node handle {r:?}")))
    }

    fn slot_mut(&mut self, r: NodeRef) -> Result<&mut Slot<K, V>> {
        self.slots
            .get_mut(&r)
            .ok_or_else(|| TesseraError::Corruption(format!("dangling node handle {r:?}")))
    }

    pub fn is_loaded(&self, r: NodeRef) -> bool {
        self.slots.get(&r).is_some_and(|slot| slot.node.is_some())
    }

    /// Stores the content of a node that was just faulted in.
    pub fn install(&mut self, r: NodeRef, node: Node<K, V>, version: RecordVersion) -> Result<()> {
        let slot = self.slot_mut(r)?;
        slot.node = Some(node);
        slot.version = version;
        self.resident.put(r, ());
        Ok(())
    }

    /// Resident node content. Callers fault the node in first.
    pub fn node_mut(&mut self, r: NodeRef) -> Result<&mut Node<K, V>> {
        self.slot_mut(r)?
            .node
            .as_mut()
            .ok_or_else(|| TesseraError::Corruption(format!("node {r:?} is not resident")))
    }

    pub fn touch(&mut self, r: NodeRef) {
        self.resident.promote(&r);
    }

    pub fn parent(&self, r: NodeRef) -> Option<NodeRef> {
        self.slots.get(&r).and_then(|slot| slot.parent)
    }

    pub fn set_parent(&mut self, r: NodeRef, parent: Option<NodeRef>) -> Result<()> {
        self.slot_mut(r)?.parent = parent;
        Ok(())
    }

    pub fn mark_dirty(&mut self, r: NodeRef) {
        self.dirty.insert(r);
    }

    pub fn is_dirty(&self, r: NodeRef) -> bool {
        self.dirty.contains(&r)
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Dirty handles in creation order.
    pub fn dirty_refs(&self) -> Vec<NodeRef> {
        let mut refs: Vec<_> = self.dirty.iter().copied().collect();
        refs.sort_unstable();
        refs
    }

    pub fn mark_clean(&mut self, r: NodeRef) {
        self.dirty.remove(&r);
    }

    /// Records the address given to a node on its first save.
    pub fn assign_rid(&mut self, r: NodeRef, rid: RecordId, version: RecordVersion) -> Result<()> {
        let slot = self.slot_mut(r)?;
        slot.rid = rid;
        slot.version = version;
        self.by_rid.insert(rid, r);
        Ok(())
    }

    pub fn set_version(&mut self, r: NodeRef, version: RecordVersion) -> Result<()> {
        self.slot_mut(r)?.version = version;
        Ok(())
    }

    /// Drops a node from the table entirely.
    pub fn remove(&mut self, r: NodeRef) -> Option<Slot<K, V>> {
        let slot = self.slots.remove(&r)?;
        if slot.rid.is_valid() {
            self.by_rid.remove(&slot.rid);
        }
        self.dirty.remove(&r);
        self.resident.pop(&r);
        Some(slot)
    }

    /// Number of nodes whose content is resident.
    pub fn resident_len(&self) -> usize {
        self.resident.len()
    }

    /// Number of known nodes, resident or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Drops the content of least recently used clean, stored nodes until at
    /// most `max` nodes are resident. Returns how many were dropped.
    pub fn evict(&mut self, max: usize, stats: &TreeStats) -> usize {
        if self.resident.len() <= max {
            return 0;
        }
        let excess = self.resident.len() - max;
        let victims: Vec<NodeRef> = self
            .resident
            .iter()
            .rev()
            .map(|(r, _)| *r)
            .filter(|r| {
                !self.dirty.contains(r)
                    && self.slots.get(r).is_some_and(|slot| slot.rid.is_valid())
            })
            .take(excess)
            .collect();
        for r in &victims {
            self.resident.pop(r);
            if let Some(slot) = self.slots.get_mut(r) {
                slot.node = None;
            }
            TreeStats::bump(&stats.evictions);
        }
        victims.len()
    }

    /// Forgets every node.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.by_rid.clear();
        self.dirty.clear();
        self.resident.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(key: u64) -> Node<u64, u64> {
        Node::single(key, key)
    }

    #[test]
    fn attach_reuses_handles_by_address() {
        let mut table: NodeTable<u64, u64> = NodeTable::new();
        let rid = RecordId::new(1, 4);
        let a = table.attach(rid, None);
        let parent = table.insert_fresh(leaf(1));
        let b = table.attach(rid, Some(parent));
        assert_eq!(a, b);
        assert_eq!(table.parent(a), Some(parent));
        assert!(!table.is_loaded(a));
        assert!(table.is_dirty(parent));
    }

    #[test]
    fn eviction_skips_dirty_and_unsaved_nodes() {
        let stats = TreeStats::default();
        let mut table: NodeTable<u64, u64> = NodeTable::new();
        let fresh = table.insert_fresh(leaf(0));
        let mut stored = Vec::new();
        for pos in 0..4 {
            let r = table.attach(RecordId::new(0, pos), None);
            table.install(r, leaf(pos as u64), RecordVersion(1)).unwrap();
            stored.push(r);
        }
        table.mark_dirty(stored[0]);
        assert_eq!(table.evict(2, &stats), 3);
        assert!(table.is_loaded(fresh));
        assert!(table.is_loaded(stored[0]));
        assert!(!table.is_loaded(stored[3]));
        assert_eq!(table.resident_len(), 2);
        assert_eq!(stats.snapshot().evictions, 3);
        assert_eq!(table.slot(stored[3]).unwrap().rid, RecordId::new(0, 3));
    }

    #[test]
    fn remove_forgets_address() {
        let mut table: NodeTable<u64, u64> = NodeTable::new();
        let rid = RecordId::new(2, 0);
        let r = table.attach(rid, None);
        assert!(table.remove(r).is_some());
        assert!(table.slot(r).is_err());
        assert_ne!(table.attach(rid, None), r);
    }
}
