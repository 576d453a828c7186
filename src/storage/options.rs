use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::primitives::concurrency::LockOptions;
use crate::primitives::file::SegmentOptions;
use crate::primitives::mmap::MmapOptions;

/// How segment bytes are reached.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileMode {
    /// Positional reads and writes.
    Classic,
    /// Windows served by the shared [`crate::primitives::mmap::MmapManager`].
    Mmap,
}

/// Configuration options supplied when creating or opening a [`super::Storage`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Access mode for cluster and data segments.
    pub file_mode: FileMode,
    /// Initial logical size of each new cluster file.
    pub cluster_start_size: u64,
    /// Initial logical size of the data segment.
    pub data_start_size: u64,
    /// Growth policy applied to every segment.
    pub segment: SegmentOptions,
    /// Entries kept in the record cache.
    pub record_cache_capacity: usize,
    /// Record lock settings.
    pub locks: LockOptions,
    /// Window cache settings used when the storage builds its own manager.
    pub mmap: MmapOptions,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            file_mode: FileMode::Mmap,
            cluster_start_size: 24 * 1024,
            data_start_size: 1024 * 1024,
            segment: SegmentOptions::default(),
            record_cache_capacity: 2000,
            locks: LockOptions::default(),
            mmap: MmapOptions::default(),
        }
    }
}

impl StorageOptions {
    /// Sets the segment access mode.
    pub fn file_mode(mut self, mode: FileMode) -> Self {
        self.file_mode = mode;
        self
    }

    /// Sets the record cache capacity.
    pub fn record_cache_capacity(mut self, entries: usize) -> Self {
        self.record_cache_capacity = entries;
        self
    }

    /// Sets the growth policy for all segments.
    pub fn segment(mut self, segment: SegmentOptions) -> Self {
        self.segment = segment;
        self
    }

    /// Sets initial segment sizes.
    pub fn start_sizes(mut self, cluster: u64, data: u64) -> Self {
        self.cluster_start_size = cluster;
        self.data_start_size = data;
        self
    }

    /// Sets how long record reads and writes wait for a record lock.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.locks = self.locks.default_timeout(timeout);
        self
    }
}
