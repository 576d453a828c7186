//! Cluster files (position entries) and the data segment (payload bytes).

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::primitives::file::{PagedFile, SegmentOptions};
use crate::primitives::mmap::MmapManager;
use crate::types::{ClusterId, Result, TesseraError};

use super::record::{slot_capacity, ClusterEntry, CLUSTER_ENTRY_SIZE};

/// One cluster: a segment holding a dense array of [`ClusterEntry`] values.
pub(crate) struct Cluster {
    pub id: ClusterId,
    pub name: String,
    file: PagedFile,
}

impl Cluster {
    pub fn create(
        path: &Path,
        id: ClusterId,
        name: &str,
        start_size: u64,
        options: SegmentOptions,
        mmap: Option<Arc<MmapManager>>,
    ) -> Result<Self> {
        Ok(Self {
            id,
            name: name.to_string(),
            file: PagedFile::create(path, start_size, options, mmap)?,
        })
    }

    pub fn open(
        path: &Path,
        id: ClusterId,
        name: &str,
        options: SegmentOptions,
        mmap: Option<Arc<MmapManager>>,
    ) -> Result<Self> {
        let file = PagedFile::open(path, options, mmap)?;
        if file.filled_up_to() % CLUSTER_ENTRY_SIZE as u64 != 0 {
            return Err(TesseraError::Corruption(format!(
                "cluster '{name}' holds a partial entry ({} bytes filled)",
                file.filled_up_to()
            )));
        }
        Ok(Self {
            id,
            name: name.to_string(),
            file,
        })
    }

    pub fn was_softly_closed(&self) -> bool {
        self.file.was_softly_closed()
    }

    /// Number of positions ever handed out, deleted ones included.
    pub fn positions(&self) -> u64 {
        self.file.filled_up_to() / CLUSTER_ENTRY_SIZE as u64
    }

    fn offset(position: i64) -> u64 {
        position as u64 * CLUSTER_ENTRY_SIZE as u64
    }

    pub fn entry(&self, position: i64) -> Result<Option<ClusterEntry>> {
        if position < 0 || position as u64 >= self.positions() {
            return Ok(None);
        }
        let mut raw = [0u8; CLUSTER_ENTRY_SIZE];
        self.file.read_bytes(Self::offset(position), &mut raw)?;
        ClusterEntry::from_bytes(&raw).map(Some)
    }

    pub fn append(&mut self, entry: &ClusterEntry) -> Result<i64> {
        let offset = self.file.allocate_space(CLUSTER_ENTRY_SIZE as u64)?;
        self.file.write_bytes(offset, &entry.to_bytes())?;
        Ok((offset / CLUSTER_ENTRY_SIZE as u64) as i64)
    }

    pub fn write_entry(&mut self, position: i64, entry: &ClusterEntry) -> Result<()> {
        self.file.write_bytes(Self::offset(position), &entry.to_bytes())
    }

    pub fn synch(&self) -> Result<()> {
        self.file.synch()
    }

    pub fn close(&mut self) -> Result<()> {
        self.file.close()?;
        debug!(
            cluster = self.id,
            name = %self.name,
            positions = self.positions(),
            "cluster.close"
        );
        Ok(())
    }
}

/// Append-mostly segment holding record payloads.
pub(crate) struct DataSegment {
    file: PagedFile,
}

impl DataSegment {
    pub fn create(
        path: &Path,
        start_size: u64,
        options: SegmentOptions,
        mmap: Option<Arc<MmapManager>>,
    ) -> Result<Self> {
        Ok(Self {
            file: PagedFile::create(path, start_size, options, mmap)?,
        })
    }

    pub fn open(
        path: &Path,
        options: SegmentOptions,
        mmap: Option<Arc<MmapManager>>,
    ) -> Result<Self> {
        Ok(Self {
            file: PagedFile::open(path, options, mmap)?,
        })
    }

    pub fn was_softly_closed(&self) -> bool {
        self.file.was_softly_closed()
    }

    /// Stores `payload` in a new slot and returns `(offset, capacity)`.
    pub fn write_new(&mut self, payload: &[u8]) -> Result<(u64, u32)> {
        let capacity = u32::try_from(slot_capacity(payload.len()))
            .map_err(|_| TesseraError::Invalid("record payload larger than 4 GiB"))?;
        let offset = self.file.allocate_space(u64::from(capacity))?;
        self.file.write_bytes(offset, payload)?;
        Ok((offset, capacity))
    }

    pub fn overwrite(&mut self, offset: u64, payload: &[u8]) -> Result<()> {
        self.file.write_bytes(offset, payload)
    }

    pub fn read(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        self.file.read(offset, len as usize)
    }

    pub fn filled_up_to(&self) -> u64 {
        self.file.filled_up_to()
    }

    pub fn synch(&self) -> Result<()> {
        self.file.synch()
    }

    pub fn close(&mut self) -> Result<()> {
        self.file.close()
    }
}
