use bytes::Bytes;

use crate::types::{RecordType, RecordVersion, Result, TesseraError};

/// Width of one position entry in a cluster file.
pub const CLUSTER_ENTRY_SIZE: usize = 24;

/// Payload, version and type of a record as returned by reads.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawBuffer {
    /// Record payload.
    pub bytes: Bytes,
    /// Version at the time of the read.
    pub version: RecordVersion,
    /// Type tag written with the payload.
    pub record_type: RecordType,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum EntryState {
    Live = 0x01,
    Deleted = 0x02,
}

impl EntryState {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Self::Live),
            0x02 => Ok(Self::Deleted),
            other => Err(TesseraError::Corruption(format!(
                "unknown cluster entry state: 0x{other:02X}"
            ))),
        }
    }
}

/// Fixed-size entry mapping a cluster position to its bytes in the data segment.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct ClusterEntry {
    pub state: EntryState,
    pub record_type: RecordType,
    pub version: RecordVersion,
    pub data_offset: u64,
    pub capacity: u32,
    pub len: u32,
}

impl ClusterEntry {
    pub fn is_live(&self) -> bool {
        self.state == EntryState::Live
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CLUSTER_ENTRY_SIZE {
            return Err(TesseraError::Corruption("cluster entry truncated".into()));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..8]);
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&bytes[8..16]);
        let mut capacity = [0u8; 4];
        capacity.copy_from_slice(&bytes[16..20]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[20..24]);
        let entry = Self {
            state: EntryState::from_byte(bytes[0])?,
            record_type: RecordType(bytes[1]),
            version: RecordVersion(u32::from_be_bytes(version)),
            data_offset: u64::from_be_bytes(offset),
            capacity: u32::from_be_bytes(capacity),
            len: u32::from_be_bytes(len),
        };
        if entry.len > entry.capacity {
            return Err(TesseraError::Corruption(format!(
                "cluster entry length {} exceeds its capacity {}",
                entry.len, entry.capacity
            )));
        }
        Ok(entry)
    }

    pub fn to_bytes(&self) -> [u8; CLUSTER_ENTRY_SIZE] {
        let mut out = [0u8; CLUSTER_ENTRY_SIZE];
        out[0] = self.state as u8;
        out[1] = self.record_type.0;
        out[4..8].copy_from_slice(&self.version.0.to_be_bytes());
        out[8..16].copy_from_slice(&self.data_offset.to_be_bytes());
        out[16..20].copy_from_slice(&self.capacity.to_be_bytes());
        out[20..24].copy_from_slice(&self.len.to_be_bytes());
        out
    }
}

/// Space reserved for a payload of `len` bytes, leaving room to grow in place.
pub(crate) fn slot_capacity(len: usize) -> usize {
    len + len / 4
}
