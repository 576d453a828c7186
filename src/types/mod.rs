#![forbid(unsafe_code)]

//! Identifiers, versions and the crate-wide error type.

use std::fmt;
use std::str::FromStr;

/// Cluster identifier. Negative values never address a real cluster.
pub type ClusterId = i16;

/// Cluster id used by records that have not been assigned a cluster.
pub const CLUSTER_ID_INVALID: ClusterId = -1;

/// Position sentinel for records that have not been created yet.
pub const CLUSTER_POS_INVALID: i64 = -1;

/// Encoded width of a [`RecordId`] on the wire.
pub const RECORD_ID_LEN: usize = 10;

/// Logical address of a raw record: cluster plus position inside the cluster.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RecordId {
    /// Owning cluster.
    pub cluster: ClusterId,
    /// Slot inside the cluster.
    pub position: i64,
}

impl RecordId {
    /// The null address.
    pub const INVALID: RecordId = RecordId {
        cluster: CLUSTER_ID_INVALID,
        position: CLUSTER_POS_INVALID,
    };

    /// Builds an address from its parts.
    pub const fn new(cluster: ClusterId, position: i64) -> Self {
        Self { cluster, position }
    }

    /// Returns true when the address points at a created record.
    pub fn is_valid(&self) -> bool {
        self.cluster >= 0 && self.position >= 0
    }

    /// Appends the fixed-width big-endian form to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.cluster.to_be_bytes());
        out.extend_from_slice(&self.position.to_be_bytes());
    }

    /// Decodes the fixed-width form produced by [`RecordId::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RECORD_ID_LEN {
            return Err(TesseraError::Serialization(format!(
                "record id needs {RECORD_ID_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut cluster = [0u8; 2];
        cluster.copy_from_slice(&bytes[..2]);
        let mut position = [0u8; 8];
        position.copy_from_slice(&bytes[2..]);
        Ok(Self {
            cluster: i16::from_be_bytes(cluster),
            position: i64::from_be_bytes(position),
        })
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cluster, self.position)
    }
}

impl FromStr for RecordId {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().trim_start_matches('#');
        let (cluster, position) = s
            .split_once(':')
            .ok_or(TesseraError::Invalid("record id must look like <cluster>:<position>"))?;
        let cluster = cluster
            .parse::<i16>()
            .map_err(|_| TesseraError::Invalid("record id cluster is not a number"))?;
        let position = position
            .parse::<i64>()
            .map_err(|_| TesseraError::Invalid("record id position is not a number"))?;
        Ok(Self { cluster, position })
    }
}

/// Monotonic per-record version, bumped by every update.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct RecordVersion(pub u32);

impl RecordVersion {
    /// Returns the version following this one.
    pub fn next(self) -> Self {
        RecordVersion(self.0.wrapping_add(1))
    }
}

impl fmt::Display for RecordVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Expected version passed to updates and deletes.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum VersionCheck {
    /// Skip the optimistic check.
    Any,
    /// Fail with [`TesseraError::StaleVersion`] unless the stored version matches.
    Exact(RecordVersion),
}

impl From<RecordVersion> for VersionCheck {
    fn from(value: RecordVersion) -> Self {
        VersionCheck::Exact(value)
    }
}

/// One-byte record type tag stored next to every payload.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct RecordType(pub u8);

impl RecordType {
    /// Opaque byte payload; tree nodes and tree metadata use it.
    pub const BYTES: RecordType = RecordType(b'b');
    /// Serialized document.
    pub const DOCUMENT: RecordType = RecordType(b'd');
    /// Flat text record.
    pub const FLAT: RecordType = RecordType(b'f');
}

impl Default for RecordType {
    fn default() -> Self {
        RecordType::BYTES
    }
}

/// Identity of whoever asks the lock manager for a lock.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RequesterId(pub u64);

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Errors raised anywhere in the storage core.
#[derive(thiserror::Error, Debug)]
pub enum TesseraError {
    /// Underlying operating system failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Persistent state failed validation.
    #[error("corruption: {0}")]
    Corruption(String),
    /// Persistent state disagrees with the runtime configuration.
    #[error("configuration: {0}")]
    Configuration(String),
    /// Caller supplied an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Access outside of the filled area of a segment.
    #[error("out of range: offset {offset} + {len} bytes exceeds filled area of {filled} bytes")]
    OutOfRange {
        /// Requested logical offset.
        offset: u64,
        /// Requested length.
        len: u64,
        /// Current filled-up-to watermark.
        filled: u64,
    },
    /// A segment cannot grow to satisfy an allocation.
    #[error("capacity exceeded: {requested} more bytes would pass the maximum of {max} bytes")]
    CapacityExceeded {
        /// Bytes asked for.
        requested: u64,
        /// Configured maximum segment size.
        max: u64,
    },
    /// A mapping request resolved to an empty or negative window.
    #[error("invalid mapping range: {0}")]
    InvalidRange(String),
    /// Optimistic version check failed.
    #[error("record {rid} is at {actual}, caller expected {expected}")]
    StaleVersion {
        /// Record being modified.
        rid: RecordId,
        /// Version supplied by the caller.
        expected: RecordVersion,
        /// Version currently stored.
        actual: RecordVersion,
    },
    /// A cursor observed a mutation it did not perform.
    #[error("concurrent modification: {0}")]
    ConcurrentModification(&'static str),
    /// Waiting for a lock or pooled resource took longer than allowed.
    #[error("timed out after {timeout_ms} ms waiting for {resource}")]
    LockTimeout {
        /// Human-readable resource name.
        resource: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },
    /// Lock protocol misuse, e.g. releasing a lock that is not held.
    #[error("lock: {0}")]
    Lock(String),
    /// Another process owns a file this process tried to open.
    #[error("file {0} is locked by another process")]
    Locked(String),
    /// Addressed item does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Bytes could not be turned into a value or back.
    #[error("serialization: {0}")]
    Serialization(String),
    /// A tree node could not be faulted in from its record.
    #[error("failed to load tree node {rid}: {source}")]
    NodeLoad {
        /// Address of the node record.
        rid: RecordId,
        /// Storage-layer cause.
        #[source]
        source: Box<TesseraError>,
    },
    /// A dirty tree node could not be written back.
    #[error("failed to save tree node {rid}: {source}")]
    NodeSave {
        /// Address of the node record.
        rid: RecordId,
        /// Storage-layer cause.
        #[source]
        source: Box<TesseraError>,
    },
    /// One or more scheduled background commits failed.
    #[error("background commit failed: {0}")]
    Commit(String),
    /// The storage or service has been closed.
    #[error("{0} is closed")]
    Closed(&'static str),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TesseraError>;

impl TesseraError {
    /// Wraps a storage failure with the identity of the node being loaded.
    pub fn node_load(rid: RecordId, source: TesseraError) -> Self {
        TesseraError::NodeLoad {
            rid,
            source: Box::new(source),
        }
    }

    /// Wraps a storage failure with the identity of the node being saved.
    pub fn node_save(rid: RecordId, source: TesseraError) -> Self {
        TesseraError::NodeSave {
            rid,
            source: Box::new(source),
        }
    }
}
