//! Raw record store.
//!
//! Records are versioned byte payloads addressed by [`crate::types::RecordId`].
//! Each cluster keeps a file of fixed-size position entries; payloads live in
//! one shared data segment. A bounded LRU keeps recently touched records.

mod cache;
mod config;
mod options;
mod record;
mod segments;
mod store;

pub use cache::{RecordCache, RecordCacheStats};
pub use config::{ClusterConfig, ConfigError, StorageConfig, CONFIG_FILE, DEFAULT_CLUSTERS};
pub use options::{FileMode, StorageOptions};
pub use record::{RawBuffer, CLUSTER_ENTRY_SIZE};
pub use store::Storage;
