//! Tessera: an embedded record store with a persistent, lazily paged
//! red-black tree index.
//!
//! The crate is layered bottom-up:
//!
//! * [`primitives`]: paged segment files, the mapped window cache, the lock
//!   manager and the resource pool.
//! * [`storage`]: versioned records addressed by `cluster:position`.
//! * [`tree`]: the persistent tree map whose fat nodes are stored as records.
//! * [`commit`]: the background worker that finishes batched tree commits.
//! * [`engine`]: wires everything together with an open/close lifecycle.

#![warn(missing_docs)]

pub mod commit;
pub mod engine;
pub mod primitives;
pub mod storage;
pub mod tree;
pub mod types;

pub use commit::{AsyncCommitter, CommitOptions};
pub use engine::{Engine, EngineOptions, Session};
pub use storage::{Storage, StorageOptions};
pub use tree::{PersistentTree, SharedTree, TreeBacking, TreeOptions};
pub use types::{RecordId, RecordVersion, Result, TesseraError, VersionCheck};
