#![forbid(unsafe_code)]

//! Persistent red-black tree of fat nodes.
//!
//! Each node holds up to `page_size` sorted entries and is stored as one
//! record. Nodes are faulted in lazily, keys and values decode on first use,
//! and a bounded node cache drops clean nodes between operations.

mod backing;
/// Key and value encodings.
pub mod codec;
mod cursor;
mod definition;
mod node;
mod persist;
mod stats;
mod table;
mod verify;

pub use backing::{MemoryNodeStore, NodeStore, SharedTree, StorageNodeStore, TreeBacking};
pub use codec::{KeyCodec, ValCodec};
pub use cursor::{Direction, TreeCursor};
pub use definition::{natural_order, PersistentTree, TreeOptions};
pub use node::Comparator;
pub use stats::{TreeStats, TreeStatsSnapshot};
pub use verify::TreeReport;
