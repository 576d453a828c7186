use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::commit::{AsyncCommitter, CommitTarget};
use crate::storage::{RawBuffer, Storage};
use crate::types::{
    ClusterId, RecordId, RecordType, RecordVersion, RequesterId, Result, TesseraError,
    VersionCheck,
};

use super::codec::{KeyCodec, ValCodec};
use super::definition::PersistentTree;

/// Record operations a persistent tree needs from whatever stores its nodes.
pub trait NodeStore: Send + Sync {
    /// Reads a record; `None` when it does not exist.
    fn load(&self, rid: RecordId) -> Result<Option<RawBuffer>>;

    /// Reserves an address by creating an empty record at version zero.
    fn create_address(&self) -> Result<RecordId>;

    /// Replaces a record's bytes and returns its new version.
    fn save(&self, rid: RecordId, bytes: &[u8], expected: VersionCheck) -> Result<RecordVersion>;

    /// Deletes a record; `false` when it was already gone.
    fn delete(&self, rid: RecordId, expected: VersionCheck) -> Result<bool>;

    /// Cluster new records land in.
    fn cluster_id(&self) -> ClusterId;
}

/// Node store writing into one cluster of a [`Storage`].
pub struct StorageNodeStore {
    storage: Arc<Storage>,
    cluster: ClusterId,
    requester: RequesterId,
}

impl StorageNodeStore {
    /// Stores nodes in `cluster`, identifying itself with a fresh requester id.
    pub fn new(storage: Arc<Storage>, cluster: ClusterId) -> Self {
        let requester = storage.requester();
        Self {
            storage,
            cluster,
            requester,
        }
    }

    /// Looks the cluster up by name.
    pub fn for_cluster(storage: Arc<Storage>, name: &str) -> Result<Self> {
        let cluster = storage
            .cluster_id(name)
            .ok_or_else(|| TesseraError::NotFound(format!("cluster '{name}'")))?;
        Ok(Self::new(storage, cluster))
    }
}

impl NodeStore for StorageNodeStore {
    fn load(&self, rid: RecordId) -> Result<Option<RawBuffer>> {
        self.storage.read_record(self.requester, rid)
    }

    fn create_address(&self) -> Result<RecordId> {
        let position = self
            .storage
            .create_record(self.cluster, &[], RecordType::BYTES)?;
        Ok(RecordId::new(self.cluster, position))
    }

    fn save(&self, rid: RecordId, bytes: &[u8], expected: VersionCheck) -> Result<RecordVersion> {
        self.storage
            .update_record(self.requester, rid, bytes, expected, RecordType::BYTES)
    }

    fn delete(&self, rid: RecordId, expected: VersionCheck) -> Result<bool> {
        self.storage.delete_record(self.requester, rid, expected)
    }

    fn cluster_id(&self) -> ClusterId {
        self.cluster
    }
}

impl fmt::Debug for StorageNodeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageNodeStore")
            .field("cluster", &self.cluster)
            .field("requester", &self.requester)
            .finish()
    }
}

/// Node store kept in a process-local map; useful for tests and scratch trees
/// that must survive unloading but not restarts.
#[derive(Default)]
pub struct MemoryNodeStore {
    records: Mutex<FxHashMap<i64, (Bytes, RecordVersion)>>,
    next: AtomicI64,
    cluster: ClusterId,
}

impl MemoryNodeStore {
    /// An empty store that reports `cluster` in its addresses.
    pub fn new(cluster: ClusterId) -> Self {
        Self {
            cluster,
            ..Self::default()
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, rid: RecordId) -> Result<()> {
        if rid.cluster != self.cluster {
            return Err(TesseraError::NotFound(format!("cluster {}", rid.cluster)));
        }
        Ok(())
    }
}

impl NodeStore for MemoryNodeStore {
    fn load(&self, rid: RecordId) -> Result<Option<RawBuffer>> {
        self.check(rid)?;
        Ok(self
            .records
            .lock()
            .get(&rid.position)
            .map(|(bytes, version)| RawBuffer {
                bytes: bytes.clone(),
                version: *version,
                record_type: RecordType::BYTES,
            }))
    }

    fn create_address(&self) -> Result<RecordId> {
        let position = self.next.fetch_add(1, AtomicOrdering::Relaxed);
        self.records
            .lock()
            .insert(position, (Bytes::new(), RecordVersion::default()));
        Ok(RecordId::new(self.cluster, position))
    }

    fn save(&self, rid: RecordId, bytes: &[u8], expected: VersionCheck) -> Result<RecordVersion> {
        self.check(rid)?;
        let mut records = self.records.lock();
        let (stored, version) = records
            .get_mut(&rid.position)
            .ok_or_else(|| TesseraError::NotFound(format!("record {rid}")))?;
        if let VersionCheck::Exact(expected) = expected {
            if expected != *version {
                return Err(TesseraError::StaleVersion {
                    rid,
                    expected,
                    actual: *version,
                });
            }
        }
        *stored = Bytes::copy_from_slice(bytes);
        *version = version.next();
        Ok(*version)
    }

    fn delete(&self, rid: RecordId, expected: VersionCheck) -> Result<bool> {
        self.check(rid)?;
        let mut records = self.records.lock();
        let Some((_, version)) = records.get(&rid.position) else {
            return Ok(false);
        };
        if let VersionCheck::Exact(expected) = expected {
            if expected != *version {
                return Err(TesseraError::StaleVersion {
                    rid,
                    expected,
                    actual: *version,
                });
            }
        }
        records.remove(&rid.position);
        Ok(true)
    }

    fn cluster_id(&self) -> ClusterId {
        self.cluster
    }
}

/// Where a tree keeps its nodes and how it commits.
#[derive(Clone)]
pub enum TreeBacking {
    /// Nodes live only in the node table; save and load are unavailable.
    Memory,
    /// Every commit saves synchronously through the store.
    Store(Arc<dyn NodeStore>),
    /// Commits flush nodes immediately and leave the metadata record to the
    /// background worker.
    Batched {
        /// Record store for nodes and metadata.
        store: Arc<dyn NodeStore>,
        /// Worker that finishes scheduled commits.
        committer: AsyncCommitter,
    },
}

impl TreeBacking {
    /// Backing store, if the tree is persistent.
    pub fn store(&self) -> Option<&Arc<dyn NodeStore>> {
        match self {
            TreeBacking::Memory => None,
            TreeBacking::Store(store) | TreeBacking::Batched { store, .. } => Some(store),
        }
    }

    /// Commit worker, if the tree is batched.
    pub fn committer(&self) -> Option<&AsyncCommitter> {
        match self {
            TreeBacking::Batched { committer, .. } => Some(committer),
            _ => None,
        }
    }

    pub(super) fn kind(&self) -> &'static str {
        match self {
            TreeBacking::Memory => "memory",
            TreeBacking::Store(_) => "store",
            TreeBacking::Batched { .. } => "batched",
        }
    }
}

impl fmt::Debug for TreeBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.store() {
            Some(store) => write!(f, "{}(cluster {})", self.kind(), store.cluster_id()),
            None => f.write_str(self.kind()),
        }
    }
}

/// A tree shared between threads and, for batched trees, the commit worker.
pub type SharedTree<K, V> = Arc<Mutex<PersistentTree<K, V>>>;

impl<K, V> CommitTarget for Mutex<PersistentTree<K, V>>
where
    K: KeyCodec + Send + 'static,
    V: ValCodec + Send + 'static,
{
    fn commit(&self) -> Result<()> {
        self.lock().save()
    }

    fn describe(&self) -> String {
        format!("tree {}", self.lock().rid())
    }
}

impl<K, V> PersistentTree<K, V>
where
    K: KeyCodec + Send + 'static,
    V: ValCodec + Send + 'static,
{
    /// Wraps the tree for sharing and, when batched, registers it with the
    /// commit worker so [`PersistentTree::commit_changes`] can schedule it.
    pub fn into_shared(self) -> SharedTree<K, V> {
        let committer = self.backing().committer().cloned();
        let shared = Arc::new(Mutex::new(self));
        if let Some(committer) = committer {
            let target: Arc<dyn CommitTarget> = shared.clone();
            let ticket = committer.register(Arc::downgrade(&target));
            shared.lock().set_commit_ticket(ticket);
        }
        shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_versions_and_deletes() -> Result<()> {
        let store = MemoryNodeStore::new(5);
        let rid = store.create_address()?;
        assert_eq!(rid.cluster, 5);
        assert_eq!(store.load(rid)?.unwrap().version, RecordVersion(0));
        let v1 = store.save(rid, b"node", VersionCheck::Exact(RecordVersion(0)))?;
        assert_eq!(v1, RecordVersion(1));
        assert!(matches!(
            store.save(rid, b"x", VersionCheck::Exact(RecordVersion(0))),
            Err(TesseraError::StaleVersion { .. })
        ));
        assert!(store.delete(rid, VersionCheck::Exact(v1))?);
        assert!(!store.delete(rid, VersionCheck::Any)?);
        assert!(store.load(rid)?.is_none());
        assert!(store.load(RecordId::new(1, 0)).is_err());
        Ok(())
    }
}
