#![forbid(unsafe_code)]

//! Engine lifecycle: wires the window cache, record storage, tree lock
//! manager and commit worker together and tears them down in order.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::commit::{AsyncCommitter, CommitOptions};
use crate::primitives::concurrency::{
    LockManager, LockMode, LockOptions, ResourceFactory, ResourceLock, ResourcePool,
};
use crate::primitives::mmap::MmapManager;
use crate::storage::{FileMode, RawBuffer, Storage, StorageOptions};
use crate::tree::{
    KeyCodec, NodeStore, PersistentTree, SharedTree, StorageNodeStore, TreeBacking, TreeOptions,
    ValCodec,
};
use crate::types::{
    ClusterId, RecordId, RecordType, RecordVersion, RequesterId, Result, TesseraError,
    VersionCheck,
};

/// Everything needed to create or open an [`Engine`].
///
/// Deserializes from TOML with every field optional:
///
/// ```toml
/// tree_cluster = "index"
///
/// [storage]
/// file_mode = "classic"
///
/// [tree]
/// page_size = 64
///
/// [commit]
/// interval_ms = 200
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Record storage settings.
    pub storage: StorageOptions,
    /// Settings for trees created or opened through the engine.
    pub tree: TreeOptions,
    /// Background commit worker settings.
    pub commit: CommitOptions,
    /// Tree-level lock settings.
    pub tree_locks: LockOptions,
    /// Cluster that receives tree nodes and metadata.
    pub tree_cluster: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            storage: StorageOptions::default(),
            tree: TreeOptions::default(),
            commit: CommitOptions::default(),
            tree_locks: LockOptions::default(),
            tree_cluster: "index".to_string(),
        }
    }
}

impl EngineOptions {
    /// Parses options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| TesseraError::Configuration(err.to_string()))
    }

    /// Reads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let options = Self::from_toml_str(&text)?;
        debug!(path = %path.display(), "engine.options.load");
        Ok(options)
    }

    /// Sets the storage options.
    pub fn storage(mut self, storage: StorageOptions) -> Self {
        self.storage = storage;
        self
    }

    /// Sets the tree options.
    pub fn tree(mut self, tree: TreeOptions) -> Self {
        self.tree = tree;
        self
    }

    /// Sets the commit worker options.
    pub fn commit(mut self, commit: CommitOptions) -> Self {
        self.commit = commit;
        self
    }
}

/// An open storage engine.
///
/// Services are owned by the engine rather than living in process-wide
/// statics, so several engines can coexist in one process.
pub struct Engine {
    storage: Arc<Storage>,
    tree_store: Arc<dyn NodeStore>,
    tree_locks: LockManager<RecordId, RequesterId>,
    committer: AsyncCommitter,
    options: EngineOptions,
    closed: AtomicBool,
}

impl Engine {
    /// Creates a new engine in `dir`.
    pub fn create(dir: impl AsRef<Path>, options: EngineOptions) -> Result<Self> {
        let mmap = Self::mmap_for(&options);
        let storage = Storage::create_with(dir, options.storage.clone(), mmap)?;
        Self::assemble(storage, options)
    }

    /// Opens the engine stored in `dir`.
    pub fn open(dir: impl AsRef<Path>, options: EngineOptions) -> Result<Self> {
        let mmap = Self::mmap_for(&options);
        let storage = Storage::open_with(dir, options.storage.clone(), mmap)?;
        Self::assemble(storage, options)
    }

    fn mmap_for(options: &EngineOptions) -> Option<Arc<MmapManager>> {
        match options.storage.file_mode {
            FileMode::Mmap => Some(Arc::new(MmapManager::new(options.storage.mmap.clone()))),
            FileMode::Classic => None,
        }
    }

    fn assemble(storage: Storage, options: EngineOptions) -> Result<Self> {
        let storage = Arc::new(storage);
        let cluster = match storage.cluster_id(&options.tree_cluster) {
            Some(id) => id,
            None => storage.add_cluster(&options.tree_cluster)?,
        };
        let tree_store: Arc<dyn NodeStore> =
            Arc::new(StorageNodeStore::new(Arc::clone(&storage), cluster));
        let committer = AsyncCommitter::spawn(options.commit.clone())?;
        info!(
            dir = %storage.dir().display(),
            tree_cluster = %options.tree_cluster,
            clean = storage.was_cleanly_closed(),
            "engine.open"
        );
        Ok(Self {
            tree_locks: LockManager::new(options.tree_locks.clone()),
            storage,
            tree_store,
            committer,
            options,
            closed: AtomicBool::new(false),
        })
    }

    /// Record storage.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Background commit worker shared by batched trees.
    pub fn committer(&self) -> &AsyncCommitter {
        &self.committer
    }

    /// Options the engine was opened with.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Allocates a requester id for locking.
    pub fn requester(&self) -> RequesterId {
        self.storage.requester()
    }

    /// Backing that saves synchronously into the tree cluster.
    pub fn store_backing(&self) -> TreeBacking {
        TreeBacking::Store(Arc::clone(&self.tree_store))
    }

    /// Backing that defers metadata writes to the commit worker.
    pub fn batched_backing(&self) -> TreeBacking {
        TreeBacking::Batched {
            store: Arc::clone(&self.tree_store),
            committer: self.committer.clone(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(TesseraError::Closed("engine"));
        }
        Ok(())
    }

    /// Creates an empty tree that saves synchronously.
    pub fn create_tree<K: KeyCodec + Ord, V: ValCodec>(&self) -> Result<PersistentTree<K, V>> {
        self.ensure_open()?;
        PersistentTree::create(self.store_backing(), self.options.tree.clone())
    }

    /// Opens the tree whose metadata record is `rid`.
    pub fn open_tree<K: KeyCodec + Ord, V: ValCodec>(
        &self,
        rid: RecordId,
    ) -> Result<PersistentTree<K, V>> {
        self.ensure_open()?;
        PersistentTree::load(self.store_backing(), rid, self.options.tree.clone())
    }

    /// Creates an empty batched tree registered with the commit worker.
    pub fn create_batched_tree<K, V>(&self) -> Result<SharedTree<K, V>>
    where
        K: KeyCodec + Ord + Send + 'static,
        V: ValCodec + Send + 'static,
    {
        self.ensure_open()?;
        let tree = PersistentTree::create(self.batched_backing(), self.options.tree.clone())?;
        Ok(tree.into_shared())
    }

    /// Opens a batched tree and registers it with the commit worker.
    pub fn open_batched_tree<K, V>(&self, rid: RecordId) -> Result<SharedTree<K, V>>
    where
        K: KeyCodec + Ord + Send + 'static,
        V: ValCodec + Send + 'static,
    {
        self.ensure_open()?;
        let tree = PersistentTree::load(self.batched_backing(), rid, self.options.tree.clone())?;
        Ok(tree.into_shared())
    }

    /// Locks a tree for `requester`. Structural mutations hold an exclusive
    /// lock on the tree's metadata record; readers hold a shared one.
    pub fn lock_tree(
        &self,
        requester: RequesterId,
        tree: RecordId,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<ResourceLock<'_, RecordId, RequesterId>> {
        self.ensure_open()?;
        self.tree_locks.lock(requester, tree, mode, timeout)
    }

    /// A pool of at most `max` sessions keyed by user name.
    pub fn session_pool(&self, max: usize) -> ResourcePool<String, Session> {
        ResourcePool::new(
            max,
            SessionFactory {
                storage: Arc::clone(&self.storage),
            },
        )
    }

    /// Drains pending background commits and closes storage softly.
    /// Callers must not hold the lock of a batched tree while closing.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, AtomicOrdering::AcqRel) {
            return Ok(());
        }
        let drained = self.committer.shutdown();
        let closed = self.storage.close();
        info!(dir = %self.storage.dir().display(), "engine.close");
        drained.and(closed)
    }

    /// Returns true once [`Engine::close`] ran.
    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("storage", &self.storage)
            .field("tree_cluster", &self.options.tree_cluster)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(err) = self.close() {
            warn!(error = %err, "engine.close_on_drop_failed");
        }
    }
}

/// A checked-out unit of work: a requester identity plus record CRUD.
pub struct Session {
    user: String,
    requester: RequesterId,
    storage: Arc<Storage>,
}

impl Session {
    /// User the session was last handed to.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Identity used for record locks.
    pub fn requester(&self) -> RequesterId {
        self.requester
    }

    /// Creates a record in the named cluster.
    pub fn create(&self, cluster: &str, bytes: &[u8], record_type: RecordType) -> Result<RecordId> {
        let cluster: ClusterId = self
            .storage
            .cluster_id(cluster)
            .ok_or_else(|| TesseraError::NotFound(format!("cluster '{cluster}'")))?;
        let position = self.storage.create_record(cluster, bytes, record_type)?;
        Ok(RecordId::new(cluster, position))
    }

    /// Reads a record.
    pub fn read(&self, rid: RecordId) -> Result<Option<RawBuffer>> {
        self.storage.read_record(self.requester, rid)
    }

    /// Replaces a record's payload.
    pub fn update(
        &self,
        rid: RecordId,
        bytes: &[u8],
        expected: VersionCheck,
        record_type: RecordType,
    ) -> Result<RecordVersion> {
        self.storage
            .update_record(self.requester, rid, bytes, expected, record_type)
    }

    /// Deletes a record.
    pub fn delete(&self, rid: RecordId, expected: VersionCheck) -> Result<bool> {
        self.storage.delete_record(self.requester, rid, expected)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user)
            .field("requester", &self.requester)
            .finish()
    }
}

struct SessionFactory {
    storage: Arc<Storage>,
}

impl ResourceFactory<String, Session> for SessionFactory {
    fn create(&self, user: &String) -> Result<Session> {
        let session = Session {
            user: user.clone(),
            requester: self.storage.requester(),
            storage: Arc::clone(&self.storage),
        };
        debug!(user = %user, requester = %session.requester, "engine.session.create");
        Ok(session)
    }

    fn reuse(&self, user: &String, session: &mut Session) {
        session.user.clone_from(user);
    }
}
