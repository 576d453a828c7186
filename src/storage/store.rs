use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::primitives::concurrency::{LockManager, LockMode};
use crate::primitives::mmap::MmapManager;
use crate::types::{
    ClusterId, RecordId, RecordType, RecordVersion, RequesterId, Result, TesseraError,
    VersionCheck,
};

use super::cache::{RecordCache, RecordCacheStats};
use super::config::{StorageConfig, CONFIG_FILE};
use super::options::{FileMode, StorageOptions};
use super::record::{ClusterEntry, EntryState, RawBuffer};
use super::segments::{Cluster, DataSegment};

/// Raw record store: versioned byte payloads addressed by `cluster:position`.
///
/// Every cluster is a segment of fixed-size position entries pointing into a
/// shared data segment. Reads take a shared record lock, updates and deletes
/// an exclusive one. Lock order inside the store is cluster, then data
/// segment, then cache.
pub struct Storage {
    dir: PathBuf,
    options: StorageOptions,
    config: Mutex<StorageConfig>,
    clusters: RwLock<FxHashMap<ClusterId, Arc<Mutex<Cluster>>>>,
    data: Mutex<DataSegment>,
    cache: Mutex<RecordCache>,
    locks: LockManager<RecordId, RequesterId>,
    mmap: Option<Arc<MmapManager>>,
    next_requester: AtomicU64,
    cleanly_closed: bool,
    closed: AtomicBool,
}

impl Storage {
    /// Creates a new storage in `dir` with its own window cache when the
    /// options ask for mapped access.
    pub fn create(dir: impl AsRef<Path>, options: StorageOptions) -> Result<Self> {
        let mmap = Self::default_mmap(&options);
        Self::create_with(dir, options, mmap)
    }

    /// Opens an existing storage in `dir`.
    pub fn open(dir: impl AsRef<Path>, options: StorageOptions) -> Result<Self> {
        let mmap = Self::default_mmap(&options);
        Self::open_with(dir, options, mmap)
    }

    fn default_mmap(options: &StorageOptions) -> Option<Arc<MmapManager>> {
        match options.file_mode {
            FileMode::Mmap => Some(Arc::new(MmapManager::new(options.mmap.clone()))),
            FileMode::Classic => None,
        }
    }

    /// Creates a new storage using an injected window cache (`None` forces
    /// positional I/O).
    pub fn create_with(
        dir: impl AsRef<Path>,
        options: StorageOptions,
        mmap: Option<Arc<MmapManager>>,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        if dir.join(CONFIG_FILE).exists() {
            return Err(TesseraError::Invalid("a storage already exists in this directory"));
        }
        let config = StorageConfig::initial();
        let data = DataSegment::create(
            &dir.join(&config.data_file),
            options.data_start_size,
            options.segment.clone(),
            mmap.clone(),
        )?;
        let mut clusters = FxHashMap::default();
        for entry in &config.clusters {
            let cluster = Cluster::create(
                &dir.join(&entry.file),
                entry.id,
                &entry.name,
                options.cluster_start_size,
                options.segment.clone(),
                mmap.clone(),
            )?;
            clusters.insert(entry.id, Arc::new(Mutex::new(cluster)));
        }
        config.persist(dir)?;
        info!(dir = %dir.display(), clusters = clusters.len(), "storage.create");
        Ok(Self::assemble(dir, options, config, clusters, data, mmap, true))
    }

    /// Opens an existing storage using an injected window cache.
    pub fn open_with(
        dir: impl AsRef<Path>,
        options: StorageOptions,
        mmap: Option<Arc<MmapManager>>,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.join(CONFIG_FILE).exists() {
            return Err(TesseraError::NotFound(format!(
                "no storage in {}",
                dir.display()
            )));
        }
        let config = StorageConfig::load(dir)?;
        let data = DataSegment::open(
            &dir.join(&config.data_file),
            options.segment.clone(),
            mmap.clone(),
        )?;
        let mut clean = data.was_softly_closed();
        let mut clusters = FxHashMap::default();
        for entry in &config.clusters {
            let cluster = Cluster::open(
                &dir.join(&entry.file),
                entry.id,
                &entry.name,
                options.segment.clone(),
                mmap.clone(),
            )?;
            clean &= cluster.was_softly_closed();
            clusters.insert(entry.id, Arc::new(Mutex::new(cluster)));
        }
        if !clean {
            warn!(dir = %dir.display(), "storage.open.unclean_shutdown");
        }
        info!(dir = %dir.display(), clusters = clusters.len(), "storage.open");
        Ok(Self::assemble(dir, options, config, clusters, data, mmap, clean))
    }

    fn assemble(
        dir: &Path,
        options: StorageOptions,
        config: StorageConfig,
        clusters: FxHashMap<ClusterId, Arc<Mutex<Cluster>>>,
        data: DataSegment,
        mmap: Option<Arc<MmapManager>>,
        cleanly_closed: bool,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            cache: Mutex::new(RecordCache::new(options.record_cache_capacity)),
            locks: LockManager::new(options.locks.clone()),
            options,
            config: Mutex::new(config),
            clusters: RwLock::new(clusters),
            data: Mutex::new(data),
            mmap,
            next_requester: AtomicU64::new(1),
            cleanly_closed,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(TesseraError::Closed("storage"));
        }
        Ok(())
    }

    fn cluster(&self, id: ClusterId) -> Result<Arc<Mutex<Cluster>>> {
        self.clusters
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| TesseraError::NotFound(format!("cluster {id}")))
    }

    /// Directory holding the storage files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Settings in effect.
    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// Whether every segment was softly closed by the previous session.
    pub fn was_cleanly_closed(&self) -> bool {
        self.cleanly_closed
    }

    /// Window cache shared by the segments, if mapped access is in use.
    pub fn mmap(&self) -> Option<&Arc<MmapManager>> {
        self.mmap.as_ref()
    }

    /// Record lock table.
    pub fn locks(&self) -> &LockManager<RecordId, RequesterId> {
        &self.locks
    }

    /// Hands out a fresh requester identity for lock bookkeeping.
    pub fn requester(&self) -> RequesterId {
        RequesterId(self.next_requester.fetch_add(1, AtomicOrdering::Relaxed))
    }

    /// Registers a new cluster and creates its file.
    pub fn add_cluster(&self, name: &str) -> Result<ClusterId> {
        self.ensure_open()?;
        let mut config = self.config.lock();
        if config.by_name(name).is_some() {
            return Err(TesseraError::Configuration(format!(
                "cluster '{name}' already exists"
            )));
        }
        let mut staged = config.clone();
        let entry = staged.register(name);
        let cluster = Cluster::create(
            &self.dir.join(&entry.file),
            entry.id,
            &entry.name,
            self.options.cluster_start_size,
            self.options.segment.clone(),
            self.mmap.clone(),
        )?;
        staged.persist(&self.dir)?;
        *config = staged;
        self.clusters
            .write()
            .insert(entry.id, Arc::new(Mutex::new(cluster)));
        debug!(name, id = entry.id, "storage.add_cluster");
        Ok(entry.id)
    }

    /// Resolves a cluster name.
    pub fn cluster_id(&self, name: &str) -> Option<ClusterId> {
        self.config.lock().by_name(name).map(|c| c.id)
    }

    /// Resolves a cluster id.
    pub fn cluster_name(&self, id: ClusterId) -> Option<String> {
        self.config.lock().by_id(id).map(|c| c.name.clone())
    }

    /// Names of all registered clusters in id order.
    pub fn cluster_names(&self) -> Vec<String> {
        self.config
            .lock()
            .clusters
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// Stores a new record and returns its position inside the cluster.
    pub fn create_record(
        &self,
        cluster_id: ClusterId,
        bytes: &[u8],
        record_type: RecordType,
    ) -> Result<i64> {
        self.ensure_open()?;
        let cluster = self.cluster(cluster_id)?;
        let mut cluster = cluster.lock();
        let len = u32::try_from(bytes.len())
            .map_err(|_| TesseraError::Invalid("record payload larger than 4 GiB"))?;
        let (data_offset, capacity) = if bytes.is_empty() {
            (0, 0)
        } else {
            self.data.lock().write_new(bytes)?
        };
        let entry = ClusterEntry {
            state: EntryState::Live,
            record_type,
            version: RecordVersion::default(),
            data_offset,
            capacity,
            len,
        };
        let position = cluster.append(&entry)?;
        let rid = RecordId::new(cluster_id, position);
        self.cache.lock().put(
            rid,
            RawBuffer {
                bytes: Bytes::copy_from_slice(bytes),
                version: entry.version,
                record_type,
            },
        );
        trace!(%rid, len, "storage.create_record");
        Ok(position)
    }

    /// Reads a record. Missing and deleted records yield `None`.
    pub fn read_record(&self, requester: RequesterId, rid: RecordId) -> Result<Option<RawBuffer>> {
        self.ensure_open()?;
        let _lock = self.locks.lock(requester, rid, LockMode::Shared, None)?;
        if let Some(hit) = self.cache.lock().get(&rid) {
            return Ok(Some(hit));
        }
        let cluster = self.cluster(rid.cluster)?;
        let cluster = cluster.lock();
        let entry = match cluster.entry(rid.position)? {
            Some(entry) if entry.is_live() => entry,
            _ => return Ok(None),
        };
        let bytes = if entry.len == 0 {
            Vec::new()
        } else {
            self.data.lock().read(entry.data_offset, entry.len)?
        };
        let buffer = RawBuffer {
            bytes: Bytes::from(bytes),
            version: entry.version,
            record_type: entry.record_type,
        };
        self.cache.lock().put(rid, buffer.clone());
        Ok(Some(buffer))
    }

    /// Replaces a record's payload and returns its new version.
    ///
    /// Fails with [`TesseraError::StaleVersion`] when `expected` names a
    /// version other than the stored one, and with
    /// [`TesseraError::NotFound`] for missing or deleted records.
    pub fn update_record(
        &self,
        requester: RequesterId,
        rid: RecordId,
        bytes: &[u8],
        expected: VersionCheck,
        record_type: RecordType,
    ) -> Result<RecordVersion> {
        self.ensure_open()?;
        let _lock = self.locks.lock(requester, rid, LockMode::Exclusive, None)?;
        let cluster = self.cluster(rid.cluster)?;
        let mut cluster = cluster.lock();
        let mut entry = cluster
            .entry(rid.position)?
            .filter(ClusterEntry::is_live)
            .ok_or_else(|| TesseraError::NotFound(format!("record {rid}")))?;
        check_version(rid, expected, entry.version)?;
        let len = u32::try_from(bytes.len())
            .map_err(|_| TesseraError::Invalid("record payload larger than 4 GiB"))?;
        {
            let mut data = self.data.lock();
            if len <= entry.capacity {
                data.overwrite(entry.data_offset, bytes)?;
            } else {
                let (offset, capacity) = data.write_new(bytes)?;
                entry.data_offset = offset;
                entry.capacity = capacity;
            }
        }
        entry.len = len;
        entry.version = entry.version.next();
        entry.record_type = record_type;
        cluster.write_entry(rid.position, &entry)?;
        self.cache.lock().put(
            rid,
            RawBuffer {
                bytes: Bytes::copy_from_slice(bytes),
                version: entry.version,
                record_type,
            },
        );
        trace!(%rid, version = entry.version.0, "storage.update_record");
        Ok(entry.version)
    }

    /// Deletes a record. Returns `false` when it does not exist.
    pub fn delete_record(
        &self,
        requester: RequesterId,
        rid: RecordId,
        expected: VersionCheck,
    ) -> Result<bool> {
        self.ensure_open()?;
        let _lock = self.locks.lock(requester, rid, LockMode::Exclusive, None)?;
        let cluster = self.cluster(rid.cluster)?;
        let mut cluster = cluster.lock();
        let mut entry = match cluster.entry(rid.position)? {
            Some(entry) if entry.is_live() => entry,
            _ => return Ok(false),
        };
        check_version(rid, expected, entry.version)?;
        entry.state = EntryState::Deleted;
        entry.version = entry.version.next();
        cluster.write_entry(rid.position, &entry)?;
        self.cache.lock().invalidate(&rid);
        trace!(%rid, "storage.delete_record");
        Ok(true)
    }

    /// Number of live records in a cluster.
    pub fn count_records(&self, cluster_id: ClusterId) -> Result<u64> {
        self.ensure_open()?;
        let cluster = self.cluster(cluster_id)?;
        let cluster = cluster.lock();
        let mut live = 0;
        for position in 0..cluster.positions() as i64 {
            if matches!(cluster.entry(position)?, Some(entry) if entry.is_live()) {
                live += 1;
            }
        }
        Ok(live)
    }

    /// Bytes used in the data segment, relocated garbage included.
    pub fn data_size(&self) -> u64 {
        self.data.lock().filled_up_to()
    }

    /// Record cache counters.
    pub fn cache_stats(&self) -> RecordCacheStats {
        self.cache.lock().stats()
    }

    /// Forces every segment to disk.
    pub fn synch(&self) -> Result<()> {
        self.ensure_open()?;
        for cluster in self.clusters.read().values() {
            cluster.lock().synch()?;
        }
        self.data.lock().synch()
    }

    /// Softly closes every segment. Further calls fail with [`TesseraError::Closed`].
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, AtomicOrdering::AcqRel) {
            return Ok(());
        }
        for cluster in self.clusters.read().values() {
            cluster.lock().close()?;
        }
        self.data.lock().close()?;
        self.cache.lock().clear();
        self.locks.clear();
        info!(dir = %self.dir.display(), "storage.close");
        Ok(())
    }
}

fn check_version(rid: RecordId, expected: VersionCheck, actual: RecordVersion) -> Result<()> {
    match expected {
        VersionCheck::Exact(expected) if expected != actual => Err(TesseraError::StaleVersion {
            rid,
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("dir", &self.dir.display())
            .field("clusters", &self.clusters.read().len())
            .field("closed", &self.closed.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if !self.closed.load(AtomicOrdering::Acquire) {
            debug!(dir = %self.dir.display(), "storage.dropped_without_close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn classic() -> StorageOptions {
        StorageOptions::default()
            .file_mode(FileMode::Classic)
            .start_sizes(240, 1024)
    }

    #[test]
    fn crud_cycle_bumps_versions() -> Result<()> {
        let dir = tempdir().unwrap();
        let storage = Storage::create(dir.path(), classic())?;
        let req = storage.requester();
        let cluster = storage.cluster_id("default").unwrap();
        let pos = storage.create_record(cluster, b"first", RecordType::BYTES)?;
        let rid = RecordId::new(cluster, pos);

        let read = storage.read_record(req, rid)?.unwrap();
        assert_eq!(&read.bytes[..], b"first");
        assert_eq!(read.version, RecordVersion(0));

        let v1 = storage.update_record(req, rid, b"second, longer payload", read.version.into(), RecordType::DOCUMENT)?;
        assert_eq!(v1, RecordVersion(1));
        let read = storage.read_record(req, rid)?.unwrap();
        assert_eq!(&read.bytes[..], b"second, longer payload");
        assert_eq!(read.record_type, RecordType::DOCUMENT);

        assert!(storage.delete_record(req, rid, VersionCheck::Any)?);
        assert!(storage.read_record(req, rid)?.is_none());
        assert!(!storage.delete_record(req, rid, VersionCheck::Any)?);
        assert!(matches!(
            storage.update_record(req, rid, b"x", VersionCheck::Any, RecordType::BYTES),
            Err(TesseraError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn positions_are_not_reused() -> Result<()> {
        let dir = tempdir().unwrap();
        let storage = Storage::create(dir.path(), classic())?;
        let req = storage.requester();
        let a = storage.create_record(0, b"a", RecordType::BYTES)?;
        storage.delete_record(req, RecordId::new(0, a), VersionCheck::Any)?;
        let b = storage.create_record(0, b"b", RecordType::BYTES)?;
        assert_ne!(a, b);
        assert_eq!(storage.count_records(0)?, 1);
        Ok(())
    }

    #[test]
    fn in_place_overwrite_keeps_data_size() -> Result<()> {
        let dir = tempdir().unwrap();
        let storage = Storage::create(dir.path(), classic())?;
        let req = storage.requester();
        let pos = storage.create_record(1, &[1u8; 40], RecordType::BYTES)?;
        let rid = RecordId::new(1, pos);
        let before = storage.data_size();
        storage.update_record(req, rid, &[2u8; 45], VersionCheck::Any, RecordType::BYTES)?;
        assert_eq!(storage.data_size(), before);
        storage.update_record(req, rid, &[3u8; 200], VersionCheck::Any, RecordType::BYTES)?;
        assert!(storage.data_size() > before);
        assert_eq!(&storage.read_record(req, rid)?.unwrap().bytes[..], &[3u8; 200][..]);
        Ok(())
    }

    #[test]
    fn unknown_cluster_and_closed_storage() -> Result<()> {
        let dir = tempdir().unwrap();
        let storage = Storage::create(dir.path(), classic())?;
        assert!(matches!(
            storage.create_record(42, b"x", RecordType::BYTES),
            Err(TesseraError::NotFound(_))
        ));
        storage.close()?;
        assert!(matches!(
            storage.create_record(0, b"x", RecordType::BYTES),
            Err(TesseraError::Closed(_))
        ));
        Ok(())
    }
}
