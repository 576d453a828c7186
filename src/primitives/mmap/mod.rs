#![allow(unsafe_code)]

//! Budgeted cache of memory-mapped windows over segment files.
//!
//! A window maps a contiguous byte range of one file. Requests that fall
//! inside a cached window reuse it; otherwise a new window of at least
//! `block_size` bytes is mapped. When the resident total passes `max_memory`
//! the least recently used windows that nobody has pinned are flushed and
//! dropped. All bookkeeping sits behind a single lock per manager.

use std::fs::File;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lru::LruCache;
use memmap2::{MmapMut, MmapOptions as RawMapOptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::types::{Result, TesseraError};

/// Identifies a file registered with a [`MmapManager`].
pub type FileId = u64;

/// Window sizing and eviction settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MmapOptions {
    /// Minimum size of a freshly mapped window.
    pub block_size: usize,
    /// Resident byte budget across all windows.
    pub max_memory: usize,
    /// Flush attempts before an evicted window is dropped anyway.
    pub force_retry: u32,
    /// Pause between flush attempts.
    pub force_delay_ms: u64,
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self {
            block_size: 1_500_000,
            max_memory: 100_000_000,
            force_retry: 5,
            force_delay_ms: 500,
        }
    }
}

impl MmapOptions {
    /// Sets the minimum window size.
    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Sets the resident byte budget.
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Sets how often an evicted window's flush is attempted and the pause
    /// between attempts.
    pub fn force_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.force_retry = attempts;
        self.force_delay_ms = delay.as_millis() as u64;
        self
    }
}

/// File a window is requested against.
#[derive(Clone, Copy)]
pub struct MapTarget<'a> {
    /// Registration id from [`MmapManager::register_file`].
    pub id: FileId,
    /// Open handle used for mapping.
    pub file: &'a File,
    /// Current physical length of the file.
    pub len: u64,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
struct WindowKey {
    file: FileId,
    begin: u64,
    len: usize,
}

impl WindowKey {
    fn covers(&self, file: FileId, offset: u64, size: usize) -> bool {
        self.file == file
            && offset >= self.begin
            && offset + size as u64 <= self.begin + self.len as u64
    }
}

struct MappedWindow {
    key: WindowKey,
    map: Mutex<MmapMut>,
    pins: AtomicU32,
}

impl MappedWindow {
    fn pinned(&self) -> bool {
        self.pins.load(AtomicOrdering::Acquire) > 0
    }
}

/// A pinned window. Eviction skips it until the handle is dropped.
pub struct WindowHandle {
    window: Arc<MappedWindow>,
}

impl WindowHandle {
    fn pin(window: Arc<MappedWindow>) -> Self {
        window.pins.fetch_add(1, AtomicOrdering::AcqRel);
        Self { window }
    }

    /// First file offset covered by the window.
    pub fn begin(&self) -> u64 {
        self.window.key.begin
    }

    /// Number of bytes mapped.
    pub fn len(&self) -> usize {
        self.window.key.len
    }

    /// Returns true for a zero-length window. Never the case for handed-out windows.
    pub fn is_empty(&self) -> bool {
        self.window.key.len == 0
    }

    fn relative(&self, offset: u64, len: usize) -> Result<usize> {
        if !self.window.key.covers(self.window.key.file, offset, len) {
            return Err(TesseraError::InvalidRange(format!(
                "[{offset}, {}) is outside window [{}, {})",
                offset + len as u64,
                self.begin(),
                self.begin() + self.len() as u64
            )));
        }
        Ok((offset - self.begin()) as usize)
    }

    /// Copies bytes at file `offset` into `dst`.
    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let start = self.relative(offset, dst.len())?;
        let map = self.window.map.lock();
        dst.copy_from_slice(&map[start..start + dst.len()]);
        Ok(())
    }

    /// Copies `src` into the window at file `offset`.
    pub fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        let start = self.relative(offset, src.len())?;
        let mut map = self.window.map.lock();
        map[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }
}

impl Drop for WindowHandle {
    fn drop(&mut self) {
        self.window.pins.fetch_sub(1, AtomicOrdering::AcqRel);
    }
}

/// Counters describing window cache behaviour.
#[derive(Default, Debug, Clone, Copy)]
pub struct MmapStatsSnapshot {
    /// Requests served by an existing window.
    pub hits: u64,
    /// Windows mapped.
    pub maps: u64,
    /// Windows dropped to stay under budget.
    pub evictions: u64,
    /// Evicted windows whose flush never succeeded.
    pub flush_failures: u64,
    /// Bytes currently mapped.
    pub resident_bytes: u64,
    /// Windows currently cached.
    pub windows: u64,
}

#[derive(Default)]
struct MmapStats {
    hits: AtomicU64,
    maps: AtomicU64,
    evictions: AtomicU64,
    flush_failures: AtomicU64,
}

struct MmapState {
    windows: LruCache<WindowKey, Arc<MappedWindow>>,
    resident: usize,
}

/// Shared window cache. Construct one per engine and hand it to every segment.
pub struct MmapManager {
    options: MmapOptions,
    state: Mutex<MmapState>,
    next_file: AtomicU64,
    stats: MmapStats,
}

impl MmapManager {
    /// Creates an empty manager.
    pub fn new(options: MmapOptions) -> Self {
        Self {
            options,
            state: Mutex::new(MmapState {
                windows: LruCache::unbounded(),
                resident: 0,
            }),
            next_file: AtomicU64::new(1),
            stats: MmapStats::default(),
        }
    }

    /// Settings in effect.
    pub fn options(&self) -> &MmapOptions {
        &self.options
    }

    /// Allocates an id for a file whose windows will be cached.
    pub fn register_file(&self) -> FileId {
        self.next_file.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// Returns a pinned window covering `[offset, offset + size)`.
    ///
    /// With `force` the window is exactly `size` bytes; otherwise it is at
    /// least `block_size`. Either way it is clamped to the end of the file.
    pub fn request(
        &self,
        target: &MapTarget<'_>,
        offset: u64,
        size: usize,
        force: bool,
    ) -> Result<WindowHandle> {
        let mut state = self.state.lock();
        let hit = state
            .windows
            .iter()
            .find(|(key, _)| key.covers(target.id, offset, size))
            .map(|(key, _)| *key);
        if let Some(key) = hit {
            if let Some(window) = state.windows.get(&key) {
                self.stats.hits.fetch_add(1, AtomicOrdering::Relaxed);
                return Ok(WindowHandle::pin(Arc::clone(window)));
            }
        }

        let wanted = if force {
            size as u64
        } else {
            size.max(self.options.block_size) as u64
        };
        let len = wanted.min(target.len.saturating_sub(offset));
        if len == 0 || len < size as u64 {
            return Err(TesseraError::InvalidRange(format!(
                "file {} has {} bytes, cannot map {size} bytes at {offset}",
                target.id, target.len
            )));
        }
        let len = usize::try_from(len)
            .map_err(|_| TesseraError::InvalidRange(format!("window of {len} bytes")))?;

        state.resident += len;
        if state.resident > self.options.max_memory {
            self.evict(&mut state);
        }
        let map = match unsafe {
            RawMapOptions::new()
                .offset(offset)
                .len(len)
                .map_mut(target.file)
        } {
            Ok(map) => map,
            Err(err) => {
                state.resident -= len;
                return Err(err.into());
            }
        };
        let key = WindowKey {
            file: target.id,
            begin: offset,
            len,
        };
        let window = Arc::new(MappedWindow {
            key,
            map: Mutex::new(map),
            pins: AtomicU32::new(0),
        });
        let handle = WindowHandle::pin(Arc::clone(&window));
        if let Some(old) = state.windows.put(key, window) {
            state.resident -= old.key.len;
        }
        self.stats.maps.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(file = target.id, begin = offset, len, "mmap.map");
        Ok(handle)
    }

    fn evict(&self, state: &mut MmapState) {
        let candidates: Vec<WindowKey> = state
            .windows
            .iter()
            .rev()
            .filter(|(_, window)| !window.pinned())
            .map(|(key, _)| *key)
            .collect();
        for key in candidates {
            if state.resident <= self.options.max_memory {
                break;
            }
            if let Some(window) = state.windows.pop(&key) {
                self.flush_with_retry(&key, || window.map.lock().flush());
                state.resident -= key.len;
                self.stats.evictions.fetch_add(1, AtomicOrdering::Relaxed);
                debug!(file = key.file, begin = key.begin, len = key.len, "mmap.evict");
            }
        }
    }

    fn flush_with_retry<F>(&self, key: &WindowKey, mut flush: F) -> bool
    where
        F: FnMut() -> std::io::Result<()>,
    {
        let delay = Duration::from_millis(self.options.force_delay_ms);
        for attempt in 1..=self.options.force_retry.max(1) {
            match flush() {
                Ok(()) => return true,
                Err(err) => {
                    warn!(
                        file = key.file,
                        begin = key.begin,
                        attempt,
                        error = %err,
                        "mmap.flush_retry"
                    );
                    thread::sleep(delay);
                }
            }
        }
        self.stats.flush_failures.fetch_add(1, AtomicOrdering::Relaxed);
        error!(file = key.file, begin = key.begin, "mmap.flush_gave_up");
        false
    }

    /// Copies bytes at `offset` of the target file into `dst`.
    pub fn read_at(&self, target: &MapTarget<'_>, offset: u64, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        self.request(target, offset, dst.len(), false)?
            .read(offset, dst)
    }

    /// Copies `src` into the target file at `offset`.
    pub fn write_at(&self, target: &MapTarget<'_>, offset: u64, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        self.request(target, offset, src.len(), false)?
            .write(offset, src)
    }

    fn windows_of(&self, file: FileId) -> Vec<Arc<MappedWindow>> {
        self.state
            .lock()
            .windows
            .iter()
            .filter(|(key, _)| key.file == file)
            .map(|(_, window)| Arc::clone(window))
            .collect()
    }

    /// Flushes every cached window of `file`.
    pub fn flush_file(&self, file: FileId) -> Result<()> {
        for window in self.windows_of(file) {
            window.map.lock().flush()?;
        }
        Ok(())
    }

    /// Flushes and forgets every window of `file`. Called when a segment
    /// closes, shrinks or is deleted.
    pub fn release_file(&self, file: FileId) -> Result<()> {
        let mut state = self.state.lock();
        let keys: Vec<WindowKey> = state
            .windows
            .iter()
            .filter(|(key, _)| key.file == file)
            .map(|(key, _)| *key)
            .collect();
        let mut first_err = None;
        for key in keys {
            if let Some(window) = state.windows.pop(&key) {
                state.resident -= key.len;
                if let Err(err) = window.map.lock().flush() {
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Returns cache counters.
    pub fn stats(&self) -> MmapStatsSnapshot {
        let state = self.state.lock();
        MmapStatsSnapshot {
            hits: self.stats.hits.load(AtomicOrdering::Relaxed),
            maps: self.stats.maps.load(AtomicOrdering::Relaxed),
            evictions: self.stats.evictions.load(AtomicOrdering::Relaxed),
            flush_failures: self.stats.flush_failures.load(AtomicOrdering::Relaxed),
            resident_bytes: state.resident as u64,
            windows: state.windows.len() as u64,
        }
    }
}

impl Default for MmapManager {
    fn default() -> Self {
        Self::new(MmapOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::{FileIo, StdFileIo};
    use tempfile::tempdir;

    fn sized_file(dir: &std::path::Path, name: &str, len: u64) -> StdFileIo {
        let io = StdFileIo::create_new(dir.join(name)).unwrap();
        io.truncate(len).unwrap();
        io
    }

    #[test]
    fn covered_requests_hit_the_cache() -> Result<()> {
        let dir = tempdir().unwrap();
        let io = sized_file(dir.path(), "a.bin", 8192);
        let manager = MmapManager::new(MmapOptions::default().block_size(4096));
        let id = manager.register_file();
        let target = MapTarget {
            id,
            file: io.file(),
            len: 8192,
        };
        manager.write_at(&target, 100, b"window")?;
        let mut buf = [0u8; 6];
        manager.read_at(&target, 100, &mut buf)?;
        assert_eq!(&buf, b"window");
        let stats = manager.stats();
        assert_eq!(stats.maps, 1);
        assert_eq!(stats.hits, 1);

        manager.flush_file(id)?;
        let mut direct = [0u8; 6];
        io.read_at(100, &mut direct)?;
        assert_eq!(&direct, b"window");
        Ok(())
    }

    #[test]
    fn window_is_clamped_to_file_end() -> Result<()> {
        let dir = tempdir().unwrap();
        let io = sized_file(dir.path(), "b.bin", 1000);
        let manager = MmapManager::default();
        let target = MapTarget {
            id: manager.register_file(),
            file: io.file(),
            len: 1000,
        };
        let handle = manager.request(&target, 200, 10, false)?;
        assert_eq!(handle.len(), 800);
        // Covered by the cached window, so `force` does not remap.
        let covered = manager.request(&target, 990, 10, true)?;
        assert_eq!((covered.begin(), covered.len()), (200, 800));
        let forced = manager.request(&target, 50, 10, true)?;
        assert_eq!((forced.begin(), forced.len()), (50, 10));
        assert_eq!(manager.stats().maps, 2);
        assert!(matches!(
            manager.request(&target, 1000, 1, false),
            Err(TesseraError::InvalidRange(_))
        ));
        Ok(())
    }

    #[test]
    fn failing_flush_is_retried_then_abandoned() {
        let manager = MmapManager::new(
            MmapOptions::default().force_retry(3, Duration::from_millis(1)),
        );
        let key = WindowKey {
            file: manager.register_file(),
            begin: 0,
            len: 4096,
        };

        let mut attempts = 0;
        let flushed = manager.flush_with_retry(&key, || {
            attempts += 1;
            Err(std::io::Error::new(std::io::ErrorKind::Other, "device busy"))
        });
        assert!(!flushed);
        assert_eq!(attempts, 3);
        assert_eq!(manager.stats().flush_failures, 1);

        let mut attempts = 0;
        let flushed = manager.flush_with_retry(&key, || {
            attempts += 1;
            if attempts < 2 {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "device busy"))
            } else {
                Ok(())
            }
        });
        assert!(flushed);
        assert_eq!(attempts, 2);
        assert_eq!(manager.stats().flush_failures, 1);
    }

    #[test]
    fn budget_evicts_unpinned_windows_only() -> Result<()> {
        let dir = tempdir().unwrap();
        let io = sized_file(dir.path(), "c.bin", 64 * 1024);
        let manager = MmapManager::new(
            MmapOptions::default()
                .block_size(4096)
                .max_memory(3 * 4096),
        );
        let target = MapTarget {
            id: manager.register_file(),
            file: io.file(),
            len: 64 * 1024,
        };
        let pinned = manager.request(&target, 0, 16, false)?;
        for i in 1..6u64 {
            manager.write_at(&target, i * 4096, &[i as u8; 4])?;
        }
        let stats = manager.stats();
        assert!(stats.evictions >= 3, "{stats:?}");
        assert!(stats.resident_bytes <= 3 * 4096);
        // The pinned window survived every eviction round.
        let mut buf = [0u8; 4];
        pinned.read(0, &mut buf)?;
        let again = manager.request(&target, 0, 16, false)?;
        assert_eq!(again.begin(), 0);
        assert!(manager.stats().hits >= 1);

        drop((pinned, again));
        manager.release_file(target.id)?;
        assert_eq!(manager.stats().windows, 0);
        let mut check = [0u8; 4];
        io.read_at(5 * 4096, &mut check)?;
        assert_eq!(check, [5u8; 4]);
        Ok(())
    }
}
