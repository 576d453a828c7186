use std::num::NonZeroUsize;

use lru::LruCache;

use crate::types::{RecordId, Result};

use super::record::RawBuffer;

/// Cache hit/miss counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecordCacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
}

/// Bounded LRU of recently read or written records keyed by address.
pub struct RecordCache {
    entries: Option<LruCache<RecordId, RawBuffer>>,
    stats: RecordCacheStats,
}

impl RecordCache {
    /// Creates a cache holding up to `capacity` records. Zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(LruCache::new),
            stats: RecordCacheStats::default(),
        }
    }

    /// Returns the cached copy of `rid` and counts the lookup.
    pub fn get(&mut self, rid: &RecordId) -> Option<RawBuffer> {
        let hit = self.entries.as_mut().and_then(|e| e.get(rid)).cloned();
        match hit {
            Some(_) => self.stats.hits += 1,
            None => self.stats.misses += 1,
        }
        hit
    }

    /// Stores the latest copy of a record.
    pub fn put(&mut self, rid: RecordId, buffer: RawBuffer) {
        if let Some(entries) = self.entries.as_mut() {
            entries.put(rid, buffer);
        }
    }

    /// Drops the cached copy of `rid`.
    pub fn invalidate(&mut self, rid: &RecordId) {
        if let Some(entries) = self.entries.as_mut() {
            entries.pop(rid);
        }
    }

    /// Returns the cached copy of `rid`, loading it via `loader` on a miss.
    /// Absent records are not cached.
    pub fn get_or_load<F>(&mut self, rid: RecordId, loader: F) -> Result<Option<RawBuffer>>
    where
        F: FnOnce(RecordId) -> Result<Option<RawBuffer>>,
    {
        if let Some(hit) = self.get(&rid) {
            return Ok(Some(hit));
        }
        let loaded = loader(rid)?;
        if let Some(buffer) = &loaded {
            self.put(rid, buffer.clone());
        }
        Ok(loaded)
    }

    /// Clears all cached entries.
    pub fn clear(&mut self) {
        if let Some(entries) = self.entries.as_mut() {
            entries.clear();
        }
    }

    /// Number of cached records.
    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, LruCache::len)
    }

    /// Returns true when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current counters.
    pub fn stats(&self) -> RecordCacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RecordType, RecordVersion};
    use bytes::Bytes;

    fn buffer(payload: &'static [u8]) -> RawBuffer {
        RawBuffer {
            bytes: Bytes::from_static(payload),
            version: RecordVersion(0),
            record_type: RecordType::BYTES,
        }
    }

    #[test]
    fn loads_once_then_hits() -> Result<()> {
        let mut cache = RecordCache::new(2);
        let rid = RecordId::new(1, 1);
        let mut loads = 0;
        for _ in 0..3 {
            let got = cache.get_or_load(rid, |_| {
                loads += 1;
                Ok(Some(buffer(b"x")))
            })?;
            assert_eq!(got.unwrap().bytes, Bytes::from_static(b"x"));
        }
        assert_eq!(loads, 1);
        assert_eq!(cache.stats(), RecordCacheStats { hits: 2, misses: 1 });
        Ok(())
    }

    #[test]
    fn capacity_bounds_entries() {
        let mut cache = RecordCache::new(2);
        for pos in 0..3 {
            cache.put(RecordId::new(0, pos), buffer(b"y"));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&RecordId::new(0, 0)).is_none());
        cache.invalidate(&RecordId::new(0, 2));
        assert_eq!(cache.len(), 1);

        let mut disabled = RecordCache::new(0);
        disabled.put(RecordId::new(0, 0), buffer(b"z"));
        assert!(disabled.is_empty());
    }
}
