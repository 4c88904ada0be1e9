//! LRU (Least Recently Used) memoizing cache for decoded structures.
//!
//! Values are immutable once published and shared as `Arc<T>`. The cache is
//! keyed by source identity, address and structure kind, so a single cache
//! can serve several open files.

use crate::error::{Result, Structure};
use crate::io::SourceId;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// A unique identifier for a decoded structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Identity of the byte source the structure was read from
    pub source: SourceId,
    /// File address of the structure
    pub address: u64,
    /// Kind of structure decoded at that address
    pub structure: Structure,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(source: SourceId, address: u64, structure: Structure) -> Self {
        Self { source, address, structure }
    }
}

/// Statistics for cache performance monitoring.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Total number of cache lookups
    pub lookups: u64,
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Number of insertions
    pub insertions: u64,
    /// Number of evictions
    pub evictions: u64,
    /// Number of decodes whose result lost the race to publish
    pub redundant_decodes: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }

    /// Reset all statistics to zero
    pub fn reset(&mut self) {
        *self = CacheStats::default();
    }
}

type CachedValue = Arc<dyn Any + Send + Sync>;

/// Thread-safe memoizing cache of decoded structures.
///
/// Decoding runs outside the cache locks. Two threads missing on the same
/// key may both decode it; the first to publish wins and every caller gets
/// the published value. A failed decode publishes nothing.
#[derive(Debug)]
pub struct DecodeCache {
    /// Maximum number of entries
    capacity: usize,
    /// Published values
    entries: RwLock<HashMap<CacheKey, CachedValue>>,
    /// LRU queue (most recently used at the back)
    lru_queue: RwLock<VecDeque<CacheKey>>,
    /// Cache statistics
    stats: RwLock<CacheStats>,
}

impl DecodeCache {
    /// Create a new cache holding at most `capacity` entries.
    ///
    /// # Examples
    ///
    /// ```
    /// use h5nav::cache::DecodeCache;
    ///
    /// let cache = DecodeCache::new(256);
    /// assert!(cache.is_empty());
    /// ```
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(HashMap::new()),
            lru_queue: RwLock::new(VecDeque::new()),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// Look up a published value.
    ///
    /// Returns `None` on a miss or if the entry under `key` has another type.
    pub fn get<T: Any + Send + Sync>(&self, key: &CacheKey) -> Option<Arc<T>> {
        self.stats.write().lookups += 1;

        if self.capacity == 0 {
            self.stats.write().misses += 1;
            return None;
        }

        let found = self.entries.read().get(key).cloned();
        match found.and_then(|value| value.downcast::<T>().ok()) {
            Some(value) => {
                self.touch(key);
                self.stats.write().hits += 1;
                Some(value)
            }
            None => {
                self.stats.write().misses += 1;
                None
            }
        }
    }

    /// Publish a value unless one is already present.
    ///
    /// Returns whichever value is published under `key` afterwards.
    pub fn insert<T: Any + Send + Sync>(&self, key: CacheKey, value: Arc<T>) -> Arc<T> {
        if self.capacity == 0 {
            return value;
        }

        {
            let mut entries = self.entries.write();
            if let Some(existing) = entries.get(&key) {
                if let Ok(existing) = Arc::clone(existing).downcast::<T>() {
                    drop(entries);
                    self.stats.write().redundant_decodes += 1;
                    return existing;
                }
            }
            entries.insert(key, Arc::clone(&value) as CachedValue);
        }

        {
            let mut lru_queue = self.lru_queue.write();
            lru_queue.retain(|k| k != &key);
            lru_queue.push_back(key);
        }
        self.stats.write().insertions += 1;

        while self.len() > self.capacity {
            self.evict_one();
        }
        value
    }

    /// Return the published value for `key`, decoding and publishing it on
    /// a miss.
    pub fn get_or_try_insert_with<T, F>(&self, key: CacheKey, decode: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T>,
    {
        if let Some(value) = self.get::<T>(&key) {
            return Ok(value);
        }
        let value = Arc::new(decode()?);
        Ok(self.insert(key, value))
    }

    /// Move a key to the most recently used position.
    ///
    /// O(n) in the number of entries.
    fn touch(&self, key: &CacheKey) {
        let mut lru_queue = self.lru_queue.write();
        if let Some(pos) = lru_queue.iter().position(|k| k == key) {
            lru_queue.remove(pos);
        }
        lru_queue.push_back(*key);
    }

    /// Evict the least recently used entry from the cache.
    fn evict_one(&self) {
        let Some(key) = self.lru_queue.write().pop_front() else {
            return;
        };
        if self.entries.write().remove(&key).is_some() {
            self.stats.write().evictions += 1;
        }
    }

    /// Remove every entry that belongs to `source`.
    pub fn invalidate_source(&self, source: SourceId) {
        self.entries.write().retain(|k, _| k.source != source);
        self.lru_queue.write().retain(|k| k.source != source);
    }

    /// Get current cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }

    /// Reset cache statistics to zero.
    pub fn reset_stats(&self) {
        self.stats.write().reset();
    }

    /// Clear all entries from the cache.
    pub fn clear(&self) {
        self.entries.write().clear();
        self.lru_queue.write().clear();
    }

    /// Get the cache capacity in entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of entries in the cache.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(address: u64) -> CacheKey {
        CacheKey::new(1, address, Structure::ObjectHeader)
    }

    #[test]
    fn test_cache_basic_operations() {
        let cache = DecodeCache::new(16);

        assert!(cache.get::<String>(&key(0)).is_none());
        cache.insert(key(0), Arc::new("root".to_string()));
        assert_eq!(cache.get::<String>(&key(0)).unwrap().as_str(), "root");

        let stats = cache.stats();
        assert_eq!(stats.lookups, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.insertions, 1);
    }

    #[test]
    fn test_structure_kind_is_part_of_key() {
        let cache = DecodeCache::new(16);
        cache.insert(CacheKey::new(1, 0x60, Structure::LocalHeap), Arc::new(1u32));
        assert!(cache.get::<u32>(&CacheKey::new(1, 0x60, Structure::GlobalHeap)).is_none());
        assert!(cache.get::<u32>(&CacheKey::new(2, 0x60, Structure::LocalHeap)).is_none());
        assert!(cache.get::<u32>(&CacheKey::new(1, 0x60, Structure::LocalHeap)).is_some());
    }

    #[test]
    fn test_first_publish_wins() {
        let cache = DecodeCache::new(16);
        let first = cache.insert(key(8), Arc::new(1u64));
        let second = cache.insert(key(8), Arc::new(2u64));
        assert_eq!(*first, 1);
        assert_eq!(*second, 1);
        assert_eq!(cache.stats().redundant_decodes, 1);
    }

    #[test]
    fn test_failed_decode_is_not_published() {
        let cache = DecodeCache::new(16);
        let result: Result<Arc<u64>> = cache.get_or_try_insert_with(key(8), || {
            Err(Error::format(Structure::ObjectHeader, 8, "truncated continuation"))
        });
        assert!(result.is_err());
        assert!(cache.is_empty());

        let value = cache.get_or_try_insert_with(key(8), || Ok(5u64)).unwrap();
        assert_eq!(*value, 5);
    }

    #[test]
    fn test_decode_runs_once_per_key() {
        let cache = DecodeCache::new(16);
        let calls = AtomicUsize::new(0);
        for _ in 0..5 {
            let v = cache
                .get_or_try_insert_with(key(24), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(99u32)
                })
                .unwrap();
            assert_eq!(*v, 99);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cache_lru_eviction() {
        let cache = DecodeCache::new(3);
        for addr in 0..3 {
            cache.insert(key(addr), Arc::new(addr));
        }
        // Access key 0 so key 1 becomes least recently used.
        assert!(cache.get::<u64>(&key(0)).is_some());
        cache.insert(key(3), Arc::new(3u64));

        assert_eq!(cache.len(), 3);
        assert!(cache.get::<u64>(&key(1)).is_none());
        assert!(cache.get::<u64>(&key(0)).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_cache_disabled_when_capacity_zero() {
        let cache = DecodeCache::new(0);
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            cache
                .get_or_try_insert_with(key(0), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1u8)
                })
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_source() {
        let cache = DecodeCache::new(16);
        cache.insert(CacheKey::new(1, 0, Structure::LocalHeap), Arc::new(1u8));
        cache.insert(CacheKey::new(2, 0, Structure::LocalHeap), Arc::new(2u8));
        cache.invalidate_source(1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get::<u8>(&CacheKey::new(2, 0, Structure::LocalHeap)).is_some());
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let cache = Arc::new(DecodeCache::new(64));
        let mut handles = vec![];

        for i in 0..10u64 {
            let cache_clone = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                let shared = cache_clone.get_or_try_insert_with(key(0), || Ok(7u64)).unwrap();
                assert_eq!(*shared, 7);
                let own = cache_clone.get_or_try_insert_with(key(100 + i), || Ok(i)).unwrap();
                assert_eq!(*own, i);
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 11);
    }
}
