//! Memory Cache
//!
//! LRU-bounded cache of reference-counted bitmaps keyed by cache key.
//! Every operation is serialized by one coarse lock per cache instance;
//! the finer per-key edit locks used by the decode layer are handed out
//! via `edit_lock_for` and never held by the cache itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::counted::CountedBitmap;
use crate::key::CacheKey;
use crate::keyed_lock::KeyedLockRegistry;
use crate::pressure::{MemoryPressureListener, TrimLevel};

/// LRU memory cache for decoded bitmaps
///
/// Resident bitmaps carry the cache's implicit reference (`cached` flag);
/// eviction clears it, and the bitmap recycles itself once its last
/// display reference is released. Lifecycle races (closed, disabled,
/// duplicate keys) degrade to logged no-ops so a display pipeline can
/// never crash on a cache call.
#[derive(Debug)]
pub struct LruMemoryCache {
    inner: Mutex<Inner>,
    edit_locks: KeyedLockRegistry,
    /// Maximum resident bytes
    max_size: usize,
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<CacheKey, Entry>,
    current_size: usize,
    /// Monotonic stamp; higher means more recently touched
    access_counter: u64,
    disabled: bool,
    closed: bool,
    hits: u64,
    misses: u64,
    evictions: u64,
}

#[derive(Debug)]
struct Entry {
    bitmap: Arc<CountedBitmap>,
    last_access: u64,
    /// Bytes charged at insert; a recycled bitmap reports 0, charged as 1
    /// so eviction always makes progress
    accounted_size: usize,
}

impl LruMemoryCache {
    /// Create a cache bounded to `max_size` resident bytes
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                current_size: 0,
                access_counter: 0,
                disabled: false,
                closed: false,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            edit_locks: KeyedLockRegistry::new(),
            max_size,
        }
    }

    /// Create with the default 64MB limit
    pub fn with_default_limit() -> Self {
        Self::new(64 * 1024 * 1024)
    }

    /// Look up a resident bitmap, bumping its recency
    ///
    /// Returns `None` when the key is absent or the cache is closed or
    /// disabled. A recycled bitmap found resident is removed and reported
    /// as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CountedBitmap>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed || inner.disabled {
            return None;
        }

        let stale = match inner.entries.get(key) {
            Some(entry) => entry.bitmap.is_recycled(),
            None => {
                inner.misses += 1;
                return None;
            }
        };

        if stale {
            // should not happen: residency holds a reference. Self-heal.
            if let Some(entry) = inner.entries.remove(key) {
                inner.current_size -= entry.accounted_size;
                entry.bitmap.set_cached("get", false);
                warn!(key = %key, "removed recycled bitmap found resident in cache");
            }
            inner.misses += 1;
            return None;
        }

        inner.access_counter += 1;
        let stamp = inner.access_counter;
        let bitmap = inner.entries.get_mut(key).map(|entry| {
            entry.last_access = stamp;
            entry.bitmap.clone()
        });
        inner.hits += 1;
        bitmap
    }

    /// Insert a bitmap, marking it resident and evicting LRU entries as
    /// needed to stay within the byte limit
    ///
    /// Returns false without inserting when the cache is closed or
    /// disabled, when the key is already present (the original entry is
    /// preserved; holders of it stay valid), or when the bitmap is
    /// already resident under another key.
    pub fn put(&self, key: CacheKey, bitmap: Arc<CountedBitmap>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            error!(key = %key, "put on a closed memory cache");
            return false;
        }
        if inner.disabled {
            warn!(key = %key, "put on a disabled memory cache");
            return false;
        }
        if inner.entries.contains_key(&key) {
            warn!(key = %key, "refusing to overwrite resident bitmap");
            return false;
        }
        if bitmap.is_cached() {
            warn!(key = %key, "bitmap is already resident under another key");
            return false;
        }

        bitmap.set_cached("put", true);
        let accounted = bitmap.byte_size().max(1);
        inner.access_counter += 1;
        let stamp = inner.access_counter;
        inner.current_size += accounted;
        inner.entries.insert(
            key,
            Entry {
                bitmap,
                last_access: stamp,
                accounted_size: accounted,
            },
        );

        Self::evict_to(&mut inner, self.max_size);
        true
    }

    /// Remove and return an entry, clearing its residency
    ///
    /// The bitmap recycles itself if no display holds it anymore.
    pub fn remove(&self, key: &CacheKey) -> Option<Arc<CountedBitmap>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            error!(key = %key, "remove on a closed memory cache");
            return None;
        }
        if inner.disabled {
            warn!(key = %key, "remove on a disabled memory cache");
            return None;
        }

        let entry = inner.entries.remove(key)?;
        inner.current_size -= entry.accounted_size;
        entry.bitmap.set_cached("remove", false);
        Some(entry.bitmap)
    }

    /// Evict according to the graduated pressure level
    ///
    /// `Moderate` and above empties the cache; `Background` and above
    /// shrinks it to half the byte limit; running levels are no-ops.
    /// Safe to call from any thread at any time.
    pub fn trim_memory(&self, level: TrimLevel) {
        let target_bytes = if level.evicts_everything() {
            0
        } else if level.evicts_half() {
            self.max_size / 2
        } else {
            return;
        };

        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            error!(?level, "trim on a closed memory cache");
            return;
        }
        debug!(?level, target_bytes, "trimming memory cache");
        Self::evict_to(&mut inner, target_bytes);
    }

    /// Evict everything, the response to the OS low-memory signal
    pub fn on_low_memory(&self) {
        self.clear();
    }

    /// Evict all entries
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            error!("clear on a closed memory cache");
            return;
        }
        Self::evict_to(&mut inner, 0);
    }

    /// Shut the cache down permanently
    ///
    /// Evicts everything; afterwards every operation is a logged no-op.
    /// A second close is a caller bug and is logged as such.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            error!("memory cache closed twice");
            return;
        }
        info!("closing memory cache");
        Self::evict_to(&mut inner, 0);
        inner.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Reversibly suppress reads and writes
    pub fn set_disabled(&self, disabled: bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.disabled != disabled {
            info!(disabled, "memory cache disabled state changed");
            inner.disabled = disabled;
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.lock().unwrap().disabled
    }

    /// Whether `key` is resident, without touching recency
    pub fn exists(&self, key: &CacheKey) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.closed && !inner.disabled && inner.entries.contains_key(key)
    }

    /// Number of resident bitmaps
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().entries.is_empty()
    }

    /// Resident bytes
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().current_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            entry_count: inner.entries.len(),
            current_bytes: inner.current_size,
            max_bytes: self.max_size,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }

    /// Per-key lock for decode-and-populate critical sections
    ///
    /// Concurrent callers for the same key receive the same instance;
    /// hold the returned `Arc` for the whole critical section.
    pub fn edit_lock_for(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        self.edit_locks.lock_for(key)
    }

    // Evicts least-recently-used entries until `current_size <= target`.
    // Caller holds the cache lock.
    fn evict_to(inner: &mut Inner, target: usize) {
        while inner.current_size > target && !inner.entries.is_empty() {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone());

            if let Some(key) = victim {
                if let Some(entry) = inner.entries.remove(&key) {
                    inner.current_size -= entry.accounted_size;
                    inner.evictions += 1;
                    entry.bitmap.set_cached("evict", false);
                    debug!(key = %key, "evicted bitmap from memory cache");
                }
            } else {
                break;
            }
        }
    }
}

impl MemoryPressureListener for LruMemoryCache {
    fn on_trim_memory(&self, level: TrimLevel) {
        self.trim_memory(level);
    }

    fn on_low_memory(&self) {
        self.clear();
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entry_count: usize,
    pub current_bytes: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::{PixelBuffer, PixelFormat};

    // 400-byte bitmap (10x10 RGBA)
    fn bitmap() -> Arc<CountedBitmap> {
        Arc::new(CountedBitmap::new(PixelBuffer::new(
            10,
            10,
            PixelFormat::Rgba8888,
        )))
    }

    #[test]
    fn test_put_get_roundtrip() {
        let cache = LruMemoryCache::new(1024 * 1024);
        let key = CacheKey::new("a.png");
        let bmp = bitmap();

        assert!(cache.put(key.clone(), bmp.clone()));
        assert!(bmp.is_cached());

        let hit = cache.get(&key).unwrap();
        assert!(Arc::ptr_eq(&hit, &bmp));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.size(), 400);
    }

    #[test]
    fn test_lru_eviction_on_overflow() {
        // room for two 400-byte bitmaps
        let cache = LruMemoryCache::new(1000);
        cache.put(CacheKey::new("a"), bitmap());
        cache.put(CacheKey::new("b"), bitmap());
        cache.put(CacheKey::new("c"), bitmap());

        assert!(cache.get(&CacheKey::new("a")).is_none());
        assert!(cache.get(&CacheKey::new("b")).is_some());
        assert!(cache.get(&CacheKey::new("c")).is_some());
        assert_eq!(cache.size(), 800);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_get_bumps_recency() {
        let cache = LruMemoryCache::new(1000);
        cache.put(CacheKey::new("a"), bitmap());
        cache.put(CacheKey::new("b"), bitmap());

        // touch "a" so "b" becomes the eviction victim
        assert!(cache.get(&CacheKey::new("a")).is_some());
        cache.put(CacheKey::new("c"), bitmap());

        assert!(cache.get(&CacheKey::new("a")).is_some());
        assert!(cache.get(&CacheKey::new("b")).is_none());
        assert!(cache.get(&CacheKey::new("c")).is_some());
    }

    #[test]
    fn test_no_overwrite_on_duplicate_key() {
        let cache = LruMemoryCache::new(1024 * 1024);
        let key = CacheKey::new("a.png");
        let first = bitmap();
        let second = bitmap();

        assert!(cache.put(key.clone(), first.clone()));
        assert!(!cache.put(key.clone(), second.clone()));

        let resident = cache.get(&key).unwrap();
        assert!(Arc::ptr_eq(&resident, &first));
        // the rejected bitmap never became resident
        assert!(!second.is_cached());
    }

    #[test]
    fn test_no_aliasing_under_two_keys() {
        let cache = LruMemoryCache::new(1024 * 1024);
        let bmp = bitmap();
        assert!(cache.put(CacheKey::new("a"), bmp.clone()));
        assert!(!cache.put(CacheKey::new("b"), bmp));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_clears_residency() {
        let cache = LruMemoryCache::new(1024 * 1024);
        let key = CacheKey::new("a.png");
        cache.put(key.clone(), bitmap());

        let removed = cache.remove(&key).unwrap();
        assert!(!removed.is_cached());
        // no holders were left, so the bitmap recycled itself
        assert!(removed.is_recycled());
        assert_eq!(cache.size(), 0);
        assert!(cache.remove(&key).is_none());
    }

    #[test]
    fn test_removed_bitmap_survives_while_held() {
        let cache = LruMemoryCache::new(1024 * 1024);
        let key = CacheKey::new("a.png");
        let bmp = bitmap();
        cache.put(key.clone(), bmp.clone());

        bmp.retain(); // a display picked it up
        cache.remove(&key);
        assert!(!bmp.is_recycled());

        bmp.release();
        assert!(bmp.is_recycled());
    }

    #[test]
    fn test_trim_moderate_evicts_everything() {
        let cache = LruMemoryCache::new(1024 * 1024);
        let bitmaps: Vec<_> = (0..5)
            .map(|i| {
                let bmp = bitmap();
                cache.put(CacheKey::new(format!("img{i}")), bmp.clone());
                bmp
            })
            .collect();

        cache.trim_memory(TrimLevel::Moderate);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.size(), 0);
        for bmp in &bitmaps {
            assert!(!bmp.is_cached());
        }
    }

    #[test]
    fn test_trim_background_halves() {
        // four 400-byte entries, 2000-byte limit, half is 1000
        let cache = LruMemoryCache::new(2000);
        for i in 0..4 {
            cache.put(CacheKey::new(format!("img{i}")), bitmap());
        }
        assert_eq!(cache.size(), 1600);

        cache.trim_memory(TrimLevel::Background);
        assert_eq!(cache.size(), 800);
        // oldest two went first
        assert!(!cache.exists(&CacheKey::new("img0")));
        assert!(!cache.exists(&CacheKey::new("img1")));
        assert!(cache.exists(&CacheKey::new("img2")));
        assert!(cache.exists(&CacheKey::new("img3")));
    }

    #[test]
    fn test_trim_running_level_is_noop() {
        let cache = LruMemoryCache::new(1024 * 1024);
        cache.put(CacheKey::new("a"), bitmap());
        cache.trim_memory(TrimLevel::RunningCritical);
        cache.trim_memory(TrimLevel::UiHidden);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_closed_cache_is_inert() {
        let cache = LruMemoryCache::new(1024 * 1024);
        let key = CacheKey::new("a.png");
        cache.put(key.clone(), bitmap());

        cache.close();
        assert!(cache.is_closed());
        assert_eq!(cache.len(), 0);

        assert!(!cache.put(key.clone(), bitmap()));
        assert!(cache.get(&key).is_none());
        assert!(cache.remove(&key).is_none());
        cache.trim_memory(TrimLevel::Complete);
        cache.clear();
        cache.close(); // caller bug, still must not panic
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_disabled_cache_suppresses_reversibly() {
        let cache = LruMemoryCache::new(1024 * 1024);
        let key = CacheKey::new("a.png");
        cache.put(key.clone(), bitmap());

        cache.set_disabled(true);
        assert!(cache.get(&key).is_none());
        assert!(!cache.put(CacheKey::new("b"), bitmap()));
        assert!(cache.remove(&key).is_none());

        cache.set_disabled(false);
        assert!(cache.get(&key).is_some());
    }

    #[test]
    fn test_recycled_resident_entry_self_heals() {
        let cache = LruMemoryCache::new(1024 * 1024);
        let key = CacheKey::new("a.png");
        let bmp = bitmap();
        cache.put(key.clone(), bmp.clone());

        // a collaborator wrongly clears residency behind the cache's back
        bmp.set_cached("test", false);
        assert!(bmp.is_recycled());

        assert!(cache.get(&key).is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_oversized_entry_does_not_stick() {
        // a single 400-byte bitmap cannot fit a 100-byte cache
        let cache = LruMemoryCache::new(100);
        let bmp = bitmap();
        cache.put(CacheKey::new("big"), bmp.clone());
        assert_eq!(cache.len(), 0);
        assert!(!bmp.is_cached());
    }

    #[test]
    fn test_stats_and_hit_rate() {
        let cache = LruMemoryCache::new(1024 * 1024);
        let key = CacheKey::new("a.png");
        cache.put(key.clone(), bitmap());

        cache.get(&key);
        cache.get(&CacheKey::new("missing"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.current_bytes, 400);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_edit_lock_identity_per_key() {
        let cache = LruMemoryCache::new(1024 * 1024);
        let a = cache.edit_lock_for(&CacheKey::new("img1"));
        let b = cache.edit_lock_for(&CacheKey::new("img1"));
        let c = cache.edit_lock_for(&CacheKey::new("img2"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
