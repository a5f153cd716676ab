//! lumen-loader - Decode Coordination
//!
//! The layer between decode workers and the memory cache. Serializes
//! decode-and-populate per cache key so concurrent requests for the same
//! image decode at most once, and routes decode buffers through the
//! bitmap pool to avoid reallocation.

use std::sync::Arc;

use tracing::debug;

use lumen_cache::{BitmapPool, CacheKey, CountedBitmap, LruMemoryCache, PixelBuffer};

/// Error from a decode attempt
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The decoder failed to produce a bitmap
    #[error("decode failed: {0}")]
    Decode(String),
    /// The request was cancelled before a bitmap was produced
    #[error("load cancelled")]
    Cancelled,
}

/// Coordinates cache lookups and single-flight decodes
///
/// Cache and pool are owned by the image-loading context and shared with
/// every collaborator by reference; the loader holds no other state.
pub struct BitmapLoader {
    cache: Arc<LruMemoryCache>,
    pool: Arc<BitmapPool>,
}

impl BitmapLoader {
    pub fn new(cache: Arc<LruMemoryCache>, pool: Arc<BitmapPool>) -> Self {
        Self { cache, pool }
    }

    pub fn cache(&self) -> &Arc<LruMemoryCache> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<BitmapPool> {
        &self.pool
    }

    /// Fetch `key` from the cache, decoding at most once across all
    /// concurrent callers for the same key
    ///
    /// The decode callback may claim a buffer from the pool. It runs
    /// under the key's edit lock but never under the cache's own lock,
    /// so decodes for different keys proceed in parallel. On failure or
    /// cancellation the lock is released and no cache entry is left
    /// behind; the next caller for the key simply decodes again.
    pub fn get_or_decode<F>(
        &self,
        key: &CacheKey,
        decode: F,
    ) -> Result<Arc<CountedBitmap>, LoadError>
    where
        F: FnOnce(&BitmapPool) -> Result<PixelBuffer, LoadError>,
    {
        if let Some(hit) = self.cache.get(key) {
            return Ok(hit);
        }

        let edit_lock = self.cache.edit_lock_for(key);
        let _guard = edit_lock.lock().unwrap();

        // a racing caller may have populated the entry while we waited
        if let Some(hit) = self.cache.get(key) {
            debug!(key = %key, "cache hit after waiting on edit lock");
            return Ok(hit);
        }

        let buffer = decode(&self.pool)?;
        let bitmap = Arc::new(CountedBitmap::pooled(buffer, self.pool.clone()));
        if !self.cache.put(key.clone(), bitmap.clone()) {
            // a closed or disabled cache still serves this caller; the
            // bitmap just lives only as long as its holders
            debug!(key = %key, "decoded bitmap was not cached");
        }
        Ok(bitmap)
    }
}
