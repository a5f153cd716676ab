//! Bitmap Pool
//!
//! Shape-keyed free-list of recycled pixel buffers awaiting reuse.
//! Reusing a buffer avoids a large allocation on the decode path; only
//! buffers that have fully left the cache and every display are ever
//! offered back, so a pooled buffer is never referenced elsewhere.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tracing::debug;

use crate::bitmap::{BufferShape, PixelBuffer, PixelFormat};
use crate::pressure::{MemoryPressureListener, TrimLevel};

/// Pool of recycled pixel buffers, bucketed by shape
#[derive(Debug)]
pub struct BitmapPool {
    inner: Mutex<Inner>,
    /// Maximum buffers kept per shape bucket
    max_per_shape: usize,
    /// Maximum total bytes kept across all buckets
    max_bytes: usize,
}

#[derive(Debug)]
struct Inner {
    /// Free buffers by shape; oldest at the front
    shelves: HashMap<BufferShape, VecDeque<PixelBuffer>>,
    total_bytes: usize,
    disabled: bool,
    hits: u64,
    misses: u64,
    rejects: u64,
}

impl Default for BitmapPool {
    fn default() -> Self {
        Self::new(32, 64 * 1024 * 1024) // 64 MB default limit
    }
}

impl BitmapPool {
    /// Create a pool with a per-shape buffer cap and a total byte cap
    pub fn new(max_per_shape: usize, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                shelves: HashMap::new(),
                total_bytes: 0,
                disabled: false,
                hits: 0,
                misses: 0,
                rejects: 0,
            }),
            max_per_shape,
            max_bytes,
        }
    }

    /// Get a buffer of the requested shape, reusing a pooled one if present
    ///
    /// A reused buffer is zeroed before it is handed out.
    pub fn get_or_create(&self, width: u32, height: u32, format: PixelFormat) -> PixelBuffer {
        let mut inner = self.inner.lock().unwrap();

        if !inner.disabled {
            let shape = BufferShape::new(width, height, format);
            if let Some(shelf) = inner.shelves.get_mut(&shape) {
                if let Some(mut buffer) = shelf.pop_back() {
                    inner.total_bytes -= buffer.byte_size();
                    inner.hits += 1;
                    buffer.reset();
                    return buffer;
                }
            }
        }

        inner.misses += 1;
        PixelBuffer::new(width, height, format)
    }

    /// Offer a recycled buffer to the pool
    ///
    /// Returns false when the pool is disabled, the buffer is immutable,
    /// or a cap would be exceeded; the buffer is then simply freed. Callers
    /// must treat a false return as the normal end of the buffer's life,
    /// not as an error.
    pub fn try_put(&self, buffer: PixelBuffer) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.disabled {
            inner.rejects += 1;
            return false;
        }
        if !buffer.is_mutable() {
            inner.rejects += 1;
            debug!("immutable buffer is not poolable");
            return false;
        }

        let bytes = buffer.byte_size();
        if bytes == 0 || inner.total_bytes + bytes > self.max_bytes {
            inner.rejects += 1;
            return false;
        }

        let shape = buffer.shape();
        let shelf = inner.shelves.entry(shape).or_default();
        if shelf.len() >= self.max_per_shape {
            inner.rejects += 1;
            return false;
        }

        shelf.push_back(buffer);
        inner.total_bytes += bytes;
        true
    }

    /// Drop pooled buffers according to the graduated pressure level
    pub fn trim_memory(&self, level: TrimLevel) {
        let target_bytes = if level.evicts_everything() {
            0
        } else if level.evicts_half() {
            self.max_bytes / 2
        } else {
            return;
        };

        debug!(?level, target_bytes, "trimming bitmap pool");
        let mut inner = self.inner.lock().unwrap();
        Self::trim_to(&mut inner, target_bytes);
    }

    /// Drop everything, the response to the OS low-memory signal
    pub fn on_low_memory(&self) {
        self.clear();
    }

    /// Drop all pooled buffers
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        Self::trim_to(&mut inner, 0);
    }

    /// Suppress or re-enable pooling
    ///
    /// While disabled, `get_or_create` always allocates and `try_put`
    /// always rejects. Already-pooled buffers are kept.
    pub fn set_disabled(&self, disabled: bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.disabled != disabled {
            debug!(disabled, "bitmap pool disabled state changed");
            inner.disabled = disabled;
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.lock().unwrap().disabled
    }

    /// Total bytes currently pooled
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().total_bytes
    }

    pub fn max_size(&self) -> usize {
        self.max_bytes
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        PoolStats {
            buffer_count: inner.shelves.values().map(VecDeque::len).sum(),
            shelf_count: inner.shelves.len(),
            total_bytes: inner.total_bytes,
            max_bytes: self.max_bytes,
            hits: inner.hits,
            misses: inner.misses,
            rejects: inner.rejects,
        }
    }

    fn trim_to(inner: &mut Inner, target: usize) {
        while inner.total_bytes > target {
            let shape = inner
                .shelves
                .iter()
                .find(|(_, shelf)| !shelf.is_empty())
                .map(|(shape, _)| *shape);
            let Some(shape) = shape else { break };
            if let Some(shelf) = inner.shelves.get_mut(&shape) {
                // oldest buffers go first
                if let Some(buffer) = shelf.pop_front() {
                    inner.total_bytes -= buffer.byte_size();
                }
            }
        }
        inner.shelves.retain(|_, shelf| !shelf.is_empty());
    }
}

impl MemoryPressureListener for BitmapPool {
    fn on_trim_memory(&self, level: TrimLevel) {
        self.trim_memory(level);
    }

    fn on_low_memory(&self) {
        self.clear();
    }
}

/// Pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub buffer_count: usize,
    pub shelf_count: usize,
    pub total_bytes: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub rejects: u64,
}

impl PoolStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
