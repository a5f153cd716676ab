//! Reference-Counted Bitmaps
//!
//! Shared-ownership bookkeeping for cached bitmaps. The cache holds one
//! implicit reference while a bitmap is resident (the `cached` flag), and
//! every display holds an explicit reference for the duration of its use.
//! The pixel buffer is recycled exactly once, when the count reaches zero
//! and the bitmap is no longer resident; recycling routes the buffer to
//! the bitmap pool when one was attached at construction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use crate::bitmap::{PixelBuffer, PixelFormat};
use crate::pool::BitmapPool;

/// Error from reading a recycled bitmap
#[derive(Debug, thiserror::Error)]
pub enum BitmapError {
    /// The pixel buffer was recycled; the holder missed an eviction race
    /// and must re-request the image
    #[error("bitmap used after recycle")]
    UsedAfterRecycle,
}

/// Reference-counted wrapper around a decoded pixel buffer
///
/// Displays must call `retain` before reading pixels and `release` when
/// the bitmap leaves the screen; the cache drives the `cached` flag.
#[derive(Debug)]
pub struct CountedBitmap {
    state: Mutex<State>,
    recycled: AtomicBool,
    width: u32,
    height: u32,
    format: PixelFormat,
    byte_size: usize,
    pool: Option<Arc<BitmapPool>>,
}

#[derive(Debug)]
struct State {
    /// Live payload; `None` once recycled
    payload: Option<PixelBuffer>,
    /// Outstanding explicit holders
    ref_count: u32,
    /// Whether the memory cache currently holds this bitmap
    cached: bool,
}

impl CountedBitmap {
    /// Wrap a decoded buffer; the buffer is freed on recycle
    pub fn new(payload: PixelBuffer) -> Self {
        Self::build(payload, None)
    }

    /// Wrap a decoded buffer; the buffer is offered to `pool` on recycle
    pub fn pooled(payload: PixelBuffer, pool: Arc<BitmapPool>) -> Self {
        Self::build(payload, Some(pool))
    }

    fn build(payload: PixelBuffer, pool: Option<Arc<BitmapPool>>) -> Self {
        Self {
            width: payload.width(),
            height: payload.height(),
            format: payload.format(),
            byte_size: payload.byte_size(),
            state: Mutex::new(State {
                payload: Some(payload),
                ref_count: 0,
                cached: false,
            }),
            recycled: AtomicBool::new(false),
            pool,
        }
    }

    /// Take a reference for the duration of a display
    ///
    /// A no-op on a recycled bitmap; the holder must treat the bitmap as
    /// unusable and re-request the image.
    pub fn retain(&self) {
        let mut state = self.state.lock().unwrap();
        if state.payload.is_none() {
            error!("retain on a recycled bitmap");
            return;
        }
        state.ref_count += 1;
    }

    /// Return a reference taken with `retain`
    ///
    /// Recycles the pixel buffer when this was the last reference and the
    /// bitmap is no longer resident in the cache.
    pub fn release(&self) {
        let reclaimed = {
            let mut state = self.state.lock().unwrap();
            if state.ref_count == 0 {
                warn!("release without a matching retain");
                return;
            }
            state.ref_count -= 1;
            self.try_recycle(&mut state)
        };
        self.route_to_pool(reclaimed);
    }

    /// Toggle cache residency; called by the memory cache only
    ///
    /// `caller` tags the transition in logs. Residency counts as a
    /// holder: clearing it on an otherwise unreferenced bitmap recycles
    /// the pixel buffer.
    pub fn set_cached(&self, caller: &str, cached: bool) {
        let reclaimed = {
            let mut state = self.state.lock().unwrap();
            if cached && state.payload.is_none() {
                error!(caller, "marking a recycled bitmap as cached");
                return;
            }
            if state.cached == cached {
                return;
            }
            debug!(caller, cached, "bitmap residency changed");
            state.cached = cached;
            if cached {
                None
            } else {
                self.try_recycle(&mut state)
            }
        };
        self.route_to_pool(reclaimed);
    }

    /// Whether the pixel buffer is gone; check before every read
    pub fn is_recycled(&self) -> bool {
        self.recycled.load(Ordering::Acquire)
    }

    pub fn ref_count(&self) -> u32 {
        self.state.lock().unwrap().ref_count
    }

    pub fn is_cached(&self) -> bool {
        self.state.lock().unwrap().cached
    }

    /// Footprint for cache accounting; 0 once recycled
    pub fn byte_size(&self) -> usize {
        if self.is_recycled() { 0 } else { self.byte_size }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Read the pixels, if the bitmap is still live
    ///
    /// The buffer cannot be recycled while the closure runs.
    pub fn with_pixels<R>(&self, f: impl FnOnce(&PixelBuffer) -> R) -> Result<R, BitmapError> {
        let state = self.state.lock().unwrap();
        match &state.payload {
            Some(buffer) => Ok(f(buffer)),
            None => {
                error!("pixel access on a recycled bitmap");
                Err(BitmapError::UsedAfterRecycle)
            }
        }
    }

    // The single recycle transition. Caller holds the state lock.
    fn try_recycle(&self, state: &mut State) -> Option<PixelBuffer> {
        if state.ref_count == 0 && !state.cached && state.payload.is_some() {
            self.recycled.store(true, Ordering::Release);
            debug!(
                width = self.width,
                height = self.height,
                bytes = self.byte_size,
                "recycling bitmap"
            );
            state.payload.take()
        } else {
            None
        }
    }

    fn route_to_pool(&self, reclaimed: Option<PixelBuffer>) {
        let Some(buffer) = reclaimed else { return };
        if let Some(pool) = &self.pool {
            if !pool.try_put(buffer) {
                debug!("pool rejected recycled buffer, freeing it");
            }
        }
    }
}

impl Drop for CountedBitmap {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        if let Some(buffer) = state.payload.take() {
            if state.ref_count > 0 {
                warn!(
                    ref_count = state.ref_count,
                    "bitmap dropped with outstanding references"
                );
            }
            self.recycled.store(true, Ordering::Relaxed);
            if let Some(pool) = &self.pool {
                pool.try_put(buffer);
            }
        }
    }
}
