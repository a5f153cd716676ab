//! Memory Pressure
//!
//! Graduated OS trim levels and a dispatcher that fans them out to the
//! memory cache and bitmap pool. The platform adapter that receives the
//! real OS callbacks lives outside this crate and only needs to hold a
//! `PressureDispatcher`.

use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info};

/// Graduated memory pressure level, mildest first
///
/// Mirrors the platform's ordered trim signals. Levels at `Background`
/// and above mean the process UI is no longer visible; levels at
/// `Moderate` and above mean the process is a candidate for termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TrimLevel {
    /// Running, system moderately loaded
    RunningModerate = 0,
    /// Running, memory getting low
    RunningLow = 1,
    /// Running, memory critically low
    RunningCritical = 2,
    /// UI went to the background
    UiHidden = 3,
    /// Process entered the background LRU list
    Background = 4,
    /// Process is in the middle of the background list
    Moderate = 5,
    /// Process is among the next to be killed
    Complete = 6,
}

impl TrimLevel {
    /// Whether caches should be emptied entirely at this level
    pub fn evicts_everything(&self) -> bool {
        *self >= TrimLevel::Moderate
    }

    /// Whether caches should shrink to half capacity at this level
    pub fn evicts_half(&self) -> bool {
        *self >= TrimLevel::Background
    }
}

/// Component that responds to memory pressure
pub trait MemoryPressureListener: Send + Sync {
    /// Graduated trim signal
    fn on_trim_memory(&self, level: TrimLevel);

    /// Hard low-memory signal, equivalent to a full clear
    fn on_low_memory(&self);
}

/// Fans pressure signals out to registered listeners
///
/// Listeners are held weakly; dropped components are pruned on the next
/// dispatch, so registration never extends a cache's lifetime.
#[derive(Debug, Default)]
pub struct PressureDispatcher {
    listeners: Mutex<Vec<Weak<dyn MemoryPressureListener>>>,
}

impl PressureDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; the dispatcher keeps only a weak reference
    pub fn register(&self, listener: Weak<dyn MemoryPressureListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Dispatch a graduated trim signal to all live listeners
    pub fn notify_trim(&self, level: TrimLevel) {
        info!(?level, "dispatching memory trim");
        for listener in self.live_listeners() {
            listener.on_trim_memory(level);
        }
    }

    /// Dispatch the hard low-memory signal to all live listeners
    pub fn notify_low_memory(&self) {
        info!("dispatching low-memory signal");
        for listener in self.live_listeners() {
            listener.on_low_memory();
        }
    }

    /// Number of listeners still alive
    pub fn listener_count(&self) -> usize {
        self.live_listeners().len()
    }

    // Upgrades live listeners and prunes dead ones. Dispatch happens
    // outside the registry lock.
    fn live_listeners(&self) -> Vec<Arc<dyn MemoryPressureListener>> {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|weak| weak.strong_count() > 0);
        if listeners.len() < before {
            debug!(pruned = before - listeners.len(), "pruned dropped pressure listeners");
        }
        listeners.iter().filter_map(Weak::upgrade).collect()
    }
}
