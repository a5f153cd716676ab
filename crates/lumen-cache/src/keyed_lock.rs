//! Per-Key Edit Locks
//!
//! Advisory locks handed to the decode layer so at most one
//! decode-and-populate runs per cache key. The registry stores only weak
//! references: a key's lock lives exactly as long as some caller holds
//! it, so idle keys never pin memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::key::CacheKey;

/// Registry of per-key mutual-exclusion locks
#[derive(Debug, Default)]
pub struct KeyedLockRegistry {
    locks: Mutex<HashMap<CacheKey, Weak<Mutex<()>>>>,
}

impl KeyedLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock object for `key`, shared by every concurrent caller
    ///
    /// Creation on miss happens under the registry lock, so two callers
    /// racing on an absent key always receive the same instance. Holders
    /// keep the returned `Arc` for the whole critical section; once every
    /// holder drops it, the entry becomes collectable.
    pub fn lock_for(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        if let Some(existing) = locks.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        let fresh = Arc::new(Mutex::new(()));
        locks.insert(key.clone(), Arc::downgrade(&fresh));
        locks.retain(|_, weak| weak.strong_count() > 0);
        fresh
    }

    /// Number of keys whose lock is currently held somewhere
    pub fn live_count(&self) -> usize {
        self.locks
            .lock()
            .unwrap()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
