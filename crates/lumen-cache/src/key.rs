//! Cache Keys
//!
//! Opaque string keys identifying one decoded-and-processed image variant.

use std::fmt;
use std::sync::Arc;

/// Key for one decoded-and-processed image variant
///
/// Two distinct images must never share a key; the cache relies on key
/// equality to decide residency. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// Key for an image at its original size
    pub fn original(source: &str) -> Self {
        Self::new(source)
    }

    /// Key for an image decoded at a target size
    pub fn sized(source: &str, width: u32, height: u32) -> Self {
        Self::new(format!("{source}@{width}x{height}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}
