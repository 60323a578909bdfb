//! Response cache keyed by query name.
//!
//! Holds the last complete frame returned by an upstream for each name.
//! Entries never expire; they are replaced by the next upstream answer for
//! the same name or removed with [`ResponseCache::delete`].

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use crate::error::{ProxyError, Result};
use crate::frame::Frame;

/// In-memory response cache
#[derive(Default)]
pub struct ResponseCache {
    records: RwLock<HashMap<String, Frame>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `frame` under `name`, replacing any previous entry
    pub fn put(&self, name: &str, frame: Frame) -> Result<()> {
        if frame.body().is_empty() {
            return Err(ProxyError::EmptyPayload);
        }

        let len = frame.wire_len();
        self.records.write().insert(name.to_string(), frame);
        trace!("Cached {} ({} bytes)", name, len);
        Ok(())
    }

    /// Look up the frame stored for `name`
    pub fn get(&self, name: &str) -> Result<Frame> {
        let found = self.records.read().get(name).cloned();

        match found {
            Some(frame) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!("Cache HIT: {}", name);
                Ok(frame)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!("Cache MISS: {}", name);
                Err(ProxyError::NotFound(name.to_string()))
            }
        }
    }

    /// Snapshot of the cached names
    pub fn list_names(&self) -> HashSet<String> {
        self.records.read().keys().cloned().collect()
    }

    /// Remove `name`; absent names are ignored
    pub fn delete(&self, name: &str) {
        if self.records.write().remove(name).is_some() {
            trace!("Evicted {}", name);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.records.read().len() as u64,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

impl CacheStats {
    /// Calculate hit rate percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}
