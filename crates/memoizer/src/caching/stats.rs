use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// A point-in-time snapshot of a cache's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Accesses that were served a fresh value without waiting.
    pub hits: u64,
    /// Accesses that had to wait for a refresh, either leading or following it.
    pub misses: u64,
    /// Refreshes that did not produce a value.
    pub errors: u64,
    /// Entries removed to stay within the configured `max_size`.
    pub evictions: u64,
}

#[derive(Debug, Default)]
pub(super) struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl StatsCounters {
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, evictions: u64) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            evictions,
        }
    }
}
