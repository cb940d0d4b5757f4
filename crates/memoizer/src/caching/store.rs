use std::fmt;
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;

use crate::config::{CacheConfig, EvictionPolicy};

use super::CacheKey;

/// Points in time at which an entry needs to be refreshed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Expiration {
    /// When a background refresh should be started, while still serving the entry.
    pub refresh_at: Option<Instant>,
    /// When the entry becomes stale. `None` if the ttl is out of range of the clock.
    pub expires_at: Option<Instant>,
}

impl Expiration {
    /// The expiration times for a value that was computed just now.
    pub fn for_fresh_value(config: &CacheConfig, now: Instant) -> Self {
        Self {
            refresh_at: config
                .refresh_after
                .and_then(|refresh_after| now.checked_add(refresh_after)),
            expires_at: now.checked_add(config.ttl),
        }
    }
}

/// A snapshot of a value held in the [`EntryStore`].
#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    /// The cached value.
    pub value: V,
    /// When the value was written.
    pub created: Instant,
    /// The refresh and expiry times of the value.
    pub expiration: Expiration,
    /// The store version of this write, strictly increasing over all writes.
    pub version: u64,
}

impl<V> CacheEntry<V> {
    /// Whether the entry may still be served at `now`.
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.expiration
            .expires_at
            .is_none_or(|expires_at| now < expires_at)
    }

    /// Whether the soft refresh point of this entry has been reached.
    pub fn needs_refresh(&self, now: Instant) -> bool {
        self.expiration
            .refresh_at
            .is_some_and(|refresh_at| now >= refresh_at)
    }
}

struct StoreInner<K, V> {
    /// Entries in recency order. Reads promote only under [`EvictionPolicy::Lru`].
    entries: LruCache<K, CacheEntry<V>, FxBuildHasher>,
    /// The last version that was handed out.
    version: u64,
    evictions: u64,
}

/// Holds the cached entries of a single cache.
///
/// Every mutation happens under a single lock, so no insert, removal or eviction ever
/// interleaves with another. The lock is never held across an `.await`.
pub struct EntryStore<K, V> {
    name: String,
    capacity: Option<usize>,
    policy: EvictionPolicy,
    inner: Mutex<StoreInner<K, V>>,
}

impl<K, V> fmt::Debug for EntryStore<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryStore")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<K: CacheKey, V: Clone> EntryStore<K, V> {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            name: config.name.clone(),
            capacity: config.capacity(),
            policy: config.eviction,
            inner: Mutex::new(StoreInner {
                entries: LruCache::unbounded_with_hasher(FxBuildHasher),
                version: 0,
                evictions: 0,
            }),
        }
    }

    /// Returns a copy of the current entry for `key`, marking it as accessed.
    pub fn lookup(&self, key: &K) -> Option<CacheEntry<V>> {
        let mut inner = self.inner.lock();
        let entry = match self.policy {
            EvictionPolicy::Lru => inner.entries.get(key),
            EvictionPolicy::LruUpdated | EvictionPolicy::None => inner.entries.peek(key),
        };
        entry.cloned()
    }

    /// Writes a new value for `key`, if nothing else was written since `base_version`.
    ///
    /// `base_version` is the version the writer observed before computing `value`, or `None`
    /// if the key was absent. If the store has moved on in the meantime, or `superseded`
    /// reports that the key was invalidated while the value was computed, the write is
    /// discarded and `false` is returned. `superseded` is checked under the store lock.
    pub fn insert(
        &self,
        key: K,
        value: V,
        now: Instant,
        expiration: Expiration,
        base_version: Option<u64>,
        superseded: impl FnOnce() -> bool,
    ) -> bool {
        let mut inner = self.inner.lock();

        let current_version = inner.entries.peek(&key).map(|entry| entry.version);
        if current_version != base_version || superseded() {
            tracing::trace!(
                cache = %self.name,
                ?key,
                ?base_version,
                ?current_version,
                "Discarding superseded write"
            );
            metric!(counter("caches.write.discarded") += 1, "cache" => &self.name);
            return false;
        }

        inner.version += 1;
        let entry = CacheEntry {
            value,
            created: now,
            expiration,
            version: inner.version,
        };

        // `put` moves the key to the front, so the new entry is never the eviction victim.
        let is_new = inner.entries.put(key, entry).is_none();
        if is_new {
            self.evict_if_needed(&mut inner);
        }
        self.report_size(&inner);
        true
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.entries.pop(key).is_some();
        self.report_size(&inner);
        removed
    }

    /// Removes all entries, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner.entries.len();
        inner.entries.clear();
        self.report_size(&inner);
        removed
    }

    /// The number of entries currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The total number of entries evicted so far.
    pub fn evictions(&self) -> u64 {
        self.inner.lock().evictions
    }

    /// Evicts the least recently used entries until the store is within its capacity again.
    fn evict_if_needed(&self, inner: &mut StoreInner<K, V>) {
        let Some(capacity) = self.capacity else {
            return;
        };

        while inner.entries.len() > capacity {
            let Some((victim, _)) = inner.entries.pop_lru() else {
                break;
            };
            inner.evictions += 1;

            tracing::debug!(cache = %self.name, key = ?victim, "Evicted cache entry");
            metric!(counter("caches.eviction") += 1, "cache" => &self.name);
        }
    }

    fn report_size(&self, inner: &StoreInner<K, V>) {
        metric!(gauge("caches.entries") = inner.entries.len() as u64, "cache" => &self.name);
    }
}
