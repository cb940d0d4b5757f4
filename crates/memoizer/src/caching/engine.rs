use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{self, Either, Shared};
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};

use crate::config::CacheConfig;
use crate::scheduler::{self, Scheduler, TokioScheduler};

use super::registry::{Begin, RefreshTicket, SharedOutcome, UpdateStatusRegistry};
use super::stats::{CacheStats, StatsCounters};
use super::store::{EntryStore, Expiration};
use super::{CacheContents, CacheError, CacheKey, CacheValue};

/// Wakes up everyone waiting on a cache once it shuts down.
struct ShutdownSignal {
    trigger: Mutex<Option<oneshot::Sender<()>>>,
    signal: Shared<oneshot::Receiver<()>>,
}

impl ShutdownSignal {
    fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            trigger: Mutex::new(Some(sender)),
            signal: receiver.shared(),
        }
    }

    fn is_triggered(&self) -> bool {
        self.trigger.lock().is_none()
    }

    /// Triggers the signal, returning `false` if it was triggered before.
    fn trigger(&self) -> bool {
        match self.trigger.lock().take() {
            Some(sender) => {
                sender.send(()).ok();
                true
            }
            None => false,
        }
    }

    /// Resolves once the signal is triggered.
    fn wait(&self) -> Shared<oneshot::Receiver<()>> {
        self.signal.clone()
    }
}

struct EngineInner<K, V> {
    config: CacheConfig,
    store: EntryStore<K, V>,
    registry: UpdateStatusRegistry<K, V>,
    scheduler: Arc<dyn Scheduler>,
    counters: StatsCounters,
    shutdown: ShutdownSignal,
}

/// A self-refreshing in-memory cache.
///
/// Values are computed by a producer that is supplied with every call to [`get`](Self::get).
/// Concurrent calls for a missing or expired key are deduplicated, so the producer runs at most
/// once per key at any time and all callers receive the same outcome.
///
/// The engine is cheap to clone, all clones share the same entries.
pub struct CacheEngine<K, V> {
    inner: Arc<EngineInner<K, V>>,
}

impl<K: CacheKey, V: CacheValue> fmt::Debug for CacheEngine<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEngine")
            .field("config", &self.inner.config)
            .field("entries", &self.inner.store.len())
            .field("registry", &self.inner.registry)
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

impl<K, V> Clone for CacheEngine<K, V> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey, V: CacheValue> CacheEngine<K, V> {
    /// Creates a new, empty cache running on the given `scheduler`.
    pub fn new(config: CacheConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        let store = EntryStore::new(&config);
        let registry = UpdateStatusRegistry::new(&config.name);
        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                registry,
                scheduler,
                counters: StatsCounters::default(),
                shutdown: ShutdownSignal::new(),
            }),
        }
    }

    /// Creates a new, empty cache running on the ambient tokio runtime.
    pub fn with_tokio(config: CacheConfig) -> Self {
        Self::new(config, Arc::new(TokioScheduler))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Returns the value for `key`, computing it with `producer` if necessary.
    ///
    /// A fresh value is returned immediately, without suspending and without calling
    /// `producer`. Otherwise the call either computes the value itself, or waits for the
    /// refresh of `key` that is already in flight and returns its outcome. A stale value is
    /// never returned.
    ///
    /// If a `refresh_after` point is configured and has been reached, the fresh value is
    /// returned and a refresh is started in the background.
    ///
    /// # Errors
    ///
    /// Producer failures are not cached. They are returned to every caller waiting on the
    /// refresh, and the next call will try again.
    pub async fn get<F, Fut, E>(&self, key: K, producer: F) -> CacheContents<V>
    where
        F: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let inner = &self.inner;
        metric!(counter("caches.access") += 1, "cache" => self.name());

        if inner.shutdown.is_triggered() {
            return Err(CacheError::Shutdown);
        }

        let now = inner.scheduler.now();
        let base_version = match inner.store.lookup(&key) {
            Some(entry) if entry.is_fresh(now) => {
                inner.counters.hit();
                metric!(counter("caches.memory.hit") += 1, "cache" => self.name());

                if entry.needs_refresh(now) {
                    self.spawn_refresh(key, entry.version, producer);
                }
                return Ok(entry.value);
            }
            Some(entry) => Some(entry.version),
            None => None,
        };

        inner.counters.miss();
        metric!(counter("caches.memory.miss") += 1, "cache" => self.name());

        self.refresh_from(key, base_version, producer, false).await
    }

    /// Computes a new value for `key`, even if the current one is still fresh.
    ///
    /// If a refresh of `key` is already in flight, this waits for its outcome instead.
    pub async fn refresh<F, Fut, E>(&self, key: K, producer: F) -> CacheContents<V>
    where
        F: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let inner = &self.inner;
        metric!(counter("caches.access") += 1, "cache" => self.name());

        if inner.shutdown.is_triggered() {
            return Err(CacheError::Shutdown);
        }

        inner.counters.miss();
        metric!(counter("caches.memory.miss") += 1, "cache" => self.name());

        let base_version = inner.store.lookup(&key).map(|entry| entry.version);
        self.refresh_from(key, base_version, producer, true).await
    }

    /// Removes the value for `key`, returning whether there was one.
    ///
    /// A refresh of `key` that is in flight is not cancelled, and its waiters still receive its
    /// outcome. It is however forgotten, so the next call for `key` computes a new value
    /// instead of joining it. The forgotten refresh never writes its result, so a value computed
    /// before the invalidation can not replace one computed after it.
    pub fn invalidate(&self, key: &K) -> bool {
        let inner = &self.inner;
        // Detach first. A refresh that writes after the removal then sees its detached flag.
        let detached = inner.registry.detach(key);
        let removed = inner.store.remove(key);

        tracing::debug!(cache = self.name(), ?key, removed, detached, "Invalidated cache entry");
        removed
    }

    /// Removes all values, returning how many there were.
    ///
    /// In-flight refreshes are treated as in [`invalidate`](Self::invalidate).
    pub fn invalidate_all(&self) -> usize {
        let inner = &self.inner;
        let detached = inner.registry.detach_all();
        let removed = inner.store.clear();

        tracing::debug!(cache = self.name(), removed, detached, "Invalidated all cache entries");
        removed
    }

    /// Shuts down the cache.
    ///
    /// Every caller waiting on a refresh is woken up with [`CacheError::Shutdown`], and all
    /// further calls fail with it. Running producers are dropped if `cancel_on_shutdown` is
    /// configured, and otherwise run to completion.
    pub fn shutdown(&self) {
        if self.inner.shutdown.trigger() {
            tracing::info!(
                cache = self.name(),
                in_flight = self.inner.registry.len(),
                "Shutting down cache"
            );
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.counters.snapshot(self.inner.store.evictions())
    }

    /// The number of values currently held.
    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// The number of refreshes currently in flight.
    pub fn refreshes_in_flight(&self) -> usize {
        self.inner.registry.len()
    }

    /// Starts or joins a blocking refresh of `key`.
    ///
    /// `base_version` is the version of the stale entry the caller saw, if any. Unless the
    /// refresh is `forced`, a fresh entry written since then is returned as is.
    async fn refresh_from<F, Fut, E>(
        &self,
        key: K,
        base_version: Option<u64>,
        producer: F,
        forced: bool,
    ) -> CacheContents<V>
    where
        F: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let inner = &self.inner;
        let mut ticket = match inner.registry.begin(&key, base_version) {
            Begin::Leader(ticket) => ticket,
            Begin::Follower(outcome) => return self.follow(outcome).await,
        };

        // Another refresh may have finished between the lookup and `begin`.
        let current = inner.store.lookup(&key);
        let current_version = current.as_ref().map(|entry| entry.version);
        if current_version != base_version {
            let now = inner.scheduler.now();
            if let Some(current) = current.filter(|entry| !forced && entry.is_fresh(now)) {
                ticket.settle(Ok(current.value.clone()));
                return Ok(current.value);
            }
            ticket.rebase(current_version);
        }

        self.lead(ticket, producer, false).await
    }

    /// Waits for the outcome of a refresh led by someone else.
    async fn follow(&self, outcome: SharedOutcome<V>) -> CacheContents<V> {
        match future::select(outcome, self.inner.shutdown.wait()).await {
            Either::Left((contents, _)) => contents,
            Either::Right(_) => Err(CacheError::Shutdown),
        }
    }

    /// Runs the producer for a refresh this caller leads, and settles the refresh.
    ///
    /// The `is_refresh` flag is only used to tag metrics.
    async fn lead<F, Fut, E>(
        &self,
        ticket: RefreshTicket<K, V>,
        producer: F,
        is_refresh: bool,
    ) -> CacheContents<V>
    where
        F: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let inner = &self.inner;
        let name = self.name();
        metric!(
            counter("caches.computation") += 1,
            "cache" => name,
            "is_refresh" => &is_refresh.to_string(),
        );
        tracing::trace!(cache = name, key = ?ticket.key(), is_refresh, "Computing cache value");

        let started = inner.scheduler.now();
        let computation = producer(ticket.key().clone())
            .map(|result| result.map_err(CacheError::producer));
        let computation = async {
            match inner.config.producer_timeout {
                Some(duration) => scheduler::timeout(&*inner.scheduler, duration, computation)
                    .await
                    .unwrap_or(Err(CacheError::Timeout(duration))),
                None => computation.await,
            }
        };
        let contents = if inner.config.cancel_on_shutdown {
            match future::select(pin!(computation), inner.shutdown.wait()).await {
                Either::Left((contents, _)) => contents,
                Either::Right(_) => Err(CacheError::Shutdown),
            }
        } else {
            computation.await
        };

        let now = inner.scheduler.now();
        metric!(
            timer("caches.computation.duration") = now.saturating_duration_since(started),
            "cache" => name,
        );

        match &contents {
            Ok(value) => {
                let expiration = Expiration::for_fresh_value(&inner.config, now);
                let written = inner.store.insert(
                    ticket.key().clone(),
                    value.clone(),
                    now,
                    expiration,
                    ticket.base_version(),
                    || ticket.is_detached(),
                );
                tracing::debug!(cache = name, key = ?ticket.key(), written, "Refreshed cache value");
            }
            Err(err) => {
                inner.counters.error();
                metric!(
                    counter("caches.computation.error") += 1,
                    "cache" => name,
                    "error" => err.metrics_tag(),
                );
                tracing::debug!(
                    cache = name,
                    key = ?ticket.key(),
                    error = err as &dyn std::error::Error,
                    "Failed to refresh cache value"
                );
            }
        }

        ticket.settle(contents.clone());
        contents
    }

    /// Refreshes `key` in the background, unless a refresh is already in flight.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the
    /// refresh, which nobody is going to `await`.
    fn spawn_refresh<F, Fut, E>(&self, key: K, version: u64, producer: F)
    where
        F: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let ticket = match self.inner.registry.begin(&key, Some(version)) {
            Begin::Leader(ticket) => ticket,
            // The running refresh will update the entry.
            Begin::Follower(_) => return,
        };

        metric!(counter("caches.lazy_refresh") += 1, "cache" => self.name());
        tracing::trace!(cache = self.name(), ?key, "Spawning deduplicated background refresh");

        let this = self.clone();
        let task = async move {
            this.lead(ticket, producer, true).await.ok();
        };
        self.inner
            .scheduler
            .spawn(Box::pin(task.bind_hub(Hub::new_from_top(Hub::current()))));
    }
}
