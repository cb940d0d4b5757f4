use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{CacheContents, CacheError, CacheKey, CacheValue};

type ComputationChannel<V> = Shared<oneshot::Receiver<CacheContents<V>>>;

/// An in-flight refresh of a single key.
struct UpdateStatus<V> {
    /// Distinguishes this refresh from a later one of the same key.
    id: u64,
    /// The result slot all followers wait on.
    channel: ComputationChannel<V>,
    /// Set once the refresh is detached, shared with its ticket.
    detached: Arc<AtomicBool>,
}

impl<V> UpdateStatus<V> {
    fn detach(self) {
        self.detached.store(true, Ordering::SeqCst);
    }
}

struct RegistryInner<K, V> {
    statuses: FxHashMap<K, UpdateStatus<V>>,
    next_id: u64,
}

type StatusMap<K, V> = Arc<Mutex<RegistryInner<K, V>>>;

/// Removes the status of refresh `id`, unless it is gone or belongs to another refresh.
fn remove_status<K: CacheKey, V>(statuses: &StatusMap<K, V>, key: &K, id: u64) -> bool {
    let mut inner = statuses.lock();
    match inner.statuses.get(key) {
        Some(status) if status.id == id => {
            inner.statuses.remove(key);
            true
        }
        _ => {
            tracing::trace!(?key, id, "Update status already removed");
            false
        }
    }
}

/// Tracks at most one in-flight refresh per key, and lets concurrent callers join it.
pub struct UpdateStatusRegistry<K, V> {
    name: Arc<str>,
    statuses: StatusMap<K, V>,
}

impl<K, V> fmt::Debug for UpdateStatusRegistry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self
            .statuses
            .try_lock()
            .map(|inner| inner.statuses.len())
            .unwrap_or_default();
        f.debug_struct("UpdateStatusRegistry")
            .field("name", &self.name)
            .field("in-flight refreshes", &in_flight)
            .finish()
    }
}

/// The result of [`UpdateStatusRegistry::begin`].
#[derive(Debug)]
pub enum Begin<K: CacheKey, V: CacheValue> {
    /// The caller started a new refresh and has to compute and settle it.
    Leader(RefreshTicket<K, V>),
    /// Another refresh is already in flight, the caller has to wait for its outcome.
    Follower(SharedOutcome<V>),
}

impl<K: CacheKey, V: CacheValue> UpdateStatusRegistry<K, V> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            statuses: Arc::new(Mutex::new(RegistryInner {
                statuses: FxHashMap::default(),
                next_id: 0,
            })),
        }
    }

    /// Starts a refresh for `key`, or joins the one that is already in flight.
    ///
    /// `base_version` is the store version the caller observed for `key`, see
    /// [`RefreshTicket::base_version`].
    pub fn begin(&self, key: &K, base_version: Option<u64>) -> Begin<K, V> {
        let name = self.name.as_ref();
        let mut inner = self.statuses.lock();

        if let Some(status) = inner.statuses.get(key) {
            // A concurrent refresh was deduplicated.
            metric!(counter("caches.channel.hit") += 1, "cache" => name);
            return Begin::Follower(SharedOutcome {
                channel: status.channel.clone(),
            });
        }
        metric!(counter("caches.channel.miss") += 1, "cache" => name);

        inner.next_id += 1;
        let id = inner.next_id;
        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        let detached = Arc::new(AtomicBool::new(false));
        let status = UpdateStatus {
            id,
            channel,
            detached: Arc::clone(&detached),
        };
        let evicted = inner.statuses.insert(key.clone(), status);
        debug_assert!(evicted.is_none());

        Begin::Leader(RefreshTicket {
            key: key.clone(),
            id,
            base_version,
            sender: Some(sender),
            detached,
            statuses: Arc::clone(&self.statuses),
        })
    }

    /// Removes the status of refresh `id` for `key`.
    ///
    /// This is idempotent: if the status was already removed, or `key` has since been taken
    /// over by another refresh, nothing happens and `false` is returned.
    pub fn remove(&self, key: &K, id: u64) -> bool {
        remove_status(&self.statuses, key, id)
    }

    /// Forgets the in-flight refresh of `key`, if any.
    ///
    /// The refresh itself keeps running and its waiters still receive its outcome, but the
    /// next caller for `key` starts a new refresh instead of joining it. The refresh's ticket
    /// reports [`is_detached`](RefreshTicket::is_detached) from now on.
    pub fn detach(&self, key: &K) -> bool {
        match self.statuses.lock().statuses.remove(key) {
            Some(status) => {
                status.detach();
                true
            }
            None => false,
        }
    }

    /// Forgets all in-flight refreshes, returning how many there were.
    pub fn detach_all(&self) -> usize {
        let mut inner = self.statuses.lock();
        let detached = inner.statuses.len();
        for (_, status) in inner.statuses.drain() {
            status.detach();
        }
        detached
    }

    /// Whether a refresh of `key` is in flight.
    pub fn contains(&self, key: &K) -> bool {
        self.statuses.lock().statuses.contains_key(key)
    }

    /// The number of refreshes in flight.
    pub fn len(&self) -> usize {
        self.statuses.lock().statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handed to the leader of a refresh, which has to [`settle`](Self::settle) it.
///
/// Dropping an unsettled ticket settles it with [`CacheError::Cancelled`], so a leader that
/// is cancelled, times out or panics never leaves its followers hanging.
pub struct RefreshTicket<K: CacheKey, V: CacheValue> {
    key: K,
    id: u64,
    base_version: Option<u64>,
    sender: Option<oneshot::Sender<CacheContents<V>>>,
    detached: Arc<AtomicBool>,
    statuses: StatusMap<K, V>,
}

impl<K: CacheKey, V: CacheValue> fmt::Debug for RefreshTicket<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshTicket")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("base_version", &self.base_version)
            .field("settled", &self.sender.is_none())
            .field("detached", &self.is_detached())
            .finish()
    }
}

impl<K: CacheKey, V: CacheValue> RefreshTicket<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The store version this refresh is based on, `None` if the key was absent.
    ///
    /// The result of the refresh is only written if the store is still at this version.
    pub fn base_version(&self) -> Option<u64> {
        self.base_version
    }

    /// Whether this refresh was detached by an invalidation, so its result must not be stored.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Moves the base of this refresh to a version observed later on.
    pub fn rebase(&mut self, base_version: Option<u64>) {
        self.base_version = base_version;
    }

    /// Delivers `outcome` to every waiter of this refresh, and removes its status.
    pub fn settle(mut self, outcome: CacheContents<V>) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: CacheContents<V>) {
        let Some(sender) = self.sender.take() else {
            return;
        };
        // Remove the status first. This ensures that callers either get a channel that will
        // receive data, or they create a new channel.
        remove_status(&self.statuses, &self.key, self.id);
        // All followers might be gone already, which is fine.
        sender.send(outcome).ok();
    }
}

impl<K: CacheKey, V: CacheValue> Drop for RefreshTicket<K, V> {
    fn drop(&mut self) {
        if self.sender.is_some() {
            tracing::debug!(key = ?self.key, id = self.id, "Refresh was dropped before settling");
            self.finish(Err(CacheError::Cancelled));
        }
    }
}

/// The outcome of an in-flight refresh, shared by all of its followers.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct SharedOutcome<V: CacheValue> {
    channel: ComputationChannel<V>,
}

impl<V: CacheValue> fmt::Debug for SharedOutcome<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedOutcome").finish_non_exhaustive()
    }
}

impl<V: CacheValue> Future for SharedOutcome<V> {
    type Output = CacheContents<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.channel
            .poll_unpin(cx)
            .map(|received| received.unwrap_or(Err(CacheError::Cancelled)))
    }
}
