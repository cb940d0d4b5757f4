//! The stampede-safe, self-refreshing in-memory cache.
//!
//! A [`CacheEngine`] is asked for a value by key, together with a producer that can compute
//! the value. Fresh values are served right away. Missing or expired values are computed by
//! exactly one caller, the leader, while all concurrent callers for the same key wait for the
//! leader's outcome:
//!
//! - The [`EntryStore`] holds the computed values and only accepts writes based on the current
//!   version of a key.
//! - The [`UpdateStatusRegistry`] tracks the single in-flight refresh per key.
//! - The [`CacheEngine`] ties both together.

use std::fmt;
use std::hash::Hash;

mod cache_error;
mod engine;
mod registry;
mod stats;
mod store;

pub use cache_error::{CacheContents, CacheError};
pub use engine::CacheEngine;
pub use registry::{Begin, RefreshTicket, SharedOutcome, UpdateStatusRegistry};
pub use stats::CacheStats;
pub use store::{CacheEntry, EntryStore, Expiration};

/// The key a value is cached under.
///
/// Deduplication of concurrent refreshes relies on this contract: two keys that compare equal
/// must also hash identically, and equality must not change while the key is in the cache.
/// This is implemented for every type satisfying the bounds.
pub trait CacheKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// A value that can be cached.
///
/// Callers always receive clones, so values that are expensive to clone should be wrapped in
/// an `Arc`.
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}
