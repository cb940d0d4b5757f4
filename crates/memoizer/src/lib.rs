//! A stampede-safe, self-refreshing in-memory cache.
//!
//! See [`caching::CacheEngine`] for the entry point.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod scheduler;
