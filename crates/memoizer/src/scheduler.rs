//! The scheduling capabilities the cache engine depends on.
//!
//! The engine never talks to a concrete async runtime directly. Everything it needs from one
//! (a clock, spawning background work, and sleeping) goes through the [`Scheduler`] trait.
//! Shared result slots are built from the runtime-agnostic primitives in [`futures`].

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use futures::future::{self, BoxFuture, Either};

/// Error returned from [`timeout`] when the deadline elapsed first.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("deadline has elapsed")]
pub struct Elapsed(());

/// Abstracts over the async runtime a [`CacheEngine`](crate::caching::CacheEngine) runs on.
pub trait Scheduler: fmt::Debug + Send + Sync + 'static {
    /// The current point in time, according to this runtime's clock.
    fn now(&self) -> Instant;

    /// Spawns a detached task.
    ///
    /// The task has to make progress without anyone awaiting it.
    fn spawn(&self, task: BoxFuture<'static, ()>);

    /// Returns a future that completes after `duration` has passed.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// A [`Scheduler`] backed by the ambient tokio runtime.
///
/// `spawn` has to be called from within a tokio runtime context. The clock follows
/// [`tokio::time::Instant`], so it can be paused and advanced in tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task);
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Require a `Future` to complete before the specified duration has elapsed.
///
/// If the future completes before the duration has elapsed, then the completed value is returned.
/// Otherwise, an error is returned and the future is dropped.
pub async fn timeout<F: Future>(
    scheduler: &dyn Scheduler,
    duration: Duration,
    f: F,
) -> Result<F::Output, Elapsed> {
    let f = std::pin::pin!(f);
    match future::select(f, scheduler.sleep(duration)).await {
        Either::Left((output, _)) => Ok(output),
        Either::Right(((), _)) => Err(Elapsed(())),
    }
}
