//! Helpers for testing the cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Use a paused tokio clock (`#[tokio::test(start_paused = true)]`) whenever a test depends
//!    on ttls or producer delays. The cache reads time through tokio, so ttls expire
//!    deterministically when the clock is advanced.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `memoizer` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("memoizer=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// The future returned by [`Producer::produce`].
pub type ProducerFuture = Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>>;

/// A producer that counts its invocations.
///
/// Each invocation sleeps for the configured delay and then yields `"{key}-{n}"`, where `n` is
/// the number of the invocation starting at `1`. Clones share their counter.
#[derive(Clone, Debug, Default)]
pub struct Producer {
    calls: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
    delay: Duration,
}

impl Producer {
    /// Creates a producer that takes `delay` to compute a value.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// Makes all following invocations fail, or succeed again.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// The number of times this producer was invoked so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Returns a closure to hand to the cache.
    pub fn produce<K>(&self) -> impl FnOnce(K) -> ProducerFuture + Send + 'static
    where
        K: fmt::Display + Send + 'static,
    {
        let producer = self.clone();
        move |key| -> ProducerFuture {
            let call = producer.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                tokio::time::sleep(producer.delay).await;
                if producer.failing.load(Ordering::SeqCst) {
                    anyhow::bail!("failed to produce {key}");
                }
                Ok(format!("{key}-{call}"))
            })
        }
    }
}
