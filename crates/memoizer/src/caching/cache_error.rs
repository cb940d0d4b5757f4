use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// An error that happens when a value could not be served from the cache.
///
/// This error is broadcast to the leader of a refresh and to every caller waiting on it,
/// which is why it is [`Clone`]. It is never persisted in the cache.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The producer failed to compute a value.
    ///
    /// The attached error is exactly what the producer returned, shared between all callers
    /// of the same refresh.
    #[error("producer failed: {0}")]
    ProducerFailed(Arc<anyhow::Error>),
    /// The producer did not finish within the configured `producer_timeout`.
    #[error("producer timed out after {0:?}")]
    Timeout(Duration),
    /// The call leading the refresh was dropped before the producer finished.
    #[error("refresh was cancelled")]
    Cancelled,
    /// The cache was shut down while the caller was waiting, or before it was called.
    #[error("cache is shutting down")]
    Shutdown,
}

impl CacheError {
    /// Wraps an arbitrary producer error.
    pub fn producer<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::ProducerFailed(Arc::new(err.into()))
    }

    /// Returns the original producer error, if this is a [`ProducerFailed`](Self::ProducerFailed).
    pub fn producer_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::ProducerFailed(err) => Some(err),
            _ => None,
        }
    }

    /// A short, static name of the error kind, used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::ProducerFailed(_) => "producer",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Two errors are equal when they are of the same kind and, for producer failures, when they
/// originate from the very same refresh.
impl PartialEq for CacheError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ProducerFailed(a), Self::ProducerFailed(b)) => Arc::ptr_eq(a, b),
            (Self::Timeout(a), Self::Timeout(b)) => a == b,
            (Self::Cancelled, Self::Cancelled) => true,
            (Self::Shutdown, Self::Shutdown) => true,
            _ => false,
        }
    }
}

/// The outcome of a cache access: either the value or the reason it could not be provided.
pub type CacheContents<T> = Result<T, CacheError>;
