use std::time::Duration;

use thiserror::Error;

/// An error delivered to every subscriber of a task execution.
///
/// This enum is the shared error space between the cache and the producers it
/// runs. The cache itself only ever raises [`Cancelled`](Self::Cancelled);
/// everything else originates in a producer and is forwarded to subscribers
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The task was cancelled before it produced a value.
    ///
    /// Raised for tasks submitted after shutdown, and for all in-flight
    /// subscribers when the cache is shut down forcefully.
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// The requested object does not exist at the remote side.
    #[error("not found")]
    NotFound,
    /// A remote operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// A transfer to or from the remote side failed.
    ///
    /// The attached string contains the remote side's response.
    #[error("transfer failed: {0}")]
    Transfer(String),
    /// An unexpected error in the cache or a producer.
    #[error("internal error")]
    Internal,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    /// Records the error and turns it into [`Internal`](Self::Internal).
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::Internal
    }
}

/// The outcome of a task execution: the produced value, or the error
/// explaining why no value was produced.
pub type TaskResult<V = ()> = Result<V, CacheError>;
