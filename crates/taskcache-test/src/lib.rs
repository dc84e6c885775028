//! Helpers for testing the task cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - Producers handed to the cache run on spawned tasks. Helpers that
//!    observe them ([`InvocationCounter`], [`CancellationProbe`]) are backed
//!    by atomics so they can be read from the test body while the producer
//!    runs elsewhere.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `taskcache`
///    crate and mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("taskcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Counts how often producers created from it actually ran.
#[derive(Clone, Debug, Default)]
pub struct InvocationCounter(Arc<AtomicUsize>);

impl InvocationCounter {
    /// Creates a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one invocation; call this at the top of a producer.
    pub fn record(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of invocations recorded so far.
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Observes whether a producer has been torn down.
///
/// Move an [`armed`](Self::armed) guard into a producer that cannot complete
/// on its own; once the producer future is dropped, the probe trips.
#[derive(Clone, Debug, Default)]
pub struct CancellationProbe(Arc<AtomicBool>);

impl CancellationProbe {
    /// Creates an untripped probe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a guard that trips the probe when dropped.
    pub fn armed(&self) -> ProbeGuard {
        ProbeGuard(Arc::clone(&self.0))
    }

    /// Whether the probe has tripped.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Resolves once the probe has tripped.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// Trips its [`CancellationProbe`] when dropped.
#[derive(Debug)]
pub struct ProbeGuard(Arc<AtomicBool>);

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}
