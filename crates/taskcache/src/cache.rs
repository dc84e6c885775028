use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{AbortHandle, AbortRegistration, Abortable};
use parking_lot::Mutex;

use crate::error::{CacheError, TaskResult};
use crate::handle::{TaskHandle, TerminationHandle};
use crate::utils::DropHook;

/// Lifecycle of the cache. Only ever advances.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    /// Accepting new tasks.
    Active,
    /// Shutdown was requested; in-flight executions are draining.
    PendingShutdown,
    /// Shutdown was requested and nothing is in flight anymore.
    Shutdown,
}

/// One subscriber of an in-flight execution.
struct Observer<V> {
    id: u64,
    sender: oneshot::Sender<TaskResult<V>>,
}

/// Bookkeeping for one in-flight producer.
///
/// An execution is alive exactly as long as it is reachable through the
/// in-progress table; removal, outcome broadcast and cancellation all happen
/// under the cache lock, so nothing can attach to a torn-down execution.
struct Execution<V> {
    /// Distinguishes this execution from later ones under the same key.
    id: u64,
    /// Live subscribers in subscription order.
    observers: Vec<Observer<V>>,
    /// Cancels the spawned producer.
    abort_handle: AbortHandle,
}

struct Inner<K, V> {
    lifecycle: Lifecycle,
    finished: HashMap<K, V>,
    in_progress: HashMap<K, Execution<V>>,
    /// FIFO; the ids allow deregistration when a handle is dropped early.
    termination_waiters: Vec<(u64, oneshot::Sender<()>)>,
    next_id: u64,
}

impl<K, V> Inner<K, V> {
    fn fresh_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Flips to `Shutdown` and fires the registered waiters, in registration
    /// order, once shutdown was requested and nothing is in flight anymore.
    fn maybe_notify_termination(&mut self) {
        if self.lifecycle == Lifecycle::PendingShutdown && self.in_progress.is_empty() {
            self.lifecycle = Lifecycle::Shutdown;

            tracing::trace!(
                waiters = self.termination_waiters.len(),
                "task cache terminated"
            );

            for (_, waiter) in self.termination_waiters.drain(..) {
                waiter.send(()).ok();
            }
        }
    }
}

/// A cache which deduplicates the executions and memoizes the results of
/// asynchronous tasks.
///
/// Every task is identified by a key. Submitting a task whose key is already
/// executing joins the in-flight execution instead of starting a second one;
/// a key that already finished successfully is served from memory without
/// consulting the producer at all. All subscribers of one execution observe
/// the same outcome, in subscription order. Passing `force` to
/// [`execute`](Self::execute) discards a memoized value and re-runs the task.
///
/// All bookkeeping lives behind a single cache-wide mutex. The critical
/// sections only move bookkeeping around and never run producer code, which
/// keeps the one coarse lock both correct and cheap: looking up or inserting
/// an execution and attaching a subscriber to it happen atomically, so a
/// producer can never be started twice, and a subscriber can never race the
/// teardown of an execution it is about to join.
///
/// Producers are spawned onto the current Tokio runtime, so a task makes
/// progress even when its [`TaskHandle`] is not polled. Dropping a handle
/// gives up the subscription; an execution whose last subscriber is gone is
/// cancelled without delivering an outcome.
///
/// The cache is cheap to clone; clones share the same state.
pub struct TaskCache<K, V> {
    inner: Arc<Mutex<Inner<K, V>>>,
}

impl<K, V> Clone for TaskCache<K, V> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        TaskCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Default for TaskCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for TaskCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(inner) => f
                .debug_struct("TaskCache")
                .field("lifecycle", &inner.lifecycle)
                .field("finished", &inner.finished.len())
                .field("in_progress", &inner.in_progress.len())
                .finish(),
            None => f.debug_struct("TaskCache").finish_non_exhaustive(),
        }
    }
}

impl<K, V> TaskCache<K, V> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        TaskCache {
            inner: Arc::new(Mutex::new(Inner {
                lifecycle: Lifecycle::Active,
                finished: HashMap::new(),
                in_progress: HashMap::new(),
                termination_waiters: Vec::new(),
                next_id: 0,
            })),
        }
    }
}

impl<K, V> TaskCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Submits a task under `key` unless it already finished.
    ///
    /// Shorthand for [`execute`](Self::execute) without `force`.
    pub fn execute_if_not<F>(&self, key: K, producer: F) -> TaskHandle<V>
    where
        F: Future<Output = TaskResult<V>> + Send + 'static,
    {
        self.execute(key, producer, false)
    }

    /// Submits a task under `key`.
    ///
    /// If a memoized value exists and `force` is `false`, the returned handle
    /// resolves with it immediately and `producer` is dropped unpolled. If an
    /// execution for `key` is already in flight, the handle joins it and
    /// `producer` is not started a second time. Otherwise any memoized value
    /// is discarded and `producer` starts on the current runtime.
    ///
    /// Once [`shutdown`](Self::shutdown) was called, every new handle
    /// resolves with [`CacheError::Cancelled`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn execute<F>(&self, key: K, producer: F, force: bool) -> TaskHandle<V>
    where
        F: Future<Output = TaskResult<V>> + Send + 'static,
    {
        let mut inner = self.inner.lock();

        if inner.lifecycle != Lifecycle::Active {
            return TaskHandle::ready(Err(CacheError::Cancelled(
                "cache already shut down".into(),
            )));
        }

        if !force {
            if let Some(value) = inner.finished.get(&key) {
                return TaskHandle::ready(Ok(value.clone()));
            }
        }

        inner.finished.remove(&key);

        let in_flight = inner.in_progress.get(&key).map(|execution| execution.id);
        let execution_id = match in_flight {
            Some(id) => {
                tracing::trace!("joining in-flight task execution");
                id
            }
            None => {
                let id = inner.fresh_id();
                let (abort_handle, abort_registration) = AbortHandle::new_pair();
                let evicted = inner.in_progress.insert(
                    key.clone(),
                    Execution {
                        id,
                        observers: Vec::new(),
                        abort_handle,
                    },
                );
                debug_assert!(evicted.is_none());

                // Spawning inside the critical section is what makes the
                // lookup-or-start step atomic with respect to concurrent
                // submitters and cancelling subscribers.
                self.spawn_driver(key.clone(), id, producer, abort_registration);
                id
            }
        };

        let observer_id = inner.fresh_id();
        let (sender, receiver) = oneshot::channel();
        inner
            .in_progress
            .get_mut(&key)
            .expect("in-flight execution vanished under the cache lock")
            .observers
            .push(Observer {
                id: observer_id,
                sender,
            });

        let dispose = {
            let cache = Arc::clone(&self.inner);
            DropHook::new(move || dispose_subscription(&cache, &key, execution_id, observer_id))
        };

        TaskHandle::subscribed(receiver, dispose)
    }

    /// Drives one producer on the current Tokio runtime and settles the
    /// execution with its outcome.
    fn spawn_driver<F>(
        &self,
        key: K,
        execution_id: u64,
        producer: F,
        abort_registration: AbortRegistration,
    ) where
        F: Future<Output = TaskResult<V>> + Send + 'static,
    {
        let cache = Arc::clone(&self.inner);

        // Settles with an internal error if the producer unwinds without
        // signalling an outcome, so subscribers are never left hanging.
        let settle_token = {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            DropHook::new(move || settle(&cache, &key, execution_id, Err(CacheError::Internal)))
        };

        let producer = Abortable::new(producer, abort_registration);
        tokio::spawn(async move {
            let _settle_token = settle_token;
            if let Ok(outcome) = producer.await {
                settle(&cache, &key, execution_id, outcome);
            }
            // On abort, the cancelling side has already torn the execution
            // down under the lock.
        });
    }

    /// Snapshot of the keys whose tasks finished successfully.
    pub fn finished_tasks(&self) -> HashSet<K> {
        self.inner.lock().finished.keys().cloned().collect()
    }

    /// Snapshot of the keys whose tasks are still executing.
    pub fn in_progress_tasks(&self) -> HashSet<K> {
        self.inner.lock().in_progress.keys().cloned().collect()
    }

    /// Number of live subscriptions on the in-flight execution for `key`,
    /// or `0` if there is none.
    pub fn subscriber_count(&self, key: &K) -> usize {
        let inner = self.inner.lock();
        inner
            .in_progress
            .get(key)
            .map_or(0, |execution| execution.observers.len())
    }

    /// Starts a graceful shutdown.
    ///
    /// In-flight executions keep running to their natural outcome while new
    /// tasks are rejected with [`CacheError::Cancelled`]. Idempotent.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        if inner.lifecycle == Lifecycle::Active {
            tracing::trace!("task cache draining");
            inner.lifecycle = Lifecycle::PendingShutdown;
            inner.maybe_notify_termination();
        }
    }

    /// Shuts down forcefully.
    ///
    /// Every in-flight producer is cancelled and its subscribers resolve
    /// with [`CacheError::Cancelled`]. The cache has reached its terminal
    /// state by the time this returns: cancellation and removal happen in
    /// one critical section, after which nothing is left to wait for.
    /// Idempotent.
    pub fn shutdown_now(&self) {
        let mut inner = self.inner.lock();

        if inner.lifecycle == Lifecycle::Active {
            inner.lifecycle = Lifecycle::PendingShutdown;
        }

        if inner.lifecycle == Lifecycle::PendingShutdown {
            tracing::trace!(
                cancelled = inner.in_progress.len(),
                "task cache shut down forcefully"
            );

            for (_, execution) in inner.in_progress.drain() {
                execution.abort_handle.abort();
                for observer in execution.observers {
                    observer
                        .sender
                        .send(Err(CacheError::Cancelled("cancelled".into())))
                        .ok();
                }
            }

            inner.maybe_notify_termination();
        }
    }

    /// Returns a handle resolving once the cache has fully shut down, that
    /// is, shutdown was requested and no execution remains in flight.
    ///
    /// Resolves immediately if that point has already been reached.
    pub fn await_termination(&self) -> TerminationHandle {
        let mut inner = self.inner.lock();

        if inner.lifecycle == Lifecycle::Shutdown {
            return TerminationHandle::ready();
        }

        let waiter_id = inner.fresh_id();
        let (sender, receiver) = oneshot::channel();
        inner.termination_waiters.push((waiter_id, sender));

        let deregister = {
            let cache = Arc::clone(&self.inner);
            DropHook::new(move || {
                let mut inner = cache.lock();
                if inner.lifecycle != Lifecycle::Shutdown {
                    inner.termination_waiters.retain(|(id, _)| *id != waiter_id);
                }
            })
        };

        TerminationHandle::waiting(receiver, deregister)
    }
}

/// Terminates an execution: removes it from the in-progress table, memoizes
/// a success, and broadcasts the outcome to the subscribers present at this
/// point, in subscription order.
fn settle<K, V>(cache: &Mutex<Inner<K, V>>, key: &K, execution_id: u64, outcome: TaskResult<V>)
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    let mut inner = cache.lock();

    // A late driver or drop token must not touch a successor execution that
    // was created under the same key in the meantime.
    let Entry::Occupied(entry) = inner.in_progress.entry(key.clone()) else {
        return;
    };
    if entry.get().id != execution_id {
        return;
    }
    let execution = entry.remove();

    if let Ok(value) = &outcome {
        inner.finished.insert(key.clone(), value.clone());
    }

    tracing::trace!(
        subscribers = execution.observers.len(),
        success = outcome.is_ok(),
        "task execution settled"
    );

    for observer in execution.observers {
        // A subscriber may have stopped listening in the meantime; delivery
        // to the remaining ones must not be affected.
        observer.sender.send(outcome.clone()).ok();
    }

    inner.maybe_notify_termination();
}

/// Removes one subscriber from an in-flight execution. The last subscriber
/// to leave cancels the producer and drops the execution without delivering
/// an outcome.
fn dispose_subscription<K, V>(
    cache: &Mutex<Inner<K, V>>,
    key: &K,
    execution_id: u64,
    observer_id: u64,
) where
    K: Eq + Hash + Clone,
{
    let mut inner = cache.lock();

    let Entry::Occupied(mut entry) = inner.in_progress.entry(key.clone()) else {
        return;
    };
    if entry.get().id != execution_id {
        return;
    }

    let observers = &mut entry.get_mut().observers;
    observers.retain(|observer| observer.id != observer_id);

    if observers.is_empty() {
        let execution = entry.remove();
        execution.abort_handle.abort();
        tracing::trace!("task execution cancelled, no subscribers left");
        inner.maybe_notify_termination();
    }
}
