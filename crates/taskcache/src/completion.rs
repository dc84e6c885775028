use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::hash::Hash;

use crate::cache::TaskCache;
use crate::error::TaskResult;
use crate::handle::{TaskHandle, TerminationHandle};

/// A [`TaskCache`] for tasks which complete without producing a value.
///
/// Upload-style operations only care about whether the work happened at all;
/// this wrapper keeps their call sites free of the unit value plumbing.
pub struct CompletionCache<K> {
    cache: TaskCache<K, ()>,
}

impl<K> Clone for CompletionCache<K> {
    fn clone(&self) -> Self {
        CompletionCache {
            cache: self.cache.clone(),
        }
    }
}

impl<K> Default for CompletionCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for CompletionCache<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CompletionCache").field(&self.cache).finish()
    }
}

impl<K> CompletionCache<K> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        CompletionCache {
            cache: TaskCache::new(),
        }
    }
}

impl<K> CompletionCache<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Same as [`TaskCache::execute_if_not`], for completion-only tasks.
    pub fn execute_if_not<F>(&self, key: K, task: F) -> TaskHandle<()>
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        self.cache.execute_if_not(key, task)
    }

    /// Same as [`TaskCache::execute`], for completion-only tasks.
    pub fn execute<F>(&self, key: K, task: F, force: bool) -> TaskHandle<()>
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        self.cache.execute(key, task, force)
    }

    /// Snapshot of the keys whose tasks finished successfully.
    pub fn finished_tasks(&self) -> HashSet<K> {
        self.cache.finished_tasks()
    }

    /// Snapshot of the keys whose tasks are still executing.
    pub fn in_progress_tasks(&self) -> HashSet<K> {
        self.cache.in_progress_tasks()
    }

    /// Number of live subscriptions on the in-flight execution for `key`,
    /// or `0` if there is none.
    pub fn subscriber_count(&self, key: &K) -> usize {
        self.cache.subscriber_count(key)
    }

    /// Starts a graceful shutdown. See [`TaskCache::shutdown`].
    pub fn shutdown(&self) {
        self.cache.shutdown()
    }

    /// Shuts down forcefully. See [`TaskCache::shutdown_now`].
    pub fn shutdown_now(&self) {
        self.cache.shutdown_now()
    }

    /// Returns a handle resolving once the cache has fully shut down. See
    /// [`TaskCache::await_termination`].
    pub fn await_termination(&self) -> TerminationHandle {
        self.cache.await_termination()
    }
}
