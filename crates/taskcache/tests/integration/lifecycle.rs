use std::future::Future;

use futures::future;
use taskcache::{CacheError, TaskCache, TaskResult};
use taskcache_test::{CancellationProbe, InvocationCounter, ProbeGuard, setup};

fn hanging_download(guard: ProbeGuard) -> impl Future<Output = TaskResult<Vec<u8>>> + Send {
    async move {
        let _guard = guard;
        future::pending::<()>().await;
        unreachable!()
    }
}

/// A producer for callers that join a download already in flight; it is
/// dropped unpolled and must never run.
fn joining_download() -> impl Future<Output = TaskResult<Vec<u8>>> + Send {
    async { unreachable!("a joining caller's producer must not run") }
}

/// Forced shutdown cancels every producer, resolves every waiting caller
/// with a cancellation, and terminates the cache immediately.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forced_shutdown_resolves_everything() {
    setup();

    let cache: TaskCache<String, Vec<u8>> = TaskCache::new();
    let probe = CancellationProbe::new();

    let mut handles = Vec::new();
    for digest in 0..4 {
        let key = format!("sha256:{digest:02x}");
        handles.push(cache.execute_if_not(key.clone(), hanging_download(probe.armed())));
        handles.push(cache.execute_if_not(key, joining_download()));
    }
    assert_eq!(cache.in_progress_tasks().len(), 4);

    cache.shutdown_now();

    for handle in handles {
        assert!(matches!(handle.await, Err(CacheError::Cancelled(_))));
    }
    assert!(cache.in_progress_tasks().is_empty());
    probe.cancelled().await;
    cache.await_termination().await;
}

/// A graceful shutdown lets the running download finish, memoizes it, and
/// only then reports termination.
#[tokio::test]
async fn graceful_shutdown_drains_downloads() {
    setup();

    let cache: TaskCache<String, Vec<u8>> = TaskCache::new();
    let (release, gate) = futures::channel::oneshot::channel::<()>();

    let pending = cache.execute_if_not("sha256:slow".to_string(), async move {
        gate.await.ok();
        Ok(b"artifact".to_vec())
    });

    cache.shutdown();
    let termination = cache.await_termination();

    release.send(()).ok();
    assert_eq!(pending.await, Ok(b"artifact".to_vec()));
    termination.await;

    assert!(cache.finished_tasks().contains("sha256:slow"));
    assert!(cache.in_progress_tasks().is_empty());
}

/// Abandoned downloads are cancelled and do not block a later retry.
#[tokio::test]
async fn abandoned_download_is_cancelled_and_retried() {
    setup();

    let cache: TaskCache<String, Vec<u8>> = TaskCache::new();
    let probe = CancellationProbe::new();
    let fetches = InvocationCounter::new();

    let first = cache.execute_if_not("sha256:big".to_string(), hanging_download(probe.armed()));
    let second = cache.execute_if_not("sha256:big".to_string(), joining_download());

    drop(first);
    drop(second);
    probe.cancelled().await;
    assert!(cache.in_progress_tasks().is_empty());

    let result = cache
        .execute_if_not("sha256:big".to_string(), {
            let fetches = fetches.clone();
            async move {
                fetches.record();
                Ok(b"artifact".to_vec())
            }
        })
        .await;
    assert_eq!(result, Ok(b"artifact".to_vec()));
    assert_eq!(fetches.count(), 1);
}
