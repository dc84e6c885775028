use std::future::Future;
use std::time::Duration;

use taskcache::{CompletionCache, TaskCache, TaskResult};
use taskcache_test::{InvocationCounter, setup};

fn fetch_blob(fetches: InvocationCounter) -> impl Future<Output = TaskResult<Vec<u8>>> + Send {
    async move {
        fetches.record();
        tokio::time::sleep(Duration::from_millis(25)).await;
        Ok(b"blob contents".to_vec())
    }
}

/// One hundred concurrent build actions referencing the same blob result in
/// a single upstream fetch, and all of them observe the same bytes.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn storm_of_callers_fetches_once() {
    setup();

    let cache: TaskCache<String, Vec<u8>> = TaskCache::new();
    let fetches = InvocationCounter::new();

    let mut waiters = Vec::new();
    for _ in 0..100 {
        let cache = cache.clone();
        let fetches = fetches.clone();
        waiters.push(tokio::spawn(async move {
            cache
                .execute_if_not("sha256:9f86d08".to_string(), fetch_blob(fetches))
                .await
        }));
    }

    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), Ok(b"blob contents".to_vec()));
    }
    assert_eq!(fetches.count(), 1);

    // From now on the result is served from memory.
    let result = cache
        .execute_if_not("sha256:9f86d08".to_string(), fetch_blob(fetches.clone()))
        .await;
    assert_eq!(result, Ok(b"blob contents".to_vec()));
    assert_eq!(fetches.count(), 1);
}

/// Distinct keys do not contend with each other; every digest is fetched
/// exactly once no matter how many callers reference it.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn distinct_keys_run_independently() {
    setup();

    let cache: TaskCache<String, Vec<u8>> = TaskCache::new();
    let fetches = InvocationCounter::new();

    let mut waiters = Vec::new();
    for digest in 0..8 {
        for _ in 0..4 {
            let cache = cache.clone();
            let fetches = fetches.clone();
            waiters.push(tokio::spawn(async move {
                cache
                    .execute_if_not(format!("sha256:{digest:02x}"), fetch_blob(fetches))
                    .await
            }));
        }
    }

    for waiter in waiters {
        assert!(waiter.await.unwrap().is_ok());
    }
    assert_eq!(fetches.count(), 8);

    assert_eq!(cache.finished_tasks().len(), 8);
    assert!(cache.in_progress_tasks().is_empty());
}

/// Concurrent uploads of the same digest are also deduplicated when only
/// completion matters.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_uploads_run_once() {
    setup();

    let cache: CompletionCache<String> = CompletionCache::new();
    let uploads = InvocationCounter::new();

    let mut waiters = Vec::new();
    for _ in 0..32 {
        let cache = cache.clone();
        let uploads = uploads.clone();
        waiters.push(tokio::spawn(async move {
            cache
                .execute_if_not("sha256:upload".to_string(), async move {
                    uploads.record();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(())
                })
                .await
        }));
    }

    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }
    assert_eq!(uploads.count(), 1);
}
