mod support;

use std::{sync::Arc, time::Duration};

use dataman_core::lock::{KeyedLock, LockMode};
use support::CacheFixture;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn paired_acquire_release_leaves_an_empty_table() {
    let locks = KeyedLock::new();
    let keys = ["a.fits", "b.fits", "c.fits", "d.fits"];

    let tasks: Vec<_> = (0..16usize)
        .map(|worker| {
            let locks = locks.clone();
            tokio::spawn(async move {
                for round in 0..50usize {
                    let key = keys[(worker * 7 + round) % keys.len()];
                    let mode = if (worker + round) % 3 == 0 {
                        LockMode::Exclusive
                    } else {
                        LockMode::Shared
                    };
                    let guard = locks.acquire(key, mode).await;
                    assert!(locks.refcount(key) >= 1);
                    tokio::task::yield_now().await;
                    guard.release().expect("balanced release");
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("worker");
    }

    assert!(locks.is_empty(), "leftover entries: {locks:?}");
    for key in keys {
        assert_eq!(locks.refcount(key), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_waiters_leave_no_entries() {
    let locks = KeyedLock::new();
    let held = locks.acquire("busy", LockMode::Exclusive).await;

    let mut waiters = Vec::new();
    for _ in 0..8 {
        let locks = locks.clone();
        waiters.push(tokio::spawn(async move {
            locks.acquire("busy", LockMode::Shared).await
        }));
    }
    while locks.refcount("busy") < 9 {
        tokio::task::yield_now().await;
    }

    for waiter in &waiters {
        waiter.abort();
    }
    for waiter in waiters {
        let _ = waiter.await;
    }
    assert_eq!(locks.refcount("busy"), 1);

    drop(held);
    assert!(locks.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cache_reads_wait_for_header_writes() {
    let fx = Arc::new(CacheFixture::new(8, 0));
    fx.write("a.fits", "GS-A");

    let writer = fx.locks.acquire("a.fits", LockMode::Exclusive).await;
    let reader = {
        let fx = Arc::clone(&fx);
        tokio::spawn(async move { fx.cache.fetch("a.fits").await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!reader.is_finished());
    assert_eq!(fx.extractor.parse_count(), 0);

    writer.release().expect("release");
    let metadata = reader
        .await
        .expect("reader task")
        .expect("fetch")
        .expect("exists");
    assert_eq!(metadata.label.as_str(), "GS-A");
    assert!(fx.locks.is_empty());
}
