//! Integration tests for the distributed lock
//!
//! Covers single-endpoint acquire/release semantics, contention behavior,
//! and the multi-endpoint rollback contract.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use fairshard::{LockClient, LockError, MultiLock};
use tokio::task::JoinSet;

#[tokio::test]
async fn acquire_and_release_roundtrip() {
    let lock = LockClient::new(connection().await);
    let key = test_key("lock_roundtrip");

    let guard = lock
        .try_acquire(&key, Duration::from_secs(5))
        .await
        .unwrap_or_else(|_| panic!("uncontended acquire should succeed"));
    assert_eq!(guard.key(), key);

    guard
        .release()
        .await
        .unwrap_or_else(|_| panic!("release of a held lock should succeed"));

    // Released: a second acquire goes through immediately.
    let guard = lock
        .try_acquire(&key, Duration::from_secs(5))
        .await
        .unwrap_or_else(|_| panic!("reacquire after release should succeed"));
    let _ = guard.release().await;
}

#[tokio::test]
async fn contended_key_admits_exactly_one() {
    let lock = Arc::new(LockClient::new(connection().await));
    let key = test_key("lock_contention");

    // 50 parallel single attempts: one handle, 49 NotAcquired.
    let mut tasks = JoinSet::new();
    for _ in 0..50 {
        let lock = Arc::clone(&lock);
        let key = key.clone();
        tasks.spawn(async move { lock.try_acquire(&key, Duration::from_secs(1)).await });
    }

    let mut acquired = 0;
    let mut contested = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap_or_else(|_| panic!("task panicked")) {
            Ok(_guard) => acquired += 1,
            Err(LockError::NotAcquired) => contested += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(acquired, 1, "exactly one acquirer should win");
    assert_eq!(contested, 49);

    cleanup_keys(&[key]).await;
}

#[tokio::test]
async fn release_after_losing_key_reports_not_held() {
    let lock = LockClient::new(connection().await);
    let key = test_key("lock_lost");

    let guard = lock
        .try_acquire(&key, Duration::from_secs(5))
        .await
        .unwrap_or_else(|_| panic!("acquire should succeed"));

    // Simulate TTL expiry plus takeover by another owner.
    let mut conn = connection().await;
    let _: () = redis::cmd("SET")
        .arg(&key)
        .arg("someone-else")
        .query_async(&mut conn)
        .await
        .unwrap_or_else(|_| panic!("manual overwrite failed"));

    match guard.release().await {
        Err(LockError::NotHeld) => {}
        other => panic!("expected NotHeld, got {other:?}"),
    }

    cleanup_keys(&[key]).await;
}

#[tokio::test]
async fn acquire_waits_for_ttl_expiry() {
    let lock = LockClient::new(connection().await);
    let key = test_key("lock_wait");

    // Holder takes the key for 300ms and never releases.
    let _holder = lock
        .try_acquire(&key, Duration::from_millis(300))
        .await
        .unwrap_or_else(|_| panic!("first acquire should succeed"));

    let started = std::time::Instant::now();
    let guard = tokio::time::timeout(
        Duration::from_secs(5),
        lock.acquire(&key, Duration::from_secs(1)),
    )
    .await
    .unwrap_or_else(|_| panic!("acquire should not need the full deadline"))
    .unwrap_or_else(|_| panic!("acquire should succeed after expiry"));

    assert!(
        started.elapsed() >= Duration::from_millis(250),
        "acquire should have waited for the TTL"
    );
    let _ = guard.release().await;
}

#[tokio::test]
async fn extend_outlives_the_original_ttl() {
    let lock = LockClient::new(connection().await);
    let key = test_key("lock_extend");

    let guard = lock
        .try_acquire(&key, Duration::from_millis(300))
        .await
        .unwrap_or_else(|_| panic!("acquire should succeed"));
    guard
        .extend(Duration::from_secs(5))
        .await
        .unwrap_or_else(|_| panic!("extend of a held lock should succeed"));

    // Past the original TTL the lock is still ours.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        guard
            .is_held()
            .await
            .unwrap_or_else(|_| panic!("is_held failed")),
        "extended lock should still be held"
    );
    guard
        .release()
        .await
        .unwrap_or_else(|_| panic!("release after extend should succeed"));
}

#[tokio::test]
async fn extend_after_expiry_reports_not_held() {
    let lock = LockClient::new(connection().await);
    let key = test_key("lock_extend_lost");

    let guard = lock
        .try_acquire(&key, Duration::from_millis(100))
        .await
        .unwrap_or_else(|_| panic!("acquire should succeed"));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(
        !guard
            .is_held()
            .await
            .unwrap_or_else(|_| panic!("is_held failed")),
        "expired lock must not report held"
    );
    match guard.extend(Duration::from_secs(5)).await {
        Err(LockError::NotHeld) => {}
        other => panic!("expected NotHeld, got {other:?}"),
    }
}

#[tokio::test]
async fn multi_lock_rolls_back_acquired_prefix() {
    // Two clients against the same server: the first endpoint takes the key,
    // the second finds it held, and the rollback must free the first again.
    let multi = MultiLock::new(vec![
        LockClient::new(connection().await),
        LockClient::new(connection().await),
    ]);
    let key = test_key("multi_rollback");

    match multi.try_acquire(&key, Duration::from_secs(5)).await {
        Err(LockError::NotAcquired) => {}
        Err(e) => panic!("expected NotAcquired, got {e}"),
        Ok(_) => panic!("second endpoint should have been contested"),
    }

    // Prefix released: a fresh single-endpoint acquire succeeds at once.
    let single = LockClient::new(connection().await);
    let guard = single
        .try_acquire(&key, Duration::from_secs(5))
        .await
        .unwrap_or_else(|_| panic!("rollback should have freed the key"));
    let _ = guard.release().await;
}

#[tokio::test]
async fn multi_lock_single_endpoint_roundtrip() {
    let multi = MultiLock::new(vec![LockClient::new(connection().await)]);
    multi
        .prepare()
        .await
        .unwrap_or_else(|_| panic!("prepare should succeed"));
    let key = test_key("multi_single");

    let guard = multi
        .acquire(&key, Duration::from_secs(5))
        .await
        .unwrap_or_else(|_| panic!("uncontended multi acquire should succeed"));
    guard
        .release()
        .await
        .unwrap_or_else(|_| panic!("multi release should succeed"));
}
