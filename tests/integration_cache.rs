//! Integration tests for the serve-stale cache
//!
//! Covers fresh hits, hard-miss fills, negative caching, stale hits with
//! single-flight background refresh, and the disabled handle.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use common::test_data::Payload;
use common::*;
use fairshard::{Cache, CacheConfig, CacheError};
use tokio::task::JoinSet;

fn counted(
    counter: &Arc<AtomicU32>,
    value: Payload,
) -> impl FnOnce(String) -> std::future::Ready<Result<Payload, CacheError>> + Clone + Send + 'static
{
    let counter = Arc::clone(counter);
    move |_key: String| {
        counter.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(value))
    }
}

fn missing(
    counter: &Arc<AtomicU32>,
) -> impl FnOnce(String) -> std::future::Ready<Result<Payload, CacheError>> + Clone + Send + 'static
{
    let counter = Arc::clone(counter);
    move |_key: String| {
        counter.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Err(CacheError::DoesNotExist))
    }
}

async fn key_ttl(key: &str) -> i64 {
    let mut conn = connection().await;
    redis::cmd("TTL")
        .arg(key)
        .query_async(&mut conn)
        .await
        .unwrap_or_else(|_| panic!("TTL query failed"))
}

#[tokio::test]
async fn fresh_hit_never_calls_fetcher() {
    let name = test_key("cache_fresh");
    let cache: Cache<Payload> = Cache::new(
        connection().await,
        CacheConfig::new(&name, Duration::from_secs(10), Duration::from_secs(30)),
    );

    cache
        .set("elephant", &Payload::new("v"))
        .await
        .unwrap_or_else(|_| panic!("set failed"));

    let calls = Arc::new(AtomicU32::new(0));
    let got = cache
        .get("elephant", counted(&calls, Payload::new("unused")))
        .await
        .unwrap_or_else(|_| panic!("get failed"));

    assert_eq!(got, Payload::new("v"));
    assert_eq!(calls.load(Ordering::SeqCst), 0, "fresh hit must not fetch");

    cleanup_keys(&[
        format!("cache:data:{name}:elephant"),
        format!("cache:fresh:{name}:elephant"),
    ])
    .await;
}

#[tokio::test]
async fn hard_miss_fills_with_bounded_ttls() {
    let name = test_key("cache_miss");
    let cache: Cache<Payload> = Cache::new(
        connection().await,
        CacheConfig::new(&name, Duration::from_secs(10), Duration::from_secs(30)),
    );

    let calls = Arc::new(AtomicU32::new(0));
    let got = cache
        .get("elephant", counted(&calls, Payload::new("value_for:elephant")))
        .await
        .unwrap_or_else(|_| panic!("get failed"));

    assert_eq!(got, Payload::new("value_for:elephant"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let data_ttl = key_ttl(&format!("cache:data:{name}:elephant")).await;
    assert!((1..=30).contains(&data_ttl), "data ttl was {data_ttl}");
    let fresh_ttl = key_ttl(&format!("cache:fresh:{name}:elephant")).await;
    assert!((1..=10).contains(&fresh_ttl), "fresh ttl was {fresh_ttl}");

    cleanup_keys(&[
        format!("cache:data:{name}:elephant"),
        format!("cache:fresh:{name}:elephant"),
    ])
    .await;
}

#[tokio::test]
async fn negative_result_is_cached() {
    let name = test_key("cache_negative");
    let cache: Cache<Payload> = Cache::new(
        connection().await,
        CacheConfig::new(&name, Duration::from_secs(10), Duration::from_secs(30))
            .with_negative(Duration::from_secs(5)),
    );

    let calls = Arc::new(AtomicU32::new(0));
    match cache.get("ghost", missing(&calls)).await {
        Err(CacheError::DoesNotExist) => {}
        other => panic!("expected DoesNotExist, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let negative_ttl = key_ttl(&format!("cache:negative:{name}:ghost")).await;
    assert!(
        (1..=5).contains(&negative_ttl),
        "negative ttl was {negative_ttl}"
    );

    // Within the negative window the fetcher must not run again.
    match cache.get("ghost", missing(&calls)).await {
        Err(CacheError::DoesNotExist) => {}
        other => panic!("expected DoesNotExist, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    cleanup_keys(&[format!("cache:negative:{name}:ghost")]).await;
}

#[tokio::test]
async fn stale_hit_serves_old_value_and_refreshes_once() {
    let name = test_key("cache_stale");
    let cache: Cache<Payload> = Cache::new(
        connection().await,
        CacheConfig::new(&name, Duration::from_secs(1), Duration::from_secs(30)),
    );

    cache
        .set("entry", &Payload::new("old"))
        .await
        .unwrap_or_else(|_| panic!("set failed"));

    // Let the fresh sentinel lapse while the data key survives.
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let calls = Arc::new(AtomicU32::new(0));
    let mut tasks = JoinSet::new();
    for _ in 0..10 {
        let cache = cache.clone();
        // Slow fetcher: the winner holds the refresh lock across the whole
        // wave, so losers observably do nothing.
        let fetcher = {
            let calls = Arc::clone(&calls);
            move |_key: String| {
                let calls = Arc::clone(&calls);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Payload::new("new"))
                }
            }
        };
        tasks.spawn(async move { cache.get("entry", fetcher).await });
    }
    while let Some(result) = tasks.join_next().await {
        let got = result
            .unwrap_or_else(|_| panic!("task panicked"))
            .unwrap_or_else(|_| panic!("stale get failed"));
        assert_eq!(got, Payload::new("old"), "stale hits serve the old value");
    }

    // Exactly one of the ten stale hits may refresh.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1, "refresh must single-flight");

    let calls_after = Arc::new(AtomicU32::new(0));
    let got = cache
        .get("entry", counted(&calls_after, Payload::new("unused")))
        .await
        .unwrap_or_else(|_| panic!("get after refresh failed"));
    assert_eq!(got, Payload::new("new"), "refresh should have written");
    assert_eq!(calls_after.load(Ordering::SeqCst), 0);

    cleanup_keys(&[
        format!("cache:data:{name}:entry"),
        format!("cache:fresh:{name}:entry"),
        format!("cache:lock:{name}:entry"),
    ])
    .await;
}

#[tokio::test]
async fn disabled_cache_degrades_to_fetcher() {
    let cache: Cache<Payload> = Cache::disabled();

    let calls = Arc::new(AtomicU32::new(0));
    for _ in 0..3 {
        let got = cache
            .get("anything", counted(&calls, Payload::new("direct")))
            .await
            .unwrap_or_else(|_| panic!("disabled get failed"));
        assert_eq!(got, Payload::new("direct"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3, "every get goes to fetcher");

    cache
        .set("anything", &Payload::new("ignored"))
        .await
        .unwrap_or_else(|_| panic!("disabled set should be a no-op"));
    cache
        .prepare()
        .await
        .unwrap_or_else(|_| panic!("disabled prepare should be a no-op"));
}

#[tokio::test]
async fn set_rejects_null_payloads() {
    let name = test_key("cache_null");
    let cache: Cache<serde_json::Value> = Cache::new(
        connection().await,
        CacheConfig::new(&name, Duration::from_secs(10), Duration::from_secs(30)),
    );

    match cache.set("nothing", &serde_json::Value::Null).await {
        Err(CacheError::NilValue) => {}
        other => panic!("expected NilValue, got {other:?}"),
    }
}

#[tokio::test]
async fn fetcher_errors_pass_through_uncached() {
    let name = test_key("cache_fetcher_err");
    let cache: Cache<Payload> = Cache::new(
        connection().await,
        CacheConfig::new(&name, Duration::from_secs(10), Duration::from_secs(30)),
    );

    let failing = |_key: String| {
        std::future::ready(Err::<Payload, _>(CacheError::fetch(anyhow::anyhow!(
            "upstream down"
        ))))
    };
    match cache.get("entry", failing).await {
        Err(CacheError::Fetch(_)) => {}
        other => panic!("expected Fetch error, got {other:?}"),
    }

    // A failed fetch must not leave a data key behind.
    let mut conn = connection().await;
    let exists: bool = redis::cmd("EXISTS")
        .arg(format!("cache:data:{name}:entry"))
        .query_async(&mut conn)
        .await
        .unwrap_or_else(|_| panic!("EXISTS failed"));
    assert!(!exists);
}
