//! Integration tests against a live Redis server.
//!
//! Skipped unless `REDIS_URL` is set, e.g. `REDIS_URL=redis://127.0.0.1:6379/0`.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use turnstile::ratelimit::{IdentityKey, Policy, RateLimiter};
use turnstile::store::{CounterStore, RedisCounterStore, RedisStoreOptions, StoreError};

fn redis_url() -> Option<String> {
    env::var("REDIS_URL").ok()
}

fn unique_prefix() -> String {
    let n: u64 = rand::random();
    format!("turnstile_test_{n}")
}

async fn connect(url: &str) -> RedisCounterStore {
    RedisCounterStore::connect(RedisStoreOptions {
        url: url.to_string(),
        key_prefix: unique_prefix(),
        pool_size: 4,
        operation_timeout: Duration::from_secs(2),
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn redis_store_counter_lifecycle() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = connect(&url).await;

    assert_eq!(store.get("k").await.unwrap(), None);
    assert_eq!(store.increment("k").await.unwrap(), 1);
    assert_eq!(store.increment("k").await.unwrap(), 2);

    // A lower value never rewinds a live counter
    store
        .set_with_expiry("k", 1, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(store.get("k").await.unwrap(), Some(2));

    store.delete("k").await.unwrap();
    assert_eq!(store.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn redis_store_counter_expires() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = connect(&url).await;

    store.increment("short").await.unwrap();
    store
        .set_with_expiry("short", 1, Duration::from_millis(200))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(store.get("short").await.unwrap(), None);
    assert_eq!(store.increment("short").await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redis_limiter_admits_exactly_limit_under_concurrency() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = Arc::new(connect(&url).await);
    let limiter = Arc::new(RateLimiter::new(
        store,
        Policy::new(20, Duration::from_secs(60)).unwrap(),
    ));
    let key = IdentityKey::client_addr("192.0.2.10");

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let limiter = limiter.clone();
            let key = key.clone();
            tokio::spawn(async move { limiter.allow(&key).await.unwrap().allowed })
        })
        .collect();

    let admitted = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter(|r| *r.as_ref().unwrap())
        .count();

    assert_eq!(admitted, 20);
    assert_eq!(limiter.count(&key).await.unwrap(), Some(100));
}

#[tokio::test]
async fn redis_store_rejects_calls_after_close() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = connect(&url).await;

    store.close().await.unwrap();
    assert!(matches!(store.increment("k").await, Err(StoreError::Closed)));
}

#[tokio::test]
async fn redis_store_unreachable_server_fails_to_connect() {
    let result = RedisCounterStore::connect(RedisStoreOptions {
        url: "redis://127.0.0.1:1/0".to_string(),
        key_prefix: unique_prefix(),
        pool_size: 1,
        operation_timeout: Duration::from_millis(500),
    })
    .await;

    assert!(result.is_err());
}
