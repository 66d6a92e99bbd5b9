//! Redis storage tests.
//!
//! These need a Redis server on 127.0.0.1:6379 and are ignored by default:
//!
//! ```text
//! cargo test --test redis_storage -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use ratekeeper::ratelimit::{Decision, Denial, LimiterConfig, RateLimiter};
use ratekeeper::storage::{RedisStorage, RedisStorageConfig, Storage};
use uuid::Uuid;

const REDIS_URL: &str = "redis://127.0.0.1:6379/";

async fn storage() -> RedisStorage {
    let config = RedisStorageConfig {
        key_prefix: format!("ratekeeper-test:{}:", Uuid::new_v4()),
        ..Default::default()
    };
    RedisStorage::connect_with_config(REDIS_URL, config)
        .await
        .expect("Redis must be running on 127.0.0.1:6379")
}

#[tokio::test]
#[ignore]
async fn test_increment_and_get() {
    let storage = storage().await;

    assert_eq!(storage.get("ip:192.0.2.1").await.unwrap(), None);
    assert_eq!(storage.increment("ip:192.0.2.1", Duration::from_secs(5)).await.unwrap(), 1);
    assert_eq!(storage.increment("ip:192.0.2.1", Duration::from_secs(5)).await.unwrap(), 2);

    let record = storage.get("ip:192.0.2.1").await.unwrap().unwrap();
    assert_eq!(record.count, 2);
    assert!(record.window_expiry > Utc::now());
    assert!(record.window_expiry <= Utc::now() + chrono::Duration::seconds(5));
}

#[tokio::test]
#[ignore]
async fn test_window_expires() {
    let storage = storage().await;

    storage.increment("k", Duration::from_millis(100)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(storage.get("k").await.unwrap(), None);
    assert_eq!(storage.increment("k", Duration::from_millis(100)).await.unwrap(), 1);
}

#[tokio::test]
#[ignore]
async fn test_window_fixed_from_first_increment() {
    let storage = storage().await;

    storage.increment("k", Duration::from_secs(1)).await.unwrap();
    let opened = storage.get("k").await.unwrap().unwrap().window_expiry;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(storage.increment("k", Duration::from_secs(1)).await.unwrap(), 2);

    let record = storage.get("k").await.unwrap().unwrap();
    assert_eq!(record.count, 2);
    // a later increment does not push the expiry out
    assert!((record.window_expiry - opened).num_milliseconds().abs() < 100);
}

#[tokio::test]
#[ignore]
async fn test_block_lifecycle() {
    let storage = storage().await;
    let until = Utc::now() + chrono::Duration::seconds(30);

    storage.set_block("token:abc", until).await.unwrap();
    let blocked = storage.is_blocked("token:abc").await.unwrap().unwrap();
    // reconstructed from the remaining TTL
    assert!((blocked - until).num_milliseconds().abs() < 1_000);

    storage.delete("token:abc").await.unwrap();
    assert_eq!(storage.is_blocked("token:abc").await.unwrap(), None);
}

#[tokio::test]
#[ignore]
async fn test_past_block_is_noop() {
    let storage = storage().await;

    storage
        .set_block("k", Utc::now() - chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(storage.is_blocked("k").await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn test_concurrent_checks_share_one_counter() {
    let storage: Arc<dyn Storage> = Arc::new(storage().await);
    let limiter = Arc::new(RateLimiter::new(
        storage,
        LimiterConfig {
            ip_requests_per_second: 20,
            ..LimiterConfig::default()
        },
    ));

    let tasks = (0..60).map(|_| {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move { limiter.check_request("192.0.2.50", None).await })
    });

    let allowed = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .filter(Decision::is_allowed)
        .count();

    assert_eq!(allowed, 20);
}

#[tokio::test]
#[ignore]
async fn test_quota_then_block() {
    let storage: Arc<dyn Storage> = Arc::new(storage().await);
    let limiter = RateLimiter::new(
        storage,
        LimiterConfig {
            ip_requests_per_second: 2,
            ip_block_minutes: 1,
            ..LimiterConfig::default()
        },
    );

    assert!(limiter.check_request("192.0.2.1", None).await.unwrap().is_allowed());
    assert!(limiter.check_request("192.0.2.1", None).await.unwrap().is_allowed());
    assert!(matches!(
        limiter.check_request("192.0.2.1", None).await.unwrap(),
        Decision::Denied(Denial::QuotaExceeded { .. })
    ));
    assert!(matches!(
        limiter.check_request("192.0.2.1", None).await.unwrap(),
        Decision::Denied(Denial::Blocked { .. })
    ));

    limiter.reset("192.0.2.1", None).await.unwrap();
    assert!(limiter.check_request("192.0.2.1", None).await.unwrap().is_allowed());
}

#[tokio::test]
#[ignore]
async fn test_closed_storage_rejects_operations() {
    let storage = storage().await;
    storage.close().await.unwrap();

    assert!(storage.get("k").await.is_err());
    assert!(storage.increment("k", Duration::from_secs(1)).await.is_err());
}
