//! Redis-backed spend ledger tests. These run only when a Redis instance is
//! reachable; set `SENTINEL_REDIS_URL` (or `REDIS_URL`) to enable them.

use std::time::{SystemTime, UNIX_EPOCH};

use agent_sentinel::{RedisSpendStore, SpendLedger};
use redis::AsyncCommands;

const DEFAULT_LIMIT: f64 = 100.0;

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn redis_url() -> Option<String> {
    env_nonempty("SENTINEL_REDIS_URL").or_else(|| env_nonempty("REDIS_URL"))
}

fn unique_tenant(name: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|now| now.as_nanos())
        .unwrap_or_default();
    format!("test-{name}-{nanos}")
}

async fn connection(url: &str) -> redis::aio::MultiplexedConnection {
    redis::Client::open(url)
        .expect("client")
        .get_multiplexed_async_connection()
        .await
        .expect("connection")
}

async fn set_limit(conn: &mut redis::aio::MultiplexedConnection, tenant: &str, limit: &str) {
    let _: () = conn
        .set(format!("limit:{tenant}"), limit)
        .await
        .expect("set limit");
}

#[tokio::test]
async fn reserve_allows_and_records_current_minute_bucket() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = RedisSpendStore::new(&url, DEFAULT_LIMIT).expect("store");
    let tenant = unique_tenant("reserve");

    let decision = store.check_and_reserve(&tenant, 0.5).await.expect("reserve");
    assert!(decision.allowed);
    assert_eq!(decision.limit, DEFAULT_LIMIT);
    assert_eq!(decision.current_spend, 0.0);
    assert_eq!(decision.remaining, DEFAULT_LIMIT);

    let spend = store.get_spend(&tenant).await.expect("spend");
    assert!((spend - 0.5).abs() < 1e-9);

    // The bucket set carries the configured expiry.
    let mut conn = connection(&url).await;
    let ttl: i64 = redis::cmd("TTL")
        .arg(format!("spend:{tenant}"))
        .query_async(&mut conn)
        .await
        .expect("ttl");
    assert!(ttl > 0 && ttl <= 7200);
}

#[tokio::test]
async fn denial_leaves_the_bucket_unchanged() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = RedisSpendStore::new(&url, DEFAULT_LIMIT).expect("store");
    let tenant = unique_tenant("deny");
    let mut conn = connection(&url).await;
    set_limit(&mut conn, &tenant, "0.001").await;

    let decision = store.check_and_reserve(&tenant, 0.5).await.expect("check");
    assert!(!decision.allowed);
    assert_eq!(decision.limit, 0.001);

    let spend = store.get_spend(&tenant).await.expect("spend");
    assert_eq!(spend, 0.0);
}

#[tokio::test]
async fn reserving_exactly_to_the_limit_is_allowed() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = RedisSpendStore::new(&url, DEFAULT_LIMIT).expect("store");
    let tenant = unique_tenant("equality");
    let mut conn = connection(&url).await;
    set_limit(&mut conn, &tenant, "1.0").await;

    let at_limit = store.check_and_reserve(&tenant, 1.0).await.expect("check");
    assert!(at_limit.allowed);

    let over = store.check_and_reserve(&tenant, 0.5).await.expect("check");
    assert!(!over.allowed);
    assert!((over.current_spend - 1.0).abs() < 1e-9);
    assert_eq!(over.remaining, 0.0);
}

#[tokio::test]
async fn zero_estimate_always_allows_without_delta() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = RedisSpendStore::new(&url, DEFAULT_LIMIT).expect("store");
    let tenant = unique_tenant("zero");
    let mut conn = connection(&url).await;
    set_limit(&mut conn, &tenant, "0.001").await;

    let denied = store.check_and_reserve(&tenant, 1.0).await.expect("check");
    assert!(!denied.allowed);

    let zero = store.check_and_reserve(&tenant, 0.0).await.expect("check");
    assert!(zero.allowed);
    assert_eq!(store.get_spend(&tenant).await.expect("spend"), 0.0);
}

#[tokio::test]
async fn adjust_moves_the_bucket_to_actual_cost() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = RedisSpendStore::new(&url, DEFAULT_LIMIT).expect("store");
    let tenant = unique_tenant("adjust");

    store.check_and_reserve(&tenant, 0.5).await.expect("reserve");
    store.adjust_cost(&tenant, 0.5, 0.2).await.expect("adjust");

    let spend = store.get_spend(&tenant).await.expect("spend");
    assert!((spend - 0.2).abs() < 1e-9);
}

#[tokio::test]
async fn refund_zeroes_the_reservation() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = RedisSpendStore::new(&url, DEFAULT_LIMIT).expect("store");
    let tenant = unique_tenant("refund");

    store.check_and_reserve(&tenant, 0.5).await.expect("reserve");
    store.refund_estimate(&tenant, 0.5).await.expect("refund");

    let spend = store.get_spend(&tenant).await.expect("spend");
    assert!(spend.abs() < 1e-9);
}

#[tokio::test]
async fn buckets_older_than_an_hour_are_compacted_and_excluded() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = RedisSpendStore::new(&url, DEFAULT_LIMIT).expect("store");
    let tenant = unique_tenant("compact");
    let mut conn = connection(&url).await;

    let (now, _micros): (i64, i64) = redis::cmd("TIME")
        .query_async(&mut conn)
        .await
        .expect("time");
    let stale_bucket = ((now / 60) * 60 - 7200).to_string();
    let _: () = conn
        .hset(format!("spend:{tenant}"), &stale_bucket, "50.0")
        .await
        .expect("seed stale bucket");

    let decision = store.check_and_reserve(&tenant, 0.5).await.expect("check");
    assert!(decision.allowed);
    // The stale bucket neither counted toward the window nor survived it.
    assert_eq!(decision.current_spend, 0.0);
    let buckets: std::collections::HashMap<String, String> = conn
        .hgetall(format!("spend:{tenant}"))
        .await
        .expect("buckets");
    assert!(!buckets.contains_key(&stale_bucket));
    assert_eq!(buckets.len(), 1);
}

#[tokio::test]
async fn concurrent_reservations_cannot_both_overcommit() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = RedisSpendStore::new(&url, DEFAULT_LIMIT).expect("store");
    let tenant = unique_tenant("race");
    let mut conn = connection(&url).await;
    set_limit(&mut conn, &tenant, "1.0").await;

    // Each fits alone, together they exceed the limit: the scripted
    // execution must serialize them so at most one is admitted.
    let (first, second) = tokio::join!(
        store.check_and_reserve(&tenant, 0.6),
        store.check_and_reserve(&tenant, 0.6),
    );
    let first = first.expect("first");
    let second = second.expect("second");
    assert_eq!(
        u8::from(first.allowed) + u8::from(second.allowed),
        1,
        "exactly one of two overcommitting reservations may win"
    );

    let spend = store.get_spend(&tenant).await.expect("spend");
    assert!((spend - 0.6).abs() < 1e-9);
}

#[tokio::test]
async fn limit_reads_fall_back_to_the_default() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = RedisSpendStore::new(&url, DEFAULT_LIMIT).expect("store");
    let tenant = unique_tenant("limits");

    assert_eq!(store.get_limit(&tenant).await.expect("limit"), DEFAULT_LIMIT);

    let mut conn = connection(&url).await;
    set_limit(&mut conn, &tenant, "12.5").await;
    assert_eq!(store.get_limit(&tenant).await.expect("limit"), 12.5);
}
