//! Redis queue backend tests.
//!
//! Run with Redis available:
//! `REDIS_URL=redis://... cargo test --test redis_queue -- --ignored`

mod common;

use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use federation_queue::config::RedisConfig;
use federation_queue::queue::{EnqueueOptions, MessageQueue, RedisMessageQueue, RedisQueueConfig};
use federation_queue::redis::RedisPool;

fn redis_pool() -> Arc<RedisPool> {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    Arc::new(RedisPool::new(&RedisConfig { url }).expect("valid Redis URL"))
}

fn config() -> RedisQueueConfig {
    RedisQueueConfig {
        prefix: format!("delivery_test:{}", Uuid::new_v4().simple()),
        poll_interval: Duration::from_millis(300),
        ..RedisQueueConfig::default()
    }
}

fn queue() -> Arc<dyn MessageQueue> {
    Arc::new(RedisMessageQueue::new(redis_pool(), config()).unwrap())
}

async fn exists(pool: &RedisPool, key: &str) -> bool {
    pool.execute(|mut conn| async move { conn.exists(key).await })
        .await
        .unwrap()
}

#[tokio::test]
#[ignore = "requires Redis running"]
async fn test_ordering_key_is_fifo_across_listeners() {
    common::ordering_key_is_fifo(queue()).await;
}

#[tokio::test]
#[ignore = "requires Redis running"]
async fn test_all_messages_observed() {
    common::all_messages_observed(queue()).await;
}

#[tokio::test]
#[ignore = "requires Redis running"]
async fn test_delay_is_respected() {
    common::delay_is_respected(queue()).await;
}

#[tokio::test]
#[ignore = "requires Redis running"]
async fn test_cancellation_waits_for_in_flight_handler() {
    common::cancellation_waits_for_in_flight(queue()).await;
}

#[tokio::test]
#[ignore = "requires Redis running"]
async fn test_handler_errors_do_not_escape_listen() {
    common::handler_errors_do_not_escape(queue()).await;
}

#[tokio::test]
#[ignore = "requires Redis running"]
async fn test_busy_key_does_not_starve_other_messages() {
    common::busy_key_does_not_starve_others(queue()).await;
}

#[tokio::test]
#[ignore = "requires Redis running"]
async fn test_concurrent_enqueue_while_listening() {
    common::concurrent_enqueue_while_listening(queue()).await;
}

#[tokio::test]
#[ignore = "requires Redis running"]
async fn test_empty_prefix_is_rejected() {
    let config = RedisQueueConfig {
        prefix: String::new(),
        ..RedisQueueConfig::default()
    };
    assert!(RedisMessageQueue::new(redis_pool(), config).is_err());
}

#[tokio::test]
#[ignore = "requires Redis running"]
async fn test_enqueue_many_then_close() {
    let queue = queue();
    queue
        .enqueue_many(vec![json!(1), json!(2)], EnqueueOptions::new().with_ordering_key("k"))
        .await
        .unwrap();
    queue.close().await.unwrap();
    queue.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Redis running"]
async fn test_ordering_lock_key_is_deleted_after_processing() {
    let config = config();
    let prefix = config.prefix.clone();
    let pool = redis_pool();
    let queue: Arc<dyn MessageQueue> = Arc::new(RedisMessageQueue::new(pool.clone(), config).unwrap());

    queue
        .enqueue_many(vec![json!(1), json!(2)], EnqueueOptions::new().with_ordering_key("actor-1"))
        .await
        .unwrap();

    let recorder = common::Recorder::new();
    let handler = recorder.handler(Duration::ZERO);
    let signal = CancellationToken::new();
    let listeners = common::spawn_listeners(&queue, &handler, 1, &signal);
    assert!(recorder.wait_for(2, common::WAIT).await);
    common::stop(signal, listeners).await;

    assert!(!exists(&pool, &format!("{prefix}:lock:actor-1")).await, "ordering lock leaked");
    assert!(!exists(&pool, &format!("{prefix}:ordering:actor-1")).await);
    assert!(!exists(&pool, &format!("{prefix}:ready")).await);
}

#[tokio::test]
#[ignore = "requires Redis running"]
async fn test_head_without_envelope_does_not_stall_its_key() {
    let config = config();
    let prefix = config.prefix.clone();
    let pool = redis_pool();
    let queue: Arc<dyn MessageQueue> = Arc::new(RedisMessageQueue::new(pool.clone(), config).unwrap());

    queue
        .enqueue_many(
            vec![json!({"n": 0}), json!({"n": 1})],
            EnqueueOptions::new().with_ordering_key("actor-1"),
        )
        .await
        .unwrap();

    let list = format!("{prefix}:ordering:actor-1");
    let messages = format!("{prefix}:messages");
    let head: String = pool
        .execute(|mut conn| {
            let list = list.clone();
            async move { conn.lindex(list, 0).await }
        })
        .await
        .unwrap();
    let _: i64 = pool
        .execute(|mut conn| async move { conn.hdel(&messages, &head).await })
        .await
        .unwrap();

    let recorder = common::Recorder::new();
    let handler = recorder.handler(Duration::ZERO);
    let signal = CancellationToken::new();
    let listeners = common::spawn_listeners(&queue, &handler, 1, &signal);
    assert!(recorder.wait_for(1, common::WAIT).await, "key stalled behind a missing envelope");
    common::stop(signal, listeners).await;

    assert_eq!(recorder.payloads(), vec![json!({"n": 1})]);
    assert!(!exists(&pool, &list).await);
}
