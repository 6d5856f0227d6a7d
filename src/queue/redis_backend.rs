//! Redis message queue backend.
//!
//! Layout under a configurable prefix:
//! - `{prefix}:queue` sorted set of every envelope id scored by visibility (epoch ms)
//! - `{prefix}:ready` sorted set of claim candidates: unkeyed ids and the
//!   head of each ordering list, scored like `queue`
//! - `{prefix}:messages` hash of id to envelope JSON
//! - `{prefix}:attempts` hash of id to claim count
//! - `{prefix}:keys` hash of keyed id to its ordering list
//! - `{prefix}:ordering:{key}` list of ids per ordering key, in enqueue order
//! - `{prefix}:lock:{key}` lock token for the key's in-flight envelope
//! - `{prefix}:channel` pub/sub wake-up channel
//!
//! Polling only reads `ready`, so a long ordering list never crowds other
//! keys out of a batch. Enqueue and removal are scripts: removing a list
//! head promotes the next id of that list into `ready`. Unkeyed envelopes
//! are claimed by bumping their `ready` score by a lease; keyed ones must be
//! the head of their list and win the `SET NX PX` lock, which is renewed
//! while the handler runs.
//!
//! The removal script resolves the ordering list from `{prefix}:keys` at run
//! time, so the backend expects a standalone Redis rather than a cluster.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use redis::Script;
use serde_json::Value;
use tokio::sync::{Notify, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::backoff::{BackoffConfig, ExponentialBackoff};
use crate::config::QueueConfig;
use crate::metrics::QueueMetrics;
use crate::redis::{RedisPool, RedisPoolExt};

use super::backend::{
    invoke_handler, EnqueueOptions, HandlerOutcome, ListenOptions, MessageQueue, QueueError,
    QueueHandler,
};
use super::envelope::Envelope;

const BACKEND: &str = "redis";

/// KEYS: messages, queue, ready, keys, ordering lists...
/// ARGV: groups of id, score, envelope JSON, ordering list KEYS index (0 when unkeyed).
const ENQUEUE: &str = r#"
for i = 1, #ARGV, 4 do
    local id = ARGV[i]
    local score = ARGV[i + 1]
    redis.call('HSET', KEYS[1], id, ARGV[i + 2])
    redis.call('ZADD', KEYS[2], score, id)
    local list = tonumber(ARGV[i + 3])
    if list == 0 then
        redis.call('ZADD', KEYS[3], score, id)
    else
        redis.call('HSET', KEYS[4], id, KEYS[list])
        if redis.call('RPUSH', KEYS[list], id) == 1 then
            redis.call('ZADD', KEYS[3], score, id)
        end
    end
end
return #ARGV / 4
"#;

/// KEYS: queue, ready, messages, attempts, keys. ARGV: id.
/// Returns 1 when another id of the same ordering list became ready.
const REMOVE: &str = r#"
local id = ARGV[1]
local list = redis.call('HGET', KEYS[5], id)
redis.call('ZREM', KEYS[1], id)
redis.call('ZREM', KEYS[2], id)
redis.call('HDEL', KEYS[3], id)
redis.call('HDEL', KEYS[4], id)
redis.call('HDEL', KEYS[5], id)
if not list then
    return 0
end
local was_head = redis.call('LINDEX', list, 0) == id
redis.call('LREM', list, 1, id)
if not was_head then
    return 0
end
while true do
    local head = redis.call('LINDEX', list, 0)
    if not head then
        return 0
    end
    local score = redis.call('ZSCORE', KEYS[1], head)
    if score then
        redis.call('ZADD', KEYS[2], score, head)
        return 1
    end
    -- id whose envelope is already gone
    redis.call('LPOP', list)
end
"#;

/// KEYS: ready, attempts. ARGV: id, now_ms, lease_until_ms.
/// Returns the new claim count, or 0 when the envelope is gone or not yet visible.
const CLAIM_UNKEYED: &str = r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score or tonumber(score) > tonumber(ARGV[2]) then
    return 0
end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
return redis.call('HINCRBY', KEYS[2], ARGV[1], 1)
"#;

/// KEYS: ready, attempts, ordering list. ARGV: id, now_ms.
const CLAIM_KEYED: &str = r#"
if redis.call('LINDEX', KEYS[3], 0) ~= ARGV[1] then
    return 0
end
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score or tonumber(score) > tonumber(ARGV[2]) then
    return 0
end
return redis.call('HINCRBY', KEYS[2], ARGV[1], 1)
"#;

/// KEYS: lock. ARGV: token, ttl_ms.
const RENEW_LOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// KEYS: lock. ARGV: token.
const RELEASE_LOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    pub prefix: String,
    pub poll_interval: Duration,
    /// Candidate ids fetched from `ready` per poll
    pub batch_size: isize,
    /// Invisibility window for a claimed unkeyed envelope
    pub lease_duration: Duration,
    /// TTL of an ordering-key lock; renewed at a third of it while handling
    pub lock_ttl: Duration,
    pub poll_backoff: BackoffConfig,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self::from_settings(&QueueConfig::default())
    }
}

impl RedisQueueConfig {
    pub fn from_settings(settings: &QueueConfig) -> Self {
        Self {
            prefix: settings.redis_prefix.clone(),
            poll_interval: settings.poll_interval(),
            batch_size: settings.batch_size.max(1) as isize,
            lease_duration: settings.lease_duration(),
            lock_ttl: Duration::from_millis(settings.redis_lock_ttl_ms.max(300)),
            poll_backoff: BackoffConfig {
                initial_delay_ms: 500,
                max_delay_ms: settings.poll_interval_ms.max(1_000) * 6,
                multiplier: 2.0,
                jitter_factor: 0.1,
            },
        }
    }
}

#[derive(Debug, Clone)]
struct RedisKeys {
    prefix: String,
    queue: String,
    ready: String,
    messages: String,
    attempts: String,
    ordering_lists: String,
    channel: String,
}

impl RedisKeys {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            queue: format!("{prefix}:queue"),
            ready: format!("{prefix}:ready"),
            messages: format!("{prefix}:messages"),
            attempts: format!("{prefix}:attempts"),
            ordering_lists: format!("{prefix}:keys"),
            channel: format!("{prefix}:channel"),
        }
    }

    fn ordering(&self, key: &str) -> String {
        format!("{}:ordering:{}", self.prefix, key)
    }

    fn lock(&self, key: &str) -> String {
        format!("{}:lock:{}", self.prefix, key)
    }
}

struct Scripts {
    enqueue: Script,
    remove: Script,
    claim_unkeyed: Script,
    claim_keyed: Script,
    renew_lock: Script,
    release_lock: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            remove: Script::new(REMOVE),
            claim_unkeyed: Script::new(CLAIM_UNKEYED),
            claim_keyed: Script::new(CLAIM_KEYED),
            renew_lock: Script::new(RENEW_LOCK),
            release_lock: Script::new(RELEASE_LOCK),
        }
    }
}

/// Redis implementation of [`MessageQueue`].
pub struct RedisMessageQueue {
    pool: Arc<RedisPool>,
    config: RedisQueueConfig,
    keys: RedisKeys,
    scripts: Scripts,
    initialized: OnceCell<()>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl RedisMessageQueue {
    pub fn new(pool: Arc<RedisPool>, config: RedisQueueConfig) -> Result<Self, QueueError> {
        if config.prefix.is_empty() {
            return Err(QueueError::Configuration(
                "redis prefix must not be empty".to_string(),
            ));
        }
        Ok(Self {
            keys: RedisKeys::new(&config.prefix),
            pool,
            config,
            scripts: Scripts::new(),
            initialized: OnceCell::new(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    /// Verify connectivity once; a failure is retried on the next call.
    async fn initialize(&self) -> Result<(), QueueError> {
        self.initialized
            .get_or_try_init(|| async {
                self.pool
                    .ping()
                    .await
                    .map_err(|e| QueueError::Setup(e.to_string()))?;
                tracing::info!(prefix = %self.keys.prefix, "Redis queue ready");
                Ok::<(), QueueError>(())
            })
            .await
            .map(|_| ())
    }

    async fn write_all(
        &self,
        messages: Vec<Value>,
        options: &EnqueueOptions,
    ) -> Result<(), QueueError> {
        let envelopes: Vec<Envelope> = messages
            .into_iter()
            .map(|message| Envelope::new(message, options))
            .collect();
        let batch = EnqueueBatch::build(&self.keys, &envelopes)?;
        for envelope in &envelopes {
            tracing::debug!(
                message_id = %envelope.id,
                ordering_key = ?envelope.ordering_key,
                delay_ms = options.delay_ms(),
                "Envelope enqueued"
            );
        }

        let script = &self.scripts.enqueue;
        let _: i64 = self
            .pool
            .execute(|mut conn| async move {
                let mut invocation = script.prepare_invoke();
                for key in &batch.keys {
                    invocation.key(key);
                }
                for arg in &batch.args {
                    invocation.arg(arg);
                }
                let reply: i64 = invocation.invoke_async(&mut conn).await?;
                Ok(reply)
            })
            .await?;
        QueueMetrics::record_enqueued(BACKEND, envelopes.len() as u64);

        // The envelopes are stored; a lost wake-up only delays them until the next poll.
        if let Err(e) = self
            .pool
            .publish(&self.keys.channel, &options.delay_ms().to_string())
            .await
        {
            tracing::warn!(error = %e, "Failed to publish queue wake-up");
        }
        Ok(())
    }

    async fn run_subscriber(
        pool: Arc<RedisPool>,
        channel: String,
        wake: Arc<Notify>,
        stop: CancellationToken,
    ) {
        let mut pubsub = match pool.client().get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                tracing::warn!(error = %e, "Could not open pub/sub connection; falling back to polling");
                return;
            }
        };
        if let Err(e) = pubsub.subscribe(&channel).await {
            tracing::warn!(error = %e, channel = %channel, "SUBSCRIBE failed; falling back to polling");
            return;
        }
        tracing::debug!(channel = %channel, "Subscribed to queue wake-ups");

        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                message = messages.next() => {
                    let Some(message) = message else {
                        tracing::warn!(channel = %channel, "Pub/sub connection closed; falling back to polling");
                        break;
                    };
                    let delay_ms: u64 = message
                        .get_payload::<String>()
                        .ok()
                        .and_then(|payload| payload.parse().ok())
                        .unwrap_or(0);
                    if delay_ms == 0 {
                        wake.notify_one();
                    } else {
                        let wake = wake.clone();
                        let stop = stop.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = stop.cancelled() => {}
                                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => wake.notify_one(),
                            }
                        });
                    }
                }
            }
        }
    }

    async fn poll_once(
        &self,
        handler: &dyn QueueHandler,
        signal: &CancellationToken,
    ) -> Result<bool, QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let ids = self
            .pool
            .zrangebyscore_limit(&self.keys.ready, 0, now_ms, self.config.batch_size)
            .await?;

        let mut handled_any = false;
        for id in ids {
            if signal.is_cancelled() || self.shutdown.is_cancelled() {
                break;
            }

            let Some(raw) = self.pool.hget(&self.keys.messages, &id).await? else {
                tracing::warn!(message_id = %id, "Queued id without a stored envelope; dropping it");
                self.remove(&id).await?;
                continue;
            };
            let envelope: Envelope = match serde_json::from_str(&raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::error!(message_id = %id, error = %e, "Undecodable envelope; dropping it");
                    self.remove(&id).await?;
                    continue;
                }
            };

            let handled = match envelope.ordering_key.clone() {
                Some(key) => self.process_keyed(&id, &key, envelope, handler).await?,
                None => self.process_unkeyed(&id, envelope, handler).await?,
            };
            handled_any |= handled;
        }

        Ok(handled_any)
    }

    async fn process_unkeyed(
        &self,
        id: &str,
        envelope: Envelope,
        handler: &dyn QueueHandler,
    ) -> Result<bool, QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let lease_until = now_ms + self.config.lease_duration.as_millis() as i64;

        let attempt: i64 = self
            .pool
            .execute(|mut conn| async move {
                let reply: i64 = self
                    .scripts
                    .claim_unkeyed
                    .key(&self.keys.ready)
                    .key(&self.keys.attempts)
                    .arg(id)
                    .arg(now_ms)
                    .arg(lease_until)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(reply)
            })
            .await?;
        if attempt == 0 {
            return Ok(false);
        }

        run_handler(envelope, attempt, handler).await;
        self.remove(id).await?;
        Ok(true)
    }

    async fn process_keyed(
        &self,
        id: &str,
        key: &str,
        envelope: Envelope,
        handler: &dyn QueueHandler,
    ) -> Result<bool, QueueError> {
        let ordering_key = self.keys.ordering(key);
        if self.pool.lindex_head(&ordering_key).await?.as_deref() != Some(id) {
            return Ok(false);
        }

        let lock_key = self.keys.lock(key);
        let token = Uuid::new_v4().to_string();
        let ttl_ms = self.config.lock_ttl.as_millis() as u64;
        if !self.pool.set_nx_px(&lock_key, &token, ttl_ms).await? {
            QueueMetrics::record_lock_contended(BACKEND);
            tracing::trace!(ordering_key = key, "Ordering key busy; skipping");
            return Ok(false);
        }

        let result = self
            .process_locked(id, &ordering_key, &lock_key, &token, envelope, handler)
            .await;

        // Released even when processing failed; an unreleased lock would
        // stall the key until its TTL runs out.
        let released = self.release_lock(&lock_key, &token).await;
        let handled = result?;
        released?;
        Ok(handled)
    }

    async fn process_locked(
        &self,
        id: &str,
        ordering_key: &str,
        lock_key: &str,
        token: &str,
        envelope: Envelope,
        handler: &dyn QueueHandler,
    ) -> Result<bool, QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let attempt: i64 = self
            .pool
            .execute(|mut conn| async move {
                let reply: i64 = self
                    .scripts
                    .claim_keyed
                    .key(&self.keys.ready)
                    .key(&self.keys.attempts)
                    .key(ordering_key)
                    .arg(id)
                    .arg(now_ms)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(reply)
            })
            .await?;
        if attempt == 0 {
            return Ok(false);
        }

        let handling = run_handler(envelope, attempt, handler);
        tokio::pin!(handling);

        let renew_every = self.config.lock_ttl / 3;
        let mut renewal =
            tokio::time::interval_at(tokio::time::Instant::now() + renew_every, renew_every);
        loop {
            tokio::select! {
                _ = &mut handling => break,
                _ = renewal.tick() => {
                    match self.renew_lock(lock_key, token).await {
                        Ok(true) => {}
                        Ok(false) => tracing::warn!(ordering_key = lock_key, "Ordering lock expired while handling"),
                        Err(e) => tracing::warn!(error = %e, "Failed to renew ordering lock"),
                    }
                }
            }
        }

        self.remove(id).await?;
        Ok(true)
    }

    async fn renew_lock(&self, lock_key: &str, token: &str) -> Result<bool, QueueError> {
        let ttl_ms = self.config.lock_ttl.as_millis() as u64;
        let renewed: i64 = self
            .pool
            .execute(|mut conn| async move {
                let reply: i64 = self
                    .scripts
                    .renew_lock
                    .key(lock_key)
                    .arg(token)
                    .arg(ttl_ms)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(reply)
            })
            .await?;
        Ok(renewed == 1)
    }

    async fn release_lock(&self, lock_key: &str, token: &str) -> Result<(), QueueError> {
        let released: i64 = self
            .pool
            .execute(|mut conn| async move {
                let reply: i64 = self
                    .scripts
                    .release_lock
                    .key(lock_key)
                    .arg(token)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(reply)
            })
            .await?;
        if released == 0 {
            tracing::warn!(lock = lock_key, "Ordering lock was already gone at release");
        }
        Ok(())
    }

    /// Delete every trace of an envelope and promote the next id of its
    /// ordering list, atomically.
    async fn remove(&self, id: &str) -> Result<(), QueueError> {
        let promoted: i64 = self
            .pool
            .execute(|mut conn| async move {
                let reply: i64 = self
                    .scripts
                    .remove
                    .key(&self.keys.queue)
                    .key(&self.keys.ready)
                    .key(&self.keys.messages)
                    .key(&self.keys.attempts)
                    .key(&self.keys.ordering_lists)
                    .arg(id)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(reply)
            })
            .await?;
        if promoted == 1 {
            tracing::trace!(message_id = %id, "Next envelope of ordering key is ready");
        }
        Ok(())
    }
}

/// KEYS and ARGV of one [`ENQUEUE`] invocation.
#[derive(Debug)]
struct EnqueueBatch {
    keys: Vec<String>,
    args: Vec<String>,
}

impl EnqueueBatch {
    const FIXED_KEYS: usize = 4;

    fn build(keys: &RedisKeys, envelopes: &[Envelope]) -> Result<Self, QueueError> {
        let mut batch = Self {
            keys: vec![
                keys.messages.clone(),
                keys.queue.clone(),
                keys.ready.clone(),
                keys.ordering_lists.clone(),
            ],
            args: Vec::with_capacity(envelopes.len() * 4),
        };

        for envelope in envelopes {
            let list_index = match &envelope.ordering_key {
                Some(key) => batch.list_index(keys.ordering(key)),
                None => 0,
            };
            batch.args.push(envelope.id.to_string());
            batch
                .args
                .push(envelope.visible_at.timestamp_millis().to_string());
            batch.args.push(serde_json::to_string(envelope)?);
            batch.args.push(list_index.to_string());
        }
        Ok(batch)
    }

    /// 1-based Lua index of an ordering list, registering it on first use.
    fn list_index(&mut self, list: String) -> usize {
        let position = match self.keys[Self::FIXED_KEYS..]
            .iter()
            .position(|existing| *existing == list)
        {
            Some(offset) => Self::FIXED_KEYS + offset,
            None => {
                self.keys.push(list);
                self.keys.len() - 1
            }
        };
        position + 1
    }
}

async fn run_handler(
    envelope: Envelope,
    attempt: i64,
    handler: &dyn QueueHandler,
) -> HandlerOutcome {
    let span = tracing::debug_span!(
        "queue.process",
        backend = BACKEND,
        message_id = %envelope.id,
        ordering_key = envelope.ordering_key.as_deref().unwrap_or(""),
        attempt,
    );
    async {
        let outcome = invoke_handler(BACKEND, handler, envelope.payload).await;
        tracing::debug!(success = outcome.is_success(), "Envelope handled");
        outcome
    }
    .instrument(span)
    .await
}

#[async_trait]
impl MessageQueue for RedisMessageQueue {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn enqueue(&self, message: Value, options: EnqueueOptions) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.initialize().await?;
        self.write_all(vec![message], &options).await
    }

    async fn enqueue_many(
        &self,
        messages: Vec<Value>,
        options: EnqueueOptions,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        if messages.is_empty() {
            return Ok(());
        }
        self.initialize().await?;
        self.write_all(messages, &options).await
    }

    async fn listen(
        &self,
        handler: Arc<dyn QueueHandler>,
        options: ListenOptions,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.initialize().await?;

        let signal = options.signal;
        let wake = Arc::new(Notify::new());
        let stop_subscriber = self.shutdown.child_token();
        let subscriber_task = tokio::spawn(Self::run_subscriber(
            self.pool.clone(),
            self.keys.channel.clone(),
            wake.clone(),
            stop_subscriber.clone(),
        ));

        wake.notify_one();

        let mut backoff = ExponentialBackoff::with_config(self.config.poll_backoff.clone());
        tracing::info!(prefix = %self.keys.prefix, "Redis listen loop started");

        'outer: loop {
            tokio::select! {
                biased;
                _ = signal.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                _ = wake.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            loop {
                if signal.is_cancelled() || self.shutdown.is_cancelled() {
                    break 'outer;
                }
                match self.poll_once(handler.as_ref(), &signal).await {
                    Ok(true) => backoff.reset(),
                    Ok(false) => {
                        backoff.reset();
                        break;
                    }
                    Err(e) => {
                        QueueMetrics::record_poll_error(BACKEND);
                        let delay = backoff.next_delay();
                        tracing::warn!(
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Redis poll failed"
                        );
                        tokio::select! {
                            _ = signal.cancelled() => break 'outer,
                            _ = self.shutdown.cancelled() => break 'outer,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        break;
                    }
                }
            }
        }

        stop_subscriber.cancel();
        if let Err(e) = subscriber_task.await {
            tracing::warn!(error = %e, "Pub/sub task ended abnormally");
        }
        tracing::info!(prefix = %self.keys.prefix, "Redis listen loop stopped");
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.pool.reset().await;
        tracing::info!(prefix = %self.keys.prefix, "Redis queue closed");
        Ok(())
    }
}
