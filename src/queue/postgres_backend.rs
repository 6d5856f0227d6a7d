//! PostgreSQL message queue backend.
//!
//! Envelopes are rows in one table. Consumers find work by polling; a
//! `LISTEN` connection turns `pg_notify` from producers into immediate
//! wake-ups, but polling alone is enough for correctness, so a failed
//! subscription only costs latency.
//!
//! Table structure:
//! - `id uuid` primary key
//! - `seq bigserial` enqueue order within an ordering key
//! - `message jsonb` payload
//! - `ordering_key text` nullable
//! - `visible_at timestamptz` not handed out before this instant
//! - `created timestamptz`, `attempt integer` bookkeeping
//!
//! Keyed rows are serialized with a session-level advisory lock on
//! `(hashtext(table), hashtext(key))`, held on one reserved pool connection
//! from lock to delete to unlock. Unkeyed rows are claimed by pushing
//! `visible_at` forward by a lease, so a crashed consumer's row reappears.
//!
//! Each running `listen` call holds two pool connections (the `LISTEN`
//! session and the one reserved while a keyed row is locked), and a handler
//! that enqueues needs one more. The pool must therefore allow more than
//! twice as many connections as there are concurrent `listen` calls.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgListener, PgPool, Postgres};
use tokio::sync::{Notify, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::backoff::{BackoffConfig, ExponentialBackoff};
use crate::config::QueueConfig;
use crate::metrics::QueueMetrics;

use super::backend::{
    invoke_handler, EnqueueOptions, ListenOptions, MessageQueue, QueueError, QueueHandler,
};

const BACKEND: &str = "postgres";

/// Settings for [`PostgresMessageQueue`].
///
/// The pool handed to the queue needs `max_connections > 2 * listen loops`;
/// `listen` logs a warning when it is smaller.
#[derive(Debug, Clone)]
pub struct PostgresQueueConfig {
    pub table_name: String,
    /// `LISTEN`/`NOTIFY` channel
    pub channel_name: String,
    pub poll_interval: Duration,
    /// Candidates fetched per poll
    pub batch_size: i64,
    /// Invisibility window for a claimed unkeyed row
    pub lease_duration: Duration,
    /// Bound on each database round-trip
    pub operation_timeout: Duration,
    /// Create the table and indexes on first use
    pub initialize: bool,
    /// Backoff while the database is unreachable
    pub poll_backoff: BackoffConfig,
}

impl Default for PostgresQueueConfig {
    fn default() -> Self {
        Self::from_settings(&QueueConfig::default())
    }
}

impl PostgresQueueConfig {
    pub fn from_settings(settings: &QueueConfig) -> Self {
        Self {
            table_name: settings.postgres_table.clone(),
            channel_name: settings.postgres_channel.clone(),
            poll_interval: settings.poll_interval(),
            batch_size: settings.batch_size.max(1) as i64,
            lease_duration: settings.lease_duration(),
            operation_timeout: settings.operation_timeout(),
            initialize: true,
            poll_backoff: BackoffConfig {
                initial_delay_ms: 500,
                max_delay_ms: settings.poll_interval_ms.max(1_000) * 6,
                multiplier: 2.0,
                jitter_factor: 0.1,
            },
        }
    }

    fn validate(&self) -> Result<(), QueueError> {
        validate_identifier("table_name", &self.table_name)?;
        validate_identifier("channel_name", &self.channel_name)?;
        if self.batch_size < 1 {
            return Err(QueueError::Configuration(
                "batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Identifiers are interpolated into SQL, so only plain names are accepted.
fn validate_identifier(field: &str, value: &str) -> Result<(), QueueError> {
    let mut chars = value.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && value.len() <= 63 {
        Ok(())
    } else {
        Err(QueueError::Configuration(format!(
            "{field} must be a plain SQL identifier, got {value:?}"
        )))
    }
}

/// Session advisory lock held on a reserved connection.
///
/// If the guard is dropped without a successful [`release`](Self::release)
/// (handler future dropped, unlock failed or timed out) the connection is
/// closed instead of returned to the pool; ending the session is what frees
/// the lock.
struct AdvisoryLock<'c> {
    conn: &'c mut PoolConnection<Postgres>,
    table: &'c str,
    key: &'c str,
    armed: bool,
}

impl<'c> AdvisoryLock<'c> {
    fn connection(&mut self) -> &mut PoolConnection<Postgres> {
        &mut *self.conn
    }

    async fn release(mut self, timeout: Duration) -> Result<(), QueueError> {
        let unlocked = tokio::time::timeout(
            timeout,
            sqlx::query_scalar::<_, bool>(
                "SELECT pg_advisory_unlock(hashtext($1), hashtext($2))",
            )
            .bind(self.table)
            .bind(self.key)
            .fetch_one(&mut **self.conn),
        )
        .await
        .map_err(|_| QueueError::Timeout(timeout))??;

        if unlocked {
            self.armed = false;
            Ok(())
        } else {
            Err(QueueError::Unavailable(format!(
                "advisory lock for ordering key {:?} was not held at unlock",
                self.key
            )))
        }
    }
}

impl Drop for AdvisoryLock<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(
                ordering_key = self.key,
                "Advisory lock not released cleanly; closing its connection"
            );
            self.conn.close_on_drop();
        }
    }
}

/// PostgreSQL implementation of [`MessageQueue`].
pub struct PostgresMessageQueue {
    pool: PgPool,
    config: PostgresQueueConfig,
    initialized: OnceCell<()>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    active_listeners: AtomicUsize,
}

impl PostgresMessageQueue {
    pub fn new(pool: PgPool, config: PostgresQueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            pool,
            config,
            initialized: OnceCell::new(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            active_listeners: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &PostgresQueueConfig {
        &self.config
    }

    fn table(&self) -> &str {
        &self.config.table_name
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, QueueError>
    where
        F: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let timeout = self.config.operation_timeout;
        match tokio::time::timeout(timeout, operation).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(QueueError::Timeout(timeout)),
        }
    }

    /// Create the table once per instance. Concurrent first callers share a
    /// single attempt; a failed attempt leaves the cell empty for the next call.
    pub async fn initialize(&self) -> Result<(), QueueError> {
        if !self.config.initialize {
            return Ok(());
        }
        self.initialized
            .get_or_try_init(|| self.create_schema())
            .await
            .map(|_| ())
    }

    async fn create_schema(&self) -> Result<(), QueueError> {
        let table = self.table();
        let mut tx = self.bounded(self.pool.begin()).await?;

        // Serializes setup across processes; released at commit.
        self.bounded(
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(table)
                .execute(&mut *tx),
        )
        .await?;

        self.bounded(
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id uuid PRIMARY KEY,
                    seq bigserial NOT NULL,
                    message jsonb NOT NULL,
                    ordering_key text,
                    visible_at timestamptz NOT NULL DEFAULT now(),
                    created timestamptz NOT NULL DEFAULT now(),
                    attempt integer NOT NULL DEFAULT 0
                )
                "#
            ))
            .execute(&mut *tx),
        )
        .await?;

        self.bounded(
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {table}_visible_idx ON {table} (visible_at, seq)"
            ))
            .execute(&mut *tx),
        )
        .await?;

        self.bounded(
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {table}_ordering_idx ON {table} (ordering_key, seq) \
                 WHERE ordering_key IS NOT NULL"
            ))
            .execute(&mut *tx),
        )
        .await?;

        self.bounded(tx.commit()).await?;

        tracing::info!(table = %table, "PostgreSQL queue table ready");
        Ok(())
    }

    async fn insert_all(
        &self,
        messages: Vec<Value>,
        options: &EnqueueOptions,
    ) -> Result<(), QueueError> {
        let table = self.table();
        let delay_ms = options.delay_ms() as i64;
        let count = messages.len() as u64;

        let mut tx = self.bounded(self.pool.begin()).await?;
        for message in messages {
            let id = Uuid::new_v4();
            self.bounded(
                sqlx::query(&format!(
                    "INSERT INTO {table} (id, message, ordering_key, visible_at) \
                     VALUES ($1, $2, $3, now() + ($4::bigint * interval '1 millisecond'))"
                ))
                .bind(id)
                .bind(message)
                .bind(options.ordering_key.as_deref())
                .bind(delay_ms)
                .execute(&mut *tx),
            )
            .await?;

            tracing::debug!(
                message_id = %id,
                ordering_key = ?options.ordering_key,
                delay_ms,
                "Envelope enqueued"
            );
        }

        // Delivered to listeners only once the transaction commits.
        self.bounded(
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(&self.config.channel_name)
                .bind(delay_ms.to_string())
                .execute(&mut *tx),
        )
        .await?;

        self.bounded(tx.commit()).await?;
        QueueMetrics::record_enqueued(BACKEND, count);
        Ok(())
    }

    /// Forward notifications into `wake` until `stop` fires.
    ///
    /// A delayed enqueue carries its delay as the payload and wakes the loop
    /// once that delay has passed.
    async fn run_notification_listener(
        pool: PgPool,
        channel: String,
        wake: Arc<Notify>,
        stop: CancellationToken,
    ) {
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!(error = %e, "Could not open LISTEN connection; falling back to polling");
                return;
            }
        };
        if let Err(e) = listener.listen(&channel).await {
            tracing::warn!(error = %e, channel = %channel, "LISTEN failed; falling back to polling");
            return;
        }
        tracing::debug!(channel = %channel, "Listening for queue notifications");

        let mut backoff = ExponentialBackoff::new();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                received = listener.recv() => match received {
                    Ok(notification) => {
                        backoff.reset();
                        let delay_ms: u64 = notification.payload().parse().unwrap_or(0);
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
                    Err(e) => {
                        // recv() reconnects on the next call; anything missed
                        // meanwhile is picked up by the poll.
                        let delay = backoff.next_delay();
                        tracing::warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Queue notification listener error");
                        wake.notify_one();
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                },
            }
        }
    }

    /// One poll cycle on a reserved connection. Returns whether any envelope
    /// was handed to the handler.
    async fn poll_once(
        &self,
        handler: &dyn QueueHandler,
        signal: &CancellationToken,
    ) -> Result<bool, QueueError> {
        let table = self.table();
        let mut conn = self.bounded(self.pool.acquire()).await?;

        let candidates: Vec<(Uuid, Option<String>)> = self
            .bounded(
                sqlx::query_as(&format!(
                    r#"
                    SELECT id, ordering_key FROM {table} AS q
                    WHERE q.visible_at <= now()
                      AND (
                        q.ordering_key IS NULL
                        OR NOT EXISTS (
                            SELECT 1 FROM {table} AS earlier
                            WHERE earlier.ordering_key = q.ordering_key
                              AND earlier.seq < q.seq
                        )
                      )
                    ORDER BY q.visible_at, q.seq
                    LIMIT $1
                    "#
                ))
                .bind(self.config.batch_size)
                .fetch_all(&mut *conn),
            )
            .await?;

        let mut handled_any = false;
        for (id, ordering_key) in candidates {
            if signal.is_cancelled() || self.shutdown.is_cancelled() {
                break;
            }
            let handled = match ordering_key {
                Some(key) => self.process_keyed(&mut conn, id, &key, handler).await?,
                None => self.process_unkeyed(&mut conn, id, handler).await?,
            };
            handled_any |= handled;
        }

        Ok(handled_any)
    }

    async fn process_keyed(
        &self,
        conn: &mut PoolConnection<Postgres>,
        id: Uuid,
        key: &str,
        handler: &dyn QueueHandler,
    ) -> Result<bool, QueueError> {
        let table = self.table();

        // Called once, as a scalar, so every successful acquire is paired
        // with exactly one unlock below.
        let acquired: bool = self
            .bounded(
                sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1), hashtext($2))")
                    .bind(table)
                    .bind(key)
                    .fetch_one(&mut **conn),
            )
            .await?;

        if !acquired {
            QueueMetrics::record_lock_contended(BACKEND);
            tracing::trace!(ordering_key = key, "Ordering key busy; skipping");
            return Ok(false);
        }

        let mut lock = AdvisoryLock {
            conn,
            table,
            key,
            armed: true,
        };

        // Another consumer may have finished this row between our select
        // and the lock.
        let claimed: Option<(Value, i32)> = self
            .bounded(
                sqlx::query_as(&format!(
                    "UPDATE {table} SET attempt = attempt + 1 \
                     WHERE id = $1 AND visible_at <= now() \
                     RETURNING message, attempt"
                ))
                .bind(id)
                .fetch_optional(&mut **lock.connection()),
            )
            .await?;

        let handled = match claimed {
            Some((message, attempt)) => {
                self.handle_row(id, Some(key), attempt, message, handler).await;
                self.bounded(
                    sqlx::query(&format!("DELETE FROM {table} WHERE id = $1"))
                        .bind(id)
                        .execute(&mut **lock.connection()),
                )
                .await?;
                true
            }
            None => false,
        };

        lock.release(self.config.operation_timeout).await?;
        Ok(handled)
    }

    async fn process_unkeyed(
        &self,
        conn: &mut PoolConnection<Postgres>,
        id: Uuid,
        handler: &dyn QueueHandler,
    ) -> Result<bool, QueueError> {
        let table = self.table();
        let lease_ms = self.config.lease_duration.as_millis() as i64;

        let claimed: Option<(Value, i32)> = self
            .bounded(
                sqlx::query_as(&format!(
                    "UPDATE {table} \
                     SET visible_at = now() + ($2::bigint * interval '1 millisecond'), \
                         attempt = attempt + 1 \
                     WHERE id = $1 AND visible_at <= now() \
                     RETURNING message, attempt"
                ))
                .bind(id)
                .bind(lease_ms)
                .fetch_optional(&mut **conn),
            )
            .await?;

        let Some((message, attempt)) = claimed else {
            return Ok(false);
        };

        self.handle_row(id, None, attempt, message, handler).await;

        self.bounded(
            sqlx::query(&format!("DELETE FROM {table} WHERE id = $1"))
                .bind(id)
                .execute(&mut **conn),
        )
        .await?;

        Ok(true)
    }

    async fn handle_row(
        &self,
        id: Uuid,
        ordering_key: Option<&str>,
        attempt: i32,
        message: Value,
        handler: &dyn QueueHandler,
    ) {
        let span = tracing::debug_span!(
            "queue.process",
            backend = BACKEND,
            message_id = %id,
            ordering_key = ordering_key.unwrap_or(""),
            attempt,
        );
        async {
            let outcome = invoke_handler(BACKEND, handler, message).await;
            tracing::debug!(success = outcome.is_success(), "Envelope handled");
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl MessageQueue for PostgresMessageQueue {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn enqueue(&self, message: Value, options: EnqueueOptions) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.initialize().await?;
        self.insert_all(vec![message], &options).await
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
        self.insert_all(messages, &options).await
    }

    async fn listen(
        &self,
        handler: Arc<dyn QueueHandler>,
        options: ListenOptions,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.initialize().await?;

        let loops = self.active_listeners.fetch_add(1, Ordering::AcqRel) + 1;
        let max_connections = self.pool.options().get_max_connections();
        if !pool_fits_listeners(max_connections, loops) {
            tracing::warn!(
                max_connections,
                listen_loops = loops,
                "PostgreSQL pool too small for its listen loops; keyed handlers that enqueue may stall"
            );
        }

        let signal = options.signal;
        let wake = Arc::new(Notify::new());
        let stop_listener = self.shutdown.child_token();
        let listener_task = tokio::spawn(Self::run_notification_listener(
            self.pool.clone(),
            self.config.channel_name.clone(),
            wake.clone(),
            stop_listener.clone(),
        ));

        // Rows enqueued before we started are found by this first poll.
        wake.notify_one();

        let mut backoff = ExponentialBackoff::with_config(self.config.poll_backoff.clone());
        tracing::info!(table = %self.table(), "PostgreSQL listen loop started");

        'outer: loop {
            tokio::select! {
                biased;
                _ = signal.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                // A permit stored while we were polling yields exactly one
                // follow-up poll.
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
                            "PostgreSQL poll failed"
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

        stop_listener.cancel();
        if let Err(e) = listener_task.await {
            tracing::warn!(error = %e, "Notification listener task ended abnormally");
        }
        self.active_listeners.fetch_sub(1, Ordering::AcqRel);
        tracing::info!(table = %self.table(), "PostgreSQL listen loop stopped");
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.pool.close().await;
        tracing::info!(table = %self.table(), "PostgreSQL queue closed");
        Ok(())
    }
}

/// One `LISTEN` session and one reserved connection per loop, plus room
/// for a handler to enqueue.
fn pool_fits_listeners(max_connections: u32, loops: usize) -> bool {
    max_connections as usize > loops * 2
}
