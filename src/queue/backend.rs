//! The message queue contract shared by every backend.
//!
//! A backend stores opaque JSON payloads and hands them to a
//! [`QueueHandler`] from its `listen()` loop. Delivery is at-least-once:
//! an envelope is removed only after its handler finished, so a consumer
//! that crashes mid-handler leaves the envelope for someone else.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::metrics::QueueMetrics;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] crate::redis::PoolError),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage initialization failed; the next call retries it
    #[error("Queue setup failed: {0}")]
    Setup(String),

    #[error("Invalid queue configuration: {0}")]
    Configuration(String),

    #[error("Queue is closed")]
    Closed,

    #[error("Queue operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        QueueError::Redis(crate::redis::PoolError::Redis(e))
    }
}

/// Per-enqueue options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Keep the envelope invisible for this long
    pub delay: Option<Duration>,
    /// Envelopes sharing a key are handled one at a time, in enqueue order
    pub ordering_key: Option<String>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    /// Delay in whole milliseconds, zero when absent.
    pub fn delay_ms(&self) -> u64 {
        self.delay.map(|d| d.as_millis() as u64).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    /// Cancel to stop the loop; `listen()` returns once the in-flight
    /// handler has finished.
    pub signal: CancellationToken,
}

impl ListenOptions {
    pub fn new(signal: CancellationToken) -> Self {
        Self { signal }
    }
}

/// Consumer side of a queue.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, message: Value) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> QueueHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Value) -> anyhow::Result<()> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn QueueHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// How a handler invocation ended.
#[derive(Debug)]
pub enum HandlerOutcome {
    Completed,
    Failed(anyhow::Error),
    Panicked(String),
}

impl HandlerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, HandlerOutcome::Completed)
    }

    fn label(&self) -> &'static str {
        match self {
            HandlerOutcome::Completed => "ok",
            HandlerOutcome::Failed(_) => "error",
            HandlerOutcome::Panicked(_) => "panic",
        }
    }
}

/// Run the handler, turning errors and panics into a logged outcome so a
/// misbehaving handler can never take the listen loop down with it.
pub async fn invoke_handler(
    backend: &'static str,
    handler: &dyn QueueHandler,
    message: Value,
) -> HandlerOutcome {
    let started = Instant::now();

    let outcome = match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
        Ok(Ok(())) => HandlerOutcome::Completed,
        Ok(Err(e)) => {
            tracing::warn!(backend, error = %e, "Queue handler returned an error");
            HandlerOutcome::Failed(e)
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            tracing::error!(backend, panic = %reason, "Queue handler panicked");
            HandlerOutcome::Panicked(reason)
        }
    };

    QueueMetrics::record_processed(backend, outcome.label(), started.elapsed());
    outcome
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A queue backend.
///
/// # Thread Safety
///
/// Implementations are shared as `Arc<dyn MessageQueue>` between producers
/// and any number of concurrent `listen()` loops.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Short backend identifier used in logs and metrics.
    fn backend_name(&self) -> &'static str;

    /// Whether the backend redelivers a message whose handler failed.
    ///
    /// When true the delivery pipeline surfaces failures instead of
    /// re-enqueueing retries itself.
    fn native_retrial(&self) -> bool {
        false
    }

    async fn enqueue(&self, message: Value, options: EnqueueOptions) -> Result<(), QueueError>;

    /// Enqueue several messages with the same options.
    ///
    /// Backends with a bulk primitive make this all-or-nothing. The default
    /// stops at and returns the first failure.
    async fn enqueue_many(
        &self,
        messages: Vec<Value>,
        options: EnqueueOptions,
    ) -> Result<(), QueueError> {
        for message in messages {
            self.enqueue(message, options.clone()).await?;
        }
        Ok(())
    }

    /// Consume until `options.signal` is cancelled.
    ///
    /// Handler failures are logged, never returned. An `Err` means the loop
    /// could not start (setup failure, closed queue).
    async fn listen(
        &self,
        handler: Arc<dyn QueueHandler>,
        options: ListenOptions,
    ) -> Result<(), QueueError>;

    /// Release connections and subscriptions. Idempotent.
    async fn close(&self) -> Result<(), QueueError>;
}
