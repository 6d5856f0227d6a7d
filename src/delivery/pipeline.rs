//! The fan-out / outbox / inbox pipeline layered over a [`MessageQueue`].
//!
//! Producers call [`DeliveryPipeline::send_activity`] or
//! [`DeliveryPipeline::enqueue_inbox`]; workers call
//! [`DeliveryPipeline::listen`], which consumes every configured queue and
//! routes each decoded [`Message`] to its stage:
//!
//! ```text
//! send_activity ─┬─> Fanout ──> Outbox* ──> ActivitySender
//!                └────────────> Outbox* ──> ActivitySender
//! enqueue_inbox ──────────────> Inbox ────> InboxListener
//! ```
//!
//! Failed outbox and inbox messages are retried either by the backend
//! (when the queue reports `native_retrial`) or by re-enqueueing them with
//! a [`RetryPolicy`] delay, never both.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::metrics::DeliveryMetrics;
use crate::queue::{EnqueueOptions, ListenOptions, MessageQueue, QueueError, QueueHandler};
use crate::telemetry::{attach_trace_context, attributes, inject_trace_context, record_attributes};

use super::listeners::{InboxContext, InboxListeners};
use super::message::{
    activity_id_of, activity_type_of, outbox_ordering_key, FanoutMessage, InboxMessage, Message,
    OutboxMessage, RecipientMap, SenderKeyPair,
};
use super::retry::RetryPolicy;
use super::sender::{ActivitySender, HttpActivitySender, RequestSigner, SendError};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error("inbox listener failed: {0:#}")]
    Listener(anyhow::Error),

    #[error("no inbox listener registered for activity type {0}")]
    NoListener(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("worker task failed: {0}")]
    Worker(String),
}

/// Called once for each message the pipeline drops for good.
#[async_trait]
pub trait PermanentFailureHandler: Send + Sync {
    async fn on_permanent_failure(&self, message: &Message, error: &DeliveryError);
}

/// Queues backing each stage. Stages may share one queue.
#[derive(Clone)]
pub struct QueueSet {
    pub fanout: Arc<dyn MessageQueue>,
    pub outbox: Arc<dyn MessageQueue>,
    pub inbox: Arc<dyn MessageQueue>,
}

impl QueueSet {
    pub fn shared(queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            fanout: queue.clone(),
            outbox: queue.clone(),
            inbox: queue,
        }
    }

    /// Each underlying queue once, in stage order.
    fn distinct(&self) -> Vec<Arc<dyn MessageQueue>> {
        let mut queues: Vec<Arc<dyn MessageQueue>> = Vec::with_capacity(3);
        for queue in [&self.fanout, &self.outbox, &self.inbox] {
            if !queues.iter().any(|seen| Arc::ptr_eq(seen, queue)) {
                queues.push(queue.clone());
            }
        }
        queues
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FanoutMode {
    /// Fan out through the queue once the inbox count reaches the threshold
    #[default]
    Auto,
    /// Always enqueue a single fan-out message
    Force,
    /// Always enqueue one outbox message per inbox
    Skip,
}

impl FanoutMode {
    fn fans_out(self, inbox_count: usize, threshold: usize) -> bool {
        match self {
            FanoutMode::Force => true,
            FanoutMode::Skip => false,
            FanoutMode::Auto => inbox_count >= threshold,
        }
    }
}

/// An activity to deliver to a set of remote inboxes.
#[derive(Debug, Clone)]
pub struct SendActivity {
    pub activity: Value,
    pub recipients: RecipientMap,
    pub keys: Vec<SenderKeyPair>,
    pub collection_sync: Option<String>,
    pub ordering_key: Option<String>,
    pub fanout: FanoutMode,
}

impl SendActivity {
    pub fn new(activity: Value, recipients: RecipientMap) -> Self {
        Self {
            activity,
            recipients,
            keys: Vec::new(),
            collection_sync: None,
            ordering_key: None,
            fanout: FanoutMode::Auto,
        }
    }

    pub fn with_keys(mut self, keys: Vec<SenderKeyPair>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_collection_sync(mut self, digest: impl Into<String>) -> Self {
        self.collection_sync = Some(digest.into());
        self
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    pub fn with_fanout(mut self, mode: FanoutMode) -> Self {
        self.fanout = mode;
        self
    }
}

pub struct DeliveryPipelineBuilder {
    queues: QueueSet,
    config: DeliveryConfig,
    sender: Option<Arc<dyn ActivitySender>>,
    signer: Option<Arc<dyn RequestSigner>>,
    listeners: InboxListeners,
    failure_handler: Option<Arc<dyn PermanentFailureHandler>>,
    outbox_retry: Option<RetryPolicy>,
    inbox_retry: Option<RetryPolicy>,
}

impl DeliveryPipelineBuilder {
    pub fn config(mut self, config: DeliveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the HTTP sender, mostly for tests and custom transports.
    pub fn sender(mut self, sender: Arc<dyn ActivitySender>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Signer for the default HTTP sender. Ignored with a custom sender.
    pub fn signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn listeners(mut self, listeners: InboxListeners) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn on_permanent_failure(mut self, handler: Arc<dyn PermanentFailureHandler>) -> Self {
        self.failure_handler = Some(handler);
        self
    }

    pub fn outbox_retry(mut self, policy: RetryPolicy) -> Self {
        self.outbox_retry = Some(policy);
        self
    }

    pub fn inbox_retry(mut self, policy: RetryPolicy) -> Self {
        self.inbox_retry = Some(policy);
        self
    }

    pub fn build(self) -> Result<DeliveryPipeline, DeliveryError> {
        let sender = match self.sender {
            Some(sender) => sender,
            None => Arc::new(
                HttpActivitySender::new(&self.config, self.signer)
                    .map_err(|e| DeliveryError::Configuration(e.to_string()))?,
            ),
        };

        let native = NativeRetrial {
            outbox: self.queues.outbox.native_retrial(),
            inbox: self.queues.inbox.native_retrial(),
        };

        let outbox_retry = self
            .outbox_retry
            .unwrap_or_else(|| RetryPolicy::from(&self.config.outbox_retry));
        let inbox_retry = self
            .inbox_retry
            .unwrap_or_else(|| RetryPolicy::from(&self.config.inbox_retry));

        tracing::info!(
            fanout_backend = self.queues.fanout.backend_name(),
            outbox_backend = self.queues.outbox.backend_name(),
            inbox_backend = self.queues.inbox.backend_name(),
            outbox_native_retrial = native.outbox,
            inbox_native_retrial = native.inbox,
            "Delivery pipeline configured"
        );

        Ok(DeliveryPipeline {
            inner: Arc::new(Inner {
                queues: self.queues,
                native,
                sender,
                listeners: self.listeners,
                failure_handler: self.failure_handler,
                outbox_retry,
                inbox_retry,
                worker_count: self.config.worker_count.max(1),
                fanout_threshold: self.config.fanout_threshold,
            }),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct NativeRetrial {
    outbox: bool,
    inbox: bool,
}

struct Inner {
    queues: QueueSet,
    native: NativeRetrial,
    sender: Arc<dyn ActivitySender>,
    listeners: InboxListeners,
    failure_handler: Option<Arc<dyn PermanentFailureHandler>>,
    outbox_retry: RetryPolicy,
    inbox_retry: RetryPolicy,
    worker_count: usize,
    fanout_threshold: usize,
}

#[derive(Clone, Copy)]
enum Stage {
    Outbox,
    Inbox,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Outbox => "outbox",
            Stage::Inbox => "inbox",
        }
    }
}

/// Cheap to clone; clones share queues, sender and listeners.
#[derive(Clone)]
pub struct DeliveryPipeline {
    inner: Arc<Inner>,
}

impl DeliveryPipeline {
    pub fn builder(queues: QueueSet) -> DeliveryPipelineBuilder {
        DeliveryPipelineBuilder {
            queues,
            config: DeliveryConfig::default(),
            sender: None,
            signer: None,
            listeners: InboxListeners::new(),
            failure_handler: None,
            outbox_retry: None,
            inbox_retry: None,
        }
    }

    /// Queue `request.activity` for delivery to every inbox in
    /// `request.recipients`.
    pub async fn send_activity(&self, request: SendActivity) -> Result<(), DeliveryError> {
        if request.recipients.is_empty() {
            tracing::debug!("No recipients, nothing to deliver");
            return Ok(());
        }

        let activity_type = activity_type_of(&request.activity);
        let inbox_count = request.recipients.len();
        let span = tracing::info_span!(
            "delivery.send_activity",
            activity_type = %activity_type,
            inboxes = inbox_count,
            ordering_key = request.ordering_key.as_deref().unwrap_or(""),
        );
        let trace_context = span.in_scope(inject_trace_context);

        let fanout = FanoutMessage {
            id: Uuid::new_v4(),
            activity_id: activity_id_of(&request.activity),
            activity: request.activity,
            activity_type,
            inboxes: request.recipients,
            keys: request.keys,
            collection_sync: request.collection_sync,
            ordering_key: request.ordering_key,
            trace_context,
        };

        let fan_out = request
            .fanout
            .fans_out(inbox_count, self.inner.fanout_threshold);

        async move {
            if fan_out {
                let mut options = EnqueueOptions::new();
                if let Some(key) = &fanout.ordering_key {
                    options = options.with_ordering_key(key.clone());
                }
                let id = fanout.id;
                self.inner
                    .queues
                    .fanout
                    .enqueue(Message::Fanout(fanout).to_value()?, options)
                    .await?;
                tracing::debug!(message_id = %id, "Enqueued fan-out message");
                Ok(())
            } else {
                self.enqueue_outbox(expand_fanout(&fanout, Utc::now())).await
            }
        }
        .instrument(span)
        .await
    }

    /// Queue a received activity for the inbox listeners. `identifier` is the
    /// local recipient, `None` for the shared inbox.
    pub async fn enqueue_inbox(
        &self,
        activity: Value,
        identifier: Option<String>,
        ordering_key: Option<String>,
    ) -> Result<(), DeliveryError> {
        let message = InboxMessage {
            id: Uuid::new_v4(),
            activity,
            identifier,
            attempt: 0,
            started: Utc::now(),
            ordering_key,
            trace_context: inject_trace_context(),
        };

        let mut options = EnqueueOptions::new();
        if let Some(key) = &message.ordering_key {
            options = options.with_ordering_key(key.clone());
        }
        let id = message.id;
        self.inner
            .queues
            .inbox
            .enqueue(Message::Inbox(message).to_value()?, options)
            .await?;
        tracing::debug!(message_id = %id, "Enqueued inbox message");
        Ok(())
    }

    /// Run `worker_count` listen loops on every distinct queue until
    /// `signal` is cancelled.
    ///
    /// When one loop fails to start the others are stopped and the first
    /// error is returned.
    pub async fn listen(&self, signal: CancellationToken) -> Result<(), DeliveryError> {
        let stop = signal.child_token();
        let handler: Arc<dyn QueueHandler> = Arc::new(self.clone());

        let mut workers = Vec::new();
        for queue in self.inner.queues.distinct() {
            for worker in 0..self.inner.worker_count {
                let queue = queue.clone();
                let handler = handler.clone();
                let stop = stop.clone();
                workers.push(tokio::spawn(async move {
                    tracing::debug!(backend = queue.backend_name(), worker, "Starting delivery worker");
                    let result = queue.listen(handler, ListenOptions::new(stop.clone())).await;
                    if let Err(e) = &result {
                        tracing::error!(backend = queue.backend_name(), worker, error = %e, "Delivery worker stopped");
                        stop.cancel();
                    }
                    result
                }));
            }
        }

        let mut first_error = None;
        for joined in join_all(workers).await {
            let result = match joined {
                Ok(result) => result.map_err(DeliveryError::from),
                Err(e) => Err(DeliveryError::Worker(e.to_string())),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Close every distinct queue.
    pub async fn close(&self) -> Result<(), DeliveryError> {
        for queue in self.inner.queues.distinct() {
            queue.close().await?;
        }
        Ok(())
    }

    async fn process(&self, message: Message) -> Result<(), DeliveryError> {
        match message {
            Message::Fanout(fanout) => self.process_fanout(fanout).await,
            Message::Outbox(outbox) => self.process_outbox(outbox).await,
            Message::Inbox(inbox) => self.process_inbox(inbox).await,
        }
    }

    async fn process_fanout(&self, fanout: FanoutMessage) -> Result<(), DeliveryError> {
        let messages = expand_fanout(&fanout, Utc::now());
        tracing::debug!(message_id = %fanout.id, inboxes = messages.len(), "Fanning out activity");
        self.enqueue_outbox(messages).await
    }

    async fn enqueue_outbox(&self, messages: Vec<OutboxMessage>) -> Result<(), DeliveryError> {
        let count = messages.len();
        let queue = &self.inner.queues.outbox;

        if messages.iter().all(|m| m.ordering_key.is_none()) {
            let values = messages
                .into_iter()
                .map(|m| Message::Outbox(m).to_value())
                .collect::<Result<Vec<_>, _>>()?;
            queue.enqueue_many(values, EnqueueOptions::new()).await?;
        } else {
            for message in messages {
                let mut options = EnqueueOptions::new();
                if let Some(key) = &message.ordering_key {
                    options = options.with_ordering_key(key.clone());
                }
                queue.enqueue(Message::Outbox(message).to_value()?, options).await?;
            }
        }

        DeliveryMetrics::record_fanout(count);
        Ok(())
    }

    async fn process_outbox(&self, message: OutboxMessage) -> Result<(), DeliveryError> {
        match self.inner.sender.send(&message).await {
            Ok(()) => {
                tracing::debug!(inbox = %message.inbox, attempt = message.attempt, "Activity delivered");
                Ok(())
            }
            Err(error) if error.is_transient() => {
                if let Some(status) = error.status() {
                    record_attributes(&tracing::Span::current(), [attributes::http_status(status)]);
                }
                tracing::warn!(
                    inbox = %message.inbox,
                    attempt = message.attempt,
                    error = %error,
                    "Delivery failed"
                );
                self.retry_or_give_up(Stage::Outbox, Message::Outbox(message), error.into())
                    .await
            }
            Err(error) => {
                if let Some(status) = error.status() {
                    record_attributes(&tracing::Span::current(), [attributes::http_status(status)]);
                }
                self.give_up(Stage::Outbox, &Message::Outbox(message), &DeliveryError::from(error))
                    .await;
                Ok(())
            }
        }
    }

    async fn process_inbox(&self, message: InboxMessage) -> Result<(), DeliveryError> {
        let activity_type = activity_type_of(&message.activity);
        let Some(listener) = self.inner.listeners.find(&activity_type).cloned() else {
            let error = DeliveryError::NoListener(activity_type);
            self.give_up(Stage::Inbox, &Message::Inbox(message), &error)
                .await;
            return Ok(());
        };

        let context = InboxContext {
            message_id: message.id,
            identifier: message.identifier.clone(),
            activity_type,
            attempt: message.attempt,
        };

        match listener.on_activity(&context, message.activity.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(
                    activity_type = %context.activity_type,
                    attempt = message.attempt,
                    error = %e,
                    "Inbox listener failed"
                );
                self.retry_or_give_up(Stage::Inbox, Message::Inbox(message), DeliveryError::Listener(e))
                    .await
            }
        }
    }

    async fn retry_or_give_up(
        &self,
        stage: Stage,
        message: Message,
        error: DeliveryError,
    ) -> Result<(), DeliveryError> {
        let (queue, native, policy) = match stage {
            Stage::Outbox => (
                &self.inner.queues.outbox,
                self.inner.native.outbox,
                &self.inner.outbox_retry,
            ),
            Stage::Inbox => (
                &self.inner.queues.inbox,
                self.inner.native.inbox,
                &self.inner.inbox_retry,
            ),
        };

        if native {
            return Err(error);
        }

        let failed_attempts = message.attempt() + 1;
        let elapsed = message.started().map(elapsed_since).unwrap_or_default();
        let Some(delay) = policy.next_delay(failed_attempts, elapsed) else {
            self.give_up(stage, &message, &error).await;
            return Ok(());
        };

        let mut options = EnqueueOptions::new().with_delay(delay);
        if let Some(key) = message.ordering_key() {
            options = options.with_ordering_key(key);
        }
        queue.enqueue(message.next_attempt().to_value()?, options).await?;

        DeliveryMetrics::record_retry(stage.name());
        tracing::info!(
            stage = stage.name(),
            message_id = %message.id(),
            attempt = failed_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduled retry"
        );
        Ok(())
    }

    async fn give_up(&self, stage: Stage, message: &Message, error: &DeliveryError) {
        DeliveryMetrics::record_gave_up(stage.name());
        tracing::warn!(
            stage = stage.name(),
            message_id = %message.id(),
            attempt = message.attempt(),
            error = %error,
            "Giving up on message"
        );
        if let Some(handler) = &self.inner.failure_handler {
            handler.on_permanent_failure(message, error).await;
        }
    }
}

#[async_trait]
impl QueueHandler for DeliveryPipeline {
    async fn handle(&self, payload: Value) -> anyhow::Result<()> {
        let message: Message = match serde_json::from_value(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed queue message");
                return Ok(());
            }
        };

        let span = tracing::info_span!(
            "delivery.process",
            stage = message.kind(),
            message_id = %message.id(),
            attempt = message.attempt(),
        );
        attach_trace_context(&span, message.trace_context());
        record_attributes(&span, message_attributes(&message));

        self.process(message).instrument(span).await?;
        Ok(())
    }
}

fn message_attributes(message: &Message) -> Vec<opentelemetry::KeyValue> {
    let mut attrs = vec![attributes::message_id(message.id())];
    if let Some(key) = message.ordering_key() {
        attrs.push(attributes::ordering_key(key));
    }
    match message {
        Message::Fanout(m) => attrs.push(attributes::activity_type(&m.activity_type)),
        Message::Outbox(m) => {
            attrs.push(attributes::activity_type(&m.activity_type));
            attrs.push(attributes::inbox(m.inbox.as_str()));
        }
        Message::Inbox(m) => attrs.push(attributes::activity_type(&activity_type_of(&m.activity))),
    }
    attrs
}

/// One outbox message per inbox of `fanout`.
fn expand_fanout(fanout: &FanoutMessage, started: DateTime<Utc>) -> Vec<OutboxMessage> {
    fanout
        .inboxes
        .iter()
        .map(|(inbox, target)| OutboxMessage {
            id: Uuid::new_v4(),
            activity: fanout.activity.clone(),
            activity_id: fanout.activity_id.clone(),
            activity_type: fanout.activity_type.clone(),
            inbox: inbox.clone(),
            shared_inbox: target.shared_inbox,
            keys: fanout.keys.clone(),
            collection_sync: fanout.collection_sync.clone(),
            attempt: 0,
            started,
            ordering_key: fanout
                .ordering_key
                .as_deref()
                .map(|key| outbox_ordering_key(key, inbox)),
            trace_context: fanout.trace_context.clone(),
        })
        .collect()
}

fn elapsed_since(started: DateTime<Utc>) -> Duration {
    (Utc::now() - started).to_std().unwrap_or_default()
}
