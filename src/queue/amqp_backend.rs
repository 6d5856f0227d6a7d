//! AMQP (RabbitMQ) message queue backend.
//!
//! Topology:
//! - the main queue receives unkeyed messages through the default exchange
//! - an `x-consistent-hash` exchange routes keyed messages on the
//!   `x-ordering-key` header to one of `ordering_partitions` partition
//!   queues, each declared single-active-consumer so a key is only ever in
//!   one handler at a time
//! - delayed messages sit in a per-delay queue with `x-message-ttl` and are
//!   dead-lettered to the main queue or to the ordering exchange on expiry
//!
//! Consumers ack after the handler; a failed handler is either acked
//! (pipeline-managed retries) or nacked with requeue when native retrial is on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use futures::stream::{self, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::AmqpConfig;
use crate::metrics::QueueMetrics;

use super::backend::{
    invoke_handler, EnqueueOptions, ListenOptions, MessageQueue, QueueError, QueueHandler,
};

const BACKEND: &str = "amqp";
const ORDERING_HEADER: &str = "x-ordering-key";

/// Backend configuration; see [`AmqpConfig`] for the settings it is built from.
#[derive(Debug, Clone)]
pub struct AmqpQueueConfig {
    pub url: String,
    pub queue: String,
    pub delayed_queue_prefix: String,
    pub ordering_exchange: String,
    pub ordering_queue_prefix: String,
    pub ordering_partitions: u16,
    pub durable: bool,
    pub native_retrial: bool,
}

impl From<&AmqpConfig> for AmqpQueueConfig {
    fn from(config: &AmqpConfig) -> Self {
        Self {
            url: config.url.clone(),
            queue: config.queue.clone(),
            delayed_queue_prefix: config.delayed_queue_prefix.clone(),
            ordering_exchange: config.ordering_exchange.clone(),
            ordering_queue_prefix: config.ordering_queue_prefix.clone(),
            ordering_partitions: config.ordering_partitions,
            durable: config.durable,
            native_retrial: config.native_retrial,
        }
    }
}

impl Default for AmqpQueueConfig {
    fn default() -> Self {
        Self::from(&AmqpConfig::default())
    }
}

impl AmqpQueueConfig {
    fn validate(&self) -> Result<(), QueueError> {
        if self.queue.is_empty() || self.ordering_exchange.is_empty() {
            return Err(QueueError::Configuration(
                "queue and ordering_exchange must not be empty".to_string(),
            ));
        }
        if self.ordering_partitions == 0 {
            return Err(QueueError::Configuration(
                "ordering_partitions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn partition_queue(&self, index: u16) -> String {
        format!("{}{}", self.ordering_queue_prefix, index)
    }

    fn partition_queues(&self) -> Vec<String> {
        (0..self.ordering_partitions)
            .map(|i| self.partition_queue(i))
            .collect()
    }

    fn delay_queue(&self, delay_ms: u64, ordered: bool) -> String {
        if ordered {
            format!("{}ordered_{}", self.delayed_queue_prefix, delay_ms)
        } else {
            format!("{}{}", self.delayed_queue_prefix, delay_ms)
        }
    }
}

/// AMQP implementation of [`MessageQueue`].
pub struct AmqpMessageQueue {
    connection: Connection,
    publisher: Channel,
    config: AmqpQueueConfig,
    topology: OnceCell<()>,
    declared_delay_queues: DashSet<String>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl AmqpMessageQueue {
    /// Connect and open the publishing channel. Queues and exchanges are
    /// declared lazily on first use.
    pub async fn new(config: AmqpQueueConfig) -> Result<Self, QueueError> {
        config.validate()?;

        let connection = Connection::connect(
            &config.url,
            ConnectionProperties::default().with_connection_name("federation-queue".into()),
        )
        .await?;

        let publisher = connection.create_channel().await?;
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        tracing::info!(queue = %config.queue, "AMQP connection established");

        Ok(Self {
            connection,
            publisher,
            config,
            topology: OnceCell::new(),
            declared_delay_queues: DashSet::new(),
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

    fn queue_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            durable: self.config.durable,
            ..Default::default()
        }
    }

    async fn initialize(&self) -> Result<(), QueueError> {
        self.topology
            .get_or_try_init(|| self.declare_topology())
            .await
            .map(|_| ())
    }

    async fn declare_topology(&self) -> Result<(), QueueError> {
        let channel = &self.publisher;

        channel
            .queue_declare(&self.config.queue, self.queue_options(), FieldTable::default())
            .await
            .map_err(|e| QueueError::Setup(format!("declaring {}: {e}", self.config.queue)))?;

        let mut exchange_args = FieldTable::default();
        exchange_args.insert(
            "hash-header".into(),
            AMQPValue::LongString(ORDERING_HEADER.into()),
        );
        channel
            .exchange_declare(
                &self.config.ordering_exchange,
                ExchangeKind::Custom("x-consistent-hash".to_string()),
                ExchangeDeclareOptions {
                    durable: self.config.durable,
                    ..Default::default()
                },
                exchange_args,
            )
            .await
            .map_err(|e| {
                QueueError::Setup(format!(
                    "declaring exchange {} (is the consistent-hash plugin enabled?): {e}",
                    self.config.ordering_exchange
                ))
            })?;

        for partition in self.config.partition_queues() {
            let mut args = FieldTable::default();
            args.insert("x-single-active-consumer".into(), AMQPValue::Boolean(true));
            channel
                .queue_declare(&partition, self.queue_options(), args)
                .await
                .map_err(|e| QueueError::Setup(format!("declaring {partition}: {e}")))?;

            // For the consistent-hash exchange the binding key is the weight.
            channel
                .queue_bind(
                    &partition,
                    &self.config.ordering_exchange,
                    "1",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| QueueError::Setup(format!("binding {partition}: {e}")))?;
        }

        tracing::info!(
            queue = %self.config.queue,
            exchange = %self.config.ordering_exchange,
            partitions = self.config.ordering_partitions,
            "AMQP topology declared"
        );
        Ok(())
    }

    async fn ensure_delay_queue(
        &self,
        delay_ms: u64,
        ordered: bool,
    ) -> Result<String, QueueError> {
        let name = self.config.delay_queue(delay_ms, ordered);
        if self.declared_delay_queues.contains(&name) {
            return Ok(name);
        }

        let mut args = FieldTable::default();
        args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(delay_ms as i64));
        if ordered {
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(self.config.ordering_exchange.as_str().into()),
            );
        } else {
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString("".into()),
            );
            args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(self.config.queue.as_str().into()),
            );
        }

        self.publisher
            .queue_declare(&name, self.queue_options(), args)
            .await?;
        self.declared_delay_queues.insert(name.clone());
        tracing::debug!(queue = %name, delay_ms, "Delay queue declared");
        Ok(name)
    }

    async fn publish(&self, message: &Value, options: &EnqueueOptions) -> Result<(), QueueError> {
        let body = serde_json::to_vec(message)?;
        let id = Uuid::new_v4();
        let delay_ms = options.delay_ms();
        let ordered = options.ordering_key.is_some();

        let mut properties = BasicProperties::default()
            .with_message_id(id.to_string().into())
            .with_content_type("application/json".into())
            .with_delivery_mode(if self.config.durable { 2 } else { 1 });
        if let Some(key) = &options.ordering_key {
            let mut headers = FieldTable::default();
            headers.insert(ORDERING_HEADER.into(), AMQPValue::LongString(key.as_str().into()));
            properties = properties.with_headers(headers);
        }

        let (exchange, routing_key) = if delay_ms > 0 {
            (String::new(), self.ensure_delay_queue(delay_ms, ordered).await?)
        } else if ordered {
            (self.config.ordering_exchange.clone(), String::new())
        } else {
            (String::new(), self.config.queue.clone())
        };

        let confirmation = self
            .publisher
            .basic_publish(
                &exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;
        if confirmation.is_nack() {
            return Err(QueueError::Unavailable(format!(
                "broker rejected message {id}"
            )));
        }

        QueueMetrics::record_enqueued(BACKEND, 1);
        tracing::debug!(
            message_id = %id,
            ordering_key = ?options.ordering_key,
            delay_ms,
            "Message published"
        );
        Ok(())
    }

    async fn process(&self, delivery: Delivery, handler: &dyn QueueHandler) {
        let properties = &delivery.properties;
        let message_id = properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string())
            .unwrap_or_default();
        let ordering_key = properties
            .headers()
            .as_ref()
            .and_then(|headers| {
                headers
                    .inner()
                    .iter()
                    .find(|(name, _)| name.as_str() == ORDERING_HEADER)
                    .map(|(_, value)| value.clone())
            })
            .and_then(|value| match value {
                AMQPValue::LongString(s) => {
                    Some(String::from_utf8_lossy(s.as_bytes()).into_owned())
                }
                _ => None,
            });

        let span = tracing::debug_span!(
            "queue.process",
            backend = BACKEND,
            message_id = %message_id,
            ordering_key = ordering_key.as_deref().unwrap_or(""),
            redelivered = delivery.redelivered,
        );

        async {
            let message: Value = match serde_json::from_slice(&delivery.data) {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!(error = %e, "Undecodable message body; rejecting it");
                    let reject = BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    };
                    if let Err(e) = delivery.acker.nack(reject).await {
                        tracing::warn!(error = %e, "Failed to reject message");
                    }
                    return;
                }
            };

            let outcome = invoke_handler(BACKEND, handler, message).await;

            let settled = if outcome.is_success() || !self.config.native_retrial {
                delivery.acker.ack(BasicAckOptions::default()).await
            } else {
                let requeue = BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                };
                delivery.acker.nack(requeue).await
            };
            if let Err(e) = settled {
                tracing::warn!(error = %e, "Failed to settle message");
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl MessageQueue for AmqpMessageQueue {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn native_retrial(&self) -> bool {
        self.config.native_retrial
    }

    async fn enqueue(&self, message: Value, options: EnqueueOptions) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.initialize().await?;
        self.publish(&message, &options).await
    }

    async fn listen(
        &self,
        handler: Arc<dyn QueueHandler>,
        options: ListenOptions,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.initialize().await?;

        let signal = options.signal;
        let channel = self.connection.create_channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        let listener_id = Uuid::new_v4();
        let mut queues = vec![self.config.queue.clone()];
        queues.extend(self.config.partition_queues());

        let mut consumers = Vec::with_capacity(queues.len());
        for queue in &queues {
            let consumer = channel
                .basic_consume(
                    queue,
                    &format!("fedq-{listener_id}-{queue}"),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            consumers.push(consumer);
        }
        let mut deliveries = stream::select_all(consumers);

        tracing::info!(queues = ?queues, "AMQP listen loop started");
        let result = loop {
            tokio::select! {
                biased;
                _ = signal.cancelled() => break Ok(()),
                _ = self.shutdown.cancelled() => break Ok(()),
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => self.process(delivery, handler.as_ref()).await,
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "AMQP consumer failed");
                        break Err(QueueError::Amqp(e));
                    }
                    None => break Ok(()),
                },
            }
        };

        if channel.status().connected() {
            if let Err(e) = channel.close(200, "listener stopped").await {
                tracing::debug!(error = %e, "Failed to close consumer channel");
            }
        }
        tracing::info!("AMQP listen loop stopped");
        result
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();
        if self.connection.status().connected() {
            self.connection.close(200, "closing").await?;
        }
        tracing::info!("AMQP queue closed");
        Ok(())
    }
}
