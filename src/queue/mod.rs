//! Message queue abstraction and its backends.
//!
//! Every backend implements [`MessageQueue`]: at-least-once delivery,
//! optional per-key ordering, delayed visibility.
//!
//! - `memory_backend`: in-process, for tests and single-process deployments
//! - `postgres_backend`: table + advisory locks + LISTEN/NOTIFY
//! - `redis_backend`: sorted set + lock keys + pub/sub
//! - `amqp_backend`: RabbitMQ with consistent-hash partitions and TTL delay queues

pub mod amqp_backend;
pub mod backend;
pub mod envelope;
pub mod factory;
pub mod memory_backend;
pub mod postgres_backend;
pub mod redis_backend;

pub use amqp_backend::{AmqpMessageQueue, AmqpQueueConfig};
pub use backend::{
    handler_fn, invoke_handler, EnqueueOptions, HandlerOutcome, ListenOptions, MessageQueue,
    QueueError, QueueHandler,
};
pub use envelope::Envelope;
pub use factory::create_queue;
pub use memory_backend::{InProcessMessageQueue, InProcessQueueConfig};
pub use postgres_backend::{PostgresMessageQueue, PostgresQueueConfig};
pub use redis_backend::{RedisMessageQueue, RedisQueueConfig};
