//! Queue backend factory

use std::sync::Arc;

use crate::config::Settings;
use crate::error::AppError;
use crate::postgres::PostgresPool;
use crate::redis::RedisPool;

use super::amqp_backend::{AmqpMessageQueue, AmqpQueueConfig};
use super::backend::MessageQueue;
use super::memory_backend::{InProcessMessageQueue, InProcessQueueConfig};
use super::postgres_backend::{PostgresMessageQueue, PostgresQueueConfig};
use super::redis_backend::{RedisMessageQueue, RedisQueueConfig};

/// Build the backend named by `settings.queue.backend`.
///
/// - `"memory"`: [`InProcessMessageQueue`]
/// - `"postgres"`: [`PostgresMessageQueue`] on a pool built from `settings.database`
/// - `"redis"`: [`RedisMessageQueue`] on a pool built from `settings.redis`
/// - `"amqp"`: [`AmqpMessageQueue`] connected to `settings.amqp.url`
///
/// Any other value is rejected rather than silently falling back to memory.
///
/// # Example
///
/// ```rust,ignore
/// let settings = Settings::new()?;
/// let queue = create_queue(&settings).await?;
/// ```
pub async fn create_queue(settings: &Settings) -> Result<Arc<dyn MessageQueue>, AppError> {
    let queue = &settings.queue;

    match queue.backend.as_str() {
        "memory" => {
            tracing::info!(backend = "memory", "Creating in-process queue");
            Ok(Arc::new(InProcessMessageQueue::new(InProcessQueueConfig {
                poll_interval: queue.poll_interval(),
            })))
        }
        "postgres" => {
            let pool = PostgresPool::new(&settings.database).await?;
            tracing::info!(
                backend = "postgres",
                database = %pool.database_url_masked(),
                table = %queue.postgres_table,
                "Creating PostgreSQL queue"
            );
            let backend = PostgresMessageQueue::new(
                pool.into_inner(),
                PostgresQueueConfig::from_settings(queue),
            )?;
            Ok(Arc::new(backend))
        }
        "redis" => {
            let pool = Arc::new(RedisPool::new(&settings.redis)?);
            tracing::info!(
                backend = "redis",
                prefix = %queue.redis_prefix,
                "Creating Redis queue"
            );
            let backend = RedisMessageQueue::new(pool, RedisQueueConfig::from_settings(queue))?;
            Ok(Arc::new(backend))
        }
        "amqp" => {
            tracing::info!(
                backend = "amqp",
                queue = %settings.amqp.queue,
                native_retrial = settings.amqp.native_retrial,
                "Creating AMQP queue"
            );
            let backend = AmqpMessageQueue::new(AmqpQueueConfig::from(&settings.amqp)).await?;
            Ok(Arc::new(backend))
        }
        other => Err(AppError::Validation(format!(
            "unknown queue backend {other:?}; expected memory, postgres, redis or amqp"
        ))),
    }
}
