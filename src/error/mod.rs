use thiserror::Error;

use crate::postgres::PostgresPoolError;
use crate::queue::QueueError;
use crate::redis::PoolError;

/// Top-level error for wiring the crate together: loading settings, building
/// the configured backend, installing telemetry.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] PostgresPoolError),

    #[error("Redis error: {0}")]
    Redis(#[from] PoolError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
