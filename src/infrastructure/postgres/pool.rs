//! PostgreSQL connection pool shared by the queue backend.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use url::Url;

use crate::config::DatabaseConfig;

#[derive(Debug, Error)]
pub enum PostgresPoolError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Invalid database URL: {0}")]
    InvalidUrl(String),
}

/// Thin owner of a [`PgPool`] that remembers where it points for logging.
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
    database_url: String,
}

impl PostgresPool {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, PostgresPoolError> {
        let masked = mask_database_url(&config.url)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds as u64))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds as u64))
            .connect(&config.url)
            .await?;

        tracing::info!(
            pool_size = config.pool_size,
            database = %masked,
            "PostgreSQL connection pool created"
        );

        Ok(Self {
            pool,
            database_url: config.url.clone(),
        })
    }

    pub fn into_inner(self) -> PgPool {
        self.pool
    }

    /// Database URL with the password replaced, safe for logs.
    pub fn database_url_masked(&self) -> String {
        mask_database_url(&self.database_url).unwrap_or_default()
    }
}

fn mask_database_url(raw: &str) -> Result<String, PostgresPoolError> {
    if raw.is_empty() {
        return Ok(String::new());
    }
    let mut url = Url::parse(raw).map_err(|e| PostgresPoolError::InvalidUrl(e.to_string()))?;
    if url.password().is_some() {
        // Only fails for cannot-be-a-base URLs, which never carry a password.
        let _ = url.set_password(Some("***"));
    }
    Ok(url.to_string())
}
