//! Redis connection pool for the queue backend.
//!
//! Commands share one multiplexed connection which is dropped and
//! re-established lazily when Redis reports an I/O failure. Pub/sub needs a
//! dedicated connection and is opened from [`RedisPool::client`].

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, RedisResult};
use tokio::sync::RwLock;

use crate::config::RedisConfig;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Connection not available: {0}")]
    ConnectionUnavailable(String),
}

impl PoolError {
    /// True when the failure is about reaching Redis rather than the command.
    pub fn is_connection_error(&self) -> bool {
        match self {
            PoolError::Redis(e) => {
                e.is_connection_dropped() || e.is_io_error() || e.is_connection_refusal()
            }
            PoolError::ConnectionUnavailable(_) => true,
        }
    }
}

pub struct RedisPool {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    url: String,
}

impl RedisPool {
    pub fn new(config: &RedisConfig) -> Result<Self, PoolError> {
        let client = Client::open(config.url.as_str())?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            url: config.url.clone(),
        })
    }

    /// Get the shared connection, connecting on first use.
    pub async fn get_connection(&self) -> Result<MultiplexedConnection, PoolError> {
        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        self.connect().await
    }

    async fn connect(&self) -> Result<MultiplexedConnection, PoolError> {
        let mut conn_guard = self.connection.write().await;

        // Another task may have connected while we waited for the lock
        if let Some(ref c) = *conn_guard {
            return Ok(c.clone());
        }

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *conn_guard = Some(conn.clone());
                tracing::info!("Redis pool connection established");
                Ok(conn)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Run `f` against the shared connection, forgetting the connection if
    /// it turned out to be dead so the next call reconnects.
    pub async fn execute<F, T, Fut>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection().await?;

        match f(conn).await {
            Ok(result) => Ok(result),
            Err(e) => {
                let err = PoolError::Redis(e);
                if err.is_connection_error() {
                    self.reset().await;
                }
                Err(err)
            }
        }
    }

    /// Drop the cached connection.
    pub async fn reset(&self) {
        let mut conn_guard = self.connection.write().await;
        *conn_guard = None;
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn ping(&self) -> Result<(), PoolError> {
        self.execute(|mut conn| async move {
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }
}

/// Typed helpers for the single-key commands the queue backend issues.
#[async_trait::async_trait]
pub trait RedisPoolExt {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), PoolError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, PoolError>;

    /// First element of a list, if any.
    async fn lindex_head(&self, key: &str) -> Result<Option<String>, PoolError>;

    /// Members scored in `[min, max]`, at most `count` of them.
    async fn zrangebyscore_limit(
        &self,
        key: &str,
        min: i64,
        max: i64,
        count: isize,
    ) -> Result<Vec<String>, PoolError>;

    /// `SET key value NX PX ttl_ms`; true when the key was set.
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool, PoolError>;
}

#[async_trait::async_trait]
impl RedisPoolExt for RedisPool {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), PoolError> {
        self.execute(|mut conn| async move {
            let _: i64 = conn.publish(channel, message).await?;
            Ok(())
        })
        .await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, PoolError> {
        self.execute(|mut conn| async move { conn.hget(key, field).await })
            .await
    }

    async fn lindex_head(&self, key: &str) -> Result<Option<String>, PoolError> {
        self.execute(|mut conn| async move { conn.lindex(key, 0).await })
            .await
    }

    async fn zrangebyscore_limit(
        &self,
        key: &str,
        min: i64,
        max: i64,
        count: isize,
    ) -> Result<Vec<String>, PoolError> {
        self.execute(|mut conn| async move {
            conn.zrangebyscore_limit(key, min, max, 0, count).await
        })
        .await
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool, PoolError> {
        self.execute(|mut conn| async move {
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await?;
            Ok(reply.is_some())
        })
        .await
    }
}
