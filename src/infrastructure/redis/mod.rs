//! Redis connection handling shared by the Redis queue backend.

pub mod pool;

pub use pool::{PoolError, RedisPool, RedisPoolExt};
