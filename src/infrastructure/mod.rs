//! Infrastructure shared by the queue backends and the delivery pipeline
//!
//! - `backoff`: exponential backoff curves
//! - `config`: application settings
//! - `postgres`: PostgreSQL connection pool
//! - `redis`: Redis connection pool

pub mod backoff;
pub mod config;
pub mod postgres;
pub mod redis;
