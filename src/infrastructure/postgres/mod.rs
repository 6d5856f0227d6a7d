//! PostgreSQL persistence module.
//!
//! Connection pooling for the PostgreSQL queue backend.

pub mod pool;

pub use pool::{PostgresPool, PostgresPoolError};
