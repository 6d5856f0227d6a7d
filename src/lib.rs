// Infrastructure layer (shared components)
pub mod infrastructure;

pub use infrastructure::backoff;
pub use infrastructure::config;
pub use infrastructure::postgres;
pub use infrastructure::redis;

// Queue layer
pub mod queue;

// Delivery layer
pub mod delivery;

// Supporting modules
pub mod error;
pub mod metrics;
pub mod telemetry;
