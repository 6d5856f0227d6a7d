mod settings;

pub use settings::{
    AmqpConfig, DatabaseConfig, DeliveryConfig, OtelConfig, QueueConfig, RedisConfig,
    RetryConfig, Settings,
};
