use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::EnqueueOptions;

/// Queue-level wrapper around a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub visible_at: DateTime<Utc>,
    /// Times a consumer has claimed this envelope
    #[serde(default)]
    pub attempt: u32,
}

impl Envelope {
    pub fn new(payload: Value, options: &EnqueueOptions) -> Self {
        let now = Utc::now();
        let delay = options
            .delay
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .unwrap_or_else(chrono::Duration::zero);

        Self {
            id: Uuid::new_v4(),
            payload,
            ordering_key: options.ordering_key.clone(),
            enqueued_at: now,
            visible_at: now + delay,
            attempt: 0,
        }
    }

    pub fn is_visible_at(&self, now: DateTime<Utc>) -> bool {
        self.visible_at <= now
    }
}
