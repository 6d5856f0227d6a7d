//! Dispatch of received activities to application listeners.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

/// Registration key that matches any activity type without its own listener.
pub const ANY_ACTIVITY: &str = "*";

/// What a listener knows about the delivery it is handling.
#[derive(Debug, Clone)]
pub struct InboxContext {
    pub message_id: Uuid,
    /// Local recipient; `None` for the shared inbox
    pub identifier: Option<String>,
    pub activity_type: String,
    /// Attempts made before this one
    pub attempt: u32,
}

#[async_trait]
pub trait InboxListener: Send + Sync {
    async fn on_activity(&self, context: &InboxContext, activity: Value) -> anyhow::Result<()>;
}

struct FnListener<F>(F);

#[async_trait]
impl<F, Fut> InboxListener for FnListener<F>
where
    F: Fn(InboxContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn on_activity(&self, context: &InboxContext, activity: Value) -> anyhow::Result<()> {
        (self.0)(context.clone(), activity).await
    }
}

/// Wrap an async closure as a listener.
pub fn listener_fn<F, Fut>(f: F) -> Arc<dyn InboxListener>
where
    F: Fn(InboxContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnListener(f))
}

/// Listeners keyed by activity type, with [`ANY_ACTIVITY`] as fallback.
#[derive(Clone, Default)]
pub struct InboxListeners {
    by_type: HashMap<String, Arc<dyn InboxListener>>,
}

impl InboxListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `activity_type`, replacing any earlier one.
    pub fn on(mut self, activity_type: impl Into<String>, listener: Arc<dyn InboxListener>) -> Self {
        self.by_type.insert(activity_type.into(), listener);
        self
    }

    pub fn find(&self, activity_type: &str) -> Option<&Arc<dyn InboxListener>> {
        self.by_type
            .get(activity_type)
            .or_else(|| self.by_type.get(ANY_ACTIVITY))
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}
