//! Messages exchanged between pipeline stages through the queue.
//!
//! Every queued payload is a [`Message`] serialized as JSON with a `type`
//! tag, so any backend can carry it and a consumer on another host can
//! decode it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;
use uuid::Uuid;

/// Serialized W3C trace context (`traceparent`, `tracestate`).
pub type TraceContext = HashMap<String, String>;

/// A key the sending actor signs deliveries with.
///
/// The private key is opaque to the pipeline (typically a JWK) and is only
/// handed to the [`RequestSigner`](super::sender::RequestSigner).
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderKeyPair {
    pub key_id: Url,
    pub private_key: Value,
}

impl fmt::Debug for SenderKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderKeyPair")
            .field("key_id", &self.key_id.as_str())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Who lives behind one inbox URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxTarget {
    pub actor_ids: Vec<Url>,
    /// The URL is a server-wide shared inbox rather than a personal one
    pub shared_inbox: bool,
}

/// Inbox URL to the actors it serves.
pub type RecipientMap = BTreeMap<Url, InboxTarget>;

/// One activity addressed to many inboxes, expanded by a fan-out worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutMessage {
    pub id: Uuid,
    pub activity: Value,
    pub activity_id: Option<Url>,
    pub activity_type: String,
    pub inboxes: RecipientMap,
    pub keys: Vec<SenderKeyPair>,
    #[serde(default)]
    pub collection_sync: Option<String>,
    #[serde(default)]
    pub ordering_key: Option<String>,
    #[serde(default)]
    pub trace_context: TraceContext,
}

/// One activity for one inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub activity: Value,
    pub activity_id: Option<Url>,
    pub activity_type: String,
    pub inbox: Url,
    pub shared_inbox: bool,
    pub keys: Vec<SenderKeyPair>,
    #[serde(default)]
    pub collection_sync: Option<String>,
    /// Attempts already made before this one
    #[serde(default)]
    pub attempt: u32,
    pub started: DateTime<Utc>,
    /// Queue ordering key, already scoped to this inbox
    #[serde(default)]
    pub ordering_key: Option<String>,
    #[serde(default)]
    pub trace_context: TraceContext,
}

/// A received activity waiting for its inbox listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: Uuid,
    pub activity: Value,
    /// Local recipient; `None` for the shared inbox
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    pub started: DateTime<Utc>,
    #[serde(default)]
    pub ordering_key: Option<String>,
    #[serde(default)]
    pub trace_context: TraceContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Fanout(FanoutMessage),
    Outbox(OutboxMessage),
    Inbox(InboxMessage),
}

impl Message {
    pub fn id(&self) -> Uuid {
        match self {
            Message::Fanout(m) => m.id,
            Message::Outbox(m) => m.id,
            Message::Inbox(m) => m.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Fanout(_) => "fanout",
            Message::Outbox(_) => "outbox",
            Message::Inbox(_) => "inbox",
        }
    }

    pub fn trace_context(&self) -> &TraceContext {
        match self {
            Message::Fanout(m) => &m.trace_context,
            Message::Outbox(m) => &m.trace_context,
            Message::Inbox(m) => &m.trace_context,
        }
    }

    /// Attempts made before the current one; fan-out messages are never retried.
    pub fn attempt(&self) -> u32 {
        match self {
            Message::Fanout(_) => 0,
            Message::Outbox(m) => m.attempt,
            Message::Inbox(m) => m.attempt,
        }
    }

    /// When the first attempt was made, if the stage tracks it.
    pub fn started(&self) -> Option<DateTime<Utc>> {
        match self {
            Message::Fanout(_) => None,
            Message::Outbox(m) => Some(m.started),
            Message::Inbox(m) => Some(m.started),
        }
    }

    pub fn ordering_key(&self) -> Option<&str> {
        match self {
            Message::Fanout(m) => m.ordering_key.as_deref(),
            Message::Outbox(m) => m.ordering_key.as_deref(),
            Message::Inbox(m) => m.ordering_key.as_deref(),
        }
    }

    /// The same message with its attempt counter advanced.
    pub fn next_attempt(&self) -> Message {
        let mut next = self.clone();
        match &mut next {
            Message::Fanout(_) => {}
            Message::Outbox(m) => m.attempt += 1,
            Message::Inbox(m) => m.attempt += 1,
        }
        next
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Ordering key for one inbox's share of a keyed activity.
///
/// Scoping by inbox keeps a slow server from holding up deliveries of the
/// same key to every other server.
pub fn outbox_ordering_key(key: &str, inbox: &Url) -> String {
    format!("{key}\n{inbox}")
}

/// The activity's `type`; the first entry when it is an array.
pub fn activity_type_of(activity: &Value) -> String {
    match activity.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(Value::Array(kinds)) => kinds
            .iter()
            .find_map(Value::as_str)
            .unwrap_or("Object")
            .to_string(),
        _ => "Object".to_string(),
    }
}

/// The activity's `id`, when present and a valid URL.
pub fn activity_id_of(activity: &Value) -> Option<Url> {
    activity
        .get("id")
        .and_then(Value::as_str)
        .and_then(|id| Url::parse(id).ok())
}
