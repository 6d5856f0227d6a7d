//! ActivityPub delivery on top of the message queue.
//!
//! - `message`: the tagged [`Message`] union carried between stages
//! - `inboxes`: recipient resolution into a [`RecipientMap`]
//! - `sender`: HTTP POST to remote inboxes with transient/permanent classification
//! - `retry`: backoff policy used when the queue has no native retrial
//! - `listeners`: per-activity-type handlers for received activities
//! - `pipeline`: the fan-out / outbox / inbox workers

pub mod inboxes;
pub mod listeners;
pub mod message;
pub mod pipeline;
pub mod retry;
pub mod sender;

pub use inboxes::{extract_inboxes, Recipient};
pub use listeners::{listener_fn, InboxContext, InboxListener, InboxListeners, ANY_ACTIVITY};
pub use message::{
    outbox_ordering_key, FanoutMessage, InboxMessage, InboxTarget, Message, OutboxMessage,
    RecipientMap, SenderKeyPair, TraceContext,
};
pub use pipeline::{
    DeliveryError, DeliveryPipeline, DeliveryPipelineBuilder, FanoutMode, PermanentFailureHandler,
    QueueSet, SendActivity,
};
pub use retry::RetryPolicy;
pub use sender::{ActivitySender, HttpActivitySender, RequestSigner, SendError};
