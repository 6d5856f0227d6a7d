//! Outbound HTTP delivery to remote inboxes.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

use crate::config::DeliveryConfig;
use crate::metrics::DeliveryMetrics;

use super::message::{OutboxMessage, SenderKeyPair};

const ACTIVITY_JSON: &str = "application/activity+json";
const COLLECTION_SYNC_HEADER: &str = "Collection-Synchronization";
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Error)]
pub enum SendError {
    /// Worth retrying: network failure, timeout, 5xx, 408, 429
    #[error("transient delivery failure to {inbox}: {reason}")]
    Transient {
        inbox: Url,
        status: Option<u16>,
        reason: String,
    },

    /// Retrying cannot help: other 4xx, unsignable or unencodable request
    #[error("permanent delivery failure to {inbox}: {reason}")]
    Permanent {
        inbox: Url,
        status: Option<u16>,
        reason: String,
    },
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            SendError::Transient { status, .. } | SendError::Permanent { status, .. } => *status,
        }
    }

    fn permanent(inbox: &Url, reason: impl Into<String>) -> Self {
        SendError::Permanent {
            inbox: inbox.clone(),
            status: None,
            reason: reason.into(),
        }
    }

    fn from_status(inbox: &Url, status: StatusCode, body: &str) -> Self {
        let reason = if body.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {body}")
        };
        if is_transient_status(status) {
            SendError::Transient {
                inbox: inbox.clone(),
                status: Some(status.as_u16()),
                reason,
            }
        } else {
            SendError::Permanent {
                inbox: inbox.clone(),
                status: Some(status.as_u16()),
                reason,
            }
        }
    }
}

/// Server errors, request timeouts and rate limiting are retried; any
/// other rejection is final.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Delivers one activity to one inbox.
#[async_trait]
pub trait ActivitySender: Send + Sync {
    async fn send(&self, message: &OutboxMessage) -> Result<(), SendError>;
}

/// Adds authentication (usually HTTP Signatures) to an outgoing request.
#[async_trait]
pub trait RequestSigner: Send + Sync {
    async fn sign(
        &self,
        request: reqwest::Request,
        keys: &[SenderKeyPair],
    ) -> anyhow::Result<reqwest::Request>;
}

/// [`ActivitySender`] that POSTs JSON over HTTP with `reqwest`.
pub struct HttpActivitySender {
    client: reqwest::Client,
    signer: Option<Arc<dyn RequestSigner>>,
}

impl HttpActivitySender {
    pub fn new(
        config: &DeliveryConfig,
        signer: Option<Arc<dyn RequestSigner>>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client, signer })
    }

    pub fn with_client(client: reqwest::Client, signer: Option<Arc<dyn RequestSigner>>) -> Self {
        Self { client, signer }
    }

    fn build_request(&self, message: &OutboxMessage) -> Result<reqwest::Request, SendError> {
        let body = serde_json::to_vec(&message.activity)
            .map_err(|e| SendError::permanent(&message.inbox, format!("encoding activity: {e}")))?;

        let mut builder = self
            .client
            .post(message.inbox.clone())
            .header(CONTENT_TYPE, ACTIVITY_JSON)
            .header(ACCEPT, ACTIVITY_JSON)
            .body(body);
        if let Some(sync) = &message.collection_sync {
            builder = builder.header(COLLECTION_SYNC_HEADER, sync);
        }

        builder
            .build()
            .map_err(|e| SendError::permanent(&message.inbox, format!("building request: {e}")))
    }
}

#[async_trait]
impl ActivitySender for HttpActivitySender {
    async fn send(&self, message: &OutboxMessage) -> Result<(), SendError> {
        let inbox = &message.inbox;
        let mut request = self.build_request(message)?;

        if let Some(signer) = &self.signer {
            request = signer
                .sign(request, &message.keys)
                .await
                .map_err(|e| SendError::permanent(inbox, format!("signing request: {e:#}")))?;
        }

        let started = Instant::now();
        let response = match self.client.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                DeliveryMetrics::record_transient_failure(started.elapsed());
                return Err(SendError::Transient {
                    inbox: inbox.clone(),
                    status: None,
                    reason: e.to_string(),
                });
            }
        };

        let status = response.status();
        if status.is_success() {
            DeliveryMetrics::record_success(started.elapsed());
            tracing::debug!(inbox = %inbox, status = status.as_u16(), "Activity delivered");
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }

        let error = SendError::from_status(inbox, status, body.trim());
        if error.is_transient() {
            DeliveryMetrics::record_transient_failure(started.elapsed());
        } else {
            DeliveryMetrics::record_permanent_failure(started.elapsed());
        }
        Err(error)
    }
}
