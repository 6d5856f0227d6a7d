//! In-process message queue backend.
//!
//! Envelopes live in memory and are lost on restart. This is the reference
//! behaviour the persistent backends are tested against: delayed visibility,
//! one in-flight envelope per ordering key, FIFO within a key.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::metrics::QueueMetrics;

use super::backend::{
    invoke_handler, EnqueueOptions, ListenOptions, MessageQueue, QueueError, QueueHandler,
};
use super::envelope::Envelope;

const BACKEND: &str = "memory";

#[derive(Debug, Clone)]
pub struct InProcessQueueConfig {
    /// Upper bound on how long an idle loop sleeps between checks
    pub poll_interval: Duration,
}

impl Default for InProcessQueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct State {
    /// Pending envelopes ordered by `(visible_at, sequence)`
    pending: BTreeMap<(DateTime<Utc>, u64), Envelope>,
    /// Sequences of every unfinished envelope per ordering key
    keyed: HashMap<String, BTreeSet<u64>>,
    /// Ordering keys with an envelope currently in a handler
    busy: HashSet<String>,
}

struct Inner {
    state: Mutex<State>,
    sequence: AtomicU64,
    notify: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave State half-updated:
        // every critical section below is a handful of infallible collection ops.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, state: &mut State, envelope: Envelope) {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        if let Some(key) = &envelope.ordering_key {
            state.keyed.entry(key.clone()).or_default().insert(seq);
        }
        state.pending.insert((envelope.visible_at, seq), envelope);
    }

    /// Take the first visible envelope whose ordering key is free and at its head.
    fn claim(self: &Arc<Self>, now: DateTime<Utc>) -> Claim {
        let mut state = self.lock();

        let mut chosen = None;
        let mut next_visible = None;
        for (&(visible_at, seq), envelope) in state.pending.iter() {
            if visible_at > now {
                next_visible = Some(visible_at);
                break;
            }
            let eligible = match &envelope.ordering_key {
                None => true,
                Some(key) => {
                    !state.busy.contains(key)
                        && state.keyed.get(key).and_then(|seqs| seqs.first()) == Some(&seq)
                }
            };
            if eligible {
                chosen = Some((visible_at, seq));
                break;
            }
        }

        let Some(slot) = chosen else {
            return Claim::Idle(next_visible);
        };
        let Some(mut envelope) = state.pending.remove(&slot) else {
            return Claim::Idle(next_visible);
        };
        envelope.attempt += 1;

        let release = envelope.ordering_key.clone().map(|key| {
            state.busy.insert(key.clone());
            KeyRelease {
                inner: Arc::clone(self),
                key,
                seq: slot.1,
            }
        });

        Claim::Ready(envelope, release)
    }
}

enum Claim {
    Ready(Envelope, Option<KeyRelease>),
    /// Nothing claimable; carries when the next delayed envelope turns visible
    Idle(Option<DateTime<Utc>>),
}

/// Frees an ordering key when dropped, so the next envelope for the key
/// becomes claimable even if the handler future is dropped mid-flight.
struct KeyRelease {
    inner: Arc<Inner>,
    key: String,
    seq: u64,
}

impl Drop for KeyRelease {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            state.busy.remove(&self.key);
            if let Some(seqs) = state.keyed.get_mut(&self.key) {
                seqs.remove(&self.seq);
                if seqs.is_empty() {
                    state.keyed.remove(&self.key);
                }
            }
        }
        self.inner.notify.notify_waiters();
    }
}

/// In-process implementation of [`MessageQueue`].
pub struct InProcessMessageQueue {
    inner: Arc<Inner>,
    config: InProcessQueueConfig,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl InProcessMessageQueue {
    pub fn new(config: InProcessQueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                sequence: AtomicU64::new(0),
                notify: Notify::new(),
            }),
            config,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Envelopes not yet handed to a handler.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    async fn process(
        &self,
        envelope: Envelope,
        release: Option<KeyRelease>,
        handler: &dyn QueueHandler,
    ) {
        let span = tracing::debug_span!(
            "queue.process",
            backend = BACKEND,
            message_id = %envelope.id,
            ordering_key = envelope.ordering_key.as_deref().unwrap_or(""),
            attempt = envelope.attempt,
        );

        async {
            let outcome = invoke_handler(BACKEND, handler, envelope.payload).await;
            tracing::debug!(success = outcome.is_success(), "Envelope handled");
            drop(release);
        }
        .instrument(span)
        .await
    }
}

impl Default for InProcessMessageQueue {
    fn default() -> Self {
        Self::new(InProcessQueueConfig::default())
    }
}

#[async_trait]
impl MessageQueue for InProcessMessageQueue {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn enqueue(&self, message: Value, options: EnqueueOptions) -> Result<(), QueueError> {
        self.ensure_open()?;

        let envelope = Envelope::new(message, &options);
        tracing::debug!(
            message_id = %envelope.id,
            ordering_key = ?envelope.ordering_key,
            delay_ms = options.delay_ms(),
            "Envelope enqueued"
        );
        {
            let mut state = self.inner.lock();
            self.inner.push(&mut state, envelope);
        }
        QueueMetrics::record_enqueued(BACKEND, 1);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn enqueue_many(
        &self,
        messages: Vec<Value>,
        options: EnqueueOptions,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        if messages.is_empty() {
            return Ok(());
        }

        let count = messages.len() as u64;
        {
            let mut state = self.inner.lock();
            for message in messages {
                self.inner.push(&mut state, Envelope::new(message, &options));
            }
        }
        QueueMetrics::record_enqueued(BACKEND, count);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn listen(
        &self,
        handler: Arc<dyn QueueHandler>,
        options: ListenOptions,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        let signal = options.signal;

        tracing::debug!(backend = BACKEND, "Listen loop started");
        while !signal.is_cancelled() && !self.shutdown.is_cancelled() {
            // Register interest before looking so an enqueue racing with an
            // empty claim still wakes us.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Utc::now();
            match self.inner.claim(now) {
                Claim::Ready(envelope, release) => {
                    self.process(envelope, release, handler.as_ref()).await;
                }
                Claim::Idle(next_visible) => {
                    let wait = next_visible
                        .and_then(|at| (at - now).to_std().ok())
                        .map(|until_visible| until_visible.min(self.config.poll_interval))
                        .unwrap_or(self.config.poll_interval);

                    tokio::select! {
                        _ = signal.cancelled() => break,
                        _ = self.shutdown.cancelled() => break,
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
        tracing::debug!(backend = BACKEND, "Listen loop stopped");
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.cancel();
            tracing::debug!(backend = BACKEND, "Queue closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::handler_fn;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn queue() -> Arc<InProcessMessageQueue> {
        Arc::new(InProcessMessageQueue::new(InProcessQueueConfig {
            poll_interval: Duration::from_millis(50),
        }))
    }

    #[test]
    fn test_keyed_envelopes_claimed_in_order_one_at_a_time() {
        let queue = queue();
        let options = EnqueueOptions::new().with_ordering_key("k");
        {
            let mut state = queue.inner.lock();
            for n in 0..3 {
                queue.inner.push(&mut state, Envelope::new(json!(n), &options));
            }
        }

        let now = Utc::now() + chrono::Duration::seconds(1);
        let Claim::Ready(first, release) = queue.inner.claim(now) else {
            panic!("expected first envelope");
        };
        assert_eq!(first.payload, json!(0));
        assert_eq!(first.attempt, 1);
        assert!(matches!(queue.inner.claim(now), Claim::Idle(None)));

        drop(release);
        let Claim::Ready(second, _release) = queue.inner.claim(now) else {
            panic!("expected second envelope");
        };
        assert_eq!(second.payload, json!(1));
    }

    #[test]
    fn test_delayed_envelope_reports_next_visibility() {
        let queue = queue();
        let options = EnqueueOptions::new().with_delay(Duration::from_secs(30));
        {
            let mut state = queue.inner.lock();
            queue.inner.push(&mut state, Envelope::new(json!("later"), &options));
        }

        match queue.inner.claim(Utc::now()) {
            Claim::Idle(Some(at)) => assert!(at > Utc::now()),
            _ => panic!("expected idle with a wake-up time"),
        }
    }

    #[tokio::test]
    async fn test_enqueue_after_close_fails() {
        let queue = queue();
        queue.close().await.unwrap();
        queue.close().await.unwrap();

        let err = queue.enqueue(json!(1), EnqueueOptions::default()).await.unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }

    #[tokio::test]
    async fn test_listen_delivers_and_stops_on_signal() {
        let queue = queue();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let signal = CancellationToken::new();

        let handler = {
            let seen = seen.clone();
            let signal = signal.clone();
            handler_fn(move |message: Value| {
                let seen = seen.clone();
                let signal = signal.clone();
                async move {
                    let mut seen = seen.lock().unwrap();
                    seen.push(message);
                    if seen.len() == 2 {
                        signal.cancel();
                    }
                    Ok(())
                }
            })
        };

        queue.enqueue(json!("a"), EnqueueOptions::default()).await.unwrap();
        queue.enqueue(json!("b"), EnqueueOptions::default()).await.unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            queue.listen(handler, ListenOptions::new(signal)),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![json!("a"), json!("b")]);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_handler_releases_key() {
        let queue = queue();
        let options = EnqueueOptions::new().with_ordering_key("k");
        queue.enqueue(json!(1), options.clone()).await.unwrap();
        queue.enqueue(json!(2), options).await.unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let signal = CancellationToken::new();
        let handler = {
            let seen = seen.clone();
            let signal = signal.clone();
            handler_fn(move |message: Value| {
                let seen = seen.clone();
                let signal = signal.clone();
                async move {
                    let count = {
                        let mut seen = seen.lock().unwrap();
                        seen.push(message);
                        seen.len()
                    };
                    if count == 2 {
                        signal.cancel();
                    }
                    anyhow::bail!("handler failure")
                }
            })
        };

        tokio::time::timeout(
            Duration::from_secs(5),
            queue.listen(handler, ListenOptions::new(signal)),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2)]);
    }
}
