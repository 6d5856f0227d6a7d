//! Delivery pipeline tests over the in-process queue with a scripted sender.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use url::Url;

use federation_queue::backoff::BackoffConfig;
use federation_queue::config::DeliveryConfig;
use federation_queue::delivery::{
    listener_fn, ActivitySender, DeliveryError, DeliveryPipeline, FanoutMode, InboxListeners,
    InboxTarget, Message, OutboxMessage, PermanentFailureHandler, QueueSet, RecipientMap,
    RetryPolicy, SendActivity, SendError, ANY_ACTIVITY,
};
use federation_queue::queue::{
    EnqueueOptions, InProcessMessageQueue, InProcessQueueConfig, ListenOptions, MessageQueue,
    QueueError, QueueHandler,
};

const WAIT: Duration = Duration::from_secs(10);

/// Replies from a per-inbox script, succeeding once the script runs out.
#[derive(Default)]
struct ScriptedSender {
    script: Mutex<HashMap<Url, VecDeque<Result<(), bool>>>>,
    sent: Mutex<Vec<OutboxMessage>>,
}

impl ScriptedSender {
    /// `Err(true)` is a transient failure, `Err(false)` a permanent one.
    fn script(&self, inbox: &Url, replies: Vec<Result<(), bool>>) {
        self.script
            .lock()
            .unwrap()
            .insert(inbox.clone(), replies.into_iter().collect());
    }

    fn always_transient(&self, inbox: &Url) {
        self.script(inbox, vec![Err(true); 100]);
    }

    fn sent(&self) -> Vec<OutboxMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActivitySender for ScriptedSender {
    async fn send(&self, message: &OutboxMessage) -> Result<(), SendError> {
        self.sent.lock().unwrap().push(message.clone());
        let reply = self
            .script
            .lock()
            .unwrap()
            .get_mut(&message.inbox)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()));

        match reply {
            Ok(()) => Ok(()),
            Err(true) => Err(SendError::Transient {
                inbox: message.inbox.clone(),
                status: Some(503),
                reason: "HTTP 503".to_string(),
            }),
            Err(false) => Err(SendError::Permanent {
                inbox: message.inbox.clone(),
                status: Some(410),
                reason: "HTTP 410".to_string(),
            }),
        }
    }
}

#[derive(Default)]
struct FailureLog {
    failures: Mutex<Vec<(Message, String)>>,
}

impl FailureLog {
    fn len(&self) -> usize {
        self.failures.lock().unwrap().len()
    }
}

#[async_trait]
impl PermanentFailureHandler for FailureLog {
    async fn on_permanent_failure(&self, message: &Message, error: &DeliveryError) {
        self.failures
            .lock()
            .unwrap()
            .push((message.clone(), error.to_string()));
    }
}

/// In-process queue that remembers what was enqueued and can claim native
/// retrial.
struct SpyQueue {
    inner: InProcessMessageQueue,
    enqueued: Mutex<Vec<Value>>,
    native_retrial: bool,
}

impl SpyQueue {
    fn new(native_retrial: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: InProcessMessageQueue::new(InProcessQueueConfig {
                poll_interval: Duration::from_millis(50),
            }),
            enqueued: Mutex::new(Vec::new()),
            native_retrial,
        })
    }

    fn types(&self) -> Vec<String> {
        self.enqueued
            .lock()
            .unwrap()
            .iter()
            .map(|m| m["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    fn take(&self) -> Vec<Value> {
        std::mem::take(&mut *self.enqueued.lock().unwrap())
    }
}

#[async_trait]
impl MessageQueue for SpyQueue {
    fn backend_name(&self) -> &'static str {
        "spy"
    }

    fn native_retrial(&self) -> bool {
        self.native_retrial
    }

    async fn enqueue(&self, message: Value, options: EnqueueOptions) -> Result<(), QueueError> {
        self.enqueued.lock().unwrap().push(message.clone());
        self.inner.enqueue(message, options).await
    }

    async fn enqueue_many(
        &self,
        messages: Vec<Value>,
        options: EnqueueOptions,
    ) -> Result<(), QueueError> {
        self.enqueued.lock().unwrap().extend(messages.iter().cloned());
        self.inner.enqueue_many(messages, options).await
    }

    async fn listen(
        &self,
        handler: Arc<dyn QueueHandler>,
        options: ListenOptions,
    ) -> Result<(), QueueError> {
        self.inner.listen(handler, options).await
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.inner.close().await
    }
}

fn inbox(host: &str) -> Url {
    Url::parse(&format!("https://{host}/inbox")).unwrap()
}

fn recipients(hosts: &[&str]) -> RecipientMap {
    hosts
        .iter()
        .map(|host| {
            (
                inbox(host),
                InboxTarget {
                    actor_ids: vec![Url::parse(&format!("https://{host}/users/alice")).unwrap()],
                    shared_inbox: false,
                },
            )
        })
        .collect()
}

fn note() -> Value {
    json!({
        "type": "Create",
        "id": "https://local.example/activities/1",
        "object": {"type": "Note", "content": "hello"}
    })
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        BackoffConfig {
            initial_delay_ms: 10,
            max_delay_ms: 40,
            multiplier: 2.0,
            jitter_factor: 0.0,
        },
        max_attempts,
        None,
    )
}

struct Harness {
    queue: Arc<SpyQueue>,
    sender: Arc<ScriptedSender>,
    failures: Arc<FailureLog>,
    pipeline: DeliveryPipeline,
}

fn harness(native_retrial: bool, listeners: InboxListeners) -> Harness {
    let queue = SpyQueue::new(native_retrial);
    let sender = Arc::new(ScriptedSender::default());
    let failures = Arc::new(FailureLog::default());
    let config = DeliveryConfig {
        fanout_threshold: 3,
        ..DeliveryConfig::default()
    };

    let pipeline = DeliveryPipeline::builder(QueueSet::shared(queue.clone()))
        .config(config)
        .sender(sender.clone())
        .listeners(listeners)
        .on_permanent_failure(failures.clone())
        .outbox_retry(fast_retry(3))
        .inbox_retry(fast_retry(3))
        .build()
        .unwrap();

    Harness {
        queue,
        sender,
        failures,
        pipeline,
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    done()
}

/// Run the pipeline's workers until `done` holds, then stop them.
async fn run_until(pipeline: &DeliveryPipeline, done: impl FnMut() -> bool) -> bool {
    let signal = CancellationToken::new();
    let worker = {
        let pipeline = pipeline.clone();
        let signal = signal.clone();
        tokio::spawn(async move { pipeline.listen(signal).await })
    };

    let reached = wait_until(done).await;
    signal.cancel();
    let result = tokio::time::timeout(WAIT, worker).await.unwrap().unwrap();
    assert!(result.is_ok(), "pipeline listen returned {result:?}");
    reached
}

#[tokio::test]
async fn test_small_audience_skips_fanout_stage() {
    let h = harness(false, InboxListeners::new());

    h.pipeline
        .send_activity(SendActivity::new(note(), recipients(&["a.example", "b.example"])))
        .await
        .unwrap();
    assert_eq!(h.queue.types(), vec!["outbox", "outbox"]);

    let sender = h.sender.clone();
    assert!(run_until(&h.pipeline, || sender.sent().len() == 2).await);

    let sent = h.sender.sent();
    assert!(sent.iter().all(|m| m.activity_type == "Create"));
    assert!(sent.iter().all(|m| m.attempt == 0));
    assert_eq!(h.failures.len(), 0);
}

#[tokio::test]
async fn test_large_audience_goes_through_fanout() {
    let h = harness(false, InboxListeners::new());
    let hosts = ["a.example", "b.example", "c.example", "d.example"];

    h.pipeline
        .send_activity(SendActivity::new(note(), recipients(&hosts)))
        .await
        .unwrap();
    assert_eq!(h.queue.types(), vec!["fanout"]);

    let sender = h.sender.clone();
    assert!(run_until(&h.pipeline, || sender.sent().len() == hosts.len()).await);

    let types = h.queue.types();
    assert_eq!(types.iter().filter(|t| *t == "outbox").count(), hosts.len());
}

#[tokio::test]
async fn test_fanout_mode_overrides_threshold() {
    let h = harness(false, InboxListeners::new());

    h.pipeline
        .send_activity(
            SendActivity::new(note(), recipients(&["a.example"])).with_fanout(FanoutMode::Force),
        )
        .await
        .unwrap();
    assert_eq!(h.queue.take().len(), 1);

    let many = ["a.example", "b.example", "c.example", "d.example", "e.example"];
    h.pipeline
        .send_activity(SendActivity::new(note(), recipients(&many)).with_fanout(FanoutMode::Skip))
        .await
        .unwrap();
    assert_eq!(h.queue.types(), vec!["outbox"; many.len()]);
}

#[tokio::test]
async fn test_no_recipients_enqueues_nothing() {
    let h = harness(false, InboxListeners::new());
    h.pipeline
        .send_activity(SendActivity::new(note(), RecipientMap::new()))
        .await
        .unwrap();
    assert!(h.queue.types().is_empty());
}

#[tokio::test]
async fn test_ordering_key_is_scoped_per_inbox() {
    let h = harness(false, InboxListeners::new());

    h.pipeline
        .send_activity(
            SendActivity::new(note(), recipients(&["a.example", "b.example"]))
                .with_ordering_key("post-1"),
        )
        .await
        .unwrap();

    let keys: Vec<String> = h
        .queue
        .take()
        .iter()
        .map(|m| m["ordering_key"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        keys,
        vec![
            "post-1\nhttps://a.example/inbox".to_string(),
            "post-1\nhttps://b.example/inbox".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_transient_failure_is_retried_with_next_attempt() {
    let h = harness(false, InboxListeners::new());
    let target = inbox("flaky.example");
    h.sender.script(&target, vec![Err(true)]);

    h.pipeline
        .send_activity(SendActivity::new(note(), recipients(&["flaky.example"])))
        .await
        .unwrap();

    let sender = h.sender.clone();
    assert!(run_until(&h.pipeline, || sender.sent().len() == 2).await);

    let attempts: Vec<u32> = h.sender.sent().iter().map(|m| m.attempt).collect();
    assert_eq!(attempts, vec![0, 1]);
    assert_eq!(h.failures.len(), 0);
}

#[tokio::test]
async fn test_exhausted_retries_reach_failure_handler() {
    let h = harness(false, InboxListeners::new());
    let target = inbox("down.example");
    h.sender.always_transient(&target);

    h.pipeline
        .send_activity(SendActivity::new(note(), recipients(&["down.example"])))
        .await
        .unwrap();

    let failures = h.failures.clone();
    assert!(run_until(&h.pipeline, || failures.len() == 1).await);

    assert_eq!(h.sender.sent().len(), 3);
    let (message, error) = h.failures.failures.lock().unwrap()[0].clone();
    assert_eq!(message.kind(), "outbox");
    assert_eq!(message.attempt(), 2);
    assert!(error.contains("503"));
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let h = harness(false, InboxListeners::new());
    let target = inbox("gone.example");
    h.sender.script(&target, vec![Err(false)]);

    h.pipeline
        .send_activity(SendActivity::new(note(), recipients(&["gone.example"])))
        .await
        .unwrap();

    let failures = h.failures.clone();
    assert!(run_until(&h.pipeline, || failures.len() == 1).await);

    assert_eq!(h.sender.sent().len(), 1);
    assert_eq!(h.queue.types(), vec!["outbox"]);
}

#[tokio::test]
async fn test_native_retrial_surfaces_error_instead_of_reenqueueing() {
    let h = harness(true, InboxListeners::new());
    let target = inbox("flaky.example");
    h.sender.script(&target, vec![Err(true)]);

    h.pipeline
        .send_activity(SendActivity::new(note(), recipients(&["flaky.example"])))
        .await
        .unwrap();
    let enqueued = h.queue.take();
    assert_eq!(enqueued.len(), 1);

    let result = h.pipeline.handle(enqueued[0].clone()).await;
    assert!(result.is_err());
    assert!(h.queue.take().is_empty(), "pipeline re-enqueued a retry");
    assert_eq!(h.failures.len(), 0);
}

#[tokio::test]
async fn test_inbox_activity_reaches_typed_listener() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let listeners = {
        let seen = seen.clone();
        InboxListeners::new().on(
            "Follow",
            listener_fn(move |context, activity| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push((context.identifier, activity["actor"].clone()));
                    Ok(())
                }
            }),
        )
    };
    let h = harness(false, listeners);

    h.pipeline
        .enqueue_inbox(
            json!({"type": "Follow", "actor": "https://remote.example/users/bob"}),
            Some("alice".to_string()),
            None,
        )
        .await
        .unwrap();

    let observed = seen.clone();
    assert!(run_until(&h.pipeline, || observed.lock().unwrap().len() == 1).await);

    let (identifier, actor) = seen.lock().unwrap()[0].clone();
    assert_eq!(identifier.as_deref(), Some("alice"));
    assert_eq!(actor, json!("https://remote.example/users/bob"));
}

#[tokio::test]
async fn test_inbox_listener_error_is_retried() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let listeners = {
        let calls = calls.clone();
        InboxListeners::new().on(
            ANY_ACTIVITY,
            listener_fn(move |context, _activity| {
                let calls = calls.clone();
                async move {
                    calls.lock().unwrap().push(context.attempt);
                    if context.attempt == 0 {
                        anyhow::bail!("database busy");
                    }
                    Ok(())
                }
            }),
        )
    };
    let h = harness(false, listeners);

    h.pipeline
        .enqueue_inbox(json!({"type": "Like"}), None, None)
        .await
        .unwrap();

    let observed = calls.clone();
    assert!(run_until(&h.pipeline, || observed.lock().unwrap().len() == 2).await);
    assert_eq!(*calls.lock().unwrap(), vec![0, 1]);
}

#[tokio::test]
async fn test_unhandled_activity_type_is_reported() {
    let h = harness(false, InboxListeners::new());

    h.pipeline
        .enqueue_inbox(json!({"type": "Move"}), None, None)
        .await
        .unwrap();

    let failures = h.failures.clone();
    assert!(run_until(&h.pipeline, || failures.len() == 1).await);
    assert!(h.failures.failures.lock().unwrap()[0].1.contains("Move"));
}
