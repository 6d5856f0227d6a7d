//! Queue behaviour shared by every backend's integration tests.
//!
//! Each scenario takes a fresh, empty queue and drives it through the
//! public `MessageQueue` API only.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use federation_queue::queue::{
    handler_fn, EnqueueOptions, ListenOptions, MessageQueue, QueueError, QueueHandler,
};

pub const WAIT: Duration = Duration::from_secs(20);

/// Collects every payload a handler sees.
#[derive(Default)]
pub struct Recorder {
    seen: Mutex<Vec<(Value, Instant)>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn handler(self: &Arc<Self>, work: Duration) -> Arc<dyn QueueHandler> {
        let recorder = self.clone();
        handler_fn(move |message| {
            let recorder = recorder.clone();
            async move {
                recorder.seen.lock().unwrap().push((message, Instant::now()));
                if !work.is_zero() {
                    tokio::time::sleep(work).await;
                }
                Ok(())
            }
        })
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.seen.lock().unwrap().iter().map(|(v, _)| v.clone()).collect()
    }

    pub fn first_seen_at(&self) -> Option<Instant> {
        self.seen.lock().unwrap().first().map(|(_, at)| *at)
    }

    /// Poll until `count` payloads have been recorded or `timeout` passes.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.len() >= count
    }
}

pub fn spawn_listeners(
    queue: &Arc<dyn MessageQueue>,
    handler: &Arc<dyn QueueHandler>,
    count: usize,
    signal: &CancellationToken,
) -> Vec<JoinHandle<Result<(), QueueError>>> {
    (0..count)
        .map(|_| {
            let queue = queue.clone();
            let handler = handler.clone();
            let signal = signal.clone();
            tokio::spawn(async move { queue.listen(handler, ListenOptions::new(signal)).await })
        })
        .collect()
}

pub async fn stop(signal: CancellationToken, listeners: Vec<JoinHandle<Result<(), QueueError>>>) {
    signal.cancel();
    for listener in listeners {
        let result = tokio::time::timeout(WAIT, listener)
            .await
            .expect("listener did not stop")
            .expect("listener panicked");
        assert!(result.is_ok(), "listen returned {result:?}");
    }
}

/// Messages sharing an ordering key are handled in enqueue order even with
/// several listeners competing.
pub async fn ordering_key_is_fifo(queue: Arc<dyn MessageQueue>) {
    const KEYS: [&str; 3] = ["alpha", "beta", "gamma"];
    const PER_KEY: usize = 8;

    for n in 0..PER_KEY {
        for key in KEYS {
            queue
                .enqueue(
                    json!({"key": key, "n": n}),
                    EnqueueOptions::new().with_ordering_key(key),
                )
                .await
                .unwrap();
        }
    }

    let recorder = Recorder::new();
    let handler = recorder.handler(Duration::from_millis(10));
    let signal = CancellationToken::new();
    let listeners = spawn_listeners(&queue, &handler, 3, &signal);

    assert!(recorder.wait_for(KEYS.len() * PER_KEY, WAIT).await);
    stop(signal, listeners).await;

    let mut by_key: HashMap<String, Vec<u64>> = HashMap::new();
    for payload in recorder.payloads() {
        by_key
            .entry(payload["key"].as_str().unwrap().to_string())
            .or_default()
            .push(payload["n"].as_u64().unwrap());
    }
    for key in KEYS {
        let expected: Vec<u64> = (0..PER_KEY as u64).collect();
        assert_eq!(by_key[key], expected, "key {key} out of order");
    }
}

/// Every enqueued message reaches a handler exactly once under normal
/// operation.
pub async fn all_messages_observed(queue: Arc<dyn MessageQueue>) {
    const COUNT: usize = 25;

    let batch = (0..COUNT).map(|n| json!({"n": n})).collect();
    queue.enqueue_many(batch, EnqueueOptions::new()).await.unwrap();

    let recorder = Recorder::new();
    let handler = recorder.handler(Duration::ZERO);
    let signal = CancellationToken::new();
    let listeners = spawn_listeners(&queue, &handler, 2, &signal);

    assert!(recorder.wait_for(COUNT, WAIT).await);
    stop(signal, listeners).await;

    let seen: HashSet<u64> = recorder
        .payloads()
        .iter()
        .map(|payload| payload["n"].as_u64().unwrap())
        .collect();
    assert_eq!(seen.len(), COUNT);
}

/// A delayed message is not handled before its delay elapses.
pub async fn delay_is_respected(queue: Arc<dyn MessageQueue>) {
    let delay = Duration::from_millis(600);

    let recorder = Recorder::new();
    let handler = recorder.handler(Duration::ZERO);
    let signal = CancellationToken::new();
    let listeners = spawn_listeners(&queue, &handler, 1, &signal);

    let enqueued_at = Instant::now();
    queue
        .enqueue(json!({"delayed": true}), EnqueueOptions::new().with_delay(delay))
        .await
        .unwrap();

    assert!(recorder.wait_for(1, WAIT).await);
    stop(signal, listeners).await;

    let handled_after = recorder.first_seen_at().unwrap() - enqueued_at;
    // Clock skew between the test host and the backend's storage.
    assert!(
        handled_after + Duration::from_millis(50) >= delay,
        "handled after {handled_after:?}, delay was {delay:?}"
    );
}

/// Cancelling the signal lets the in-flight handler finish before `listen`
/// returns.
pub async fn cancellation_waits_for_in_flight(queue: Arc<dyn MessageQueue>) {
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let handler = {
        let started = started.clone();
        let finished = finished.clone();
        handler_fn(move |_message| {
            let started = started.clone();
            let finished = finished.clone();
            async move {
                started.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(())
            }
        })
    };

    queue.enqueue(json!({"slow": true}), EnqueueOptions::new()).await.unwrap();

    let signal = CancellationToken::new();
    let listeners = spawn_listeners(&queue, &handler, 1, &signal);

    let deadline = Instant::now() + WAIT;
    while !started.load(Ordering::SeqCst) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(started.load(Ordering::SeqCst), "handler never started");

    stop(signal, listeners).await;
    assert!(finished.load(Ordering::SeqCst));
}

/// A failing handler does not stop the loop, and the message is not
/// redelivered by backends without native retrial.
pub async fn handler_errors_do_not_escape(queue: Arc<dyn MessageQueue>) {
    let recorder = Recorder::new();
    let handler = {
        let recorder = recorder.clone();
        let inner = recorder.handler(Duration::ZERO);
        handler_fn(move |message: Value| {
            let inner = inner.clone();
            async move {
                inner.handle(message.clone()).await?;
                if message["fail"] == json!(true) {
                    anyhow::bail!("handler failure");
                }
                Ok(())
            }
        })
    };

    queue.enqueue(json!({"fail": true}), EnqueueOptions::new()).await.unwrap();
    queue.enqueue(json!({"fail": false}), EnqueueOptions::new()).await.unwrap();

    let signal = CancellationToken::new();
    let listeners = spawn_listeners(&queue, &handler, 1, &signal);

    assert!(recorder.wait_for(2, WAIT).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    stop(signal, listeners).await;

    if !queue.native_retrial() {
        assert_eq!(recorder.len(), 2);
    }
}

/// A key whose head is delayed holds back its own later messages only; an
/// unkeyed message queued behind a long run of them is still handled.
pub async fn busy_key_does_not_starve_others(queue: Arc<dyn MessageQueue>) {
    // More than any backend's default poll batch.
    const BLOCKED: usize = 24;

    queue
        .enqueue(
            json!({"key": "busy", "n": 0}),
            EnqueueOptions::new()
                .with_ordering_key("busy")
                .with_delay(Duration::from_secs(3600)),
        )
        .await
        .unwrap();
    let blocked = (1..=BLOCKED).map(|n| json!({"key": "busy", "n": n})).collect();
    queue
        .enqueue_many(blocked, EnqueueOptions::new().with_ordering_key("busy"))
        .await
        .unwrap();
    queue.enqueue(json!({"unkeyed": true}), EnqueueOptions::new()).await.unwrap();

    let recorder = Recorder::new();
    let handler = recorder.handler(Duration::ZERO);
    let signal = CancellationToken::new();
    let listeners = spawn_listeners(&queue, &handler, 1, &signal);

    assert!(recorder.wait_for(1, WAIT).await, "unkeyed message never handled");
    tokio::time::sleep(Duration::from_millis(300)).await;
    stop(signal, listeners).await;

    assert_eq!(recorder.payloads(), vec![json!({"unkeyed": true})]);
}

/// Messages enqueued from many tasks while a listener is running are each
/// handled exactly once.
pub async fn concurrent_enqueue_while_listening(queue: Arc<dyn MessageQueue>) {
    const PRODUCERS: usize = 30;

    let recorder = Recorder::new();
    let handler = recorder.handler(Duration::ZERO);
    let signal = CancellationToken::new();
    let listeners = spawn_listeners(&queue, &handler, 1, &signal);

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|n| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(json!({"n": n}), EnqueueOptions::new()).await })
        })
        .collect();
    for producer in producers {
        producer.await.expect("producer panicked").unwrap();
    }

    assert!(recorder.wait_for(PRODUCERS, WAIT).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    stop(signal, listeners).await;

    let payloads = recorder.payloads();
    let seen: HashSet<u64> = payloads
        .iter()
        .map(|payload| payload["n"].as_u64().unwrap())
        .collect();
    assert_eq!(seen.len(), PRODUCERS);
    assert_eq!(payloads.len(), PRODUCERS, "a message was handled twice");
}
