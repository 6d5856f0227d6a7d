//! Prometheus metrics for the queue backends and the delivery pipeline.
//!
//! - Queue metrics (enqueued, processed by outcome, poll errors, lock contention)
//! - Delivery metrics (attempts by outcome, retries, permanent failures, latency)
//! - Fan-out metrics (inboxes per activity)

mod helpers;

pub use helpers::{encode_metrics, DeliveryMetrics, QueueMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, Histogram,
    HistogramVec, IntCounterVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "fedq";

lazy_static! {
    // ============================================================================
    // Queue Metrics
    // ============================================================================

    /// Envelopes accepted by a backend
    pub static ref QUEUE_ENQUEUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_queue_enqueued_total", METRIC_PREFIX),
        "Total envelopes enqueued",
        &["backend"]
    ).unwrap();

    /// Envelopes handed to a handler, by outcome (ok, error, panic)
    pub static ref QUEUE_PROCESSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_queue_processed_total", METRIC_PREFIX),
        "Total envelopes processed by outcome",
        &["backend", "outcome"]
    ).unwrap();

    /// Poll cycles that failed to reach the backend
    pub static ref QUEUE_POLL_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_queue_poll_errors_total", METRIC_PREFIX),
        "Total failed poll cycles",
        &["backend"]
    ).unwrap();

    /// Keyed candidates skipped because another consumer held the key
    pub static ref QUEUE_LOCK_CONTENDED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_queue_lock_contended_total", METRIC_PREFIX),
        "Total ordering-key lock acquisitions that lost to another consumer",
        &["backend"]
    ).unwrap();

    /// Handler run time
    pub static ref QUEUE_HANDLER_DURATION: HistogramVec = register_histogram_vec!(
        format!("{}_queue_handler_duration_seconds", METRIC_PREFIX),
        "Time spent in the queue handler in seconds",
        &["backend"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).unwrap();

    // ============================================================================
    // Delivery Metrics
    // ============================================================================

    /// Outbound deliveries by outcome (success, transient, permanent)
    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_delivery_attempts_total", METRIC_PREFIX),
        "Total inbox delivery attempts by outcome",
        &["outcome"]
    ).unwrap();

    /// Pipeline-scheduled retries by stage (outbox, inbox)
    pub static ref DELIVERY_RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_delivery_retries_total", METRIC_PREFIX),
        "Total retries scheduled by the pipeline",
        &["stage"]
    ).unwrap();

    /// Messages handed to the permanent failure handler
    pub static ref DELIVERY_PERMANENT_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_delivery_permanent_failures_total", METRIC_PREFIX),
        "Total messages given up on",
        &["stage"]
    ).unwrap();

    /// HTTP round-trip time of one inbox POST
    pub static ref DELIVERY_LATENCY: Histogram = register_histogram!(
        format!("{}_delivery_latency_seconds", METRIC_PREFIX),
        "Inbox delivery latency in seconds",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    /// Inboxes targeted per sent activity
    pub static ref FANOUT_INBOXES: Histogram = register_histogram!(
        format!("{}_fanout_inboxes", METRIC_PREFIX),
        "Number of inboxes targeted per activity",
        vec![1.0, 2.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]
    ).unwrap();
}
