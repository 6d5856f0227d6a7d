//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use super::{
    DELIVERY_ATTEMPTS_TOTAL, DELIVERY_LATENCY, DELIVERY_PERMANENT_FAILURES_TOTAL,
    DELIVERY_RETRIES_TOTAL, FANOUT_INBOXES, QUEUE_ENQUEUED_TOTAL, QUEUE_HANDLER_DURATION,
    QUEUE_LOCK_CONTENDED_TOTAL, QUEUE_POLL_ERRORS_TOTAL, QUEUE_PROCESSED_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording queue backend metrics
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn record_enqueued(backend: &str, count: u64) {
        QUEUE_ENQUEUED_TOTAL
            .with_label_values(&[backend])
            .inc_by(count);
    }

    /// Record one handler invocation; `outcome` is `ok`, `error` or `panic`
    pub fn record_processed(backend: &str, outcome: &str, duration: Duration) {
        QUEUE_PROCESSED_TOTAL
            .with_label_values(&[backend, outcome])
            .inc();
        QUEUE_HANDLER_DURATION
            .with_label_values(&[backend])
            .observe(duration.as_secs_f64());
    }

    pub fn record_poll_error(backend: &str) {
        QUEUE_POLL_ERRORS_TOTAL.with_label_values(&[backend]).inc();
    }

    pub fn record_lock_contended(backend: &str) {
        QUEUE_LOCK_CONTENDED_TOTAL
            .with_label_values(&[backend])
            .inc();
    }
}

/// Helper struct for recording delivery pipeline metrics
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn record_success(latency: Duration) {
        DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["success"]).inc();
        DELIVERY_LATENCY.observe(latency.as_secs_f64());
    }

    pub fn record_transient_failure(latency: Duration) {
        DELIVERY_ATTEMPTS_TOTAL
            .with_label_values(&["transient"])
            .inc();
        DELIVERY_LATENCY.observe(latency.as_secs_f64());
    }

    pub fn record_permanent_failure(latency: Duration) {
        DELIVERY_ATTEMPTS_TOTAL
            .with_label_values(&["permanent"])
            .inc();
        DELIVERY_LATENCY.observe(latency.as_secs_f64());
    }

    pub fn record_retry(stage: &str) {
        DELIVERY_RETRIES_TOTAL.with_label_values(&[stage]).inc();
    }

    pub fn record_gave_up(stage: &str) {
        DELIVERY_PERMANENT_FAILURES_TOTAL
            .with_label_values(&[stage])
            .inc();
    }

    pub fn record_fanout(inbox_count: usize) {
        FANOUT_INBOXES.observe(inbox_count as f64);
    }
}
