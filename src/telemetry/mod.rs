//! Tracing and OpenTelemetry setup.
//!
//! This module provides:
//! - A `tracing-subscriber` registry with an `EnvFilter` and fmt output
//! - An optional OTLP exporter so pipeline spans reach a collector
//! - W3C trace-context propagation through queued messages, so a delivery
//!   performed hours later still joins the trace of the request that sent it
//!
//! # Configuration
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `FEDQ_OTEL__ENABLED` | Enable OpenTelemetry tracing | `false` |
//! | `FEDQ_OTEL__ENDPOINT` | OTLP gRPC endpoint | `http://localhost:4317` |
//! | `FEDQ_OTEL__SERVICE_NAME` | Service name in traces | `federation-queue` |
//! | `FEDQ_OTEL__SAMPLING_RATIO` | Trace sampling ratio (0.0-1.0) | `1.0` |

use std::collections::HashMap;

use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider as SdkTracerProvider},
    Resource,
};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::OtelConfig;

pub type TelemetryResult<T> = Result<T, TelemetryError>;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Failed to build OTLP exporter: {0}")]
    ExporterBuild(String),
    #[error("Failed to install tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Keeps the tracer provider alive; flushes pending spans on drop.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            tracing::info!("Shutting down OpenTelemetry tracer provider");
            if let Err(e) = provider.shutdown() {
                eprintln!("OpenTelemetry shutdown failed: {e}");
            }
        }
    }
}

/// Install the global subscriber and trace-context propagator.
///
/// Keep the returned guard alive for the lifetime of the process.
pub fn init_telemetry(config: &OtelConfig) -> TelemetryResult<TelemetryGuard> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if config.enabled {
        let provider = init_otel_tracer(config)?;
        let tracer = provider.tracer(config.service_name.clone());
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(otel_layer)
            .try_init()
            .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

        tracing::info!(
            endpoint = %config.endpoint,
            service_name = %config.service_name,
            sampling_ratio = %config.sampling_ratio,
            "OpenTelemetry tracing initialized"
        );

        Ok(TelemetryGuard {
            provider: Some(provider),
        })
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

        tracing::info!("Tracing initialized (OpenTelemetry disabled)");

        Ok(TelemetryGuard { provider: None })
    }
}

fn init_otel_tracer(config: &OtelConfig) -> TelemetryResult<SdkTracerProvider> {
    use opentelemetry::KeyValue;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.endpoint)
        .build()
        .map_err(|e| TelemetryError::ExporterBuild(e.to_string()))?;

    let sampler = if config.sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if config.sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(config.sampling_ratio)
    };

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_sampler(sampler)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(Resource::new(vec![
            KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                config.service_name.clone(),
            ),
            KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            ),
        ]))
        .build();

    Ok(provider)
}

/// Serialize the current span's context (`traceparent`, `tracestate`).
///
/// Empty when no OpenTelemetry layer is installed or the span is not sampled.
pub fn inject_trace_context() -> HashMap<String, String> {
    let context = tracing::Span::current().context();
    let mut carrier = HashMap::new();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&context, &mut carrier);
    });
    carrier
}

/// Make `span` a child of the context previously captured with
/// [`inject_trace_context`]. A missing or empty carrier leaves it untouched.
pub fn attach_trace_context(span: &tracing::Span, carrier: &HashMap<String, String>) {
    if carrier.is_empty() {
        return;
    }
    let parent = global::get_text_map_propagator(|propagator| propagator.extract(carrier));
    span.set_parent(parent);
}

/// Set OpenTelemetry attributes on `span`. No-op without an OTel layer.
pub fn record_attributes(
    span: &tracing::Span,
    attributes: impl IntoIterator<Item = opentelemetry::KeyValue>,
) {
    for attribute in attributes {
        span.set_attribute(attribute.key, attribute.value);
    }
}

/// Span attribute helpers.
pub mod attributes {
    use opentelemetry::KeyValue;

    pub fn message_id(id: uuid::Uuid) -> KeyValue {
        KeyValue::new("messaging.message.id", id.to_string())
    }

    pub fn ordering_key(key: &str) -> KeyValue {
        KeyValue::new("messaging.ordering_key", key.to_string())
    }

    pub fn inbox(url: &str) -> KeyValue {
        KeyValue::new("activitypub.inbox", url.to_string())
    }

    pub fn activity_type(kind: &str) -> KeyValue {
        KeyValue::new("activitypub.activity.type", kind.to_string())
    }

    pub fn http_status(code: u16) -> KeyValue {
        KeyValue::new("http.response.status_code", code as i64)
    }
}
