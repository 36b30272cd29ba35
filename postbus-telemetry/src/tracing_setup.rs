//! Tracing setup and management

use crate::{
    config::{TelemetryConfig, TracingExporter},
    error::{TelemetryError, TelemetryResult},
};
use opentelemetry::KeyValue;
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{Span, Status, TracerProvider as _};
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};

/// Initialize tracing based on configuration.
///
/// The provider is also installed as the global provider so that
/// [`tracer`] hands out spans that reach the exporter.
pub fn init_tracing(config: &TelemetryConfig) -> TelemetryResult<SdkTracerProvider> {
    if !config.enable_tracing {
        return Err(TelemetryError::Config("Tracing is not enabled".to_string()));
    }
    config.validate()?;

    let resource = config.create_resource();

    let sampler = if config.tracing.sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if config.tracing.sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(config.tracing.sampling_ratio)
    };

    let builder = SdkTracerProvider::builder()
        .with_resource(resource)
        .with_id_generator(RandomIdGenerator::default())
        .with_sampler(Sampler::ParentBased(Box::new(sampler)))
        .with_max_attributes_per_span(config.tracing.max_attributes_per_span)
        .with_max_events_per_span(config.tracing.max_events_per_span);

    let provider = match config.tracing.exporter {
        #[cfg(feature = "otlp")]
        TracingExporter::Otlp => {
            let endpoint = config.tracing.otlp_endpoint.as_ref().ok_or_else(|| {
                TelemetryError::Config("OTLP endpoint not configured".to_string())
            })?;

            use opentelemetry_otlp::WithExportConfig;

            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()
                .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

            builder.with_batch_exporter(exporter).build()
        }

        TracingExporter::None => builder.build(),

        #[allow(unreachable_patterns)]
        _ => {
            return Err(TelemetryError::Config(format!(
                "Tracing exporter {:?} not available (feature not enabled)",
                config.tracing.exporter
            )));
        }
    };

    global::set_tracer_provider(provider.clone());

    Ok(provider)
}

/// Shutdown tracing gracefully, flushing pending spans.
pub fn shutdown_tracing(provider: SdkTracerProvider) -> TelemetryResult<()> {
    provider
        .shutdown()
        .map_err(|e| TelemetryError::Shutdown(e.to_string()))
}

/// Get a tracer from the global provider.
pub fn tracer(name: &'static str) -> BoxedTracer {
    global::tracer(name)
}

/// Get a tracer bound to a specific provider instead of the global one.
pub fn provider_tracer(provider: &SdkTracerProvider, name: &'static str) -> BoxedTracer {
    BoxedTracer::new(Box::new(provider.tracer(name)))
}

/// Record the outcome of an operation on a span and end it.
///
/// Errors become an `exception` event plus an error status.
pub fn finish_span<S, T, E>(mut span: S, result: &Result<T, E>)
where
    S: Span,
    E: std::fmt::Display,
{
    match result {
        Ok(_) => span.set_status(Status::Ok),
        Err(e) => {
            let message = e.to_string();
            span.add_event(
                "exception",
                vec![KeyValue::new("exception.message", message.clone())],
            );
            span.set_status(Status::error(message));
        }
    }
    span.end();
}
