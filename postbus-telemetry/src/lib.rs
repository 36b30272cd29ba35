//! OpenTelemetry integration for postbus
//!
//! This crate wires the bus into OpenTelemetry:
//! - Tracer provider setup with an OTLP exporter
//! - W3C trace-context propagation through message metadata
//! - Messaging span attribute keys
//!
//! # Examples
//!
//! ```
//! use postbus_telemetry::{TelemetryConfig, TracingExporter};
//!
//! let config = TelemetryConfig::new("orders-service")
//!     .with_version("1.0.0")
//!     .with_environment("production")
//!     .with_exporter(TracingExporter::None);
//!
//! assert_eq!(config.service_name, "orders-service");
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Propagating a trace through metadata
//!
//! ```
//! use opentelemetry::Context;
//! use opentelemetry::trace::TraceContextExt;
//! use postbus_telemetry::{extract_context, inject_context};
//! use std::collections::HashMap;
//!
//! let mut headers = HashMap::new();
//! inject_context(&Context::new(), &mut headers);
//! // No active span, nothing to propagate.
//! assert!(headers.is_empty());
//!
//! let cx = extract_context(&headers);
//! assert!(!cx.span().span_context().is_valid());
//! ```

pub mod attributes;
pub mod config;
pub mod error;
pub mod propagation;
pub mod tracing_setup;

pub use config::{TelemetryConfig, TracingConfig, TracingExporter};
pub use error::{TelemetryError, TelemetryResult};
pub use propagation::{
    MetadataExtractor, MetadataInjector, TRACEPARENT, TraceIds, extract_context, inject_context,
};
pub use tracing_setup::{finish_span, init_tracing, provider_tracer, shutdown_tracing, tracer};

// Re-export OpenTelemetry types for convenience
pub use opentelemetry::{
    Context, KeyValue,
    global::BoxedTracer,
    trace::{Span, SpanContext, SpanKind, Status, TraceContextExt, Tracer},
};
pub use opentelemetry_sdk::trace::SdkTracerProvider;
