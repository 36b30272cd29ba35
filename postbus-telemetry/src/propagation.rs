//! W3C trace-context propagation through message metadata.

use opentelemetry::Context;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{SpanContext, TraceContextExt};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::collections::HashMap;

/// Metadata key carrying the W3C `traceparent` header.
pub const TRACEPARENT: &str = "traceparent";

/// Writes propagation headers into a string map.
pub struct MetadataInjector<'a>(pub &'a mut HashMap<String, String>);

impl Injector for MetadataInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

/// Reads propagation headers from a string map.
pub struct MetadataExtractor<'a>(pub &'a HashMap<String, String>);

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

/// Inject the span context of `cx` as W3C headers.
pub fn inject_context(cx: &Context, headers: &mut HashMap<String, String>) {
    TraceContextPropagator::new().inject_context(cx, &mut MetadataInjector(headers));
}

/// Extract a remote parent context from W3C headers.
///
/// Returns an empty context when no valid `traceparent` is present.
pub fn extract_context(headers: &HashMap<String, String>) -> Context {
    TraceContextPropagator::new().extract(&MetadataExtractor(headers))
}

/// Trace identifiers of a span, rendered as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceIds {
    pub trace_id: String,
    pub span_id: String,
    pub traceparent: String,
}

impl TraceIds {
    /// Render the ids of a valid span context, `None` otherwise.
    pub fn from_span_context(sc: &SpanContext) -> Option<Self> {
        if !sc.is_valid() {
            return None;
        }
        let cx = Context::new().with_remote_span_context(sc.clone());
        let mut headers = HashMap::new();
        inject_context(&cx, &mut headers);
        Some(Self {
            trace_id: sc.trace_id().to_string(),
            span_id: sc.span_id().to_string(),
            traceparent: headers.remove(TRACEPARENT)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{SpanId, TraceFlags, TraceId, TraceState};

    fn span_context() -> SpanContext {
        SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            false,
            TraceState::default(),
        )
    }

    #[test]
    fn test_inject_then_extract_keeps_ids() {
        let cx = Context::new().with_remote_span_context(span_context());
        let mut headers = HashMap::new();
        inject_context(&cx, &mut headers);

        assert_eq!(
            headers.get(TRACEPARENT).map(String::as_str),
            Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        );

        let extracted = extract_context(&headers);
        let sc = extracted.span().span_context().clone();
        assert!(sc.is_remote());
        assert_eq!(sc.trace_id(), span_context().trace_id());
        assert_eq!(sc.span_id(), span_context().span_id());
    }

    #[test]
    fn test_extract_without_headers_is_invalid() {
        let cx = extract_context(&HashMap::new());
        assert!(!cx.span().span_context().is_valid());
    }

    #[test]
    fn test_trace_ids() {
        let ids = TraceIds::from_span_context(&span_context()).unwrap();
        assert_eq!(ids.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(ids.span_id, "00f067aa0ba902b7");
        assert!(ids.traceparent.starts_with("00-4bf92f"));

        assert!(TraceIds::from_span_context(&SpanContext::empty_context()).is_none());
    }
}
