//! Per-delivery context handed to handlers and pipeline stages.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use opentelemetry::trace::SpanContext;

use crate::message::{DynMessage, Message};
use crate::metadata::Metadata;

/// Broker-side facts about one delivery.
#[derive(Debug, Clone)]
pub struct DeliveryInfo {
    pub metadata: Metadata,
    pub content_type: String,
    /// Only meaningful for ack/nack on the consumer's channel
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
    /// When the producer created the message, if known
    pub created_at: Option<DateTime<Utc>>,
    pub delivered_at: DateTime<Utc>,
    /// Span the next span should be a child of
    pub span_context: SpanContext,
}

impl DeliveryInfo {
    /// Info for a message that did not come from a broker.
    pub fn local(metadata: Metadata) -> Self {
        Self {
            created_at: metadata.created(),
            content_type: metadata.content_type().unwrap_or_default().to_string(),
            metadata,
            delivery_tag: 0,
            redelivered: false,
            exchange: String::new(),
            routing_key: String::new(),
            queue: String::new(),
            delivered_at: Utc::now(),
            span_context: SpanContext::empty_context(),
        }
    }
}

/// Read-only view of a decoded delivery.
///
/// Cloning is cheap. Pipelines see the type-erased
/// `ConsumeContext<dyn DynMessage>`, handlers the typed one.
pub struct ConsumeContext<M: ?Sized> {
    message: Arc<M>,
    info: Arc<DeliveryInfo>,
}

impl<M: ?Sized> Clone for ConsumeContext<M> {
    fn clone(&self) -> Self {
        Self {
            message: self.message.clone(),
            info: self.info.clone(),
        }
    }
}

impl<M: Message> ConsumeContext<M> {
    pub fn new(message: M, info: DeliveryInfo) -> Self {
        Self {
            message: Arc::new(message),
            info: Arc::new(info),
        }
    }

    /// Type-erased view sharing the same message and info.
    pub fn erase(&self) -> ConsumeContext<dyn DynMessage> {
        ConsumeContext {
            message: self.message.clone(),
            info: self.info.clone(),
        }
    }

    /// Typed view carrying the info of `other`, which may have been
    /// updated by a pipeline stage.
    pub(crate) fn with_info_of(&self, other: &ConsumeContext<dyn DynMessage>) -> Self {
        Self {
            message: self.message.clone(),
            info: other.info.clone(),
        }
    }
}

impl<M: ?Sized> ConsumeContext<M> {
    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn message_arc(&self) -> Arc<M> {
        self.message.clone()
    }

    pub fn info(&self) -> &DeliveryInfo {
        &self.info
    }

    pub fn metadata(&self) -> &Metadata {
        &self.info.metadata
    }

    pub fn content_type(&self) -> &str {
        &self.info.content_type
    }

    pub fn delivery_tag(&self) -> u64 {
        self.info.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.info.redelivered
    }

    pub fn exchange(&self) -> &str {
        &self.info.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.info.routing_key
    }

    pub fn queue(&self) -> &str {
        &self.info.queue
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.info.created_at
    }

    pub fn delivered_at(&self) -> DateTime<Utc> {
        self.info.delivered_at
    }

    pub fn span_context(&self) -> &SpanContext {
        &self.info.span_context
    }

    /// Same delivery with a new parent span, for stages that open a span.
    pub fn with_span_context(&self, span_context: SpanContext) -> Self {
        let mut info = (*self.info).clone();
        info.span_context = span_context;
        Self {
            message: self.message.clone(),
            info: Arc::new(info),
        }
    }
}

impl ConsumeContext<dyn DynMessage> {
    pub fn message_type(&self) -> &str {
        self.message.message_type()
    }

    pub fn message_id(&self) -> &str {
        self.message.envelope().message_id()
    }

    pub fn correlation_id(&self) -> &str {
        self.message.envelope().correlation_id()
    }
}
