//! Span attribute keys for messaging operations.
//!
//! The messaging keys are still experimental in the semantic conventions
//! crate, so the subset the bus records lives here.

use opentelemetry::KeyValue;

/// Messaging system identifier.
pub const MESSAGING_SYSTEM: &str = "messaging.system";
/// Exchange the message was published to or consumed from.
pub const MESSAGING_DESTINATION_NAME: &str = "messaging.destination.name";
/// Kind of destination (`topic`, `queue`).
pub const MESSAGING_DESTINATION_KIND: &str = "messaging.destination.kind";
/// Routing key used for the publish.
pub const MESSAGING_RABBITMQ_ROUTING_KEY: &str = "messaging.rabbitmq.destination.routing_key";
/// Message identifier.
pub const MESSAGING_MESSAGE_ID: &str = "messaging.message.id";
/// Correlation identifier.
pub const MESSAGING_CONVERSATION_ID: &str = "messaging.message.conversation_id";
/// `publish` or `process`.
pub const MESSAGING_OPERATION: &str = "messaging.operation";
/// Queue a consumer reads from.
pub const MESSAGING_CONSUMER_ID: &str = "messaging.consumer.id";
/// Message type name.
pub const MESSAGING_MESSAGE_TYPE: &str = "messaging.message.type";
/// Body size in bytes.
pub const MESSAGING_MESSAGE_BODY_SIZE: &str = "messaging.message.body.size";

/// Value of [`MESSAGING_SYSTEM`] for this bus.
pub const RABBITMQ_SYSTEM: &str = "rabbitmq";

/// Attributes shared by publish and process spans.
pub fn message_attributes(
    message_type: &str,
    message_id: &str,
    correlation_id: Option<&str>,
) -> Vec<KeyValue> {
    let mut attrs = vec![
        KeyValue::new(MESSAGING_SYSTEM, RABBITMQ_SYSTEM),
        KeyValue::new(MESSAGING_MESSAGE_TYPE, message_type.to_string()),
        KeyValue::new(MESSAGING_MESSAGE_ID, message_id.to_string()),
    ];
    if let Some(id) = correlation_id.filter(|id| !id.is_empty()) {
        attrs.push(KeyValue::new(MESSAGING_CONVERSATION_ID, id.to_string()));
    }
    attrs
}
