//! Deterministic broker topology names and the message type registry.
//!
//! Producers and independently deployed consumers agree on exchange, queue
//! and routing key without shared configuration because every name is a
//! pure function of the message type name.

use std::collections::HashMap;
use std::fmt;

use heck::ToSnakeCase;

use crate::error::MessagingError;
use crate::message::{DynMessage, Message};
use crate::serializer::{MessageSerializer, SerializerExt};

/// Topic-friendly form of a type name: `ProducerConsumerMessage` becomes
/// `producer_consumer_message`.
pub fn message_name(type_name: &str) -> String {
    type_name.to_snake_case()
}

/// Exchange, queue and routing key derived from a message type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageTopology {
    pub type_name: String,
    pub name: String,
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl MessageTopology {
    pub fn of<M: Message>() -> Self {
        Self::for_type_name(M::MESSAGE_TYPE)
    }

    pub fn for_type_name(type_name: &str) -> Self {
        let name = message_name(type_name);
        Self {
            type_name: type_name.to_string(),
            exchange: name.clone(),
            queue: format!("{}_queue", name),
            routing_key: name.clone(),
            name,
        }
    }
}

type DecodeFn =
    fn(&dyn MessageSerializer, &[u8], &str) -> Result<Box<dyn DynMessage>, MessagingError>;

fn decode_as<M: Message>(
    serializer: &dyn MessageSerializer,
    body: &[u8],
    content_type: &str,
) -> Result<Box<dyn DynMessage>, MessagingError> {
    let message: M = serializer.deserialize(body, M::MESSAGE_TYPE, content_type)?;
    Ok(Box::new(message))
}

#[derive(Clone)]
struct Registration {
    topology: MessageTopology,
    decode: DecodeFn,
}

/// Explicit table of the message types known to a bus.
///
/// Resolves a type name from the wire back to its topology and to a
/// decoded message instance.
#[derive(Clone, Default)]
pub struct MessageRegistry {
    types: HashMap<String, Registration>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `M`. Registering the same type twice is a no-op.
    pub fn register<M: Message>(&mut self) -> &MessageTopology {
        &self
            .types
            .entry(M::MESSAGE_TYPE.to_string())
            .or_insert_with(|| Registration {
                topology: MessageTopology::of::<M>(),
                decode: decode_as::<M>,
            })
            .topology
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    pub fn topology(&self, type_name: &str) -> Option<&MessageTopology> {
        self.types.get(type_name).map(|r| &r.topology)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Decode a body using the type registered under `type_name`.
    pub fn decode(
        &self,
        serializer: &dyn MessageSerializer,
        type_name: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<Box<dyn DynMessage>, MessagingError> {
        let registration = self.types.get(type_name).ok_or_else(|| {
            MessagingError::NotFound(format!("message type {} is not registered", type_name))
        })?;
        (registration.decode)(serializer, body, content_type)
    }
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRegistry")
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBase;
    use crate::serializer::JsonSerializer;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct ProducerConsumerMessage {
        #[serde(flatten)]
        base: MessageBase,
        data: String,
    }

    crate::impl_message!(ProducerConsumerMessage);

    #[test]
    fn test_derived_names() {
        let topology = MessageTopology::of::<ProducerConsumerMessage>();
        assert_eq!(topology.type_name, "ProducerConsumerMessage");
        assert_eq!(topology.name, "producer_consumer_message");
        assert_eq!(topology.exchange, "producer_consumer_message");
        assert_eq!(topology.routing_key, "producer_consumer_message");
        assert_eq!(topology.queue, "producer_consumer_message_queue");
    }

    #[test]
    fn test_names_are_deterministic() {
        assert_eq!(
            MessageTopology::for_type_name("OrderCreatedV2"),
            MessageTopology::for_type_name("OrderCreatedV2")
        );
        assert_eq!(message_name("HTTPRequestSeen"), "http_request_seen");
    }

    #[test]
    fn test_registry_decodes_by_type_name() {
        let mut registry = MessageRegistry::new();
        registry.register::<ProducerConsumerMessage>();
        registry.register::<ProducerConsumerMessage>();
        assert_eq!(registry.len(), 1);

        let serializer = JsonSerializer::new();
        let original = ProducerConsumerMessage {
            data: "x".into(),
            ..Default::default()
        };
        let encoded = serializer.serialize(&original).unwrap();

        let decoded = registry
            .decode(
                &serializer,
                "ProducerConsumerMessage",
                &encoded.body,
                &encoded.content_type,
            )
            .unwrap();
        let decoded = decoded.downcast_ref::<ProducerConsumerMessage>().unwrap();
        assert_eq!(decoded.data, "x");
        assert_eq!(decoded.message_id(), original.message_id());
    }

    #[test]
    fn test_registry_unknown_type() {
        let registry = MessageRegistry::new();
        let err = registry
            .decode(&JsonSerializer::new(), "Nope", b"{}", "application/json")
            .err()
            .unwrap();
        assert!(matches!(err, MessagingError::NotFound(_)));
    }
}
