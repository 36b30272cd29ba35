//! Message identity and the traits every domain message implements.

use std::any::Any;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::error::MessagingError;

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Identity embedded in every domain message.
///
/// The message id is assigned once at construction and cannot be changed
/// afterwards. The correlation id is filled in by the producer when left
/// empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBase {
    #[serde(default = "new_message_id")]
    message_id: String,
    #[serde(default)]
    correlation_id: String,
}

impl MessageBase {
    /// Create a base with a fresh message id and no correlation id
    pub fn new() -> Self {
        Self {
            message_id: new_message_id(),
            correlation_id: String::new(),
        }
    }

    /// Create a base correlated with an existing conversation
    pub fn correlated(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            ..Self::new()
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn set_correlation_id(&mut self, correlation_id: impl Into<String>) {
        self.correlation_id = correlation_id.into();
    }
}

impl Default for MessageBase {
    fn default() -> Self {
        Self::new()
    }
}

/// A domain message that can travel over the bus.
///
/// `MESSAGE_TYPE` is the stable type name. Exchange, queue and routing key
/// are derived from it, so it must be identical in every service that
/// produces or consumes the message.
///
/// `Default` is the value handed to handlers when a delivery cannot be
/// decoded.
pub trait Message: Serialize + DeserializeOwned + Default + Send + Sync + 'static {
    /// Stable type name, e.g. `"OrderCreated"`.
    const MESSAGE_TYPE: &'static str;

    fn base(&self) -> &MessageBase;

    fn base_mut(&mut self) -> &mut MessageBase;

    fn message_id(&self) -> &str {
        self.base().message_id()
    }

    fn correlation_id(&self) -> &str {
        self.base().correlation_id()
    }

    /// Check the message content before it reaches a handler.
    fn validate(&self) -> Result<(), MessagingError> {
        Ok(())
    }
}

/// Object-safe view of a [`Message`], used by pipelines and the type registry.
///
/// Method names differ from [`Message`] so both traits can be in scope.
pub trait DynMessage: Send + Sync + 'static {
    fn message_type(&self) -> &str;

    /// Identity of the message.
    fn envelope(&self) -> &MessageBase;

    /// Runs [`Message::validate`].
    fn run_validation(&self) -> Result<(), MessagingError>;

    /// Serialize into a JSON value.
    fn to_value(&self) -> Result<serde_json::Value, MessagingError>;

    fn as_any(&self) -> &dyn Any;
}

impl<M: Message> DynMessage for M {
    fn message_type(&self) -> &str {
        M::MESSAGE_TYPE
    }

    fn envelope(&self) -> &MessageBase {
        self.base()
    }

    fn run_validation(&self) -> Result<(), MessagingError> {
        self.validate()
    }

    fn to_value(&self) -> Result<serde_json::Value, MessagingError> {
        serde_json::to_value(self).map_err(|e| MessagingError::Serialization(e.to_string()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn DynMessage {
    /// Downcast to a concrete message type.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.as_any().downcast_ref::<M>()
    }
}

/// Implement [`Message`] for a struct with a `base: MessageBase` field.
///
/// ```
/// use postbus_messaging::{impl_message, Message, MessageBase};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Default, Serialize, Deserialize)]
/// struct OrderCreated {
///     #[serde(flatten)]
///     base: MessageBase,
///     order_id: u64,
/// }
///
/// impl_message!(OrderCreated);
///
/// assert_eq!(OrderCreated::MESSAGE_TYPE, "OrderCreated");
/// ```
#[macro_export]
macro_rules! impl_message {
    ($ty:ident) => {
        $crate::impl_message!($ty, stringify!($ty));
    };
    ($ty:ident, $name:expr) => {
        impl $crate::Message for $ty {
            const MESSAGE_TYPE: &'static str = $name;

            fn base(&self) -> &$crate::MessageBase {
                &self.base
            }

            fn base_mut(&mut self) -> &mut $crate::MessageBase {
                &mut self.base
            }
        }
    };
}
