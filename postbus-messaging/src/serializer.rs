//! Pluggable message encoding.

use crate::error::MessagingError;
use crate::message::Message;

/// Content type of [`JsonSerializer`].
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Encodes message values to bytes and back.
///
/// Implementations work on `serde_json::Value` so the trait stays object
/// safe; [`SerializerExt`] adds the typed helpers.
pub trait MessageSerializer: Send + Sync {
    fn content_type(&self) -> &str;

    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, MessagingError>;

    fn decode(&self, body: &[u8]) -> Result<serde_json::Value, MessagingError>;
}

/// Output of [`SerializerExt::serialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    pub type_name: String,
}

/// Typed serialization on top of any [`MessageSerializer`].
pub trait SerializerExt: MessageSerializer {
    fn serialize<M: Message>(&self, message: &M) -> Result<SerializedMessage, MessagingError> {
        let value = serde_json::to_value(message)
            .map_err(|e| MessagingError::Serialization(e.to_string()))?;
        Ok(SerializedMessage {
            body: self.encode(&value)?,
            content_type: self.content_type().to_string(),
            type_name: M::MESSAGE_TYPE.to_string(),
        })
    }

    /// Decode `body` as `M`.
    ///
    /// Empty `type_name` / `content_type` are accepted; non-empty ones must
    /// match `M` and this serializer.
    fn deserialize<M: Message>(
        &self,
        body: &[u8],
        type_name: &str,
        content_type: &str,
    ) -> Result<M, MessagingError> {
        if !type_name.is_empty() && type_name != M::MESSAGE_TYPE {
            return Err(MessagingError::Deserialization(format!(
                "type name {} does not match {}",
                type_name,
                M::MESSAGE_TYPE
            )));
        }
        if !content_type.is_empty() && content_type != self.content_type() {
            return Err(MessagingError::Deserialization(format!(
                "content type {} is not supported by this serializer ({})",
                content_type,
                self.content_type()
            )));
        }
        if body.is_empty() {
            return Err(MessagingError::Deserialization("empty body".to_string()));
        }
        let value = self.decode(body)?;
        serde_json::from_value(value).map_err(|e| MessagingError::Deserialization(e.to_string()))
    }
}

impl<T: MessageSerializer + ?Sized> SerializerExt for T {}

/// JSON serializer, `application/json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl MessageSerializer for JsonSerializer {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, MessagingError> {
        serde_json::to_vec(value).map_err(|e| MessagingError::Serialization(e.to_string()))
    }

    fn decode(&self, body: &[u8]) -> Result<serde_json::Value, MessagingError> {
        serde_json::from_slice(body).map_err(|e| MessagingError::Deserialization(e.to_string()))
    }
}
