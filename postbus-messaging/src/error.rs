//! Error types for messaging operations

use thiserror::Error;

/// Error type returned by consumer handlers and pipeline stages.
///
/// Boxed so handlers can bubble up any error with `?`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during messaging operations
#[derive(Error, Debug)]
pub enum MessagingError {
    /// Invalid or missing configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Failed to connect to the broker, or the connection is closed
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Channel is closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Failed to open or use a channel
    #[error("Channel error: {0}")]
    Channel(String),

    /// Failed to declare an exchange, queue or binding
    #[error("Declare failed: {0}")]
    Declare(String),

    /// Failed to publish a message
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Broker did not positively confirm a publish
    #[error("Publish not confirmed: {0}")]
    Confirm(String),

    /// Failed to serialize a message
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a message
    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    /// Message failed validation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A handler failed after all retries
    #[error("Handler failed after {attempts} attempts: {message}")]
    Handler {
        /// Attempts made
        attempts: u32,
        /// Last error message
        message: String,
    },

    /// Failed to acknowledge a message
    #[error("Acknowledge failed: {0}")]
    Acknowledge(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Exchange/queue/consumer not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Exchange/queue/consumer already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Internal broker error
    #[error("Broker error: {0}")]
    BrokerError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl MessagingError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MessagingError::Connection(_)
                | MessagingError::Timeout(_)
                | MessagingError::ChannelClosed(_)
                | MessagingError::Channel(_)
                | MessagingError::BrokerError(_)
        )
    }

    /// Check if this error indicates a connection issue
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            MessagingError::Connection(_) | MessagingError::ChannelClosed(_)
        )
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            MessagingError::Deserialization(err.to_string())
        } else {
            MessagingError::Serialization(err.to_string())
        }
    }
}

#[cfg(feature = "rabbitmq")]
impl From<lapin::Error> for MessagingError {
    fn from(err: lapin::Error) -> Self {
        match err.kind() {
            lapin::ErrorKind::IOError(_) => MessagingError::Connection(err.to_string()),
            lapin::ErrorKind::ChannelsLimitReached => MessagingError::Channel(err.to_string()),
            lapin::ErrorKind::InvalidChannelState(..) => MessagingError::ChannelClosed(err.to_string()),
            lapin::ErrorKind::InvalidConnectionState(_) => MessagingError::Connection(err.to_string()),
            _ => MessagingError::BrokerError(err.to_string()),
        }
    }
}
