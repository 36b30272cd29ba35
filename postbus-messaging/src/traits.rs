//! Broker connection and channel abstractions.
//!
//! The bus only talks to the broker through these traits. The AMQP
//! implementation lives in [`crate::connection`]; tests use an in-memory
//! broker.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use tokio::sync::watch;

use crate::config::{BindingOptions, ExchangeOptions, QueueOptions};
use crate::error::MessagingError;
use crate::metadata::Metadata;

/// Stream of deliveries for one consumer tag. Ends when the subscription is
/// cancelled or the channel closes.
pub type DeliveryStream =
    Pin<Box<dyn Stream<Item = Result<IncomingDelivery, MessagingError>> + Send>>;

/// AMQP basic properties of a message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Seconds since the Unix epoch
    pub timestamp: Option<u64>,
    /// AMQP `type`, the message type name
    pub kind: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub delivery_mode: Option<u8>,
    pub expiration: Option<String>,
    pub app_id: Option<String>,
    pub priority: Option<u8>,
    pub reply_to: Option<String>,
    pub headers: Metadata,
}

/// A message pushed by the broker to a consumer.
#[derive(Debug, Clone)]
pub struct IncomingDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Broker answer to a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishConfirmation {
    /// Broker took responsibility for the message
    Ack,
    /// Broker refused the message
    Nack,
    /// Mandatory message could not be routed to any queue
    Returned,
    /// Channel is not in confirm mode
    NotRequested,
}

/// A connection to the broker, shared by producers and consumers.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_closed(&self) -> bool;

    /// Open a new channel. Every producer publish and every consumer uses its own.
    async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, MessagingError>;

    async fn close(&self) -> Result<(), MessagingError>;

    /// Watch that flips to `true` once the connection is closed or lost.
    fn notify_close(&self) -> watch::Receiver<bool>;

    /// Dial a fresh connection with the same settings. Channels of the old
    /// connection are not migrated.
    async fn reconnect(&self) -> Result<Arc<dyn BrokerConnection>, MessagingError>;
}

/// One AMQP channel.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Limit unacknowledged deliveries on this channel.
    async fn qos(&self, prefetch_count: u16) -> Result<(), MessagingError>;

    async fn declare_exchange(&self, options: &ExchangeOptions) -> Result<(), MessagingError>;

    async fn declare_queue(&self, options: &QueueOptions) -> Result<(), MessagingError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding: &BindingOptions,
    ) -> Result<(), MessagingError>;

    /// Put the channel into publisher-confirm mode.
    async fn confirm_select(&self) -> Result<(), MessagingError>;

    /// Publish and wait for the broker's confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<PublishConfirmation, MessagingError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, MessagingError>;

    /// Cancel a subscription; its delivery stream ends.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError>;

    async fn close(&self) -> Result<(), MessagingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Verify traits are object-safe
    fn _assert_object_safe(_: &dyn BrokerConnection, _: &dyn BrokerChannel) {}

    #[test]
    fn test_default_properties_are_empty() {
        let props = MessageProperties::default();
        assert!(props.message_id.is_none());
        assert!(props.headers.is_empty());
    }
}
