//! # Postbus Messaging
//!
//! Typed publish/subscribe over AMQP 0-9-1.
//!
//! Messages are plain serde structs carrying a [`MessageBase`] envelope.
//! Their type name decides where they travel: a `UserRegistered` message is
//! published to the `user_registered` exchange with routing key
//! `user_registered` and consumed from the `user_registered_queue` queue.
//!
//! - [`RabbitMqProducer`] publishes with publisher confirms; a publish
//!   returns only once the broker acknowledged the message.
//! - [`RabbitMqConsumer`] handles deliveries concurrently up to the
//!   prefetch count, retries failing handlers and nacks with requeue when
//!   retries run out.
//! - [`RabbitMqBus`] ties one producer and the consumers of every handled
//!   type together behind [`BusControl::start`] and [`BusControl::stop`].
//!
//! ## Features
//!
//! - `rabbitmq` (default) - the `lapin` backed [`AmqpConnection`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use postbus_messaging::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct UserRegistered {
//!     #[serde(flatten)]
//!     base: MessageBase,
//!     email: String,
//! }
//! impl_message!(UserRegistered);
//!
//! async fn run() -> Result<(), MessagingError> {
//!     let connection = AmqpConnection::connect(&RabbitMqConfig::from_env()?).await?;
//!     let bus = RabbitMqBus::new(BusDependencies::new(connection), BusConfig::new());
//!
//!     bus.connect_consumer_handler::<UserRegistered, _>(handler_fn(
//!         |ctx: ConsumeContext<UserRegistered>| async move {
//!             tracing::info!(email = %ctx.message().email, "welcome");
//!             Ok(())
//!         },
//!     ))
//!     .await?;
//!     bus.start().await?;
//!
//!     bus.publish_message(&UserRegistered::default(), None).await?;
//!
//!     bus.stop(DEFAULT_DRAIN_TIMEOUT).await
//! }
//! ```

pub mod bus;
pub mod config;
#[cfg(feature = "rabbitmq")]
pub mod connection;
pub mod consumer;
pub mod context;
pub mod error;
pub mod handler;
pub mod hooks;
pub mod message;
pub mod metadata;
pub mod naming;
pub mod pipeline;
pub mod producer;
pub mod retry;
pub mod serializer;
pub mod traits;

pub use bus::{
    BusConfig, BusControl, BusDependencies, ConsumerConnector, DEFAULT_DRAIN_TIMEOUT, RabbitMqBus,
};
pub use config::{
    BindingOptions, ConsumerOptions, DEFAULT_PREFETCH_COUNT, DeliveryMode, ExchangeKind,
    ExchangeOptions, ProducerOptions, QueueOptions, RabbitMqConfig,
};
#[cfg(feature = "rabbitmq")]
pub use connection::{AmqpChannel, AmqpConnection};
pub use consumer::{BusConsumer, ConsumerState, RabbitMqConsumer};
pub use context::{ConsumeContext, DeliveryInfo};
pub use error::{HandlerError, MessagingError};
pub use handler::{ConsumerHandler, FnHandler, handler_fn};
pub use hooks::{ConsumedMessage, Hooks, ProducedMessage};
pub use message::{DynMessage, Message, MessageBase};
pub use metadata::{Metadata, keys};
pub use naming::{MessageRegistry, MessageTopology, message_name};
pub use pipeline::{
    ConsumerPipeline, HandlerFn, LoggingPipeline, Next, PipelineChain, PipelineFuture,
    TracingPipeline, ValidationPipeline,
};
pub use producer::{Producer, RabbitMqProducer};
pub use retry::{BackoffStrategy, Retry, RetryError, RetryPolicy};
pub use serializer::{
    JSON_CONTENT_TYPE, JsonSerializer, MessageSerializer, SerializedMessage, SerializerExt,
};
pub use traits::{
    BrokerChannel, BrokerConnection, DeliveryStream, IncomingDelivery, MessageProperties,
    PublishConfirmation,
};
