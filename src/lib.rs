//! # Postbus
//!
//! A typed publish/subscribe message bus over AMQP 0-9-1.
//!
//! This crate re-exports the workspace crates behind one dependency:
//!
//! - [`messaging`] - messages, producer, consumers, pipeline and the bus
//! - [`log`] - the structured logger handed to the bus
//! - [`telemetry`] - OpenTelemetry tracer setup and trace propagation
//! - `testing` (feature `testing`) - an in-memory broker and fake handlers
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use postbus::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct OrderPlaced {
//!     #[serde(flatten)]
//!     base: MessageBase,
//!     order_id: u64,
//! }
//! impl_message!(OrderPlaced);
//!
//! #[tokio::main]
//! async fn main() -> Result<(), MessagingError> {
//!     let logger = Logger::from_env();
//!     let connection = AmqpConnection::connect(&RabbitMqConfig::from_env()?).await?;
//!     let bus = RabbitMqBus::new(
//!         BusDependencies::new(connection).with_logger(logger),
//!         BusConfig::new(),
//!     );
//!
//!     bus.connect_consumer_handler::<OrderPlaced, _>(handler_fn(
//!         |ctx: ConsumeContext<OrderPlaced>| async move {
//!             tracing::info!(order_id = ctx.message().order_id, "order placed");
//!             Ok(())
//!         },
//!     ))
//!     .await?;
//!     bus.start().await?;
//!
//!     bus.publish_message(&OrderPlaced { order_id: 7, ..Default::default() }, None)
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     bus.stop(DEFAULT_DRAIN_TIMEOUT).await
//! }
//! ```

pub use postbus_log as log;
pub use postbus_messaging as messaging;
pub use postbus_telemetry as telemetry;

#[cfg(feature = "testing")]
pub use postbus_testing as testing;

pub use postbus_messaging::*;

// Prelude for common imports
pub mod prelude {
    pub use postbus_log::{Format, Level, LogConfig, Logger};
    #[cfg(feature = "rabbitmq")]
    pub use postbus_messaging::AmqpConnection;
    pub use postbus_messaging::{
        BusConfig, BusControl, BusDependencies, ConsumeContext, ConsumerConnector,
        ConsumerHandler, ConsumerOptions, DEFAULT_DRAIN_TIMEOUT, HandlerError, Message,
        MessageBase, MessagingError, Metadata, Producer, ProducerOptions, RabbitMqBus,
        RabbitMqConfig, handler_fn, impl_message,
    };
    pub use postbus_telemetry::{TelemetryConfig, TracingExporter, init_tracing, shutdown_tracing};
}
