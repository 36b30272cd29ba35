//! Testing utilities for Postbus.
//!
//! - [`InMemoryBroker`] - an AMQP broker living in the test process,
//!   usable wherever a [`postbus_messaging::BrokerConnection`] is expected
//! - [`FakeHandler`], [`FailingHandler`], [`ConcurrencyProbe`] - consumer
//!   handlers that record what happened to them
//! - [`wait_until`] - bounded polling for asynchronous outcomes
//!
//! ## Quick Start
//!
//! ```
//! use postbus_messaging::*;
//! use postbus_testing::*;
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct Ping {
//!     #[serde(flatten)]
//!     base: MessageBase,
//! }
//! impl_message!(Ping);
//!
//! # tokio_test::block_on(async {
//! let broker = InMemoryBroker::new();
//! let deps = BusDependencies::new(broker.connect()).with_logger(postbus_log::Logger::none());
//! let bus = RabbitMqBus::new(deps, BusConfig::new());
//!
//! let handler = FakeHandler::<Ping>::new();
//! bus.connect_consumer_handler::<Ping, _>(handler.clone()).await.unwrap();
//! bus.start().await.unwrap();
//!
//! bus.publish_message(&Ping::default(), None).await.unwrap();
//! assert!(wait_until(Duration::from_secs(1), || handler.is_handled()).await);
//!
//! bus.stop(Duration::from_secs(1)).await.unwrap();
//! # });
//! ```

pub mod broker;
pub mod handlers;

pub use broker::{
    DeliveryRecord, InMemoryBroker, InMemoryChannel, InMemoryConnection, PublishedMessage,
    Settlement, SettlementRecord,
};
pub use handlers::{ConcurrencyProbe, FailingHandler, FakeHandler, wait_until};
