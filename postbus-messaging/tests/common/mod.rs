//! Shared fixtures for the messaging integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};
use postbus_log::Logger;
use postbus_messaging::*;
use postbus_testing::InMemoryBroker;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerConsumerMessage {
    #[serde(flatten)]
    pub base: MessageBase,
    pub data: String,
}

impl_message!(ProducerConsumerMessage);

impl ProducerConsumerMessage {
    pub fn new(data: &str) -> Self {
        Self {
            data: data.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PaymentCaptured {
    #[serde(flatten)]
    pub base: MessageBase,
    pub amount_cents: i64,
}

impl Message for PaymentCaptured {
    const MESSAGE_TYPE: &'static str = "PaymentCaptured";

    fn base(&self) -> &MessageBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MessageBase {
        &mut self.base
    }

    fn validate(&self) -> Result<(), MessagingError> {
        if self.amount_cents <= 0 {
            return Err(MessagingError::Validation(
                "amount must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry quickly so requeue loops do not slow the tests down.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3).backoff(BackoffStrategy::constant(std::time::Duration::from_millis(5)))
}

pub fn consumer_options<M: Message>() -> ConsumerOptions {
    ConsumerOptions {
        retry: fast_retry(),
        ..ConsumerOptions::for_message::<M>()
    }
}

pub fn deps(broker: &InMemoryBroker) -> BusDependencies {
    BusDependencies::new(broker.connect()).with_logger(Logger::none())
}

pub fn bus(broker: &InMemoryBroker) -> RabbitMqBus {
    RabbitMqBus::new(deps(broker), BusConfig::new())
}

pub fn producer(broker: &InMemoryBroker) -> RabbitMqProducer {
    RabbitMqProducer::new(
        broker.connect(),
        Arc::new(JsonSerializer::new()),
        Arc::new(postbus_telemetry::tracer("test")),
        Logger::none(),
    )
}

pub fn consumer<M: Message>(
    broker: &InMemoryBroker,
    options: ConsumerOptions,
) -> RabbitMqConsumer<M> {
    RabbitMqConsumer::new(
        broker.connect(),
        Arc::new(JsonSerializer::new()),
        Logger::none(),
        options,
    )
}

/// Tracer exporting into memory, for span assertions.
pub fn span_recorder() -> (SdkTracerProvider, InMemorySpanExporter) {
    let exporter = InMemorySpanExporter::default();
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(exporter.clone())
        .build();
    (provider, exporter)
}
