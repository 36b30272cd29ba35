//! Producer integration tests against the in-memory broker

mod common;

use common::*;
use opentelemetry::trace::{SpanKind, Status};
use postbus_messaging::*;
use postbus_testing::InMemoryBroker;
use std::sync::Arc;

async fn bind_queue(broker: &InMemoryBroker, exchange: &str, queue: &str, key: &str) {
    let channel = broker.connect().channel().await.unwrap();
    channel
        .declare_exchange(&ExchangeOptions::new(exchange))
        .await
        .unwrap();
    channel
        .declare_queue(&QueueOptions::new(queue))
        .await
        .unwrap();
    channel
        .bind_queue(queue, exchange, &BindingOptions::new(key))
        .await
        .unwrap();
    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_publish_uses_derived_topology() {
    let broker = InMemoryBroker::new();
    bind_queue(
        &broker,
        "producer_consumer_message",
        "producer_consumer_message_queue",
        "producer_consumer_message",
    )
    .await;

    let message = ProducerConsumerMessage::new("x");
    producer(&broker)
        .publish_message(&message, None)
        .await
        .unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 1);
    let sent = &published[0];
    assert_eq!(sent.exchange, "producer_consumer_message");
    assert_eq!(sent.routing_key, "producer_consumer_message");
    assert!(sent.mandatory);
    assert_eq!(sent.confirmation, PublishConfirmation::Ack);
    assert_eq!(sent.routed_to, vec!["producer_consumer_message_queue"]);

    let props = &sent.properties;
    assert_eq!(props.message_id.as_deref(), Some(message.message_id()));
    assert_eq!(props.kind.as_deref(), Some("ProducerConsumerMessage"));
    assert_eq!(props.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
    assert_eq!(props.delivery_mode, Some(2));
    assert!(props.timestamp.is_some());
    assert!(props.correlation_id.is_some());
    assert_eq!(props.headers.correlation_id(), props.correlation_id.as_deref());
    assert_eq!(props.headers.name(), Some("producer_consumer_message"));
    assert!(props.headers.created().is_some());

    let body: serde_json::Value = serde_json::from_slice(&sent.body).unwrap();
    assert_eq!(body["data"], "x");
    assert_eq!(body["messageId"], message.message_id());
}

#[tokio::test]
async fn test_caller_metadata_is_kept() {
    let broker = InMemoryBroker::new();
    bind_queue(
        &broker,
        "producer_consumer_message",
        "q",
        "producer_consumer_message",
    )
    .await;

    let metadata = Metadata::new()
        .with(keys::CORRELATION_ID, "corr-1")
        .with("tenant", "acme");
    producer(&broker)
        .publish_message(&ProducerConsumerMessage::new("x"), Some(metadata))
        .await
        .unwrap();

    let sent = &broker.published()[0];
    assert_eq!(sent.properties.correlation_id.as_deref(), Some("corr-1"));
    assert_eq!(sent.properties.headers.get_str("tenant"), Some("acme"));
}

#[tokio::test]
async fn test_unroutable_publish_fails() {
    let broker = InMemoryBroker::new();

    let result = producer(&broker)
        .publish_message(&ProducerConsumerMessage::new("x"), None)
        .await;

    assert!(matches!(result, Err(MessagingError::Publish(_))));
    // The exchange was still declared
    assert!(broker.exchange_exists("producer_consumer_message"));
}

#[tokio::test]
async fn test_broker_nack_fails_publish() {
    let broker = InMemoryBroker::new();
    bind_queue(
        &broker,
        "producer_consumer_message",
        "q",
        "producer_consumer_message",
    )
    .await;
    broker.set_nack_publishes(true);

    let result = producer(&broker)
        .publish_message(&ProducerConsumerMessage::new("x"), None)
        .await;

    assert!(matches!(result, Err(MessagingError::Confirm(_))));
    assert_eq!(broker.queue_depth("q"), 0);
}

#[tokio::test]
async fn test_topic_name_overrides_exchange() {
    let broker = InMemoryBroker::new();
    bind_queue(&broker, "audit", "audit_queue", "producer_consumer_message").await;

    producer(&broker)
        .publish_message_with_topic_name(&ProducerConsumerMessage::new("x"), None, Some("audit"))
        .await
        .unwrap();

    assert_eq!(broker.published()[0].exchange, "audit");
    assert_eq!(broker.queue_depth("audit_queue"), 1);
}

#[tokio::test]
async fn test_configured_options_apply() {
    let broker = InMemoryBroker::new();
    bind_queue(&broker, "payments", "payments_queue", "payments.captured").await;

    let options = ProducerOptions {
        exchange: ExchangeOptions::new("payments"),
        routing_key: "payments.captured".to_string(),
        delivery_mode: DeliveryMode::Transient,
        app_id: Some("billing".to_string()),
        priority: Some(5),
        ..ProducerOptions::for_message::<PaymentCaptured>()
    };
    let producer = producer(&broker).with_options::<PaymentCaptured>(options);

    producer
        .publish_message(
            &PaymentCaptured {
                amount_cents: 100,
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();

    let sent = &broker.published()[0];
    assert_eq!(sent.exchange, "payments");
    assert_eq!(sent.routing_key, "payments.captured");
    assert_eq!(sent.properties.delivery_mode, Some(1));
    assert_eq!(sent.properties.app_id.as_deref(), Some("billing"));
    assert_eq!(sent.properties.priority, Some(5));
}

#[tokio::test]
async fn test_every_publish_closes_its_channel() {
    let broker = InMemoryBroker::new();
    bind_queue(&broker, "producer_consumer_message", "q", "producer_consumer_message").await;
    let producer = producer(&broker);

    for _ in 0..3 {
        producer
            .publish_message(&ProducerConsumerMessage::new("x"), None)
            .await
            .unwrap();
    }
    let _ = producer
        .publish_message_with_topic_name(&ProducerConsumerMessage::new("x"), None, Some("nowhere"))
        .await;

    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn test_publish_on_closed_connection_records_error_span() {
    let broker = InMemoryBroker::new();
    let (provider, exporter) = span_recorder();
    let connection = broker.connect();
    let producer = RabbitMqProducer::new(
        connection.clone(),
        Arc::new(JsonSerializer::new()),
        Arc::new(postbus_telemetry::provider_tracer(&provider, "test")),
        postbus_log::Logger::none(),
    );

    connection.close().await.unwrap();
    let result = producer
        .publish_message(&ProducerConsumerMessage::new("x"), None)
        .await;

    assert!(matches!(result, Err(MessagingError::Connection(_))));
    assert!(broker.published().is_empty());

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "producer_consumer_message publish");
    assert_eq!(spans[0].span_kind, SpanKind::Producer);
    assert!(matches!(spans[0].status, Status::Error { .. }));
}

#[tokio::test]
async fn test_span_reports_configured_exchange_kind() {
    let broker = InMemoryBroker::new();
    let (provider, exporter) = span_recorder();
    let connection = broker.connect();
    let options = ProducerOptions {
        exchange: ExchangeOptions::new("producer_consumer_message").with_kind(ExchangeKind::Direct),
        ..ProducerOptions::for_message::<ProducerConsumerMessage>()
    };
    let producer = RabbitMqProducer::new(
        connection.clone(),
        Arc::new(JsonSerializer::new()),
        Arc::new(postbus_telemetry::provider_tracer(&provider, "test")),
        postbus_log::Logger::none(),
    )
    .with_options::<ProducerConsumerMessage>(options);

    connection.close().await.unwrap();
    let _ = producer
        .publish_message(&ProducerConsumerMessage::new("x"), None)
        .await;

    let spans = exporter.get_finished_spans().unwrap();
    let kind = spans[0]
        .attributes
        .iter()
        .find(|kv| kv.key.as_str() == postbus_telemetry::attributes::MESSAGING_DESTINATION_KIND)
        .map(|kv| kv.value.as_str().to_string());
    assert_eq!(kind.as_deref(), Some("direct"));
}

#[tokio::test]
async fn test_publish_injects_trace_headers() {
    let broker = InMemoryBroker::new();
    bind_queue(&broker, "producer_consumer_message", "q", "producer_consumer_message").await;
    let (provider, exporter) = span_recorder();
    let producer = RabbitMqProducer::new(
        broker.connect(),
        Arc::new(JsonSerializer::new()),
        Arc::new(postbus_telemetry::provider_tracer(&provider, "test")),
        postbus_log::Logger::none(),
    );

    producer
        .publish_message(&ProducerConsumerMessage::new("x"), None)
        .await
        .unwrap();

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].status, Status::Ok);

    let headers = &broker.published()[0].properties.headers;
    let trace_id = spans[0].span_context.trace_id().to_string();
    let span_id = spans[0].span_context.span_id().to_string();
    assert_eq!(headers.trace_id(), Some(trace_id.as_str()));
    assert_eq!(headers.span_id(), Some(span_id.as_str()));
    assert_eq!(
        headers.traceparent(),
        Some(format!("00-{}-{}-01", trace_id, span_id).as_str())
    );
}

#[tokio::test]
async fn test_hooks_fire_after_confirm() {
    let broker = InMemoryBroker::new();
    bind_queue(&broker, "producer_consumer_message", "q", "producer_consumer_message").await;
    let hooks = Arc::new(Hooks::new());
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let recorder = seen.clone();
    hooks.on_produced(move |m| recorder.lock().push(m.message_id.clone()));

    let producer = producer(&broker).with_hooks(hooks);
    let message = ProducerConsumerMessage::new("x");
    producer.publish_message(&message, None).await.unwrap();

    broker.set_nack_publishes(true);
    assert!(producer.publish_message(&message, None).await.is_err());

    assert_eq!(*seen.lock(), vec![message.message_id().to_string()]);
}
