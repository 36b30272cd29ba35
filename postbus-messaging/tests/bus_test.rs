//! Bus integration tests against the in-memory broker

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::*;
use opentelemetry::trace::SpanKind;
use postbus_messaging::*;
use postbus_testing::*;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_published_message_is_handled() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let handler = FakeHandler::<ProducerConsumerMessage>::new();

    bus.connect_consumer_handler::<ProducerConsumerMessage, _>(handler.clone())
        .await
        .unwrap();
    bus.start().await.unwrap();
    assert!(bus.is_running());

    bus.publish_message(&ProducerConsumerMessage::new("x"), None)
        .await
        .unwrap();

    assert!(wait_until(WAIT, || handler.is_handled()).await);
    assert_eq!(handler.messages()[0].data, "x");

    bus.stop(WAIT).await.unwrap();
    assert!(!bus.is_running());
}

#[tokio::test]
async fn test_handlers_of_one_type_share_a_consumer() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let first = FakeHandler::<ProducerConsumerMessage>::new();
    let second = FakeHandler::<ProducerConsumerMessage>::new();

    bus.connect_consumer_handler::<ProducerConsumerMessage, _>(first.clone())
        .await
        .unwrap();
    bus.connect_consumer_handler::<ProducerConsumerMessage, _>(second.clone())
        .await
        .unwrap();

    assert_eq!(bus.consumers().len(), 1);
    let consumer = bus.consumer::<ProducerConsumerMessage>().unwrap();
    assert_eq!(consumer.handler_count(), 2);
    assert!(bus.consumer::<PaymentCaptured>().is_none());

    bus.start().await.unwrap();
    bus.publish_message(&ProducerConsumerMessage::new("x"), None)
        .await
        .unwrap();

    assert!(wait_until(WAIT, || first.is_handled() && second.is_handled()).await);
    bus.stop(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_consumers_on_distinct_queues_both_receive() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let orders = FakeHandler::<ProducerConsumerMessage>::new();
    let audit = FakeHandler::<ProducerConsumerMessage>::new();

    let audit_options = ConsumerOptions {
        queue: QueueOptions::new("producer_consumer_message_audit"),
        ..consumer_options::<ProducerConsumerMessage>()
    };
    let connection = bus.connection().clone();
    for (options, handler) in [
        (consumer_options::<ProducerConsumerMessage>(), orders.clone()),
        (audit_options, audit.clone()),
    ] {
        let consumer = RabbitMqConsumer::<ProducerConsumerMessage>::new(
            connection.clone(),
            Arc::new(JsonSerializer::new()),
            postbus_log::Logger::none(),
            options,
        )
        .with_handler(handler);
        bus.connect_consumer(Arc::new(consumer)).await.unwrap();
    }

    bus.start().await.unwrap();
    bus.publish_message(&ProducerConsumerMessage::new("x"), None)
        .await
        .unwrap();

    assert!(wait_until(WAIT, || orders.is_handled() && audit.is_handled()).await);
    assert_eq!(broker.published()[0].routed_to.len(), 2);

    bus.stop(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_consumer_connected_to_running_bus_starts() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    bus.start().await.unwrap();

    let handler = FakeHandler::<ProducerConsumerMessage>::new();
    bus.connect_consumer_handler::<ProducerConsumerMessage, _>(handler.clone())
        .await
        .unwrap();
    let consumer = bus.consumer::<ProducerConsumerMessage>().unwrap();
    assert_eq!(consumer.state(), ConsumerState::Consuming);

    bus.publish_message(&ProducerConsumerMessage::new("x"), None)
        .await
        .unwrap();
    assert!(wait_until(WAIT, || handler.is_handled()).await);

    bus.stop(WAIT).await.unwrap();
    assert_eq!(consumer.state(), ConsumerState::Stopped);
}

#[tokio::test]
async fn test_start_twice_keeps_consumers_running() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let handler = FakeHandler::<ProducerConsumerMessage>::new();
    bus.connect_consumer_handler::<ProducerConsumerMessage, _>(handler)
        .await
        .unwrap();

    bus.start().await.unwrap();
    bus.start().await.unwrap();
    assert_eq!(broker.consumer_count("producer_consumer_message_queue"), 1);

    bus.stop(WAIT).await.unwrap();
    bus.stop(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_start_accepts_consumer_started_elsewhere() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    bus.connect_consumer_handler::<ProducerConsumerMessage, _>(
        FakeHandler::<ProducerConsumerMessage>::new(),
    )
    .await
    .unwrap();
    let consumer = bus.consumer::<ProducerConsumerMessage>().unwrap();
    consumer.consume().await.unwrap();

    bus.start().await.unwrap();
    assert_eq!(consumer.state(), ConsumerState::Consuming);
    assert_eq!(broker.consumer_count("producer_consumer_message_queue"), 1);

    bus.stop(WAIT).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_start_and_connect() {
    for _ in 0..50 {
        let broker = InMemoryBroker::new();
        let bus = Arc::new(bus(&broker));

        let starter = bus.clone();
        let start = tokio::spawn(async move { starter.start().await });
        let connector = bus.clone();
        let connect = tokio::spawn(async move {
            connector
                .connect_consumer_handler::<ProducerConsumerMessage, _>(
                    FakeHandler::<ProducerConsumerMessage>::new(),
                )
                .await
        });

        start.await.unwrap().unwrap();
        connect.await.unwrap().unwrap();
        // Whichever ran last started the consumer exactly once
        bus.start().await.unwrap();
        assert_eq!(broker.consumer_count("producer_consumer_message_queue"), 1);

        bus.stop(WAIT).await.unwrap();
    }
}

#[tokio::test]
async fn test_stop_drains_all_consumers() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let slow = ConcurrencyProbe::<ProducerConsumerMessage>::new(Duration::from_millis(150));
    let payments = ConcurrencyProbe::<PaymentCaptured>::new(Duration::from_millis(150));
    bus.connect_consumer_handler::<ProducerConsumerMessage, _>(slow.clone())
        .await
        .unwrap();
    bus.connect_consumer_handler::<PaymentCaptured, _>(payments.clone())
        .await
        .unwrap();
    bus.start().await.unwrap();

    bus.publish_message(&ProducerConsumerMessage::new("x"), None)
        .await
        .unwrap();
    bus.publish_message(
        &PaymentCaptured {
            amount_cents: 10,
            ..Default::default()
        },
        None,
    )
    .await
    .unwrap();
    assert!(wait_until(WAIT, || slow.in_flight() == 1 && payments.in_flight() == 1).await);

    bus.stop(WAIT).await.unwrap();

    assert_eq!(slow.completed(), 1);
    assert_eq!(payments.completed(), 1);
    for consumer in bus.consumers() {
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }
}

#[tokio::test]
async fn test_stop_reports_drain_timeout() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let stuck = ConcurrencyProbe::<ProducerConsumerMessage>::new(Duration::from_secs(10));
    let quick = FakeHandler::<PaymentCaptured>::new();
    bus.connect_consumer_handler::<ProducerConsumerMessage, _>(stuck.clone())
        .await
        .unwrap();
    bus.connect_consumer_handler::<PaymentCaptured, _>(quick)
        .await
        .unwrap();
    bus.start().await.unwrap();

    bus.publish_message(&ProducerConsumerMessage::new("x"), None)
        .await
        .unwrap();
    assert!(wait_until(WAIT, || stuck.in_flight() == 1).await);

    let result = bus.stop(Duration::from_millis(50)).await;

    assert!(matches!(result, Err(MessagingError::Timeout(_))));
    for consumer in bus.consumers() {
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }
}

#[tokio::test]
async fn test_configured_consumer_options_are_used() {
    let broker = InMemoryBroker::new();
    let options = ConsumerOptions {
        queue: QueueOptions::new("billing_payments"),
        prefetch_count: 1,
        ..consumer_options::<PaymentCaptured>()
    };
    let bus = RabbitMqBus::new(
        deps(&broker),
        BusConfig::new().with_consumer_options::<PaymentCaptured>(options),
    );
    let handler = FakeHandler::<PaymentCaptured>::new();
    bus.connect_consumer_handler::<PaymentCaptured, _>(handler)
        .await
        .unwrap();
    bus.start().await.unwrap();

    assert!(broker.queue_exists("billing_payments"));
    assert!(!broker.queue_exists("payment_captured_queue"));
    let consumer = bus.consumer::<PaymentCaptured>().unwrap();
    assert_eq!(consumer.options().prefetch_count, 1);

    bus.stop(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_lifecycle_hooks() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let produced = Arc::new(AtomicUsize::new(0));
    let consumed = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let counter = produced.clone();
    bus.on_produced(move |m| {
        assert_eq!(m.exchange, "producer_consumer_message");
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let recorder = consumed.clone();
    bus.on_consumed(move |m| recorder.lock().push(m.clone()));

    let handler = FakeHandler::<ProducerConsumerMessage>::new();
    bus.connect_consumer_handler::<ProducerConsumerMessage, _>(handler)
        .await
        .unwrap();
    bus.start().await.unwrap();

    let message = ProducerConsumerMessage::new("x");
    bus.publish_message(&message, None).await.unwrap();

    assert!(wait_until(WAIT, || consumed.lock().len() == 1).await);
    assert_eq!(produced.load(Ordering::SeqCst), 1);
    let consumed = consumed.lock()[0].clone();
    assert_eq!(consumed.message_type, "ProducerConsumerMessage");
    assert_eq!(consumed.message_id, message.message_id());
    assert_eq!(consumed.queue, "producer_consumer_message_queue");

    bus.stop(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_bus_pipelines_wrap_handlers() {
    struct Counting(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl ConsumerPipeline for Counting {
        async fn handle(
            &self,
            ctx: ConsumeContext<dyn DynMessage>,
            next: Next,
        ) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            next(ctx).await
        }
    }

    let broker = InMemoryBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let bus = RabbitMqBus::new(
        deps(&broker),
        BusConfig::new().with_pipeline(Counting(calls.clone())),
    );
    let handler = FakeHandler::<ProducerConsumerMessage>::new();
    bus.connect_consumer_handler::<ProducerConsumerMessage, _>(handler.clone())
        .await
        .unwrap();
    bus.start().await.unwrap();

    bus.publish_message(&ProducerConsumerMessage::new("x"), None)
        .await
        .unwrap();

    assert!(wait_until(WAIT, || handler.is_handled()).await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    bus.stop(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_registry_tracks_bus_types() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let handler = FakeHandler::<PaymentCaptured>::new();
    bus.connect_consumer_handler::<PaymentCaptured, _>(handler)
        .await
        .unwrap();
    bus.register::<ProducerConsumerMessage>();

    bus.with_registry(|registry| {
        assert_eq!(registry.len(), 2);
        let topology = registry.topology("PaymentCaptured").unwrap();
        assert_eq!(topology.queue, "payment_captured_queue");
    });
}

#[tokio::test]
async fn test_consumer_span_continues_producer_trace() {
    let broker = InMemoryBroker::new();
    let (provider, exporter) = span_recorder();
    let deps = deps(&broker).with_tracer(postbus_telemetry::provider_tracer(&provider, "test"));
    let bus = RabbitMqBus::new(deps, BusConfig::new());
    let handler = FakeHandler::<ProducerConsumerMessage>::new();
    bus.connect_consumer_handler::<ProducerConsumerMessage, _>(handler.clone())
        .await
        .unwrap();
    bus.start().await.unwrap();

    bus.publish_message(&ProducerConsumerMessage::new("x"), None)
        .await
        .unwrap();
    assert!(
        wait_until(WAIT, || exporter
            .get_finished_spans()
            .map(|s| s.len() == 2)
            .unwrap_or(false))
        .await
    );
    bus.stop(WAIT).await.unwrap();

    let spans = exporter.get_finished_spans().unwrap();
    let producer = spans
        .iter()
        .find(|s| s.span_kind == SpanKind::Producer)
        .unwrap();
    let consumer = spans
        .iter()
        .find(|s| s.span_kind == SpanKind::Consumer)
        .unwrap();

    assert_eq!(consumer.name, "ProducerConsumerMessage process");
    assert_eq!(
        consumer.span_context.trace_id(),
        producer.span_context.trace_id()
    );
    assert_eq!(consumer.parent_span_id, producer.span_context.span_id());
}
