//! The message bus: one producer and the consumers of every handled type.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use opentelemetry::global::BoxedTracer;
use parking_lot::RwLock;
use postbus_log::Logger;
use tracing::{debug, error, info};

use crate::config::{ConsumerOptions, ProducerOptions};
use crate::consumer::{BusConsumer, ConsumerState, RabbitMqConsumer};
use crate::error::MessagingError;
use crate::handler::ConsumerHandler;
use crate::hooks::{ConsumedMessage, Hooks, ProducedMessage};
use crate::message::Message;
use crate::metadata::Metadata;
use crate::naming::MessageRegistry;
use crate::pipeline::{ConsumerPipeline, PipelineChain};
use crate::producer::{Producer, RabbitMqProducer};
use crate::serializer::{JsonSerializer, MessageSerializer};
use crate::traits::BrokerConnection;

/// Drain timeout used by callers that have no better value.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Collaborators every bus actor shares.
#[derive(Clone)]
pub struct BusDependencies {
    pub connection: Arc<dyn BrokerConnection>,
    pub serializer: Arc<dyn MessageSerializer>,
    pub logger: Logger,
    pub tracer: Arc<BoxedTracer>,
}

impl BusDependencies {
    /// JSON serialization, the calling thread's subscriber and the global
    /// tracer provider.
    pub fn new(connection: Arc<dyn BrokerConnection>) -> Self {
        Self {
            connection,
            serializer: Arc::new(JsonSerializer::new()),
            logger: Logger::current(),
            tracer: Arc::new(postbus_telemetry::tracer("postbus")),
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_tracer(mut self, tracer: BoxedTracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }
}

/// Per-type settings and consumer pipelines.
#[derive(Clone)]
pub struct BusConfig {
    pub producers: HashMap<String, ProducerOptions>,
    pub consumers: HashMap<String, ConsumerOptions>,
    /// Run tracing, logging and validation stages ahead of `pipelines`
    pub standard_pipelines: bool,
    pub pipelines: Vec<Arc<dyn ConsumerPipeline>>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            producers: HashMap::new(),
            consumers: HashMap::new(),
            standard_pipelines: true,
            pipelines: Vec::new(),
        }
    }
}

impl BusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_producer_options<M: Message>(mut self, options: ProducerOptions) -> Self {
        self.producers.insert(M::MESSAGE_TYPE.to_string(), options);
        self
    }

    pub fn with_consumer_options<M: Message>(mut self, options: ConsumerOptions) -> Self {
        self.consumers.insert(M::MESSAGE_TYPE.to_string(), options);
        self
    }

    pub fn with_pipeline<P: ConsumerPipeline + 'static>(mut self, pipeline: P) -> Self {
        self.pipelines.push(Arc::new(pipeline));
        self
    }

    pub fn without_standard_pipelines(mut self) -> Self {
        self.standard_pipelines = false;
        self
    }
}

/// Starting and stopping every consumer of a bus.
#[async_trait]
pub trait BusControl: Send + Sync {
    /// Start consumers one after the other. Consumers already consuming
    /// are left alone.
    async fn start(&self) -> Result<(), MessagingError>;

    /// Stop all consumers concurrently, draining each for at most
    /// `drain_timeout`. Returns the first error after all have stopped.
    async fn stop(&self, drain_timeout: Duration) -> Result<(), MessagingError>;
}

/// Attaching consumers after construction.
#[async_trait]
pub trait ConsumerConnector: Send + Sync {
    /// Attach a consumer. It is started at once if the bus is running.
    async fn connect_consumer(&self, consumer: Arc<dyn BusConsumer>) -> Result<(), MessagingError>;

    /// Add `handler` to the bus consumer of `M`, creating that consumer if
    /// there is none yet.
    async fn connect_consumer_handler<M, H>(&self, handler: H) -> Result<(), MessagingError>
    where
        M: Message,
        H: ConsumerHandler<M> + 'static;
}

/// Message bus over a [`BrokerConnection`].
pub struct RabbitMqBus {
    deps: BusDependencies,
    config: BusConfig,
    producer: RabbitMqProducer,
    pipelines: PipelineChain,
    consumers: RwLock<Vec<Arc<dyn BusConsumer>>>,
    registry: RwLock<MessageRegistry>,
    hooks: Arc<Hooks>,
    running: AtomicBool,
}

impl RabbitMqBus {
    pub fn new(deps: BusDependencies, config: BusConfig) -> Self {
        let hooks = Arc::new(Hooks::new());

        let mut producer = RabbitMqProducer::new(
            deps.connection.clone(),
            deps.serializer.clone(),
            deps.tracer.clone(),
            deps.logger.clone(),
        )
        .with_hooks(hooks.clone());
        for (type_name, options) in &config.producers {
            producer = producer.with_type_options(type_name.clone(), options.clone());
        }

        let mut pipelines = if config.standard_pipelines {
            PipelineChain::standard(deps.tracer.clone())
        } else {
            PipelineChain::new()
        };
        for stage in &config.pipelines {
            pipelines.push_arc(stage.clone());
        }

        Self {
            deps,
            config,
            producer,
            pipelines,
            consumers: RwLock::new(Vec::new()),
            registry: RwLock::new(MessageRegistry::new()),
            hooks,
            running: AtomicBool::new(false),
        }
    }

    /// Register a hook called after every confirmed publish.
    pub fn on_produced<F>(&self, hook: F)
    where
        F: Fn(&ProducedMessage) + Send + Sync + 'static,
    {
        self.hooks.on_produced(hook);
    }

    /// Register a hook called after every delivery all handlers accepted.
    pub fn on_consumed<F>(&self, hook: F)
    where
        F: Fn(&ConsumedMessage) + Send + Sync + 'static,
    {
        self.hooks.on_consumed(hook);
    }

    /// Register `M` without publishing or consuming it.
    pub fn register<M: Message>(&self) {
        self.registry.write().register::<M>();
    }

    /// Run `f` against the table of message types this bus has seen.
    pub fn with_registry<T>(&self, f: impl FnOnce(&MessageRegistry) -> T) -> T {
        f(&self.registry.read())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn consumers(&self) -> Vec<Arc<dyn BusConsumer>> {
        self.consumers.read().clone()
    }

    /// The consumer this bus created for `M`, if any.
    pub fn consumer<M: Message>(&self) -> Option<Arc<RabbitMqConsumer<M>>> {
        find_consumer(&self.consumers.read())
    }

    pub fn connection(&self) -> &Arc<dyn BrokerConnection> {
        &self.deps.connection
    }

    fn new_consumer<M: Message>(&self) -> RabbitMqConsumer<M> {
        let options = self
            .config
            .consumers
            .get(M::MESSAGE_TYPE)
            .cloned()
            .unwrap_or_else(ConsumerOptions::for_message::<M>);

        RabbitMqConsumer::new(
            self.deps.connection.clone(),
            self.deps.serializer.clone(),
            self.deps.logger.clone(),
            options,
        )
        .with_pipelines(self.pipelines.clone())
        .with_hooks(self.hooks.clone())
    }

    async fn start_if_running(&self, consumer: &Arc<dyn BusConsumer>) -> Result<(), MessagingError> {
        if self.is_running() {
            ensure_consuming(consumer.as_ref()).await?;
        }
        Ok(())
    }
}

/// Start `consumer` unless it is already consuming. The check happens
/// under the consumer's own lock, so concurrent starts cannot both win.
async fn ensure_consuming(consumer: &dyn BusConsumer) -> Result<(), MessagingError> {
    match consumer.consume().await {
        Err(MessagingError::InvalidState(reason)) if consumer.state() == ConsumerState::Consuming => {
            debug!(queue = consumer.queue(), reason = %reason, "Consumer already started");
            Ok(())
        }
        result => result,
    }
}

fn find_consumer<M: Message>(consumers: &[Arc<dyn BusConsumer>]) -> Option<Arc<RabbitMqConsumer<M>>> {
    consumers
        .iter()
        .filter(|c| c.message_type() == M::MESSAGE_TYPE)
        .find_map(|c| c.clone().as_any_arc().downcast::<RabbitMqConsumer<M>>().ok())
}

#[async_trait]
impl Producer for RabbitMqBus {
    async fn publish_message_with_topic_name<M: Message>(
        &self,
        message: &M,
        metadata: Option<Metadata>,
        topic_name: Option<&str>,
    ) -> Result<(), MessagingError> {
        if !self.registry.read().contains(M::MESSAGE_TYPE) {
            self.registry.write().register::<M>();
        }
        self.producer
            .publish_message_with_topic_name(message, metadata, topic_name)
            .await
    }
}

#[async_trait]
impl ConsumerConnector for RabbitMqBus {
    async fn connect_consumer(&self, consumer: Arc<dyn BusConsumer>) -> Result<(), MessagingError> {
        self.deps.logger.in_scope(|| {
            debug!(
                message_type = consumer.message_type(),
                queue = consumer.queue(),
                "Connecting consumer"
            )
        });
        self.consumers.write().push(consumer.clone());
        self.start_if_running(&consumer).await
    }

    async fn connect_consumer_handler<M, H>(&self, handler: H) -> Result<(), MessagingError>
    where
        M: Message,
        H: ConsumerHandler<M> + 'static,
    {
        self.registry.write().register::<M>();

        let created = {
            let mut consumers = self.consumers.write();
            match find_consumer::<M>(&consumers) {
                Some(existing) => {
                    existing.connect_handler(handler);
                    None
                }
                None => {
                    let consumer: Arc<dyn BusConsumer> =
                        Arc::new(self.new_consumer::<M>().with_handler(handler));
                    consumers.push(consumer.clone());
                    Some(consumer)
                }
            }
        };

        match created {
            Some(consumer) => self.start_if_running(&consumer).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BusControl for RabbitMqBus {
    async fn start(&self) -> Result<(), MessagingError> {
        self.running.store(true, Ordering::SeqCst);
        let consumers = self.consumers();

        self.deps
            .logger
            .instrument(async {
                info!(consumers = consumers.len(), "Starting bus");
                for consumer in &consumers {
                    if let Err(e) = ensure_consuming(consumer.as_ref()).await {
                        error!(
                            message_type = consumer.message_type(),
                            queue = consumer.queue(),
                            error = %e,
                            "Failed to start consumer"
                        );
                        return Err(e);
                    }
                }
                Ok(())
            })
            .await
    }

    async fn stop(&self, drain_timeout: Duration) -> Result<(), MessagingError> {
        self.running.store(false, Ordering::SeqCst);
        let consumers = self.consumers();

        self.deps
            .logger
            .instrument(async {
                info!(consumers = consumers.len(), "Stopping bus");
                let results =
                    join_all(consumers.iter().map(|c| c.unconsume(drain_timeout))).await;

                let mut first_error = None;
                for (consumer, result) in consumers.iter().zip(results) {
                    if let Err(e) = result {
                        error!(
                            queue = consumer.queue(),
                            error = %e,
                            "Consumer did not stop cleanly"
                        );
                        first_error.get_or_insert(e);
                    }
                }

                match first_error {
                    Some(e) => Err(e),
                    None => {
                        info!("Bus stopped");
                        Ok(())
                    }
                }
            })
            .await
    }
}
