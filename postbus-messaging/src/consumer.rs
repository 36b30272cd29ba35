//! Typed, prefetch-bounded queue consumer.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use opentelemetry::trace::TraceContextExt;
use parking_lot::{Mutex, RwLock};
use postbus_log::Logger;
use postbus_telemetry::extract_context;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerOptions;
use crate::context::{ConsumeContext, DeliveryInfo};
use crate::error::MessagingError;
use crate::handler::ConsumerHandler;
use crate::hooks::{ConsumedMessage, Hooks};
use crate::message::{DynMessage, Message};
use crate::pipeline::{HandlerFn, PipelineChain, PipelineFuture};
use crate::retry::{Retry, cancelled};
use crate::serializer::{MessageSerializer, SerializerExt};
use crate::traits::{BrokerChannel, BrokerConnection, DeliveryStream, IncomingDelivery};

/// Lifecycle of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Consuming,
    Draining,
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsumerState::Created => "created",
            ConsumerState::Consuming => "consuming",
            ConsumerState::Draining => "draining",
            ConsumerState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Type-erased consumer, as held by a bus.
#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// Type name of the messages consumed.
    fn message_type(&self) -> &'static str;

    fn queue(&self) -> &str;

    fn state(&self) -> ConsumerState;

    /// Subscribe to the queue and start the delivery loop.
    async fn consume(&self) -> Result<(), MessagingError>;

    /// Stop receiving and wait for in-flight deliveries.
    async fn unconsume(&self, drain_timeout: Duration) -> Result<(), MessagingError>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct Running {
    channel: Arc<dyn BrokerChannel>,
    semaphore: Arc<Semaphore>,
    capacity: u32,
    cancel: watch::Sender<bool>,
    loop_handle: JoinHandle<()>,
}

/// Consumer of one message type on one queue.
///
/// Owns its channel while consuming. Deliveries are handled concurrently
/// up to [`ConsumerOptions::effective_concurrency`]; every connected
/// handler runs through the pipeline chain with retry, then the delivery is
/// acked if all of them succeeded and nacked with requeue otherwise.
pub struct RabbitMqConsumer<M: Message> {
    connection: Arc<dyn BrokerConnection>,
    serializer: Arc<dyn MessageSerializer>,
    logger: Logger,
    options: Arc<ConsumerOptions>,
    pipelines: PipelineChain,
    handlers: Arc<RwLock<Vec<Arc<dyn ConsumerHandler<M>>>>>,
    hooks: Arc<Hooks>,
    state: Arc<Mutex<ConsumerState>>,
    running: Arc<tokio::sync::Mutex<Option<Running>>>,
}

impl<M: Message> RabbitMqConsumer<M> {
    pub fn new(
        connection: Arc<dyn BrokerConnection>,
        serializer: Arc<dyn MessageSerializer>,
        logger: Logger,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            connection,
            serializer,
            logger,
            options: Arc::new(options),
            pipelines: PipelineChain::new(),
            handlers: Arc::new(RwLock::new(Vec::new())),
            hooks: Arc::new(Hooks::new()),
            state: Arc::new(Mutex::new(ConsumerState::Created)),
            running: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    pub fn with_pipelines(mut self, pipelines: PipelineChain) -> Self {
        self.pipelines = pipelines;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_handler<H: ConsumerHandler<M> + 'static>(self, handler: H) -> Self {
        self.connect_handler(handler);
        self
    }

    /// Attach a handler. Takes effect for deliveries received afterwards,
    /// also while consuming.
    pub fn connect_handler<H: ConsumerHandler<M> + 'static>(&self, handler: H) {
        self.connect_handler_arc(Arc::new(handler));
    }

    pub fn connect_handler_arc(&self, handler: Arc<dyn ConsumerHandler<M>>) {
        self.handlers.write().push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    /// Subscribe to the queue and start the delivery loop.
    pub async fn consume(&self) -> Result<(), MessagingError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(MessagingError::InvalidState(format!(
                "consumer of {} is already consuming",
                self.options.queue.name
            )));
        }

        self.options.validate()?;
        if self.connection.is_closed() {
            return Err(MessagingError::Connection(
                "connection is closed".to_string(),
            ));
        }

        let channel = self.connection.channel().await?;
        let stream = match self.subscribe(channel.as_ref()).await {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(close_err) = channel.close().await {
                    warn!(error = %close_err, "Failed to close consumer channel");
                }
                return Err(e);
            }
        };

        let capacity = self.options.effective_concurrency();
        let semaphore = Arc::new(Semaphore::new(capacity));
        let (cancel, cancel_rx) = watch::channel(false);

        let worker = Arc::new(Worker {
            channel: channel.clone(),
            serializer: self.serializer.clone(),
            logger: self.logger.clone(),
            options: self.options.clone(),
            pipelines: self.pipelines.clone(),
            handlers: self.handlers.clone(),
            hooks: self.hooks.clone(),
            cancel: cancel_rx,
            state: self.state.clone(),
            running: self.running.clone(),
        });

        // The loop may only clear `running` after we release the lock below.
        let loop_handle = tokio::spawn(
            self.logger
                .instrument(worker.run(stream, semaphore.clone(), capacity as u32)),
        );

        *running = Some(Running {
            channel,
            semaphore,
            capacity: capacity as u32,
            cancel,
            loop_handle,
        });
        *self.state.lock() = ConsumerState::Consuming;

        self.logger.in_scope(|| {
            info!(
                message_type = M::MESSAGE_TYPE,
                queue = %self.options.queue.name,
                consumer_id = %self.options.consumer_id,
                concurrency = capacity,
                "Consumer started"
            )
        });

        Ok(())
    }

    async fn subscribe(&self, channel: &dyn BrokerChannel) -> Result<DeliveryStream, MessagingError> {
        let options = &self.options;
        channel.qos(options.prefetch_count).await?;
        channel.declare_exchange(&options.exchange).await?;
        channel.declare_queue(&options.queue).await?;
        channel
            .bind_queue(&options.queue.name, &options.exchange.name, &options.binding)
            .await?;
        channel
            .consume(&options.queue.name, &options.consumer_id, options.auto_ack)
            .await
    }

    /// Stop receiving, then wait up to `drain_timeout` for in-flight
    /// deliveries to finish. Stopping a consumer that is not consuming is
    /// a no-op.
    ///
    /// On timeout the remaining workers are cancelled, the channel is closed
    /// anyway and [`MessagingError::Timeout`] is returned.
    pub async fn unconsume(&self, drain_timeout: Duration) -> Result<(), MessagingError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        *self.state.lock() = ConsumerState::Draining;

        self.logger
            .instrument(self.drain(running, drain_timeout))
            .await
    }

    async fn drain(&self, running: Running, drain_timeout: Duration) -> Result<(), MessagingError> {
        let queue = &self.options.queue.name;
        debug!(queue = %queue, "Draining consumer");

        if let Err(e) = running.channel.cancel(&self.options.consumer_id).await {
            warn!(queue = %queue, error = %e, "Failed to cancel subscription");
        }

        let drained = tokio::time::timeout(
            drain_timeout,
            running.semaphore.acquire_many(running.capacity),
        )
        .await;

        if running.cancel.send(true).is_err() {
            debug!(queue = %queue, "Delivery loop already gone");
        }
        if let Err(e) = running.loop_handle.await {
            error!(queue = %queue, error = %e, "Delivery loop panicked");
        }
        if let Err(e) = running.channel.close().await {
            warn!(queue = %queue, error = %e, "Failed to close consumer channel");
        }
        *self.state.lock() = ConsumerState::Stopped;

        match drained {
            Ok(_) => {
                info!(queue = %queue, "Consumer stopped");
                Ok(())
            }
            Err(_) => {
                warn!(
                    queue = %queue,
                    timeout_ms = drain_timeout.as_millis() as u64,
                    "Consumer stopped before in-flight deliveries finished"
                );
                Err(MessagingError::Timeout(format!(
                    "consumer of {} did not drain within {:?}",
                    queue, drain_timeout
                )))
            }
        }
    }
}

#[async_trait]
impl<M: Message> BusConsumer for RabbitMqConsumer<M> {
    fn message_type(&self) -> &'static str {
        M::MESSAGE_TYPE
    }

    fn queue(&self) -> &str {
        &self.options.queue.name
    }

    fn state(&self) -> ConsumerState {
        RabbitMqConsumer::state(self)
    }

    async fn consume(&self) -> Result<(), MessagingError> {
        RabbitMqConsumer::consume(self).await
    }

    async fn unconsume(&self, drain_timeout: Duration) -> Result<(), MessagingError> {
        RabbitMqConsumer::unconsume(self, drain_timeout).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// State shared by the delivery loop and its per-delivery tasks.
struct Worker<M: Message> {
    channel: Arc<dyn BrokerChannel>,
    serializer: Arc<dyn MessageSerializer>,
    logger: Logger,
    options: Arc<ConsumerOptions>,
    pipelines: PipelineChain,
    handlers: Arc<RwLock<Vec<Arc<dyn ConsumerHandler<M>>>>>,
    hooks: Arc<Hooks>,
    cancel: watch::Receiver<bool>,
    state: Arc<Mutex<ConsumerState>>,
    running: Arc<tokio::sync::Mutex<Option<Running>>>,
}

impl<M: Message> Worker<M> {
    async fn run(
        self: Arc<Self>,
        mut stream: DeliveryStream,
        semaphore: Arc<Semaphore>,
        capacity: u32,
    ) {
        let mut cancel = self.cancel.clone();
        let queue = self.options.queue.name.clone();
        let mut stream_ended = false;

        loop {
            let delivery = tokio::select! {
                _ = cancelled(&mut cancel) => break,
                next = stream.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        error!(queue = %queue, error = %e, "Delivery stream error");
                        continue;
                    }
                    None => {
                        stream_ended = true;
                        break;
                    }
                },
            };

            // Acquire before spawning so in-flight work never exceeds capacity.
            let permit = tokio::select! {
                _ = cancelled(&mut cancel) => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker = self.clone();
            tokio::spawn(self.logger.instrument(async move {
                worker.process(delivery).await;
                drop(permit);
            }));
        }

        debug!(queue = %queue, "Delivery loop finished");

        if stream_ended {
            self.stop_after_stream_end(&semaphore, capacity).await;
        }
    }

    /// The broker ended the subscription without `unconsume` being called,
    /// e.g. after `exit_on_error` cancelled it. Wait for in-flight work,
    /// then release the channel and mark the consumer stopped so it can be
    /// consumed again.
    async fn stop_after_stream_end(&self, semaphore: &Semaphore, capacity: u32) {
        let queue = &self.options.queue.name;
        let mut cancel = self.cancel.clone();

        // An `unconsume` racing with us owns the shutdown from here.
        let _permits = tokio::select! {
            _ = cancelled(&mut cancel) => return,
            permits = semaphore.acquire_many(capacity) => match permits {
                Ok(permits) => permits,
                Err(_) => return,
            },
        };

        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        if let Err(e) = running.channel.close().await {
            warn!(queue = %queue, error = %e, "Failed to close consumer channel");
        }
        *self.state.lock() = ConsumerState::Stopped;
        info!(queue = %queue, "Consumer stopped after its subscription ended");
    }

    async fn process(&self, delivery: IncomingDelivery) {
        let delivery_tag = delivery.delivery_tag;
        let ctx = ConsumeContext::new(self.decode(&delivery), self.delivery_info(&delivery));

        let handlers = self.handlers.read().clone();
        if handlers.is_empty() {
            warn!(
                message_type = M::MESSAGE_TYPE,
                queue = %ctx.queue(),
                "No handler connected, acknowledging delivery"
            );
        }

        let retry = Retry::new(self.options.retry.clone());
        let mut cancel = self.cancel.clone();
        let mut succeeded = true;

        for handler in handlers {
            let result = retry
                .call(
                    || {
                        let handler = handler.clone();
                        let typed = ctx.clone();
                        let terminal: HandlerFn =
                            Arc::new(move |erased: ConsumeContext<dyn DynMessage>| {
                                let handler = handler.clone();
                                let typed = typed.with_info_of(&erased);
                                Box::pin(async move { handler.handle(&typed).await })
                                    as PipelineFuture
                            });
                        self.pipelines.execute(ctx.erase(), terminal)
                    },
                    &mut cancel,
                )
                .await;

            if let Err(e) = result {
                succeeded = false;
                let err = MessagingError::Handler {
                    attempts: e.attempts,
                    message: e.last_error.to_string(),
                };
                error!(
                    message_type = M::MESSAGE_TYPE,
                    message_id = ctx.message().message_id(),
                    delivery_tag,
                    cancelled = e.cancelled,
                    error = %err,
                    "Handler failed"
                );
            }
        }

        if !self.options.auto_ack {
            let outcome = if succeeded {
                self.channel.ack(delivery_tag).await
            } else {
                self.channel.nack(delivery_tag, true).await
            };
            if let Err(e) = outcome {
                error!(
                    delivery_tag,
                    acked = succeeded,
                    error = %e,
                    "Failed to settle delivery"
                );
            }
        }

        if succeeded {
            self.hooks.fire_consumed(&ConsumedMessage {
                message_type: M::MESSAGE_TYPE.to_string(),
                message_id: ctx.message().message_id().to_string(),
                correlation_id: ctx.message().correlation_id().to_string(),
                queue: ctx.queue().to_string(),
                delivery_tag,
                redelivered: ctx.redelivered(),
                metadata: ctx.metadata().clone(),
            });
        } else if self.options.exit_on_error {
            warn!(
                queue = %ctx.queue(),
                "Delivery exhausted its retries, stopping consumer"
            );
            if let Err(e) = self.channel.cancel(&self.options.consumer_id).await {
                error!(error = %e, "Failed to cancel subscription");
            }
        }
    }

    /// Decode the body, falling back to `M::default()` on any failure.
    fn decode(&self, delivery: &IncomingDelivery) -> M {
        let props = &delivery.properties;
        let headers = &props.headers;
        let type_name = props
            .kind
            .as_deref()
            .or_else(|| headers.type_name())
            .unwrap_or_default();
        let content_type = props
            .content_type
            .as_deref()
            .or_else(|| headers.content_type())
            .unwrap_or_default();

        let decoded = if delivery.body.is_empty() {
            Err(MessagingError::Deserialization("empty body".to_string()))
        } else if content_type.is_empty() {
            Err(MessagingError::Deserialization(
                "missing content type".to_string(),
            ))
        } else {
            self.serializer
                .deserialize::<M>(&delivery.body, type_name, content_type)
        };

        let mut message = decoded.unwrap_or_else(|e| {
            warn!(
                message_type = M::MESSAGE_TYPE,
                delivery_tag = delivery.delivery_tag,
                error = %e,
                "Could not decode delivery, handling default message"
            );
            M::default()
        });

        if message.correlation_id().is_empty() {
            let correlation_id = props
                .correlation_id
                .as_deref()
                .or_else(|| headers.correlation_id());
            if let Some(correlation_id) = correlation_id {
                message.base_mut().set_correlation_id(correlation_id);
            }
        }

        message
    }

    fn delivery_info(&self, delivery: &IncomingDelivery) -> DeliveryInfo {
        let props = &delivery.properties;
        let metadata = props.headers.clone();
        let parent = extract_context(&metadata.to_string_map());

        DeliveryInfo {
            content_type: props
                .content_type
                .clone()
                .or_else(|| metadata.content_type().map(str::to_string))
                .unwrap_or_default(),
            created_at: metadata.created().or_else(|| {
                props
                    .timestamp
                    .and_then(|ts| DateTime::<Utc>::from_timestamp(ts as i64, 0))
            }),
            span_context: parent.span().span_context().clone(),
            metadata,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            queue: self.options.queue.name.clone(),
            delivered_at: Utc::now(),
        }
    }
}
