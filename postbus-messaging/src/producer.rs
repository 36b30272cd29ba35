//! Publisher-confirmed message producer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;
use opentelemetry::global::{BoxedSpan, BoxedTracer};
use opentelemetry::trace::{Span, SpanKind, Tracer};
use postbus_log::Logger;
use postbus_telemetry::attributes::{
    MESSAGING_DESTINATION_KIND, MESSAGING_DESTINATION_NAME, MESSAGING_MESSAGE_BODY_SIZE,
    MESSAGING_OPERATION, MESSAGING_RABBITMQ_ROUTING_KEY, message_attributes,
};
use postbus_telemetry::{TraceIds, extract_context, finish_span};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::{ExchangeOptions, ProducerOptions};
use crate::error::MessagingError;
use crate::hooks::{Hooks, ProducedMessage};
use crate::message::Message;
use crate::metadata::{Metadata, keys};
use crate::naming::MessageTopology;
use crate::serializer::{MessageSerializer, SerializerExt};
use crate::traits::{BrokerChannel, BrokerConnection, MessageProperties, PublishConfirmation};

/// Publishing side of the bus.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Publish to the exchange configured or derived for `M`.
    async fn publish_message<M: Message>(
        &self,
        message: &M,
        metadata: Option<Metadata>,
    ) -> Result<(), MessagingError> {
        self.publish_message_with_topic_name(message, metadata, None)
            .await
    }

    /// Publish, optionally overriding the exchange name.
    ///
    /// Returns only after the broker confirmed the message.
    async fn publish_message_with_topic_name<M: Message>(
        &self,
        message: &M,
        metadata: Option<Metadata>,
        topic_name: Option<&str>,
    ) -> Result<(), MessagingError>;
}

/// [`Producer`] over a [`BrokerConnection`].
///
/// Every publish opens its own channel, declares the exchange, enables
/// publisher confirms, publishes with `mandatory` and waits for the ack.
/// There is no retry at this layer.
pub struct RabbitMqProducer {
    connection: Arc<dyn BrokerConnection>,
    serializer: Arc<dyn MessageSerializer>,
    tracer: Arc<BoxedTracer>,
    logger: Logger,
    options: HashMap<String, ProducerOptions>,
    hooks: Arc<Hooks>,
}

impl RabbitMqProducer {
    pub fn new(
        connection: Arc<dyn BrokerConnection>,
        serializer: Arc<dyn MessageSerializer>,
        tracer: Arc<BoxedTracer>,
        logger: Logger,
    ) -> Self {
        Self {
            connection,
            serializer,
            tracer,
            logger,
            options: HashMap::new(),
            hooks: Arc::new(Hooks::new()),
        }
    }

    /// Share a hook registry.
    pub fn with_hooks(mut self, hooks: Arc<Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Override the publish settings of `M`.
    pub fn with_options<M: Message>(self, options: ProducerOptions) -> Self {
        self.with_type_options(M::MESSAGE_TYPE, options)
    }

    /// Override the publish settings of the type named `type_name`.
    pub fn with_type_options(mut self, type_name: impl Into<String>, options: ProducerOptions) -> Self {
        self.options.insert(type_name.into(), options);
        self
    }

    pub fn hooks(&self) -> &Arc<Hooks> {
        &self.hooks
    }

    fn options_for<M: Message>(&self) -> ProducerOptions {
        self.options
            .get(M::MESSAGE_TYPE)
            .cloned()
            .unwrap_or_else(ProducerOptions::for_message::<M>)
    }

    async fn publish_inner<M: Message>(
        &self,
        message: &M,
        mut metadata: Metadata,
        topic_name: Option<&str>,
    ) -> Result<(), MessagingError> {
        let options = self.options_for::<M>();
        let exchange = topic_name
            .filter(|t| !t.is_empty())
            .unwrap_or(&options.exchange.name)
            .to_string();
        let routing_key = options.routing_key.clone();

        normalize_metadata(message, &mut metadata, self.serializer.content_type());

        let parent = extract_context(&metadata.to_string_map());
        let mut attributes =
            message_attributes(M::MESSAGE_TYPE, message.message_id(), metadata.correlation_id());
        attributes.push(KeyValue::new(MESSAGING_OPERATION, "publish"));
        attributes.push(KeyValue::new(MESSAGING_DESTINATION_NAME, exchange.clone()));
        attributes.push(KeyValue::new(
            MESSAGING_DESTINATION_KIND,
            options.exchange.kind.as_str(),
        ));
        attributes.push(KeyValue::new(
            MESSAGING_RABBITMQ_ROUTING_KEY,
            routing_key.clone(),
        ));

        let mut span = self.tracer.build_with_context(
            self.tracer
                .span_builder(format!("{} publish", exchange))
                .with_kind(SpanKind::Producer)
                .with_attributes(attributes),
            &parent,
        );

        if let Some(ids) = TraceIds::from_span_context(span.span_context()) {
            metadata.insert(keys::TRACE_ID, ids.trace_id);
            metadata.insert(keys::SPAN_ID, ids.span_id);
            metadata.insert(keys::TRACEPARENT, ids.traceparent);
        }

        let result = self
            .send(message, &metadata, &exchange, &routing_key, &options, &mut span)
            .await;
        finish_span(span, &result);

        match &result {
            Ok(()) => {
                debug!(
                    message_type = M::MESSAGE_TYPE,
                    message_id = message.message_id(),
                    exchange = %exchange,
                    routing_key = %routing_key,
                    "Message published"
                );
                self.hooks.fire_produced(&ProducedMessage {
                    message_type: M::MESSAGE_TYPE.to_string(),
                    message_id: message.message_id().to_string(),
                    correlation_id: metadata.correlation_id().unwrap_or_default().to_string(),
                    exchange,
                    routing_key,
                    metadata,
                });
            }
            Err(e) => {
                error!(
                    message_type = M::MESSAGE_TYPE,
                    message_id = message.message_id(),
                    exchange = %exchange,
                    error = %e,
                    "Failed to publish message"
                );
            }
        }

        result
    }

    async fn send<M: Message>(
        &self,
        message: &M,
        metadata: &Metadata,
        exchange: &str,
        routing_key: &str,
        options: &ProducerOptions,
        span: &mut BoxedSpan,
    ) -> Result<(), MessagingError> {
        if self.connection.is_closed() {
            return Err(MessagingError::Connection(
                "connection is closed".to_string(),
            ));
        }

        let channel = self.connection.channel().await?;
        let result = self
            .publish_on(
                channel.as_ref(),
                message,
                metadata,
                exchange,
                routing_key,
                options,
                span,
            )
            .await;

        if let Err(e) = channel.close().await {
            warn!(error = %e, "Failed to close producer channel");
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn publish_on<M: Message>(
        &self,
        channel: &dyn BrokerChannel,
        message: &M,
        metadata: &Metadata,
        exchange: &str,
        routing_key: &str,
        options: &ProducerOptions,
        span: &mut BoxedSpan,
    ) -> Result<(), MessagingError> {
        channel
            .declare_exchange(&ExchangeOptions {
                name: exchange.to_string(),
                ..options.exchange.clone()
            })
            .await?;
        channel.confirm_select().await?;

        let serialized = self.serializer.serialize(message)?;
        span.set_attribute(KeyValue::new(
            MESSAGING_MESSAGE_BODY_SIZE,
            serialized.body.len() as i64,
        ));

        let timestamp = metadata
            .created()
            .unwrap_or_else(Utc::now)
            .timestamp()
            .max(0) as u64;

        let properties = MessageProperties {
            message_id: metadata.message_id().map(str::to_string),
            correlation_id: metadata.correlation_id().map(str::to_string),
            timestamp: Some(timestamp),
            kind: Some(serialized.type_name),
            content_type: Some(serialized.content_type),
            content_encoding: options.content_encoding.clone(),
            delivery_mode: Some(options.delivery_mode.as_u8()),
            expiration: options.expiration.clone(),
            app_id: options.app_id.clone(),
            priority: options.priority,
            reply_to: options.reply_to.clone(),
            headers: metadata.clone(),
        };

        let confirmation = channel
            .publish(
                exchange,
                routing_key,
                options.mandatory,
                &serialized.body,
                &properties,
            )
            .await?;

        match confirmation {
            PublishConfirmation::Ack => Ok(()),
            PublishConfirmation::Nack => Err(MessagingError::Confirm(format!(
                "broker nacked message {}",
                message.message_id()
            ))),
            PublishConfirmation::Returned => Err(MessagingError::Publish(format!(
                "message {} is unroutable: no queue bound to exchange {} with routing key {}",
                message.message_id(),
                exchange,
                routing_key
            ))),
            PublishConfirmation::NotRequested => Err(MessagingError::Confirm(
                "channel is not in confirm mode".to_string(),
            )),
        }
    }
}

#[async_trait]
impl Producer for RabbitMqProducer {
    async fn publish_message_with_topic_name<M: Message>(
        &self,
        message: &M,
        metadata: Option<Metadata>,
        topic_name: Option<&str>,
    ) -> Result<(), MessagingError> {
        self.logger
            .instrument(self.publish_inner(message, metadata.unwrap_or_default(), topic_name))
            .await
    }
}

/// Fill the standard metadata entries the caller left out.
pub(crate) fn normalize_metadata<M: Message>(
    message: &M,
    metadata: &mut Metadata,
    content_type: &str,
) {
    metadata.set_if_absent(keys::MESSAGE_ID, message.message_id());
    if message.correlation_id().is_empty() {
        if metadata.correlation_id().is_none() {
            metadata.insert(keys::CORRELATION_ID, Uuid::new_v4().to_string());
        }
    } else {
        metadata.set_if_absent(keys::CORRELATION_ID, message.correlation_id());
    }
    if metadata.created().is_none() {
        metadata.set_created(Utc::now());
    }
    metadata.set_if_absent(keys::TYPE_NAME, M::MESSAGE_TYPE);
    metadata.set_if_absent(keys::NAME, MessageTopology::of::<M>().name);
    metadata.set_if_absent(keys::CONTENT_TYPE, content_type);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBase;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct UserRegistered {
        #[serde(flatten)]
        base: MessageBase,
    }

    crate::impl_message!(UserRegistered);

    #[test]
    fn test_normalize_fills_missing_entries() {
        let message = UserRegistered::default();
        let mut metadata = Metadata::new();
        normalize_metadata(&message, &mut metadata, "application/json");

        assert_eq!(metadata.message_id(), Some(message.message_id()));
        assert!(metadata.correlation_id().is_some());
        assert!(metadata.created().is_some());
        assert_eq!(metadata.type_name(), Some("UserRegistered"));
        assert_eq!(metadata.name(), Some("user_registered"));
        assert_eq!(metadata.content_type(), Some("application/json"));
    }

    #[test]
    fn test_normalize_keeps_caller_values() {
        let message = UserRegistered {
            base: MessageBase::correlated("from-message"),
        };
        let mut metadata = Metadata::new()
            .with(keys::CORRELATION_ID, "from-caller")
            .with(keys::CONTENT_TYPE, "application/vnd.custom+json")
            .with(keys::MESSAGE_ID, "caller-id");
        normalize_metadata(&message, &mut metadata, "application/json");

        assert_eq!(metadata.correlation_id(), Some("from-caller"));
        assert_eq!(metadata.content_type(), Some("application/vnd.custom+json"));
        assert_eq!(metadata.message_id(), Some("caller-id"));
    }

    #[test]
    fn test_normalize_uses_message_correlation_id() {
        let message = UserRegistered {
            base: MessageBase::correlated("from-message"),
        };
        let mut metadata = Metadata::new();
        normalize_metadata(&message, &mut metadata, "application/json");
        assert_eq!(metadata.correlation_id(), Some("from-message"));
    }
}
