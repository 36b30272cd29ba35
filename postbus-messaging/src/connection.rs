//! RabbitMQ implementation of the broker traits over `lapin`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, options::*,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{BindingOptions, ExchangeKind, ExchangeOptions, QueueOptions, RabbitMqConfig};
use crate::error::MessagingError;
use crate::metadata::Metadata;
use crate::traits::{
    BrokerChannel, BrokerConnection, DeliveryStream, IncomingDelivery, MessageProperties,
    PublishConfirmation,
};

/// Connection to a RabbitMQ broker.
pub struct AmqpConnection {
    config: RabbitMqConfig,
    connection: Connection,
    closed: Arc<watch::Sender<bool>>,
}

impl AmqpConnection {
    /// Connect to RabbitMQ. A config without URL or host fails before any I/O.
    pub async fn connect(config: &RabbitMqConfig) -> Result<Arc<Self>, MessagingError> {
        let uri = config.amqp_uri()?;

        let mut properties = ConnectionProperties::default();
        if let Some(ref name) = config.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        info!(host = %config.host, vhost = %config.vhost, "Connecting to RabbitMQ");

        let connection =
            tokio::time::timeout(config.connection_timeout, Connection::connect(&uri, properties))
                .await
                .map_err(|_| {
                    MessagingError::Timeout(format!(
                        "connecting to RabbitMQ took longer than {:?}",
                        config.connection_timeout
                    ))
                })??;

        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let notifier = closed.clone();
        connection.on_error(move |err| {
            error!(error = %err, "RabbitMQ connection lost");
            notifier.send_replace(true);
        });

        info!("Connected to RabbitMQ successfully");

        Ok(Arc::new(Self {
            config: config.clone(),
            connection,
            closed,
        }))
    }

    pub fn config(&self) -> &RabbitMqConfig {
        &self.config
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_closed(&self) -> bool {
        *self.closed.borrow() || !self.connection.status().connected()
    }

    async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, MessagingError> {
        if self.is_closed() {
            return Err(MessagingError::Connection(
                "RabbitMQ connection is closed".to_string(),
            ));
        }
        let channel = self.connection.create_channel().await?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<(), MessagingError> {
        info!("Closing RabbitMQ connection");
        self.closed.send_replace(true);
        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))
    }

    fn notify_close(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    async fn reconnect(&self) -> Result<Arc<dyn BrokerConnection>, MessagingError> {
        warn!("Reconnecting to RabbitMQ");
        let connection: Arc<dyn BrokerConnection> = Self::connect(&self.config).await?;
        Ok(connection)
    }
}

/// One lapin channel.
pub struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<(), MessagingError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn declare_exchange(&self, options: &ExchangeOptions) -> Result<(), MessagingError> {
        let kind = match options.kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        self.channel
            .exchange_declare(
                &options.name,
                kind,
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                field_table(&options.arguments),
            )
            .await
            .map_err(|e| MessagingError::Declare(format!("exchange {}: {}", options.name, e)))?;
        debug!(exchange = %options.name, "Exchange declared");
        Ok(())
    }

    async fn declare_queue(&self, options: &QueueOptions) -> Result<(), MessagingError> {
        self.channel
            .queue_declare(
                &options.name,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    exclusive: options.exclusive,
                    ..Default::default()
                },
                field_table(&options.arguments),
            )
            .await
            .map_err(|e| MessagingError::Declare(format!("queue {}: {}", options.name, e)))?;
        debug!(queue = %options.name, "Queue declared");
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding: &BindingOptions,
    ) -> Result<(), MessagingError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                field_table(&binding.arguments),
            )
            .await
            .map_err(|e| MessagingError::Declare(format!("binding {}: {}", queue, e)))?;
        debug!(
            queue = queue,
            exchange = exchange,
            routing_key = %binding.routing_key,
            "Queue bound to exchange"
        );
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), MessagingError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<PublishConfirmation, MessagingError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    ..Default::default()
                },
                body,
                basic_properties(properties),
            )
            .await
            .map_err(|e| MessagingError::Publish(e.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|e| MessagingError::Confirm(e.to_string()))?;

        Ok(match confirmation {
            Confirmation::Ack(None) => PublishConfirmation::Ack,
            Confirmation::Ack(Some(_)) => PublishConfirmation::Returned,
            Confirmation::Nack(_) => PublishConfirmation::Nack,
            Confirmation::NotRequested => PublishConfirmation::NotRequested,
        })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, MessagingError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(incoming_delivery)
                    .map_err(MessagingError::from)
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| MessagingError::Acknowledge(e.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| MessagingError::Acknowledge(e.to_string()))
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.channel.close(200, "Normal shutdown").await?;
        Ok(())
    }
}

fn field_table(values: &HashMap<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in values {
        table.insert(key.clone().into(), amqp_value(value));
    }
    table
}

fn metadata_table(metadata: &Metadata) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in metadata.iter() {
        table.insert(key.clone().into(), amqp_value(value));
    }
    table
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::String(s) => AMQPValue::LongString(s.clone().into()),
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::Null => AMQPValue::Void,
        other => AMQPValue::LongString(other.to_string().into()),
    }
}

fn json_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::LongString(s) => Value::String(s.to_string()),
        AMQPValue::ShortString(s) => Value::String(s.to_string()),
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => Value::from(*i),
        AMQPValue::ShortShortUInt(i) => Value::from(*i),
        AMQPValue::ShortInt(i) => Value::from(*i),
        AMQPValue::ShortUInt(i) => Value::from(*i),
        AMQPValue::LongInt(i) => Value::from(*i),
        AMQPValue::LongUInt(i) => Value::from(*i),
        AMQPValue::LongLongInt(i) => Value::from(*i),
        AMQPValue::Float(f) => Value::from(*f),
        AMQPValue::Double(f) => Value::from(*f),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::Void => Value::Null,
        other => Value::String(format!("{:?}", other)),
    }
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut props = BasicProperties::default();

    if let Some(ref id) = properties.message_id {
        props = props.with_message_id(id.clone().into());
    }
    if let Some(ref id) = properties.correlation_id {
        props = props.with_correlation_id(id.clone().into());
    }
    if let Some(ts) = properties.timestamp {
        props = props.with_timestamp(ts);
    }
    if let Some(ref kind) = properties.kind {
        props = props.with_type(kind.clone().into());
    }
    if let Some(ref content_type) = properties.content_type {
        props = props.with_content_type(content_type.clone().into());
    }
    if let Some(ref encoding) = properties.content_encoding {
        props = props.with_content_encoding(encoding.clone().into());
    }
    if let Some(mode) = properties.delivery_mode {
        props = props.with_delivery_mode(mode);
    }
    if let Some(ref expiration) = properties.expiration {
        props = props.with_expiration(expiration.clone().into());
    }
    if let Some(ref app_id) = properties.app_id {
        props = props.with_app_id(app_id.clone().into());
    }
    if let Some(priority) = properties.priority {
        props = props.with_priority(priority);
    }
    if let Some(ref reply_to) = properties.reply_to {
        props = props.with_reply_to(reply_to.clone().into());
    }
    if !properties.headers.is_empty() {
        props = props.with_headers(metadata_table(&properties.headers));
    }

    props
}

fn incoming_delivery(delivery: lapin::message::Delivery) -> IncomingDelivery {
    let props = &delivery.properties;

    let headers: Metadata = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.to_string(), json_value(value)))
                .collect()
        })
        .unwrap_or_default();

    let properties = MessageProperties {
        message_id: props.message_id().as_ref().map(|s| s.to_string()),
        correlation_id: props.correlation_id().as_ref().map(|s| s.to_string()),
        timestamp: *props.timestamp(),
        kind: props.kind().as_ref().map(|s| s.to_string()),
        content_type: props.content_type().as_ref().map(|s| s.to_string()),
        content_encoding: props.content_encoding().as_ref().map(|s| s.to_string()),
        delivery_mode: *props.delivery_mode(),
        expiration: props.expiration().as_ref().map(|s| s.to_string()),
        app_id: props.app_id().as_ref().map(|s| s.to_string()),
        priority: *props.priority(),
        reply_to: props.reply_to().as_ref().map(|s| s.to_string()),
        headers,
    };

    IncomingDelivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties,
        body: delivery.data,
    }
}
