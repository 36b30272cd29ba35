//! In-memory AMQP broker.
//!
//! Implements [`BrokerConnection`] and [`BrokerChannel`] with the parts of
//! AMQP 0-9-1 the bus relies on:
//! - direct, fanout and topic exchanges, plus the default exchange
//! - mandatory publishes returned when unroutable
//! - publisher confirms
//! - per-channel prefetch, ack, nack and requeue with `redelivered`
//! - consumer cancel, channel and connection close
//!
//! Everything the broker did is recorded for inspection.
//!
//! ## Example
//!
//! ```
//! use postbus_messaging::{BrokerChannel, BrokerConnection, ExchangeOptions, MessageProperties, PublishConfirmation};
//! use postbus_testing::InMemoryBroker;
//!
//! # tokio_test::block_on(async {
//! let broker = InMemoryBroker::new();
//! let channel = broker.connect().channel().await.unwrap();
//!
//! channel.declare_exchange(&ExchangeOptions::new("orders")).await.unwrap();
//! channel.confirm_select().await.unwrap();
//!
//! // Nothing is bound to the exchange yet
//! let confirmation = channel
//!     .publish("orders", "orders", true, b"{}", &MessageProperties::default())
//!     .await
//!     .unwrap();
//! assert_eq!(confirmation, PublishConfirmation::Returned);
//! assert_eq!(broker.published().len(), 1);
//! # });
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use postbus_messaging::{
    BindingOptions, BrokerChannel, BrokerConnection, DeliveryStream, ExchangeKind,
    ExchangeOptions, IncomingDelivery, MessageProperties, MessagingError, PublishConfirmation,
    QueueOptions,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// A publish as seen by the broker.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    /// Queues the message was routed to
    pub routed_to: Vec<String>,
    pub confirmation: PublishConfirmation,
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRecord {
    pub queue: String,
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub redelivered: bool,
}

/// How a consumer settled a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettlementRecord {
    pub queue: String,
    pub message_id: Option<String>,
    pub settlement: Settlement,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct ConsumerSlot {
    channel_id: u64,
    tag: String,
    no_ack: bool,
    sender: mpsc::UnboundedSender<IncomingDelivery>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct ChannelState {
    connection_id: u64,
    /// 0 means unlimited
    prefetch: u16,
    confirm: bool,
    next_tag: u64,
    unacked: HashMap<u64, Unacked>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    channels: HashMap<u64, ChannelState>,
    next_id: u64,
    nack_publishes: bool,
    published: Vec<PublishedMessage>,
    deliveries: Vec<DeliveryRecord>,
    settlements: Vec<SettlementRecord>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_mut(&mut self, id: u64) -> Result<&mut ChannelState, MessagingError> {
        match self.channels.get_mut(&id) {
            Some(channel) => Ok(channel),
            None => Err(MessagingError::ChannelClosed(format!(
                "channel {} is closed",
                id
            ))),
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, MessagingError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let kind = self.exchanges.get(exchange).ok_or_else(|| {
            MessagingError::NotFound(format!("no exchange '{}'", exchange))
        })?;

        let mut queues: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matches = match kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            };
            if matches && !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }
        Ok(queues)
    }

    fn enqueue(&mut self, queues: &[String], message: &StoredMessage) {
        for name in queues {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
            }
        }
    }

    fn dispatch_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    /// Push ready messages to consumers with free prefetch slots,
    /// round-robin.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get(queue_name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let start = queue.next_consumer % count;
            let chosen = (0..count).map(|i| (start + i) % count).find(|&i| {
                let slot = &queue.consumers[i];
                slot.no_ack
                    || self.channels.get(&slot.channel_id).is_some_and(|c| {
                        c.prefetch == 0 || c.unacked.len() < c.prefetch as usize
                    })
            });
            let Some(index) = chosen else {
                return;
            };

            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            queue.next_consumer = index + 1;
            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            let slot = &queue.consumers[index];
            let (channel_id, tag, no_ack, sender) = (
                slot.channel_id,
                slot.tag.clone(),
                slot.no_ack,
                slot.sender.clone(),
            );

            let Some(channel) = self.channels.get_mut(&channel_id) else {
                return;
            };
            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;

            let delivery = IncomingDelivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            if sender.send(delivery).is_err() {
                // Receiver is gone: drop the subscription and retry the message.
                if let Some(queue) = self.queues.get_mut(queue_name) {
                    queue.ready.push_front(message);
                    queue.consumers.retain(|s| !(s.channel_id == channel_id && s.tag == tag));
                }
                continue;
            }

            trace!(queue = queue_name, delivery_tag, "Delivered message");
            self.deliveries.push(DeliveryRecord {
                queue: queue_name.to_string(),
                consumer_tag: tag,
                delivery_tag,
                message_id: message.properties.message_id.clone(),
                redelivered: message.redelivered,
            });
            if !no_ack {
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        message,
                    },
                );
            }
        }
    }

    fn settle(
        &mut self,
        channel_id: u64,
        delivery_tag: u64,
        settlement: Settlement,
    ) -> Result<(), MessagingError> {
        let channel = self.channel_mut(channel_id)?;
        let Unacked { queue, mut message } =
            channel.unacked.remove(&delivery_tag).ok_or_else(|| {
                MessagingError::Acknowledge(format!("unknown delivery tag {}", delivery_tag))
            })?;

        self.settlements.push(SettlementRecord {
            queue: queue.clone(),
            message_id: message.properties.message_id.clone(),
            settlement,
        });

        if settlement == (Settlement::Nack { requeue: true }) {
            message.redelivered = true;
            if let Some(q) = self.queues.get_mut(&queue) {
                q.ready.push_front(message);
            }
        }

        self.dispatch_all();
        Ok(())
    }

    fn close_channel(&mut self, channel_id: u64) {
        let Some(mut channel) = self.channels.remove(&channel_id) else {
            return;
        };

        let mut unacked: Vec<(u64, Unacked)> = channel.unacked.drain().collect();
        unacked.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, Unacked { queue, mut message }) in unacked {
            message.redelivered = true;
            if let Some(q) = self.queues.get_mut(&queue) {
                q.ready.push_front(message);
            }
        }
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|s| s.channel_id != channel_id);
        }

        debug!(channel_id, "Channel closed");
        self.dispatch_all();
    }
}

/// `*` matches one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// Shared in-memory broker. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection to this broker.
    pub fn connect(&self) -> Arc<InMemoryConnection> {
        let id = self.state.lock().next_id();
        let (closed, _) = watch::channel(false);
        Arc::new(InMemoryConnection {
            broker: self.clone(),
            id,
            closed: Arc::new(closed),
        })
    }

    /// Make the broker nack every following publish.
    pub fn set_nack_publishes(&self, nack: bool) {
        self.state.lock().nack_publishes = nack;
    }

    /// Route a message without going through a channel, bypassing any
    /// serializer. Useful for malformed deliveries.
    pub fn inject(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<Vec<String>, MessagingError> {
        let mut state = self.state.lock();
        let queues = state.route(exchange, routing_key)?;
        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            properties,
            redelivered: false,
        };
        state.enqueue(&queues, &message);
        state.dispatch_all();
        Ok(queues)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    /// Messages waiting in `queue`, not yet delivered.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Messages of `queue` delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn deliveries_of(&self, queue: &str) -> Vec<DeliveryRecord> {
        self.state
            .lock()
            .deliveries
            .iter()
            .filter(|d| d.queue == queue)
            .cloned()
            .collect()
    }

    pub fn settlements_of(&self, queue: &str) -> Vec<SettlementRecord> {
        self.state
            .lock()
            .settlements
            .iter()
            .filter(|s| s.queue == queue)
            .cloned()
            .collect()
    }

    pub fn acked_count(&self, queue: &str) -> usize {
        self.settlements_of(queue)
            .iter()
            .filter(|s| s.settlement == Settlement::Ack)
            .count()
    }

    pub fn nacked_count(&self, queue: &str) -> usize {
        self.settlements_of(queue)
            .iter()
            .filter(|s| matches!(s.settlement, Settlement::Nack { .. }))
            .count()
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.state.lock().exchanges.contains_key(exchange)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Channels currently open, across all connections.
    pub fn open_channels(&self) -> usize {
        self.state.lock().channels.len()
    }
}

/// Connection to an [`InMemoryBroker`].
pub struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
    closed: Arc<watch::Sender<bool>>,
}

impl InMemoryConnection {
    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, MessagingError> {
        if self.is_closed() {
            return Err(MessagingError::Connection(
                "connection is closed".to_string(),
            ));
        }

        let mut state = self.broker.state.lock();
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                prefetch: 0,
                confirm: false,
                next_tag: 0,
                unacked: HashMap::new(),
            },
        );

        Ok(Arc::new(InMemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    async fn close(&self) -> Result<(), MessagingError> {
        let mut state = self.broker.state.lock();
        let channels: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == self.id)
            .map(|(id, _)| *id)
            .collect();
        for id in channels {
            state.close_channel(id);
        }
        drop(state);

        self.closed.send_replace(true);
        Ok(())
    }

    fn notify_close(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    async fn reconnect(&self) -> Result<Arc<dyn BrokerConnection>, MessagingError> {
        Ok(self.broker.connect())
    }
}

/// Channel of an [`InMemoryConnection`].
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<(), MessagingError> {
        let mut state = self.broker.state.lock();
        state.channel_mut(self.id)?.prefetch = prefetch_count;
        state.dispatch_all();
        Ok(())
    }

    async fn declare_exchange(&self, options: &ExchangeOptions) -> Result<(), MessagingError> {
        let mut state = self.broker.state.lock();
        state.channel_mut(self.id)?;
        match state.exchanges.get(&options.name) {
            Some(kind) if *kind != options.kind => Err(MessagingError::Declare(format!(
                "exchange '{}' already declared as {:?}",
                options.name, kind
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(options.name.clone(), options.kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, options: &QueueOptions) -> Result<(), MessagingError> {
        let mut state = self.broker.state.lock();
        state.channel_mut(self.id)?;
        state.queues.entry(options.name.clone()).or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding: &BindingOptions,
    ) -> Result<(), MessagingError> {
        let mut state = self.broker.state.lock();
        state.channel_mut(self.id)?;
        if !state.exchanges.contains_key(exchange) {
            return Err(MessagingError::Declare(format!("no exchange '{}'", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(MessagingError::Declare(format!("no queue '{}'", queue)));
        }

        let exists = state.bindings.iter().any(|b| {
            b.exchange == exchange && b.queue == queue && b.routing_key == binding.routing_key
        });
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                routing_key: binding.routing_key.clone(),
            });
        }
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), MessagingError> {
        let mut state = self.broker.state.lock();
        state.channel_mut(self.id)?.confirm = true;
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
        let mut state = self.broker.state.lock();
        let confirm = state.channel_mut(self.id)?.confirm;
        let queues = state.route(exchange, routing_key)?;

        let confirmation = if state.nack_publishes {
            PublishConfirmation::Nack
        } else if queues.is_empty() && mandatory {
            PublishConfirmation::Returned
        } else if confirm {
            PublishConfirmation::Ack
        } else {
            PublishConfirmation::NotRequested
        };

        let routed_to = if confirmation == PublishConfirmation::Nack {
            Vec::new()
        } else {
            queues
        };

        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties: properties.clone(),
            redelivered: false,
        };
        state.enqueue(&routed_to, &message);
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            mandatory,
            body: message.body,
            properties: message.properties,
            routed_to,
            confirmation,
        });
        state.dispatch_all();

        Ok(confirmation)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, MessagingError> {
        let mut state = self.broker.state.lock();
        state.channel_mut(self.id)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| MessagingError::NotFound(format!("no queue '{}'", queue)))?;
        q.consumers.push(ConsumerSlot {
            channel_id: self.id,
            tag: consumer_tag.to_string(),
            no_ack,
            sender,
        });
        state.dispatch(queue);

        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver
                .recv()
                .await
                .map(|delivery| (Ok(delivery), receiver))
        });
        Ok(Box::pin(stream))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError> {
        let mut state = self.broker.state.lock();
        state.channel_mut(self.id)?;
        let id = self.id;
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|s| !(s.channel_id == id && s.tag == consumer_tag));
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.broker
            .state
            .lock()
            .settle(self.id, delivery_tag, Settlement::Ack)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        self.broker
            .state
            .lock()
            .settle(self.id, delivery_tag, Settlement::Nack { requeue })
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.broker.state.lock().close_channel(self.id);
        Ok(())
    }
}
