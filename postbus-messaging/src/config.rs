//! Broker connection and topology configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MessagingError;
use crate::message::Message;
use crate::naming::MessageTopology;
use crate::retry::RetryPolicy;

/// Prefetch count used when none is configured.
pub const DEFAULT_PREFETCH_COUNT: u16 = 4;

/// RabbitMQ connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RabbitMqConfig {
    /// Full AMQP URL; takes precedence over the individual fields
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub username: String,
    #[serde(default = "default_user")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Name shown in the broker management UI
    #[serde(default)]
    pub connection_name: Option<String>,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: Duration,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5672
}

fn default_user() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for RabbitMqConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_host(),
            port: default_port(),
            username: default_user(),
            password: default_user(),
            vhost: default_vhost(),
            connection_name: None,
            connection_timeout: default_connection_timeout(),
        }
    }
}

impl RabbitMqConfig {
    /// Create a configuration from a full AMQP URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Create a configuration for a host with default credentials
    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Load from `POSTBUS_RABBITMQ_*` variables, reading `.env` when present.
    pub fn from_env() -> Result<Self, MessagingError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, MessagingError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("POSTBUS_RABBITMQ_URL") {
            config.url = Some(url);
        }
        if let Some(host) = lookup("POSTBUS_RABBITMQ_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("POSTBUS_RABBITMQ_PORT") {
            config.port = port.parse().map_err(|_| {
                MessagingError::Configuration(format!("invalid POSTBUS_RABBITMQ_PORT: {}", port))
            })?;
        }
        if let Some(user) = lookup("POSTBUS_RABBITMQ_USER") {
            config.username = user;
        }
        if let Some(password) = lookup("POSTBUS_RABBITMQ_PASSWORD") {
            config.password = password;
        }
        if let Some(vhost) = lookup("POSTBUS_RABBITMQ_VHOST") {
            config.vhost = vhost;
        }
        if let Some(name) = lookup("POSTBUS_RABBITMQ_CONNECTION_NAME") {
            config.connection_name = Some(name);
        }
        if let Some(secs) = lookup("POSTBUS_RABBITMQ_CONNECTION_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                MessagingError::Configuration(format!(
                    "invalid POSTBUS_RABBITMQ_CONNECTION_TIMEOUT_SECS: {}",
                    secs
                ))
            })?;
            config.connection_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Set credentials
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set the virtual host
    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    /// Set the connection name
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    /// Set the connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// The AMQP URI to dial. Fails when neither a URL nor a host is set.
    pub fn amqp_uri(&self) -> Result<String, MessagingError> {
        if let Some(url) = self.url.as_deref().filter(|u| !u.trim().is_empty()) {
            return Ok(url.to_string());
        }
        if self.host.trim().is_empty() {
            return Err(MessagingError::Configuration(
                "RabbitMQ host options are missing".to_string(),
            ));
        }
        let vhost = if self.vhost == "/" {
            "%2f".to_string()
        } else {
            self.vhost.trim_start_matches('/').to_string()
        };
        Ok(format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, vhost
        ))
    }
}

/// AMQP exchange kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    #[default]
    Topic,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

/// Exchange declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOptions {
    pub name: String,
    #[serde(default)]
    pub kind: ExchangeKind,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub arguments: HashMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl ExchangeOptions {
    /// Durable topic exchange
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::default(),
            durable: true,
            auto_delete: false,
            arguments: HashMap::new(),
        }
    }

    pub fn with_kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Queue declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub name: String,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub arguments: HashMap<String, serde_json::Value>,
}

impl QueueOptions {
    /// Durable, shared queue
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            arguments: HashMap::new(),
        }
    }

    /// Route rejected messages to a dead-letter exchange
    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.arguments.insert(
            "x-dead-letter-exchange".to_string(),
            serde_json::Value::String(exchange.into()),
        );
        self
    }
}

/// Queue-to-exchange binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingOptions {
    pub routing_key: String,
    #[serde(default)]
    pub arguments: HashMap<String, serde_json::Value>,
}

impl BindingOptions {
    pub fn new(routing_key: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            arguments: HashMap::new(),
        }
    }
}

/// Consumer settings, fixed once the consumer is built.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub exchange: ExchangeOptions,
    pub queue: QueueOptions,
    pub binding: BindingOptions,
    /// Broker-side limit of unacknowledged deliveries on the channel
    pub prefetch_count: u16,
    /// Extra cap on concurrent handler executions, below the prefetch count
    pub concurrency_limit: Option<usize>,
    /// Let the broker settle deliveries on send
    pub auto_ack: bool,
    /// Consumer tag
    pub consumer_id: String,
    /// Stop consuming after a delivery exhausts its retries
    pub exit_on_error: bool,
    pub retry: RetryPolicy,
}

impl ConsumerOptions {
    /// Defaults derived from `M`'s type name.
    pub fn for_message<M: Message>() -> Self {
        Self::for_topology(&MessageTopology::of::<M>())
    }

    pub fn for_topology(topology: &MessageTopology) -> Self {
        Self {
            exchange: ExchangeOptions::new(&topology.exchange),
            queue: QueueOptions::new(&topology.queue),
            binding: BindingOptions::new(&topology.routing_key),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            concurrency_limit: None,
            auto_ack: false,
            consumer_id: format!("{}_{}", topology.name, Uuid::new_v4().simple()),
            exit_on_error: false,
            retry: RetryPolicy::default(),
        }
    }

    /// Number of deliveries handled at the same time.
    pub fn effective_concurrency(&self) -> usize {
        let prefetch = self.prefetch_count as usize;
        match self.concurrency_limit {
            Some(limit) => limit.min(prefetch),
            None => prefetch,
        }
    }

    pub fn validate(&self) -> Result<(), MessagingError> {
        if self.prefetch_count == 0 {
            return Err(MessagingError::Configuration(
                "prefetch count must be greater than zero".to_string(),
            ));
        }
        if self.concurrency_limit == Some(0) {
            return Err(MessagingError::Configuration(
                "concurrency limit must be greater than zero".to_string(),
            ));
        }
        if self.queue.name.is_empty() {
            return Err(MessagingError::Configuration(
                "queue name must not be empty".to_string(),
            ));
        }
        if self.exchange.name.is_empty() {
            return Err(MessagingError::Configuration(
                "exchange name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// AMQP delivery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Transient,
    #[default]
    Persistent,
}

impl DeliveryMode {
    pub fn as_u8(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// Publish settings for one message type.
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub exchange: ExchangeOptions,
    pub routing_key: String,
    pub delivery_mode: DeliveryMode,
    /// Per-message TTL in milliseconds, as AMQP expects it
    pub expiration: Option<String>,
    pub app_id: Option<String>,
    pub priority: Option<u8>,
    pub reply_to: Option<String>,
    pub content_encoding: Option<String>,
    /// Unroutable messages are returned and the publish fails
    pub mandatory: bool,
}

impl ProducerOptions {
    /// Defaults derived from `M`'s type name.
    pub fn for_message<M: Message>() -> Self {
        Self::for_topology(&MessageTopology::of::<M>())
    }

    pub fn for_topology(topology: &MessageTopology) -> Self {
        Self {
            exchange: ExchangeOptions::new(&topology.exchange),
            routing_key: topology.routing_key.clone(),
            delivery_mode: DeliveryMode::default(),
            expiration: None,
            app_id: None,
            priority: None,
            reply_to: None,
            content_encoding: None,
            mandatory: true,
        }
    }
}
