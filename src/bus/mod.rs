//! Topic pub/sub bus.
//!
//! This module contains:
//! - `Connector`, `BrokerConnection`, `BrokerChannel` traits: the broker seam
//! - `Publisher` / `Subscriber`: topic-bound producer and consumer
//! - `connect`: connection establishment that waits for the broker
//! - Implementations: AMQP (RabbitMQ), in-process channel broker

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "channel")]
pub mod channel;
pub mod connect;
pub mod publisher;
pub mod subscriber;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
#[cfg(feature = "channel")]
pub use channel::ChannelBroker;
pub use connect::{connect, connect_backoff};
pub use publisher::Publisher;
pub use subscriber::{Subscriber, SubscriberConfig, Subscription};

/// Content type stamped on every published line.
pub const TEXT_PLAIN: &str = "text/plain";

/// Routing pattern that matches every routing key on a topic exchange.
pub const MATCH_ALL: &str = "#";

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel failed: {0}")]
    Channel(String),

    #[error("Declare failed: {0}")]
    Declare(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Publish timed out after {0:?}")]
    PublishTimeout(Duration),

    #[error("Channel or connection is closed")]
    Closed,
}

// ============================================================================
// Wire types
// ============================================================================

/// A delivered (or to-be-published) message.
///
/// Delivery metadata is carried only for logging; nothing is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Raw payload.
    pub body: Bytes,
    /// Routing key the publisher used.
    pub routing_key: String,
    /// Content type, `text/plain` for everything this crate publishes.
    pub content_type: Option<String>,
}

impl Message {
    /// Build a `text/plain` message.
    pub fn text(routing_key: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            body: Bytes::from(body.into()),
            routing_key: routing_key.into(),
            content_type: Some(TEXT_PLAIN.to_string()),
        }
    }

    /// Payload as text. Invalid UTF-8 is replaced, never rejected.
    pub fn as_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Lazy, unbounded sequence of deliveries. Ends when the channel closes.
pub type MessageStream = BoxStream<'static, Message>;

/// Topic exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
}

impl TopicSpec {
    /// Durable, non-auto-deleted topic exchange.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
        }
    }
}

/// How a subscriber's receiving queue is declared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum QueueMode {
    /// Server-named, exclusive to this subscriber, deleted when it disconnects.
    #[default]
    Exclusive,
    /// Named, shared and durable; survives subscriber restarts.
    Named(String),
}

/// Queue declaration derived from a `QueueMode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Empty name asks the broker to generate one.
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl From<&QueueMode> for QueueSpec {
    fn from(mode: &QueueMode) -> Self {
        match mode {
            QueueMode::Exclusive => Self {
                name: String::new(),
                durable: false,
                exclusive: true,
                auto_delete: true,
            },
            QueueMode::Named(name) => Self {
                name: name.clone(),
                durable: true,
                exclusive: false,
                auto_delete: false,
            },
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Dials a broker. One call, one attempt; retrying is the caller's business.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Box<dyn BrokerConnection>>;
}

/// Live session to the broker.
///
/// Implementations:
/// - `AmqpConnection`: RabbitMQ via `lapin`
/// - `ChannelConnection`: in-process topic broker
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a logical sub-channel on this connection.
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>>;

    /// Close the connection and every channel opened on it.
    async fn close(&self) -> Result<()>;
}

/// Logical channel: declarations, publishing and consuming.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a topic exchange. Succeeds silently when it already exists
    /// with identical settings; fails when the settings conflict.
    async fn declare_topic(&self, topic: &TopicSpec) -> Result<()>;

    /// Declare a queue and return its (possibly broker-generated) name.
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<String>;

    /// Bind a queue to a topic with a routing pattern.
    async fn bind_queue(&self, queue: &str, topic: &str, pattern: &str) -> Result<()>;

    /// Send one message to a topic.
    async fn publish(&self, topic: &str, message: Message) -> Result<()>;

    /// Start an auto-acknowledged consumer on a queue.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<MessageStream>;

    /// Close the channel. Its consumer streams end.
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// Routing
// ============================================================================

/// Check if a routing key matches a topic binding pattern.
///
/// Matching rules (AMQP topic exchange):
/// - Words are separated by `.`
/// - `*` matches exactly one word
/// - `#` matches zero or more words
/// - An empty pattern matches only an empty key
pub fn routing_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = if pattern.is_empty() {
        Vec::new()
    } else {
        pattern.split('.').collect()
    };
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) if word == "*" || word == head => words_match(rest, tail),
            _ => false,
        },
    }
}
