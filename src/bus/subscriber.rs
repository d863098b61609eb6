//! Topic subscriber.
//!
//! Declares the topic and a receiving queue, binds them with a routing
//! pattern, and hands out the broker's deliveries as a lazy stream.
//! Deliveries are auto-acknowledged: a message handed to us is gone from the
//! broker, whether or not we get around to processing it.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tracing::info;

use super::{
    connect, BrokerChannel, BrokerConnection, BusError, Connector, Message, MessageStream,
    QueueMode, QueueSpec, Result, TopicSpec, MATCH_ALL,
};
use crate::config::BrokerConfig;

/// Consumer tag prefix; a random suffix keeps tags unique per channel.
const CONSUMER_TAG_PREFIX: &str = "logbus";

/// Subscriber configuration.
#[derive(Clone, Debug)]
pub struct SubscriberConfig {
    /// Topic (exchange) to receive from.
    pub topic: String,
    /// Receiving queue declaration.
    pub queue: QueueMode,
    /// Binding pattern; `#` receives everything posted to the topic.
    pub routing_pattern: String,
}

impl SubscriberConfig {
    /// Exclusive, auto-deleted queue receiving everything on `topic`.
    pub fn exclusive(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            queue: QueueMode::Exclusive,
            routing_pattern: MATCH_ALL.to_string(),
        }
    }

    /// Named, durable, shared queue receiving everything on `topic`.
    pub fn named(topic: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            queue: QueueMode::Named(queue.into()),
            routing_pattern: MATCH_ALL.to_string(),
        }
    }

    /// Override the binding pattern.
    pub fn with_routing_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.routing_pattern = pattern.into();
        self
    }
}

/// Subscriber bound to a single topic through its own queue.
pub struct Subscriber {
    channel: Box<dyn BrokerChannel>,
    /// Set when this subscriber dialed the connection itself.
    connection: Option<Box<dyn BrokerConnection>>,
    topic: String,
    queue: String,
    consuming: bool,
}

impl Subscriber {
    /// Declare topic and queue on a fresh channel and bind them.
    ///
    /// Declaration failures are fatal to the caller; nothing is retried.
    pub async fn open(connection: &dyn BrokerConnection, config: &SubscriberConfig) -> Result<Self> {
        let channel = connection.open_channel().await?;
        channel
            .declare_topic(&TopicSpec::durable(&config.topic))
            .await?;
        let queue = channel
            .declare_queue(&QueueSpec::from(&config.queue))
            .await?;
        channel
            .bind_queue(&queue, &config.topic, &config.routing_pattern)
            .await?;

        info!(
            topic = %config.topic,
            queue = %queue,
            routing_pattern = %config.routing_pattern,
            "Subscriber bound"
        );

        Ok(Self {
            channel,
            connection: None,
            topic: config.topic.clone(),
            queue,
            consuming: false,
        })
    }

    /// Wait for the broker, then open a subscriber that owns its connection.
    pub async fn connect(
        connector: &dyn Connector,
        broker: &BrokerConfig,
        config: &SubscriberConfig,
    ) -> Result<Self> {
        let connection = connect(connector, &broker.url, broker.connect_backoff()).await;
        let subscriber = Self::open(connection.as_ref(), config).await?;
        Ok(Self {
            connection: Some(connection),
            ..subscriber
        })
    }

    /// Name of the bound queue (broker-generated for exclusive queues).
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Start consuming. The stream yields deliveries in broker order and ends
    /// when the channel or connection closes; it cannot be restarted.
    pub async fn messages(&mut self) -> Result<MessageStream> {
        if self.consuming {
            return Err(BusError::Subscribe(format!(
                "already consuming from '{}'",
                self.queue
            )));
        }
        let tag = format!("{}-{}", CONSUMER_TAG_PREFIX, uuid::Uuid::new_v4().simple());
        let stream = self.channel.consume(&self.queue, &tag).await?;
        self.consuming = true;
        info!(queue = %self.queue, consumer_tag = %tag, "Consuming");
        Ok(stream)
    }

    /// Start consuming and move the subscriber into the stream, so the channel
    /// stays open exactly as long as the stream is alive.
    pub async fn into_stream(mut self) -> Result<Subscription> {
        let messages = self.messages().await?;
        Ok(Subscription {
            subscriber: self,
            messages,
        })
    }

    /// Close the channel, then the connection if this subscriber owns it.
    pub async fn close(self) -> Result<()> {
        self.channel.close().await?;
        if let Some(connection) = self.connection {
            connection.close().await?;
        }
        info!(queue = %self.queue, "Subscriber closed");
        Ok(())
    }
}

/// A subscriber together with its delivery stream.
pub struct Subscription {
    subscriber: Subscriber,
    messages: MessageStream,
}

impl Subscription {
    pub fn queue_name(&self) -> &str {
        self.subscriber.queue_name()
    }

    /// Stop consuming and release the channel (and owned connection).
    pub async fn close(self) -> Result<()> {
        self.subscriber.close().await
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.messages.as_mut().poll_next(cx)
    }
}
