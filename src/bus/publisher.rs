//! Topic publisher.
//!
//! Binds to one topic, declares it durable, and sends `text/plain` lines onto
//! it with a bounded send timeout. Failed sends are reported, never retried.

use std::time::Duration;

use tracing::{debug, info};

use super::{
    connect, BrokerChannel, BrokerConnection, BusError, Connector, Message, QueueMode, QueueSpec,
    Result, TopicSpec, MATCH_ALL,
};
use crate::config::BrokerConfig;

/// Default bound on a single publish.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Publisher bound to a single topic.
pub struct Publisher {
    channel: Box<dyn BrokerChannel>,
    /// Set when this publisher dialed the connection itself.
    connection: Option<Box<dyn BrokerConnection>>,
    topic: String,
    routing_key: String,
    publish_timeout: Duration,
}

impl Publisher {
    /// Open a channel on `connection` and declare `topic`.
    ///
    /// Channel or declaration failures are returned as-is; they are not retried.
    pub async fn open(connection: &dyn BrokerConnection, topic: impl Into<String>) -> Result<Self> {
        let topic = topic.into();
        let channel = connection.open_channel().await?;
        channel.declare_topic(&TopicSpec::durable(&topic)).await?;

        info!(topic = %topic, "Publisher ready");

        Ok(Self {
            channel,
            connection: None,
            topic,
            routing_key: String::new(),
            publish_timeout: PUBLISH_TIMEOUT,
        })
    }

    /// Wait for the broker, then open a publisher that owns its connection.
    pub async fn connect(connector: &dyn Connector, config: &BrokerConfig) -> Result<Self> {
        let connection = connect(connector, &config.url, config.connect_backoff()).await;
        let publisher = Self::open(connection.as_ref(), &config.topic)
            .await?
            .with_routing_key(&config.routing_key)
            .with_publish_timeout(config.publish_timeout());
        Ok(Self {
            connection: Some(connection),
            ..publisher
        })
    }

    /// Routing key used by `publish`. Empty by default.
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Override the per-publish timeout.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Declare a queue bound to this publisher's topic with a match-all pattern.
    ///
    /// For setups that consume their own output. Returns the queue name.
    pub async fn declare_bound_queue(&self, mode: &QueueMode) -> Result<String> {
        let queue = self.channel.declare_queue(&QueueSpec::from(mode)).await?;
        self.channel
            .bind_queue(&queue, &self.topic, MATCH_ALL)
            .await?;
        Ok(queue)
    }

    /// Publish one line with the default routing key.
    pub async fn publish(&self, body: impl Into<String>) -> Result<()> {
        self.send(Message::text(self.routing_key.as_str(), body))
            .await
    }

    /// Publish one line with an explicit routing key.
    pub async fn publish_with_key(
        &self,
        routing_key: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<()> {
        self.send(Message::text(routing_key, body)).await
    }

    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %self.topic))]
    async fn send(&self, message: Message) -> Result<()> {
        let routing_key = message.routing_key.clone();
        match tokio::time::timeout(
            self.publish_timeout,
            self.channel.publish(&self.topic, message),
        )
        .await
        {
            Ok(result) => {
                result?;
                debug!(routing_key = %routing_key, "Published message");
                Ok(())
            }
            Err(_) => Err(BusError::PublishTimeout(self.publish_timeout)),
        }
    }

    /// Close the channel, then the connection if this publisher owns it.
    pub async fn close(self) -> Result<()> {
        self.channel.close().await?;
        if let Some(connection) = self.connection {
            connection.close().await?;
        }
        info!(topic = %self.topic, "Publisher closed");
        Ok(())
    }
}
