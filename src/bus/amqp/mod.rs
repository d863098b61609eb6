//! AMQP (RabbitMQ) broker backend.
//!
//! Thin adapter from the bus traits onto `lapin`. Topics are topic exchanges;
//! consumers run with `no_ack` so the broker forgets a message as soon as it
//! hands it over.

use async_trait::async_trait;
use futures::{future, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info, warn};

use super::{
    BrokerChannel, BrokerConnection, BusError, Connector, Message, MessageStream, QueueSpec,
    Result, TopicSpec, TEXT_PLAIN,
};

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ with `lapin`.
#[derive(Clone, Debug, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn BrokerConnection>> {
        let connection = Connection::connect(address, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(Box::new(AmqpConnection { connection }))
    }
}

/// Live AMQP connection.
pub struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BusError::Channel(format!("Failed to create channel: {}", e)))?;
        debug!(channel_id = channel.id(), "Opened AMQP channel");
        Ok(Box::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BusError::Connection(format!("Failed to close connection: {}", e)))
    }
}

/// AMQP channel.
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    fn to_message(delivery: Delivery) -> Message {
        Message {
            body: delivery.data.into(),
            routing_key: delivery.routing_key.as_str().to_string(),
            content_type: delivery
                .properties
                .content_type()
                .as_ref()
                .map(|ct| ct.as_str().to_string()),
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_topic(&self, topic: &TopicSpec) -> Result<()> {
        self.channel
            .exchange_declare(
                &topic.name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: topic.durable,
                    auto_delete: topic.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Declare(format!("Failed to declare exchange: {}", e)))?;

        info!(exchange = %topic.name, durable = topic.durable, "Declared topic exchange");
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<String> {
        let declared = self
            .channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Declare(format!("Failed to declare queue: {}", e)))?;

        Ok(declared.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, topic: &str, pattern: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                topic,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Declare(format!("Failed to bind queue: {}", e)))?;

        info!(queue = %queue, exchange = %topic, routing_key = %pattern, "Bound queue to exchange");
        Ok(())
    }

    async fn publish(&self, topic: &str, message: Message) -> Result<()> {
        let content_type = message.content_type.as_deref().unwrap_or(TEXT_PLAIN);
        let properties = BasicProperties::default().with_content_type(content_type.into());

        let confirm = self
            .channel
            .basic_publish(
                topic,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<MessageStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        let queue = queue.to_string();
        let stream = consumer
            .take_while(move |delivery| {
                if let Err(e) = delivery {
                    warn!(queue = %queue, error = %e, "Consumer delivery error, ending stream");
                }
                future::ready(delivery.is_ok())
            })
            .filter_map(|delivery| future::ready(delivery.ok().map(Self::to_message)));

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BusError::Channel(format!("Failed to close channel: {}", e)))
    }
}
