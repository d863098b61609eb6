//! logbus-monitor: live log monitor
//!
//! Subscribes to the log topic and serves every line received so far.
//!
//! ## Architecture
//! ```text
//! [broker topic] --> Subscriber --> ingest --> LogAggregator
//!                                                   |
//!                                         GET / ----+
//! ```
//!
//! ## Configuration
//! - RABBITMQ_ADDR: broker URL (default: amqp://localhost:5672)
//! - LOGBUS__MONITOR__PORT: read endpoint port (default: 8087)
//! - LOGBUS__MONITOR__QUEUE: durable queue name (default: exclusive queue)
//! - LOGBUS__MONITOR__RECONNECT: reopen the subscription when it ends (default: false)

use tracing::{error, info};

use logbus::bus::{AmqpConnector, Subscriber, SubscriberConfig};
use logbus::config::{BrokerConfig, Config, MonitorConfig};
use logbus::monitor::{ingest, rest, LogAggregator};
use logbus::utils::bootstrap::init_tracing;
use logbus::utils::retry::reconnect_backoff;

fn subscriber_config(broker: &BrokerConfig, monitor: &MonitorConfig) -> SubscriberConfig {
    let config = match &monitor.queue {
        Some(queue) => SubscriberConfig::named(&broker.topic, queue),
        None => SubscriberConfig::exclusive(&broker.topic),
    };
    config.with_routing_pattern(&monitor.routing_pattern)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config = Config::load(None)?;
    let broker = config.broker;
    let subscription = subscriber_config(&broker, &config.monitor);
    let aggregator = LogAggregator::new();

    let messages = Subscriber::connect(&AmqpConnector, &broker, &subscription)
        .await?
        .into_stream()
        .await?;
    info!(
        topic = %broker.topic,
        queue = %messages.queue_name(),
        "logbus-monitor subscribed"
    );

    let sink = aggregator.clone();
    if config.monitor.reconnect {
        tokio::spawn(async move {
            let mut first = Some(messages);
            let open = move || {
                let first = first.take();
                let broker = broker.clone();
                let subscription = subscription.clone();
                async move {
                    match first {
                        Some(messages) => Ok(messages),
                        None => {
                            Subscriber::connect(&AmqpConnector, &broker, &subscription)
                                .await?
                                .into_stream()
                                .await
                        }
                    }
                }
            };
            ingest::run_with_reconnect(open, sink, reconnect_backoff()).await;
        });
    } else {
        tokio::spawn(async move {
            let ingested = ingest::run(messages, sink).await;
            error!(ingested, "Subscription ended; no further lines will be received");
        });
    }

    rest::serve(aggregator, config.monitor.port).await
}
