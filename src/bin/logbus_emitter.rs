//! logbus-emitter: progress line emitter
//!
//! Sends numbered, timestamped lines to the receiver, then STOP. Each line is
//! also mirrored onto the log topic prefixed `SND`.
//!
//! ## Configuration
//! - RECEIVER_HOST: receiver host name (default: service2)
//! - RABBITMQ_ADDR: broker URL (default: amqp://localhost:5672)
//! - LOGBUS__EMITTER__COUNT: number of lines (default: 20)
//! - LOGBUS__EMITTER__INTERVAL_MS: pause between lines (default: 2000)
//! - LOGBUS__EMITTER__PUBLISH: mirror lines onto the bus (default: true)

use std::time::Duration;

use tracing::{info, warn};

use logbus::bus::{AmqpConnector, Publisher};
use logbus::config::Config;
use logbus::emitter::{EmitLoop, HttpPeerClient};
use logbus::utils::bootstrap::init_tracing;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config = Config::load(None)?;

    let publisher = if config.emitter.publish {
        Some(Publisher::connect(&AmqpConnector, &config.broker).await?)
    } else {
        None
    };

    info!(
        peer = %config.emitter.peer,
        count = config.emitter.count,
        "logbus-emitter started"
    );

    let emitter = EmitLoop::new(config.emitter, HttpPeerClient::new(HTTP_TIMEOUT)?, publisher).await?;
    let (_, publisher) = emitter.run().await?;

    if let Some(publisher) = publisher {
        if let Err(e) = publisher.close().await {
            warn!(error = %e, "Failed to close publisher");
        }
    }
    Ok(())
}
