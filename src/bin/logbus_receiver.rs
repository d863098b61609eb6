//! logbus-receiver: line receiver
//!
//! Accepts `POST /` lines from the emitter and appends them, with the sender's
//! address, to its log file. Optionally mirrors them onto the log topic
//! prefixed `RCV`.
//!
//! ## Configuration
//! - LOGBUS__RECEIVER__PORT: listen port (default: 8000)
//! - LOGBUS__RECEIVER__STARTUP_DELAY_MS: wait before listening (default: 2000)
//! - LOGBUS__RECEIVER__PUBLISH: mirror lines onto the bus (default: false)
//! - RABBITMQ_ADDR: broker URL, used when publishing

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use logbus::bus::{AmqpConnector, Publisher};
use logbus::config::Config;
use logbus::receiver::{self, ReceiverState};
use logbus::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config = Config::load(None)?;

    // Log file is opened before waiting on the broker or the startup delay.
    let mut state = ReceiverState::create(&config.receiver.log_path, None).await?;

    if config.receiver.publish {
        let publisher = Publisher::connect(&AmqpConnector, &config.broker).await?;
        state = state.with_publisher(Arc::new(publisher));
    }

    tokio::time::sleep(config.receiver.startup_delay()).await;

    let listener = TcpListener::bind(("0.0.0.0", config.receiver.port)).await?;
    info!(log = %config.receiver.log_path.display(), "logbus-receiver started");

    receiver::serve(listener, state).await
}
