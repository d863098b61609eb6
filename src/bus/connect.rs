//! Broker connection establishment.
//!
//! The broker is a startup dependency: we wait for it instead of failing.

use std::time::Duration;

use backon::ConstantBuilder;
use tracing::info;

use super::{BrokerConnection, Connector};
use crate::utils::retry::{fixed_backoff, retry_until_ok};

/// Delay between connection attempts.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Standard connect policy: fixed delay, unlimited attempts.
pub fn connect_backoff() -> ConstantBuilder {
    fixed_backoff(CONNECT_RETRY_DELAY)
}

/// Connect to the broker, retrying forever with `backoff` between attempts.
///
/// Each failed attempt is logged as a warning. Only the first successful
/// connection is returned; failed attempts leave nothing behind.
pub async fn connect(
    connector: &dyn Connector,
    address: &str,
    backoff: ConstantBuilder,
) -> Box<dyn BrokerConnection> {
    let connection = retry_until_ok("broker connect", backoff, || connector.connect(address)).await;
    info!(address = %redact(address), "Connected to broker");
    connection
}

/// Strip credentials from an AMQP URL before logging it.
fn redact(address: &str) -> String {
    match (address.find("://"), address.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***@{}", &address[..scheme], &address[at + 1..])
        }
        _ => address.to_string(),
    }
}
