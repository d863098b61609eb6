//! Ingest loop: subscriber deliveries into the aggregator.

use std::future::Future;
use std::time::Duration;

use backon::BackoffBuilder;
use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use super::LogAggregator;
use crate::bus::{Message, Result};
use crate::utils::retry::retry_until_ok;

/// Pause used when the backoff policy yields nothing.
const REOPEN_PAUSE: Duration = Duration::from_secs(1);

/// Append every delivered message to `aggregator`, in delivery order.
///
/// Suspends while waiting for the next delivery. Returns the number of lines
/// ingested once the stream ends, which happens only when the subscriber's
/// channel or connection is gone.
pub async fn run<S>(mut messages: S, aggregator: LogAggregator) -> u64
where
    S: Stream<Item = Message> + Unpin,
{
    let mut ingested = 0u64;
    while let Some(message) = messages.next().await {
        let line = message.as_text();
        debug!(routing_key = %message.routing_key, len = line.len(), "Ingesting line");
        aggregator.append(&line).await;
        ingested += 1;
    }
    info!(ingested, "Subscription stream ended");
    ingested
}

/// Like [`run`], but reopens the subscription whenever its stream ends.
///
/// `open` is retried with `backoff` until it yields a new stream, and a
/// backoff pause separates a lost stream from the next open. The pause resets
/// once a stream delivers anything. Never returns.
pub async fn run_with_reconnect<S, F, Fut, B>(mut open: F, aggregator: LogAggregator, backoff: B)
where
    S: Stream<Item = Message> + Unpin,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S>>,
    B: BackoffBuilder + Clone,
{
    let mut pauses = backoff.clone().build();
    loop {
        let messages = retry_until_ok("subscription open", backoff.clone(), &mut open).await;
        if run(messages, aggregator.clone()).await > 0 {
            pauses = backoff.clone().build();
        }

        let delay = match pauses.next() {
            Some(delay) => delay,
            None => {
                pauses = backoff.clone().build();
                pauses.next().unwrap_or(REOPEN_PAUSE)
            }
        };
        warn!(
            reopen_in_ms = delay.as_millis() as u64,
            "Subscription lost, reopening"
        );
        tokio::time::sleep(delay).await;
    }
}
