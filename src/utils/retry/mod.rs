//! Retry combinator and standard backoff policies.
//!
//! Uses `backon` builders purely as delay generators. The combinator never
//! gives up: an exhausted policy is rebuilt and iteration starts over.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder, ExponentialBuilder};
use tracing::{info, warn};

/// Delay used when a policy yields nothing even right after being rebuilt.
const FALLBACK_DELAY: Duration = Duration::from_secs(2);

/// Fixed-delay policy used while waiting for the broker at startup.
pub fn fixed_backoff(delay: Duration) -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(delay)
        .with_max_times(usize::MAX)
}

/// Backoff for reopening a dropped subscription.
///
/// - Min delay: 100ms
/// - Max delay: 30s
/// - Jitter enabled
pub fn reconnect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(usize::MAX)
        .with_jitter()
}

/// Run `attempt` until it succeeds, sleeping between failures as `backoff` dictates.
///
/// Every failure is logged at warn level with its attempt number. There is no
/// deadline and no maximum attempt count.
pub async fn retry_until_ok<T, E, F, Fut, B>(operation: &str, backoff: B, mut attempt: F) -> T
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    B: BackoffBuilder + Clone,
{
    let mut delays = backoff.clone().build();
    let mut attempts: u64 = 0;

    loop {
        attempts += 1;
        match attempt().await {
            Ok(value) => {
                if attempts > 1 {
                    info!(operation, attempts, "succeeded after retrying");
                }
                return value;
            }
            Err(e) => {
                let delay = match delays.next() {
                    Some(delay) => delay,
                    None => {
                        delays = backoff.clone().build();
                        delays.next().unwrap_or(FALLBACK_DELAY)
                    }
                };
                warn!(
                    operation,
                    attempt = attempts,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
