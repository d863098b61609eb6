//! Read endpoint for the aggregated log.
//!
//! - `GET /`: every line received so far, as `text/plain`

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::LogAggregator;

/// Start the read endpoint on the given port.
///
/// When `port` is 0, the OS assigns an ephemeral port. The actual bound
/// port is always logged so it can be discovered.
pub async fn serve(
    aggregator: LogAggregator,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    serve_on(listener, aggregator).await
}

/// Serve on an already-bound listener.
pub async fn serve_on(
    listener: TcpListener,
    aggregator: LogAggregator,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let actual_port = listener.local_addr()?.port();
    info!(port = actual_port, "monitor read endpoint listening");
    axum::serve(listener, router(aggregator).layer(TraceLayer::new_for_http())).await?;
    Ok(())
}

/// Build the axum router (separated for testing).
pub fn router(aggregator: LogAggregator) -> Router {
    Router::new()
        .route("/", get(logs))
        .with_state(aggregator)
}

async fn logs(State(aggregator): State<LogAggregator>) -> String {
    aggregator.snapshot().await
}
