//! Line receiver.
//!
//! Accepts the emitter's `POST /` lines, appends `<body> <remote addr>` to a
//! log file and, when a publisher is attached, mirrors them onto the bus
//! prefixed `RCV`.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::bus::Publisher;
use crate::emitter::create_log;

/// Prefix for lines mirrored onto the bus.
pub const RECEIVED_PREFIX: &str = "RCV";

/// Shared handler state.
#[derive(Clone)]
pub struct ReceiverState {
    log: Arc<Mutex<File>>,
    publisher: Option<Arc<Publisher>>,
}

impl ReceiverState {
    /// Create the log file (and parent directory), truncating any previous run.
    pub async fn create(path: &Path, publisher: Option<Arc<Publisher>>) -> std::io::Result<Self> {
        let log = create_log(path).await?;
        Ok(Self {
            log: Arc::new(Mutex::new(log)),
            publisher,
        })
    }

    /// Attach a publisher once the broker is reachable.
    pub fn with_publisher(mut self, publisher: Arc<Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }
}

/// Build the axum router (separated for testing).
pub fn router(state: ReceiverState) -> Router {
    Router::new()
        .route("/", post(receive))
        .with_state(state)
}

/// Serve on an already-bound listener, exposing the peer address to handlers.
pub async fn serve(
    listener: TcpListener,
    state: ReceiverState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let actual_port = listener.local_addr()?.port();
    info!(port = actual_port, "receiver listening");
    axum::serve(
        listener,
        router(state)
            .layer(TraceLayer::new_for_http())
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn receive(
    State(state): State<ReceiverState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: String,
) -> StatusCode {
    let line = format!("{} {}", body, addr);

    {
        let mut log = state.log.lock().await;
        let written = async {
            log.write_all(line.as_bytes()).await?;
            log.write_all(b"\n").await?;
            log.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(error = %e, "Failed to write received line");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    }

    if let Some(publisher) = &state.publisher {
        if let Err(e) = publisher
            .publish(format!("{} {}", RECEIVED_PREFIX, line))
            .await
        {
            warn!(error = %e, "Failed to mirror received line onto bus");
        }
    }

    StatusCode::OK
}

#[cfg(test)]
mod tests;
