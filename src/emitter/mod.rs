//! Progress line emitter.
//!
//! Sends numbered, timestamped lines to the receiver over HTTP, keeps a copy
//! in a local log file, and mirrors each line onto the bus prefixed `SND`.
//! Finishes with a `STOP` line.
//!
//! ## Architecture
//! ```text
//! EmitLoop --(POST text/plain)--> [receiver]
//!     |
//!     +--> log file
//!     +--> Publisher --> [broker topic]
//! ```

mod client;

use std::net::SocketAddr;
use std::path::Path;

use chrono::{DateTime, DurationRound, SecondsFormat, TimeDelta, Utc};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

pub use client::{HttpPeerClient, PeerClient};

use crate::bus::Publisher;
use crate::config::EmitterConfig;

/// Final line, sent after the numbered ones.
pub const STOP: &str = "STOP";
/// Prefix for lines mirrored onto the bus.
pub const SENT_PREFIX: &str = "SND";

/// Errors that end the emitter.
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("Log file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(String),
}

/// What a finished run did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EmitSummary {
    /// Numbered lines built and sent.
    pub sent: u32,
    /// Iterations skipped because the peer did not resolve.
    pub unresolved: u32,
    /// Lines (STOP included) the receiver did not accept.
    pub post_failures: u32,
    /// Lines (STOP included) that could not be mirrored onto the bus.
    pub publish_failures: u32,
}

/// Format a progress line: `<n> <timestamp> <peer>`.
pub fn format_line(n: u32, timestamp: DateTime<Utc>, peer: SocketAddr) -> String {
    format!("{} {} {}", n, format_timestamp(timestamp), peer)
}

/// RFC 3339 UTC with millisecond precision and trailing fraction zeros
/// removed: `.120` becomes `.12`, `.000` disappears.
fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    let rendered = timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
    let Some(base) = rendered.strip_suffix('Z') else {
        return rendered;
    };
    match base.split_once('.') {
        Some((seconds, fraction)) => {
            let fraction = fraction.trim_end_matches('0');
            if fraction.is_empty() {
                format!("{}Z", seconds)
            } else {
                format!("{}.{}Z", seconds, fraction)
            }
        }
        None => rendered,
    }
}

/// Current UTC time rounded to the millisecond.
fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    now.duration_round(TimeDelta::milliseconds(1))
        .unwrap_or(now)
}

/// The emitter loop.
pub struct EmitLoop<C: PeerClient> {
    config: EmitterConfig,
    client: C,
    publisher: Option<Publisher>,
    log: File,
}

impl<C: PeerClient> EmitLoop<C> {
    /// Create the emitter, creating its log file (and parent directory).
    pub async fn new(
        config: EmitterConfig,
        client: C,
        publisher: Option<Publisher>,
    ) -> Result<Self, EmitError> {
        let log = create_log(&config.log_path).await?;
        Ok(Self {
            config,
            client,
            publisher,
            log,
        })
    }

    /// Run to completion: `count` numbered lines, then STOP.
    ///
    /// Resolution, HTTP and publish failures are recorded and skipped; only
    /// log file errors abort the run. Returns the publisher so the caller can
    /// close it.
    pub async fn run(mut self) -> Result<(EmitSummary, Option<Publisher>), EmitError> {
        let mut summary = EmitSummary::default();

        for n in 1..=self.config.count {
            let peer = match resolve(&self.config.peer).await {
                Ok(peer) => peer,
                Err(e) => {
                    warn!(peer = %self.config.peer, error = %e, "Failed to resolve receiver");
                    self.write_line(&e.to_string()).await?;
                    summary.unresolved += 1;
                    tokio::time::sleep(self.config.interval()).await;
                    continue;
                }
            };

            let line = format_line(n, now_millis(), peer);
            self.write_line(&line).await?;
            self.deliver(peer, &line, &mut summary).await?;
            summary.sent += 1;

            tokio::time::sleep(self.config.interval()).await;
        }

        self.write_line(STOP).await?;
        match resolve(&self.config.peer).await {
            Ok(peer) => self.deliver(peer, STOP, &mut summary).await?,
            Err(e) => {
                self.write_line(&e.to_string()).await?;
                summary.unresolved += 1;
                self.mirror(STOP, &mut summary).await;
            }
        }
        self.log.flush().await?;

        info!(
            sent = summary.sent,
            unresolved = summary.unresolved,
            post_failures = summary.post_failures,
            publish_failures = summary.publish_failures,
            "Emitter finished"
        );
        Ok((summary, self.publisher))
    }

    /// POST to the receiver, then mirror onto the bus.
    async fn deliver(
        &mut self,
        peer: SocketAddr,
        line: &str,
        summary: &mut EmitSummary,
    ) -> Result<(), EmitError> {
        if let Err(e) = self.client.post_line(peer, line).await {
            warn!(peer = %peer, error = %e, "Receiver rejected line");
            self.write_line(&e.to_string()).await?;
            summary.post_failures += 1;
        }
        self.mirror(line, summary).await;
        Ok(())
    }

    async fn mirror(&self, line: &str, summary: &mut EmitSummary) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        if let Err(e) = publisher
            .publish(format!("{} {}", SENT_PREFIX, line))
            .await
        {
            warn!(error = %e, "Failed to mirror line onto bus");
            summary.publish_failures += 1;
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), EmitError> {
        self.log.write_all(line.as_bytes()).await?;
        self.log.write_all(b"\n").await?;
        Ok(())
    }
}

/// Create (truncating) a log file and its parent directory.
pub(crate) async fn create_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    File::create(path).await
}

async fn resolve(peer: &str) -> std::io::Result<SocketAddr> {
    tokio::net::lookup_host(peer).await?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no addresses for {}", peer),
        )
    })
}
