//! HTTP client for the receiver.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use super::EmitError;
use crate::bus::TEXT_PLAIN;

/// Posts one line to the receiver.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn post_line(&self, peer: SocketAddr, line: &str) -> Result<(), EmitError>;
}

/// `reqwest`-backed client: `POST http://<peer>/` with a `text/plain` body.
#[derive(Clone, Debug)]
pub struct HttpPeerClient {
    client: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> Result<Self, EmitError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| EmitError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn post_line(&self, peer: SocketAddr, line: &str) -> Result<(), EmitError> {
        self.client
            .post(format!("http://{}/", peer))
            .header(CONTENT_TYPE, TEXT_PLAIN)
            .body(line.to_string())
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| EmitError::Http(e.to_string()))?;
        Ok(())
    }
}
