//! Relay reached over HTTP
//!
//! - `POST {base}/relay` with `{"node", "peers", "frame"}` (frame base64)
//! - `GET {base}/relay/inbound?node=...` returns `{"frames": [base64...]}`

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{PeerSelector, RelayTransport, TransportError};
use crate::config::NetworkConfig;
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
struct RelayRequest<'a> {
    node: Uuid,
    peers: &'a PeerSelector,
    frame: String,
}

#[derive(Debug, Deserialize)]
struct InboundResponse {
    #[serde(default)]
    frames: Vec<String>,
}

/// HTTP relay client
#[derive(Debug, Clone)]
pub struct HttpRelay {
    http_client: HttpClient,
    base_url: String,
    node: Uuid,
}

impl HttpRelay {
    /// Create a relay client with a fresh node identity
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::NetworkError)?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            node: Uuid::new_v4(),
        })
    }

    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        Self::new(config.relay_url.clone(), Duration::from_secs(config.timeout_secs))
    }

    pub fn node_id(&self) -> Uuid {
        self.node
    }
}

/// Map an HTTP status to a transport failure
fn classify(status: StatusCode) -> TransportError {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        TransportError::Unavailable(format!("HTTP {}", status))
    } else {
        TransportError::Rejected(format!("HTTP {}", status))
    }
}

fn unavailable(e: reqwest::Error) -> TransportError {
    TransportError::Unavailable(e.to_string())
}

#[async_trait]
impl RelayTransport for HttpRelay {
    async fn send(&self, peers: &PeerSelector, frame: &[u8]) -> std::result::Result<(), TransportError> {
        let url = format!("{}/relay", self.base_url);
        debug!(len = frame.len(), "Posting frame to relay");

        let response = self
            .http_client
            .post(&url)
            .json(&RelayRequest {
                node: self.node,
                peers,
                frame: BASE64.encode(frame),
            })
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "Relay refused frame");
            return Err(classify(status));
        }
        Ok(())
    }

    async fn poll_inbound(&self) -> std::result::Result<Vec<Vec<u8>>, TransportError> {
        let url = format!("{}/relay/inbound", self.base_url);

        let response = self
            .http_client
            .get(&url)
            .query(&[("node", self.node.to_string())])
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify(status));
        }

        let inbound: InboundResponse = response.json().await.map_err(unavailable)?;

        // One undecodable entry must not cost the rest of the batch
        let frames = inbound
            .frames
            .iter()
            .filter_map(|frame| match BASE64.decode(frame) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    debug!(error = %e, "Skipping undecodable inbound frame");
                    None
                }
            })
            .collect();
        Ok(frames)
    }
}
