//! HTTP client for the credential authority
//!
//! - `POST {base}/tokens` with `{"count": n}` returns `{"tokens": [base64...]}`
//! - `POST {base}/tokens/verify` with token, proof and commitment returns
//!   `{"valid": bool}`; the authority records the token as redeemed
//!
//! A 429 from issuance means the quota for this client is used up.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, warn};

use super::authority::{AuthorityError, CredentialAuthority, CredentialProof};
use crate::codec::Commitment;
use crate::config::NetworkConfig;
use crate::error::{Error, Result};

const PRESENTATION_DOMAIN: &[u8] = b"dsnet/credential-presentation/v1";

#[derive(Debug, Serialize)]
struct IssuanceRequest {
    count: u32,
}

#[derive(Debug, Deserialize)]
struct IssuanceResponse {
    tokens: Vec<String>,
}

#[derive(Debug, Serialize)]
struct VerifyRequest {
    token: String,
    proof: String,
    commitment: String,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    valid: bool,
}

/// Credential authority reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpCredentialAuthority {
    http_client: HttpClient,
    base_url: String,
}

impl HttpCredentialAuthority {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::NetworkError)?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        Self::new(
            config.authority_url.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn presentation(token: &[u8], commitment: &Commitment) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(PRESENTATION_DOMAIN);
        hasher.update((token.len() as u64).to_be_bytes());
        hasher.update(token);
        hasher.update(commitment.as_bytes());
        hasher.finalize().to_vec()
    }
}

fn unavailable(e: impl std::fmt::Display) -> AuthorityError {
    AuthorityError::Unavailable(e.to_string())
}

#[async_trait]
impl CredentialAuthority for HttpCredentialAuthority {
    async fn request_issuance(&self, count: u32) -> std::result::Result<Vec<Vec<u8>>, AuthorityError> {
        let url = format!("{}/tokens", self.base_url);
        debug!(count, url = %url, "Requesting tokens from authority");

        let response = self
            .http_client
            .post(&url)
            .json(&IssuanceRequest { count })
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("Credential authority refused issuance: quota exceeded");
            return Err(AuthorityError::QuotaExceeded);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthorityError::Unavailable(format!("HTTP {}: {}", status, body)));
        }

        let issued: IssuanceResponse = response.json().await.map_err(unavailable)?;
        issued
            .tokens
            .iter()
            .map(|token| BASE64.decode(token).map_err(unavailable))
            .collect()
    }

    fn prove(&self, token: &[u8], commitment: &Commitment) -> CredentialProof {
        CredentialProof {
            token: token.to_vec(),
            proof: Self::presentation(token, commitment),
        }
    }

    async fn verify(
        &self,
        proof: &CredentialProof,
        commitment: &Commitment,
    ) -> std::result::Result<bool, AuthorityError> {
        // A presentation bound to another envelope never reaches the authority
        if proof.proof != Self::presentation(&proof.token, commitment) {
            return Ok(false);
        }

        let url = format!("{}/tokens/verify", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&VerifyRequest {
                token: BASE64.encode(&proof.token),
                proof: BASE64.encode(&proof.proof),
                commitment: commitment.to_hex(),
            })
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthorityError::Unavailable(format!("HTTP {}", status)));
        }

        let verdict: VerifyResponse = response.json().await.map_err(unavailable)?;
        Ok(verdict.valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve exactly one canned HTTP response on a local port
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            // Read headers, then as much body as Content-Length announces
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }

            let reply = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });

        format!("http://{}", addr)
    }

    fn authority(url: &str) -> HttpCredentialAuthority {
        HttpCredentialAuthority::new(url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_issuance_decodes_tokens() {
        // "AQID" = [1, 2, 3], "BAU=" = [4, 5]
        let url = serve_once("200 OK", r#"{"tokens":["AQID","BAU="]}"#).await;
        let tokens = authority(&url).request_issuance(2).await.unwrap();
        assert_eq!(tokens, vec![vec![1, 2, 3], vec![4, 5]]);
    }

    #[tokio::test]
    async fn test_issuance_quota_exceeded() {
        let url = serve_once("429 Too Many Requests", "{}").await;
        assert_eq!(
            authority(&url).request_issuance(1).await,
            Err(AuthorityError::QuotaExceeded)
        );
    }

    #[tokio::test]
    async fn test_issuance_server_error_is_unavailable() {
        let url = serve_once("503 Service Unavailable", "{}").await;
        assert!(matches!(
            authority(&url).request_issuance(1).await,
            Err(AuthorityError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_asks_authority_for_bound_presentation() {
        let url = serve_once("200 OK", r#"{"valid":true}"#).await;
        let authority = authority(&url);
        let commitment = Commitment([3; 32]);
        let proof = authority.prove(b"token", &commitment);

        assert!(authority.verify(&proof, &commitment).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_rejects_mismatched_commitment_locally() {
        // Unroutable: a network call would fail rather than return false
        let authority = authority("http://127.0.0.1:1");
        let proof = authority.prove(b"token", &Commitment([3; 32]));

        assert_eq!(authority.verify(&proof, &Commitment([4; 32])).await, Ok(false));
    }

    #[test]
    fn test_base_url_is_normalized() {
        assert_eq!(authority("http://authority.local/").base_url(), "http://authority.local");
    }
}
