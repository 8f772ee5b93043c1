//! Network transport for the sync endpoint.
//!
//! A thin trait so the coordinator is testable with a scripted transport;
//! the real one posts `SyncRequest` JSON to `POST {api_base}/sync` with a
//! bearer token and a bounded timeout. The error taxonomy is what drives
//! the retry decision: only server-side and network failures are
//! retryable, a 4xx batch will not become valid by resubmission.

use async_trait::async_trait;
use thiserror::Error;

use crate::config::SyncConfig;
use crate::protocol::{SyncRequest, SyncResponse};

#[derive(Debug, Error)]
pub enum TransportError {
    /// 401: the session is invalid, independent of retry logic.
    #[error("authentication rejected (401)")]
    Unauthorized,

    /// Other 4xx: the batch itself was rejected. Not retryable.
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// 5xx: transient server failure.
    #[error("server error {status}")]
    Server { status: u16 },

    /// Bounded timeout elapsed. Treated as retryable, never as partial
    /// success.
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether the coordinator's backoff loop should try again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Server { .. } | Self::Timeout | Self::Network(_)
        )
    }
}

#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn send(
        &self,
        request: &SyncRequest,
        auth_token: &str,
    ) -> Result<SyncResponse, TransportError>;
}

/// `reqwest`-backed transport for the real endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(config: &SyncConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/sync", config.api_base.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn send(
        &self,
        request: &SyncRequest,
        auth_token: &str,
    ) -> Result<SyncResponse, TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(auth_token)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 401 {
            return Err(TransportError::Unauthorized);
        }
        if status.is_client_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        if status.is_server_error() {
            return Err(TransportError::Server {
                status: status.as_u16(),
            });
        }

        response
            .json::<SyncResponse>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}
