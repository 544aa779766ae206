//! Session endpoints: handshake, heartbeat, and end.
//!
//! [`SessionApi`] is the seam the manager talks through; [`HttpSessionApi`]
//! implements it against the application server with `reqwest`.

use async_trait::async_trait;
use lane_capability::DeviceCapabilities;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{HandshakeError, HeartbeatError};

/// Header identifying the session on heartbeat and end requests
pub const SESSION_HEADER: &str = "X-Session-Id";

/// Body of `POST /session/handshake`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    /// Wallet identity, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_address: Option<String>,
    /// Device capability snapshot
    pub capabilities: DeviceCapabilities,
    /// Previous session id offered for continuation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    /// Protocol version tag
    pub version: String,
}

/// Successful handshake response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    /// Session identifier
    pub session_id: String,
    /// Expiry in epoch milliseconds
    pub expires_at: u64,
    /// Lane name to lane URL
    #[serde(default)]
    pub lanes: BTreeMap<String, String>,
    /// Advertised feature flags
    #[serde(default)]
    pub features: Vec<String>,
    /// Server heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
}

/// Result of a heartbeat that reached the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Session is still valid
    Alive,
    /// Session expired or is no longer authorized
    Rejected,
}

#[derive(Serialize)]
struct HeartbeatBody {
    timestamp: u64,
}

/// Server-side session operations
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Establish or resume a session
    async fn handshake(&self, request: &HandshakeRequest) -> Result<HandshakeResponse, HandshakeError>;

    /// Liveness ping carrying the client timestamp
    async fn heartbeat(&self, session_id: &str, timestamp: u64) -> Result<HeartbeatOutcome, HeartbeatError>;

    /// Best-effort end-of-session notification
    async fn end(&self, session_id: &str) -> Result<(), HeartbeatError>;
}

/// [`SessionApi`] over HTTP
#[derive(Clone, Debug)]
pub struct HttpSessionApi {
    client: reqwest::Client,
    base_url: String,
    heartbeat_timeout: Duration,
}

impl HttpSessionApi {
    /// Create a client for the server at `base_url`
    pub fn new(base_url: impl Into<String>, heartbeat_timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, heartbeat_timeout)
    }

    /// Create a client reusing an existing `reqwest::Client`
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        heartbeat_timeout: Duration,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            heartbeat_timeout,
        }
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/session/{}", self.base_url, name)
    }
}

fn is_rejection(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::GONE
    )
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn handshake(&self, request: &HandshakeRequest) -> Result<HandshakeResponse, HandshakeError> {
        let response = self
            .client
            .post(self.endpoint("handshake"))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            warn!("Handshake failed with status {}", status);
            return Err(HandshakeError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: HandshakeResponse = serde_json::from_str(&body)
            .map_err(|e| HandshakeError::InvalidResponse(e.to_string()))?;
        debug!(
            "Handshake accepted: session={} lanes={}",
            parsed.session_id,
            parsed.lanes.len()
        );
        Ok(parsed)
    }

    async fn heartbeat(&self, session_id: &str, timestamp: u64) -> Result<HeartbeatOutcome, HeartbeatError> {
        let response = self
            .client
            .post(self.endpoint("heartbeat"))
            .header(SESSION_HEADER, session_id)
            .timeout(self.heartbeat_timeout)
            .json(&HeartbeatBody { timestamp })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(HeartbeatOutcome::Alive)
        } else if is_rejection(status) {
            Ok(HeartbeatOutcome::Rejected)
        } else {
            Err(HeartbeatError::Status {
                status: status.as_u16(),
            })
        }
    }

    async fn end(&self, session_id: &str) -> Result<(), HeartbeatError> {
        let status = self
            .client
            .post(self.endpoint("end"))
            .header(SESSION_HEADER, session_id)
            .send()
            .await?
            .status();

        if status.is_success() {
            Ok(())
        } else {
            Err(HeartbeatError::Status {
                status: status.as_u16(),
            })
        }
    }
}
