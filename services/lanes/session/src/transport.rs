//! Lane transports: the streaming subscription behind each lane.
//!
//! The production transport is a long-lived server-sent-events GET per lane.
//! Tests substitute their own [`LaneTransport`].

use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::Url;
use tracing::debug;

use crate::error::TransportError;

/// One message received on a lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaneMessage {
    /// Text frame carrying a JSON envelope
    Text(String),
    /// Binary access frame
    Binary(Bytes),
}

/// Stream of messages for one open lane; ends when the server closes it
pub type LaneStream = BoxStream<'static, Result<LaneMessage, TransportError>>;

/// Opens lane subscriptions
#[async_trait]
pub trait LaneTransport: Send + Sync {
    /// Open the subscription at `url` scoped to `session_id`
    async fn open(&self, url: &str, session_id: &str) -> Result<LaneStream, TransportError>;
}

/// Server-sent-events transport over `reqwest`
#[derive(Clone, Debug)]
pub struct SseLaneTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl SseLaneTransport {
    /// Create a transport resolving relative lane URLs against `base_url`
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Create a transport with a caller-provided client
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self, TransportError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| TransportError::Connect(format!("invalid base URL {}: {}", base_url, e)))?;
        Ok(Self { client, base_url })
    }

    /// Absolute subscription URL for `lane_url` and `session_id`
    pub fn subscription_url(&self, lane_url: &str, session_id: &str) -> Result<Url, TransportError> {
        let mut url = self
            .base_url
            .join(lane_url)
            .map_err(|e| TransportError::Connect(format!("invalid lane URL {}: {}", lane_url, e)))?;
        url.query_pairs_mut().append_pair("sessionId", session_id);
        Ok(url)
    }
}

#[async_trait]
impl LaneTransport for SseLaneTransport {
    async fn open(&self, url: &str, session_id: &str) -> Result<LaneStream, TransportError> {
        let url = self.subscription_url(url, session_id)?;
        debug!("Opening lane subscription {}", url);

        let response = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }

        let stream = response
            .bytes_stream()
            .eventsource()
            .map(|event| match event {
                Ok(event) => Ok(LaneMessage::Text(event.data)),
                Err(e) => Err(TransportError::Stream(e.to_string())),
            });

        Ok(Box::pin(stream))
    }
}
