//! Error types for session establishment, heartbeats, and lane transports

use thiserror::Error;

/// Failure to establish a session. Always surfaced to the caller of
/// `start_session`; no session state survives it.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The request never produced a response
    #[error("Handshake request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// The server answered with a non-success status
    #[error("Handshake rejected with status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, as text
        body: String,
    },
    /// The response body was not a valid handshake response
    #[error("Invalid handshake response: {0}")]
    InvalidResponse(String),
    /// A newer start or end superseded this handshake while it was in flight
    #[error("Handshake superseded by a newer session lifecycle transition")]
    Superseded,
}

/// Heartbeat or end-of-session notification failure
#[derive(Error, Debug)]
pub enum HeartbeatError {
    /// The request never produced a response (including client timeout)
    #[error("Heartbeat request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Unexpected status that is not a session rejection
    #[error("Unexpected heartbeat status {status}")]
    Status {
        /// HTTP status code
        status: u16,
    },
}

/// Lane transport failure
#[derive(Error, Debug)]
pub enum TransportError {
    /// The subscription could not be opened
    #[error("Lane connect failed: {0}")]
    Connect(String),
    /// The server refused the subscription
    #[error("Lane subscription refused with status {status}")]
    Status {
        /// HTTP status code
        status: u16,
    },
    /// The open stream failed mid-flight
    #[error("Lane stream error: {0}")]
    Stream(String),
}
