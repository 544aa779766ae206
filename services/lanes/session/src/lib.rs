//! Resumable multi-lane streaming sessions.
//!
//! A [`SessionManager`] performs the handshake (resuming a persisted session
//! when allowed), keeps the session alive with heartbeats, and opens one
//! [`LaneConnection`] per lane advertised by the server. Each lane decodes
//! its frames and fans them out to subscribers; lanes reconnect with
//! exponential backoff from a budget shared by all lanes of the manager.
//!
//! ## Features
//!
//! - **Handshake and resume**: identity-checked resume records
//! - **Heartbeat**: periodic liveness ping, rejection ends the session
//! - **Lanes**: long-lived subscriptions with shared reconnect budget
//! - **Dispatch**: per-lane and wildcard subscribers, panic-isolated
//! - **State**: connection-state callbacks and a `watch` receiver
//!
//! ## Example
//!
//! ```rust,no_run
//! use lane_capability::{CapabilityNegotiator, DeviceProfile, HostProbe};
//! use lane_session::{HttpSessionApi, SessionConfig, SessionManager, SseLaneTransport};
//! use lane_storage::MemoryResumeStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = SessionConfig::default();
//! let base = "https://app.example.com/api";
//! let manager = SessionManager::new(
//!     Arc::new(HttpSessionApi::new(base, config.heartbeat_timeout)),
//!     Arc::new(SseLaneTransport::new(base)?),
//!     Arc::new(MemoryResumeStore::new()),
//!     Arc::new(CapabilityNegotiator::new(Arc::new(HostProbe::new(
//!         DeviceProfile::default(),
//!     )))),
//!     config,
//! );
//!
//! let _all = manager.subscribe_lane("*", |lane, frame| {
//!     println!("{} frame on {}", frame.kind(), lane);
//! });
//! let _state = manager.on_connection_state_change(|state| {
//!     println!("connection {}", state);
//! });
//!
//! let session = manager.start_session(Some("0xabc".to_string())).await?;
//! println!("session {} with {} lanes", session.session_id, session.lanes.len());
//!
//! manager.end_session().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dispatch;
pub mod error;
pub mod failure_tracker;
pub mod handshake;
pub mod keepalive;
pub mod lane;
pub mod manager;
pub mod session;
pub mod transport;

// Re-export main types
pub use dispatch::{LaneDispatcher, LaneHandler, Subscription, WILDCARD_LANE};
pub use error::{HandshakeError, HeartbeatError, TransportError};
pub use failure_tracker::ReconnectBudget;
pub use handshake::{
    HandshakeRequest, HandshakeResponse, HeartbeatOutcome, HttpSessionApi, SessionApi,
    SESSION_HEADER,
};
pub use keepalive::heartbeat_interval;
pub use lane::LaneConnection;
pub use manager::SessionManager;
pub use session::{ConnectionState, Session, SessionConfig, StateHandler};
pub use transport::{LaneMessage, LaneStream, LaneTransport, SseLaneTransport};
