//! Session model, configuration, and the connection-state hub.
//!
//! The hub also owns the lifecycle epoch. Every `start_session` and
//! `end_session` advances it, and asynchronous continuations (handshake
//! results, heartbeats, lane give-ups) only act while the epoch they were
//! started under is still current.

use lane_wire::now_ms;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::dispatch::Subscription;

/// Configuration for a session manager
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Subtracted from the server heartbeat interval
    pub heartbeat_safety_margin: Duration,
    /// Floor for the computed heartbeat period
    pub min_heartbeat_interval: Duration,
    /// Client-side timeout for a single heartbeat request
    pub heartbeat_timeout: Duration,
    /// Delay before the first reconnect; doubles per consecutive failure
    pub reconnect_base_delay: Duration,
    /// Consecutive lane failures tolerated before giving up
    pub max_reconnect_attempts: u32,
    /// Protocol version tag sent with the handshake
    pub protocol_version: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_safety_margin: Duration::from_secs(5),
            min_heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            protocol_version: "1.0".to_string(),
        }
    }
}

/// An established session, as advertised by the handshake
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    /// Server-issued session identifier
    pub session_id: String,
    /// Expiry in epoch milliseconds
    pub expires_at: u64,
    /// Server heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Lane name to lane URL
    pub lanes: BTreeMap<String, String>,
    /// Feature flags advertised by the server
    pub features: BTreeSet<String>,
    /// Wallet identity the session belongs to
    pub wallet_identity: Option<String>,
}

impl Session {
    /// Whether the session is still within its lifetime at `now_ms`
    pub fn is_active_at(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at
    }

    /// Whether the session is still within its lifetime right now
    pub fn is_active(&self) -> bool {
        self.is_active_at(now_ms())
    }
}

/// Global connection state of a session manager
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No session
    #[default]
    Disconnected,
    /// Handshake in flight
    Connecting,
    /// Session established, lanes opened
    Connected,
    /// Handshake failed or lanes gave up reconnecting
    Error,
}

impl ConnectionState {
    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked on every connection state change
pub type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Lifecycle epoch plus connection state with change notification
pub(crate) struct Lifecycle {
    epoch: Mutex<u64>,
    state_tx: watch::Sender<ConnectionState>,
    handlers: Mutex<Vec<(u64, StateHandler)>>,
    next_handler_id: AtomicU64,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            epoch: Mutex::new(0),
            state_tx,
            handlers: Mutex::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
        }
    }

    fn lock_epoch(&self) -> std::sync::MutexGuard<'_, u64> {
        self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advance the epoch, invalidating every pending continuation
    pub(crate) fn advance(&self) -> u64 {
        let mut epoch = self.lock_epoch();
        *epoch += 1;
        *epoch
    }

    pub(crate) fn current(&self) -> u64 {
        *self.lock_epoch()
    }

    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.current() == epoch
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Unconditionally move to `state`
    pub(crate) fn set_state(&self, state: ConnectionState) {
        if self.store(state) {
            self.notify(state);
        }
    }

    /// Move to `state` only if `epoch` is still current. Returns whether the
    /// epoch matched.
    pub(crate) fn set_state_if_current(&self, epoch: u64, state: ConnectionState) -> bool {
        let changed = {
            let current = self.lock_epoch();
            if *current != epoch {
                debug!(
                    "Discarding stale transition to {} (epoch {} != {})",
                    state, epoch, *current
                );
                return false;
            }
            self.store(state)
        };
        if changed {
            self.notify(state);
        }
        true
    }

    fn store(&self, state: ConnectionState) -> bool {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        })
    }

    fn notify(&self, state: ConnectionState) {
        debug!("Connection state -> {}", state);
        let handlers: Vec<StateHandler> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(state))).is_err() {
                error!("Connection state handler panicked on {}", state);
            }
        }
    }

    pub(crate) fn subscribe(self: &Arc<Self>, handler: StateHandler) -> Subscription {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));

        let weak = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(lifecycle) = weak.upgrade() {
                lifecycle
                    .handlers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(hid, _)| *hid != id);
            }
        })
    }
}
