//! Session heartbeat scheduling.
//!
//! The heartbeat runs as its own task. It stops when the server rejects the
//! session, or as soon as the lifecycle epoch it was started under is no
//! longer current.

use lane_wire::now_ms;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::handshake::{HeartbeatOutcome, SessionApi};
use crate::session::SessionConfig;

/// Period between heartbeats for a server interval of `server_interval_ms`:
/// the interval minus the safety margin, never below the configured floor.
pub fn heartbeat_interval(config: &SessionConfig, server_interval_ms: u64) -> Duration {
    Duration::from_millis(server_interval_ms)
        .saturating_sub(config.heartbeat_safety_margin)
        .max(config.min_heartbeat_interval)
}

/// Drive heartbeats for `session_id` every `period`, the first one `period`
/// after the call.
///
/// `is_current` is consulted before each ping and after each response;
/// `on_rejected` runs at most once, when a current heartbeat is rejected.
pub(crate) async fn run_heartbeat<C, R>(
    api: Arc<dyn SessionApi>,
    session_id: String,
    period: Duration,
    is_current: C,
    on_rejected: R,
) where
    C: Fn() -> bool + Send,
    R: FnOnce() + Send,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !is_current() {
            debug!("Heartbeat for session {} superseded", session_id);
            return;
        }

        let result = api.heartbeat(&session_id, now_ms()).await;
        if !is_current() {
            debug!("Discarding stale heartbeat result for session {}", session_id);
            return;
        }

        match result {
            Ok(HeartbeatOutcome::Alive) => {
                debug!("Heartbeat acknowledged for session {}", session_id);
            }
            Ok(HeartbeatOutcome::Rejected) => {
                info!("Session {} rejected by heartbeat; ending session", session_id);
                on_rejected();
                return;
            }
            Err(e) => {
                warn!("Heartbeat for session {} failed: {}", session_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HandshakeError, HeartbeatError};
    use crate::handshake::{HandshakeRequest, HandshakeResponse};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct ScriptedApi {
        outcomes: Mutex<VecDeque<Result<HeartbeatOutcome, u16>>>,
        pings: Mutex<Vec<Instant>>,
    }

    impl ScriptedApi {
        fn new(outcomes: Vec<Result<HeartbeatOutcome, u16>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                pings: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SessionApi for ScriptedApi {
        async fn handshake(&self, _: &HandshakeRequest) -> Result<HandshakeResponse, HandshakeError> {
            Err(HandshakeError::InvalidResponse("unused".to_string()))
        }

        async fn heartbeat(&self, _: &str, _: u64) -> Result<HeartbeatOutcome, HeartbeatError> {
            self.pings.lock().unwrap().push(Instant::now());
            match self.outcomes.lock().unwrap().pop_front() {
                Some(Ok(outcome)) => Ok(outcome),
                Some(Err(status)) => Err(HeartbeatError::Status { status }),
                None => Ok(HeartbeatOutcome::Alive),
            }
        }

        async fn end(&self, _: &str) -> Result<(), HeartbeatError> {
            Ok(())
        }
    }

    #[test]
    fn test_interval_subtracts_margin() {
        let config = SessionConfig::default();
        assert_eq!(heartbeat_interval(&config, 30_000), Duration::from_secs(25));
        assert_eq!(heartbeat_interval(&config, 5_500), Duration::from_secs(1));
        assert_eq!(heartbeat_interval(&config, 0), Duration::from_secs(1));
        assert_eq!(
            heartbeat_interval(&config, 6_500),
            Duration::from_millis(1_500)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_swallowed_until_rejection() {
        let api = ScriptedApi::new(vec![
            Ok(HeartbeatOutcome::Alive),
            Err(503),
            Ok(HeartbeatOutcome::Rejected),
        ]);
        let rejected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&rejected);
        let start = Instant::now();

        run_heartbeat(
            api.clone(),
            "s1".to_string(),
            Duration::from_secs(25),
            || true,
            move || flag.store(true, Ordering::SeqCst),
        )
        .await;

        assert!(rejected.load(Ordering::SeqCst));
        let offsets: Vec<_> = api
            .pings
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.duration_since(start))
            .collect();
        assert_eq!(
            offsets,
            vec![
                Duration::from_secs(25),
                Duration::from_secs(50),
                Duration::from_secs(75)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_epoch_stops_without_ping() {
        let api = ScriptedApi::new(vec![Ok(HeartbeatOutcome::Rejected)]);
        let rejected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&rejected);

        run_heartbeat(
            api.clone(),
            "s1".to_string(),
            Duration::from_secs(1),
            || false,
            move || flag.store(true, Ordering::SeqCst),
        )
        .await;

        assert!(api.pings.lock().unwrap().is_empty());
        assert!(!rejected.load(Ordering::SeqCst));
    }
}
