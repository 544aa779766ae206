//! Session manager: handshake with resume, heartbeat, lanes, and state.
//!
//! One manager owns one session at a time. `start_session` and `end_session`
//! each advance the lifecycle epoch; results of requests started under an
//! older epoch are discarded so a slow response cannot revive an ended
//! session.

use lane_capability::CapabilityNegotiator;
use lane_storage::{ResumeRecord, ResumeStore};
use lane_wire::now_ms;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::{LaneDispatcher, LaneHandler, Subscription};
use crate::error::HandshakeError;
use crate::failure_tracker::ReconnectBudget;
use crate::handshake::{HandshakeRequest, HandshakeResponse, SessionApi};
use crate::keepalive::{heartbeat_interval, run_heartbeat};
use crate::lane::{LaneConnection, LaneContext};
use crate::session::{ConnectionState, Lifecycle, Session, SessionConfig, StateHandler};
use crate::transport::LaneTransport;

/// Mutable per-session state
#[derive(Default)]
struct Active {
    session: Option<Session>,
    identity: Option<String>,
    lanes: HashMap<String, LaneConnection>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Active {
    /// Detach everything running for the current session
    fn take_running(&mut self) -> (Option<Session>, Vec<LaneConnection>, Option<JoinHandle<()>>) {
        let lanes = self.lanes.drain().map(|(_, lane)| lane).collect();
        (self.session.take(), lanes, self.heartbeat.take())
    }
}

fn stop_running(lanes: Vec<LaneConnection>, heartbeat: Option<JoinHandle<()>>) {
    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
    }
    for lane in lanes {
        lane.close();
    }
}

struct Inner {
    api: Arc<dyn SessionApi>,
    transport: Arc<dyn LaneTransport>,
    store: Arc<dyn ResumeStore>,
    negotiator: Arc<CapabilityNegotiator>,
    config: SessionConfig,
    lifecycle: Arc<Lifecycle>,
    dispatcher: Arc<LaneDispatcher>,
    budget: Arc<ReconnectBudget>,
    active: Mutex<Active>,
    /// Serializes resume-record writes with their epoch check
    record_lock: tokio::sync::Mutex<()>,
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, Active> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Orchestrates one resumable session and its lanes. Cheap to clone; clones
/// share state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a manager from its collaborators
    pub fn new(
        api: Arc<dyn SessionApi>,
        transport: Arc<dyn LaneTransport>,
        store: Arc<dyn ResumeStore>,
        negotiator: Arc<CapabilityNegotiator>,
        config: SessionConfig,
    ) -> Self {
        let budget = Arc::new(ReconnectBudget::new(
            config.reconnect_base_delay,
            config.max_reconnect_attempts,
        ));
        Self {
            inner: Arc::new(Inner {
                api,
                transport,
                store,
                negotiator,
                config,
                lifecycle: Arc::new(Lifecycle::new()),
                dispatcher: Arc::new(LaneDispatcher::new()),
                budget,
                active: Mutex::new(Active::default()),
                record_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Establish a session, resuming the persisted one when it belongs to
    /// the same identity and has not expired.
    ///
    /// An explicit `identity` takes precedence over the persisted one; if
    /// they differ, the existing session is ended first.
    pub async fn start_session(&self, identity: Option<String>) -> Result<Session, HandshakeError> {
        let inner = &self.inner;
        let epoch = inner.lifecycle.advance();
        inner.budget.reset();
        inner.lifecycle.set_state(ConnectionState::Connecting);

        let mut record = self.load_record(epoch).await;
        let persisted_identity = inner
            .active()
            .identity
            .clone()
            .or_else(|| record.as_ref().and_then(|r| r.wallet_address.clone()));

        if let (Some(requested), Some(persisted)) = (&identity, &persisted_identity) {
            if requested != persisted {
                info!("Identity changed; tearing down the previous session");
                self.teardown(epoch).await;
                record = None;
            }
        }
        let identity = identity.or(persisted_identity);

        let resume_token = match record {
            Some(record) if record.resumable_for(identity.as_deref(), now_ms()) => {
                debug!("Resuming session {}", record.session_id);
                Some(record.session_id)
            }
            Some(record) => {
                debug!("Discarding stale resume record for session {}", record.session_id);
                self.clear_record(epoch).await;
                None
            }
            None => None,
        };

        // Local teardown only: a resumed session must stay alive server-side
        let (_, lanes, heartbeat) = inner.active().take_running();
        stop_running(lanes, heartbeat);

        let request = HandshakeRequest {
            wallet_address: identity.clone(),
            capabilities: inner.negotiator.detect_device_capabilities(),
            resume_token,
            version: inner.config.protocol_version.clone(),
        };
        let result = inner.api.handshake(&request).await;

        if !inner.lifecycle.is_current(epoch) {
            debug!("Discarding superseded handshake result");
            return Err(HandshakeError::Superseded);
        }

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!("Handshake failed: {}", e);
                inner
                    .lifecycle
                    .set_state_if_current(epoch, ConnectionState::Error);
                return Err(e);
            }
        };

        let session = Self::session_from(response, identity.clone());
        self.install(epoch, &session, identity)?;

        if !self.save_record(epoch, &session).await {
            debug!("Session {} superseded before it was persisted", session.session_id);
            return Err(HandshakeError::Superseded);
        }

        inner
            .lifecycle
            .set_state_if_current(epoch, ConnectionState::Connected);
        info!(
            "Session {} established with {} lanes",
            session.session_id,
            session.lanes.len()
        );
        Ok(session)
    }

    fn session_from(response: HandshakeResponse, identity: Option<String>) -> Session {
        Session {
            session_id: response.session_id,
            expires_at: response.expires_at,
            heartbeat_interval_ms: response.heartbeat_interval_ms,
            lanes: response.lanes,
            features: response.features.into_iter().collect(),
            wallet_identity: identity,
        }
    }

    /// Store the session, start the heartbeat, and open every lane
    fn install(&self, epoch: u64, session: &Session, identity: Option<String>) -> Result<(), HandshakeError> {
        let inner = &self.inner;
        let mut active = inner.active();
        if !inner.lifecycle.is_current(epoch) {
            return Err(HandshakeError::Superseded);
        }

        active.session = Some(session.clone());
        active.identity = identity;
        active.heartbeat = Some(self.spawn_heartbeat(epoch, session));

        let ctx = LaneContext {
            session_id: session.session_id.clone(),
            transport: Arc::clone(&inner.transport),
            dispatcher: Arc::clone(&inner.dispatcher),
            budget: Arc::clone(&inner.budget),
            lifecycle: Arc::clone(&inner.lifecycle),
            epoch,
        };
        for (name, url) in &session.lanes {
            let lane = LaneConnection::connect(name.clone(), url.clone(), ctx.clone());
            active.lanes.insert(name.clone(), lane);
        }
        Ok(())
    }

    fn spawn_heartbeat(&self, epoch: u64, session: &Session) -> JoinHandle<()> {
        let period = heartbeat_interval(&self.inner.config, session.heartbeat_interval_ms);
        debug!(
            "Heartbeat for session {} every {:?}",
            session.session_id, period
        );

        let lifecycle = Arc::downgrade(&self.inner.lifecycle);
        let is_current = move || {
            lifecycle
                .upgrade()
                .map(|l| l.is_current(epoch))
                .unwrap_or(false)
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let on_rejected = move || {
            if let Some(inner) = weak.upgrade() {
                let manager = SessionManager { inner };
                // Separate task: ending the session aborts this heartbeat
                tokio::spawn(async move { manager.end_if_current(epoch).await });
            }
        };

        tokio::spawn(run_heartbeat(
            Arc::clone(&self.inner.api),
            session.session_id.clone(),
            period,
            is_current,
            on_rejected,
        ))
    }

    /// End the session. Safe to call repeatedly.
    ///
    /// Stops the heartbeat, closes all lanes, notifies the server (errors
    /// ignored), and clears the in-memory session and resume record.
    pub async fn end_session(&self) {
        self.end(None).await;
    }

    async fn end_if_current(&self, epoch: u64) {
        self.end(Some(epoch)).await;
    }

    async fn end(&self, expected_epoch: Option<u64>) {
        let inner = &self.inner;
        let (end_epoch, session, lanes, heartbeat) = {
            let mut active = inner.active();
            if let Some(epoch) = expected_epoch {
                if !inner.lifecycle.is_current(epoch) {
                    return;
                }
            }
            let end_epoch = inner.lifecycle.advance();
            active.identity = None;
            let (session, lanes, heartbeat) = active.take_running();
            (end_epoch, session, lanes, heartbeat)
        };
        stop_running(lanes, heartbeat);
        self.clear_record(end_epoch).await;

        if let Some(session) = &session {
            if let Err(e) = inner.api.end(&session.session_id).await {
                debug!("End notification for session {} failed: {}", session.session_id, e);
            }
            info!("Session {} ended", session.session_id);
        }
        // A session started while the server was being notified stays connected
        inner
            .lifecycle
            .set_state_if_current(end_epoch, ConnectionState::Disconnected);
    }

    /// Tear down the current session within `epoch` without changing state
    async fn teardown(&self, epoch: u64) {
        let (session, lanes, heartbeat) = {
            let mut active = self.inner.active();
            if !self.inner.lifecycle.is_current(epoch) {
                return;
            }
            active.identity = None;
            active.take_running()
        };
        stop_running(lanes, heartbeat);
        self.clear_record(epoch).await;

        if let Some(session) = session {
            if let Err(e) = self.inner.api.end(&session.session_id).await {
                debug!("End notification for session {} failed: {}", session.session_id, e);
            }
        }
    }

    async fn load_record(&self, epoch: u64) -> Option<ResumeRecord> {
        match self.inner.store.load().await {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring unreadable resume record: {}", e);
                self.clear_record(epoch).await;
                None
            }
        }
    }

    /// Persist `session` unless `epoch` has been superseded. Returns whether
    /// the epoch was still current.
    async fn save_record(&self, epoch: u64, session: &Session) -> bool {
        let _guard = self.inner.record_lock.lock().await;
        if !self.inner.lifecycle.is_current(epoch) {
            return false;
        }
        let record = ResumeRecord {
            session_id: session.session_id.clone(),
            expires_at: session.expires_at,
            lanes: session.lanes.clone(),
            wallet_address: session.wallet_identity.clone(),
        };
        if let Err(e) = self.inner.store.save(&record).await {
            warn!("Failed to persist resume record: {}", e);
        }
        true
    }

    /// Clear the record unless `epoch` has been superseded; a newer epoch
    /// owns whatever is stored by then.
    async fn clear_record(&self, epoch: u64) {
        let _guard = self.inner.record_lock.lock().await;
        if !self.inner.lifecycle.is_current(epoch) {
            debug!("Leaving resume record to a newer session");
            return;
        }
        if let Err(e) = self.inner.store.clear().await {
            warn!("Failed to clear resume record: {}", e);
        }
    }

    /// Register a frame handler for `lane`; `"*"` receives every lane
    pub fn subscribe_lane<F>(&self, lane: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&str, &lane_wire::LaneFrame) + Send + Sync + 'static,
    {
        let handler: LaneHandler = Arc::new(handler);
        self.inner.dispatcher.subscribe(lane, handler)
    }

    /// Register a connection state handler
    pub fn on_connection_state_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let handler: StateHandler = Arc::new(handler);
        self.inner.lifecycle.subscribe(handler)
    }

    /// Receiver that tracks the connection state
    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.lifecycle.watch()
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lifecycle.state()
    }

    /// True iff a session exists and has not expired
    pub fn is_active(&self) -> bool {
        self.inner
            .active()
            .session
            .as_ref()
            .map(Session::is_active)
            .unwrap_or(false)
    }

    /// Current session, expired or not
    pub fn current_session(&self) -> Option<Session> {
        self.inner.active().session.clone()
    }

    /// Identity of the current or most recent session
    pub fn identity(&self) -> Option<String> {
        self.inner.active().identity.clone()
    }

    /// Names of the lanes currently open
    pub fn lane_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.active().lanes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Lane name to URL for the current session
    pub fn lane_urls(&self) -> BTreeMap<String, String> {
        self.inner
            .active()
            .lanes
            .values()
            .map(|lane| (lane.name().to_string(), lane.url().to_string()))
            .collect()
    }

    /// Reconnect budget shared by this manager's lanes
    pub fn reconnect_budget(&self) -> &ReconnectBudget {
        &self.inner.budget
    }

    /// Capability negotiator used for handshakes
    pub fn negotiator(&self) -> &Arc<CapabilityNegotiator> {
        &self.inner.negotiator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HeartbeatError, TransportError};
    use crate::handshake::HeartbeatOutcome;
    use crate::transport::{LaneMessage, LaneStream};
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use futures::StreamExt;
    use lane_capability::{DeviceProfile, HostProbe};
    use lane_storage::MemoryResumeStore;
    use lane_wire::FrameKind;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Default)]
    struct MockApi {
        responses: Mutex<VecDeque<Result<HandshakeResponse, u16>>>,
        handshake_delay: Mutex<Option<Duration>>,
        end_delay: Mutex<Option<Duration>>,
        requests: Mutex<Vec<HandshakeRequest>>,
        heartbeat_outcome: Mutex<Option<HeartbeatOutcome>>,
        heartbeats: Mutex<Vec<Instant>>,
        ends: Mutex<Vec<String>>,
    }

    impl MockApi {
        fn respond(&self, response: Result<HandshakeResponse, u16>) {
            self.responses.lock().unwrap().push_back(response);
        }
    }

    #[async_trait]
    impl SessionApi for MockApi {
        async fn handshake(&self, request: &HandshakeRequest) -> Result<HandshakeResponse, HandshakeError> {
            self.requests.lock().unwrap().push(request.clone());
            let delay = *self.handshake_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.responses.lock().unwrap().pop_front();
            match next {
                Some(Ok(response)) => Ok(response),
                Some(Err(status)) => Err(HandshakeError::Status {
                    status,
                    body: String::new(),
                }),
                None => Err(HandshakeError::InvalidResponse("no scripted response".to_string())),
            }
        }

        async fn heartbeat(&self, _: &str, _: u64) -> Result<HeartbeatOutcome, HeartbeatError> {
            self.heartbeats.lock().unwrap().push(Instant::now());
            let outcome = *self.heartbeat_outcome.lock().unwrap();
            match outcome {
                Some(outcome) => Ok(outcome),
                None => Err(HeartbeatError::Status { status: 503 }),
            }
        }

        async fn end(&self, session_id: &str) -> Result<(), HeartbeatError> {
            self.ends.lock().unwrap().push(session_id.to_string());
            let delay = *self.end_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Err(HeartbeatError::Status { status: 500 })
        }
    }

    /// Opens succeed with a channel-backed stream unless `fail` is set
    #[derive(Default)]
    struct MockTransport {
        fail: std::sync::atomic::AtomicBool,
        opens: Mutex<Vec<(String, Instant)>>,
        senders: Mutex<HashMap<String, mpsc::UnboundedSender<LaneMessage>>>,
    }

    impl MockTransport {
        fn push(&self, url: &str, raw: &str) {
            let senders = self.senders.lock().unwrap();
            senders[url]
                .unbounded_send(LaneMessage::Text(raw.to_string()))
                .unwrap();
        }
    }

    #[async_trait]
    impl LaneTransport for MockTransport {
        async fn open(&self, url: &str, _session_id: &str) -> Result<LaneStream, TransportError> {
            self.opens.lock().unwrap().push((url.to_string(), Instant::now()));
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Connect("refused".to_string()));
            }
            let (tx, rx) = mpsc::unbounded();
            self.senders.lock().unwrap().insert(url.to_string(), tx);
            Ok(rx.map(Ok).boxed())
        }
    }

    struct Harness {
        manager: SessionManager,
        api: Arc<MockApi>,
        transport: Arc<MockTransport>,
        store: Arc<MemoryResumeStore>,
    }

    fn harness_with(store: MemoryResumeStore) -> Harness {
        let api = Arc::new(MockApi::default());
        let transport = Arc::new(MockTransport::default());
        let store = Arc::new(store);
        let negotiator = Arc::new(CapabilityNegotiator::new(Arc::new(HostProbe::new(
            DeviceProfile::default(),
        ))));
        let manager = SessionManager::new(
            api.clone(),
            transport.clone(),
            store.clone(),
            negotiator,
            SessionConfig::default(),
        );
        Harness {
            manager,
            api,
            transport,
            store,
        }
    }

    fn harness() -> Harness {
        harness_with(MemoryResumeStore::new())
    }

    fn response(session_id: &str, lanes: &[(&str, &str)]) -> HandshakeResponse {
        HandshakeResponse {
            session_id: session_id.to_string(),
            expires_at: now_ms() + 60_000,
            lanes: lanes
                .iter()
                .map(|(n, u)| (n.to_string(), u.to_string()))
                .collect(),
            features: vec!["resume".to_string()],
            heartbeat_interval_ms: 30_000,
        }
    }

    fn record(session_id: &str, identity: Option<&str>, expires_at: u64) -> ResumeRecord {
        ResumeRecord {
            session_id: session_id.to_string(),
            expires_at,
            lanes: BTreeMap::new(),
            wallet_address: identity.map(str::to_string),
        }
    }

    fn record_states(manager: &SessionManager) -> Arc<Mutex<Vec<ConnectionState>>> {
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        let _ = manager.on_connection_state_change(move |s| sink.lock().unwrap().push(s));
        states
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_session_opens_lanes_and_persists() {
        let h = harness();
        h.api.respond(Ok(response("s1", &[("manifests", "/m"), ("access", "/a")])));
        let states = record_states(&h.manager);

        let session = h.manager.start_session(Some("0xabc".to_string())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(session.session_id, "s1");
        assert!(session.features.contains("resume"));
        assert_eq!(h.manager.lane_names(), vec!["access", "manifests"]);
        assert_eq!(h.transport.opens.lock().unwrap().len(), 2);
        assert!(h.manager.is_active());
        assert_eq!(h.manager.identity().as_deref(), Some("0xabc"));
        assert_eq!(
            *states.lock().unwrap(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );

        let stored = h.store.load().await.unwrap().unwrap();
        assert_eq!(stored.session_id, "s1");
        assert_eq!(stored.wallet_address.as_deref(), Some("0xabc"));
        assert_eq!(stored.lanes.len(), 2);

        let request = &h.api.requests.lock().unwrap()[0];
        assert_eq!(request.version, "1.0");
        assert!(request.resume_token.is_none());
        assert!(request.capabilities.protected_media.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_token_requires_matching_identity_and_expiry() {
        let future = now_ms() + 60_000;
        let cases = [
            (Some("0xabc"), Some("0xabc"), future, true),
            (None, None, future, true),
            (Some("0xabc"), None, future, true),
            (Some("0xabc"), Some("0xdef"), future, false),
            (Some("0xabc"), Some("0xabc"), now_ms().saturating_sub(1), false),
        ];

        for (stored_identity, requested, expires_at, honored) in cases {
            let h = harness_with(MemoryResumeStore::with_record(record(
                "old",
                stored_identity,
                expires_at,
            )));
            h.api.respond(Ok(response("new", &[])));

            h.manager
                .start_session(requested.map(str::to_string))
                .await
                .unwrap();

            let token = h.api.requests.lock().unwrap()[0].resume_token.clone();
            assert_eq!(
                token.is_some(),
                honored,
                "stored={:?} requested={:?}",
                stored_identity,
                requested
            );
            if honored {
                assert_eq!(token.as_deref(), Some("old"));
            }
            // Whatever happened, the new session now owns the slot
            assert_eq!(h.store.load().await.unwrap().unwrap().session_id, "new");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_persisted_identity_used_when_none_supplied() {
        let h = harness_with(MemoryResumeStore::with_record(record(
            "old",
            Some("0xabc"),
            now_ms() + 60_000,
        )));
        h.api.respond(Ok(response("s1", &[])));

        let session = h.manager.start_session(None).await.unwrap();

        assert_eq!(session.wallet_identity.as_deref(), Some("0xabc"));
        let request = &h.api.requests.lock().unwrap()[0];
        assert_eq!(request.wallet_address.as_deref(), Some("0xabc"));
        assert_eq!(request.resume_token.as_deref(), Some("old"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_change_tears_down_previous_session() {
        let h = harness();
        h.api.respond(Ok(response("s1", &[("access", "/a")])));
        h.api.respond(Ok(response("s2", &[("access", "/a")])));

        h.manager.start_session(Some("0xabc".to_string())).await.unwrap();
        h.manager.start_session(Some("0xdef".to_string())).await.unwrap();

        assert_eq!(*h.api.ends.lock().unwrap(), vec!["s1".to_string()]);
        let second = &h.api.requests.lock().unwrap()[1];
        assert!(second.resume_token.is_none());
        assert_eq!(h.manager.current_session().unwrap().session_id, "s2");
        assert_eq!(h.manager.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_change_against_persisted_record_only() {
        let h = harness_with(MemoryResumeStore::with_record(record(
            "old",
            Some("0xabc"),
            now_ms() + 60_000,
        )));
        *h.api.handshake_delay.lock().unwrap() = Some(Duration::from_secs(5));
        h.api.respond(Ok(response("new", &[])));

        let manager = h.manager.clone();
        let pending =
            tokio::spawn(async move { manager.start_session(Some("0xdef".to_string())).await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        // The other identity's record is gone before the handshake returns
        assert!(h.store.load().await.unwrap().is_none());

        let session = pending.await.unwrap().unwrap();
        assert_eq!(session.wallet_identity.as_deref(), Some("0xdef"));

        let request = &h.api.requests.lock().unwrap()[0];
        assert!(request.resume_token.is_none());
        assert_eq!(request.wallet_address.as_deref(), Some("0xdef"));
        // Nothing was running locally, so the server is not told to end "old"
        assert!(h.api.ends.lock().unwrap().is_empty());

        let stored = h.store.load().await.unwrap().unwrap();
        assert_eq!(stored.session_id, "new");
        assert_eq!(stored.wallet_address.as_deref(), Some("0xdef"));
        assert_eq!(h.manager.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_end_does_not_disturb_newer_session() {
        let h = harness();
        *h.api.end_delay.lock().unwrap() = Some(Duration::from_secs(5));
        h.api.respond(Ok(response("s1", &[("access", "/a")])));
        h.api.respond(Ok(response("s2", &[("access", "/a")])));

        h.manager.start_session(None).await.unwrap();

        let manager = h.manager.clone();
        let ending = tokio::spawn(async move { manager.end_session().await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let session = h.manager.start_session(None).await.unwrap();
        assert_eq!(session.session_id, "s2");
        assert!(h.api.requests.lock().unwrap()[1].resume_token.is_none());

        ending.await.unwrap();

        assert_eq!(*h.api.ends.lock().unwrap(), vec!["s1".to_string()]);
        assert_eq!(h.manager.connection_state(), ConnectionState::Connected);
        assert!(h.manager.is_active());
        assert_eq!(h.manager.current_session().unwrap().session_id, "s2");
        assert_eq!(h.manager.lane_names(), vec!["access"]);
        assert_eq!(h.store.load().await.unwrap().unwrap().session_id, "s2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_start_keeps_newer_record() {
        let h = harness();
        *h.api.handshake_delay.lock().unwrap() = Some(Duration::from_secs(5));
        // The faster second start takes the first scripted response
        h.api.respond(Ok(response("fresh", &[("access", "/a")])));
        h.api.respond(Ok(response("late", &[("access", "/a")])));

        let manager = h.manager.clone();
        let slow = tokio::spawn(async move { manager.start_session(None).await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        *h.api.handshake_delay.lock().unwrap() = None;
        let session = h.manager.start_session(None).await.unwrap();
        assert_eq!(session.session_id, "fresh");

        let result = slow.await.unwrap();
        assert!(matches!(result, Err(HandshakeError::Superseded)));

        assert_eq!(h.manager.current_session().unwrap().session_id, "fresh");
        assert_eq!(h.manager.connection_state(), ConnectionState::Connected);
        assert_eq!(h.store.load().await.unwrap().unwrap().session_id, "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_failure_leaves_no_state() {
        let h = harness();
        h.api.respond(Err(500));

        let result = h.manager.start_session(None).await;
        assert!(matches!(result, Err(HandshakeError::Status { status: 500, .. })));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.manager.connection_state(), ConnectionState::Error);
        assert!(h.manager.current_session().is_none());
        assert!(h.manager.lane_names().is_empty());
        assert!(h.transport.opens.lock().unwrap().is_empty());
        assert!(h.api.heartbeats.lock().unwrap().is_empty());
        assert!(h.store.load().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_state_recovers_with_new_start() {
        let h = harness();
        h.api.respond(Err(502));
        h.api.respond(Ok(response("s1", &[])));

        assert!(h.manager.start_session(None).await.is_err());
        assert_eq!(h.manager.connection_state(), ConnectionState::Error);

        h.manager.start_session(None).await.unwrap();
        assert_eq!(h.manager.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_heartbeat_at_interval_minus_margin_and_rejection_ends() {
        let h = harness();
        h.api.respond(Ok(response("s1", &[("manifests", "/m"), ("access", "/a")])));
        *h.api.heartbeat_outcome.lock().unwrap() = Some(HeartbeatOutcome::Rejected);

        let started = Instant::now();
        h.manager.start_session(None).await.unwrap();
        assert_eq!(h.manager.lane_names().len(), 2);

        tokio::time::sleep(Duration::from_millis(24_999)).await;
        assert!(h.api.heartbeats.lock().unwrap().is_empty());
        assert!(h.manager.current_session().is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let heartbeats = h.api.heartbeats.lock().unwrap().clone();
        assert_eq!(heartbeats.len(), 1);
        assert_eq!(heartbeats[0].duration_since(started), Duration::from_secs(25));

        assert!(h.manager.current_session().is_none());
        assert!(h.manager.lane_names().is_empty());
        assert_eq!(h.manager.connection_state(), ConnectionState::Disconnected);
        assert_eq!(*h.api.ends.lock().unwrap(), vec!["s1".to_string()]);
        assert!(h.store.load().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_errors_keep_session() {
        let h = harness();
        h.api.respond(Ok(response("s1", &[])));
        h.manager.start_session(None).await.unwrap();

        tokio::time::sleep(Duration::from_secs(80)).await;

        assert_eq!(h.api.heartbeats.lock().unwrap().len(), 3);
        assert!(h.manager.current_session().is_some());
        assert_eq!(h.manager.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_backoff_then_error() {
        let h = harness();
        h.transport.fail.store(true, Ordering::SeqCst);
        h.api.respond(Ok(response("s1", &[("access", "/a")])));

        let started = Instant::now();
        h.manager.start_session(None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(300)).await;

        let offsets: Vec<u64> = h
            .transport
            .opens
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t)| t.duration_since(started).as_secs())
            .collect();
        // Six closures: five backoffs of 1, 2, 4, 8, 16 seconds, then give up
        assert_eq!(offsets, vec![0, 1, 3, 7, 15, 31]);
        assert_eq!(h.manager.connection_state(), ConnectionState::Error);
        assert!(h.manager.reconnect_budget().is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_session_resets_budget() {
        let h = harness();
        h.transport.fail.store(true, Ordering::SeqCst);
        h.api.respond(Ok(response("s1", &[("access", "/a")])));
        h.api.respond(Ok(response("s2", &[("access", "/a")])));

        h.manager.start_session(None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(h.manager.reconnect_budget().is_exhausted());

        h.transport.fail.store(false, Ordering::SeqCst);
        h.manager.start_session(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(!h.manager.reconnect_budget().is_exhausted());
        assert_eq!(h.manager.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wildcard_sees_every_frame_in_lane_order() {
        let h = harness();
        h.api.respond(Ok(response("s1", &[("access", "/a"), ("delta", "/d")])));

        let named = Arc::new(Mutex::new(Vec::new()));
        let all = Arc::new(Mutex::new(Vec::new()));
        let named_sink = Arc::clone(&named);
        let all_sink = Arc::clone(&all);
        let _n = h.manager.subscribe_lane("access", move |_, frame| {
            named_sink.lock().unwrap().push(frame.timestamp);
        });
        let _a = h.manager.subscribe_lane("*", move |lane, frame| {
            all_sink.lock().unwrap().push((lane.to_string(), frame.timestamp));
        });
        let _bad = h.manager.subscribe_lane("access", |_, _| panic!("consumer bug"));

        h.manager.start_session(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        for ts in 1..=3 {
            h.transport
                .push("/a", &format!(r#"{{"type":"delta","timestamp":{}}}"#, ts));
        }
        h.transport.push("/d", r#"{"type":"sync","timestamp":10}"#);
        h.transport.push("/a", "garbage");
        h.transport.push("/a", r#"{"type":"heartbeat","timestamp":4}"#);
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(*named.lock().unwrap(), vec![1, 2, 3, 4]);
        let all = all.lock().unwrap().clone();
        let access: Vec<u64> = all
            .iter()
            .filter(|(lane, _)| lane == "access")
            .map(|(_, ts)| *ts)
            .collect();
        assert_eq!(access, vec![1, 2, 3, 4]);
        assert!(all.contains(&("delta".to_string(), 10)));
        assert_eq!(all.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_active_tracks_expiry_without_end() {
        let h = harness();
        let mut short = response("s1", &[]);
        short.expires_at = now_ms() + 30;
        h.api.respond(Ok(short));

        h.manager.start_session(None).await.unwrap();
        assert!(h.manager.is_active());

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!h.manager.is_active());
        assert!(h.manager.current_session().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_session_is_idempotent() {
        let h = harness();
        h.api.respond(Ok(response("s1", &[("access", "/a")])));
        let states = record_states(&h.manager);

        h.manager.start_session(None).await.unwrap();
        h.manager.end_session().await;
        h.manager.end_session().await;

        assert_eq!(*h.api.ends.lock().unwrap(), vec!["s1".to_string()]);
        assert!(!h.manager.is_active());
        assert!(h.manager.lane_names().is_empty());
        assert!(h.store.load().await.unwrap().is_none());
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );

        // No heartbeat survives the end
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.api.heartbeats.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_during_handshake_discards_result() {
        let h = harness();
        *h.api.handshake_delay.lock().unwrap() = Some(Duration::from_secs(5));
        h.api.respond(Ok(response("s1", &[("access", "/a")])));

        let manager = h.manager.clone();
        let pending = tokio::spawn(async move { manager.start_session(None).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.manager.end_session().await;

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(HandshakeError::Superseded)));
        assert!(h.manager.current_session().is_none());
        assert!(h.transport.opens.lock().unwrap().is_empty());
        assert_eq!(h.manager.connection_state(), ConnectionState::Disconnected);
        assert!(h.store.load().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_binary_frames_are_dispatched_as_access() {
        let h = harness();
        h.api.respond(Ok(response("s1", &[("access", "/a")])));
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&kinds);
        let _sub = h.manager.subscribe_lane("access", move |_, frame| {
            sink.lock().unwrap().push(frame.kind());
        });

        h.manager.start_session(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let update = lane_wire::AccessUpdate::new("item-9", "READY");
        h.transport.senders.lock().unwrap()["/a"]
            .unbounded_send(LaneMessage::Binary(lane_wire::encode_binary(&update)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(*kinds.lock().unwrap(), vec![FrameKind::Access]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_watch_and_unsubscribe() {
        let h = harness();
        h.api.respond(Ok(response("s1", &[])));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let sub = h.manager.on_connection_state_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut rx = h.manager.watch_connection_state();

        h.manager.start_session(None).await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connected);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        sub.unsubscribe();
        h.manager.end_session().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow(), ConnectionState::Disconnected);
    }
}
