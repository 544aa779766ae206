//! Lane subscriber registry and frame fan-out

use dashmap::DashMap;
use lane_wire::LaneFrame;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, trace};

/// Lane name that matches every lane
pub const WILDCARD_LANE: &str = "*";

/// Frame handler; receives the lane name and the decoded frame
pub type LaneHandler = Arc<dyn Fn(&str, &LaneFrame) + Send + Sync>;

/// Handle returned by a subscription. Call [`Subscription::unsubscribe`] to
/// remove the handler; dropping the handle leaves it registered.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Remove the handler
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Registry of frame handlers keyed by lane name
#[derive(Default)]
pub struct LaneDispatcher {
    handlers: DashMap<String, Vec<(u64, LaneHandler)>>,
    next_id: AtomicU64,
}

impl LaneDispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `lane` (or [`WILDCARD_LANE`])
    pub fn subscribe(self: &Arc<Self>, lane: impl Into<String>, handler: LaneHandler) -> Subscription {
        let lane = lane.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .entry(lane.clone())
            .or_default()
            .push((id, handler));

        let weak = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.remove(&lane, id);
            }
        })
    }

    fn remove(&self, lane: &str, id: u64) {
        let now_empty = match self.handlers.get_mut(lane) {
            Some(mut entry) => {
                entry.retain(|(hid, _)| *hid != id);
                entry.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.handlers.remove_if(lane, |_, v| v.is_empty());
        }
    }

    fn snapshot(&self, lane: &str) -> Vec<LaneHandler> {
        self.handlers
            .get(lane)
            .map(|entry| entry.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Number of handlers registered for exactly `lane`
    pub fn handler_count(&self, lane: &str) -> usize {
        self.handlers.get(lane).map(|e| e.len()).unwrap_or(0)
    }

    /// Deliver `frame` to the handlers of `lane`, then to wildcard handlers.
    /// Returns the number of handlers that completed without panicking.
    pub fn dispatch(&self, lane: &str, frame: &LaneFrame) -> usize {
        let mut targets = self.snapshot(lane);
        if lane != WILDCARD_LANE {
            targets.extend(self.snapshot(WILDCARD_LANE));
        }

        let mut delivered = 0;
        for handler in targets {
            match catch_unwind(AssertUnwindSafe(|| handler(lane, frame))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(
                    "Handler for lane {} panicked on {} frame",
                    lane,
                    frame.kind()
                ),
            }
        }
        trace!("Dispatched {} frame on lane {} to {} handlers", frame.kind(), lane, delivered);
        delivered
    }
}
