//! One reconnecting subscription per advertised lane

use futures::StreamExt;
use lane_wire::{decode_binary, decode_text, LaneFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatch::LaneDispatcher;
use crate::failure_tracker::ReconnectBudget;
use crate::session::{ConnectionState, Lifecycle};
use crate::transport::{LaneMessage, LaneTransport};

/// Everything a lane task shares with its session manager
#[derive(Clone)]
pub(crate) struct LaneContext {
    pub(crate) session_id: String,
    pub(crate) transport: Arc<dyn LaneTransport>,
    pub(crate) dispatcher: Arc<LaneDispatcher>,
    pub(crate) budget: Arc<ReconnectBudget>,
    pub(crate) lifecycle: Arc<Lifecycle>,
    /// Lifecycle epoch the lane was opened under
    pub(crate) epoch: u64,
}

/// A live lane subscription with its own reconnect loop
pub struct LaneConnection {
    name: String,
    url: String,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl LaneConnection {
    /// Spawn the lane task; it opens the subscription immediately
    pub(crate) fn connect(name: String, url: String, ctx: LaneContext) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_lane(
            name.clone(),
            url.clone(),
            ctx,
            Arc::clone(&closed),
        ));
        Self {
            name,
            url,
            closed,
            task,
        }
    }

    /// Lane name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lane URL as advertised by the handshake
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tear the lane down without reconnecting; cancels a pending backoff sleep
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closing lane {}", self.name);
        }
        self.task.abort();
    }
}

impl Drop for LaneConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn decode(name: &str, message: LaneMessage) -> Option<LaneFrame> {
    match message {
        LaneMessage::Text(raw) => match decode_text(&raw) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("Dropping undecodable frame on lane {}: {}", name, e);
                None
            }
        },
        LaneMessage::Binary(bytes) => decode_binary(&bytes).map(LaneFrame::from_access),
    }
}

async fn run_lane(name: String, url: String, ctx: LaneContext, closed: Arc<AtomicBool>) {
    loop {
        if closed.load(Ordering::Acquire) {
            return;
        }

        match ctx.transport.open(&url, &ctx.session_id).await {
            Ok(mut stream) => {
                ctx.budget.record_success();
                info!("Lane {} connected ({})", name, url);

                while let Some(message) = stream.next().await {
                    match message {
                        Ok(message) => {
                            if let Some(frame) = decode(&name, message) {
                                debug!("Lane {} received {} frame", name, frame.kind());
                                ctx.dispatcher.dispatch(&name, &frame);
                            }
                        }
                        Err(e) => {
                            warn!("Lane {} stream error: {}", name, e);
                            break;
                        }
                    }
                }

                if closed.load(Ordering::Acquire) {
                    return;
                }
                warn!("Lane {} closed unexpectedly", name);
            }
            Err(e) => {
                if closed.load(Ordering::Acquire) {
                    return;
                }
                warn!("Lane {} failed to open: {}", name, e);
            }
        }

        match ctx.budget.next_delay() {
            Some(delay) => {
                info!("Reconnecting lane {} in {:?}", name, delay);
                tokio::time::sleep(delay).await;
            }
            None => {
                error!("Lane {} giving up: reconnect attempts exhausted", name);
                ctx.lifecycle
                    .set_state_if_current(ctx.epoch, ConnectionState::Error);
                return;
            }
        }
    }
}
