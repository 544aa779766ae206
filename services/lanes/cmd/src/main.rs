//! Lanes client binary.
//!
//! Opens a resumable session against an application server, subscribes to
//! every lane it advertises, and logs the decoded frames until interrupted.

use anyhow::Context;
use clap::Parser;
use lane_capability::{CapabilityNegotiator, HostProbe, StaticKeySystemProbe};
use lane_session::{
    ConnectionState, HttpSessionApi, SessionManager, SseLaneTransport, WILDCARD_LANE,
};
use lane_storage::open_store;
use lane_wire::FramePayload;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::{LanesConfig, StorageKind};
use logging::LanesLogFormatter;

/// Resumable multi-lane streaming session client
#[derive(Parser, Debug)]
#[command(name = "lanes", version, about = "Resumable multi-lane streaming session client")]
struct Args {
    /// Application server base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Wallet identity to open the session for
    #[arg(long)]
    wallet: Option<String>,

    /// Configuration file path
    #[arg(long, default_value = "lanes.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Resume record storage: memory, file
    #[arg(long, value_enum)]
    storage: Option<StorageKind>,

    /// Resume record file for file storage
    #[arg(long)]
    storage_path: Option<PathBuf>,

    /// First reconnect delay, e.g. 1s
    #[arg(long)]
    reconnect_base_delay: Option<humantime::Duration>,

    /// Consecutive lane failures tolerated before giving up
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,

    /// Subtracted from the server heartbeat interval, e.g. 5s
    #[arg(long)]
    heartbeat_margin: Option<humantime::Duration>,

    /// Notify the server and clear the resume record on exit
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    end_on_exit: bool,
}

impl Args {
    /// Flags override file and environment configuration
    fn apply_to(&self, config: &mut LanesConfig) {
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        if let Some(wallet) = &self.wallet {
            config.wallet = Some(wallet.clone());
        }
        if let Some(storage) = self.storage {
            config.storage.mode = storage;
        }
        if let Some(path) = &self.storage_path {
            config.storage.path = path.clone();
        }
        if let Some(delay) = self.reconnect_base_delay {
            config.session.reconnect_base_delay_ms = delay.as_millis() as u64;
        }
        if let Some(attempts) = self.max_reconnect_attempts {
            config.session.max_reconnect_attempts = attempts;
        }
        if let Some(margin) = self.heartbeat_margin {
            config.session.heartbeat_margin_ms = margin.as_millis() as u64;
        }
    }
}

fn describe(payload: &FramePayload) -> String {
    match payload {
        FramePayload::Manifest(m) => format!("item={}", m.item_id.as_deref().unwrap_or("-")),
        FramePayload::Access(a) => format!("item={} readiness={}", a.item_id, a.readiness),
        FramePayload::Delta(d) => format!("ops={}", d.ops.len()),
        FramePayload::Sync(s) => format!("cursor={}", s.cursor.as_deref().unwrap_or("-")),
        FramePayload::Heartbeat(h) => format!("server_time={:?}", h.server_time),
        FramePayload::Error(e) => format!(
            "code={} message={}",
            e.code.as_deref().unwrap_or("-"),
            e.message.as_deref().unwrap_or("-")
        ),
        FramePayload::Untyped { data, .. } => format!("untyped data={}", data),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("lanes={}", args.log_level).parse()?)
        .add_directive(format!("lane_session={}", args.log_level).parse()?)
        .add_directive(format!("lane_wire={}", args.log_level).parse()?)
        .add_directive(format!("lane_storage={}", args.log_level).parse()?)
        .add_directive(format!("lane_capability={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(LanesLogFormatter::new("lanes".to_string()))
        .init();

    info!("Starting lanes client v{}", env!("CARGO_PKG_VERSION"));

    let mut lanes_config = LanesConfig::load_from_file(&args.config)?;
    args.apply_to(&mut lanes_config);

    let session_config = lanes_config.session.session_config();
    let store = open_store(lanes_config.storage.storage_mode())
        .await
        .context("Failed to open resume store")?;
    let api = Arc::new(HttpSessionApi::new(
        lanes_config.base_url.clone(),
        session_config.heartbeat_timeout,
    ));
    let transport = Arc::new(
        SseLaneTransport::new(&lanes_config.base_url).context("Invalid base URL")?,
    );
    let negotiator = Arc::new(
        CapabilityNegotiator::new(Arc::new(HostProbe::new(lanes_config.device.clone())))
            .with_key_systems(Arc::new(StaticKeySystemProbe::new(
                lanes_config.key_systems.iter().copied(),
            ))),
    );

    let negotiated = negotiator.negotiate_capabilities();
    component_info!(
        "capability",
        "Negotiated video={:?} drm={} quality={:?}",
        negotiated.video_format,
        negotiated.drm.as_str(),
        negotiated.recommended_quality
    );

    {
        let negotiator = Arc::clone(&negotiator);
        tokio::spawn(async move {
            let media = negotiator.refine_protected_media().await;
            debug!("Protected media refined: {:?}", media.preferred());
            if let Some(refined) = negotiator.negotiated() {
                component_info!("capability", "Refined DRM preference: {}", refined.drm.as_str());
            }
        });
    }

    let manager = SessionManager::new(api, transport, store, negotiator, session_config);

    let _frames = manager.subscribe_lane(WILDCARD_LANE, |lane, frame| {
        component_info!(
            "frame",
            "{} frame on lane {} (v{}): {}",
            frame.kind(),
            lane,
            frame.version,
            describe(&frame.payload)
        );
    });
    let _states = manager.on_connection_state_change(|state| {
        component_info!("state", "Connection {}", state);
    });
    let mut state_rx = manager.watch_connection_state();

    let session = match manager.start_session(lanes_config.wallet.clone()).await {
        Ok(session) => session,
        Err(e) => {
            component_warn!("session", "Handshake failed: {}", e);
            return Err(anyhow::Error::from(e).context("Session handshake failed"));
        }
    };
    info!(
        "Session {} active until {} with lanes {:?}",
        session.session_id,
        chrono::DateTime::from_timestamp_millis(session.expires_at as i64)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| session.expires_at.to_string()),
        manager.lane_names()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, shutting down");
                break;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                if matches!(state, ConnectionState::Error | ConnectionState::Disconnected) {
                    warn!("Session left the connected state ({}); exiting", state);
                    break;
                }
            }
        }
    }

    if args.end_on_exit {
        manager.end_session().await;
    }

    info!("Lanes client shutdown complete");
    Ok(())
}
