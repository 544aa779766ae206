//! Decoded lane frames.
//!
//! A [`LaneFrame`] is one unit of data received on a lane. Its payload is a
//! sum type keyed by the envelope `type`, so consumers match on the variant
//! instead of casting an untyped blob. Data the client cannot type is still
//! delivered, as [`FramePayload::Untyped`].

use crate::access::AccessUpdate;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Version assumed when an envelope omits it
pub const DEFAULT_FRAME_VERSION: u32 = 1;

/// Frame types carried by the `type` field of a text envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Item manifest publication
    Manifest,
    /// Access-right update
    Access,
    /// Incremental state change
    Delta,
    /// Full state synchronization
    Sync,
    /// Server-side liveness marker
    Heartbeat,
    /// Server-reported error
    Error,
}

impl FrameKind {
    /// Wire name of this kind
    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Manifest => "manifest",
            FrameKind::Access => "access",
            FrameKind::Delta => "delta",
            FrameKind::Sync => "sync",
            FrameKind::Heartbeat => "heartbeat",
            FrameKind::Error => "error",
        }
    }

    /// Parse a wire name
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "manifest" => Some(FrameKind::Manifest),
            "access" => Some(FrameKind::Access),
            "delta" => Some(FrameKind::Delta),
            "sync" => Some(FrameKind::Sync),
            "heartbeat" => Some(FrameKind::Heartbeat),
            "error" => Some(FrameKind::Error),
            _ => None,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `manifest` frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestData {
    /// Item the manifest describes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    /// Manifest revision, if the server tracks one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    /// Manifest document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Value>,
    /// Fields not modelled above
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of a `delta` frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaData {
    /// Entity the delta applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Ordered change operations
    #[serde(default)]
    pub ops: Vec<Value>,
    /// Fields not modelled above
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of a `sync` frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncData {
    /// Opaque cursor to resume synchronization from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Full state snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    /// Fields not modelled above
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of a `heartbeat` frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatData {
    /// Server clock in epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time: Option<u64>,
    /// Fields not modelled above
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of an `error` frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    /// Machine-readable error code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Fields not modelled above
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Typed frame payload, one variant per [`FrameKind`]
#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    /// `manifest` frame
    Manifest(ManifestData),
    /// `access` frame (text envelope or binary access frame)
    Access(AccessUpdate),
    /// `delta` frame
    Delta(DeltaData),
    /// `sync` frame
    Sync(SyncData),
    /// `heartbeat` frame
    Heartbeat(HeartbeatData),
    /// `error` frame
    Error(ErrorData),
    /// Frame whose `data` does not fit the typed shape of its kind
    Untyped {
        /// Kind declared by the envelope
        kind: FrameKind,
        /// `data` exactly as received
        data: Value,
    },
}

impl FramePayload {
    /// Kind tag of this payload
    pub fn kind(&self) -> FrameKind {
        match self {
            FramePayload::Manifest(_) => FrameKind::Manifest,
            FramePayload::Access(_) => FrameKind::Access,
            FramePayload::Delta(_) => FrameKind::Delta,
            FramePayload::Sync(_) => FrameKind::Sync,
            FramePayload::Heartbeat(_) => FrameKind::Heartbeat,
            FramePayload::Error(_) => FrameKind::Error,
            FramePayload::Untyped { kind, .. } => *kind,
        }
    }
}

/// One decoded unit of data received on a lane
#[derive(Debug, Clone, PartialEq)]
pub struct LaneFrame {
    /// Envelope version
    pub version: u32,
    /// Server or decode timestamp in epoch milliseconds
    pub timestamp: u64,
    /// Typed payload
    pub payload: FramePayload,
    /// Decoded binary attachment
    pub binary: Option<Bytes>,
    /// Checksum as sent by the server; not verified here
    pub checksum: Option<String>,
}

impl LaneFrame {
    /// Wrap a binary access update into a frame stamped with the current time
    pub fn from_access(update: AccessUpdate) -> Self {
        Self {
            version: DEFAULT_FRAME_VERSION,
            timestamp: now_ms(),
            payload: FramePayload::Access(update),
            binary: None,
            checksum: None,
        }
    }

    /// Kind tag of this frame
    pub fn kind(&self) -> FrameKind {
        self.payload.kind()
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
