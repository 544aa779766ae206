//! Text frame decoding.
//!
//! Text frames arrive as JSON envelopes. The envelope is parsed first, then the
//! `data` field is decoded into the payload shape selected by `type`. A `data`
//! value that does not fit that shape is kept as-is in
//! [`FramePayload::Untyped`]; only a malformed envelope fails to decode.

use crate::access::AccessUpdate;
use crate::error::DecodeError;
use crate::frame::{
    now_ms, DeltaData, ErrorData, FrameKind, FramePayload, HeartbeatData, LaneFrame, ManifestData,
    SyncData, DEFAULT_FRAME_VERSION,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

/// Raw text envelope as sent by the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextEnvelope {
    /// Frame type name
    #[serde(rename = "type")]
    pub kind: String,
    /// Envelope version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    /// Server timestamp in epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Type-specific payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Base64-encoded binary attachment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    /// Integrity checksum, passed through unverified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Decode a text frame.
///
/// `version` defaults to [`DEFAULT_FRAME_VERSION`] and `timestamp` to the
/// decode time when the envelope omits them.
pub fn decode_text(raw: &str) -> Result<LaneFrame, DecodeError> {
    let envelope: TextEnvelope = serde_json::from_str(raw).map_err(DecodeError::Json)?;

    let kind = FrameKind::parse(&envelope.kind)
        .ok_or_else(|| DecodeError::UnknownKind(envelope.kind.clone()))?;

    let data = match envelope.data {
        Some(Value::Null) | None => Value::Object(Default::default()),
        Some(value) => value,
    };

    let payload = match typed_payload(kind, &data) {
        Ok(payload) => payload,
        Err(e) => {
            debug!("Delivering untyped {} payload: {}", kind, e);
            FramePayload::Untyped { kind, data }
        }
    };

    let binary = match envelope.binary {
        Some(encoded) => Some(Bytes::from(STANDARD.decode(encoded.as_bytes())?)),
        None => None,
    };

    let frame = LaneFrame {
        version: envelope.version.unwrap_or(DEFAULT_FRAME_VERSION),
        timestamp: envelope.timestamp.unwrap_or_else(now_ms),
        payload,
        binary,
        checksum: envelope.checksum,
    };

    trace!("Decoded {} frame (version {})", kind, frame.version);
    Ok(frame)
}

fn typed_payload(kind: FrameKind, data: &Value) -> Result<FramePayload, serde_json::Error> {
    Ok(match kind {
        FrameKind::Manifest => FramePayload::Manifest(ManifestData::deserialize(data)?),
        FrameKind::Access => FramePayload::Access(AccessUpdate::deserialize(data)?),
        FrameKind::Delta => FramePayload::Delta(DeltaData::deserialize(data)?),
        FrameKind::Sync => FramePayload::Sync(SyncData::deserialize(data)?),
        FrameKind::Heartbeat => FramePayload::Heartbeat(HeartbeatData::deserialize(data)?),
        FrameKind::Error => FramePayload::Error(ErrorData::deserialize(data)?),
    })
}
