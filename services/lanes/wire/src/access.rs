//! Binary access frames.
//!
//! Access updates are pushed in a compact layout: a UTF-8 header of the form
//! `itemId:readiness[:accessMode]`, a NUL separator, then an optional UTF-8
//! JSON body `{access?, fallback?}`. Buffers without a NUL byte are the legacy
//! form and hold a complete JSON access update.
//!
//! Decoding never fails loudly: corrupted frames are logged and yield `None`
//! so the lane read loop keeps running.

use crate::error::DecodeError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{trace, warn};

/// Header/payload separator
const SEPARATOR: u8 = 0x00;

/// Access format reported when the server only sends an access mode
const UNKNOWN_FORMAT: &str = "unknown";

/// Access-right update for one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessUpdate {
    /// Item the update applies to
    pub item_id: String,
    /// Readiness state, e.g. `READY` or `PENDING`; empty when not sent
    #[serde(default)]
    pub readiness: String,
    /// Access mode named in the frame header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<String>,
    /// Access descriptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<Value>,
    /// Fallback descriptor used when the primary access path is unavailable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Value>,
    /// Fields not modelled above
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AccessUpdate {
    /// Create an update with only the header fields set
    pub fn new(item_id: impl Into<String>, readiness: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            readiness: readiness.into(),
            access_mode: None,
            access: None,
            fallback: None,
            extra: Map::new(),
        }
    }
}

/// Body of a binary access frame
#[derive(Debug, Default, Serialize, Deserialize)]
struct AccessBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fallback: Option<Value>,
}

/// Decode a binary access frame, returning `None` on any corruption.
pub fn decode_binary(bytes: &[u8]) -> Option<AccessUpdate> {
    match try_decode_binary(bytes) {
        Ok(update) => {
            trace!(
                "Decoded binary access frame for item {} ({})",
                update.item_id,
                update.readiness
            );
            Some(update)
        }
        Err(e) => {
            warn!("Dropping malformed binary frame ({} bytes): {}", bytes.len(), e);
            None
        }
    }
}

fn try_decode_binary(bytes: &[u8]) -> Result<AccessUpdate, DecodeError> {
    let Some(split) = bytes.iter().position(|&b| b == SEPARATOR) else {
        let text = std::str::from_utf8(bytes)?;
        return serde_json::from_str(text).map_err(DecodeError::Json);
    };

    let header = std::str::from_utf8(&bytes[..split])?;
    let mut fields = header.splitn(3, ':');

    let item_id = fields
        .next()
        .filter(|field| !field.is_empty())
        .ok_or_else(|| DecodeError::Header(header.to_string()))?;
    let readiness = fields
        .next()
        .filter(|field| !field.is_empty())
        .ok_or_else(|| DecodeError::Header(header.to_string()))?;

    let mut update = AccessUpdate::new(item_id, readiness);
    update.access_mode = fields
        .next()
        .filter(|field| !field.is_empty())
        .map(str::to_string);

    let payload = std::str::from_utf8(&bytes[split + 1..])?;
    if !payload.trim().is_empty() {
        let body: AccessBody = serde_json::from_str(payload).map_err(DecodeError::Json)?;
        update.access = body.access;
        update.fallback = body.fallback;
    } else if let Some(mode) = &update.access_mode {
        update.access = Some(json!({ "mode": mode, "format": UNKNOWN_FORMAT }));
    }

    Ok(update)
}

/// Encode an update in the `header NUL payload` layout.
///
/// The JSON body is omitted when neither `access` nor `fallback` is set.
pub fn encode_binary(update: &AccessUpdate) -> Bytes {
    let mut header = format!("{}:{}", update.item_id, update.readiness);
    if let Some(mode) = &update.access_mode {
        header.push(':');
        header.push_str(mode);
    }

    let body = if update.access.is_some() || update.fallback.is_some() {
        let body = AccessBody {
            access: update.access.clone(),
            fallback: update.fallback.clone(),
        };
        // Value trees with string keys always serialize
        serde_json::to_vec(&body).unwrap_or_default()
    } else {
        Vec::new()
    };

    let mut buf = BytesMut::with_capacity(header.len() + 1 + body.len());
    buf.put_slice(header.as_bytes());
    buf.put_u8(SEPARATOR);
    buf.put_slice(&body);
    buf.freeze()
}
