//! Lane frame decoding: JSON text envelopes and binary access frames.
//!
//! This crate turns raw lane messages into typed [`LaneFrame`]s. Two inbound
//! formats exist:
//!
//! - **Text frames**: a JSON envelope carrying the frame type, an optional
//!   version, timestamp, payload, base64 binary attachment and checksum.
//! - **Binary access frames**: a compact `header NUL payload` layout used for
//!   access-right updates.
//!
//! ## Text Envelope
//!
//! ```text
//! { "type": "manifest|access|delta|sync|heartbeat|error",
//!   "version": 1,            (optional, defaults to 1)
//!   "timestamp": 1700000000, (optional, epoch ms, defaults to decode time)
//!   "data": { ... },         (optional, shape depends on type)
//!   "binary": "<base64>",    (optional)
//!   "checksum": "..." }      (optional, carried through unverified)
//! ```
//!
//! ## Binary Access Frame
//!
//! ```text
//! +--------------------------------------+------+---------------------------+
//! | itemId:readiness[:accessMode] (UTF-8)| 0x00 | {access?, fallback?} JSON |
//! +--------------------------------------+------+---------------------------+
//! ```
//!
//! A buffer without a NUL byte is parsed as a complete JSON access update.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod codec;
pub mod error;
pub mod frame;

// Re-export main types
pub use access::{decode_binary, encode_binary, AccessUpdate};
pub use codec::{decode_text, TextEnvelope};
pub use error::DecodeError;
pub use frame::{
    now_ms, DeltaData, ErrorData, FrameKind, FramePayload, HeartbeatData, LaneFrame, ManifestData,
    SyncData, DEFAULT_FRAME_VERSION,
};
