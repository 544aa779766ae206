//! Frame decoding error types.

use thiserror::Error;

/// Errors raised while decoding a text frame.
///
/// A decode error never closes the lane; the offending frame is dropped.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The envelope is not valid JSON or lacks a `type`
    #[error("malformed envelope: {0}")]
    Json(#[source] serde_json::Error),

    /// The `type` field names a frame kind this client does not know
    #[error("unknown frame type {0:?}")]
    UnknownKind(String),

    /// The `binary` attachment is not valid base64
    #[error("invalid binary attachment: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A binary frame header is not valid UTF-8
    #[error("invalid utf-8 in binary frame: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// A binary frame header lacks the `itemId:readiness` fields
    #[error("malformed binary header {0:?}")]
    Header(String),
}
