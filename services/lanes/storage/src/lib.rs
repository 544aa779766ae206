//! Resumable session record storage with pluggable backends.
//!
//! A client keeps exactly one [`ResumeRecord`] in a fixed storage slot. It is
//! written after every successful handshake, read on the next start to build
//! a resume token, and cleared when the session ends or the identity changes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Persisted state needed to resume a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRecord {
    /// Session identifier issued by the server
    pub session_id: String,
    /// Session expiry in epoch milliseconds
    pub expires_at: u64,
    /// Lane name to lane URL
    pub lanes: BTreeMap<String, String>,
    /// Wallet identity the session was opened for
    #[serde(default)]
    pub wallet_address: Option<String>,
}

impl ResumeRecord {
    /// Whether this record may be offered as a resume token.
    ///
    /// The stored identity must equal the requested one (both absent counts
    /// as equal) and the session must not have expired at `now_ms`.
    pub fn resumable_for(&self, identity: Option<&str>, now_ms: u64) -> bool {
        self.wallet_address.as_deref() == identity && self.expires_at > now_ms
    }
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Stored data failed its integrity check
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Single-slot store for the resume record
#[async_trait]
pub trait ResumeStore: Send + Sync {
    /// Read the stored record, if any
    async fn load(&self) -> Result<Option<ResumeRecord>, StorageError>;

    /// Replace the stored record
    async fn save(&self, record: &ResumeRecord) -> Result<(), StorageError>;

    /// Remove the stored record; clearing an empty slot is not an error
    async fn clear(&self) -> Result<(), StorageError>;
}

/// Storage backend configuration
#[derive(Clone, Debug, Default)]
pub enum StorageMode {
    /// In-memory storage (dev/tests only)
    #[default]
    InMemory,
    /// JSON file holding the single record
    File {
        /// Path of the record file
        path: PathBuf,
    },
}

// Re-export backend implementations
pub use backend::file::FileResumeStore;
pub use backend::mem::MemoryResumeStore;

/// Create a store from configuration
pub async fn open_store(mode: StorageMode) -> Result<Arc<dyn ResumeStore>, StorageError> {
    match mode {
        StorageMode::InMemory => Ok(Arc::new(MemoryResumeStore::new())),
        StorageMode::File { path } => Ok(Arc::new(FileResumeStore::new(path).await?)),
    }
}
