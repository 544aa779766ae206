//! In-memory storage backend for development and testing

use crate::{ResumeRecord, ResumeStore, StorageError};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory resume slot
#[derive(Debug, Default)]
pub struct MemoryResumeStore {
    slot: RwLock<Option<ResumeRecord>>,
}

impl MemoryResumeStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with a record
    pub fn with_record(record: ResumeRecord) -> Self {
        Self {
            slot: RwLock::new(Some(record)),
        }
    }
}

#[async_trait]
impl ResumeStore for MemoryResumeStore {
    async fn load(&self) -> Result<Option<ResumeRecord>, StorageError> {
        Ok(self.slot.read().await.clone())
    }

    async fn save(&self, record: &ResumeRecord) -> Result<(), StorageError> {
        debug!("Resume slot save session={}", record.session_id);
        *self.slot.write().await = Some(record.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        debug!("Resume slot clear");
        *self.slot.write().await = None;
        Ok(())
    }
}
