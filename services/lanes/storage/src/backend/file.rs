//! File-based storage backend with checksummed, atomically replaced records

use crate::{ResumeRecord, ResumeStore, StorageError};
use async_trait::async_trait;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// On-disk envelope: the record plus a CRC32 over its serialized bytes
#[derive(Serialize, Deserialize)]
struct RecordFile {
    crc32: u32,
    record: Box<serde_json::value::RawValue>,
}

fn compute_crc(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Resume slot backed by a single JSON file
pub struct FileResumeStore {
    path: PathBuf,
    // Serializes writers so temp files never interleave
    write_lock: Mutex<()>,
}

impl FileResumeStore {
    /// Create a store at `path`, creating the parent directory if needed
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        debug!("Opened resume store at {}", path.display());
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the record file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ResumeStore for FileResumeStore {
    async fn load(&self) -> Result<Option<ResumeRecord>, StorageError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file: RecordFile = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::Corruption(format!("unreadable record file: {}", e)))?;
        let raw = file.record.get();
        let actual = compute_crc(raw.as_bytes());
        if actual != file.crc32 {
            warn!(
                "Resume record checksum mismatch at {}: expected {:08x}, got {:08x}",
                self.path.display(),
                file.crc32,
                actual
            );
            return Err(StorageError::Corruption(format!(
                "checksum mismatch: expected {:08x}, got {:08x}",
                file.crc32, actual
            )));
        }

        let record: ResumeRecord = serde_json::from_str(raw)
            .map_err(|e| StorageError::Corruption(format!("invalid record: {}", e)))?;
        Ok(Some(record))
    }

    async fn save(&self, record: &ResumeRecord) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;

        let raw = serde_json::to_string(record)?;
        let file = RecordFile {
            crc32: compute_crc(raw.as_bytes()),
            record: serde_json::value::RawValue::from_string(raw)?,
        };
        let bytes = serde_json::to_vec(&file)?;

        let tmp = self.temp_path();
        let mut out = fs::File::create(&tmp).await?;
        out.write_all(&bytes).await?;
        out.sync_all().await?;
        drop(out);
        fs::rename(&tmp, &self.path).await?;

        debug!(
            "Saved resume record session={} to {}",
            record.session_id,
            self.path.display()
        );
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!("Cleared resume record at {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
