//! Configuration handling for the lanes client.
//!
//! Configuration is read from a YAML file, then overridden by environment
//! variables; command-line flags are applied last by `main`.

use anyhow::{Context, Result};
use lane_capability::{DeviceProfile, KeySystem};
use lane_session::SessionConfig;
use lane_storage::StorageMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Where the resume record is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Process memory; nothing survives a restart
    Memory,
    /// Single JSON file
    File,
}

/// Resume record storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend kind
    pub mode: StorageKind,
    /// Record file, used by the file backend
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageKind::File,
            path: PathBuf::from("./lanes-session.json"),
        }
    }
}

impl StorageConfig {
    /// Backend selection for `lane_storage::open_store`
    pub fn storage_mode(&self) -> StorageMode {
        match self.mode {
            StorageKind::Memory => StorageMode::InMemory,
            StorageKind::File => StorageMode::File {
                path: self.path.clone(),
            },
        }
    }
}

/// Session timing; durations in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Subtracted from the server heartbeat interval
    pub heartbeat_margin_ms: u64,
    /// Floor for the heartbeat period
    pub min_heartbeat_interval_ms: u64,
    /// Client-side timeout of one heartbeat request
    pub heartbeat_timeout_ms: u64,
    /// First reconnect delay
    pub reconnect_base_delay_ms: u64,
    /// Consecutive lane failures tolerated
    pub max_reconnect_attempts: u32,
    /// Protocol version tag
    pub protocol_version: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            heartbeat_margin_ms: defaults.heartbeat_safety_margin.as_millis() as u64,
            min_heartbeat_interval_ms: defaults.min_heartbeat_interval.as_millis() as u64,
            heartbeat_timeout_ms: defaults.heartbeat_timeout.as_millis() as u64,
            reconnect_base_delay_ms: defaults.reconnect_base_delay.as_millis() as u64,
            max_reconnect_attempts: defaults.max_reconnect_attempts,
            protocol_version: defaults.protocol_version,
        }
    }
}

impl SessionSettings {
    /// Session manager configuration
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat_safety_margin: Duration::from_millis(self.heartbeat_margin_ms),
            min_heartbeat_interval: Duration::from_millis(self.min_heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            protocol_version: self.protocol_version.clone(),
        }
    }
}

/// Lanes client configuration (matches the YAML structure)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LanesConfig {
    /// Application server base URL
    pub base_url: String,
    /// Wallet identity to open the session for
    pub wallet: Option<String>,
    /// Resume record storage
    pub storage: StorageConfig,
    /// Session timing
    pub session: SessionSettings,
    /// Device traits reported in the handshake
    pub device: DeviceProfile,
    /// Protected-media key systems available on this host
    pub key_systems: Vec<KeySystem>,
}

impl Default for LanesConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            wallet: None,
            storage: StorageConfig::default(),
            session: SessionSettings::default(),
            device: DeviceProfile::default(),
            key_systems: Vec::new(),
        }
    }
}

impl LanesConfig {
    /// Load configuration from file and environment variables.
    ///
    /// A missing file yields defaults; a file that does not parse is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: LanesConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config file {:?}", path));
            }
        };

        config.apply_environment_overrides();

        info!(
            "Final lanes configuration: base_url={}, wallet={:?}, storage={:?}, max_reconnect_attempts={}",
            config.base_url, config.wallet, config.storage.mode, config.session.max_reconnect_attempts
        );

        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base_url) = lookup("LANES_BASE_URL") {
            info!("Base URL overridden by environment: {}", base_url);
            self.base_url = base_url;
        }

        if let Some(wallet) = lookup("LANES_WALLET") {
            info!("Wallet overridden by environment: {}", wallet);
            self.wallet = Some(wallet).filter(|w| !w.is_empty());
        }

        if let Some(path) = lookup("LANES_STORAGE_PATH") {
            info!("Storage path overridden by environment: {}", path);
            self.storage.path = PathBuf::from(path);
        }

        if let Some(attempts) = lookup("LANES_MAX_RECONNECT_ATTEMPTS") {
            match attempts.parse::<u32>() {
                Ok(attempts) => {
                    self.session.max_reconnect_attempts = attempts;
                    info!("Max reconnect attempts overridden by environment: {}", attempts);
                }
                Err(_) => warn!(
                    "Ignoring invalid LANES_MAX_RECONNECT_ATTEMPTS value {:?}",
                    attempts
                ),
            }
        }
    }
}
