//! Protected-media (DRM) key-system probing.
//!
//! Key-system support can only be answered asynchronously, so it is kept
//! out of the synchronous device snapshot and merged in afterwards.

use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Protected-media key systems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeySystem {
    /// Google Widevine
    #[serde(rename = "com.widevine.alpha")]
    Widevine,
    /// Microsoft PlayReady
    #[serde(rename = "com.microsoft.playready")]
    PlayReady,
    /// Apple FairPlay
    #[serde(rename = "com.apple.fps")]
    FairPlay,
    /// W3C Clear Key
    #[serde(rename = "org.w3.clearkey")]
    ClearKey,
}

impl KeySystem {
    /// Key systems in negotiation preference order
    pub const PREFERENCE: [KeySystem; 4] = [
        KeySystem::Widevine,
        KeySystem::PlayReady,
        KeySystem::FairPlay,
        KeySystem::ClearKey,
    ];

    /// Key-system identifier string
    pub fn as_str(self) -> &'static str {
        match self {
            KeySystem::Widevine => "com.widevine.alpha",
            KeySystem::PlayReady => "com.microsoft.playready",
            KeySystem::FairPlay => "com.apple.fps",
            KeySystem::ClearKey => "org.w3.clearkey",
        }
    }

    fn flag(self) -> KeySystemSet {
        match self {
            KeySystem::Widevine => KeySystemSet::WIDEVINE,
            KeySystem::PlayReady => KeySystemSet::PLAYREADY,
            KeySystem::FairPlay => KeySystemSet::FAIRPLAY,
            KeySystem::ClearKey => KeySystemSet::CLEARKEY,
        }
    }
}

bitflags! {
    /// Set of supported key systems
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct KeySystemSet: u8 {
        /// Google Widevine
        const WIDEVINE = 1 << 0;
        /// Microsoft PlayReady
        const PLAYREADY = 1 << 1;
        /// Apple FairPlay
        const FAIRPLAY = 1 << 2;
        /// W3C Clear Key
        const CLEARKEY = 1 << 3;
    }
}

/// Result of the asynchronous key-system probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProtectedMediaCapabilities {
    /// Supported key systems
    pub supported: KeySystemSet,
}

impl ProtectedMediaCapabilities {
    /// Whether a key system is supported
    pub fn supports(&self, system: KeySystem) -> bool {
        self.supported.contains(system.flag())
    }

    /// First supported key system in preference order
    pub fn preferred(&self) -> Option<KeySystem> {
        KeySystem::PREFERENCE
            .into_iter()
            .find(|system| self.supports(*system))
    }
}

/// Asynchronous key-system support check
#[async_trait]
pub trait KeySystemProbe: Send + Sync {
    /// Whether the platform can play content protected by `system`
    async fn supports(&self, system: KeySystem) -> bool;
}

/// Probe answering from a fixed set
#[derive(Debug, Clone, Default)]
pub struct StaticKeySystemProbe {
    supported: KeySystemSet,
}

impl StaticKeySystemProbe {
    /// Create a probe that reports the given systems as supported
    pub fn new(systems: impl IntoIterator<Item = KeySystem>) -> Self {
        let supported = systems
            .into_iter()
            .fold(KeySystemSet::empty(), |set, system| set | system.flag());
        Self { supported }
    }
}

#[async_trait]
impl KeySystemProbe for StaticKeySystemProbe {
    async fn supports(&self, system: KeySystem) -> bool {
        self.supported.contains(system.flag())
    }
}

/// Query every known key system
pub async fn probe_protected_media(probe: &dyn KeySystemProbe) -> ProtectedMediaCapabilities {
    let mut supported = KeySystemSet::empty();
    for system in KeySystem::PREFERENCE {
        if probe.supports(system).await {
            supported |= system.flag();
        }
    }
    debug!("Protected media probe finished: {:?}", supported);
    ProtectedMediaCapabilities { supported }
}
