//! Capability negotiation.
//!
//! [`negotiate`] is a pure derivation from a [`DeviceCapabilities`] snapshot.
//! [`CapabilityNegotiator`] owns the probes, the latest snapshot and the
//! memoized result for one session manager.

use crate::device::{
    CodecSupport, ContainerSupport, DeviceCapabilities, DeviceProbe, DocumentSupport, EffectiveType,
};
use crate::protected::{
    probe_protected_media, KeySystem, KeySystemProbe, ProtectedMediaCapabilities,
};
use serde::{Serialize, Serializer};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Screen width at or above which 4K is recommended
const UHD_MIN_WIDTH: u32 = 3840;
/// Screen width at or above which 1080p is recommended
const FULL_HD_MIN_WIDTH: u32 = 1920;

/// Preferred video delivery format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    /// HTTP Live Streaming
    Hls,
    /// MPEG-DASH
    Dash,
    /// Progressive MP4
    Mp4,
}

/// Preferred protected-media system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrmPreference {
    /// Use this key system
    KeySystem(KeySystem),
    /// No supported key system
    None,
}

impl DrmPreference {
    /// Wire identifier, `"none"` when no key system is usable
    pub fn as_str(&self) -> &'static str {
        match self {
            DrmPreference::KeySystem(system) => system.as_str(),
            DrmPreference::None => "none",
        }
    }
}

impl Serialize for DrmPreference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Recommended playback quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Quality {
    /// 480p, forced by data saving or 2G-class links
    #[serde(rename = "480p")]
    P480,
    /// 720p, for 3G-class links
    #[serde(rename = "720p")]
    P720,
    /// 1080p, for full-HD screens
    #[serde(rename = "1080p")]
    P1080,
    /// 4K, for UHD screens
    #[serde(rename = "4k")]
    UltraHd4k,
    /// Let the player adapt
    #[serde(rename = "auto")]
    Auto,
}

/// Derived media/DRM/quality preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiatedCapabilities {
    /// Preferred video format
    pub video_format: VideoFormat,
    /// Preferred protected-media system
    pub drm: DrmPreference,
    /// Recommended quality tier
    pub recommended_quality: Quality,
    /// Audio codec support, passed through
    pub audio: CodecSupport,
    /// Document support, passed through
    pub documents: DocumentSupport,
}

/// Derive negotiated preferences from a device snapshot.
///
/// Unknown protected-media support is treated as unsupported.
pub fn negotiate(device: &DeviceCapabilities) -> NegotiatedCapabilities {
    let video_format = if device.containers.contains(ContainerSupport::HLS) {
        VideoFormat::Hls
    } else if device.containers.contains(ContainerSupport::DASH) {
        VideoFormat::Dash
    } else {
        VideoFormat::Mp4
    };

    let drm = device
        .protected_media
        .and_then(|media| media.preferred())
        .map_or(DrmPreference::None, DrmPreference::KeySystem);

    NegotiatedCapabilities {
        video_format,
        drm,
        recommended_quality: recommend_quality(device),
        audio: device.codecs,
        documents: device.documents,
    }
}

fn recommend_quality(device: &DeviceCapabilities) -> Quality {
    let network = &device.network;
    if network.save_data || network.effective_type.is_some_and(|t| t.is_2g_class()) {
        return Quality::P480;
    }
    if network.effective_type == Some(EffectiveType::ThreeG) {
        return Quality::P720;
    }
    match device.screen.width {
        w if w >= UHD_MIN_WIDTH => Quality::UltraHd4k,
        w if w >= FULL_HD_MIN_WIDTH => Quality::P1080,
        _ => Quality::Auto,
    }
}

#[derive(Default)]
struct NegotiatorState {
    device: Option<DeviceCapabilities>,
    negotiated: Option<NegotiatedCapabilities>,
}

/// Owns capability probes and the memoized negotiation result
pub struct CapabilityNegotiator {
    probe: Arc<dyn DeviceProbe>,
    key_systems: Option<Arc<dyn KeySystemProbe>>,
    state: Mutex<NegotiatorState>,
}

impl CapabilityNegotiator {
    /// Create a negotiator without a key-system probe
    pub fn new(probe: Arc<dyn DeviceProbe>) -> Self {
        Self {
            probe,
            key_systems: None,
            state: Mutex::new(NegotiatorState::default()),
        }
    }

    /// Attach a key-system probe used by [`refine_protected_media`](Self::refine_protected_media)
    pub fn with_key_systems(mut self, probe: Arc<dyn KeySystemProbe>) -> Self {
        self.key_systems = Some(probe);
        self
    }

    fn state(&self) -> MutexGuard<'_, NegotiatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a fresh device snapshot.
    ///
    /// Protected-media results from an earlier refinement are carried over.
    pub fn detect_device_capabilities(&self) -> DeviceCapabilities {
        let mut snapshot = self.probe.detect();
        let mut state = self.state();
        if let Some(previous) = state.device.as_ref().and_then(|d| d.protected_media) {
            snapshot.protected_media = Some(previous);
        }
        state.device = Some(snapshot.clone());
        snapshot
    }

    /// Negotiate preferences, computing them on first use
    pub fn negotiate_capabilities(&self) -> NegotiatedCapabilities {
        let memo = self.state().negotiated.clone();
        if let Some(negotiated) = memo {
            return negotiated;
        }

        let stored = self.state().device.clone();
        let device = match stored {
            Some(device) => device,
            None => self.detect_device_capabilities(),
        };
        let negotiated = negotiate(&device);
        info!(
            "Negotiated capabilities: video={:?} drm={} quality={:?}",
            negotiated.video_format,
            negotiated.drm.as_str(),
            negotiated.recommended_quality
        );

        self.state().negotiated = Some(negotiated.clone());
        negotiated
    }

    /// Memoized negotiation result, `None` before the first negotiation
    pub fn negotiated(&self) -> Option<NegotiatedCapabilities> {
        self.state().negotiated.clone()
    }

    /// Latest device snapshot, if one was taken
    pub fn device_capabilities(&self) -> Option<DeviceCapabilities> {
        self.state().device.clone()
    }

    /// Run the asynchronous key-system probe and merge its result.
    ///
    /// Updates the stored snapshot and, if a negotiation was already memoized,
    /// re-derives it so the DRM preference reflects the probe.
    pub async fn refine_protected_media(&self) -> ProtectedMediaCapabilities {
        let media = match &self.key_systems {
            Some(probe) => probe_protected_media(probe.as_ref()).await,
            None => ProtectedMediaCapabilities::default(),
        };

        let mut state = self.state();
        let device = match state.device.take() {
            Some(device) => device,
            None => self.probe.detect(),
        };
        let refined = DeviceCapabilities {
            protected_media: Some(media),
            ..device
        };
        if state.negotiated.is_some() {
            state.negotiated = Some(negotiate(&refined));
        }
        state.device = Some(refined);
        debug!("Protected media refined: {:?}", media.supported);

        media
    }

    /// Drop the stored snapshot and memoized result
    pub fn reset(&self) {
        *self.state() = NegotiatorState::default();
    }
}
