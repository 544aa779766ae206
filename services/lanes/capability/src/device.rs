//! Device capability snapshot and probing.

use crate::protected::ProtectedMediaCapabilities;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Screen geometry and input traits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScreenInfo {
    /// Width in logical pixels
    pub width: u32,
    /// Height in logical pixels
    pub height: u32,
    /// Physical pixels per logical pixel
    pub pixel_ratio: f64,
    /// Whether touch input is available
    pub touch: bool,
}

impl Default for ScreenInfo {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            pixel_ratio: 1.0,
            touch: false,
        }
    }
}

/// Effective connection class reported by the network layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectiveType {
    /// Slower than 2G
    #[serde(rename = "slow-2g")]
    Slow2g,
    /// 2G-class link
    #[serde(rename = "2g")]
    TwoG,
    /// 3G-class link
    #[serde(rename = "3g")]
    ThreeG,
    /// 4G-class link or better
    #[serde(rename = "4g")]
    FourG,
}

impl EffectiveType {
    /// Whether this is a 2G-class (or slower) link
    pub fn is_2g_class(self) -> bool {
        matches!(self, EffectiveType::Slow2g | EffectiveType::TwoG)
    }
}

/// Network hints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkHints {
    /// Effective connection class, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_type: Option<EffectiveType>,
    /// Estimated downlink bandwidth in Mbit/s
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downlink_mbps: Option<f64>,
    /// Estimated round-trip time in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_ms: Option<u32>,
    /// User asked for reduced data usage
    pub save_data: bool,
}

bitflags! {
    /// Supported streaming-container families
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ContainerSupport: u8 {
        /// HTTP Live Streaming
        const HLS = 1 << 0;
        /// MPEG-DASH
        const DASH = 1 << 1;
        /// Progressive MP4
        const MP4 = 1 << 2;
    }
}

/// Audio codec support flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecSupport {
    /// AAC
    pub aac: bool,
    /// Opus
    pub opus: bool,
    /// FLAC
    pub flac: bool,
}

impl Default for CodecSupport {
    fn default() -> Self {
        Self {
            aac: true,
            opus: true,
            flac: false,
        }
    }
}

/// Document format support flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentSupport {
    /// PDF rendering
    pub pdf: bool,
    /// EPUB rendering
    pub epub: bool,
}

impl Default for DocumentSupport {
    fn default() -> Self {
        Self {
            pdf: true,
            epub: false,
        }
    }
}

/// Immutable snapshot of device traits.
///
/// `protected_media` is `None` until the asynchronous key-system probe has
/// run; treat it as unknown, not as "nothing supported".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapabilities {
    /// Screen geometry
    pub screen: ScreenInfo,
    /// Network hints
    pub network: NetworkHints,
    /// Logical CPU count, where exposed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_concurrency: Option<u32>,
    /// Device memory in GiB, where exposed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_memory_gb: Option<f64>,
    /// Graphics renderer identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_renderer: Option<String>,
    /// Streaming-container support
    pub containers: ContainerSupport,
    /// Protected-media key systems, once probed
    pub protected_media: Option<ProtectedMediaCapabilities>,
    /// Audio codec support
    pub codecs: CodecSupport,
    /// Document format support
    pub documents: DocumentSupport,
}

/// Synchronous source of device capability snapshots
pub trait DeviceProbe: Send + Sync {
    /// Take a snapshot of the device traits
    fn detect(&self) -> DeviceCapabilities;
}

/// Configured device traits for hosts that cannot introspect them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceProfile {
    /// Screen geometry
    pub screen: ScreenInfo,
    /// Network hints
    pub network: NetworkHints,
    /// Logical CPU count; detected from the host when unset
    pub hardware_concurrency: Option<u32>,
    /// Device memory in GiB
    pub device_memory_gb: Option<f64>,
    /// Graphics renderer identifier
    pub gpu_renderer: Option<String>,
    /// Streaming-container support
    pub containers: ContainerSupport,
    /// Audio codec support
    pub codecs: CodecSupport,
    /// Document format support
    pub documents: DocumentSupport,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            screen: ScreenInfo::default(),
            network: NetworkHints::default(),
            hardware_concurrency: None,
            device_memory_gb: None,
            gpu_renderer: None,
            containers: ContainerSupport::all(),
            codecs: CodecSupport::default(),
            documents: DocumentSupport::default(),
        }
    }
}

/// Probe backed by a [`DeviceProfile`] plus host introspection
#[derive(Debug, Clone, Default)]
pub struct HostProbe {
    profile: DeviceProfile,
}

impl HostProbe {
    /// Create a probe for the given profile
    pub fn new(profile: DeviceProfile) -> Self {
        Self { profile }
    }
}

impl DeviceProbe for HostProbe {
    fn detect(&self) -> DeviceCapabilities {
        let hardware_concurrency = self.profile.hardware_concurrency.or_else(|| {
            std::thread::available_parallelism()
                .ok()
                .map(|n| n.get() as u32)
        });

        debug!(
            "Detected device: {}x{} @{}x, {:?} cpus, containers {:?}",
            self.profile.screen.width,
            self.profile.screen.height,
            self.profile.screen.pixel_ratio,
            hardware_concurrency,
            self.profile.containers
        );

        DeviceCapabilities {
            screen: self.profile.screen.clone(),
            network: self.profile.network.clone(),
            hardware_concurrency,
            device_memory_gb: self.profile.device_memory_gb,
            gpu_renderer: self.profile.gpu_renderer.clone(),
            containers: self.profile.containers,
            protected_media: None,
            codecs: self.profile.codecs,
            documents: self.profile.documents,
        }
    }
}
