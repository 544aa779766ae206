//! Device capability detection and media/DRM/quality negotiation.
//!
//! Detection happens in two phases:
//!
//! 1. A synchronous [`DeviceCapabilities`] snapshot from a [`DeviceProbe`]
//!    (screen, network hints, hardware, container and codec support). Its
//!    protected-media field starts out unknown.
//! 2. An asynchronous [`ProtectedMediaCapabilities`] refinement from a
//!    [`KeySystemProbe`], merged into the snapshot when it completes.
//!
//! [`negotiate`] turns a snapshot into [`NegotiatedCapabilities`]; the
//! [`CapabilityNegotiator`] memoizes that result per owner instead of
//! keeping process-wide caches.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod negotiate;
pub mod protected;

// Re-export main types
pub use device::{
    CodecSupport, ContainerSupport, DeviceCapabilities, DeviceProbe, DeviceProfile,
    DocumentSupport, EffectiveType, HostProbe, NetworkHints, ScreenInfo,
};
pub use negotiate::{
    negotiate, CapabilityNegotiator, DrmPreference, NegotiatedCapabilities, Quality, VideoFormat,
};
pub use protected::{
    probe_protected_media, KeySystem, KeySystemProbe, KeySystemSet, ProtectedMediaCapabilities,
    StaticKeySystemProbe,
};
