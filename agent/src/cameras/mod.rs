//! Camera drivers: frame acquisition over USB, RTSP and ONVIF.
//!
//! The capability set is closed and known at compile time, so dispatch is a
//! plain enum rather than trait objects. All drivers are synchronous; they
//! run inside blocking capture workers.

pub mod frame;
pub mod onvif;
pub mod rtsp;
pub mod tracker;
pub mod usb;

use std::time::Duration;

use crate::config::{AdvancedConfig, CameraKind, CameraSpec};
use crate::error::CaptureError;

pub use frame::Frame;
pub use onvif::OnvifCamera;
pub use rtsp::RtspCamera;
pub use tracker::{CameraState, CameraStateTracker, TrackerStatus};
pub use usb::UsbCamera;

/// Driver knobs shared by all camera kinds, lifted out of the `advanced`
/// config section.
#[derive(Debug, Clone)]
pub struct DriverTuning {
    /// Settle time after opening a device.
    pub init_wait: Duration,
    /// Frames discarded after opening a USB device.
    pub warmup_frames: u32,
    /// Pause between reconnect attempts.
    pub reconnect_delay: Duration,
}

impl From<&AdvancedConfig> for DriverTuning {
    fn from(cfg: &AdvancedConfig) -> Self {
        Self {
            init_wait: Duration::from_secs(cfg.camera_init_wait),
            warmup_frames: cfg.warmup_frames,
            reconnect_delay: Duration::from_secs(cfg.reconnect_delay),
        }
    }
}

/// Closed set of camera drivers.
pub enum CameraDriver {
    Usb(UsbCamera),
    Rtsp(RtspCamera),
    Onvif(OnvifCamera),
}

impl CameraDriver {
    /// Build the driver for a spec. No I/O happens until [`setup`](Self::setup).
    pub fn open(spec: &CameraSpec, tuning: &DriverTuning) -> Self {
        match spec.kind {
            CameraKind::Usb => Self::Usb(UsbCamera::new(spec, tuning)),
            CameraKind::Rtsp => Self::Rtsp(RtspCamera::new(spec, tuning)),
            CameraKind::Onvif => Self::Onvif(OnvifCamera::new(spec, tuning)),
        }
    }

    pub fn kind(&self) -> CameraKind {
        match self {
            Self::Usb(_) => CameraKind::Usb,
            Self::Rtsp(_) => CameraKind::Rtsp,
            Self::Onvif(_) => CameraKind::Onvif,
        }
    }

    /// Connect to the device and make it ready for capture.
    pub fn setup(&mut self) -> Result<(), CaptureError> {
        match self {
            Self::Usb(c) => c.setup(),
            Self::Rtsp(c) => c.setup(),
            Self::Onvif(c) => c.setup(),
        }
    }

    /// Capture one frame.
    pub fn capture_frame(&mut self) -> Result<Frame, CaptureError> {
        match self {
            Self::Usb(c) => c.capture_frame(),
            Self::Rtsp(c) => c.capture_frame(),
            Self::Onvif(c) => c.capture_frame(),
        }
    }

    /// Whether the driver has a useful between-captures keep-alive.
    pub fn supports_keep_alive(&self) -> bool {
        matches!(self, Self::Rtsp(_))
    }

    /// Keep the transport session warm without decoding a frame. Only the
    /// RTSP driver does anything here; failures are swallowed because the
    /// next scheduled capture surfaces them properly.
    pub fn keep_alive(&mut self) {
        if let Self::Rtsp(c) = self {
            c.keep_alive();
        }
    }

    /// Tear down and re-establish the connection once.
    pub fn reconnect(&mut self) -> Result<(), CaptureError> {
        match self {
            Self::Usb(c) => c.reconnect(),
            Self::Rtsp(c) => c.reconnect(),
            Self::Onvif(c) => c.reconnect(),
        }
    }

    /// Release device handles.
    pub fn cleanup(&mut self) {
        match self {
            Self::Usb(c) => c.cleanup(),
            Self::Rtsp(c) => c.cleanup(),
            Self::Onvif(c) => c.cleanup(),
        }
    }

    /// Connection parameters and live properties for the metadata sidecar.
    pub fn describe(&self) -> serde_json::Value {
        match self {
            Self::Usb(c) => c.describe(),
            Self::Rtsp(c) => c.describe(),
            Self::Onvif(c) => c.describe(),
        }
    }
}
