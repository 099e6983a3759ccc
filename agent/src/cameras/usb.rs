//! USB camera driver backed by OpenCV `VideoCapture`.
//!
//! Opens a local video device by path or index, applies resolution, frame
//! rate and exposure hints best-effort, and discards early warm-up frames
//! which many UVC sensors deliver under- or over-exposed.

use std::path::Path;
use std::time::Duration;

use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};
use serde_json::json;

use super::{DriverTuning, Frame};
use crate::config::CameraSpec;
use crate::error::CaptureError;

pub struct UsbCamera {
    camera_id: String,
    device_path: Option<String>,
    device_index: Option<i32>,
    resolution: [i32; 2],
    fps: i32,
    buffer_size: i32,
    auto_exposure: bool,
    brightness: Option<f64>,
    contrast: Option<f64>,
    saturation: Option<f64>,
    init_wait: Duration,
    warmup_frames: u32,
    reconnect_delay: Duration,
    cap: Option<VideoCapture>,
}

impl UsbCamera {
    pub fn new(spec: &CameraSpec, tuning: &DriverTuning) -> Self {
        Self {
            camera_id: spec.id.clone(),
            device_path: spec.device_path.clone(),
            device_index: spec.device_index,
            resolution: spec.resolution,
            fps: spec.fps,
            buffer_size: spec.buffer_size,
            auto_exposure: spec.auto_exposure,
            brightness: spec.brightness,
            contrast: spec.contrast,
            saturation: spec.saturation,
            init_wait: tuning.init_wait,
            warmup_frames: tuning.warmup_frames,
            reconnect_delay: tuning.reconnect_delay,
            cap: None,
        }
    }

    fn device_label(&self) -> String {
        match (&self.device_path, self.device_index) {
            (Some(path), _) => path.clone(),
            (None, Some(idx)) => format!("index {}", idx),
            (None, None) => "/dev/video0".to_string(),
        }
    }

    pub fn setup(&mut self) -> Result<(), CaptureError> {
        tracing::info!(
            "Camera {}: initializing USB device at {}",
            self.camera_id,
            self.device_label()
        );

        let mut cap = match (&self.device_path, self.device_index) {
            (Some(path), _) => {
                if !Path::new(path).exists() {
                    return Err(CaptureError::DeviceNotFound(path.clone()));
                }
                VideoCapture::from_file(path, videoio::CAP_V4L2)?
            }
            (None, Some(idx)) => VideoCapture::new(idx, videoio::CAP_ANY)?,
            (None, None) => {
                let default = "/dev/video0";
                if Path::new(default).exists() {
                    VideoCapture::from_file(default, videoio::CAP_V4L2)?
                } else {
                    VideoCapture::new(0, videoio::CAP_ANY)?
                }
            }
        };

        if !cap.is_opened()? {
            // The node exists but the backend refused it: another process
            // most likely holds the device.
            return match &self.device_path {
                Some(path) if Path::new(path).exists() => {
                    Err(CaptureError::DeviceBusy(path.clone()))
                }
                _ => Err(CaptureError::DeviceNotFound(self.device_label())),
            };
        }

        let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, self.resolution[0] as f64);
        let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, self.resolution[1] as f64);
        let _ = cap.set(videoio::CAP_PROP_FPS, self.fps as f64);
        let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, self.buffer_size as f64);

        if !self.auto_exposure {
            let _ = cap.set(videoio::CAP_PROP_AUTO_EXPOSURE, 0.25);
        }
        if let Some(v) = self.brightness {
            let _ = cap.set(videoio::CAP_PROP_BRIGHTNESS, v);
        }
        if let Some(v) = self.contrast {
            let _ = cap.set(videoio::CAP_PROP_CONTRAST, v);
        }
        if let Some(v) = self.saturation {
            let _ = cap.set(videoio::CAP_PROP_SATURATION, v);
        }

        std::thread::sleep(self.init_wait);

        // Sensors need a few reads before exposure settles.
        let mut scratch = Mat::default();
        for _ in 0..self.warmup_frames {
            let _ = cap.read(&mut scratch);
        }

        let mut test = Mat::default();
        if !cap.read(&mut test)? || test.empty() {
            return Err(CaptureError::EmptyFrame);
        }

        let width = cap.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0) as i32;
        let height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0) as i32;
        let fps = cap.get(videoio::CAP_PROP_FPS).unwrap_or(0.0);
        tracing::info!(
            "Camera {}: USB device ready at {}x{} @ {:.1}fps",
            self.camera_id,
            width,
            height,
            fps
        );

        self.cap = Some(cap);
        Ok(())
    }

    pub fn capture_frame(&mut self) -> Result<Frame, CaptureError> {
        let cap = self.cap.as_mut().ok_or(CaptureError::NotConnected)?;
        let mut mat = Mat::default();
        if !cap.read(&mut mat)? || mat.empty() {
            return Err(CaptureError::EmptyFrame);
        }
        Ok(Frame::new(mat))
    }

    pub fn reconnect(&mut self) -> Result<(), CaptureError> {
        self.cleanup();
        std::thread::sleep(self.reconnect_delay);
        self.setup()
    }

    pub fn cleanup(&mut self) {
        if let Some(mut cap) = self.cap.take() {
            let _ = cap.release();
        }
    }

    pub fn describe(&self) -> serde_json::Value {
        let mut info = json!({
            "type": "usb",
            "device": self.device_label(),
            "resolution": self.resolution,
            "fps": self.fps,
            "auto_exposure": self.auto_exposure,
            "connected": self.cap.is_some(),
        });
        if let Some(cap) = &self.cap {
            if let (Ok(w), Ok(h)) = (
                cap.get(videoio::CAP_PROP_FRAME_WIDTH),
                cap.get(videoio::CAP_PROP_FRAME_HEIGHT),
            ) {
                info["actual_resolution"] = json!([w as i32, h as i32]);
            }
        }
        info
    }
}
