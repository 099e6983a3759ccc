//! Captured frame wrapper: validation, timestamp overlay, JPEG codec.

use chrono::{DateTime, Utc};
use opencv::core::{self, Mat, Point, Scalar, Vector};
use opencv::prelude::*;
use opencv::{imgcodecs, imgproc};

use crate::error::CaptureError;

/// Brightness warning bounds on the 8-bit scale. Strict comparisons: a mean
/// of exactly 5 or 250 is silent, frames outside warn but are still accepted
/// (night and overexposed scenes remain useful for training).
pub const LOW_BRIGHTNESS: f64 = 5.0;
pub const HIGH_BRIGHTNESS: f64 = 250.0;

/// One decoded frame plus its capture instant.
pub struct Frame {
    pub mat: Mat,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(mat: Mat) -> Self {
        Self {
            mat,
            captured_at: Utc::now(),
        }
    }

    /// Decode a JPEG byte buffer (ONVIF snapshots arrive this way).
    pub fn from_jpeg(data: &[u8]) -> Result<Self, CaptureError> {
        if data.is_empty() {
            return Err(CaptureError::EmptyFrame);
        }
        let buf = Vector::<u8>::from_slice(data);
        let mat = imgcodecs::imdecode(&buf, imgcodecs::IMREAD_COLOR)?;
        if mat.empty() {
            return Err(CaptureError::Decode("not a decodable image".to_string()));
        }
        Ok(Self::new(mat))
    }

    pub fn width(&self) -> i32 {
        self.mat.cols()
    }

    pub fn height(&self) -> i32 {
        self.mat.rows()
    }

    /// Mean luminance over all pixels and channels.
    pub fn mean_brightness(&self) -> Result<f64, CaptureError> {
        let means = core::mean(&self.mat, &core::no_array())?;
        let channels = self.mat.channels().clamp(1, 4) as usize;
        let sum: f64 = means.0.iter().take(channels).sum();
        Ok(sum / channels as f64)
    }

    /// Reject unusable frames, warn on suspicious brightness.
    ///
    /// Returns the mean brightness so it can be recorded in the sidecar.
    pub fn validate(&self, camera_id: &str) -> Result<f64, CaptureError> {
        if self.mat.empty() {
            return Err(CaptureError::EmptyFrame);
        }
        if self.width() <= 0 || self.height() <= 0 {
            return Err(CaptureError::Decode("zero-sized frame".to_string()));
        }
        let brightness = self.mean_brightness()?;
        if brightness < LOW_BRIGHTNESS {
            tracing::warn!(
                "Camera {}: low brightness frame (mean={:.1}), possible low light",
                camera_id,
                brightness
            );
        } else if brightness > HIGH_BRIGHTNESS {
            tracing::warn!(
                "Camera {}: high brightness frame (mean={:.1}), possible overexposure",
                camera_id,
                brightness
            );
        }
        Ok(brightness)
    }

    /// Burn the capture timestamp and camera id into the frame's top-left corner.
    pub fn annotate(&mut self, camera_id: &str) -> Result<(), CaptureError> {
        let label = format!(
            "{} {}",
            camera_id,
            self.captured_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        imgproc::put_text(
            &mut self.mat,
            &label,
            Point::new(10, 30),
            imgproc::FONT_HERSHEY_SIMPLEX,
            1.0,
            Scalar::new(0.0, 255.0, 0.0, 0.0),
            2,
            imgproc::LINE_8,
            false,
        )?;
        Ok(())
    }

    /// Encode to JPEG at the configured quality.
    pub fn encode_jpeg(&self, quality: i32) -> Result<Vec<u8>, CaptureError> {
        let params = Vector::from_iter([imgcodecs::IMWRITE_JPEG_QUALITY, quality.clamp(1, 100)]);
        let mut buf: Vector<u8> = Vector::new();
        imgcodecs::imencode(".jpg", &self.mat, &mut buf, &params)?;
        Ok(buf.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::CV_8UC3;

    fn solid_frame(value: f64) -> Frame {
        let mat = Mat::new_rows_cols_with_default(
            48,
            64,
            CV_8UC3,
            Scalar::new(value, value, value, 0.0),
        )
        .unwrap();
        Frame::new(mat)
    }

    #[test]
    fn mean_brightness_of_solid_frame() {
        let f = solid_frame(128.0);
        let b = f.mean_brightness().unwrap();
        assert!((b - 128.0).abs() < 0.5, "got {}", b);
    }

    #[test]
    fn boundary_brightness_values_accepted() {
        // Exactly 5 and exactly 250 must pass without rejection.
        for v in [5.0, 250.0, 0.0, 255.0] {
            let f = solid_frame(v);
            assert!(f.validate("cam1").is_ok(), "value {} rejected", v);
        }
    }

    #[test]
    fn empty_frame_rejected() {
        let f = Frame::new(Mat::default());
        assert!(matches!(f.validate("cam1"), Err(CaptureError::EmptyFrame)));
    }

    #[test]
    fn jpeg_roundtrip_preserves_dimensions() {
        let f = solid_frame(90.0);
        let jpeg = f.encode_jpeg(85).unwrap();
        assert!(!jpeg.is_empty());
        let decoded = Frame::from_jpeg(&jpeg).unwrap();
        assert_eq!(decoded.width(), 64);
        assert_eq!(decoded.height(), 48);
    }

    #[test]
    fn garbage_bytes_fail_decode() {
        assert!(Frame::from_jpeg(&[0u8; 16]).is_err());
        assert!(matches!(
            Frame::from_jpeg(&[]),
            Err(CaptureError::EmptyFrame)
        ));
    }

    #[test]
    fn annotate_writes_into_frame() {
        let mut f = solid_frame(0.0);
        let before = f.mean_brightness().unwrap();
        f.annotate("cam1").unwrap();
        let after = f.mean_brightness().unwrap();
        assert!(after > before, "overlay should brighten a black frame");
    }
}
