//! Capture configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::DEFAULT_BUFFER_COUNT;
use crate::error::CaptureError;
use crate::format::{DeviceFormat, FieldOrder, FrameInterval, PixelFormat};

/// Capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device path (e.g., "/dev/video0")
    pub device: PathBuf,
    /// Capture width
    pub width: u32,
    /// Capture height
    pub height: u32,
    /// FourCC of the requested encoding
    pub pixel_format: PixelFormat,
    pub field: FieldOrder,
    /// Target time per frame
    pub frame_interval: FrameInterval,
    /// Buffers requested from the driver
    pub buffer_count: u32,
    /// Bound on one readiness wait (milliseconds)
    pub poll_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            width: 1280,
            height: 720,
            pixel_format: PixelFormat::H264,
            field: FieldOrder::Any,
            frame_interval: FrameInterval::from_fps(30),
            buffer_count: DEFAULT_BUFFER_COUNT,
            poll_timeout_ms: 1000,
        }
    }
}

impl CaptureConfig {
    /// Default H.264 capture from `device`
    pub fn for_device(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::Config(format!(
                "resolution must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.frame_interval.numerator == 0 || self.frame_interval.denominator == 0 {
            return Err(CaptureError::Config(format!(
                "frame interval must be a non-zero fraction, got {}",
                self.frame_interval
            )));
        }
        if self.buffer_count == 0 {
            return Err(CaptureError::Config("buffer count must be at least 1".into()));
        }
        if self.poll_timeout_ms == 0 {
            return Err(CaptureError::Config("poll timeout must be non-zero".into()));
        }
        Ok(())
    }

    pub fn device_format(&self) -> DeviceFormat {
        DeviceFormat {
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
            field: self.field,
            interval: self.frame_interval,
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}
