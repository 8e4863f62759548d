//! Capture format types and negotiation

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use v4l::v4l_sys::{
    v4l2_field_V4L2_FIELD_ALTERNATE, v4l2_field_V4L2_FIELD_ANY, v4l2_field_V4L2_FIELD_BOTTOM,
    v4l2_field_V4L2_FIELD_INTERLACED, v4l2_field_V4L2_FIELD_INTERLACED_BT,
    v4l2_field_V4L2_FIELD_INTERLACED_TB, v4l2_field_V4L2_FIELD_NONE,
    v4l2_field_V4L2_FIELD_SEQ_BT, v4l2_field_V4L2_FIELD_SEQ_TB, v4l2_field_V4L2_FIELD_TOP,
};
use v4l::FourCC;

use crate::device::{ControlChannel, StreamParams};
use crate::error::{CaptureError, NegotiationStep};

/// Pixel encoding identifier (V4L2 FourCC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PixelFormat([u8; 4]);

impl PixelFormat {
    /// H.264 elementary stream
    pub const H264: PixelFormat = PixelFormat(*b"H264");
    /// Motion JPEG
    pub const MJPEG: PixelFormat = PixelFormat(*b"MJPG");
    /// Packed YUV 4:2:2
    pub const YUYV: PixelFormat = PixelFormat(*b"YUYV");
    /// Semi-planar YUV 4:2:0
    pub const NV12: PixelFormat = PixelFormat(*b"NV12");

    /// From the little-endian code the driver reports
    pub fn from_fourcc(code: u32) -> Self {
        Self(FourCC::from(code).repr)
    }

    pub fn fourcc(self) -> u32 {
        u32::from(FourCC::new(&self.0))
    }

    /// Whether frames carry a compressed bitstream rather than raw pixels
    pub fn is_compressed(self) -> bool {
        self == Self::H264 || self == Self::MJPEG
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            let c = if byte.is_ascii_graphic() || byte == b' ' { byte as char } else { '.' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| format!("pixel format must be 4 characters, got {:?}", s))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for PixelFormat {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PixelFormat> for String {
    fn from(f: PixelFormat) -> Self {
        f.to_string()
    }
}

/// Field order of the captured images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOrder {
    /// Let the driver choose
    #[default]
    Any,
    /// Progressive
    None,
    Top,
    Bottom,
    Interlaced,
    /// Both fields sequential in one buffer, top first
    SeqTb,
    SeqBt,
    /// Fields in alternating buffers
    Alternate,
    InterlacedTb,
    InterlacedBt,
    /// Code reported by a driver newer than this crate
    #[serde(skip)]
    Other(u32),
}

impl FieldOrder {
    pub fn to_raw(self) -> u32 {
        match self {
            FieldOrder::Any => v4l2_field_V4L2_FIELD_ANY,
            FieldOrder::None => v4l2_field_V4L2_FIELD_NONE,
            FieldOrder::Top => v4l2_field_V4L2_FIELD_TOP,
            FieldOrder::Bottom => v4l2_field_V4L2_FIELD_BOTTOM,
            FieldOrder::Interlaced => v4l2_field_V4L2_FIELD_INTERLACED,
            FieldOrder::SeqTb => v4l2_field_V4L2_FIELD_SEQ_TB,
            FieldOrder::SeqBt => v4l2_field_V4L2_FIELD_SEQ_BT,
            FieldOrder::Alternate => v4l2_field_V4L2_FIELD_ALTERNATE,
            FieldOrder::InterlacedTb => v4l2_field_V4L2_FIELD_INTERLACED_TB,
            FieldOrder::InterlacedBt => v4l2_field_V4L2_FIELD_INTERLACED_BT,
            FieldOrder::Other(raw) => raw,
        }
    }

    pub fn from_raw(raw: u32) -> Self {
        match raw {
            v4l2_field_V4L2_FIELD_ANY => FieldOrder::Any,
            v4l2_field_V4L2_FIELD_NONE => FieldOrder::None,
            v4l2_field_V4L2_FIELD_TOP => FieldOrder::Top,
            v4l2_field_V4L2_FIELD_BOTTOM => FieldOrder::Bottom,
            v4l2_field_V4L2_FIELD_INTERLACED => FieldOrder::Interlaced,
            v4l2_field_V4L2_FIELD_SEQ_TB => FieldOrder::SeqTb,
            v4l2_field_V4L2_FIELD_SEQ_BT => FieldOrder::SeqBt,
            v4l2_field_V4L2_FIELD_ALTERNATE => FieldOrder::Alternate,
            v4l2_field_V4L2_FIELD_INTERLACED_TB => FieldOrder::InterlacedTb,
            v4l2_field_V4L2_FIELD_INTERLACED_BT => FieldOrder::InterlacedBt,
            other => FieldOrder::Other(other),
        }
    }
}

/// Time per frame as a fraction of a second
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInterval {
    pub numerator: u32,
    pub denominator: u32,
}

impl FrameInterval {
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self { numerator, denominator }
    }

    /// Interval for a whole number of frames per second
    pub const fn from_fps(fps: u32) -> Self {
        Self::new(1, fps)
    }

    /// Frames per second, `None` for a degenerate fraction
    pub fn fps(&self) -> Option<f64> {
        if self.numerator == 0 || self.denominator == 0 {
            return None;
        }
        Some(self.denominator as f64 / self.numerator as f64)
    }

    /// Length of one frame period, `None` for a degenerate fraction
    pub fn duration(&self) -> Option<Duration> {
        if self.denominator == 0 {
            return None;
        }
        Some(Duration::from_secs(self.numerator as u64) / self.denominator)
    }
}

impl Default for FrameInterval {
    fn default() -> Self {
        Self::from_fps(30)
    }
}

impl fmt::Display for FrameInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Image format as exchanged with the driver through S_FMT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub field: FieldOrder,
    /// Filled by the driver, 0 for compressed formats
    pub bytes_per_line: u32,
    /// Filled by the driver: upper bound of one frame in bytes
    pub size_image: u32,
}

/// Desired capture format: resolution, encoding, field order and frame interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub field: FieldOrder,
    pub interval: FrameInterval,
}

impl Default for DeviceFormat {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            pixel_format: PixelFormat::H264,
            field: FieldOrder::Any,
            interval: FrameInterval::from_fps(30),
        }
    }
}

impl DeviceFormat {
    fn image_request(&self) -> ImageFormat {
        ImageFormat {
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
            field: self.field,
            bytes_per_line: 0,
            size_image: 0,
        }
    }
}

/// Format committed by the driver.
///
/// Only [`FormatNegotiator::negotiate`] produces one, so holding it proves the
/// format was committed before buffers were requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub image: ImageFormat,
    pub interval: FrameInterval,
}

/// Applies a [`DeviceFormat`] to a device before streaming
#[derive(Debug, Clone)]
pub struct FormatNegotiator {
    desired: DeviceFormat,
}

impl FormatNegotiator {
    pub fn new(desired: DeviceFormat) -> Self {
        Self { desired }
    }

    pub fn desired(&self) -> &DeviceFormat {
        &self.desired
    }

    /// Commit the desired format.
    ///
    /// Order is fixed: read stream parameters, write the frame interval, then
    /// set the image format.
    pub fn negotiate<D: ControlChannel + ?Sized>(
        &self,
        device: &mut D,
    ) -> Result<NegotiatedFormat, CaptureError> {
        let current = device
            .get_stream_params()
            .map_err(|source| CaptureError::FormatNegotiation {
                step: NegotiationStep::GetStreamParams,
                source,
            })?;
        debug!(
            "Current frame interval {} (capability {:#x})",
            current.time_per_frame, current.capability
        );

        if !current.supports_frame_interval() {
            warn!("Driver does not advertise frame interval control, requesting anyway");
        }

        let requested = StreamParams {
            time_per_frame: self.desired.interval,
            ..current
        };
        let applied = device
            .set_stream_params(&requested)
            .map_err(|source| CaptureError::FormatNegotiation {
                step: NegotiationStep::SetStreamParams,
                source,
            })?;
        if applied.time_per_frame != self.desired.interval {
            warn!(
                "Driver adjusted frame interval {} -> {}",
                self.desired.interval, applied.time_per_frame
            );
        }

        let committed = device
            .set_format(&self.desired.image_request())
            .map_err(|source| CaptureError::FormatNegotiation {
                step: NegotiationStep::SetFormat,
                source,
            })?;

        if committed.pixel_format != self.desired.pixel_format {
            return Err(CaptureError::FormatRejected {
                requested: self.desired.pixel_format,
                offered: committed.pixel_format,
            });
        }
        if committed.width != self.desired.width || committed.height != self.desired.height {
            warn!(
                "Driver adjusted resolution {}x{} -> {}x{}",
                self.desired.width, self.desired.height, committed.width, committed.height
            );
        }

        info!(
            "Format committed: {}x{} {} field {:?} @ {}",
            committed.width,
            committed.height,
            committed.pixel_format,
            committed.field,
            applied.time_per_frame
        );

        Ok(NegotiatedFormat {
            image: committed,
            interval: applied.time_per_frame,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockEvent, MockFailure, MockOp, MockScript};

    #[test]
    fn test_pixel_format_display_and_parse() {
        assert_eq!(PixelFormat::H264.to_string(), "H264");
        assert_eq!("MJPG".parse::<PixelFormat>().unwrap(), PixelFormat::MJPEG);
        assert!("H26".parse::<PixelFormat>().is_err());
        assert!(PixelFormat::H264.is_compressed());
        assert!(!PixelFormat::YUYV.is_compressed());
    }

    #[test]
    fn test_pixel_format_fourcc_is_little_endian() {
        assert_eq!(PixelFormat::H264.fourcc(), 0x3436_3248);
        assert_eq!(PixelFormat::from_fourcc(0x4745_504a), "JPEG".parse().unwrap());
        assert_eq!(PixelFormat::from_fourcc(PixelFormat::NV12.fourcc()), PixelFormat::NV12);
    }

    #[test]
    fn test_field_order_raw_mapping() {
        for field in [
            FieldOrder::Any,
            FieldOrder::None,
            FieldOrder::Top,
            FieldOrder::Bottom,
            FieldOrder::Interlaced,
            FieldOrder::SeqTb,
            FieldOrder::SeqBt,
            FieldOrder::Alternate,
            FieldOrder::InterlacedTb,
            FieldOrder::InterlacedBt,
        ] {
            assert_eq!(FieldOrder::from_raw(field.to_raw()), field);
        }
    }

    #[test]
    fn test_unknown_field_code_is_kept() {
        let field = FieldOrder::from_raw(99);
        assert_eq!(field, FieldOrder::Other(99));
        assert_eq!(field.to_raw(), 99);
        assert_ne!(FieldOrder::from_raw(v4l2_field_V4L2_FIELD_SEQ_TB), FieldOrder::Any);
    }

    #[test]
    fn test_committed_field_order_is_reported() {
        let script = MockScript {
            committed_field: Some(FieldOrder::Alternate),
            ..Default::default()
        };
        let mut device = MockDevice::new(script);
        let format = FormatNegotiator::new(DeviceFormat::default())
            .negotiate(&mut device)
            .unwrap();
        assert_eq!(format.image.field, FieldOrder::Alternate);
    }

    #[test]
    fn test_frame_interval_fps() {
        assert_eq!(FrameInterval::from_fps(30).fps(), Some(30.0));
        assert_eq!(FrameInterval::new(1001, 30000).to_string(), "1001/30000");
        assert_eq!(FrameInterval::new(1, 0).fps(), None);
        assert_eq!(FrameInterval::from_fps(25).duration(), Some(Duration::from_millis(40)));
        assert_eq!(FrameInterval::new(1, 0).duration(), None);
    }

    #[test]
    fn test_negotiation_order() {
        let mut device = MockDevice::new(MockScript::default());
        let monitor = device.monitor();

        let format = FormatNegotiator::new(DeviceFormat::default())
            .negotiate(&mut device)
            .unwrap();
        assert_eq!(format.image.pixel_format, PixelFormat::H264);
        assert_eq!(format.interval, FrameInterval::from_fps(30));

        let events = monitor.events();
        assert!(matches!(events[0], MockEvent::GetStreamParams));
        assert!(matches!(events[1], MockEvent::SetStreamParams(i) if i == FrameInterval::from_fps(30)));
        assert!(matches!(events[2], MockEvent::SetFormat(f) if f.width == 1280 && f.height == 720));
    }

    #[test]
    fn test_negotiation_aborts_on_set_format_failure() {
        let script = MockScript {
            fail: Some(MockFailure::on(MockOp::SetFormat, libc::EBUSY)),
            ..Default::default()
        };
        let mut device = MockDevice::new(script);
        let monitor = device.monitor();

        let err = FormatNegotiator::new(DeviceFormat::default())
            .negotiate(&mut device)
            .unwrap_err();
        assert!(matches!(
            err,
            CaptureError::FormatNegotiation { step: NegotiationStep::SetFormat, .. }
        ));
        // the interval write already reached the driver
        assert!(monitor
            .events()
            .iter()
            .any(|e| matches!(e, MockEvent::SetStreamParams(_))));
    }

    #[test]
    fn test_negotiation_rejects_substituted_encoding() {
        let script = MockScript {
            substitute_pixel_format: Some(PixelFormat::YUYV),
            ..Default::default()
        };
        let mut device = MockDevice::new(script);

        let err = FormatNegotiator::new(DeviceFormat::default())
            .negotiate(&mut device)
            .unwrap_err();
        assert!(matches!(
            err,
            CaptureError::FormatRejected { offered, .. } if offered == PixelFormat::YUYV
        ));
    }
}
