//! Device control channel
//!
//! [`ControlChannel`] is the seam between the capture core and the driver.
//! [`DeviceHandle`] implements it over a V4L2 character device with the
//! `v4l` crate's ioctl bindings; `mock::MockDevice` implements it without
//! hardware.

use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::os::raw::c_void;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};
use v4l::v4l2::{self, vidioc};
use v4l::v4l_sys::{
    v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE, v4l2_buffer, v4l2_capability, v4l2_captureparm,
    v4l2_format, v4l2_memory_V4L2_MEMORY_MMAP, v4l2_pix_format, v4l2_requestbuffers,
    v4l2_streamparm, V4L2_CAP_DEVICE_CAPS, V4L2_CAP_STREAMING, V4L2_CAP_TIMEPERFRAME,
    V4L2_CAP_VIDEO_CAPTURE,
};

use crate::error::CaptureError;
use crate::format::{FieldOrder, FrameInterval, ImageFormat, PixelFormat};
use crate::memory::MappedRegion;

/// Identity and capability word reported by QUERYCAP
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub capabilities: u32,
    pub device_caps: u32,
}

impl Capabilities {
    /// Video capture with streaming I/O, as a driver would report it
    pub const STREAMING_CAPTURE: u32 = V4L2_CAP_VIDEO_CAPTURE | V4L2_CAP_STREAMING;

    /// Capabilities of this device node, preferring `device_caps` when present
    pub fn effective(&self) -> u32 {
        if self.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
            self.device_caps
        } else {
            self.capabilities
        }
    }

    pub fn can_capture(&self) -> bool {
        self.effective() & V4L2_CAP_VIDEO_CAPTURE != 0
    }

    pub fn can_stream(&self) -> bool {
        self.effective() & V4L2_CAP_STREAMING != 0
    }
}

/// Capture stream parameters (G_PARM / S_PARM)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub capability: u32,
    pub capture_mode: u32,
    pub time_per_frame: FrameInterval,
    pub extended_mode: u32,
    pub read_buffers: u32,
}

impl StreamParams {
    /// `capability` flag set by drivers that honour `time_per_frame`
    pub const TIME_PER_FRAME: u32 = V4L2_CAP_TIMEPERFRAME;

    pub fn supports_frame_interval(&self) -> bool {
        self.capability & Self::TIME_PER_FRAME != 0
    }

    fn from_raw(raw: &v4l2_captureparm) -> Self {
        Self {
            capability: raw.capability,
            capture_mode: raw.capturemode,
            time_per_frame: FrameInterval::new(
                raw.timeperframe.numerator,
                raw.timeperframe.denominator,
            ),
            extended_mode: raw.extendedmode,
            read_buffers: raw.readbuffers,
        }
    }

    fn write_raw(&self, raw: &mut v4l2_captureparm) {
        raw.capability = self.capability;
        raw.capturemode = self.capture_mode;
        raw.timeperframe.numerator = self.time_per_frame.numerator;
        raw.timeperframe.denominator = self.time_per_frame.denominator;
        raw.extendedmode = self.extended_mode;
        raw.readbuffers = self.read_buffers;
    }
}

fn pix_format(format: &ImageFormat) -> v4l2_pix_format {
    // SAFETY: plain C struct; all-zero is a valid value
    let mut raw: v4l2_pix_format = unsafe { mem::zeroed() };
    raw.width = format.width;
    raw.height = format.height;
    raw.pixelformat = format.pixel_format.fourcc();
    raw.field = format.field.to_raw();
    raw.bytesperline = format.bytes_per_line;
    raw.sizeimage = format.size_image;
    raw
}

fn image_format(raw: &v4l2_pix_format) -> ImageFormat {
    ImageFormat {
        width: raw.width,
        height: raw.height,
        pixel_format: PixelFormat::from_fourcc(raw.pixelformat),
        field: FieldOrder::from_raw(raw.field),
        bytes_per_line: raw.bytesperline,
        size_image: raw.sizeimage,
    }
}

/// NUL-terminated identity string from QUERYCAP
fn c_str_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Where the driver placed one buffer (QUERYBUF)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPlacement {
    pub index: u32,
    /// Driver cookie passed to mmap as the file offset
    pub offset: u32,
    pub length: u32,
}

/// A completed buffer handed back by DQBUF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
    pub timestamp: Duration,
}

/// Outcome of a bounded readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A completed buffer can be dequeued
    Ready,
    /// Nothing completed within the timeout
    TimedOut,
    /// Woken without data (signal or non-data event)
    Interrupted,
}

/// Control operations on a capture device.
///
/// Each call maps to exactly one driver request and is never retried.
pub trait ControlChannel {
    /// Node the channel talks to, used in error reports
    fn path(&self) -> &Path;

    fn query_capabilities(&mut self) -> io::Result<Capabilities>;

    fn get_stream_params(&mut self) -> io::Result<StreamParams>;

    /// Returns the parameters the driver actually applied
    fn set_stream_params(&mut self, params: &StreamParams) -> io::Result<StreamParams>;

    /// Returns the format the driver actually committed
    fn set_format(&mut self, format: &ImageFormat) -> io::Result<ImageFormat>;

    /// Returns the number of buffers granted, which may differ from `count`
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferPlacement>;

    fn map_buffer(&mut self, placement: &BufferPlacement) -> io::Result<MappedRegion>;

    fn enqueue_buffer(&mut self, index: u32) -> io::Result<()>;

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer>;

    fn stream_on(&mut self) -> io::Result<()>;

    fn stream_off(&mut self) -> io::Result<()>;

    fn wait_ready(&mut self, timeout: Duration) -> io::Result<Readiness>;
}

/// Check that `device` offers video capture with streaming I/O.
///
/// Both a failed QUERYCAP and a missing capability are reported as
/// [`CaptureError::DeviceOpen`], naming what is missing.
pub fn verify_capabilities<D: ControlChannel + ?Sized>(
    device: &mut D,
) -> Result<Capabilities, CaptureError> {
    let path = device.path().to_path_buf();
    let caps = device
        .query_capabilities()
        .map_err(|source| CaptureError::DeviceOpen {
            path: path.clone(),
            source,
        })?;

    let missing = if !caps.can_capture() {
        Some("video capture")
    } else if !caps.can_stream() {
        Some("streaming I/O")
    } else {
        None
    };
    if let Some(capability) = missing {
        return Err(CaptureError::DeviceOpen {
            path,
            source: io::Error::new(
                io::ErrorKind::Unsupported,
                format!(
                    "no {} capability (capabilities {:#010x})",
                    capability,
                    caps.effective()
                ),
            ),
        });
    }
    Ok(caps)
}

/// Turn the outcome of a one-descriptor `poll` into a readiness report.
///
/// EINTR and wakeups without data are `Interrupted`; error or hang-up events
/// without readable data are failures.
pub(crate) fn classify_poll(ret: io::Result<i32>, revents: i16) -> io::Result<Readiness> {
    let ready = match ret {
        Ok(ready) => ready,
        Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(Readiness::Interrupted),
        Err(err) => return Err(err),
    };
    if ready == 0 {
        return Ok(Readiness::TimedOut);
    }
    if revents & libc::POLLIN != 0 {
        return Ok(Readiness::Ready);
    }
    if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("device reported poll error (revents {:#x})", revents),
        ));
    }
    Ok(Readiness::Interrupted)
}

/// Open V4L2 capture device.
///
/// The descriptor is owned by a [`File`], so it is closed on every exit path.
pub struct DeviceHandle {
    file: File,
    path: PathBuf,
    capabilities: Capabilities,
}

impl DeviceHandle {
    /// Open `path` non-blocking and check it can stream video capture
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .map_err(|source| CaptureError::DeviceOpen {
                path: path.clone(),
                source,
            })?;

        let mut handle = Self {
            file,
            path,
            capabilities: Capabilities::default(),
        };
        let caps = verify_capabilities(&mut handle)?;

        info!(
            "Opened {} ({} via {}, {})",
            handle.path.display(),
            caps.card,
            caps.driver,
            caps.bus_info
        );
        handle.capabilities = caps;
        Ok(handle)
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn ioctl<T>(&self, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
        // SAFETY: `arg` is the v4l2 struct the request number was built for
        unsafe { v4l2::ioctl(self.fd(), request, arg as *mut T as *mut c_void) }
    }
}

/// Zeroed `v4l2_buffer` addressing mmap capture buffer `index`
fn capture_buffer(index: u32) -> v4l2_buffer {
    // SAFETY: plain C struct; all-zero is a valid value
    let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
    buf.index = index;
    buf.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
    buf.memory = v4l2_memory_V4L2_MEMORY_MMAP;
    buf
}

fn capture_stream_params() -> v4l2_streamparm {
    // SAFETY: plain C struct; all-zero is a valid value
    let mut parm: v4l2_streamparm = unsafe { mem::zeroed() };
    parm.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
    parm
}

impl ControlChannel for DeviceHandle {
    fn path(&self) -> &Path {
        &self.path
    }

    fn query_capabilities(&mut self) -> io::Result<Capabilities> {
        // SAFETY: plain C struct; all-zero is a valid value
        let mut cap: v4l2_capability = unsafe { mem::zeroed() };
        self.ioctl(vidioc::VIDIOC_QUERYCAP, &mut cap)?;
        Ok(Capabilities {
            driver: c_str_field(&cap.driver),
            card: c_str_field(&cap.card),
            bus_info: c_str_field(&cap.bus_info),
            capabilities: cap.capabilities,
            device_caps: cap.device_caps,
        })
    }

    fn get_stream_params(&mut self) -> io::Result<StreamParams> {
        let mut parm = capture_stream_params();
        self.ioctl(vidioc::VIDIOC_G_PARM, &mut parm)?;
        // SAFETY: the capture member is active for the video capture buffer type
        Ok(StreamParams::from_raw(unsafe { &parm.parm.capture }))
    }

    fn set_stream_params(&mut self, params: &StreamParams) -> io::Result<StreamParams> {
        let mut parm = capture_stream_params();
        // SAFETY: as above; the union was zeroed, so the member is initialised
        params.write_raw(unsafe { &mut parm.parm.capture });
        self.ioctl(vidioc::VIDIOC_S_PARM, &mut parm)?;
        // SAFETY: the capture member is active for the video capture buffer type
        Ok(StreamParams::from_raw(unsafe { &parm.parm.capture }))
    }

    fn set_format(&mut self, format: &ImageFormat) -> io::Result<ImageFormat> {
        // SAFETY: plain C struct; all-zero is a valid value
        let mut raw: v4l2_format = unsafe { mem::zeroed() };
        raw.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        raw.fmt.pix = pix_format(format);
        self.ioctl(vidioc::VIDIOC_S_FMT, &mut raw)?;
        // SAFETY: the pix member is active for the video capture buffer type
        Ok(image_format(unsafe { &raw.fmt.pix }))
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        // SAFETY: plain C struct; all-zero is a valid value
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        req.memory = v4l2_memory_V4L2_MEMORY_MMAP;
        self.ioctl(vidioc::VIDIOC_REQBUFS, &mut req)?;
        Ok(req.count)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferPlacement> {
        let mut buf = capture_buffer(index);
        self.ioctl(vidioc::VIDIOC_QUERYBUF, &mut buf)?;
        Ok(BufferPlacement {
            index: buf.index,
            // SAFETY: offset is the active member for MMAP buffers
            offset: unsafe { buf.m.offset },
            length: buf.length,
        })
    }

    fn map_buffer(&mut self, placement: &BufferPlacement) -> io::Result<MappedRegion> {
        MappedRegion::map(&self.file, placement.offset as u64, placement.length as usize)
    }

    fn enqueue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut buf = capture_buffer(index);
        self.ioctl(vidioc::VIDIOC_QBUF, &mut buf)
    }

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer> {
        let mut buf = capture_buffer(0);
        self.ioctl(vidioc::VIDIOC_DQBUF, &mut buf)?;
        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused,
            sequence: buf.sequence,
            timestamp: Duration::new(
                buf.timestamp.tv_sec.max(0) as u64,
                (buf.timestamp.tv_usec.max(0) as u32).saturating_mul(1000),
            ),
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut buf_type = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        self.ioctl(vidioc::VIDIOC_STREAMON, &mut buf_type)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut buf_type = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        self.ioctl(vidioc::VIDIOC_STREAMOFF, &mut buf_type)
    }

    fn wait_ready(&mut self, timeout: Duration) -> io::Result<Readiness> {
        let mut pfd = libc::pollfd {
            fd: self.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: one valid pollfd for the duration of the call
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        let ret = if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret)
        };
        classify_poll(ret, pfd.revents)
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        debug!("Closing {}", self.path.display());
    }
}
