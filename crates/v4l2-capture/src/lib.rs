//! Memory-mapped V4L2 capture
//!
//! Opens a V4L2 video device, negotiates an encoded capture format and frame
//! interval, maps a small pool of driver buffers and runs a readiness-driven
//! loop that hands every completed frame to a [`Sink`] before requeueing its
//! buffer. Supports:
//! - H.264 (and other compressed) capture in mmap streaming mode
//! - A strict Idle -> Configured -> Streaming -> Stopped lifecycle
//! - Cooperative stop via [`StopSignal`]
//! - A scripted [`mock::MockDevice`] for tests and dry runs without hardware

pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod event_loop;
pub mod format;
pub mod memory;
pub mod mock;
pub mod session;
pub mod sink;
pub mod state;

pub use buffer::{BufferPool, BufferState, CaptureBuffer, ReadyFrame, DEFAULT_BUFFER_COUNT};
pub use config::CaptureConfig;
pub use device::{verify_capabilities, Capabilities, ControlChannel, DeviceHandle, Readiness};
pub use error::CaptureError;
pub use event_loop::{EventLoop, LoopStats, StopSignal};
pub use format::{DeviceFormat, FieldOrder, FrameInterval, NegotiatedFormat, PixelFormat};
pub use session::{run_capture, CaptureSession};
pub use sink::{ChannelSink, Sink, WriterSink};
pub use state::{CaptureState, CaptureStateMachine};
