//! Capture error types

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::buffer::BufferState;
use crate::format::PixelFormat;
use crate::state::CaptureState;

/// Step of format negotiation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    GetStreamParams,
    SetStreamParams,
    SetFormat,
}

/// Stream control direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAction {
    On,
    Off,
}

/// Errors that abort a capture session.
///
/// Every variant is fatal for the session that produced it. The operation that
/// failed is named in the message and the driver's errno is kept as `source`.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to open capture device {path}: {source}")]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Format negotiation failed at {step:?}: {source}")]
    FormatNegotiation {
        step: NegotiationStep,
        #[source]
        source: io::Error,
    },

    #[error("Driver substituted pixel format {offered} for requested {requested}")]
    FormatRejected {
        requested: PixelFormat,
        offered: PixelFormat,
    },

    #[error("Buffer allocation of {requested} buffers failed: {source}")]
    BufferAllocation {
        requested: u32,
        #[source]
        source: io::Error,
    },

    #[error("Failed to map buffer {index}: {source}")]
    Mapping {
        index: u32,
        #[source]
        source: io::Error,
    },

    #[error("Buffer pool is {0}")]
    PoolState(&'static str),

    #[error("Failed to turn stream {action:?}: {source}")]
    StreamControl {
        action: StreamAction,
        #[source]
        source: io::Error,
    },

    #[error("Readiness wait failed: {0}")]
    ReadinessWait(#[source] io::Error),

    #[error("Failed to dequeue buffer: {0}")]
    Dequeue(#[source] io::Error),

    #[error("Failed to enqueue buffer {index}: {source}")]
    Enqueue {
        index: u32,
        #[source]
        source: io::Error,
    },

    #[error("Buffer index {index} outside pool of {pool_size}")]
    UnknownBuffer { index: u32, pool_size: usize },

    #[error("Buffer {index} is {actual:?}, expected {expected:?}")]
    Ownership {
        index: u32,
        expected: BufferState,
        actual: BufferState,
    },

    #[error("Sink write failed: {0}")]
    Sink(#[source] io::Error),

    #[error("Invalid state transition {from} -> {to}")]
    InvalidTransition { from: CaptureState, to: CaptureState },

    #[error("Session is {0}, not streaming")]
    NotStreaming(CaptureState),

    #[error("Invalid capture configuration: {0}")]
    Config(String),
}

impl CaptureError {
    /// Whether the failure came from the device control channel
    pub fn is_control_channel(&self) -> bool {
        !matches!(
            self,
            CaptureError::Sink(_)
                | CaptureError::Config(_)
                | CaptureError::InvalidTransition { .. }
                | CaptureError::NotStreaming(_)
                | CaptureError::PoolState(_)
        )
    }

    /// The OS error code behind this failure, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        let source = match self {
            CaptureError::DeviceOpen { source, .. }
            | CaptureError::FormatNegotiation { source, .. }
            | CaptureError::BufferAllocation { source, .. }
            | CaptureError::Mapping { source, .. }
            | CaptureError::StreamControl { source, .. }
            | CaptureError::Enqueue { source, .. } => source,
            CaptureError::ReadinessWait(source)
            | CaptureError::Dequeue(source)
            | CaptureError::Sink(source) => source,
            _ => return None,
        };
        source.raw_os_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_operation() {
        let err = CaptureError::Enqueue {
            index: 1,
            source: io::Error::from_raw_os_error(libc::EINVAL),
        };
        assert!(err.to_string().starts_with("Failed to enqueue buffer 1"));
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        assert!(err.is_control_channel());

        let err = CaptureError::InvalidTransition {
            from: CaptureState::Idle,
            to: CaptureState::Streaming,
        };
        assert_eq!(err.to_string(), "Invalid state transition idle -> streaming");
        assert!(!err.is_control_channel());
        assert_eq!(err.raw_os_error(), None);

        let err = CaptureError::PoolState("not mapped");
        assert_eq!(err.to_string(), "Buffer pool is not mapped");
        assert!(!err.is_control_channel());
    }
}
