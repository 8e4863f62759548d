//! Capture streaming state machine

use std::fmt;

use tracing::info;

use crate::buffer::{BufferPool, BufferState};
use crate::device::ControlChannel;
use crate::error::{CaptureError, StreamAction};
use crate::format::NegotiatedFormat;

/// Lifecycle of a capture stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    #[default]
    Idle,
    /// Format committed, buffers mapped and queued
    Configured,
    Streaming,
    /// Terminal: a stopped stream is never restarted
    Stopped,
}

impl CaptureState {
    /// The only state each state may move to
    fn successor(self) -> Option<CaptureState> {
        match self {
            CaptureState::Idle => Some(CaptureState::Configured),
            CaptureState::Configured => Some(CaptureState::Streaming),
            CaptureState::Streaming => Some(CaptureState::Stopped),
            CaptureState::Stopped => None,
        }
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureState::Idle => "idle",
            CaptureState::Configured => "configured",
            CaptureState::Streaming => "streaming",
            CaptureState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Sequences Idle -> Configured -> Streaming -> Stopped.
///
/// Transitions are strictly forward and one step at a time. A failed control
/// operation leaves the state unchanged and is returned to the caller; nothing
/// is retried here.
#[derive(Debug, Default)]
pub struct CaptureStateMachine {
    state: CaptureState,
}

impl CaptureStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state == CaptureState::Streaming
    }

    fn check(&self, to: CaptureState) -> Result<(), CaptureError> {
        if self.state.successor() == Some(to) {
            Ok(())
        } else {
            Err(CaptureError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }

    fn require_fully_queued(pool: &BufferPool) -> Result<(), CaptureError> {
        if !pool.is_mapped() {
            return Err(CaptureError::PoolState("not mapped"));
        }
        if let Some(index) = pool.first_unqueued() {
            return Err(CaptureError::Ownership {
                index,
                expected: BufferState::QueuedToDriver,
                actual: BufferState::DequeuedReady,
            });
        }
        Ok(())
    }

    /// Idle -> Configured.
    ///
    /// The committed format is the proof negotiation finished; the pool must be
    /// mapped with every buffer queued to the driver.
    pub fn configure(
        &mut self,
        format: &NegotiatedFormat,
        pool: &BufferPool,
    ) -> Result<(), CaptureError> {
        self.check(CaptureState::Configured)?;
        Self::require_fully_queued(pool)?;

        self.state = CaptureState::Configured;
        info!(
            "Capture configured: {}x{} {}, {} buffers",
            format.image.width,
            format.image.height,
            format.image.pixel_format,
            pool.len()
        );
        Ok(())
    }

    /// Configured -> Streaming (STREAMON)
    pub fn start<D: ControlChannel + ?Sized>(
        &mut self,
        device: &mut D,
        pool: &BufferPool,
    ) -> Result<(), CaptureError> {
        self.check(CaptureState::Streaming)?;
        Self::require_fully_queued(pool)?;

        device
            .stream_on()
            .map_err(|source| CaptureError::StreamControl {
                action: StreamAction::On,
                source,
            })?;
        self.state = CaptureState::Streaming;
        info!("Streaming started");
        Ok(())
    }

    /// Streaming -> Stopped (STREAMOFF)
    pub fn stop<D: ControlChannel + ?Sized>(&mut self, device: &mut D) -> Result<(), CaptureError> {
        self.check(CaptureState::Stopped)?;

        device
            .stream_off()
            .map_err(|source| CaptureError::StreamControl {
                action: StreamAction::Off,
                source,
            })?;
        self.state = CaptureState::Stopped;
        info!("Streaming stopped");
        Ok(())
    }
}
