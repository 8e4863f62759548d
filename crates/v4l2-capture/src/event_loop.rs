//! Readiness-driven dequeue/deliver/requeue loop

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, info, trace};

use crate::buffer::BufferPool;
use crate::device::{ControlChannel, Readiness};
use crate::error::CaptureError;
use crate::sink::Sink;

/// Default bound on one readiness wait
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Cooperative stop request, checked once per loop iteration
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Counters for one run of the loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub frames: u64,
    pub bytes: u64,
    pub timeouts: u64,
    pub interrupted: u64,
    pub spurious: u64,
}

/// What a single iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A frame went to the sink and its buffer was requeued
    Delivered { index: u32, bytes_used: usize },
    TimedOut,
    Interrupted,
    /// Readiness was reported but no buffer could be dequeued
    Spurious,
}

/// Single-threaded capture loop.
///
/// At most one buffer is outside driver ownership at any time: it is
/// dequeued, delivered and requeued before the next wait.
#[derive(Debug, Clone)]
pub struct EventLoop {
    poll_timeout: Duration,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_TIMEOUT)
    }
}

impl EventLoop {
    pub fn new(poll_timeout: Duration) -> Self {
        Self { poll_timeout }
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Run until `stop` is requested or an error occurs
    pub fn run<D, S>(
        &self,
        device: &mut D,
        pool: &mut BufferPool,
        sink: &mut S,
        stop: &StopSignal,
    ) -> Result<LoopStats, CaptureError>
    where
        D: ControlChannel + ?Sized,
        S: Sink + ?Sized,
    {
        let mut stats = LoopStats::default();

        while !stop.is_stop_requested() {
            match self.step(device, pool, sink)? {
                Step::Delivered { bytes_used, .. } => {
                    stats.frames += 1;
                    stats.bytes += bytes_used as u64;
                }
                Step::TimedOut => stats.timeouts += 1,
                Step::Interrupted => stats.interrupted += 1,
                Step::Spurious => stats.spurious += 1,
            }
        }

        sink.flush().map_err(CaptureError::Sink)?;
        info!(
            "Capture loop stopped after {} frames ({} bytes, {} timeouts)",
            stats.frames, stats.bytes, stats.timeouts
        );
        Ok(stats)
    }

    /// One wait / dequeue / deliver / requeue iteration
    pub fn step<D, S>(
        &self,
        device: &mut D,
        pool: &mut BufferPool,
        sink: &mut S,
    ) -> Result<Step, CaptureError>
    where
        D: ControlChannel + ?Sized,
        S: Sink + ?Sized,
    {
        match device
            .wait_ready(self.poll_timeout)
            .map_err(CaptureError::ReadinessWait)?
        {
            Readiness::Ready => {}
            Readiness::TimedOut => {
                debug!("Poll timeout");
                counter!("capture_poll_timeouts_total").increment(1);
                return Ok(Step::TimedOut);
            }
            Readiness::Interrupted => return Ok(Step::Interrupted),
        }

        let frame = match pool.dequeue_one(device) {
            Ok(frame) => frame,
            Err(CaptureError::Dequeue(err)) if err.kind() == io::ErrorKind::WouldBlock => {
                debug!("Readiness reported without a completed buffer");
                return Ok(Step::Spurious);
            }
            Err(err) => return Err(err),
        };

        let index = frame.index();
        let bytes_used = frame.bytes_used();
        trace!(
            "Frame {} in buffer {} ({} bytes)",
            frame.sequence(),
            index,
            bytes_used
        );

        sink.write_frame(frame.data()).map_err(CaptureError::Sink)?;
        pool.queue_one(device, index)?;

        counter!("capture_frames_total").increment(1);
        counter!("capture_bytes_total").increment(bytes_used as u64);
        Ok(Step::Delivered { index, bytes_used })
    }
}
