//! Capture session: one device, one format, one pool, one state machine

use std::path::Path;

use tracing::{error, info, warn};

use crate::buffer::BufferPool;
use crate::config::CaptureConfig;
use crate::device::{verify_capabilities, ControlChannel, DeviceHandle};
use crate::error::CaptureError;
use crate::event_loop::{EventLoop, LoopStats, StopSignal};
use crate::format::{FormatNegotiator, NegotiatedFormat};
use crate::sink::Sink;
use crate::state::{CaptureState, CaptureStateMachine};

/// Everything one capture run owns, from device open to device close.
///
/// Teardown runs on every exit path: [`CaptureSession::close`] reports its
/// result, and `Drop` performs the same stream-off/unmap best-effort when a
/// session is abandoned after an error. The device is closed last.
pub struct CaptureSession<D: ControlChannel = DeviceHandle> {
    pool: Option<BufferPool>,
    format: Option<NegotiatedFormat>,
    machine: CaptureStateMachine,
    event_loop: EventLoop,
    device: D,
}

impl CaptureSession<DeviceHandle> {
    /// Open a V4L2 device
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        Ok(Self::with_device(DeviceHandle::open(path)?))
    }
}

impl<D: ControlChannel> CaptureSession<D> {
    pub fn with_device(device: D) -> Self {
        Self {
            pool: None,
            format: None,
            machine: CaptureStateMachine::new(),
            event_loop: EventLoop::default(),
            device,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.machine.state()
    }

    pub fn format(&self) -> Option<&NegotiatedFormat> {
        self.format.as_ref()
    }

    pub fn pool(&self) -> Option<&BufferPool> {
        self.pool.as_ref()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Idle -> Configured: check the device can stream video capture,
    /// negotiate the format, then allocate, map and queue the buffers. The
    /// format is written once per session.
    pub fn configure(&mut self, config: &CaptureConfig) -> Result<&NegotiatedFormat, CaptureError> {
        if self.machine.state() != CaptureState::Idle || self.format.is_some() {
            return Err(CaptureError::InvalidTransition {
                from: self.machine.state(),
                to: CaptureState::Configured,
            });
        }
        config.validate()?;
        verify_capabilities(&mut self.device)?;

        let format = FormatNegotiator::new(config.device_format()).negotiate(&mut self.device)?;
        let pool = BufferPool::prepare(&mut self.device, config.buffer_count)?;
        self.machine.configure(&format, &pool)?;

        self.event_loop = EventLoop::new(config.poll_timeout());
        self.pool = Some(pool);
        Ok(&*self.format.insert(format))
    }

    /// Configured -> Streaming
    pub fn start(&mut self) -> Result<(), CaptureError> {
        let pool = self.pool.as_ref().ok_or(CaptureError::InvalidTransition {
            from: self.machine.state(),
            to: CaptureState::Streaming,
        })?;
        self.machine.start(&mut self.device, pool)
    }

    /// Run the event loop until `stop` is requested or a fatal error
    pub fn run<S: Sink + ?Sized>(
        &mut self,
        sink: &mut S,
        stop: &StopSignal,
    ) -> Result<LoopStats, CaptureError> {
        if !self.machine.is_streaming() {
            return Err(CaptureError::NotStreaming(self.machine.state()));
        }
        let pool = self
            .pool
            .as_mut()
            .ok_or(CaptureError::NotStreaming(self.machine.state()))?;
        self.event_loop.run(&mut self.device, pool, sink, stop)
    }

    /// Streaming -> Stopped
    pub fn stop(&mut self) -> Result<(), CaptureError> {
        self.machine.stop(&mut self.device)
    }

    /// Stop if still streaming, unmap the pool and close the device
    pub fn close(mut self) -> Result<(), CaptureError> {
        self.teardown()
    }

    /// Configure, start, run until stopped, then tear down.
    ///
    /// Whatever step fails, the session is torn down before the error is
    /// returned.
    pub fn capture<S: Sink + ?Sized>(
        mut self,
        config: &CaptureConfig,
        sink: &mut S,
        stop: &StopSignal,
    ) -> Result<LoopStats, CaptureError> {
        self.configure(config)?;
        self.start()?;
        let stats = self.run(sink, stop)?;
        self.stop()?;
        self.close()?;
        Ok(stats)
    }

    fn teardown(&mut self) -> Result<(), CaptureError> {
        let stopped = if self.machine.is_streaming() {
            self.machine.stop(&mut self.device)
        } else {
            Ok(())
        };
        if let Some(pool) = self.pool.take() {
            pool.unmap_all();
        }
        stopped
    }
}

impl<D: ControlChannel> Drop for CaptureSession<D> {
    fn drop(&mut self) {
        if self.pool.is_none() && !self.machine.is_streaming() {
            return;
        }
        warn!("Capture session dropped in state {}, tearing down", self.machine.state());
        if let Err(err) = self.teardown() {
            error!("Teardown failed: {}", err);
        }
    }
}

/// Capture from the device named in `config` into `sink` until `stop` is
/// requested.
pub fn run_capture<S: Sink + ?Sized>(
    config: &CaptureConfig,
    sink: &mut S,
    stop: &StopSignal,
) -> Result<LoopStats, CaptureError> {
    info!("Starting capture from {}", config.device.display());
    CaptureSession::open(&config.device)?.capture(config, sink, stop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockEvent, MockFailure, MockOp, MockScript};
    use crate::sink::WriterSink;

    #[test]
    fn test_format_is_write_once() {
        let mut session = CaptureSession::with_device(MockDevice::new(MockScript::default()));
        let config = CaptureConfig::default();

        session.configure(&config).unwrap();
        assert_eq!(session.state(), CaptureState::Configured);

        let err = session.configure(&config).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::InvalidTransition { from: CaptureState::Configured, .. }
        ));
    }

    #[test]
    fn test_run_requires_streaming() {
        let mut session = CaptureSession::with_device(MockDevice::new(MockScript::default()));
        let mut sink = WriterSink::new(Vec::new());

        let err = session.run(&mut sink, &StopSignal::new()).unwrap_err();
        assert!(matches!(err, CaptureError::NotStreaming(CaptureState::Idle)));
    }

    #[test]
    fn test_start_before_configure() {
        let mut session = CaptureSession::with_device(MockDevice::new(MockScript::default()));
        assert!(matches!(
            session.start(),
            Err(CaptureError::InvalidTransition { from: CaptureState::Idle, .. })
        ));
    }

    #[test]
    fn test_invalid_config_touches_nothing() {
        let device = MockDevice::new(MockScript::default());
        let monitor = device.monitor();
        let mut session = CaptureSession::with_device(device);

        let config = CaptureConfig {
            buffer_count: 0,
            ..Default::default()
        };
        assert!(matches!(session.configure(&config), Err(CaptureError::Config(_))));
        assert!(monitor.events().is_empty());
    }

    #[test]
    fn test_device_without_capture_capability_is_refused() {
        let device = MockDevice::new(MockScript {
            capabilities: 0,
            ..Default::default()
        });
        let monitor = device.monitor();
        let mut session = CaptureSession::with_device(device);

        let err = session.configure(&CaptureConfig::default()).unwrap_err();
        assert!(matches!(err, CaptureError::DeviceOpen { .. }));
        assert_eq!(session.state(), CaptureState::Idle);
        assert!(monitor.events().is_empty());

        assert!(session.start().is_err());
        assert!(!monitor.is_streaming());
    }

    #[test]
    fn test_drop_while_streaming_stops_and_unmaps() {
        let device = MockDevice::new(MockScript::default());
        let monitor = device.monitor();
        {
            let mut session = CaptureSession::with_device(device);
            session.configure(&CaptureConfig::default()).unwrap();
            session.start().unwrap();
        }
        assert!(!monitor.is_streaming());
        assert!(matches!(monitor.events().last(), Some(MockEvent::StreamOff)));
        assert_eq!(monitor.live_mappings(), 0);
    }

    #[test]
    fn test_failure_mid_loop_still_tears_down() {
        let script = MockScript {
            fail: Some(MockFailure::after(MockOp::Dequeue, 5, libc::EIO)),
            ..Default::default()
        };
        let device = MockDevice::new(script);
        let monitor = device.monitor();
        let mut sink = WriterSink::new(Vec::new());

        let err = CaptureSession::with_device(device)
            .capture(&CaptureConfig::default(), &mut sink, &StopSignal::new())
            .unwrap_err();
        assert!(matches!(err, CaptureError::Dequeue(_)));
        assert_eq!(sink.frames_written(), 5);
        assert!(!monitor.is_streaming());
        assert_eq!(monitor.live_mappings(), 0);
    }

    #[test]
    fn test_close_after_stop() {
        let device = MockDevice::new(MockScript::default());
        let monitor = device.monitor();
        let mut session = CaptureSession::with_device(device);
        session.configure(&CaptureConfig::default()).unwrap();
        session.start().unwrap();
        session.stop().unwrap();
        session.close().unwrap();

        let stream_offs = monitor
            .events()
            .iter()
            .filter(|e| matches!(e, MockEvent::StreamOff))
            .count();
        assert_eq!(stream_offs, 1);
        assert_eq!(monitor.live_mappings(), 0);
    }
}
