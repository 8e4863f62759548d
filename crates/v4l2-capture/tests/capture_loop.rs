//! End-to-end capture scenarios against the synthetic driver

use std::io;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use v4l2_capture::mock::{MockDevice, MockEvent, MockScript};
use v4l2_capture::{
    run_capture, CaptureConfig, CaptureError, CaptureSession, CaptureState, Sink, StopSignal,
};

/// Records every frame and requests a stop after `limit` frames
struct RecordingSink {
    frames: Vec<Vec<u8>>,
    limit: usize,
    stop: StopSignal,
}

impl RecordingSink {
    fn new(limit: usize, stop: StopSignal) -> Self {
        Self {
            frames: Vec::new(),
            limit,
            stop,
        }
    }
}

impl Sink for RecordingSink {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.frames.push(frame.to_vec());
        if self.frames.len() >= self.limit {
            self.stop.request_stop();
        }
        Ok(())
    }
}

fn fast_config() -> CaptureConfig {
    CaptureConfig {
        poll_timeout_ms: 5,
        ..Default::default()
    }
}

#[test]
fn test_thirty_frames_in_order_with_immediate_requeue() {
    const FRAME_LEN: u32 = 1500;
    let script = MockScript {
        frame_sizes: vec![FRAME_LEN],
        ..Default::default()
    };
    let device = MockDevice::new(script);
    let monitor = device.monitor();
    let stop = StopSignal::new();
    let mut sink = RecordingSink::new(30, stop.clone());

    let stats = CaptureSession::with_device(device)
        .capture(&fast_config(), &mut sink, &stop)
        .unwrap();

    assert_eq!(stats.frames, 30);
    assert_eq!(stats.bytes, 30 * FRAME_LEN as u64);
    assert_eq!(sink.frames.len(), 30);
    for (sequence, frame) in sink.frames.iter().enumerate() {
        assert_eq!(frame.len(), FRAME_LEN as usize);
        // the driver stamps each frame with its sequence number
        assert!(frame.iter().all(|&b| b == sequence as u8));
    }

    let events = monitor.events();
    let stream_on = events
        .iter()
        .position(|e| matches!(e, MockEvent::StreamOn))
        .unwrap();
    let loop_events: Vec<_> = events[stream_on + 1..]
        .iter()
        .filter(|e| matches!(e, MockEvent::Dequeue { .. } | MockEvent::Enqueue(_)))
        .collect();
    assert_eq!(loop_events.len(), 60);
    for pair in loop_events.chunks(2) {
        match (pair[0], pair[1]) {
            (MockEvent::Dequeue { index, bytes_used }, MockEvent::Enqueue(requeued)) => {
                assert_eq!(index, requeued);
                assert_eq!(*bytes_used, FRAME_LEN);
            }
            other => panic!("dequeue not followed by its requeue: {other:?}"),
        }
    }
    assert!(matches!(events.last(), Some(MockEvent::StreamOff)));
    assert_eq!(monitor.live_mappings(), 0);
}

/// Blocks inside `write_frame` until the gate is released
struct GatedSink {
    gate: mpsc::Receiver<()>,
    written: usize,
}

impl Sink for GatedSink {
    fn write_frame(&mut self, _frame: &[u8]) -> io::Result<()> {
        let _ = self.gate.recv();
        self.written += 1;
        Ok(())
    }
}

#[test]
fn test_stalled_sink_starves_the_driver() {
    let device = MockDevice::new(MockScript::default());
    let monitor = device.monitor();
    let stop = StopSignal::new();
    let (release, gate) = mpsc::channel();

    let loop_stop = stop.clone();
    let capture = thread::spawn(move || {
        let mut sink = GatedSink { gate, written: 0 };
        let stats = CaptureSession::with_device(device).capture(&fast_config(), &mut sink, &loop_stop);
        (stats, sink.written)
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while monitor.dequeue_count() == 0 {
        assert!(Instant::now() < deadline, "no frame was ever dequeued");
        thread::sleep(Duration::from_millis(1));
    }
    thread::sleep(Duration::from_millis(50));

    // one buffer is held by the blocked sink and nothing else is taken
    assert!(monitor.dequeue_count() <= 2);
    assert_eq!(monitor.dequeue_count(), 1);
    assert_eq!(monitor.queued_indices().len(), 1);

    stop.request_stop();
    drop(release);
    let (stats, written) = capture.join().unwrap();
    let stats = stats.unwrap();
    assert_eq!(written, 1);
    assert_eq!(stats.frames, 1);
    assert!(!monitor.is_streaming());
}

#[test]
fn test_fewer_buffers_than_requested() {
    let script = MockScript {
        granted_buffers: Some(1),
        ..Default::default()
    };
    let device = MockDevice::new(script);
    let monitor = device.monitor();
    let stop = StopSignal::new();
    let mut sink = RecordingSink::new(10, stop.clone());

    let config = CaptureConfig {
        buffer_count: 4,
        ..fast_config()
    };
    let mut session = CaptureSession::with_device(device);
    session.configure(&config).unwrap();
    {
        let pool = session.pool().unwrap();
        assert_eq!(pool.requested(), 4);
        assert_eq!(pool.len(), 1);
    }
    session.start().unwrap();
    let stats = session.run(&mut sink, &stop).unwrap();
    session.stop().unwrap();
    assert_eq!(session.state(), CaptureState::Stopped);
    session.close().unwrap();

    assert_eq!(stats.frames, 10);
    assert!(monitor.events().iter().all(|e| match e {
        MockEvent::QueryBuffer(i) | MockEvent::MapBuffer(i) | MockEvent::Enqueue(i) => *i == 0,
        MockEvent::Dequeue { index, .. } => *index == 0,
        _ => true,
    }));
}

#[test]
fn test_missing_device_fails_before_any_mapping() {
    let config = CaptureConfig::for_device("/dev/does-not-exist-video42");
    let stop = StopSignal::new();
    let mut sink = RecordingSink::new(1, stop.clone());

    let err = run_capture(&config, &mut sink, &stop).unwrap_err();
    assert!(matches!(err, CaptureError::DeviceOpen { .. }));
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    assert!(sink.frames.is_empty());
}
