//! Scripted synthetic driver
//!
//! [`MockDevice`] implements [`ControlChannel`] without hardware. It keeps a
//! FIFO of queued buffers like a real driver, completes them on demand, writes
//! a recognisable fill byte into each completed frame, and records every
//! driver-side operation so tests can check ordering and ownership.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io;
use std::os::fd::FromRawFd;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use crate::device::{
    BufferPlacement, Capabilities, ControlChannel, DequeuedBuffer, Readiness, StreamParams,
};
use crate::format::{FieldOrder, FrameInterval, ImageFormat, PixelFormat};
use crate::memory::MappedRegion;

/// Path reported for every synthetic device
pub const MOCK_DEVICE_PATH: &str = "mock";

const PAGE_SIZE: u32 = 4096;

/// Driver operation, used to target injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    QueryCapabilities,
    GetStreamParams,
    SetStreamParams,
    SetFormat,
    RequestBuffers,
    QueryBuffer,
    MapBuffer,
    Enqueue,
    Dequeue,
    StreamOn,
    StreamOff,
    WaitReady,
}

/// Make `op` fail with `errno` once it has succeeded `after` times
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockFailure {
    pub op: MockOp,
    pub after: usize,
    pub errno: i32,
    /// Fail a single call instead of every call from then on
    pub once: bool,
}

impl MockFailure {
    /// Fail the first call of `op`
    pub fn on(op: MockOp, errno: i32) -> Self {
        Self::after(op, 0, errno)
    }

    pub fn after(op: MockOp, after: usize, errno: i32) -> Self {
        Self {
            op,
            after,
            errno,
            once: false,
        }
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }
}

/// Behaviour of the synthetic driver
#[derive(Debug, Clone)]
pub struct MockScript {
    /// Buffers granted by REQBUFS; `None` grants what was requested
    pub granted_buffers: Option<u32>,
    /// Length of every buffer
    pub buffer_length: u32,
    /// `bytes_used` of successive frames, cycled
    pub frame_sizes: Vec<u32>,
    /// Frames the driver completes before going quiet; `None` is unlimited
    pub frames: Option<usize>,
    pub fail: Option<MockFailure>,
    /// Pixel format the driver commits instead of the requested one
    pub substitute_pixel_format: Option<PixelFormat>,
    /// Field order the driver commits instead of the requested one
    pub committed_field: Option<FieldOrder>,
    pub capabilities: u32,
    /// Readiness waits that report a signal before any other outcome
    pub interrupted_waits: usize,
    /// Complete frames at the committed frame interval instead of at once
    pub paced: bool,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            granted_buffers: None,
            buffer_length: 64 * 1024,
            frame_sizes: vec![4096],
            frames: None,
            fail: None,
            substitute_pixel_format: None,
            committed_field: None,
            capabilities: Capabilities::STREAMING_CAPTURE,
            interrupted_waits: 0,
            paced: false,
        }
    }
}

impl MockScript {
    /// A camera that delivers `frame_size` byte frames in real time
    pub fn paced(frame_size: u32) -> Self {
        Self {
            frame_sizes: vec![frame_size],
            paced: true,
            ..Default::default()
        }
    }
}

/// Driver-side operation log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockEvent {
    GetStreamParams,
    SetStreamParams(FrameInterval),
    SetFormat(ImageFormat),
    RequestBuffers { requested: u32, granted: u32 },
    QueryBuffer(u32),
    MapBuffer(u32),
    Enqueue(u32),
    Dequeue { index: u32, bytes_used: u32 },
    StreamOn,
    StreamOff,
}

/// Buffer memory the driver owns: a memory file holding every buffer
/// back to back, plus the driver's own view of it
struct DriverMemory {
    file: File,
    view: MmapMut,
}

impl DriverMemory {
    fn create(len: usize) -> io::Result<Self> {
        // SAFETY: the name is NUL-terminated
        let fd = unsafe { libc::memfd_create(b"v4l2-mock\0".as_ptr().cast(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd is a fresh descriptor nothing else owns
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(len as u64)?;
        // SAFETY: the file is private to this driver; application mappings
        // only read buffers the driver has handed back
        let view = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, view })
    }
}

struct MockState {
    script: MockScript,
    streaming: bool,
    stream_params: StreamParams,
    buffers: u32,
    memory: Option<DriverMemory>,
    lease: Arc<()>,
    queue: VecDeque<u32>,
    calls: HashMap<MockOp, usize>,
    failed_once: bool,
    delivered: usize,
    next_frame_due: Option<Instant>,
    events: Vec<MockEvent>,
}

impl MockState {
    fn check(&mut self, op: MockOp) -> io::Result<()> {
        let calls = self.calls.entry(op).or_insert(0);
        let call = *calls;
        *calls += 1;

        match self.script.fail {
            Some(fail) if fail.op == op && call >= fail.after && !(fail.once && self.failed_once) => {
                self.failed_once = true;
                debug!("Mock driver failing {:?} with errno {}", op, fail.errno);
                Err(io::Error::from_raw_os_error(fail.errno))
            }
            _ => Ok(()),
        }
    }

    fn frame_budget_left(&self) -> bool {
        self.script.frames.map_or(true, |limit| self.delivered < limit)
    }

    /// Buffer stride in the memory file, rounded up to whole pages
    fn aligned_length(&self) -> u32 {
        ((self.script.buffer_length + PAGE_SIZE - 1) / PAGE_SIZE).max(1) * PAGE_SIZE
    }

    fn frame_period(&self) -> Option<Duration> {
        if !self.script.paced {
            return None;
        }
        self.stream_params.time_per_frame.duration()
    }

    /// Time left until the next frame completes
    fn until_next_frame(&self) -> Duration {
        self.next_frame_due
            .map(|due| due.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }
}

/// Synthetic capture device
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

/// Observer handle onto a [`MockDevice`], usable after the device moved
#[derive(Clone)]
pub struct MockMonitor {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockDevice {
    pub fn new(script: MockScript) -> Self {
        let state = MockState {
            script,
            streaming: false,
            stream_params: StreamParams {
                capability: StreamParams::TIME_PER_FRAME,
                capture_mode: 0,
                time_per_frame: FrameInterval::from_fps(15),
                extended_mode: 0,
                read_buffers: 0,
            },
            buffers: 0,
            memory: None,
            lease: Arc::new(()),
            queue: VecDeque::new(),
            calls: HashMap::new(),
            failed_once: false,
            delivered: 0,
            next_frame_due: None,
            events: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn monitor(&self) -> MockMonitor {
        MockMonitor {
            state: Arc::clone(&self.state),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }
}

impl MockMonitor {
    fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.state().events.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.state().streaming
    }

    /// Buffers currently owned by the driver, in completion order
    pub fn queued_indices(&self) -> Vec<u32> {
        self.state().queue.iter().copied().collect()
    }

    /// Whether the application currently owns buffer `index`
    pub fn is_with_application(&self, index: u32) -> bool {
        let state = self.state();
        index < state.buffers && !state.queue.contains(&index)
    }

    pub fn dequeue_count(&self) -> usize {
        self.state().delivered
    }

    /// Readiness waits made so far, including failed ones
    pub fn wait_count(&self) -> usize {
        self.state().calls.get(&MockOp::WaitReady).copied().unwrap_or(0)
    }

    pub fn queried_indices(&self) -> Vec<u32> {
        self.state()
            .events
            .iter()
            .filter_map(|e| match e {
                MockEvent::QueryBuffer(index) => Some(*index),
                _ => None,
            })
            .collect()
    }

    /// Mappings the application side still holds
    pub fn live_mappings(&self) -> usize {
        Arc::strong_count(&self.state().lease) - 1
    }
}

impl ControlChannel for MockDevice {
    fn path(&self) -> &Path {
        Path::new(MOCK_DEVICE_PATH)
    }

    fn query_capabilities(&mut self) -> io::Result<Capabilities> {
        let mut state = self.state();
        state.check(MockOp::QueryCapabilities)?;
        Ok(Capabilities {
            driver: "mock".into(),
            card: "Synthetic H.264 camera".into(),
            bus_info: "platform:mock".into(),
            capabilities: state.script.capabilities,
            device_caps: 0,
        })
    }

    fn get_stream_params(&mut self) -> io::Result<StreamParams> {
        let mut state = self.state();
        state.check(MockOp::GetStreamParams)?;
        state.events.push(MockEvent::GetStreamParams);
        Ok(state.stream_params)
    }

    fn set_stream_params(&mut self, params: &StreamParams) -> io::Result<StreamParams> {
        let mut state = self.state();
        state.check(MockOp::SetStreamParams)?;
        state.events.push(MockEvent::SetStreamParams(params.time_per_frame));
        state.stream_params.time_per_frame = params.time_per_frame;
        Ok(state.stream_params)
    }

    fn set_format(&mut self, format: &ImageFormat) -> io::Result<ImageFormat> {
        let mut state = self.state();
        state.check(MockOp::SetFormat)?;
        if state.streaming {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        state.events.push(MockEvent::SetFormat(*format));

        let mut committed = *format;
        if let Some(substitute) = state.script.substitute_pixel_format {
            committed.pixel_format = substitute;
        }
        if let Some(field) = state.script.committed_field {
            committed.field = field;
        }
        committed.size_image = state.script.buffer_length;
        Ok(committed)
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let mut state = self.state();
        state.check(MockOp::RequestBuffers)?;
        if state.streaming {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        let granted = state.script.granted_buffers.unwrap_or(count);
        state.memory = if granted == 0 {
            None
        } else {
            let len = granted as usize * state.aligned_length() as usize;
            Some(DriverMemory::create(len)?)
        };
        state.events.push(MockEvent::RequestBuffers {
            requested: count,
            granted,
        });
        state.buffers = granted;
        state.queue.clear();
        Ok(granted)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferPlacement> {
        let mut state = self.state();
        state.check(MockOp::QueryBuffer)?;
        if index >= state.buffers {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        state.events.push(MockEvent::QueryBuffer(index));
        Ok(BufferPlacement {
            index,
            offset: index * state.aligned_length(),
            length: state.script.buffer_length,
        })
    }

    fn map_buffer(&mut self, placement: &BufferPlacement) -> io::Result<MappedRegion> {
        let mut state = self.state();
        state.check(MockOp::MapBuffer)?;
        let index = placement.offset / state.aligned_length();
        let memory = state
            .memory
            .as_ref()
            .filter(|_| index < state.buffers)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;

        let region = MappedRegion::leased(
            &memory.file,
            placement.offset as u64,
            placement.length as usize,
            Arc::clone(&state.lease),
        )?;
        state.events.push(MockEvent::MapBuffer(index));
        Ok(region)
    }

    fn enqueue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut state = self.state();
        state.check(MockOp::Enqueue)?;
        if index >= state.buffers || state.queue.contains(&index) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        state.queue.push_back(index);
        state.events.push(MockEvent::Enqueue(index));
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer> {
        let mut state = self.state();
        state.check(MockOp::Dequeue)?;
        if !state.streaming {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if !state.frame_budget_left() || !state.until_next_frame().is_zero() {
            return Err(io::Error::from_raw_os_error(libc::EAGAIN));
        }
        let index = state
            .queue
            .pop_front()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EAGAIN))?;

        let sequence = state.delivered;
        let sizes = &state.script.frame_sizes;
        let bytes_used = if sizes.is_empty() { 0 } else { sizes[sequence % sizes.len()] };
        let start = (index * state.aligned_length()) as usize;
        let fill = bytes_used.min(state.script.buffer_length) as usize;
        if let Some(memory) = state.memory.as_mut() {
            memory.view[start..start + fill].fill(sequence as u8);
        }

        state.delivered += 1;
        if let Some(period) = state.frame_period() {
            let due = state.next_frame_due.unwrap_or_else(Instant::now);
            state.next_frame_due = Some(due + period);
        }
        state.events.push(MockEvent::Dequeue { index, bytes_used });

        Ok(DequeuedBuffer {
            index,
            bytes_used,
            sequence: sequence as u32,
            timestamp: Duration::from_micros(sequence as u64 * 33_333),
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut state = self.state();
        state.check(MockOp::StreamOn)?;
        state.streaming = true;
        state.next_frame_due = state.frame_period().map(|period| Instant::now() + period);
        state.events.push(MockEvent::StreamOn);
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut state = self.state();
        state.check(MockOp::StreamOff)?;
        state.streaming = false;
        // the driver hands every queued buffer back on STREAMOFF
        state.queue.clear();
        state.events.push(MockEvent::StreamOff);
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> io::Result<Readiness> {
        let (ready, until_frame) = {
            let mut state = self.state();
            state.check(MockOp::WaitReady)?;
            if !state.streaming {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            if state.script.interrupted_waits > 0 {
                state.script.interrupted_waits -= 1;
                return Ok(Readiness::Interrupted);
            }
            (
                !state.queue.is_empty() && state.frame_budget_left(),
                state.until_next_frame(),
            )
        };

        if ready && until_frame <= timeout {
            thread::sleep(until_frame);
            Ok(Readiness::Ready)
        } else if ready {
            thread::sleep(timeout);
            Ok(Readiness::TimedOut)
        } else {
            thread::sleep(timeout.min(Duration::from_millis(1)));
            Ok(Readiness::TimedOut)
        }
    }
}
