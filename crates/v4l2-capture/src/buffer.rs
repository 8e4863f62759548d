//! Memory-mapped buffer pool
//!
//! The pool is an index-addressed arena of [`CaptureBuffer`] slots. Each slot
//! owns its mapping and an ownership tag that follows every QBUF/DQBUF, so the
//! application can only read a buffer the driver has handed back.

use std::io;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::device::ControlChannel;
use crate::error::CaptureError;
use crate::memory::MappedRegion;

/// Default number of buffers requested from the driver
pub const DEFAULT_BUFFER_COUNT: u32 = 2;

/// Who may touch a buffer's memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Owned by the driver, which may write it at any time
    QueuedToDriver,
    /// Owned by the application, which may read `bytes_used` bytes
    DequeuedReady,
}

/// One slot of the pool
pub struct CaptureBuffer {
    index: u32,
    memory: MappedRegion,
    state: BufferState,
}

impl CaptureBuffer {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Mapped length in bytes
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    pub fn state(&self) -> BufferState {
        self.state
    }
}

/// A completed frame, borrowed from the pool until it is requeued
#[derive(Debug)]
pub struct ReadyFrame<'a> {
    index: u32,
    sequence: u32,
    timestamp: Duration,
    data: &'a [u8],
}

impl<'a> ReadyFrame<'a> {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Driver frame counter
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Driver capture timestamp (monotonic clock on most drivers)
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn bytes_used(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

/// Fixed-size pool of driver buffers.
///
/// The size is whatever the driver granted and never changes afterwards.
/// Dropping the pool unmaps every buffer.
pub struct BufferPool {
    requested: u32,
    granted: u32,
    buffers: Vec<CaptureBuffer>,
}

impl BufferPool {
    /// Request `count` memory-mapped buffers.
    ///
    /// The driver may grant a different number; the granted count becomes the
    /// pool size.
    pub fn allocate<D: ControlChannel + ?Sized>(
        device: &mut D,
        count: u32,
    ) -> Result<Self, CaptureError> {
        let granted = device
            .request_buffers(count)
            .map_err(|source| CaptureError::BufferAllocation {
                requested: count,
                source,
            })?;

        if granted == 0 {
            return Err(CaptureError::BufferAllocation {
                requested: count,
                source: io::Error::new(io::ErrorKind::OutOfMemory, "driver granted no buffers"),
            });
        }
        if granted != count {
            warn!("Requested {} buffers, driver granted {}", count, granted);
        }

        debug!("Allocated {} buffers", granted);
        Ok(Self {
            requested: count,
            granted,
            buffers: Vec::new(),
        })
    }

    /// Allocate, map and queue in one go
    pub fn prepare<D: ControlChannel + ?Sized>(
        device: &mut D,
        count: u32,
    ) -> Result<Self, CaptureError> {
        let mut pool = Self::allocate(device, count)?;
        pool.map_all(device)?;
        pool.queue_all(device)?;
        Ok(pool)
    }

    /// Query and map every granted buffer.
    ///
    /// A failure on any buffer releases the ones already mapped; the pool is
    /// either fully mapped or not mapped at all.
    pub fn map_all<D: ControlChannel + ?Sized>(&mut self, device: &mut D) -> Result<(), CaptureError> {
        if !self.buffers.is_empty() {
            return Err(CaptureError::PoolState("already mapped"));
        }

        let mut buffers = Vec::with_capacity(self.granted as usize);
        for index in 0..self.granted {
            let placement = device
                .query_buffer(index)
                .map_err(|source| CaptureError::Mapping { index, source })?;
            let memory = device
                .map_buffer(&placement)
                .map_err(|source| CaptureError::Mapping { index, source })?;
            debug!(
                "Mapped buffer {} ({} bytes at offset {:#x})",
                index, placement.length, placement.offset
            );
            buffers.push(CaptureBuffer {
                index,
                memory,
                state: BufferState::DequeuedReady,
            });
        }

        self.buffers = buffers;
        info!("Mapped {} capture buffers", self.buffers.len());
        Ok(())
    }

    /// Hand every application-owned buffer to the driver
    pub fn queue_all<D: ControlChannel + ?Sized>(&mut self, device: &mut D) -> Result<(), CaptureError> {
        for index in 0..self.buffers.len() as u32 {
            if self.buffers[index as usize].state == BufferState::DequeuedReady {
                self.queue_one(device, index)?;
            }
        }
        Ok(())
    }

    /// Take back one completed buffer.
    ///
    /// Call only after a readiness wait reported `Ready`. The returned frame
    /// borrows the pool, so the buffer cannot be requeued while it is read.
    pub fn dequeue_one<D: ControlChannel + ?Sized>(
        &mut self,
        device: &mut D,
    ) -> Result<ReadyFrame<'_>, CaptureError> {
        let done = device.dequeue_buffer().map_err(CaptureError::Dequeue)?;
        let pool_size = self.buffers.len();

        let buffer = self
            .buffers
            .get_mut(done.index as usize)
            .ok_or(CaptureError::UnknownBuffer {
                index: done.index,
                pool_size,
            })?;
        if buffer.state != BufferState::QueuedToDriver {
            return Err(CaptureError::Ownership {
                index: done.index,
                expected: BufferState::QueuedToDriver,
                actual: buffer.state,
            });
        }

        let bytes_used = done.bytes_used as usize;
        if bytes_used > buffer.memory.len() {
            return Err(CaptureError::Dequeue(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "driver reported {} bytes used in buffer {} of {} bytes",
                    bytes_used,
                    done.index,
                    buffer.memory.len()
                ),
            )));
        }

        // the frame borrows the pool, so the buffer cannot be requeued while it is read
        buffer.state = BufferState::DequeuedReady;
        let data = buffer.memory.bytes(bytes_used);
        Ok(ReadyFrame {
            index: done.index,
            sequence: done.sequence,
            timestamp: done.timestamp,
            data,
        })
    }

    /// Return buffer `index` to the driver
    pub fn queue_one<D: ControlChannel + ?Sized>(
        &mut self,
        device: &mut D,
        index: u32,
    ) -> Result<(), CaptureError> {
        let pool_size = self.buffers.len();
        let buffer = self
            .buffers
            .get_mut(index as usize)
            .ok_or(CaptureError::UnknownBuffer { index, pool_size })?;
        if buffer.state != BufferState::DequeuedReady {
            return Err(CaptureError::Ownership {
                index,
                expected: BufferState::DequeuedReady,
                actual: buffer.state,
            });
        }

        device
            .enqueue_buffer(index)
            .map_err(|source| CaptureError::Enqueue { index, source })?;
        buffer.state = BufferState::QueuedToDriver;
        Ok(())
    }

    /// Release every mapping. Only valid once streaming has stopped.
    pub fn unmap_all(self) {
        debug!("Unmapping {} capture buffers", self.buffers.len());
        drop(self);
    }

    /// Number of buffers granted by the driver
    pub fn len(&self) -> usize {
        self.granted as usize
    }

    pub fn is_empty(&self) -> bool {
        self.granted == 0
    }

    pub fn requested(&self) -> u32 {
        self.requested
    }

    pub fn is_mapped(&self) -> bool {
        !self.buffers.is_empty()
    }

    pub fn buffer(&self, index: u32) -> Option<&CaptureBuffer> {
        self.buffers.get(index as usize)
    }

    pub fn buffers(&self) -> impl Iterator<Item = &CaptureBuffer> {
        self.buffers.iter()
    }

    /// Buffers currently owned by the driver
    pub fn queued_count(&self) -> usize {
        self.buffers
            .iter()
            .filter(|b| b.state == BufferState::QueuedToDriver)
            .count()
    }

    /// First mapped buffer not owned by the driver, if any
    pub fn first_unqueued(&self) -> Option<u32> {
        self.buffers
            .iter()
            .find(|b| b.state != BufferState::QueuedToDriver)
            .map(|b| b.index)
    }

    /// Mapped and every buffer owned by the driver
    pub fn is_fully_queued(&self) -> bool {
        self.is_mapped() && self.first_unqueued().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockFailure, MockOp, MockScript};
    use crate::device::Readiness;
    use proptest::prelude::*;

    fn streaming_pool(script: MockScript, count: u32) -> (MockDevice, BufferPool) {
        let mut device = MockDevice::new(script);
        let pool = BufferPool::prepare(&mut device, count).unwrap();
        device.stream_on().unwrap();
        (device, pool)
    }

    #[test]
    fn test_pool_uses_granted_count() {
        let script = MockScript {
            granted_buffers: Some(1),
            ..Default::default()
        };
        let mut device = MockDevice::new(script);
        let monitor = device.monitor();

        let pool = BufferPool::prepare(&mut device, 4).unwrap();
        assert_eq!(pool.requested(), 4);
        assert_eq!(pool.len(), 1);
        assert!(pool.is_fully_queued());
        assert_eq!(monitor.queried_indices(), vec![0]);
    }

    #[test]
    fn test_zero_granted_is_allocation_error() {
        let script = MockScript {
            granted_buffers: Some(0),
            ..Default::default()
        };
        let mut device = MockDevice::new(script);
        let err = BufferPool::allocate(&mut device, 2).err().unwrap();
        assert!(matches!(err, CaptureError::BufferAllocation { requested: 2, .. }));
    }

    #[test]
    fn test_mapping_failure_leaves_no_partial_pool() {
        let script = MockScript {
            fail: Some(MockFailure::after(MockOp::MapBuffer, 1, libc::ENOMEM)),
            ..Default::default()
        };
        let mut device = MockDevice::new(script);
        let mut pool = BufferPool::allocate(&mut device, 2).unwrap();

        let err = pool.map_all(&mut device).unwrap_err();
        assert!(matches!(err, CaptureError::Mapping { index: 1, .. }));
        assert!(!pool.is_mapped());
        assert_eq!(pool.buffers().count(), 0);
    }

    #[test]
    fn test_mapping_twice_is_rejected() {
        let mut device = MockDevice::new(MockScript::default());
        let mut pool = BufferPool::allocate(&mut device, 2).unwrap();
        pool.map_all(&mut device).unwrap();
        assert!(matches!(
            pool.map_all(&mut device),
            Err(CaptureError::PoolState("already mapped"))
        ));
        assert_eq!(pool.buffers().count(), 2);
    }

    #[test]
    fn test_ownership_follows_dequeue_and_queue() {
        let (mut device, mut pool) = streaming_pool(MockScript::default(), 2);
        assert_eq!(pool.queued_count(), 2);

        let index = {
            let frame = pool.dequeue_one(&mut device).unwrap();
            assert_eq!(frame.bytes_used(), MockScript::default().frame_sizes[0] as usize);
            frame.index()
        };
        assert_eq!(pool.buffer(index).unwrap().state(), BufferState::DequeuedReady);
        assert_eq!(pool.queued_count(), 1);

        pool.queue_one(&mut device, index).unwrap();
        assert_eq!(pool.buffer(index).unwrap().state(), BufferState::QueuedToDriver);

        let err = pool.queue_one(&mut device, index).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::Ownership { expected: BufferState::DequeuedReady, .. }
        ));
    }

    #[test]
    fn test_queue_unknown_index() {
        let (mut device, mut pool) = streaming_pool(MockScript::default(), 2);
        let err = pool.queue_one(&mut device, 7).unwrap_err();
        assert!(matches!(err, CaptureError::UnknownBuffer { index: 7, pool_size: 2 }));
    }

    #[test]
    fn test_oversized_bytes_used_is_rejected() {
        let script = MockScript {
            buffer_length: 1024,
            frame_sizes: vec![2048],
            ..Default::default()
        };
        let (mut device, mut pool) = streaming_pool(script, 2);
        let err = pool.dequeue_one(&mut device).unwrap_err();
        assert!(matches!(err, CaptureError::Dequeue(ref e) if e.kind() == io::ErrorKind::InvalidData));
    }

    #[test]
    fn test_pool_of_two_stalls_without_requeue() {
        let (mut device, mut pool) = streaming_pool(MockScript::default(), 2);

        for _ in 0..2 {
            assert_eq!(device.wait_ready(Duration::from_millis(1)).unwrap(), Readiness::Ready);
            pool.dequeue_one(&mut device).unwrap();
        }

        // both buffers are with the application: the driver has nothing to fill
        assert_eq!(pool.queued_count(), 0);
        assert_eq!(
            device.wait_ready(Duration::from_millis(1)).unwrap(),
            Readiness::TimedOut
        );
        let err = pool.dequeue_one(&mut device).unwrap_err();
        assert!(matches!(err, CaptureError::Dequeue(ref e) if e.kind() == io::ErrorKind::WouldBlock));
    }

    proptest! {
        #[test]
        fn prop_mapped_regions_do_not_overlap(count in 1u32..8, length in 1u32..65536) {
            let script = MockScript {
                buffer_length: length,
                ..Default::default()
            };
            let mut device = MockDevice::new(script);
            let pool = BufferPool::prepare(&mut device, count).unwrap();

            let ranges: Vec<_> = pool.buffers().map(|b| b.memory.address_range()).collect();
            prop_assert_eq!(ranges.len(), count as usize);
            for (i, a) in ranges.iter().enumerate() {
                prop_assert_eq!(a.end - a.start, length as usize);
                for b in ranges.iter().skip(i + 1) {
                    prop_assert!(a.end <= b.start || b.end <= a.start);
                }
            }
        }

        #[test]
        fn prop_granted_count_bounds_indexing(requested in 1u32..8, granted in 1u32..8) {
            let script = MockScript {
                granted_buffers: Some(granted),
                ..Default::default()
            };
            let mut device = MockDevice::new(script);
            let monitor = device.monitor();
            let pool = BufferPool::prepare(&mut device, requested).unwrap();

            prop_assert_eq!(pool.len(), granted as usize);
            prop_assert!(monitor.queried_indices().iter().all(|&i| i < granted));
            prop_assert!(pool.buffer(granted).is_none());
        }

        #[test]
        fn prop_delivered_bytes_within_mapping(sizes in proptest::collection::vec(0u32..=4096, 1..16)) {
            let script = MockScript {
                buffer_length: 4096,
                frame_sizes: sizes.clone(),
                ..Default::default()
            };
            let (mut device, mut pool) = streaming_pool(script, 2);

            for expected in &sizes {
                let (index, used) = {
                    let frame = pool.dequeue_one(&mut device).unwrap();
                    (frame.index(), frame.bytes_used())
                };
                prop_assert_eq!(used, *expected as usize);
                prop_assert!(used <= pool.buffer(index).unwrap().len());
                pool.queue_one(&mut device, index).unwrap();
            }
        }
    }
}
