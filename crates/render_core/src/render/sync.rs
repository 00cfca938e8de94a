//! Frame slot synchronization
//!
//! One fence and two binary semaphores per frame slot:
//!
//! ```text
//! acquire ──image_available──▶ submit ──render_finished──▶ present
//!                                │
//!                                └──in_flight fence──▶ CPU (next use of the slot)
//! ```
//!
//! A slot is reused every N-th frame, and only after its fence has signaled,
//! so the CPU never overwrites data the GPU may still read.
//!
//! # Fence lifecycle
//!
//! Fences start signaled, so the first pass over the slots does not block.
//! [`SyncPool::acquire_slot`] waits on the fence and resets it; from then
//! on exactly one submission must signal it again before the slot comes
//! around. The frame submission normally does that. A frame dropped after
//! the reset goes through [`SyncPool::abandon`], which signals the fence
//! with an empty batch.
//!
//! # Completed frames
//!
//! Each slot remembers the frame number it last carried. Once a fence wait
//! on that slot returns, that frame is known complete, and
//! [`SyncPool::completed_frame`] advances. The resource arena uses it to
//! release objects destroyed while earlier frames were still in flight.
//!
//! Waits use the configured fence timeout; expiry is reported as
//! [`RenderError::Timeout`] rather than blocking forever.

use crate::render::api::{GpuBackend, PipelineStage, QueueKind, RawFence, RawSemaphore, SubmitInfo};
use crate::render::{RenderError, RenderResult};

/// Synchronization objects of one frame slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSync {
    /// Signaled when the slot's GPU work completes
    pub in_flight: RawFence,
    /// Signaled when the acquired swapchain image is ready
    pub image_available: RawSemaphore,
    /// Signaled when rendering completes, waited by present
    pub render_finished: RawSemaphore,
}

/// A slot handed out for one logical frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    /// Slot index in `0..frames_in_flight`
    pub index: usize,
    /// Frame number the slot was acquired for
    pub frame: u64,
    /// The slot's synchronization objects
    pub sync: FrameSync,
}

#[derive(Debug)]
struct SlotState {
    sync: FrameSync,
    last_frame: Option<u64>,
    previous_frame: Option<u64>,
}

/// Fixed set of per-slot synchronization objects
#[derive(Debug)]
pub struct SyncPool {
    slots: Vec<SlotState>,
    completed_frame: Option<u64>,
    timeout_ns: u64,
}

impl SyncPool {
    /// Create `frames_in_flight` slots; fences start signaled
    pub fn new<B: GpuBackend>(backend: &mut B, frames_in_flight: usize, timeout_ns: u64) -> RenderResult<Self> {
        if frames_in_flight == 0 {
            return Err(RenderError::InvalidArgument("at least one frame slot is required".to_string()));
        }

        let mut pool = Self {
            slots: Vec::with_capacity(frames_in_flight),
            completed_frame: None,
            timeout_ns,
        };
        for _ in 0..frames_in_flight {
            let sync = match Self::create_sync(backend) {
                Ok(sync) => sync,
                Err(err) => {
                    pool.destroy(backend);
                    return Err(err);
                }
            };
            pool.slots.push(SlotState {
                sync,
                last_frame: None,
                previous_frame: None,
            });
        }
        log::debug!("Created {frames_in_flight} frame slots");
        Ok(pool)
    }

    fn create_sync<B: GpuBackend>(backend: &mut B) -> RenderResult<FrameSync> {
        let in_flight = backend.create_fence(true)?;
        let image_available = backend.create_semaphore()?;
        let render_finished = backend.create_semaphore()?;
        Ok(FrameSync {
            in_flight,
            image_available,
            render_finished,
        })
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool has no slots (only after `destroy`)
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot index used by `frame`
    pub fn slot_index(&self, frame: u64) -> usize {
        let count = self.slots.len().max(1) as u64;
        usize::try_from(frame % count).unwrap_or_default()
    }

    /// Wait for the slot `frame` maps to, then reset its fence
    ///
    /// On return the slot's previous frame has fully completed, so its
    /// command buffer and uniform region may be reused.
    pub fn acquire_slot<B: GpuBackend>(&mut self, backend: &mut B, frame: u64) -> RenderResult<FrameSlot> {
        let index = self.slot_index(frame);
        let timeout_ns = self.timeout_ns;
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| RenderError::invalid_operation("sync pool has been destroyed"))?;

        backend.wait_for_fence(slot.sync.in_flight, timeout_ns)?;
        if let Some(done) = slot.last_frame {
            self.completed_frame = Some(self.completed_frame.map_or(done, |current| current.max(done)));
        }
        backend.reset_fence(slot.sync.in_flight)?;

        slot.previous_frame = slot.last_frame;
        slot.last_frame = Some(frame);
        Ok(FrameSlot {
            index,
            frame,
            sync: slot.sync,
        })
    }

    /// Submission wiring: wait for the acquired image, signal render completion and the fence
    pub fn signal_on_submit(slot: &FrameSlot) -> SubmitInfo {
        SubmitInfo {
            command_buffers: Vec::new(),
            wait: vec![(slot.sync.image_available, PipelineStage::ColorAttachmentOutput)],
            signal: vec![slot.sync.render_finished],
            fence: Some(slot.sync.in_flight),
        }
    }

    /// Semaphore presentation must wait on
    pub const fn signal_on_present(slot: &FrameSlot) -> RawSemaphore {
        slot.sync.render_finished
    }

    /// Give up on a frame whose fence was reset but never submitted
    ///
    /// An empty submission re-signals the fence so the next wait on this slot
    /// cannot deadlock.
    pub fn abandon<B: GpuBackend>(&mut self, backend: &mut B, slot: &FrameSlot) -> RenderResult<()> {
        backend.submit(
            QueueKind::Graphics,
            &SubmitInfo {
                fence: Some(slot.sync.in_flight),
                ..SubmitInfo::default()
            },
        )?;
        if let Some(state) = self.slots.get_mut(slot.index) {
            if state.last_frame == Some(slot.frame) {
                state.last_frame = state.previous_frame;
            }
        }
        log::debug!("Abandoned frame {} on slot {}", slot.frame, slot.index);
        Ok(())
    }

    /// Newest frame number known to have completed on the GPU
    pub const fn completed_frame(&self) -> Option<u64> {
        self.completed_frame
    }

    /// Wait for every slot's fence
    pub fn wait_all<B: GpuBackend>(&mut self, backend: &mut B) -> RenderResult<()> {
        for slot in &self.slots {
            backend.wait_for_fence(slot.sync.in_flight, self.timeout_ns)?;
        }
        let newest = self.slots.iter().filter_map(|slot| slot.last_frame).max();
        if newest.is_some() {
            self.completed_frame = newest.max(self.completed_frame);
        }
        Ok(())
    }

    /// Destroy every fence and semaphore; the device must be idle
    pub fn destroy<B: GpuBackend>(&mut self, backend: &mut B) {
        for slot in self.slots.drain(..) {
            backend.destroy_fence(slot.sync.in_flight);
            backend.destroy_semaphore(slot.sync.image_available);
            backend.destroy_semaphore(slot.sync.render_finished);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::HeadlessBackend;

    fn submit_frame(backend: &mut HeadlessBackend, slot: &FrameSlot) {
        let cb = backend.allocate_command_buffer(QueueKind::Graphics).unwrap();
        backend.record(cb, &[]).unwrap();
        // No acquire in these tests, so nothing to wait on
        backend
            .submit(
                QueueKind::Graphics,
                &SubmitInfo {
                    command_buffers: vec![cb],
                    fence: Some(slot.sync.in_flight),
                    ..SubmitInfo::default()
                },
            )
            .unwrap();
    }

    #[test]
    fn test_first_use_of_each_slot_does_not_block() {
        let mut backend = HeadlessBackend::default();
        let mut pool = SyncPool::new(&mut backend, 3, u64::MAX).unwrap();
        for frame in 0..3 {
            let slot = pool.acquire_slot(&mut backend, frame).unwrap();
            assert_eq!(slot.index, frame as usize);
        }
        assert_eq!(backend.stats().blocking_fence_waits, 0);
        assert_eq!(pool.completed_frame(), None);
    }

    #[test]
    fn test_fence_is_signaled_before_slot_is_reused() {
        let mut backend = HeadlessBackend::default();
        let mut pool = SyncPool::new(&mut backend, 2, u64::MAX).unwrap();

        let first = pool.acquire_slot(&mut backend, 0).unwrap();
        submit_frame(&mut backend, &first);
        let second = pool.acquire_slot(&mut backend, 1).unwrap();
        submit_frame(&mut backend, &second);
        assert!(!backend.fence_signaled(first.sync.in_flight).unwrap());

        let again = pool.acquire_slot(&mut backend, 2).unwrap();
        assert_eq!(again.index, first.index);
        assert_eq!(backend.stats().blocking_fence_waits, 1);
        assert_eq!(pool.completed_frame(), Some(0));
        // The slot is handed out reset, ready for the next submission
        assert!(!backend.fence_signaled(again.sync.in_flight).unwrap());
    }

    #[test]
    fn test_unsubmitted_slot_times_out_instead_of_hanging() {
        let mut backend = HeadlessBackend::default();
        let mut pool = SyncPool::new(&mut backend, 1, 1_000).unwrap();
        pool.acquire_slot(&mut backend, 0).unwrap();

        let err = pool.acquire_slot(&mut backend, 1).unwrap_err();
        assert!(matches!(err, RenderError::Timeout(_)));
    }

    #[test]
    fn test_abandon_resignals_fence() {
        let mut backend = HeadlessBackend::default();
        let mut pool = SyncPool::new(&mut backend, 1, 1_000).unwrap();
        let slot = pool.acquire_slot(&mut backend, 0).unwrap();
        pool.abandon(&mut backend, &slot).unwrap();

        let retry = pool.acquire_slot(&mut backend, 0).unwrap();
        assert_eq!(retry.index, 0);
        assert_eq!(pool.completed_frame(), None);
    }

    #[test]
    fn test_submit_wiring_uses_slot_objects() {
        let mut backend = HeadlessBackend::default();
        let mut pool = SyncPool::new(&mut backend, 2, u64::MAX).unwrap();
        let slot = pool.acquire_slot(&mut backend, 0).unwrap();

        let info = SyncPool::signal_on_submit(&slot);
        assert_eq!(info.wait, vec![(slot.sync.image_available, PipelineStage::ColorAttachmentOutput)]);
        assert_eq!(info.signal, vec![slot.sync.render_finished]);
        assert_eq!(info.fence, Some(slot.sync.in_flight));
        assert_eq!(SyncPool::signal_on_present(&slot), slot.sync.render_finished);

        pool.destroy(&mut backend);
        assert!(pool.is_empty());
    }
}
