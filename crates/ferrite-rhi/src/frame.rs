//! Frames in flight.
//!
//! Up to [`MAX_FRAMES_IN_FLIGHT`] frames overlap on the GPU. Each frame slot
//! owns a command pool with one primary buffer, three semaphores and a fence.
//! A slot cycles through `Retired -> Recording -> Submitted -> Retired`; its
//! pool is only reset once its fence has been observed signaled, so work
//! recorded in slot `i + k` never starts before slot `i` has finished. A
//! retired slot only starts recording after its pool has been reset.
//!
//! The per-frame protocol lives in [`FrameController`] and talks to the GPU
//! through [`FrameBackend`], so the ordering can be checked without a device.

use ash::vk;

use crate::command::{CommandPoolDesc, SubmitDesc};
use crate::device::Device;
use crate::error::{RhiError, Result};
use crate::handle::{create_all, CommandBuffer, CommandPool, Fence, RhiHandle, Semaphore};
use crate::swapchain::{AcquireOutcome, PresentOutcome, SwapchainManager, WindowHost};

/// Number of frame slots.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Where a frame slot is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// The slot's command buffer is open for recording.
    Recording,
    /// GPU work for the slot is pending behind its fence.
    Submitted,
    /// The slot's fence has been observed signaled.
    Retired,
}

/// Per-slot state machine and the rotating slot index.
#[derive(Debug, Clone)]
pub struct SlotTracker {
    states: [SlotState; MAX_FRAMES_IN_FLIGHT],
    /// Pool reset since the slot's last submission.
    pools_reset: [bool; MAX_FRAMES_IN_FLIGHT],
    current: usize,
    frames_issued: u64,
}

impl Default for SlotTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotTracker {
    /// Fences start signaled, so every slot starts retired.
    pub const fn new() -> Self {
        Self {
            states: [SlotState::Retired; MAX_FRAMES_IN_FLIGHT],
            pools_reset: [false; MAX_FRAMES_IN_FLIGHT],
            current: 0,
            frames_issued: 0,
        }
    }

    pub const fn current(&self) -> usize {
        self.current
    }

    /// Frames that have advanced the slot index.
    pub const fn frames_issued(&self) -> u64 {
        self.frames_issued
    }

    pub const fn state(&self, slot: usize) -> SlotState {
        self.states[slot]
    }

    /// Slots with GPU work outstanding.
    pub fn outstanding(&self) -> usize {
        self.states
            .iter()
            .filter(|s| **s == SlotState::Submitted)
            .count()
    }

    fn transition(&mut self, from: &[SlotState], to: SlotState) -> Result<()> {
        let state = &mut self.states[self.current];
        if !from.contains(state) {
            return Err(RhiError::InvalidState(format!(
                "frame slot {} cannot go from {state:?} to {to:?}",
                self.current
            )));
        }
        *state = to;
        Ok(())
    }

    /// The current slot's fence was observed signaled.
    pub fn retire_current(&mut self) -> Result<()> {
        self.transition(&[SlotState::Submitted, SlotState::Retired], SlotState::Retired)
    }

    /// Fail unless the current slot's GPU work is known to be finished.
    pub fn ensure_retired(&self) -> Result<()> {
        match self.states[self.current] {
            SlotState::Retired => Ok(()),
            state => Err(RhiError::InvalidState(format!(
                "frame slot {} is {state:?}; wait for its fence first",
                self.current
            ))),
        }
    }

    /// The current slot's command pool was reset.
    pub fn mark_pool_reset(&mut self) -> Result<()> {
        self.ensure_retired()?;
        self.pools_reset[self.current] = true;
        Ok(())
    }

    pub const fn pool_reset(&self, slot: usize) -> bool {
        self.pools_reset[slot]
    }

    /// Fail unless the current slot is retired with a freshly reset pool.
    pub fn ensure_ready_to_record(&self) -> Result<()> {
        self.ensure_retired()?;
        if self.pools_reset[self.current] {
            Ok(())
        } else {
            Err(RhiError::InvalidState(format!(
                "frame slot {} command pool was not reset since its last submission",
                self.current
            )))
        }
    }

    pub fn begin_current(&mut self) -> Result<()> {
        self.ensure_ready_to_record()?;
        self.transition(&[SlotState::Retired], SlotState::Recording)
    }

    pub fn submit_current(&mut self) -> Result<()> {
        self.transition(&[SlotState::Recording], SlotState::Submitted)?;
        self.pools_reset[self.current] = false;
        Ok(())
    }

    /// A fenced submission without recorded commands went out for the slot.
    pub fn submit_current_unrecorded(&mut self) -> Result<()> {
        self.transition(&[SlotState::Retired], SlotState::Submitted)?;
        self.pools_reset[self.current] = false;
        Ok(())
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % MAX_FRAMES_IN_FLIGHT;
        self.frames_issued += 1;
    }
}

/// Native operations the frame protocol is built from.
pub trait FrameBackend {
    /// Block until the slot's fence signals.
    fn wait_slot_fence(&mut self, slot: usize) -> Result<()>;
    fn reset_slot_fence(&mut self, slot: usize) -> Result<()>;
    fn reset_slot_pool(&mut self, slot: usize) -> Result<()>;
    /// Acquire the next image, signaling the slot's image-available semaphore.
    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome>;
    fn begin_slot_commands(&mut self, slot: usize) -> Result<()>;
    fn end_slot_commands(&mut self, slot: usize) -> Result<()>;
    /// Submit the slot's command buffer, fenced by the slot fence.
    fn submit_slot(&mut self, slot: usize) -> Result<()>;
    /// Submit nothing but a wait on the slot's image-available semaphore,
    /// fenced by the slot fence.
    fn submit_semaphore_drain(&mut self, slot: usize) -> Result<()>;
    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;
    fn rebuild_swapchain(&mut self) -> Result<()>;
}

/// Outcome of [`FrameController::prepare_before_pass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStatus {
    /// The slot's command buffer is recording against the acquired image.
    Recording { image_index: u32 },
    /// The swapchain was rebuilt; record nothing this tick.
    Rebuilt,
}

/// Drives the per-frame protocol over a [`FrameBackend`].
#[derive(Debug, Default)]
pub struct FrameController {
    tracker: SlotTracker,
    image_index: Option<u32>,
}

impl FrameController {
    pub const fn new() -> Self {
        Self {
            tracker: SlotTracker::new(),
            image_index: None,
        }
    }

    pub const fn tracker(&self) -> &SlotTracker {
        &self.tracker
    }

    pub const fn current_slot(&self) -> usize {
        self.tracker.current()
    }

    /// Image acquired for the frame being recorded.
    pub const fn image_index(&self) -> Option<u32> {
        self.image_index
    }

    /// Wait for the current slot's previous submission to finish.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_for_slot(&mut self, backend: &mut impl FrameBackend) -> Result<()> {
        backend.wait_slot_fence(self.tracker.current())?;
        self.tracker.retire_current()
    }

    /// Recycle the current slot's command buffer.
    pub fn reset_slot_pool(&mut self, backend: &mut impl FrameBackend) -> Result<()> {
        self.tracker.ensure_retired()?;
        backend.reset_slot_pool(self.tracker.current())?;
        self.tracker.mark_pool_reset()
    }

    /// Acquire a swapchain image and open the slot's command buffer.
    ///
    /// The slot must be retired and its pool reset; nothing is acquired
    /// otherwise. On an out-of-date swapchain the slot is left untouched. On a
    /// suboptimal one the acquired image's semaphore is consumed by an empty
    /// fenced submission and the slot index advances.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn prepare_before_pass(&mut self, backend: &mut impl FrameBackend) -> Result<PassStatus> {
        let slot = self.tracker.current();
        self.tracker.ensure_ready_to_record()?;

        match backend.acquire_image(slot)? {
            AcquireOutcome::OutOfDate => {
                backend.rebuild_swapchain()?;
                Ok(PassStatus::Rebuilt)
            }
            AcquireOutcome::Suboptimal => {
                backend.rebuild_swapchain()?;
                backend.reset_slot_fence(slot)?;
                backend.submit_semaphore_drain(slot)?;
                self.tracker.submit_current_unrecorded()?;
                self.tracker.advance();
                Ok(PassStatus::Rebuilt)
            }
            AcquireOutcome::Acquired(image_index) => {
                backend.begin_slot_commands(slot)?;
                self.tracker.begin_current()?;
                self.image_index = Some(image_index);
                Ok(PassStatus::Recording { image_index })
            }
        }
    }

    /// Submit the recorded frame, present it and advance the slot.
    ///
    /// Returns whether presentation forced a swapchain rebuild.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit_rendering(&mut self, backend: &mut impl FrameBackend) -> Result<bool> {
        let slot = self.tracker.current();
        let image_index = self.image_index.take().ok_or_else(|| {
            RhiError::InvalidState(format!("frame slot {slot} has no acquired image to submit"))
        })?;

        backend.end_slot_commands(slot)?;
        backend.reset_slot_fence(slot)?;
        backend.submit_slot(slot)?;
        self.tracker.submit_current()?;

        let rebuilt = match backend.present(slot, image_index)? {
            PresentOutcome::Presented => false,
            PresentOutcome::NeedsRebuild => {
                backend.rebuild_swapchain()?;
                true
            }
        };
        self.tracker.advance();
        Ok(rebuilt)
    }
}

/// Native objects of one frame slot.
pub struct FrameSlot {
    command_pool: CommandPool,
    command_buffer: CommandBuffer,
    image_available: Semaphore,
    render_finished: Semaphore,
    texture_copy: Semaphore,
    in_flight: Fence,
}

impl FrameSlot {
    fn new(device: &Device) -> Result<Self> {
        let mut slot = Self::unallocated();
        if let Err(e) = slot.allocate(device) {
            slot.destroy(device);
            return Err(e);
        }
        Ok(slot)
    }

    /// A slot holding only null handles.
    const fn unallocated() -> Self {
        Self {
            command_pool: CommandPool::from_raw(vk::CommandPool::null()),
            command_buffer: CommandBuffer::from_raw(vk::CommandBuffer::null()),
            image_available: Semaphore::from_raw(vk::Semaphore::null()),
            render_finished: Semaphore::from_raw(vk::Semaphore::null()),
            texture_copy: Semaphore::from_raw(vk::Semaphore::null()),
            in_flight: Fence::from_raw(vk::Fence::null()),
        }
    }

    fn allocate(&mut self, device: &Device) -> Result<()> {
        self.command_pool = device.create_command_pool(&CommandPoolDesc {
            queue_family: device.queue_families().graphics,
            flags: vk::CommandPoolCreateFlags::TRANSIENT,
        })?;
        self.command_buffer = device
            .allocate_command_buffers(&self.command_pool, vk::CommandBufferLevel::PRIMARY, 1)?
            .pop()
            .ok_or_else(|| RhiError::InvalidState("No command buffer allocated".to_string()))?;
        self.image_available = device.create_semaphore()?;
        self.render_finished = device.create_semaphore()?;
        self.texture_copy = device.create_semaphore()?;
        self.in_flight = device.create_fence(true)?;
        Ok(())
    }

    pub const fn command_buffer(&self) -> &CommandBuffer {
        &self.command_buffer
    }

    pub const fn in_flight_fence(&self) -> &Fence {
        &self.in_flight
    }

    /// Signaled by every frame submission alongside render-finished.
    pub const fn texture_copy_semaphore(&self) -> &Semaphore {
        &self.texture_copy
    }

    /// Destroy whatever the slot holds. Null handles are skipped by the driver.
    fn destroy(&mut self, device: &Device) {
        device.destroy_fence(&mut self.in_flight);
        device.destroy_semaphore(&mut self.texture_copy);
        device.destroy_semaphore(&mut self.render_finished);
        device.destroy_semaphore(&mut self.image_available);
        if !self.command_pool.is_null() && !self.command_buffer.is_null() {
            device.free_command_buffers(
                &self.command_pool,
                std::slice::from_mut(&mut self.command_buffer),
            );
        }
        device.destroy_command_pool(&mut self.command_pool);
    }
}

/// Every frame slot's native objects.
pub struct FrameResources {
    slots: [FrameSlot; MAX_FRAMES_IN_FLIGHT],
}

impl FrameResources {
    pub fn new(device: &Device) -> Result<Self> {
        let slots = create_all(
            MAX_FRAMES_IN_FLIGHT,
            |_| FrameSlot::new(device),
            |mut slot| slot.destroy(device),
        )?;
        let slots = slots
            .try_into()
            .map_err(|_| RhiError::InvalidState("Frame slot count mismatch".to_string()))?;
        tracing::debug!(slots = MAX_FRAMES_IN_FLIGHT, "Created frame slots");
        Ok(Self { slots })
    }

    pub const fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    pub fn fences(&self) -> [&Fence; MAX_FRAMES_IN_FLIGHT] {
        self.slots.each_ref().map(FrameSlot::in_flight_fence)
    }

    pub fn texture_copy_semaphores(&self) -> [&Semaphore; MAX_FRAMES_IN_FLIGHT] {
        self.slots.each_ref().map(FrameSlot::texture_copy_semaphore)
    }

    /// Destroy every slot. No slot may have pending GPU work.
    pub fn destroy(&mut self, device: &Device) {
        for slot in &mut self.slots {
            slot.destroy(device);
        }
    }
}

/// [`FrameBackend`] over a live device and swapchain.
pub(crate) struct VulkanFrameBackend<'a, H: ?Sized> {
    pub(crate) device: &'a Device,
    pub(crate) frames: &'a FrameResources,
    pub(crate) swapchain: &'a mut SwapchainManager,
    /// Required only when the protocol rebuilds the swapchain.
    pub(crate) host: Option<&'a mut H>,
}

impl<H: WindowHost + ?Sized> FrameBackend for VulkanFrameBackend<'_, H> {
    fn wait_slot_fence(&mut self, slot: usize) -> Result<()> {
        self.device
            .wait_for_fences(&[self.frames.slot(slot).in_flight_fence()], true, u64::MAX)
            .map_err(|e| RhiError::DeviceLost(format!("Waiting for frame slot {slot}: {e}")))
    }

    fn reset_slot_fence(&mut self, slot: usize) -> Result<()> {
        self.device
            .reset_fences(&[self.frames.slot(slot).in_flight_fence()])
    }

    fn reset_slot_pool(&mut self, slot: usize) -> Result<()> {
        self.device
            .reset_command_pool(&self.frames.slot(slot).command_pool)
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        self.swapchain
            .acquire_next_image(self.device, &self.frames.slot(slot).image_available)
    }

    fn begin_slot_commands(&mut self, slot: usize) -> Result<()> {
        self.device.begin_command_buffer(
            self.frames.slot(slot).command_buffer(),
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        )
    }

    fn end_slot_commands(&mut self, slot: usize) -> Result<()> {
        self.device
            .end_command_buffer(self.frames.slot(slot).command_buffer())
    }

    fn submit_slot(&mut self, slot: usize) -> Result<()> {
        let frame = self.frames.slot(slot);
        let submit = SubmitDesc {
            wait_semaphores: &[&frame.image_available],
            wait_stages: &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            command_buffers: &[&frame.command_buffer],
            signal_semaphores: &[&frame.texture_copy, &frame.render_finished],
        };
        self.device
            .queue_submit(self.device.graphics_queue(), &[submit], Some(&frame.in_flight))
    }

    fn submit_semaphore_drain(&mut self, slot: usize) -> Result<()> {
        let frame = self.frames.slot(slot);
        let submit = SubmitDesc {
            wait_semaphores: &[&frame.image_available],
            wait_stages: &[vk::PipelineStageFlags::BOTTOM_OF_PIPE],
            ..Default::default()
        };
        self.device
            .queue_submit(self.device.graphics_queue(), &[submit], Some(&frame.in_flight))
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        self.swapchain.present(
            self.device,
            self.device.present_queue(),
            image_index,
            &[&self.frames.slot(slot).render_finished],
        )
    }

    fn rebuild_swapchain(&mut self) -> Result<()> {
        let host = self.host.as_deref_mut().ok_or_else(|| {
            RhiError::InvalidState("Swapchain rebuild requested without a window".to_string())
        })?;
        self.swapchain
            .rebuild(self.device, host, &self.frames.fences())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashSet, VecDeque};

    use super::*;
    use crate::swapchain::wait_for_drawable_extent;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        ResetFence(usize),
        ResetPool(usize),
        Acquire(usize),
        Begin(usize),
        End(usize),
        Submit(usize),
        Drain(usize),
        Present(usize, u32),
        Rebuild,
    }

    /// GPU stand-in: work completes when its fence is waited on.
    #[derive(Default)]
    struct MockBackend {
        calls: Vec<Call>,
        acquires: VecDeque<AcquireOutcome>,
        presents: VecDeque<PresentOutcome>,
        unsignaled: [bool; MAX_FRAMES_IN_FLIGHT],
        max_unsignaled: usize,
        pools_reset: HashSet<usize>,
        next_image: u32,
        window: Option<MinimizedWindow>,
        rebuilt_at: Vec<(u32, u32)>,
    }

    /// Window reporting a zero framebuffer for a number of event waits.
    struct MinimizedWindow {
        restored: (u32, u32),
        waits_left: u32,
        waits: u32,
    }

    impl WindowHost for MinimizedWindow {
        fn framebuffer_size(&self) -> (u32, u32) {
            if self.waits_left == 0 {
                self.restored
            } else {
                (0, 0)
            }
        }

        fn wait_events(&mut self) {
            self.waits += 1;
            self.waits_left = self.waits_left.saturating_sub(1);
        }
    }

    impl MockBackend {
        fn unsignaled_count(&self) -> usize {
            self.unsignaled.iter().filter(|u| **u).count()
        }
    }

    impl FrameBackend for MockBackend {
        fn wait_slot_fence(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Wait(slot));
            self.unsignaled[slot] = false;
            Ok(())
        }

        fn reset_slot_fence(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::ResetFence(slot));
            self.unsignaled[slot] = true;
            self.max_unsignaled = self.max_unsignaled.max(self.unsignaled_count());
            Ok(())
        }

        fn reset_slot_pool(&mut self, slot: usize) -> Result<()> {
            assert!(!self.unsignaled[slot], "pool {slot} reset while in flight");
            self.calls.push(Call::ResetPool(slot));
            self.pools_reset.insert(slot);
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
            self.calls.push(Call::Acquire(slot));
            Ok(self.acquires.pop_front().unwrap_or_else(|| {
                let image = self.next_image;
                self.next_image = (self.next_image + 1) % 4;
                AcquireOutcome::Acquired(image)
            }))
        }

        fn begin_slot_commands(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Begin(slot));
            Ok(())
        }

        fn end_slot_commands(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::End(slot));
            Ok(())
        }

        fn submit_slot(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Submit(slot));
            Ok(())
        }

        fn submit_semaphore_drain(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Drain(slot));
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
            self.calls.push(Call::Present(slot, image_index));
            Ok(self.presents.pop_front().unwrap_or(PresentOutcome::Presented))
        }

        fn rebuild_swapchain(&mut self) -> Result<()> {
            self.calls.push(Call::Rebuild);
            if let Some(window) = self.window.as_mut() {
                self.rebuilt_at.push(wait_for_drawable_extent(window));
            }
            Ok(())
        }
    }

    fn run_frame(controller: &mut FrameController, backend: &mut MockBackend) -> PassStatus {
        controller.wait_for_slot(backend).unwrap();
        controller.reset_slot_pool(backend).unwrap();
        let status = controller.prepare_before_pass(backend).unwrap();
        if let PassStatus::Recording { .. } = status {
            controller.submit_rendering(backend).unwrap();
        }
        status
    }

    #[test]
    fn ten_frames_rotate_through_three_slots() {
        let mut controller = FrameController::new();
        let mut backend = MockBackend::default();

        for frame in 0..10u64 {
            assert_eq!(controller.current_slot() as u64, frame % 3);
            run_frame(&mut controller, &mut backend);
        }

        assert_eq!(controller.tracker().frames_issued(), 10);
        assert_eq!(controller.current_slot(), 10 % MAX_FRAMES_IN_FLIGHT);
        assert_eq!(backend.pools_reset.len(), 3);
        assert!(backend.max_unsignaled <= MAX_FRAMES_IN_FLIGHT);
        assert!(controller.tracker().outstanding() <= MAX_FRAMES_IN_FLIGHT);
    }

    #[test]
    fn frame_calls_follow_protocol_order() {
        let mut controller = FrameController::new();
        let mut backend = MockBackend::default();
        run_frame(&mut controller, &mut backend);

        assert_eq!(
            backend.calls,
            vec![
                Call::Wait(0),
                Call::ResetPool(0),
                Call::Acquire(0),
                Call::Begin(0),
                Call::End(0),
                Call::ResetFence(0),
                Call::Submit(0),
                Call::Present(0, 0),
            ]
        );
        assert_eq!(controller.tracker().state(0), SlotState::Submitted);
        assert_eq!(controller.current_slot(), 1);
    }

    #[test]
    fn out_of_date_acquire_rebuilds_without_advancing() {
        let mut controller = FrameController::new();
        let mut backend = MockBackend::default();
        backend.acquires.push_back(AcquireOutcome::OutOfDate);

        assert_eq!(run_frame(&mut controller, &mut backend), PassStatus::Rebuilt);
        assert_eq!(controller.current_slot(), 0);
        assert_eq!(controller.tracker().frames_issued(), 0);
        assert_eq!(controller.tracker().state(0), SlotState::Retired);
        assert!(!backend.calls.contains(&Call::ResetFence(0)));
        assert_eq!(backend.calls.last(), Some(&Call::Rebuild));

        // The next tick reuses the same slot.
        run_frame(&mut controller, &mut backend);
        assert!(backend.calls.contains(&Call::Submit(0)));
        assert_eq!(controller.current_slot(), 1);
    }

    #[test]
    fn minimized_window_rebuilds_once_after_restore() {
        let mut controller = FrameController::new();
        let mut backend = MockBackend {
            window: Some(MinimizedWindow {
                restored: (1280, 720),
                waits_left: 4,
                waits: 0,
            }),
            ..Default::default()
        };
        backend.acquires.push_back(AcquireOutcome::OutOfDate);

        let statuses: Vec<_> = (0..3)
            .map(|_| run_frame(&mut controller, &mut backend))
            .collect();

        assert_eq!(statuses[0], PassStatus::Rebuilt);
        assert_eq!(
            statuses.iter().filter(|s| **s == PassStatus::Rebuilt).count(),
            1
        );
        assert_eq!(backend.calls.iter().filter(|c| **c == Call::Rebuild).count(), 1);
        assert_eq!(backend.rebuilt_at, vec![(1280, 720)]);
        assert_eq!(backend.window.as_ref().map(|w| w.waits), Some(4));
        assert_eq!(controller.tracker().frames_issued(), 2);
        assert_eq!(controller.current_slot(), 2);
    }

    #[test]
    fn suboptimal_acquire_drains_the_semaphore_and_advances() {
        let mut controller = FrameController::new();
        let mut backend = MockBackend::default();
        backend.acquires.push_back(AcquireOutcome::Suboptimal);

        assert_eq!(run_frame(&mut controller, &mut backend), PassStatus::Rebuilt);
        assert_eq!(
            &backend.calls[2..],
            &[
                Call::Acquire(0),
                Call::Rebuild,
                Call::ResetFence(0),
                Call::Drain(0)
            ]
        );
        assert_eq!(controller.tracker().state(0), SlotState::Submitted);
        assert_eq!(controller.current_slot(), 1);
        assert!(!backend.calls.contains(&Call::Begin(0)));
    }

    #[test]
    fn present_needing_rebuild_still_advances() {
        let mut controller = FrameController::new();
        let mut backend = MockBackend::default();
        backend.presents.push_back(PresentOutcome::NeedsRebuild);

        controller.wait_for_slot(&mut backend).unwrap();
        controller.reset_slot_pool(&mut backend).unwrap();
        controller.prepare_before_pass(&mut backend).unwrap();
        assert!(controller.submit_rendering(&mut backend).unwrap());
        assert_eq!(backend.calls.last(), Some(&Call::Rebuild));
        assert_eq!(controller.current_slot(), 1);
    }

    #[test]
    fn submit_without_acquire_is_rejected() {
        let mut controller = FrameController::new();
        let mut backend = MockBackend::default();
        assert!(matches!(
            controller.submit_rendering(&mut backend),
            Err(RhiError::InvalidState(_))
        ));
        assert!(backend.calls.is_empty());
    }

    #[test]
    fn pool_reset_requires_a_retired_slot() {
        let mut tracker = SlotTracker::new();
        tracker.mark_pool_reset().unwrap();
        tracker.begin_current().unwrap();
        tracker.submit_current().unwrap();
        assert!(tracker.ensure_retired().is_err());
        assert!(tracker.mark_pool_reset().is_err());
        assert!(tracker.begin_current().is_err());

        tracker.retire_current().unwrap();
        assert!(tracker.ensure_retired().is_ok());
        assert!(tracker.submit_current().is_err());
    }

    #[test]
    fn recording_requires_a_pool_reset_since_the_last_submit() {
        let mut tracker = SlotTracker::new();
        assert!(tracker.begin_current().is_err());

        tracker.mark_pool_reset().unwrap();
        tracker.begin_current().unwrap();
        tracker.submit_current().unwrap();
        assert!(!tracker.pool_reset(0));

        tracker.retire_current().unwrap();
        assert!(matches!(tracker.begin_current(), Err(RhiError::InvalidState(_))));
        assert_eq!(tracker.state(0), SlotState::Retired);
    }

    #[test]
    fn skipping_the_pool_reset_acquires_nothing() {
        let mut controller = FrameController::new();
        let mut backend = MockBackend::default();
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            run_frame(&mut controller, &mut backend);
        }
        backend.calls.clear();

        controller.wait_for_slot(&mut backend).unwrap();
        assert!(matches!(
            controller.prepare_before_pass(&mut backend),
            Err(RhiError::InvalidState(_))
        ));
        assert_eq!(backend.calls, vec![Call::Wait(0)]);
        assert_eq!(controller.tracker().state(0), SlotState::Retired);

        controller.reset_slot_pool(&mut backend).unwrap();
        assert!(matches!(
            controller.prepare_before_pass(&mut backend).unwrap(),
            PassStatus::Recording { .. }
        ));
    }

    #[test]
    fn unallocated_slot_holds_only_null_handles() {
        let slot = FrameSlot::unallocated();
        assert!(slot.command_pool.is_null());
        assert!(slot.command_buffer().is_null());
        assert!(slot.image_available.is_null());
        assert!(slot.render_finished.is_null());
        assert!(slot.texture_copy_semaphore().is_null());
        assert!(slot.in_flight_fence().is_null());
    }

    #[test]
    fn recording_slot_cannot_be_retired() {
        let mut tracker = SlotTracker::new();
        tracker.mark_pool_reset().unwrap();
        tracker.begin_current().unwrap();
        assert!(tracker.retire_current().is_err());
        assert_eq!(tracker.state(0), SlotState::Recording);
    }
}
