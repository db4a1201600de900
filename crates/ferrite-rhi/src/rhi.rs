//! Top-level render hardware interface.
//!
//! [`Rhi`] owns the device, the swapchain, the frame slots and the global
//! descriptor pool, and drives the per-frame protocol:
//!
//! ```text
//! wait_for_fences -> reset_command_pool -> prepare_before_pass
//!     -> record through prepare_context() -> submit_rendering
//! ```
//!
//! Resource creation goes through [`Rhi::device`].

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::adapter::{AdapterInfo, QueueFamilies};
use crate::config::RhiConfig;
use crate::descriptors::DescriptorPoolDesc;
use crate::device::Device;
use crate::error::Result;
use crate::frame::{
    FrameController, FrameResources, PassStatus, VulkanFrameBackend, MAX_FRAMES_IN_FLIGHT,
};
use crate::handle::{CommandBuffer, DescriptorPool, Fence, ImageView, Queue, Semaphore};
use crate::memory::Image;
use crate::recording::CommandContext;
use crate::swapchain::{SwapchainManager, SwapchainState, WindowHost};

/// Device, presentation and frame pacing for one window.
pub struct Rhi {
    frames: FrameResources,
    controller: FrameController,
    swapchain: SwapchainManager,
    descriptor_pool: DescriptorPool,
    // Destroyed last; everything above was created through it.
    device: Device,
}

impl Rhi {
    /// Bring up the device and the swapchain for `window`.
    pub fn new<W>(config: &RhiConfig, window: &mut W) -> Result<Self>
    where
        W: WindowHost + HasDisplayHandle + HasWindowHandle,
    {
        let device = Device::new(config, window)?;
        let swapchain = SwapchainManager::new(&device, window)?;
        let frames = FrameResources::new(&device)?;

        let budget = config.descriptor_budget;
        let pool_sizes = budget.pool_sizes();
        let descriptor_pool = device.create_descriptor_pool(&DescriptorPoolDesc {
            max_sets: budget.max_sets(),
            pool_sizes: &pool_sizes,
            flags: vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
        })?;

        tracing::info!(
            adapter = %device.info().device_name,
            frames_in_flight = MAX_FRAMES_IN_FLIGHT,
            max_descriptor_sets = budget.max_sets(),
            "RHI initialized"
        );

        Ok(Self {
            frames,
            controller: FrameController::new(),
            swapchain,
            descriptor_pool,
            device,
        })
    }

    fn frame_backend<'a, H: WindowHost + ?Sized>(
        &'a mut self,
        host: Option<&'a mut H>,
    ) -> (&'a mut FrameController, VulkanFrameBackend<'a, H>) {
        (
            &mut self.controller,
            VulkanFrameBackend {
                device: &self.device,
                frames: &self.frames,
                swapchain: &mut self.swapchain,
                host,
            },
        )
    }

    /// Block until the current slot's previous submission has finished.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_for_fences(&mut self) -> Result<()> {
        let (controller, mut backend) = self.frame_backend(None::<&mut dyn WindowHost>);
        controller.wait_for_slot(&mut backend)
    }

    /// Reset the current slot's command pool. The slot must be retired.
    pub fn reset_command_pool(&mut self) -> Result<()> {
        let (controller, mut backend) = self.frame_backend(None::<&mut dyn WindowHost>);
        controller.reset_slot_pool(&mut backend)
    }

    /// Acquire a swapchain image and begin the slot's command buffer.
    ///
    /// Returns `false` when the swapchain was rebuilt instead; `on_rebuild`
    /// has then been called and nothing should be recorded this tick.
    ///
    /// `on_rebuild` runs once the protocol step has finished. After a
    /// suboptimal acquire the semaphore drain has already been submitted and
    /// the slot index has already advanced by then, so the callback sees the
    /// next slot as current.
    pub fn prepare_before_pass<H, F>(&mut self, host: &mut H, on_rebuild: F) -> Result<bool>
    where
        H: WindowHost + ?Sized,
        F: FnOnce(&Self),
    {
        let (controller, mut backend) = self.frame_backend(Some(host));
        match controller.prepare_before_pass(&mut backend)? {
            PassStatus::Recording { .. } => Ok(true),
            PassStatus::Rebuilt => {
                on_rebuild(self);
                Ok(false)
            }
        }
    }

    /// Recording context over the current slot's command buffer.
    pub fn prepare_context(&self) -> CommandContext<'_> {
        CommandContext::new(&self.device, self.current_command_buffer())
    }

    /// End, submit and present the current frame, then advance the slot.
    ///
    /// Returns `true` when presentation required a rebuild; `on_rebuild` has
    /// then been called.
    pub fn submit_rendering<H, F>(&mut self, host: &mut H, on_rebuild: F) -> Result<bool>
    where
        H: WindowHost + ?Sized,
        F: FnOnce(&Self),
    {
        let (controller, mut backend) = self.frame_backend(Some(host));
        let rebuilt = controller.submit_rendering(&mut backend)?;
        if rebuilt {
            on_rebuild(self);
        }
        Ok(rebuilt)
    }

    pub const fn device(&self) -> &Device {
        &self.device
    }

    pub const fn swapchain(&self) -> &SwapchainManager {
        &self.swapchain
    }

    pub const fn swapchain_state(&self) -> SwapchainState {
        self.swapchain.state()
    }

    pub const fn swapchain_format(&self) -> vk::Format {
        self.swapchain.format()
    }

    pub const fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    pub const fn viewport(&self) -> vk::Viewport {
        self.swapchain.viewport()
    }

    pub const fn scissor(&self) -> vk::Rect2D {
        self.swapchain.scissor()
    }

    pub fn swapchain_image_views(&self) -> &[ImageView] {
        self.swapchain.image_views()
    }

    pub const fn depth_format(&self) -> vk::Format {
        self.device.depth_format()
    }

    pub const fn depth_image(&self) -> &Image {
        self.swapchain.depth_image()
    }

    pub const fn depth_view(&self) -> &ImageView {
        self.swapchain.depth_view()
    }

    pub const fn max_frames_in_flight(&self) -> usize {
        MAX_FRAMES_IN_FLIGHT
    }

    /// Index of the frame slot being prepared or recorded.
    pub const fn current_frame_index(&self) -> usize {
        self.controller.current_slot()
    }

    /// Swapchain image acquired for the frame being recorded, if any.
    pub const fn current_image_index(&self) -> Option<u32> {
        self.controller.image_index()
    }

    /// Total frames submitted, including drained ones.
    pub const fn frames_issued(&self) -> u64 {
        self.controller.tracker().frames_issued()
    }

    pub const fn current_command_buffer(&self) -> &CommandBuffer {
        self.frames
            .slot(self.controller.current_slot())
            .command_buffer()
    }

    pub const fn queue_families(&self) -> QueueFamilies {
        self.device.queue_families()
    }

    pub const fn graphics_queue(&self) -> &Queue {
        self.device.graphics_queue()
    }

    pub const fn compute_queue(&self) -> &Queue {
        self.device.compute_queue()
    }

    /// Pool sized by [`crate::DescriptorBudget`]; sets may be freed individually.
    pub const fn descriptor_pool(&self) -> &DescriptorPool {
        &self.descriptor_pool
    }

    pub fn in_flight_fences(&self) -> [&Fence; MAX_FRAMES_IN_FLIGHT] {
        self.frames.fences()
    }

    /// Semaphores signaled by each slot's frame submission.
    pub fn texture_copy_semaphores(&self) -> [&Semaphore; MAX_FRAMES_IN_FLIGHT] {
        self.frames.texture_copy_semaphores()
    }

    pub const fn adapter_info(&self) -> &AdapterInfo {
        self.device.info()
    }

    pub const fn point_light_shadow_enabled(&self) -> bool {
        self.device.point_light_shadow_enabled()
    }
}

impl Drop for Rhi {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            tracing::error!("Failed to wait for device idle during teardown: {e}");
        }
        self.device
            .destroy_descriptor_pool(&mut self.descriptor_pool);
        self.frames.destroy(&self.device);
        if let Err(e) = self.swapchain.destroy(&self.device) {
            tracing::error!("Failed to destroy swapchain: {e}");
        }
        tracing::info!("RHI destroyed");
    }
}
