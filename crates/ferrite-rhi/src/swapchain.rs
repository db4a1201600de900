//! Swapchain management.
//!
//! The manager owns the presentable image ring, one view per image and the
//! depth attachment sized to match. It is either `Valid` or `Invalid`; the
//! only way back to `Valid` is [`SwapchainManager::rebuild`], which tears
//! everything down and negotiates afresh.

use ash::vk;

use crate::adapter::QueueFamilies;
use crate::device::Device;
use crate::error::{RhiError, Result};
use crate::handle::{create_all, raw_handles, Fence, ImageView, Queue, RhiHandle, Semaphore};
use crate::image::{full_range, ImageViewDesc};
use crate::memory::{Image, ImageDesc};

/// Windowing collaborator the swapchain negotiates with.
pub trait WindowHost {
    /// Current framebuffer size in pixels. Zero while minimized.
    fn framebuffer_size(&self) -> (u32, u32);

    /// Block until the platform has delivered and processed at least one event.
    fn wait_events(&mut self);
}

/// Block until `host` reports a non-zero framebuffer, and return it.
pub fn wait_for_drawable_extent<H: WindowHost + ?Sized>(host: &mut H) -> (u32, u32) {
    let mut size = host.framebuffer_size();
    if size.0 == 0 || size.1 == 0 {
        tracing::info!("Window minimized, waiting for a drawable surface");
    }
    while size.0 == 0 || size.1 == 0 {
        host.wait_events();
        size = host.framebuffer_size();
    }
    size
}

/// Whether the swapchain can still be rendered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    Valid,
    Invalid,
}

/// Result of acquiring the next swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(u32),
    /// An image was acquired and its semaphore will signal, but the surface
    /// no longer matches the swapchain.
    Suboptimal,
    /// Nothing was acquired.
    OutOfDate,
}

/// Result of presenting an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    NeedsRebuild,
}

/// What the surface supports, queried fresh for every (re)build.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    /// Query surface support for the device's adapter.
    pub fn query(device: &Device) -> Result<Self> {
        let loader = device.surface_loader();
        let physical_device = device.physical_device();
        let surface = device.surface();
        unsafe {
            Ok(Self {
                capabilities: loader
                    .get_physical_device_surface_capabilities(physical_device, surface)?,
                formats: loader.get_physical_device_surface_formats(physical_device, surface)?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(physical_device, surface)?,
            })
        }
    }
}

/// Select the best surface format.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
}

/// Select the best present mode: mailbox when offered, FIFO otherwise.
pub fn select_present_mode(available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if available.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    framebuffer_width: u32,
    framebuffer_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: framebuffer_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: framebuffer_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more than the minimum, capped by the maximum when there is one.
pub const fn image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        count
    }
}

/// Everything negotiated for one swapchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub sharing_mode: vk::SharingMode,
    /// Families sharing the images; empty for exclusive sharing.
    pub queue_family_indices: Vec<u32>,
}

impl SwapchainConfig {
    pub fn negotiate(
        support: &SurfaceSupport,
        framebuffer: (u32, u32),
        families: QueueFamilies,
    ) -> Result<Self> {
        let surface_format = select_surface_format(&support.formats).ok_or_else(|| {
            RhiError::NoSupportedFormat("surface advertises no formats".to_string())
        })?;
        let (sharing_mode, queue_family_indices) = if families.graphics == families.present {
            (vk::SharingMode::EXCLUSIVE, Vec::new())
        } else {
            (
                vk::SharingMode::CONCURRENT,
                vec![families.graphics, families.present],
            )
        };

        Ok(Self {
            surface_format,
            present_mode: select_present_mode(&support.present_modes),
            extent: calculate_extent(&support.capabilities, framebuffer.0, framebuffer.1),
            image_count: image_count(&support.capabilities),
            pre_transform: support.capabilities.current_transform,
            sharing_mode,
            queue_family_indices,
        })
    }
}

/// Depth attachment matching a swapchain extent.
pub const fn depth_image_desc(format: vk::Format, extent: vk::Extent2D) -> ImageDesc<'static> {
    ImageDesc::texture_2d(
        "swapchain depth",
        format,
        extent,
        vk::ImageUsageFlags::from_raw(
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT.as_raw()
                | vk::ImageUsageFlags::INPUT_ATTACHMENT.as_raw()
                | vk::ImageUsageFlags::TRANSFER_SRC.as_raw(),
        ),
    )
}

/// Viewport covering `extent` with the full depth range.
#[allow(clippy::cast_precision_loss)]
pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

pub const fn full_scissor(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

/// Depth image and view sized to `extent`.
fn create_depth_attachment(device: &Device, extent: vk::Extent2D) -> Result<(Image, ImageView)> {
    let mut image = device.create_image(&depth_image_desc(device.depth_format(), extent))?;
    let view = device.create_image_view(&ImageViewDesc::whole(
        &image,
        vk::ImageViewType::TYPE_2D,
        vk::ImageAspectFlags::DEPTH,
    ));
    match view {
        Ok(view) => Ok((image, view)),
        Err(e) => {
            if let Err(free) = device.destroy_image(&mut image) {
                tracing::warn!("Failed to release depth image: {free}");
            }
            Err(e)
        }
    }
}

/// Swapchain, its image views and the matching depth attachment.
pub struct SwapchainManager {
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<ImageView>,
    config: SwapchainConfig,
    depth_image: Image,
    depth_view: ImageView,
    viewport: vk::Viewport,
    scissor: vk::Rect2D,
    state: SwapchainState,
}

impl SwapchainManager {
    /// Create the first swapchain, blocking while the window is minimized.
    pub fn new<H: WindowHost + ?Sized>(device: &Device, host: &mut H) -> Result<Self> {
        let framebuffer = wait_for_drawable_extent(host);
        Self::create(device, framebuffer)
    }

    fn create(device: &Device, framebuffer: (u32, u32)) -> Result<Self> {
        let support = SurfaceSupport::query(device)?;
        let config = SwapchainConfig::negotiate(&support, framebuffer, device.queue_families())?;

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(device.surface())
            .min_image_count(config.image_count)
            .image_format(config.surface_format.format)
            .image_color_space(config.surface_format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(config.sharing_mode)
            .queue_family_indices(&config.queue_family_indices)
            .pre_transform(config.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true);

        let loader = device.swapchain_loader();
        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| RhiError::SwapchainCreation(e.to_string()))?;

        match Self::with_attachments(device, swapchain, config) {
            Ok(this) => Ok(this),
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                Err(e)
            }
        }
    }

    /// Wrap a fresh swapchain with its image views and depth attachment.
    /// Nothing created here outlives a failure.
    fn with_attachments(
        device: &Device,
        swapchain: vk::SwapchainKHR,
        config: SwapchainConfig,
    ) -> Result<Self> {
        let images = unsafe { device.swapchain_loader().get_swapchain_images(swapchain)? };

        let mut image_views = create_all(
            images.len(),
            |i| {
                device.create_image_view(&ImageViewDesc {
                    image: images[i],
                    view_type: vk::ImageViewType::TYPE_2D,
                    format: config.surface_format.format,
                    subresource_range: full_range(vk::ImageAspectFlags::COLOR, 1, 1),
                })
            },
            |mut view| device.destroy_image_view(&mut view),
        )?;

        let (depth_image, depth_view) = match create_depth_attachment(device, config.extent) {
            Ok(depth) => depth,
            Err(e) => {
                for view in &mut image_views {
                    device.destroy_image_view(view);
                }
                return Err(e);
            }
        };

        tracing::info!(
            width = config.extent.width,
            height = config.extent.height,
            images = images.len(),
            format = ?config.surface_format.format,
            present_mode = ?config.present_mode,
            "Created swapchain"
        );

        Ok(Self {
            swapchain,
            images,
            image_views,
            viewport: full_viewport(config.extent),
            scissor: full_scissor(config.extent),
            config,
            depth_image,
            depth_view,
            state: SwapchainState::Valid,
        })
    }

    /// Tear down and recreate everything against the current surface.
    ///
    /// Blocks until the window has a non-zero area, then until every fence in
    /// `in_flight` has signaled. If recreation fails the manager is left
    /// destroyed and `Invalid`; [`Self::destroy`] on it again is a no-op.
    pub fn rebuild<H: WindowHost + ?Sized>(
        &mut self,
        device: &Device,
        host: &mut H,
        in_flight: &[&Fence],
    ) -> Result<()> {
        self.state = SwapchainState::Invalid;
        let framebuffer = wait_for_drawable_extent(host);

        let fences = raw_handles(in_flight);
        if !fences.is_empty() {
            unsafe { device.raw().wait_for_fences(&fences, true, u64::MAX) }
                .map_err(|e| RhiError::DeviceLost(format!("Draining in-flight frames: {e}")))?;
        }

        self.destroy(device)?;
        *self = Self::create(device, framebuffer)?;
        tracing::info!(
            width = self.config.extent.width,
            height = self.config.extent.height,
            "Rebuilt swapchain"
        );
        Ok(())
    }

    /// Destroy the depth attachment, the image views and the swapchain.
    ///
    /// Every handle is left null, so destroying twice is harmless.
    pub fn destroy(&mut self, device: &Device) -> Result<()> {
        device.destroy_image_view(&mut self.depth_view);
        device.destroy_image(&mut self.depth_image)?;
        for view in &mut self.image_views {
            device.destroy_image_view(view);
        }
        self.image_views.clear();
        self.images.clear();
        unsafe {
            device
                .swapchain_loader()
                .destroy_swapchain(std::mem::take(&mut self.swapchain), None);
        }
        self.state = SwapchainState::Invalid;
        Ok(())
    }

    /// Acquire the next image, signaling `semaphore` once it is usable.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn acquire_next_image(
        &mut self,
        device: &Device,
        semaphore: &Semaphore,
    ) -> Result<AcquireOutcome> {
        let result = unsafe {
            device.swapchain_loader().acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore.raw(),
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, false)) => Ok(AcquireOutcome::Acquired(index)),
            Ok((_, true)) => {
                self.state = SwapchainState::Invalid;
                Ok(AcquireOutcome::Suboptimal)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.state = SwapchainState::Invalid;
                Ok(AcquireOutcome::OutOfDate)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Present an image.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn present(
        &mut self,
        device: &Device,
        queue: &Queue,
        image_index: u32,
        wait_semaphores: &[&Semaphore],
    ) -> Result<PresentOutcome> {
        let wait = raw_handles(wait_semaphores);
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            device
                .swapchain_loader()
                .queue_present(queue.raw(), &present_info)
        };

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.state = SwapchainState::Invalid;
                Ok(PresentOutcome::NeedsRebuild)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub const fn state(&self) -> SwapchainState {
        self.state
    }

    pub const fn raw(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub const fn config(&self) -> &SwapchainConfig {
        &self.config
    }

    pub const fn format(&self) -> vk::Format {
        self.config.surface_format.format
    }

    pub const fn extent(&self) -> vk::Extent2D {
        self.config.extent
    }

    pub const fn viewport(&self) -> vk::Viewport {
        self.viewport
    }

    pub const fn scissor(&self) -> vk::Rect2D {
        self.scissor
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[ImageView] {
        &self.image_views
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub const fn depth_image(&self) -> &Image {
        &self.depth_image
    }

    pub const fn depth_view(&self) -> &ImageView {
        &self.depth_view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Window that stays minimized for a number of event waits, then
    /// restores to a new size.
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

    fn sentinel_support() -> SurfaceSupport {
        SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 8,
                current_extent: vk::Extent2D {
                    width: u32::MAX,
                    height: u32::MAX,
                },
                min_image_extent: vk::Extent2D {
                    width: 1,
                    height: 1,
                },
                max_image_extent: vk::Extent2D {
                    width: 4096,
                    height: 4096,
                },
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                ..Default::default()
            },
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::R8G8B8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        }
    }

    const SHARED: QueueFamilies = QueueFamilies {
        graphics: 0,
        present: 0,
        compute: 0,
    };

    #[test]
    fn restore_after_minimize_rebuilds_at_new_size() {
        let mut window = MinimizedWindow {
            restored: (1024, 768),
            waits_left: 3,
            waits: 0,
        };
        let framebuffer = wait_for_drawable_extent(&mut window);
        assert_eq!(framebuffer, (1024, 768));
        assert_eq!(window.waits, 3);

        let config = SwapchainConfig::negotiate(&sentinel_support(), framebuffer, SHARED).unwrap();
        assert_eq!(
            config.extent,
            vk::Extent2D {
                width: 1024,
                height: 768
            }
        );

        let depth = depth_image_desc(vk::Format::D32_SFLOAT, config.extent);
        assert_eq!(depth.extent.width, 1024);
        assert_eq!(depth.extent.height, 768);
        assert!(depth
            .usage
            .contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::INPUT_ATTACHMENT));

        let viewport = full_viewport(config.extent);
        approx::assert_relative_eq!(viewport.width, 1024.0);
        approx::assert_relative_eq!(viewport.height, 768.0);
        approx::assert_relative_eq!(viewport.max_depth, 1.0);
        assert_eq!(full_scissor(config.extent).extent, config.extent);
    }

    #[test]
    fn repeated_minimize_restore_negotiates_the_same_swapchain() {
        let support = sentinel_support();
        let mut configs = Vec::new();
        for _ in 0..4 {
            let mut window = MinimizedWindow {
                restored: (800, 600),
                waits_left: 2,
                waits: 0,
            };
            let framebuffer = wait_for_drawable_extent(&mut window);
            configs.push(SwapchainConfig::negotiate(&support, framebuffer, SHARED).unwrap());
        }
        assert!(configs.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(configs[0].extent.width, 800);
    }

    #[test]
    fn drawable_window_does_not_wait() {
        let mut window = MinimizedWindow {
            restored: (800, 600),
            waits_left: 0,
            waits: 0,
        };
        assert_eq!(wait_for_drawable_extent(&mut window), (800, 600));
        assert_eq!(window.waits, 0);
    }

    #[test]
    fn negotiation_prefers_unorm_bgra_and_mailbox() {
        let config = SwapchainConfig::negotiate(&sentinel_support(), (640, 480), SHARED).unwrap();
        assert_eq!(config.surface_format.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(config.present_mode, vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.image_count, 3);
        assert_eq!(config.sharing_mode, vk::SharingMode::EXCLUSIVE);
        assert!(config.queue_family_indices.is_empty());
    }

    #[test]
    fn negotiation_falls_back() {
        let mut support = sentinel_support();
        support.formats.truncate(1);
        support.present_modes = vec![vk::PresentModeKHR::IMMEDIATE];
        support.capabilities.current_extent = vk::Extent2D {
            width: 300,
            height: 200,
        };
        support.capabilities.max_image_count = 2;

        let split = QueueFamilies {
            graphics: 0,
            present: 2,
            compute: 0,
        };
        let config = SwapchainConfig::negotiate(&support, (9999, 9999), split).unwrap();
        assert_eq!(config.surface_format.format, vk::Format::R8G8B8A8_SRGB);
        assert_eq!(config.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(config.extent.width, 300);
        assert_eq!(config.image_count, 2);
        assert_eq!(config.sharing_mode, vk::SharingMode::CONCURRENT);
        assert_eq!(config.queue_family_indices, vec![0, 2]);
    }

    #[test]
    fn sentinel_extent_is_clamped() {
        let support = sentinel_support();
        let extent = calculate_extent(&support.capabilities, 10_000, 0);
        assert_eq!(extent.width, 4096);
        assert_eq!(extent.height, 1);
    }

    #[test]
    fn no_formats_is_an_error() {
        let mut support = sentinel_support();
        support.formats.clear();
        assert!(matches!(
            SwapchainConfig::negotiate(&support, (1, 1), SHARED),
            Err(RhiError::NoSupportedFormat(_))
        ));
    }

    #[test]
    fn unbounded_image_count() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 3,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(image_count(&caps), 4);
    }
}
