//! Device bootstrap: instance, surface, adapter and logical device.

use std::ffi::c_char;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::adapter::{
    find_supported_format, select_physical_device, AdapterInfo, QueueFamilies,
    DEPTH_FORMAT_CANDIDATES,
};
use crate::config::RhiConfig;
use crate::debug::{DebugLabels, DebugMessenger};
use crate::error::{RhiError, Result};
use crate::handle::Queue;
use crate::instance::create_instance;
use crate::memory::MemoryAllocator;
use crate::sampler::SamplerCache;

/// Logical device together with everything needed to create resources on it.
///
/// Created once per window; destroyed last, after every resource created
/// through it.
pub struct Device {
    // Entry must be kept alive for the lifetime of the device
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<DebugMessenger>,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    info: AdapterInfo,
    raw: Arc<ash::Device>,
    swapchain_loader: ash::khr::swapchain::Device,
    labels: DebugLabels,
    allocator: Mutex<MemoryAllocator>,
    samplers: Mutex<SamplerCache>,
    queue_families: QueueFamilies,
    graphics_queue: Queue,
    present_queue: Queue,
    compute_queue: Queue,
    /// Pool backing single-use command buffers, resettable per buffer.
    upload_pool: vk::CommandPool,
    depth_format: vk::Format,
    point_light_shadow: bool,
}

impl Device {
    /// Bring up Vulkan against `window`.
    ///
    /// Every failure here is fatal; nothing is retried.
    pub fn new<W>(config: &RhiConfig, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        config.loader_environment.apply();

        let entry = unsafe { ash::Entry::load() }.map_err(|e| RhiError::Loading(e.to_string()))?;

        let display = window
            .display_handle()
            .map_err(|e| RhiError::SurfaceCreation(format!("Failed to get display handle: {e}")))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| RhiError::SurfaceCreation(format!("Failed to get window handle: {e}")))?
            .as_raw();

        let instance = unsafe { create_instance(&entry, display, config) }?;

        let debug_messenger = if config.enable_validation {
            Some(unsafe { DebugMessenger::new(&entry, &instance) }?)
        } else {
            None
        };

        let surface =
            unsafe { ash_window::create_surface(&entry, &instance, display, window_handle, None) }
                .map_err(|e| RhiError::SurfaceCreation(e.to_string()))?;
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        let (physical_device, queue_families) =
            unsafe { select_physical_device(&instance, &surface_loader, surface) }?;

        let info = unsafe { AdapterInfo::query(&instance, physical_device) };
        tracing::info!("Selected GPU: {}", info.summary());

        let supported = unsafe { instance.get_physical_device_features(physical_device) };
        let point_light_shadow =
            config.enable_point_light_shadow && supported.geometry_shader == vk::TRUE;
        if config.enable_point_light_shadow && !point_light_shadow {
            tracing::warn!("Geometry shaders unsupported; point-light shadows disabled");
        }

        let raw = unsafe {
            create_logical_device(
                &instance,
                physical_device,
                &queue_families,
                point_light_shadow,
            )
        }?;
        let raw = Arc::new(raw);

        let queue = |family| Queue::from_raw(unsafe { raw.get_device_queue(family, 0) });
        let graphics_queue = queue(queue_families.graphics);
        let present_queue = queue(queue_families.present);
        let compute_queue = queue(queue_families.compute);

        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &raw);
        let labels = DebugLabels::new(&instance, &raw, config.enable_debug_labels);

        let depth_format = find_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |format| unsafe {
                instance
                    .get_physical_device_format_properties(physical_device, format)
                    .optimal_tiling_features
            },
        )?;
        tracing::debug!("Depth format: {depth_format:?}");

        let allocator = unsafe { MemoryAllocator::new(&instance, raw.clone(), physical_device) }?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_families.graphics)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let upload_pool = unsafe { raw.create_command_pool(&pool_info, None) }?;

        Ok(Self {
            entry,
            instance,
            debug_messenger,
            surface_loader,
            surface,
            physical_device,
            info,
            raw,
            swapchain_loader,
            labels,
            allocator: Mutex::new(allocator),
            samplers: Mutex::new(SamplerCache::default()),
            queue_families,
            graphics_queue,
            present_queue,
            compute_queue,
            upload_pool,
            depth_format,
            point_light_shadow,
        })
    }

    /// Get the Vulkan device handle.
    pub fn raw(&self) -> &ash::Device {
        &self.raw
    }

    /// Get the Vulkan instance handle.
    pub const fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub const fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Description of the selected adapter.
    pub const fn info(&self) -> &AdapterInfo {
        &self.info
    }

    /// Adapter limits.
    pub const fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.info.limits
    }

    pub const fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub const fn surface_loader(&self) -> &ash::khr::surface::Instance {
        &self.surface_loader
    }

    pub const fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    pub const fn labels(&self) -> &DebugLabels {
        &self.labels
    }

    /// Get access to the GPU allocator.
    pub const fn allocator(&self) -> &Mutex<MemoryAllocator> {
        &self.allocator
    }

    pub(crate) const fn samplers(&self) -> &Mutex<SamplerCache> {
        &self.samplers
    }

    pub const fn queue_families(&self) -> QueueFamilies {
        self.queue_families
    }

    pub const fn graphics_queue(&self) -> &Queue {
        &self.graphics_queue
    }

    pub const fn present_queue(&self) -> &Queue {
        &self.present_queue
    }

    pub const fn compute_queue(&self) -> &Queue {
        &self.compute_queue
    }

    pub(crate) const fn upload_pool(&self) -> vk::CommandPool {
        self.upload_pool
    }

    /// Depth format chosen at startup.
    pub const fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    /// Whether the geometry-shader feature for point-light shadows is on.
    pub const fn point_light_shadow_enabled(&self) -> bool {
        self.point_light_shadow
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.raw.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            let _ = self.raw.device_wait_idle();

            self.samplers.lock().destroy_all(&self.raw);
            self.raw.destroy_command_pool(self.upload_pool, None);

            // Shutdown allocator BEFORE destroying device
            self.allocator.lock().shutdown();

            self.raw.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some(messenger) = &mut self.debug_messenger {
                messenger.destroy();
            }
            self.instance.destroy_instance(None);
        }
        tracing::info!("Device destroyed");
    }
}

/// Required device extensions.
fn required_device_extensions() -> Vec<*const c_char> {
    let mut extensions = vec![ash::khr::swapchain::NAME.as_ptr()];

    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_subset::NAME.as_ptr());

    extensions
}

/// Create the logical device with one queue per distinct family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_families: &QueueFamilies,
    point_light_shadow: bool,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extension_names = required_device_extensions();

    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(true)
        .fragment_stores_and_atomics(true)
        .independent_blend(true)
        .geometry_shader(point_light_shadow);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    let device = instance.create_device(physical_device, &create_info, None)?;

    Ok(device)
}
