//! Physical adapter scoring, suitability and queue family resolution.

use std::ffi::CStr;

use ash::vk;

use crate::error::{RhiError, Result};

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Score of an adapter type. Higher is preferred.
pub const fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        _ => 0,
    }
}

/// Capabilities of one queue family, as far as family resolution cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilySupport {
    pub flags: vk::QueueFlags,
    pub present: bool,
}

/// Queue families found on an adapter. Any of them may alias.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
    pub compute: Option<u32>,
}

impl QueueFamilyIndices {
    /// Pick the first family advertising each capability.
    pub fn resolve(families: &[QueueFamilySupport]) -> Self {
        let mut indices = Self::default();
        for (index, family) in (0u32..).zip(families) {
            if indices.graphics.is_none() && family.flags.contains(vk::QueueFlags::GRAPHICS) {
                indices.graphics = Some(index);
            }
            if indices.compute.is_none() && family.flags.contains(vk::QueueFlags::COMPUTE) {
                indices.compute = Some(index);
            }
            if indices.present.is_none() && family.present {
                indices.present = Some(index);
            }
            if indices.is_complete() {
                break;
            }
        }
        indices
    }

    pub const fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some() && self.compute.is_some()
    }

    /// Resolved families, if every role found one.
    pub const fn complete(&self) -> Option<QueueFamilies> {
        match (self.graphics, self.present, self.compute) {
            (Some(graphics), Some(present), Some(compute)) => Some(QueueFamilies {
                graphics,
                present,
                compute,
            }),
            _ => None,
        }
    }
}

/// Fully resolved queue family indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
    pub compute: u32,
}

impl QueueFamilies {
    /// Distinct families, in first-seen order, one queue each.
    pub fn unique(&self) -> Vec<u32> {
        let mut unique = Vec::with_capacity(3);
        for family in [self.graphics, self.present, self.compute] {
            if !unique.contains(&family) {
                unique.push(family);
            }
        }
        unique
    }
}

/// Everything adapter selection looks at for one physical device.
#[derive(Debug, Clone)]
pub struct AdapterCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub queue_families: QueueFamilyIndices,
    pub has_swapchain_extension: bool,
    pub surface_format_count: usize,
    pub present_mode_count: usize,
    pub sampler_anisotropy: bool,
    pub independent_blend: bool,
    pub fragment_stores_and_atomics: bool,
}

impl AdapterCandidate {
    pub const fn score(&self) -> u32 {
        device_type_score(self.device_type)
    }

    /// Queues complete, swapchain extension present, something to present
    /// with, and every feature the logical device is opened with.
    pub const fn is_suitable(&self) -> bool {
        self.queue_families.is_complete()
            && self.has_swapchain_extension
            && self.surface_format_count > 0
            && self.present_mode_count > 0
            && self.sampler_anisotropy
            && self.independent_blend
            && self.fragment_stores_and_atomics
    }
}

/// Index of the best suitable candidate.
///
/// Candidates are ranked by score with a stable sort, so equal scores keep
/// enumeration order; the first suitable one in rank order wins.
pub fn select_adapter(candidates: &[AdapterCandidate]) -> Option<usize> {
    let mut ranked: Vec<usize> = (0..candidates.len()).collect();
    ranked.sort_by(|&a, &b| candidates[b].score().cmp(&candidates[a].score()));
    ranked.into_iter().find(|&i| candidates[i].is_suitable())
}

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// First candidate whose optimal-tiling features contain `required`.
pub fn find_supported_format(
    candidates: &[vk::Format],
    required: vk::FormatFeatureFlags,
    mut optimal_features: impl FnMut(vk::Format) -> vk::FormatFeatureFlags,
) -> Result<vk::Format> {
    candidates
        .iter()
        .copied()
        .find(|&format| optimal_features(format).contains(required))
        .ok_or_else(|| RhiError::NoSupportedFormat(format!("{candidates:?}")))
}

/// Read-only description of the selected adapter.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub driver_version: u32,
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    pub limits: vk::PhysicalDeviceLimits,
}

impl AdapterInfo {
    /// Query adapter properties.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name: CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned(),
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            device_local_memory_mb,
            limits: properties.limits,
        }
    }

    /// Get a human-readable summary of the adapter.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

/// Gather selection inputs for one physical device.
///
/// # Safety
/// All handles must be valid.
unsafe fn query_candidate(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> Result<AdapterCandidate> {
    let properties = instance.get_physical_device_properties(physical_device);
    let features = instance.get_physical_device_features(physical_device);

    let families = instance.get_physical_device_queue_family_properties(physical_device);
    let mut support = Vec::with_capacity(families.len());
    for (index, family) in (0u32..).zip(&families) {
        let present = surface_loader.get_physical_device_surface_support(
            physical_device,
            index,
            surface,
        )?;
        support.push(QueueFamilySupport {
            flags: family.queue_flags,
            present,
        });
    }

    let has_swapchain_extension = instance
        .enumerate_device_extension_properties(physical_device)?
        .iter()
        .any(|ext| CStr::from_ptr(ext.extension_name.as_ptr()) == ash::khr::swapchain::NAME);

    let (surface_format_count, present_mode_count) = if has_swapchain_extension {
        (
            surface_loader
                .get_physical_device_surface_formats(physical_device, surface)?
                .len(),
            surface_loader
                .get_physical_device_surface_present_modes(physical_device, surface)?
                .len(),
        )
    } else {
        (0, 0)
    };

    Ok(AdapterCandidate {
        name: CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned(),
        device_type: properties.device_type,
        queue_families: QueueFamilyIndices::resolve(&support),
        has_swapchain_extension,
        surface_format_count,
        present_mode_count,
        sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
        independent_blend: features.independent_blend == vk::TRUE,
        fragment_stores_and_atomics: features.fragment_stores_and_atomics == vk::TRUE,
    })
}

/// Select the best suitable physical device for the surface.
///
/// # Safety
/// All handles must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
    let devices = instance.enumerate_physical_devices()?;
    if devices.is_empty() {
        tracing::error!("No Vulkan-capable adapter found");
        return Err(RhiError::NoSuitableDevice);
    }

    let candidates = devices
        .iter()
        .map(|&device| query_candidate(instance, surface_loader, surface, device))
        .collect::<Result<Vec<_>>>()?;

    for candidate in &candidates {
        tracing::debug!(
            name = %candidate.name,
            score = candidate.score(),
            suitable = candidate.is_suitable(),
            "Adapter candidate"
        );
    }

    let index = select_adapter(&candidates).ok_or(RhiError::NoSuitableDevice)?;
    let families = candidates[index]
        .queue_families
        .complete()
        .ok_or(RhiError::NoSuitableDevice)?;

    Ok((devices[index], families))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, device_type: vk::PhysicalDeviceType) -> AdapterCandidate {
        AdapterCandidate {
            name: name.to_string(),
            device_type,
            queue_families: QueueFamilyIndices {
                graphics: Some(0),
                present: Some(0),
                compute: Some(0),
            },
            has_swapchain_extension: true,
            surface_format_count: 2,
            present_mode_count: 1,
            sampler_anisotropy: true,
            independent_blend: true,
            fragment_stores_and_atomics: true,
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x106B), GpuVendor::Apple);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn discrete_beats_integrated() {
        let candidates = [
            candidate("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU),
            candidate("cpu", vk::PhysicalDeviceType::CPU),
            candidate("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        assert_eq!(select_adapter(&candidates), Some(2));
    }

    #[test]
    fn ties_keep_enumeration_order() {
        let candidates = [
            candidate("first", vk::PhysicalDeviceType::DISCRETE_GPU),
            candidate("second", vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        assert_eq!(select_adapter(&candidates), Some(0));
    }

    #[test]
    fn unsuitable_adapters_are_skipped() {
        let mut no_aniso = candidate("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU);
        no_aniso.sampler_anisotropy = false;
        let mut no_present = candidate("dgpu2", vk::PhysicalDeviceType::DISCRETE_GPU);
        no_present.queue_families.present = None;
        let candidates = [
            no_aniso,
            no_present,
            candidate("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU),
        ];
        assert_eq!(select_adapter(&candidates), Some(2));
    }

    #[test]
    fn device_features_are_required() {
        let mut no_blend = candidate("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU);
        no_blend.independent_blend = false;
        assert!(!no_blend.is_suitable());

        let mut no_atomics = candidate("dgpu2", vk::PhysicalDeviceType::DISCRETE_GPU);
        no_atomics.fragment_stores_and_atomics = false;
        assert!(!no_atomics.is_suitable());

        let candidates = [
            no_blend,
            no_atomics,
            candidate("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU),
        ];
        assert_eq!(select_adapter(&candidates), Some(2));
    }

    #[test]
    fn nothing_suitable_selects_nothing() {
        let mut headless = candidate("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU);
        headless.present_mode_count = 0;
        let mut no_swapchain = candidate("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU);
        no_swapchain.has_swapchain_extension = false;
        assert_eq!(select_adapter(&[headless, no_swapchain]), None);
        assert_eq!(select_adapter(&[]), None);
    }

    #[test]
    fn queue_families_take_first_match() {
        let families = [
            QueueFamilySupport {
                flags: vk::QueueFlags::TRANSFER,
                present: false,
            },
            QueueFamilySupport {
                flags: vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                present: true,
            },
            QueueFamilySupport {
                flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                present: true,
            },
        ];
        let indices = QueueFamilyIndices::resolve(&families);
        assert_eq!(
            indices.complete(),
            Some(QueueFamilies {
                graphics: 2,
                present: 1,
                compute: 1,
            })
        );
        assert_eq!(indices.complete().unwrap().unique(), vec![2, 1]);
    }

    #[test]
    fn incomplete_queue_families() {
        let families = [QueueFamilySupport {
            flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            present: false,
        }];
        let indices = QueueFamilyIndices::resolve(&families);
        assert!(!indices.is_complete());
        assert!(indices.complete().is_none());
    }

    #[test]
    fn depth_format_falls_back_in_order() {
        let format = find_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |format| {
                if format == vk::Format::D24_UNORM_S8_UINT {
                    vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
                } else {
                    vk::FormatFeatureFlags::SAMPLED_IMAGE
                }
            },
        );
        assert_eq!(format.unwrap(), vk::Format::D24_UNORM_S8_UINT);

        let none = find_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |_| vk::FormatFeatureFlags::empty(),
        );
        assert!(matches!(none, Err(RhiError::NoSupportedFormat(_))));
    }
}
