//! GPU memory management.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
pub use gpu_allocator::MemoryLocation;

use crate::device::Device;
use crate::error::{RhiError, Result};
use crate::handle::{ResourceKind, RhiHandle};

/// Portable description of a buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub name: &'a str,
}

/// Portable description of an image.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc<'a> {
    pub flags: vk::ImageCreateFlags,
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub location: MemoryLocation,
    pub name: &'a str,
}

impl<'a> ImageDesc<'a> {
    /// Single-sampled, optimally tiled, device-local 2D image.
    pub const fn texture_2d(
        name: &'a str,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            flags: vk::ImageCreateFlags::empty(),
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            location: MemoryLocation::GpuOnly,
            name,
        }
    }

    pub const fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub const fn with_array_layers(mut self, array_layers: u32, flags: vk::ImageCreateFlags) -> Self {
        self.array_layers = array_layers;
        self.flags = flags;
        self
    }

    fn create_info(&self) -> vk::ImageCreateInfo<'static> {
        vk::ImageCreateInfo::default()
            .flags(self.flags)
            .image_type(self.image_type)
            .format(self.format)
            .extent(self.extent)
            .mip_levels(self.mip_levels)
            .array_layers(self.array_layers)
            .samples(self.samples)
            .tiling(self.tiling)
            .usage(self.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
    }

    fn validate(&self) -> Result<()> {
        let vk::Extent3D {
            width,
            height,
            depth,
        } = self.extent;
        if width == 0 || height == 0 || depth == 0 {
            return Err(RhiError::invalid(
                ResourceKind::Image.name(),
                format!("zero extent {width}x{height}x{depth} for {}", self.name),
            ));
        }
        if self.mip_levels == 0 || self.array_layers == 0 {
            return Err(RhiError::invalid(
                ResourceKind::Image.name(),
                format!("{} needs at least one mip level and layer", self.name),
            ));
        }
        Ok(())
    }
}

/// GPU memory allocator wrapper.
pub struct MemoryAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl MemoryAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| RhiError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    fn allocator(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| RhiError::InvalidState("Allocator already shut down".to_string()))
    }

    /// Return an allocation whose resource never came up.
    fn release(&mut self, allocation: Allocation) {
        let freed = self.allocator().and_then(|allocator| {
            allocator
                .free(allocation)
                .map_err(|e| RhiError::AllocationFailed(e.to_string()))
        });
        if let Err(e) = freed {
            tracing::warn!("Failed to release allocation: {e}");
        }
    }

    /// Create a buffer and bind fresh memory to it.
    pub fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<Buffer> {
        if desc.size == 0 {
            return Err(RhiError::invalid(
                ResourceKind::Buffer.name(),
                format!("zero-sized buffer {}", desc.name),
            ));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocator()?.allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location: desc.location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(RhiError::AllocationFailed(e.to_string()));
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.release(allocation);
            return Err(e.into());
        }

        Ok(Buffer {
            raw: buffer,
            allocation: Some(allocation),
            size: desc.size,
        })
    }

    /// Free a buffer and its memory. The wrapper is left null.
    pub fn free_buffer(&mut self, buffer: &mut Buffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.allocator()?
                .free(allocation)
                .map_err(|e| RhiError::AllocationFailed(e.to_string()))?;
        }

        unsafe {
            self.device.destroy_buffer(buffer.raw, None);
        }
        buffer.raw = vk::Buffer::null();
        buffer.size = 0;

        Ok(())
    }

    /// Create an image and bind fresh memory to it.
    pub fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<Image> {
        desc.validate()?;

        let create_info = desc.create_info();
        let image = unsafe { self.device.create_image(&create_info, None)? };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocator()?.allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location: desc.location,
            linear: desc.tiling == vk::ImageTiling::LINEAR,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(RhiError::AllocationFailed(e.to_string()));
            }
        };

        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { self.device.destroy_image(image, None) };
            self.release(allocation);
            return Err(e.into());
        }

        Ok(Image {
            raw: image,
            allocation: Some(allocation),
            format: desc.format,
            extent: desc.extent,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
        })
    }

    /// Free an image and its memory. The wrapper is left null.
    pub fn free_image(&mut self, image: &mut Image) -> Result<()> {
        if let Some(allocation) = image.allocation.take() {
            self.allocator()?
                .free(allocation)
                .map_err(|e| RhiError::AllocationFailed(e.to_string()))?;
        }

        unsafe {
            self.device.destroy_image(image.raw, None);
        }
        image.raw = vk::Image::null();

        Ok(())
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// Must run before the logical device is destroyed. Outstanding
    /// allocations are logged as leaks.
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A buffer with its allocation.
#[derive(Debug)]
pub struct Buffer {
    raw: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
}

impl RhiHandle for Buffer {
    type Raw = vk::Buffer;
    const KIND: ResourceKind = ResourceKind::Buffer;

    fn raw(&self) -> vk::Buffer {
        self.raw
    }
}

impl Buffer {
    pub const fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Host pointer to the buffer memory, if it is mapped.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|p| p.as_ptr().cast::<u8>())
    }

    /// Write typed data at the start of the buffer (must be host-visible).
    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Write raw bytes at the given offset (must be host-visible).
    pub fn write_bytes(&self, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| RhiError::InvalidState("Buffer not mapped".to_string()))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| RhiError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(RhiError::InvalidState(format!(
                "Write of {} bytes at {offset} exceeds buffer size {}",
                data.len(),
                self.size
            )));
        }

        // SAFETY: the mapping covers `size` bytes and the range was checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }
}

/// An image with its allocation.
#[derive(Debug)]
pub struct Image {
    raw: vk::Image,
    allocation: Option<Allocation>,
    format: vk::Format,
    extent: vk::Extent3D,
    mip_levels: u32,
    array_layers: u32,
}

impl RhiHandle for Image {
    type Raw = vk::Image;
    const KIND: ResourceKind = ResourceKind::Image;

    fn raw(&self) -> vk::Image {
        self.raw
    }
}

impl Image {
    pub const fn format(&self) -> vk::Format {
        self.format
    }

    pub const fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub const fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub const fn array_layers(&self) -> u32 {
        self.array_layers
    }
}

impl Device {
    /// Create a buffer backed by fresh memory.
    pub fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Buffer> {
        let buffer = self.allocator().lock().create_buffer(desc)?;
        tracing::debug!(name = desc.name, size = desc.size, "Created buffer");
        Ok(buffer)
    }

    /// Create a buffer holding `data`.
    ///
    /// Host-visible buffers are written directly; device-local buffers are
    /// filled through a staging buffer and a blocking copy.
    pub fn create_buffer_with_data(&self, desc: &BufferDesc<'_>, data: &[u8]) -> Result<Buffer> {
        if data.len() as u64 > desc.size {
            return Err(RhiError::invalid(
                ResourceKind::Buffer.name(),
                format!(
                    "{} bytes of initial data exceed buffer size {}",
                    data.len(),
                    desc.size
                ),
            ));
        }

        if desc.location != MemoryLocation::GpuOnly {
            let buffer = self.create_buffer(desc)?;
            buffer.write_bytes(0, data)?;
            return Ok(buffer);
        }

        let mut staging = self.create_buffer(&BufferDesc {
            size: desc.size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::CpuToGpu,
            name: "staging",
        })?;
        let mut buffer = self.create_buffer(&BufferDesc {
            usage: desc.usage | vk::BufferUsageFlags::TRANSFER_DST,
            ..*desc
        })?;

        let upload = staging
            .write_bytes(0, data)
            .and_then(|()| self.copy_buffer(&staging, &buffer, 0, 0, data.len() as u64));
        self.destroy_buffer(&mut staging)?;
        if let Err(e) = upload {
            self.destroy_buffer(&mut buffer)?;
            return Err(e);
        }
        Ok(buffer)
    }

    /// Destroy a buffer and free its memory. The wrapper is left null.
    pub fn destroy_buffer(&self, buffer: &mut Buffer) -> Result<()> {
        self.allocator().lock().free_buffer(buffer)
    }

    /// Create an image backed by fresh memory.
    pub fn create_image(&self, desc: &ImageDesc<'_>) -> Result<Image> {
        let image = self.allocator().lock().create_image(desc)?;
        tracing::debug!(
            name = desc.name,
            width = desc.extent.width,
            height = desc.extent.height,
            format = ?desc.format,
            "Created image"
        );
        Ok(image)
    }

    /// Destroy an image and free its memory. The wrapper is left null.
    pub fn destroy_image(&self, image: &mut Image) -> Result<()> {
        self.allocator().lock().free_image(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_desc_defaults() {
        let desc = ImageDesc::texture_2d(
            "albedo",
            vk::Format::R8G8B8A8_SRGB,
            vk::Extent2D {
                width: 256,
                height: 128,
            },
            vk::ImageUsageFlags::SAMPLED,
        )
        .with_mip_levels(9);

        let info = desc.create_info();
        assert_eq!(info.extent.width, 256);
        assert_eq!(info.extent.height, 128);
        assert_eq!(info.extent.depth, 1);
        assert_eq!(info.mip_levels, 9);
        assert_eq!(info.array_layers, 1);
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn zero_extent_image_is_rejected() {
        let desc = ImageDesc::texture_2d(
            "empty",
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent2D {
                width: 0,
                height: 16,
            },
            vk::ImageUsageFlags::SAMPLED,
        );
        assert!(matches!(
            desc.validate(),
            Err(RhiError::InvalidDescriptor { kind: "image", .. })
        ));
    }

    #[test]
    fn unmapped_buffer_rejects_writes() {
        let buffer = Buffer {
            raw: vk::Buffer::null(),
            allocation: None,
            size: 64,
        };
        assert!(buffer.write(&[1.0f32, 2.0]).is_err());
        assert!(buffer.is_null());
    }
}
