//! Samplers and the device-owned sampler cache.

use std::collections::HashMap;

use ash::vk;

use crate::device::Device;
use crate::error::{RhiError, Result};
use crate::handle::{ResourceKind, Sampler};

/// Portable description of a sampler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    pub mip_lod_bias: f32,
    /// `None` disables anisotropic filtering.
    pub max_anisotropy: Option<f32>,
    pub compare_op: Option<vk::CompareOp>,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: vk::BorderColor,
}

impl SamplerDesc {
    /// Trilinear, repeating, anisotropic.
    pub const fn linear(max_anisotropy: f32) -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            mip_lod_bias: 0.0,
            max_anisotropy: Some(max_anisotropy),
            compare_op: None,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::INT_OPAQUE_BLACK,
        }
    }

    /// Point sampling, clamped to edge.
    pub const fn nearest() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            mip_lod_bias: 0.0,
            max_anisotropy: None,
            compare_op: None,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::INT_OPAQUE_BLACK,
        }
    }

    /// Trilinear sampler covering exactly `mip_levels` levels.
    #[allow(clippy::cast_precision_loss)]
    pub fn mipmapped(mip_levels: u32, max_anisotropy: f32) -> Self {
        let mut desc = Self::linear(max_anisotropy);
        desc.max_lod = mip_levels.saturating_sub(1) as f32;
        desc
    }

    fn create_info(&self) -> vk::SamplerCreateInfo<'static> {
        vk::SamplerCreateInfo::default()
            .mag_filter(self.mag_filter)
            .min_filter(self.min_filter)
            .mipmap_mode(self.mipmap_mode)
            .address_mode_u(self.address_mode)
            .address_mode_v(self.address_mode)
            .address_mode_w(self.address_mode)
            .mip_lod_bias(self.mip_lod_bias)
            .anisotropy_enable(self.max_anisotropy.is_some())
            .max_anisotropy(self.max_anisotropy.unwrap_or(1.0))
            .compare_enable(self.compare_op.is_some())
            .compare_op(self.compare_op.unwrap_or(vk::CompareOp::ALWAYS))
            .min_lod(self.min_lod)
            .max_lod(self.max_lod)
            .border_color(self.border_color)
            .unnormalized_coordinates(false)
    }
}

/// Built-in samplers shared by every pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefaultSampler {
    Linear,
    Nearest,
}

/// Number of mip levels in a full chain for a `width`×`height` image,
/// `floor(log2(max(width, height))) + 1`.
pub fn mip_level_count(width: u32, height: u32) -> Result<u32> {
    if width == 0 || height == 0 {
        return Err(RhiError::invalid(
            ResourceKind::Sampler.name(),
            format!("mip chain requested for zero-sized image {width}x{height}"),
        ));
    }
    Ok(u32::BITS - width.max(height).leading_zeros())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SamplerKey {
    Default(DefaultSampler),
    Mipmap(u32),
}

/// Lazily created samplers, keyed by role or mip level count.
///
/// Cached samplers belong to the cache and are destroyed with the device.
#[derive(Debug, Default)]
pub struct SamplerCache {
    samplers: HashMap<SamplerKey, vk::Sampler>,
}

impl SamplerCache {
    fn get_or_create(
        &mut self,
        key: SamplerKey,
        create: impl FnOnce() -> Result<vk::Sampler>,
    ) -> Result<vk::Sampler> {
        if let Some(&sampler) = self.samplers.get(&key) {
            return Ok(sampler);
        }
        let sampler = create()?;
        self.samplers.insert(key, sampler);
        Ok(sampler)
    }

    pub fn len(&self) -> usize {
        self.samplers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }

    /// Destroy every cached sampler.
    ///
    /// # Safety
    /// No cached sampler may still be in use.
    pub(crate) unsafe fn destroy_all(&mut self, device: &ash::Device) {
        for (_, sampler) in self.samplers.drain() {
            device.destroy_sampler(sampler, None);
        }
    }
}

impl Device {
    /// Create a sampler owned by the caller.
    pub fn create_sampler(&self, desc: &SamplerDesc) -> Result<Sampler> {
        let sampler = unsafe { self.raw().create_sampler(&desc.create_info(), None)? };
        Ok(Sampler::from_raw(sampler))
    }

    /// Destroy a caller-owned sampler.
    pub fn destroy_sampler(&self, sampler: &mut Sampler) {
        unsafe { self.raw().destroy_sampler(sampler.take_raw(), None) };
    }

    /// One of the shared default samplers, created on first use.
    ///
    /// The returned sampler is owned by the device.
    pub fn default_sampler(&self, kind: DefaultSampler) -> Result<vk::Sampler> {
        let desc = match kind {
            DefaultSampler::Linear => SamplerDesc::linear(self.limits().max_sampler_anisotropy),
            DefaultSampler::Nearest => SamplerDesc::nearest(),
        };
        self.samplers()
            .lock()
            .get_or_create(SamplerKey::Default(kind), || {
                Ok(unsafe { self.raw().create_sampler(&desc.create_info(), None)? })
            })
    }

    /// Shared trilinear sampler sized for a `width`×`height` mip chain.
    ///
    /// Images whose chains have the same length share one sampler. The
    /// returned sampler is owned by the device.
    pub fn mipmap_sampler(&self, width: u32, height: u32) -> Result<vk::Sampler> {
        let mip_levels = mip_level_count(width, height)?;
        let desc = SamplerDesc::mipmapped(mip_levels, self.limits().max_sampler_anisotropy);
        self.samplers()
            .lock()
            .get_or_create(SamplerKey::Mipmap(mip_levels), || {
                Ok(unsafe { self.raw().create_sampler(&desc.create_info(), None)? })
            })
    }
}
