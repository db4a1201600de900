//! Descriptor set layouts, pools and writes.

use std::ops::Range;

use ash::vk;

use crate::device::Device;
use crate::error::{RhiError, Result};
use crate::flatten::{FlatArena, Flattened};
use crate::handle::{
    raw_handles, DescriptorPool, DescriptorSet, DescriptorSetLayout, ResourceKind, RhiHandle,
};
use crate::memory::Buffer;

/// Descriptor set layout description, built binding by binding.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutDesc {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorSetLayoutDesc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    pub fn uniform_buffer_dynamic(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, 1, stage_flags)
    }

    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    pub fn storage_buffer_dynamic(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, 1, stage_flags)
    }

    pub fn storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stage_flags)
    }

    /// Add a combined image sampler binding.
    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            stage_flags,
        )
    }

    /// Add a subpass input attachment, readable from fragment shaders only.
    pub fn input_attachment(self, binding: u32) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::INPUT_ATTACHMENT,
            1,
            vk::ShaderStageFlags::FRAGMENT,
        )
    }

    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'static>] {
        &self.bindings
    }

    fn validate(&self) -> Result<()> {
        for (i, binding) in self.bindings.iter().enumerate() {
            if self.bindings[..i].iter().any(|b| b.binding == binding.binding) {
                return Err(RhiError::invalid(
                    ResourceKind::DescriptorSetLayout.name(),
                    format!("binding {} declared twice", binding.binding),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptorPoolDesc<'a> {
    pub max_sets: u32,
    pub pool_sizes: &'a [vk::DescriptorPoolSize],
    pub flags: vk::DescriptorPoolCreateFlags,
}

/// Resources written into a descriptor binding.
#[derive(Debug, Clone, Copy)]
pub enum DescriptorInfos<'a> {
    Buffers(&'a [vk::DescriptorBufferInfo]),
    Images(&'a [vk::DescriptorImageInfo]),
}

/// One update of consecutive array elements in a descriptor binding.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorWrite<'a> {
    pub set: &'a DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
    pub descriptor_type: vk::DescriptorType,
    pub infos: DescriptorInfos<'a>,
}

impl<'a> DescriptorWrite<'a> {
    pub const fn buffers(
        set: &'a DescriptorSet,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        infos: &'a [vk::DescriptorBufferInfo],
    ) -> Self {
        Self {
            set,
            binding,
            array_element: 0,
            descriptor_type,
            infos: DescriptorInfos::Buffers(infos),
        }
    }

    pub const fn images(
        set: &'a DescriptorSet,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        infos: &'a [vk::DescriptorImageInfo],
    ) -> Self {
        Self {
            set,
            binding,
            array_element: 0,
            descriptor_type,
            infos: DescriptorInfos::Images(infos),
        }
    }
}

/// Buffer range for a descriptor write.
pub fn buffer_info(
    buffer: &Buffer,
    offset: vk::DeviceSize,
    range: vk::DeviceSize,
) -> vk::DescriptorBufferInfo {
    vk::DescriptorBufferInfo::default()
        .buffer(buffer.raw())
        .offset(offset)
        .range(range)
}

/// Image view (and sampler, for sampled types) for a descriptor write.
pub fn image_info(
    sampler: vk::Sampler,
    view: vk::ImageView,
    layout: vk::ImageLayout,
) -> vk::DescriptorImageInfo {
    vk::DescriptorImageInfo::default()
        .sampler(sampler)
        .image_view(view)
        .image_layout(layout)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InfoClass {
    Buffer,
    Image,
}

const fn info_class(descriptor_type: vk::DescriptorType) -> Option<InfoClass> {
    match descriptor_type {
        vk::DescriptorType::UNIFORM_BUFFER
        | vk::DescriptorType::STORAGE_BUFFER
        | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => Some(InfoClass::Buffer),
        vk::DescriptorType::SAMPLER
        | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        | vk::DescriptorType::SAMPLED_IMAGE
        | vk::DescriptorType::STORAGE_IMAGE
        | vk::DescriptorType::INPUT_ATTACHMENT => Some(InfoClass::Image),
        _ => None,
    }
}

#[derive(Debug, Clone)]
enum WriteRun {
    Buffers(Range<usize>),
    Images(Range<usize>),
}

/// Descriptor writes with every info copied into one buffer-info array and
/// one image-info array.
#[derive(Debug)]
pub(crate) struct FlatWrites {
    buffer_infos: Flattened<vk::DescriptorBufferInfo>,
    image_infos: Flattened<vk::DescriptorImageInfo>,
    runs: Vec<(vk::DescriptorSet, u32, u32, vk::DescriptorType, WriteRun)>,
}

impl FlatWrites {
    pub(crate) fn new(writes: &[DescriptorWrite<'_>]) -> Result<Self> {
        let kind = ResourceKind::DescriptorSet.name();
        let mut buffer_total = 0;
        let mut image_total = 0;
        for write in writes {
            let (class, count) = match write.infos {
                DescriptorInfos::Buffers(infos) => (InfoClass::Buffer, infos.len()),
                DescriptorInfos::Images(infos) => (InfoClass::Image, infos.len()),
            };
            if info_class(write.descriptor_type) != Some(class) || count == 0 {
                return Err(RhiError::invalid(
                    kind,
                    format!(
                        "binding {} of type {:?} given {count} {class:?} infos",
                        write.binding, write.descriptor_type
                    ),
                ));
            }
            match class {
                InfoClass::Buffer => buffer_total += count,
                InfoClass::Image => image_total += count,
            }
        }

        let mut buffer_infos = FlatArena::with_declared_total(kind, buffer_total);
        let mut image_infos = FlatArena::with_declared_total(kind, image_total);
        let mut runs = Vec::with_capacity(writes.len());
        for write in writes {
            let run = match write.infos {
                DescriptorInfos::Buffers(infos) => {
                    WriteRun::Buffers(buffer_infos.push_run(infos.iter().copied())?)
                }
                DescriptorInfos::Images(infos) => {
                    WriteRun::Images(image_infos.push_run(infos.iter().copied())?)
                }
            };
            runs.push((
                write.set.raw(),
                write.binding,
                write.array_element,
                write.descriptor_type,
                run,
            ));
        }

        Ok(Self {
            buffer_infos: buffer_infos.finish()?,
            image_infos: image_infos.finish()?,
            runs,
        })
    }

    pub(crate) fn native(&self) -> Vec<vk::WriteDescriptorSet<'_>> {
        self.runs
            .iter()
            .map(|(set, binding, element, descriptor_type, run)| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(*set)
                    .dst_binding(*binding)
                    .dst_array_element(*element)
                    .descriptor_type(*descriptor_type);
                match run {
                    WriteRun::Buffers(range) => {
                        write.buffer_info(self.buffer_infos.slice(range.clone()))
                    }
                    WriteRun::Images(range) => write.image_info(self.image_infos.slice(range.clone())),
                }
            })
            .collect()
    }
}

impl Device {
    pub fn create_descriptor_set_layout(
        &self,
        desc: &DescriptorSetLayoutDesc,
    ) -> Result<DescriptorSetLayout> {
        desc.validate()?;
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&desc.bindings);
        let layout = unsafe { self.raw().create_descriptor_set_layout(&layout_info, None)? };
        Ok(DescriptorSetLayout::from_raw(layout))
    }

    pub fn destroy_descriptor_set_layout(&self, layout: &mut DescriptorSetLayout) {
        unsafe {
            self.raw()
                .destroy_descriptor_set_layout(layout.take_raw(), None);
        }
    }

    pub fn create_descriptor_pool(&self, desc: &DescriptorPoolDesc<'_>) -> Result<DescriptorPool> {
        if desc.max_sets == 0 || desc.pool_sizes.is_empty() {
            return Err(RhiError::invalid(
                ResourceKind::DescriptorPool.name(),
                "descriptor pool needs at least one set and one pool size",
            ));
        }
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(desc.max_sets)
            .pool_sizes(desc.pool_sizes)
            .flags(desc.flags);

        let pool = unsafe { self.raw().create_descriptor_pool(&create_info, None)? };
        Ok(DescriptorPool::from_raw(pool))
    }

    /// Reset the pool, returning every set allocated from it.
    pub fn reset_descriptor_pool(&self, pool: &DescriptorPool) -> Result<()> {
        unsafe {
            self.raw()
                .reset_descriptor_pool(pool.raw(), vk::DescriptorPoolResetFlags::empty())?;
        }
        Ok(())
    }

    pub fn destroy_descriptor_pool(&self, pool: &mut DescriptorPool) {
        unsafe { self.raw().destroy_descriptor_pool(pool.take_raw(), None) };
    }

    /// Allocate one set per layout from `pool`.
    pub fn allocate_descriptor_sets(
        &self,
        pool: &DescriptorPool,
        layouts: &[&DescriptorSetLayout],
    ) -> Result<Vec<DescriptorSet>> {
        let layouts = raw_handles(layouts);
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool.raw())
            .set_layouts(&layouts);

        let sets = unsafe { self.raw().allocate_descriptor_sets(&alloc_info)? };
        Ok(sets.into_iter().map(DescriptorSet::from_raw).collect())
    }

    pub fn update_descriptor_sets(&self, writes: &[DescriptorWrite<'_>]) -> Result<()> {
        let flat = FlatWrites::new(writes)?;
        let native = flat.native();
        unsafe { self.raw().update_descriptor_sets(&native, &[]) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn set(raw: u64) -> DescriptorSet {
        DescriptorSet::from_raw(vk::DescriptorSet::from_raw(raw))
    }

    #[test]
    fn writes_flatten_per_info_kind() {
        let (globals, material) = (set(1), set(2));
        let camera = [vk::DescriptorBufferInfo {
            buffer: vk::Buffer::from_raw(9),
            offset: 0,
            range: 256,
        }];
        let lights = [
            vk::DescriptorBufferInfo::default().range(64),
            vk::DescriptorBufferInfo::default().offset(64).range(64),
        ];
        let textures = [image_info(
            vk::Sampler::from_raw(3),
            vk::ImageView::from_raw(4),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )];

        let writes = [
            DescriptorWrite::buffers(&globals, 0, vk::DescriptorType::UNIFORM_BUFFER, &camera),
            DescriptorWrite::buffers(&globals, 1, vk::DescriptorType::STORAGE_BUFFER, &lights),
            DescriptorWrite::images(
                &material,
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                &textures,
            ),
        ];

        let flat = FlatWrites::new(&writes).unwrap();
        assert_eq!(flat.buffer_infos.len(), 3);
        assert_eq!(flat.image_infos.len(), 1);

        let native = flat.native();
        assert_eq!(native[1].descriptor_count, 2);
        assert_eq!(native[1].dst_binding, 1);
        assert!(native[1].p_image_info.is_null());
        assert_eq!(native[2].dst_set, vk::DescriptorSet::from_raw(2));
        assert!(native[2].p_buffer_info.is_null());
        assert_eq!(native[2].descriptor_count, 1);
    }

    #[test]
    fn writes_need_infos_of_the_right_kind() {
        let globals = set(1);
        let image = [vk::DescriptorImageInfo::default()];
        let wrong_kind = [DescriptorWrite::images(
            &globals,
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            &image,
        )];
        assert!(matches!(
            FlatWrites::new(&wrong_kind),
            Err(RhiError::InvalidDescriptor {
                kind: "descriptor set",
                ..
            })
        ));

        let empty = [DescriptorWrite::buffers(
            &globals,
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            &[],
        )];
        assert!(FlatWrites::new(&empty).is_err());
    }

    #[test]
    fn layout_rejects_duplicate_bindings() {
        let ok = DescriptorSetLayoutDesc::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .sampled_image(1, vk::ShaderStageFlags::FRAGMENT)
            .input_attachment(2);
        assert!(ok.validate().is_ok());
        assert_eq!(ok.bindings().len(), 3);
        assert_eq!(
            ok.bindings()[2].descriptor_type,
            vk::DescriptorType::INPUT_ATTACHMENT
        );

        let dup = ok.storage_buffer(1, vk::ShaderStageFlags::COMPUTE);
        assert!(dup.validate().is_err());
    }
}
