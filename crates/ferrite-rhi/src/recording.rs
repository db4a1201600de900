//! Command recording.
//!
//! [`CommandContext`] is a thin marshal over one command buffer that is
//! already recording. Native recording calls report nothing; errors surface
//! only when the buffer is ended or submitted.

use ash::vk;

use crate::debug::DebugLabels;
use crate::device::Device;
use crate::error::{RhiError, Result};
use crate::flatten::{FlatArena, Flattened};
use crate::handle::{
    raw_handles, CommandBuffer, DescriptorSet, Framebuffer, Pipeline, PipelineLayout, RenderPass,
    ResourceKind, RhiHandle,
};
use crate::memory::Buffer;

/// Label color used when the caller does not pick one.
pub const DEFAULT_LABEL_COLOR: [f32; 4] = [0.4, 0.6, 1.0, 1.0];

#[derive(Clone, Copy)]
pub struct RenderPassBegin<'a> {
    pub render_pass: &'a RenderPass,
    pub framebuffer: &'a Framebuffer,
    pub render_area: vk::Rect2D,
    /// One entry per attachment that is cleared on load.
    pub clear_values: &'a [vk::ClearValue],
}

/// A descriptor set bound at a set index, with offsets for its dynamic
/// bindings in binding order.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorBinding<'a> {
    pub set: &'a DescriptorSet,
    pub dynamic_offsets: &'a [u32],
}

/// Sets and their dynamic offsets laid out as the native bind call wants them.
#[derive(Debug)]
pub(crate) struct FlatBindings {
    sets: Vec<vk::DescriptorSet>,
    offsets: Flattened<u32>,
}

impl FlatBindings {
    pub(crate) fn new(bindings: &[DescriptorBinding<'_>]) -> Result<Self> {
        let total = bindings.iter().map(|b| b.dynamic_offsets.len()).sum();
        let mut offsets = FlatArena::with_declared_total(ResourceKind::DescriptorSet.name(), total);
        for binding in bindings {
            offsets.push_run(binding.dynamic_offsets.iter().copied())?;
        }
        Ok(Self {
            sets: bindings.iter().map(|b| b.set.raw()).collect(),
            offsets: offsets.finish()?,
        })
    }
}

/// Every bound vertex buffer needs exactly one offset.
fn check_vertex_bindings(buffers: usize, offsets: usize) -> Result<()> {
    if buffers == offsets {
        Ok(())
    } else {
        Err(RhiError::invalid(
            ResourceKind::Buffer.name(),
            format!("{buffers} vertex buffers bound with {offsets} offsets"),
        ))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferBarrier<'a> {
    pub buffer: &'a Buffer,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

/// Layout transition and access hand-over for an image subresource range.
#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub range: vk::ImageSubresourceRange,
}

impl ImageBarrier {
    fn native(&self) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier::default()
            .image(self.image)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .subresource_range(self.range)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BarrierDesc<'a> {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dependency_flags: vk::DependencyFlags,
    pub memory: &'a [vk::MemoryBarrier<'a>],
    pub buffers: &'a [BufferBarrier<'a>],
    pub images: &'a [ImageBarrier],
}

/// Records into one command buffer that is already recording.
pub struct CommandContext<'a> {
    device: &'a Device,
    cmd: vk::CommandBuffer,
}

impl<'a> CommandContext<'a> {
    pub fn new(device: &'a Device, cmd: &CommandBuffer) -> Self {
        Self {
            device,
            cmd: cmd.raw(),
        }
    }

    /// The command buffer being recorded.
    pub const fn raw(&self) -> vk::CommandBuffer {
        self.cmd
    }

    fn ash(&self) -> &ash::Device {
        self.device.raw()
    }

    pub fn begin_render_pass(&self, begin: &RenderPassBegin<'_>, contents: vk::SubpassContents) {
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(begin.render_pass.raw())
            .framebuffer(begin.framebuffer.raw())
            .render_area(begin.render_area)
            .clear_values(begin.clear_values);
        unsafe { self.ash().cmd_begin_render_pass(self.cmd, &info, contents) };
    }

    pub fn next_subpass(&self, contents: vk::SubpassContents) {
        unsafe { self.ash().cmd_next_subpass(self.cmd, contents) };
    }

    pub fn end_render_pass(&self) {
        unsafe { self.ash().cmd_end_render_pass(self.cmd) };
    }

    pub fn bind_pipeline(&self, bind_point: vk::PipelineBindPoint, pipeline: &Pipeline) {
        unsafe {
            self.ash()
                .cmd_bind_pipeline(self.cmd, bind_point, pipeline.raw());
        }
    }

    pub fn set_viewport(&self, viewport: vk::Viewport) {
        unsafe { self.ash().cmd_set_viewport(self.cmd, 0, &[viewport]) };
    }

    pub fn set_scissor(&self, scissor: vk::Rect2D) {
        unsafe { self.ash().cmd_set_scissor(self.cmd, 0, &[scissor]) };
    }

    /// Bind `buffers` to consecutive bindings starting at `first_binding`.
    pub fn bind_vertex_buffers(
        &self,
        first_binding: u32,
        buffers: &[&Buffer],
        offsets: &[vk::DeviceSize],
    ) -> Result<()> {
        check_vertex_bindings(buffers.len(), offsets.len())?;
        let buffers = raw_handles(buffers);
        unsafe {
            self.ash()
                .cmd_bind_vertex_buffers(self.cmd, first_binding, &buffers, offsets);
        }
        Ok(())
    }

    pub fn bind_index_buffer(
        &self,
        buffer: &Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.ash()
                .cmd_bind_index_buffer(self.cmd, buffer.raw(), offset, index_type);
        }
    }

    /// Bind consecutive descriptor sets starting at `first_set`.
    pub fn bind_descriptor_sets(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: &PipelineLayout,
        first_set: u32,
        bindings: &[DescriptorBinding<'_>],
    ) -> Result<()> {
        let flat = FlatBindings::new(bindings)?;
        unsafe {
            self.ash().cmd_bind_descriptor_sets(
                self.cmd,
                bind_point,
                layout.raw(),
                first_set,
                &flat.sets,
                flat.offsets.as_slice(),
            );
        }
        Ok(())
    }

    pub fn push_constants(
        &self,
        layout: &PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.ash()
                .cmd_push_constants(self.cmd, layout.raw(), stages, offset, data);
        }
    }

    pub fn draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.ash().cmd_draw(
                self.cmd,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
    }

    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.ash().cmd_draw_indexed(
                self.cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    pub fn dispatch(&self, x: u32, y: u32, z: u32) {
        unsafe { self.ash().cmd_dispatch(self.cmd, x, y, z) };
    }

    /// Dispatch with group counts read from `buffer` at `offset`.
    pub fn dispatch_indirect(&self, buffer: &Buffer, offset: vk::DeviceSize) {
        unsafe {
            self.ash()
                .cmd_dispatch_indirect(self.cmd, buffer.raw(), offset);
        }
    }

    pub fn pipeline_barrier(&self, desc: &BarrierDesc<'_>) {
        let buffers: Vec<_> = desc
            .buffers
            .iter()
            .map(|b| {
                vk::BufferMemoryBarrier::default()
                    .buffer(b.buffer.raw())
                    .src_access_mask(b.src_access)
                    .dst_access_mask(b.dst_access)
                    .offset(b.offset)
                    .size(b.size)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            })
            .collect();
        let images: Vec<_> = desc.images.iter().map(ImageBarrier::native).collect();

        unsafe {
            self.ash().cmd_pipeline_barrier(
                self.cmd,
                desc.src_stage,
                desc.dst_stage,
                desc.dependency_flags,
                desc.memory,
                &buffers,
                &images,
            );
        }
    }

    pub fn copy_buffer(&self, src: &Buffer, dst: &Buffer, regions: &[vk::BufferCopy]) {
        unsafe {
            self.ash()
                .cmd_copy_buffer(self.cmd, src.raw(), dst.raw(), regions);
        }
    }

    pub fn copy_buffer_to_image(
        &self,
        src: &Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.ash()
                .cmd_copy_buffer_to_image(self.cmd, src.raw(), dst, dst_layout, regions);
        }
    }

    pub fn copy_image_to_buffer(
        &self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: &Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.ash()
                .cmd_copy_image_to_buffer(self.cmd, src, src_layout, dst.raw(), regions);
        }
    }

    pub fn copy_image(
        &self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        unsafe {
            self.ash()
                .cmd_copy_image(self.cmd, src, src_layout, dst, dst_layout, regions);
        }
    }

    pub fn blit_image(
        &self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        unsafe {
            self.ash()
                .cmd_blit_image(self.cmd, src, src_layout, dst, dst_layout, regions, filter);
        }
    }

    /// Clear regions of attachments of the current subpass.
    pub fn clear_attachments(&self, attachments: &[vk::ClearAttachment], rects: &[vk::ClearRect]) {
        unsafe {
            self.ash()
                .cmd_clear_attachments(self.cmd, attachments, rects);
        }
    }

    pub fn begin_label(&self, name: &str, color: [f32; 4]) {
        unsafe { self.device.labels().begin(self.cmd, name, color) };
    }

    pub fn end_label(&self) {
        unsafe { self.device.labels().end(self.cmd) };
    }

    pub fn insert_label(&self, name: &str, color: [f32; 4]) {
        unsafe { self.device.labels().insert(self.cmd, name, color) };
    }

    /// Open a label that closes when the returned guard drops.
    pub fn label_scope(&self, name: &str, color: [f32; 4]) -> DebugLabelScope<'a> {
        DebugLabelScope::begin(self.device.labels(), self.cmd, name, color)
    }
}

/// Open debug label region, closed on drop.
pub struct DebugLabelScope<'a> {
    labels: &'a DebugLabels,
    cmd: vk::CommandBuffer,
}

impl<'a> DebugLabelScope<'a> {
    pub fn begin(
        labels: &'a DebugLabels,
        cmd: vk::CommandBuffer,
        name: &str,
        color: [f32; 4],
    ) -> Self {
        unsafe { labels.begin(cmd, name, color) };
        Self { labels, cmd }
    }
}

impl Drop for DebugLabelScope<'_> {
    fn drop(&mut self) {
        unsafe { self.labels.end(self.cmd) };
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
    fn dynamic_offsets_flatten_in_set_order() {
        let (frame, object, material) = (set(1), set(2), set(3));
        let bindings = [
            DescriptorBinding {
                set: &frame,
                dynamic_offsets: &[256],
            },
            DescriptorBinding {
                set: &object,
                dynamic_offsets: &[0, 512],
            },
            DescriptorBinding {
                set: &material,
                dynamic_offsets: &[],
            },
        ];

        let flat = FlatBindings::new(&bindings).unwrap();
        assert_eq!(
            flat.sets,
            vec![
                vk::DescriptorSet::from_raw(1),
                vk::DescriptorSet::from_raw(2),
                vk::DescriptorSet::from_raw(3)
            ]
        );
        assert_eq!(flat.offsets.as_slice(), &[256, 0, 512]);
    }

    #[test]
    fn vertex_buffers_need_one_offset_each() {
        assert!(check_vertex_bindings(2, 2).is_ok());
        assert!(check_vertex_bindings(0, 0).is_ok());
        assert!(matches!(
            check_vertex_bindings(2, 1),
            Err(RhiError::InvalidDescriptor { kind: "buffer", .. })
        ));
        assert!(check_vertex_bindings(1, 3).is_err());
    }

    #[test]
    fn image_barrier_ignores_queue_ownership() {
        let barrier = ImageBarrier {
            image: vk::Image::from_raw(7),
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            range: crate::image::full_range(vk::ImageAspectFlags::COLOR, 1, 6),
        }
        .native();
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(barrier.subresource_range.layer_count, 6);
        assert_eq!(barrier.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn label_scope_is_inert_without_debug_utils() {
        let labels = DebugLabels::disabled();
        {
            let _scope = DebugLabelScope::begin(
                &labels,
                vk::CommandBuffer::null(),
                "shadow pass",
                DEFAULT_LABEL_COLOR,
            );
        }
        assert!(!labels.is_enabled());
    }
}
