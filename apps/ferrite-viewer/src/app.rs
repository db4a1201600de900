//! Clear-only render pass over the swapchain and depth attachment.

use ash::vk;
use ferrite_rhi::recording::DEFAULT_LABEL_COLOR;
use ferrite_rhi::{
    Framebuffer, FramebufferDesc, RenderPass, RenderPassBegin, RenderPassDesc, Rhi, SubpassDesc,
};

/// Frames for one full sweep of the clear color.
const COLOR_PERIOD_FRAMES: u64 = 360;

/// Clear color for `frame`, sweeping hue so dropped frames are visible.
pub fn clear_color(frame: u64) -> [f32; 4] {
    let phase = (frame % COLOR_PERIOD_FRAMES) as f32 / COLOR_PERIOD_FRAMES as f32;
    let angle = phase * std::f32::consts::TAU;
    [
        0.5f32.mul_add(angle.sin(), 0.5) * 0.4,
        0.5f32.mul_add((angle + 2.1).sin(), 0.5) * 0.4,
        0.5f32.mul_add((angle + 4.2).sin(), 0.5) * 0.4,
        1.0,
    ]
}

/// Render pass clearing color and depth, with one framebuffer per swapchain image.
pub struct ClearPass {
    render_pass: RenderPass,
    framebuffers: Vec<Framebuffer>,
}

impl ClearPass {
    pub fn new(rhi: &Rhi) -> anyhow::Result<Self> {
        let attachments = [
            vk::AttachmentDescription::default()
                .format(rhi.swapchain_format())
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::PRESENT_SRC_KHR),
            vk::AttachmentDescription::default()
                .format(rhi.depth_format())
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        ];
        let color = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let subpasses = [SubpassDesc {
            color_attachments: &color,
            depth_stencil_attachment: Some(vk::AttachmentReference {
                attachment: 1,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            }),
            ..Default::default()
        }];
        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependencies = [vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: stages,
            dst_stage_mask: stages,
            src_access_mask: vk::AccessFlags::empty(),
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::empty(),
        }];

        let render_pass = rhi.device().create_render_pass(&RenderPassDesc {
            attachments: &attachments,
            subpasses: &subpasses,
            dependencies: &dependencies,
        })?;

        let mut pass = Self {
            render_pass,
            framebuffers: Vec::new(),
        };
        pass.create_framebuffers(rhi)?;
        Ok(pass)
    }

    fn create_framebuffers(&mut self, rhi: &Rhi) -> anyhow::Result<()> {
        let extent = rhi.swapchain_extent();
        for view in rhi.swapchain_image_views() {
            let framebuffer = rhi.device().create_framebuffer(&FramebufferDesc {
                render_pass: &self.render_pass,
                attachments: &[view, rhi.depth_view()],
                width: extent.width,
                height: extent.height,
                layers: 1,
                render_pass_attachment_count: Some(2),
            })?;
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    fn destroy_framebuffers(&mut self, rhi: &Rhi) {
        for mut framebuffer in self.framebuffers.drain(..) {
            rhi.device().destroy_framebuffer(&mut framebuffer);
        }
    }

    /// Recreate the framebuffers against the rebuilt swapchain.
    pub fn rebuild(&mut self, rhi: &Rhi) -> anyhow::Result<()> {
        self.destroy_framebuffers(rhi);
        self.create_framebuffers(rhi)?;
        tracing::debug!(count = self.framebuffers.len(), "Recreated framebuffers");
        Ok(())
    }

    /// Record the clear into the current frame's command buffer.
    pub fn record(&self, rhi: &Rhi, frame: u64) -> anyhow::Result<()> {
        let image_index = rhi
            .current_image_index()
            .ok_or_else(|| anyhow::anyhow!("No swapchain image acquired"))?;
        let framebuffer = self
            .framebuffers
            .get(image_index as usize)
            .ok_or_else(|| anyhow::anyhow!("No framebuffer for image {image_index}"))?;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color(frame),
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let ctx = rhi.prepare_context();
        let _label = ctx.label_scope("clear", DEFAULT_LABEL_COLOR);
        ctx.begin_render_pass(
            &RenderPassBegin {
                render_pass: &self.render_pass,
                framebuffer,
                render_area: rhi.scissor(),
                clear_values: &clear_values,
            },
            vk::SubpassContents::INLINE,
        );
        ctx.end_render_pass();
        Ok(())
    }

    pub fn destroy(&mut self, rhi: &Rhi) {
        self.destroy_framebuffers(rhi);
        rhi.device().destroy_render_pass(&mut self.render_pass);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_color_is_periodic_and_opaque() {
        for frame in [0, 17, 200] {
            let color = clear_color(frame);
            assert_eq!(color, clear_color(frame + COLOR_PERIOD_FRAMES));
            assert!((color[3] - 1.0).abs() < f32::EPSILON);
            assert!(color[..3].iter().all(|c| (0.0..=0.4).contains(c)));
        }
    }
}
