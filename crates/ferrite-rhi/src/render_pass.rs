//! Render passes and framebuffers.

use std::ops::Range;

use ash::vk;

use crate::device::Device;
use crate::error::{RhiError, Result};
use crate::flatten::{FlatArena, Flattened};
use crate::handle::{raw_handles, Framebuffer, ImageView, RenderPass, ResourceKind, RhiHandle};

/// One subpass of a [`RenderPassDesc`].
#[derive(Debug, Clone, Copy)]
pub struct SubpassDesc<'a> {
    pub bind_point: vk::PipelineBindPoint,
    pub input_attachments: &'a [vk::AttachmentReference],
    pub color_attachments: &'a [vk::AttachmentReference],
    /// Empty, or exactly one entry per color attachment.
    pub resolve_attachments: &'a [vk::AttachmentReference],
    pub depth_stencil_attachment: Option<vk::AttachmentReference>,
    pub preserve_attachments: &'a [u32],
}

impl Default for SubpassDesc<'_> {
    fn default() -> Self {
        Self {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            input_attachments: &[],
            color_attachments: &[],
            resolve_attachments: &[],
            depth_stencil_attachment: None,
            preserve_attachments: &[],
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderPassDesc<'a> {
    pub attachments: &'a [vk::AttachmentDescription],
    pub subpasses: &'a [SubpassDesc<'a>],
    pub dependencies: &'a [vk::SubpassDependency],
}

#[derive(Debug, Clone)]
struct SubpassRuns {
    input: Range<usize>,
    color: Range<usize>,
    resolve: Range<usize>,
    depth: Option<usize>,
    preserve: Range<usize>,
}

/// Subpass references copied into one reference array and one preserve array.
#[derive(Debug)]
pub(crate) struct FlatSubpasses {
    refs: Flattened<vk::AttachmentReference>,
    preserve: Flattened<u32>,
    runs: Vec<(vk::PipelineBindPoint, SubpassRuns)>,
}

impl FlatSubpasses {
    pub(crate) fn new(desc: &RenderPassDesc<'_>) -> Result<Self> {
        let kind = ResourceKind::RenderPass.name();
        if desc.subpasses.is_empty() {
            return Err(RhiError::invalid(kind, "render pass has no subpasses"));
        }

        let attachment_count = desc.attachments.len();
        let in_range = |r: &vk::AttachmentReference| {
            r.attachment == vk::ATTACHMENT_UNUSED || (r.attachment as usize) < attachment_count
        };

        let mut ref_total = 0;
        let mut preserve_total = 0;
        for (i, subpass) in desc.subpasses.iter().enumerate() {
            if !subpass.resolve_attachments.is_empty()
                && subpass.resolve_attachments.len() != subpass.color_attachments.len()
            {
                return Err(RhiError::invalid(
                    kind,
                    format!(
                        "subpass {i} has {} resolve attachments for {} color attachments",
                        subpass.resolve_attachments.len(),
                        subpass.color_attachments.len()
                    ),
                ));
            }

            let refs = subpass
                .input_attachments
                .iter()
                .chain(subpass.color_attachments)
                .chain(subpass.resolve_attachments)
                .chain(subpass.depth_stencil_attachment.as_ref());
            if let Some(bad) = refs.clone().find(|r| !in_range(r)) {
                return Err(RhiError::invalid(
                    kind,
                    format!(
                        "subpass {i} references attachment {} of {attachment_count}",
                        bad.attachment
                    ),
                ));
            }
            if let Some(bad) = subpass
                .preserve_attachments
                .iter()
                .find(|&&a| a as usize >= attachment_count)
            {
                return Err(RhiError::invalid(
                    kind,
                    format!("subpass {i} preserves attachment {bad} of {attachment_count}"),
                ));
            }

            ref_total += refs.count();
            preserve_total += subpass.preserve_attachments.len();
        }

        let mut refs = FlatArena::with_declared_total(kind, ref_total);
        let mut preserve = FlatArena::with_declared_total(kind, preserve_total);
        let mut runs = Vec::with_capacity(desc.subpasses.len());
        for subpass in desc.subpasses {
            let depth = match subpass.depth_stencil_attachment {
                Some(depth) => Some(refs.push_one(depth)?),
                None => None,
            };
            runs.push((
                subpass.bind_point,
                SubpassRuns {
                    input: refs.push_run(subpass.input_attachments.iter().copied())?,
                    color: refs.push_run(subpass.color_attachments.iter().copied())?,
                    resolve: refs.push_run(subpass.resolve_attachments.iter().copied())?,
                    depth,
                    preserve: preserve.push_run(subpass.preserve_attachments.iter().copied())?,
                },
            ));
        }

        Ok(Self {
            refs: refs.finish()?,
            preserve: preserve.finish()?,
            runs,
        })
    }

    pub(crate) fn descriptions(&self) -> Vec<vk::SubpassDescription<'_>> {
        self.runs
            .iter()
            .map(|(bind_point, run)| {
                let mut description = vk::SubpassDescription::default()
                    .pipeline_bind_point(*bind_point)
                    .input_attachments(self.refs.slice(run.input.clone()))
                    .color_attachments(self.refs.slice(run.color.clone()))
                    .preserve_attachments(self.preserve.slice(run.preserve.clone()));
                if let Some(resolve) = self.refs.slice_opt(run.resolve.clone()) {
                    description = description.resolve_attachments(resolve);
                }
                if let Some(depth) = run.depth {
                    description = description.depth_stencil_attachment(self.refs.get(depth));
                }
                description
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FramebufferDesc<'a> {
    pub render_pass: &'a RenderPass,
    pub attachments: &'a [&'a ImageView],
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    /// Attachment count of `render_pass`, checked against `attachments` when set.
    pub render_pass_attachment_count: Option<usize>,
}

impl FramebufferDesc<'_> {
    fn validate(&self) -> Result<()> {
        let kind = ResourceKind::Framebuffer.name();
        if let Some(expected) = self.render_pass_attachment_count {
            if expected != self.attachments.len() {
                return Err(RhiError::invalid(
                    kind,
                    format!(
                        "{} attachments for a render pass declaring {expected}",
                        self.attachments.len()
                    ),
                ));
            }
        }
        if self.width == 0 || self.height == 0 || self.layers == 0 {
            return Err(RhiError::invalid(
                kind,
                format!("zero extent {}x{}x{}", self.width, self.height, self.layers),
            ));
        }
        Ok(())
    }
}

impl Device {
    pub fn create_render_pass(&self, desc: &RenderPassDesc<'_>) -> Result<RenderPass> {
        let flat = FlatSubpasses::new(desc)?;
        let subpasses = flat.descriptions();
        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(desc.attachments)
            .subpasses(&subpasses)
            .dependencies(desc.dependencies);

        let render_pass = unsafe { self.raw().create_render_pass(&create_info, None)? };
        tracing::debug!(
            attachments = desc.attachments.len(),
            subpasses = subpasses.len(),
            "Created render pass"
        );
        Ok(RenderPass::from_raw(render_pass))
    }

    pub fn destroy_render_pass(&self, render_pass: &mut RenderPass) {
        unsafe { self.raw().destroy_render_pass(render_pass.take_raw(), None) };
    }

    pub fn create_framebuffer(&self, desc: &FramebufferDesc<'_>) -> Result<Framebuffer> {
        desc.validate()?;
        let attachments = raw_handles(desc.attachments);
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(desc.render_pass.raw())
            .attachments(&attachments)
            .width(desc.width)
            .height(desc.height)
            .layers(desc.layers);

        let framebuffer = unsafe { self.raw().create_framebuffer(&create_info, None)? };
        Ok(Framebuffer::from_raw(framebuffer))
    }

    pub fn destroy_framebuffer(&self, framebuffer: &mut Framebuffer) {
        unsafe { self.raw().destroy_framebuffer(framebuffer.take_raw(), None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    const fn color_ref(attachment: u32) -> vk::AttachmentReference {
        vk::AttachmentReference {
            attachment,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }
    }

    const fn depth_ref(attachment: u32) -> vk::AttachmentReference {
        vk::AttachmentReference {
            attachment,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        }
    }

    fn attachments(count: usize) -> Vec<vk::AttachmentDescription> {
        vec![vk::AttachmentDescription::default(); count]
    }

    #[test]
    fn deferred_subpasses_share_one_reference_array() {
        let attachments = attachments(4);
        let gbuffer = [color_ref(1), color_ref(2)];
        let inputs = [
            vk::AttachmentReference {
                attachment: 1,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
            vk::AttachmentReference {
                attachment: 2,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        ];
        let lighting = [color_ref(0)];
        let subpasses = [
            SubpassDesc {
                color_attachments: &gbuffer,
                depth_stencil_attachment: Some(depth_ref(3)),
                ..Default::default()
            },
            SubpassDesc {
                input_attachments: &inputs,
                color_attachments: &lighting,
                preserve_attachments: &[3],
                ..Default::default()
            },
        ];
        let desc = RenderPassDesc {
            attachments: &attachments,
            subpasses: &subpasses,
            dependencies: &[],
        };

        let flat = FlatSubpasses::new(&desc).unwrap();
        assert_eq!(flat.refs.len(), 6);
        assert_eq!(flat.preserve.len(), 1);

        let descriptions = flat.descriptions();
        assert_eq!(descriptions[0].color_attachment_count, 2);
        assert!(!descriptions[0].p_depth_stencil_attachment.is_null());
        assert!(descriptions[0].p_resolve_attachments.is_null());
        assert_eq!(descriptions[1].input_attachment_count, 2);
        assert_eq!(descriptions[1].color_attachment_count, 1);
        assert_eq!(descriptions[1].preserve_attachment_count, 1);
        assert!(descriptions[1].p_depth_stencil_attachment.is_null());
    }

    #[test]
    fn resolve_count_must_match_color_count() {
        let attachments = attachments(3);
        let subpasses = [SubpassDesc {
            color_attachments: &[color_ref(0), color_ref(1)],
            resolve_attachments: &[color_ref(2)],
            ..Default::default()
        }];
        let desc = RenderPassDesc {
            attachments: &attachments,
            subpasses: &subpasses,
            dependencies: &[],
        };
        assert!(FlatSubpasses::new(&desc).is_err());
    }

    #[test]
    fn matching_resolve_sets_resolve_pointer() {
        let attachments = attachments(2);
        let subpasses = [SubpassDesc {
            color_attachments: &[color_ref(0)],
            resolve_attachments: &[color_ref(1)],
            ..Default::default()
        }];
        let desc = RenderPassDesc {
            attachments: &attachments,
            subpasses: &subpasses,
            dependencies: &[],
        };
        let flat = FlatSubpasses::new(&desc).unwrap();
        let descriptions = flat.descriptions();
        assert_eq!(descriptions[0].color_attachment_count, 1);
        assert!(!descriptions[0].p_resolve_attachments.is_null());
    }

    #[test]
    fn references_must_name_existing_attachments() {
        let attachments = attachments(1);
        let out_of_range = [SubpassDesc {
            color_attachments: &[color_ref(0)],
            depth_stencil_attachment: Some(depth_ref(1)),
            ..Default::default()
        }];
        let desc = RenderPassDesc {
            attachments: &attachments,
            subpasses: &out_of_range,
            dependencies: &[],
        };
        assert!(matches!(
            FlatSubpasses::new(&desc),
            Err(RhiError::InvalidDescriptor {
                kind: "render pass",
                ..
            })
        ));

        let unused = [SubpassDesc {
            color_attachments: &[color_ref(0), color_ref(vk::ATTACHMENT_UNUSED)],
            ..Default::default()
        }];
        let desc = RenderPassDesc {
            subpasses: &unused,
            ..desc
        };
        assert!(FlatSubpasses::new(&desc).is_ok());
    }

    #[test]
    fn framebuffer_attachment_count_is_checked() {
        let render_pass = RenderPass::from_raw(vk::RenderPass::from_raw(1));
        let color = ImageView::from_raw(vk::ImageView::from_raw(2));
        let desc = FramebufferDesc {
            render_pass: &render_pass,
            attachments: &[&color],
            width: 800,
            height: 600,
            layers: 1,
            render_pass_attachment_count: Some(2),
        };
        assert!(desc.validate().is_err());
        assert!(FramebufferDesc {
            render_pass_attachment_count: Some(1),
            ..desc
        }
        .validate()
        .is_ok());
        assert!(FramebufferDesc {
            render_pass_attachment_count: None,
            width: 0,
            ..desc
        }
        .validate()
        .is_err());
    }
}
