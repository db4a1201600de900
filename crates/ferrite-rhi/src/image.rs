//! Image views and texture uploads.

use ash::vk;

use crate::device::Device;
use crate::error::{RhiError, Result};
use crate::handle::{ImageView, ResourceKind, RhiHandle};
use crate::memory::{BufferDesc, Image, ImageDesc, MemoryLocation};
use crate::sampler::mip_level_count;

/// Portable description of an image view.
#[derive(Debug, Clone, Copy)]
pub struct ImageViewDesc {
    pub image: vk::Image,
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub subresource_range: vk::ImageSubresourceRange,
}

impl ImageViewDesc {
    /// View over every mip level and layer of `image`.
    pub fn whole(image: &Image, view_type: vk::ImageViewType, aspect: vk::ImageAspectFlags) -> Self {
        Self {
            image: image.raw(),
            view_type,
            format: image.format(),
            subresource_range: full_range(aspect, image.mip_levels(), image.array_layers()),
        }
    }
}

/// Subresource range covering `levels` mips and `layers` layers from zero.
pub const fn full_range(
    aspect_mask: vk::ImageAspectFlags,
    levels: u32,
    layers: u32,
) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: levels,
        base_array_layer: 0,
        layer_count: layers,
    }
}

/// Create a raw image view.
///
/// # Safety
/// The device and image must be valid.
pub(crate) unsafe fn create_raw_image_view(
    device: &ash::Device,
    desc: &ImageViewDesc,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(desc.image)
        .view_type(desc.view_type)
        .format(desc.format)
        .components(vk::ComponentMapping::default())
        .subresource_range(desc.subresource_range);

    Ok(device.create_image_view(&view_info, None)?)
}

/// Texture contents to upload into a new sampled image.
#[derive(Debug, Clone, Copy)]
pub struct TextureUpload<'a> {
    pub name: &'a str,
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    /// One tightly packed slice per layer; one layer for a 2D texture, six
    /// for a cube map.
    pub layers: &'a [&'a [u8]],
    /// Fill the full mip chain by successive linear blits.
    pub generate_mips: bool,
}

impl TextureUpload<'_> {
    fn validate(&self) -> Result<(u32, vk::DeviceSize)> {
        let kind = ResourceKind::Image.name();
        if !matches!(self.layers.len(), 1 | 6) {
            return Err(RhiError::invalid(
                kind,
                format!("{} has {} layers; expected 1 or 6", self.name, self.layers.len()),
            ));
        }
        let layer_size = self.layers[0].len();
        if layer_size == 0 || self.layers.iter().any(|layer| layer.len() != layer_size) {
            return Err(RhiError::invalid(
                kind,
                format!("{} layers must be non-empty and equally sized", self.name),
            ));
        }
        let mip_levels = if self.generate_mips {
            mip_level_count(self.width, self.height)?
        } else {
            1
        };
        Ok((mip_levels, layer_size as vk::DeviceSize))
    }

    const fn is_cube(&self) -> bool {
        self.layers.len() == 6
    }
}

/// Blits producing mip `level` from mip `level - 1`, for each level past the first.
#[allow(clippy::cast_possible_wrap)]
pub fn mip_blit_regions(width: u32, height: u32, mip_levels: u32, layers: u32) -> Vec<vk::ImageBlit> {
    let mut regions = Vec::with_capacity(mip_levels.saturating_sub(1) as usize);
    let mut src_width = width as i32;
    let mut src_height = height as i32;
    for level in 1..mip_levels {
        let dst_width = (src_width / 2).max(1);
        let dst_height = (src_height / 2).max(1);
        regions.push(
            vk::ImageBlit::default()
                .src_subresource(color_layers(level - 1, layers))
                .src_offsets([
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: src_width,
                        y: src_height,
                        z: 1,
                    },
                ])
                .dst_subresource(color_layers(level, layers))
                .dst_offsets([
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: dst_width,
                        y: dst_height,
                        z: 1,
                    },
                ]),
        );
        src_width = dst_width;
        src_height = dst_height;
    }
    regions
}

const fn color_layers(mip_level: u32, layer_count: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level,
        base_array_layer: 0,
        layer_count,
    }
}

fn layout_barrier(
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    (old_layout, src_access): (vk::ImageLayout, vk::AccessFlags),
    (new_layout, dst_access): (vk::ImageLayout, vk::AccessFlags),
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .image(image)
        .subresource_range(range)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
}

impl Device {
    pub fn create_image_view(&self, desc: &ImageViewDesc) -> Result<ImageView> {
        Ok(ImageView::from_raw(unsafe {
            create_raw_image_view(self.raw(), desc)
        }?))
    }

    pub fn destroy_image_view(&self, view: &mut ImageView) {
        unsafe { self.raw().destroy_image_view(view.take_raw(), None) };
    }

    /// Upload a 2D texture or cube map into a new shader-readable image.
    ///
    /// Blocks until the upload has finished on the graphics queue. The image
    /// is left in `SHADER_READ_ONLY_OPTIMAL`.
    pub fn create_texture_image(&self, upload: &TextureUpload<'_>) -> Result<Image> {
        let (mip_levels, layer_size) = upload.validate()?;
        let layer_count = upload.layers.len() as u32;

        if upload.generate_mips {
            let features = unsafe {
                self.instance()
                    .get_physical_device_format_properties(self.physical_device(), upload.format)
            };
            if !features
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
            {
                return Err(RhiError::invalid(
                    ResourceKind::Image.name(),
                    format!("{:?} does not support linear blits for mip generation", upload.format),
                ));
            }
        }

        let mut staging = self.create_buffer(&BufferDesc {
            size: layer_size * vk::DeviceSize::from(layer_count),
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::CpuToGpu,
            name: "texture staging",
        })?;
        for (offset, layer) in (0..).step_by(layer_size as usize).zip(upload.layers) {
            staging.write_bytes(offset, layer)?;
        }

        let mut usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST;
        if mip_levels > 1 {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        let extent = vk::Extent2D {
            width: upload.width,
            height: upload.height,
        };
        let mut desc = ImageDesc::texture_2d(upload.name, upload.format, extent, usage)
            .with_mip_levels(mip_levels);
        if upload.is_cube() {
            desc = desc.with_array_layers(6, vk::ImageCreateFlags::CUBE_COMPATIBLE);
        }
        let mut image = match self.create_image(&desc) {
            Ok(image) => image,
            Err(e) => {
                self.destroy_buffer(&mut staging)?;
                return Err(e);
            }
        };

        let raw_image = image.raw();
        let copies: Vec<vk::BufferImageCopy> = (0..layer_count)
            .map(|layer| {
                vk::BufferImageCopy::default()
                    .buffer_offset(layer_size * vk::DeviceSize::from(layer))
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: layer,
                        layer_count: 1,
                    })
                    .image_extent(vk::Extent3D {
                        width: upload.width,
                        height: upload.height,
                        depth: 1,
                    })
            })
            .collect();
        let blits = mip_blit_regions(upload.width, upload.height, mip_levels, layer_count);

        let recorded = self.execute_single_time_commands(|cmd| unsafe {
            let device = self.raw();
            let cmd = cmd.raw();
            let all = full_range(vk::ImageAspectFlags::COLOR, mip_levels, layer_count);

            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[layout_barrier(
                    raw_image,
                    all,
                    (vk::ImageLayout::UNDEFINED, vk::AccessFlags::empty()),
                    (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::AccessFlags::TRANSFER_WRITE),
                )],
            );
            device.cmd_copy_buffer_to_image(
                cmd,
                staging.raw(),
                raw_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &copies,
            );

            // Each level is read once it has been written, then handed to shaders.
            for (level, blit) in (0u32..).zip(&blits) {
                let src = vk::ImageSubresourceRange {
                    base_mip_level: level,
                    level_count: 1,
                    ..all
                };
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[layout_barrier(
                        raw_image,
                        src,
                        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::AccessFlags::TRANSFER_WRITE),
                        (vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::AccessFlags::TRANSFER_READ),
                    )],
                );
                device.cmd_blit_image(
                    cmd,
                    raw_image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    raw_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    std::slice::from_ref(blit),
                    vk::Filter::LINEAR,
                );
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[layout_barrier(
                        raw_image,
                        src,
                        (vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::AccessFlags::TRANSFER_READ),
                        (vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::AccessFlags::SHADER_READ),
                    )],
                );
            }

            let last = vk::ImageSubresourceRange {
                base_mip_level: mip_levels - 1,
                level_count: 1,
                ..all
            };
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[layout_barrier(
                    raw_image,
                    last,
                    (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::AccessFlags::TRANSFER_WRITE),
                    (vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::AccessFlags::SHADER_READ),
                )],
            );
        });

        self.destroy_buffer(&mut staging)?;
        if let Err(e) = recorded {
            self.destroy_image(&mut image)?;
            return Err(e);
        }

        tracing::debug!(
            name = upload.name,
            mip_levels,
            layers = layer_count,
            "Uploaded texture"
        );
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blit_chain_halves_until_one() {
        let regions = mip_blit_regions(8, 2, 4, 1);
        assert_eq!(regions.len(), 3);

        let ends: Vec<_> = regions
            .iter()
            .map(|r| (r.dst_offsets[1].x, r.dst_offsets[1].y))
            .collect();
        assert_eq!(ends, vec![(4, 1), (2, 1), (1, 1)]);

        assert_eq!(regions[0].src_subresource.mip_level, 0);
        assert_eq!(regions[2].dst_subresource.mip_level, 3);
        assert_eq!(regions[1].src_offsets[1].x, 4);
    }

    #[test]
    fn blits_cover_every_cube_face() {
        let regions = mip_blit_regions(64, 64, 7, 6);
        assert_eq!(regions.len(), 6);
        assert!(regions
            .iter()
            .all(|r| r.src_subresource.layer_count == 6 && r.dst_subresource.layer_count == 6));
    }

    #[test]
    fn single_level_needs_no_blits() {
        assert!(mip_blit_regions(512, 512, 1, 1).is_empty());
    }

    #[test]
    fn texture_upload_validation() {
        let texel = [0u8; 16];
        let upload = TextureUpload {
            name: "skybox",
            format: vk::Format::R8G8B8A8_UNORM,
            width: 2,
            height: 2,
            layers: &[&texel[..]; 6],
            generate_mips: true,
        };
        assert_eq!(upload.validate().unwrap(), (2, 16));
        assert!(upload.is_cube());

        let short = [0u8; 8];
        let mismatched = TextureUpload {
            layers: &[&texel, &short],
            ..upload
        };
        assert!(mismatched.validate().is_err());

        let uneven = TextureUpload {
            layers: &[&texel, &texel, &texel, &texel, &texel, &short],
            ..upload
        };
        assert!(uneven.validate().is_err());
    }
}
