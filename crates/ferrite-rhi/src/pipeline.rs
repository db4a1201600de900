//! Pipeline layouts and graphics/compute pipeline creation.

use std::ffi::CString;
use std::ops::Range;

use ash::vk;

use crate::device::Device;
use crate::error::{RhiError, Result};
use crate::flatten::{FlatArena, Flattened};
use crate::handle::{
    raw_handles, DescriptorSetLayout, Pipeline, PipelineLayout, RenderPass, ResourceKind,
    RhiHandle, ShaderModule,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineLayoutDesc<'a> {
    pub set_layouts: &'a [&'a DescriptorSetLayout],
    pub push_constant_ranges: &'a [vk::PushConstantRange],
}

/// Specialization constants for one shader stage.
#[derive(Debug, Clone, Copy)]
pub struct SpecializationDesc<'a> {
    pub map_entries: &'a [vk::SpecializationMapEntry],
    pub data: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct ShaderStageDesc<'a> {
    pub stage: vk::ShaderStageFlags,
    pub module: &'a ShaderModule,
    pub entry_point: &'a str,
    pub specialization: Option<SpecializationDesc<'a>>,
}

impl<'a> ShaderStageDesc<'a> {
    /// Stage with a `main` entry point and no specialization.
    pub const fn new(stage: vk::ShaderStageFlags, module: &'a ShaderModule) -> Self {
        Self {
            stage,
            module,
            entry_point: "main",
            specialization: None,
        }
    }
}

/// Graphics pipeline configuration.
///
/// Viewport and scissor are always dynamic; pass extra states in
/// `dynamic_states`.
#[derive(Debug, Clone, Copy)]
pub struct GraphicsPipelineDesc<'a> {
    pub stages: &'a [ShaderStageDesc<'a>],
    pub vertex_bindings: &'a [vk::VertexInputBindingDescription],
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub samples: vk::SampleCountFlags,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare_op: vk::CompareOp,
    pub color_blend_attachments: &'a [vk::PipelineColorBlendAttachmentState],
    pub dynamic_states: &'a [vk::DynamicState],
    pub layout: &'a PipelineLayout,
    pub render_pass: &'a RenderPass,
    pub subpass: u32,
}

impl<'a> GraphicsPipelineDesc<'a> {
    /// Triangle list, back-face culled, depth tested, no color attachments.
    pub const fn new(
        stages: &'a [ShaderStageDesc<'a>],
        layout: &'a PipelineLayout,
        render_pass: &'a RenderPass,
        subpass: u32,
    ) -> Self {
        Self {
            stages,
            vertex_bindings: &[],
            vertex_attributes: &[],
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            samples: vk::SampleCountFlags::TYPE_1,
            depth_test: true,
            depth_write: true,
            depth_compare_op: vk::CompareOp::LESS,
            color_blend_attachments: &[],
            dynamic_states: &[],
            layout,
            render_pass,
            subpass,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ComputePipelineDesc<'a> {
    pub stage: ShaderStageDesc<'a>,
    pub layout: &'a PipelineLayout,
}

/// Opaque blending with all channels written.
pub fn opaque_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(false)
        .color_write_mask(vk::ColorComponentFlags::RGBA)
}

#[derive(Debug, Clone)]
struct SpecializationRuns {
    entries: Range<usize>,
    data: Range<usize>,
}

#[derive(Debug)]
struct FlatStage {
    stage: vk::ShaderStageFlags,
    module: vk::ShaderModule,
    specialization: Option<SpecializationRuns>,
}

/// Shader stages of a pipeline batch, with every stage's specialization
/// entries and data copied into shared arrays.
#[derive(Debug)]
pub(crate) struct FlatStages {
    stages: Vec<FlatStage>,
    names: Vec<CString>,
    entries: Flattened<vk::SpecializationMapEntry>,
    data: Flattened<u8>,
    /// Stage range of each pipeline in the batch.
    runs: Vec<Range<usize>>,
}

impl FlatStages {
    pub(crate) fn new(pipelines: &[&[ShaderStageDesc<'_>]]) -> Result<Self> {
        let kind = ResourceKind::Pipeline.name();
        let mut entry_total = 0;
        let mut data_total = 0;
        let mut names = Vec::new();
        for (p, stages) in pipelines.iter().enumerate() {
            if stages.is_empty() {
                return Err(RhiError::invalid(kind, format!("pipeline {p} has no shader stages")));
            }
            for stage in *stages {
                let name = CString::new(stage.entry_point).map_err(|_| {
                    RhiError::invalid(
                        kind,
                        format!("entry point {:?} contains a NUL byte", stage.entry_point),
                    )
                })?;
                names.push(name);

                if let Some(spec) = &stage.specialization {
                    if let Some(entry) = spec.map_entries.iter().find(|e| {
                        (e.offset as usize)
                            .checked_add(e.size)
                            .map_or(true, |end| end > spec.data.len())
                    }) {
                        return Err(RhiError::invalid(
                            kind,
                            format!(
                                "specialization constant {} ({} bytes at {}) exceeds {} bytes of data",
                                entry.constant_id,
                                entry.size,
                                entry.offset,
                                spec.data.len()
                            ),
                        ));
                    }
                    entry_total += spec.map_entries.len();
                    data_total += spec.data.len();
                }
            }
        }

        let mut entries = FlatArena::with_declared_total(kind, entry_total);
        let mut data = FlatArena::with_declared_total(kind, data_total);
        let mut stages = Vec::with_capacity(names.len());
        let mut runs = Vec::with_capacity(pipelines.len());
        for pipeline in pipelines {
            let start = stages.len();
            for stage in *pipeline {
                let specialization = match &stage.specialization {
                    Some(spec) => Some(SpecializationRuns {
                        entries: entries.push_run(spec.map_entries.iter().copied())?,
                        data: data.push_run(spec.data.iter().copied())?,
                    }),
                    None => None,
                };
                stages.push(FlatStage {
                    stage: stage.stage,
                    module: stage.module.raw(),
                    specialization,
                });
            }
            runs.push(start..stages.len());
        }

        Ok(Self {
            stages,
            names,
            entries: entries.finish()?,
            data: data.finish()?,
            runs,
        })
    }

    pub(crate) fn specialization_infos(&self) -> Vec<Option<vk::SpecializationInfo<'_>>> {
        self.stages
            .iter()
            .map(|stage| {
                stage.specialization.as_ref().map(|runs| {
                    vk::SpecializationInfo::default()
                        .map_entries(self.entries.slice(runs.entries.clone()))
                        .data(self.data.slice(runs.data.clone()))
                })
            })
            .collect()
    }

    pub(crate) fn stage_infos<'s>(
        &'s self,
        specializations: &'s [Option<vk::SpecializationInfo<'s>>],
    ) -> Vec<vk::PipelineShaderStageCreateInfo<'s>> {
        self.stages
            .iter()
            .zip(&self.names)
            .zip(specializations)
            .map(|((stage, name), spec)| {
                let info = vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.stage)
                    .module(stage.module)
                    .name(name);
                match spec {
                    Some(spec) => info.specialization_info(spec),
                    None => info,
                }
            })
            .collect()
    }
}

/// Fixed-function state of one graphics pipeline.
struct GraphicsStates<'a> {
    vertex_input: vk::PipelineVertexInputStateCreateInfo<'a>,
    input_assembly: vk::PipelineInputAssemblyStateCreateInfo<'a>,
    viewport: vk::PipelineViewportStateCreateInfo<'a>,
    rasterization: vk::PipelineRasterizationStateCreateInfo<'a>,
    multisample: vk::PipelineMultisampleStateCreateInfo<'a>,
    depth_stencil: vk::PipelineDepthStencilStateCreateInfo<'a>,
    color_blend: vk::PipelineColorBlendStateCreateInfo<'a>,
    dynamic: vk::PipelineDynamicStateCreateInfo<'a>,
}

impl<'a> GraphicsStates<'a> {
    fn new(desc: &GraphicsPipelineDesc<'a>, dynamic_states: &'a [vk::DynamicState]) -> Self {
        Self {
            vertex_input: vk::PipelineVertexInputStateCreateInfo::default()
                .vertex_binding_descriptions(desc.vertex_bindings)
                .vertex_attribute_descriptions(desc.vertex_attributes),
            input_assembly: vk::PipelineInputAssemblyStateCreateInfo::default()
                .topology(desc.topology)
                .primitive_restart_enable(false),
            viewport: vk::PipelineViewportStateCreateInfo::default()
                .viewport_count(1)
                .scissor_count(1),
            rasterization: vk::PipelineRasterizationStateCreateInfo::default()
                .depth_clamp_enable(false)
                .rasterizer_discard_enable(false)
                .polygon_mode(desc.polygon_mode)
                .cull_mode(desc.cull_mode)
                .front_face(desc.front_face)
                .depth_bias_enable(false)
                .line_width(1.0),
            multisample: vk::PipelineMultisampleStateCreateInfo::default()
                .rasterization_samples(desc.samples)
                .sample_shading_enable(false),
            depth_stencil: vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(desc.depth_test)
                .depth_write_enable(desc.depth_write)
                .depth_compare_op(desc.depth_compare_op)
                .depth_bounds_test_enable(false)
                .stencil_test_enable(false),
            color_blend: vk::PipelineColorBlendStateCreateInfo::default()
                .logic_op_enable(false)
                .attachments(desc.color_blend_attachments),
            dynamic: vk::PipelineDynamicStateCreateInfo::default().dynamic_states(dynamic_states),
        }
    }
}

fn with_viewport_scissor(extra: &[vk::DynamicState]) -> Vec<vk::DynamicState> {
    let mut states = vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    for &state in extra {
        if !states.contains(&state) {
            states.push(state);
        }
    }
    states
}

impl Device {
    pub fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc<'_>) -> Result<PipelineLayout> {
        let set_layouts = raw_handles(desc.set_layouts);
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(desc.push_constant_ranges);

        let layout = unsafe { self.raw().create_pipeline_layout(&layout_info, None)? };
        Ok(PipelineLayout::from_raw(layout))
    }

    pub fn destroy_pipeline_layout(&self, layout: &mut PipelineLayout) {
        unsafe { self.raw().destroy_pipeline_layout(layout.take_raw(), None) };
    }

    /// Create a batch of graphics pipelines against render-pass subpasses.
    pub fn create_graphics_pipelines(
        &self,
        descs: &[GraphicsPipelineDesc<'_>],
    ) -> Result<Vec<Pipeline>> {
        let stage_lists: Vec<&[ShaderStageDesc<'_>]> = descs.iter().map(|d| d.stages).collect();
        let flat = FlatStages::new(&stage_lists)?;
        let specializations = flat.specialization_infos();
        let stage_infos = flat.stage_infos(&specializations);

        let dynamic_states: Vec<Vec<vk::DynamicState>> = descs
            .iter()
            .map(|d| with_viewport_scissor(d.dynamic_states))
            .collect();
        let states: Vec<GraphicsStates<'_>> = descs
            .iter()
            .zip(&dynamic_states)
            .map(|(desc, dynamic)| GraphicsStates::new(desc, dynamic))
            .collect();

        let infos: Vec<vk::GraphicsPipelineCreateInfo<'_>> = descs
            .iter()
            .zip(&states)
            .zip(&flat.runs)
            .map(|((desc, state), run)| {
                vk::GraphicsPipelineCreateInfo::default()
                    .stages(&stage_infos[run.clone()])
                    .vertex_input_state(&state.vertex_input)
                    .input_assembly_state(&state.input_assembly)
                    .viewport_state(&state.viewport)
                    .rasterization_state(&state.rasterization)
                    .multisample_state(&state.multisample)
                    .depth_stencil_state(&state.depth_stencil)
                    .color_blend_state(&state.color_blend)
                    .dynamic_state(&state.dynamic)
                    .layout(desc.layout.raw())
                    .render_pass(desc.render_pass.raw())
                    .subpass(desc.subpass)
            })
            .collect();

        let pipelines = unsafe {
            self.raw()
                .create_graphics_pipelines(vk::PipelineCache::null(), &infos, None)
        }
        .map_err(|(partial, e)| {
            self.destroy_partial_pipelines(&partial);
            RhiError::from(e)
        })?;

        tracing::debug!(count = pipelines.len(), "Created graphics pipelines");
        Ok(pipelines.into_iter().map(Pipeline::from_raw).collect())
    }

    /// Create a batch of compute pipelines.
    pub fn create_compute_pipelines(
        &self,
        descs: &[ComputePipelineDesc<'_>],
    ) -> Result<Vec<Pipeline>> {
        if let Some(desc) = descs
            .iter()
            .find(|d| d.stage.stage != vk::ShaderStageFlags::COMPUTE)
        {
            return Err(RhiError::invalid(
                ResourceKind::Pipeline.name(),
                format!("compute pipeline given a {:?} stage", desc.stage.stage),
            ));
        }

        let stage_lists: Vec<&[ShaderStageDesc<'_>]> =
            descs.iter().map(|d| std::slice::from_ref(&d.stage)).collect();
        let flat = FlatStages::new(&stage_lists)?;
        let specializations = flat.specialization_infos();
        let stage_infos = flat.stage_infos(&specializations);

        let infos: Vec<vk::ComputePipelineCreateInfo<'_>> = descs
            .iter()
            .zip(&stage_infos)
            .map(|(desc, stage)| {
                vk::ComputePipelineCreateInfo::default()
                    .stage(*stage)
                    .layout(desc.layout.raw())
            })
            .collect();

        let pipelines = unsafe {
            self.raw()
                .create_compute_pipelines(vk::PipelineCache::null(), &infos, None)
        }
        .map_err(|(partial, e)| {
            self.destroy_partial_pipelines(&partial);
            RhiError::from(e)
        })?;

        tracing::debug!(count = pipelines.len(), "Created compute pipelines");
        Ok(pipelines.into_iter().map(Pipeline::from_raw).collect())
    }

    fn destroy_partial_pipelines(&self, partial: &[vk::Pipeline]) {
        for &pipeline in partial.iter().filter(|p| **p != vk::Pipeline::null()) {
            unsafe { self.raw().destroy_pipeline(pipeline, None) };
        }
    }

    pub fn destroy_pipeline(&self, pipeline: &mut Pipeline) {
        unsafe { self.raw().destroy_pipeline(pipeline.take_raw(), None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn module(raw: u64) -> ShaderModule {
        ShaderModule::from_raw(vk::ShaderModule::from_raw(raw))
    }

    fn entry(constant_id: u32, offset: u32, size: usize) -> vk::SpecializationMapEntry {
        vk::SpecializationMapEntry {
            constant_id,
            offset,
            size,
        }
    }

    #[test]
    fn specialization_runs_share_arrays_across_pipelines() {
        let (vert, frag, comp) = (module(1), module(2), module(3));
        let frag_entries = [entry(0, 0, 4), entry(1, 4, 4)];
        let frag_data = [0u8; 8];
        let comp_entries = [entry(0, 0, 4)];
        let comp_data = 64u32.to_le_bytes();

        let raster = [
            ShaderStageDesc::new(vk::ShaderStageFlags::VERTEX, &vert),
            ShaderStageDesc {
                specialization: Some(SpecializationDesc {
                    map_entries: &frag_entries,
                    data: &frag_data,
                }),
                ..ShaderStageDesc::new(vk::ShaderStageFlags::FRAGMENT, &frag)
            },
        ];
        let compute = [ShaderStageDesc {
            entry_point: "cull",
            specialization: Some(SpecializationDesc {
                map_entries: &comp_entries,
                data: &comp_data,
            }),
            ..ShaderStageDesc::new(vk::ShaderStageFlags::COMPUTE, &comp)
        }];

        let flat = FlatStages::new(&[&raster[..], &compute[..]]).unwrap();
        assert_eq!(flat.runs, vec![0..2, 2..3]);
        assert_eq!(flat.entries.len(), 3);
        assert_eq!(flat.data.len(), 12);

        let specs = flat.specialization_infos();
        assert!(specs[0].is_none());
        assert_eq!(specs[1].unwrap().map_entry_count, 2);
        assert_eq!(specs[2].unwrap().data_size, 4);

        let infos = flat.stage_infos(&specs);
        assert_eq!(infos.len(), 3);
        assert!(infos[0].p_specialization_info.is_null());
        assert_eq!(infos[2].stage, vk::ShaderStageFlags::COMPUTE);
        assert_eq!(unsafe { std::ffi::CStr::from_ptr(infos[2].p_name) }, c"cull");
    }

    #[test]
    fn map_entries_must_fit_the_data() {
        let vert = module(1);
        let entries = [entry(0, 4, 4)];
        let data = [0u8; 4];
        let stages = [ShaderStageDesc {
            specialization: Some(SpecializationDesc {
                map_entries: &entries,
                data: &data,
            }),
            ..ShaderStageDesc::new(vk::ShaderStageFlags::VERTEX, &vert)
        }];
        assert!(matches!(
            FlatStages::new(&[&stages[..]]),
            Err(RhiError::InvalidDescriptor { kind: "pipeline", .. })
        ));
    }

    #[test]
    fn entry_points_reject_interior_nul() {
        let vert = module(1);
        let stages = [ShaderStageDesc {
            entry_point: "ma\0in",
            ..ShaderStageDesc::new(vk::ShaderStageFlags::VERTEX, &vert)
        }];
        assert!(FlatStages::new(&[&stages[..]]).is_err());
    }

    #[test]
    fn pipelines_need_a_stage() {
        let empty: &[ShaderStageDesc<'_>] = &[];
        assert!(FlatStages::new(&[empty]).is_err());
    }

    #[test]
    fn viewport_and_scissor_are_always_dynamic() {
        let states = with_viewport_scissor(&[vk::DynamicState::SCISSOR, vk::DynamicState::LINE_WIDTH]);
        assert_eq!(
            states,
            vec![
                vk::DynamicState::VIEWPORT,
                vk::DynamicState::SCISSOR,
                vk::DynamicState::LINE_WIDTH
            ]
        );
    }
}
