//! Vulkan render hardware interface for the Ferrite engine.
//!
//! This crate provides:
//! - Device bootstrap: instance, adapter selection, queues, allocator
//! - Descriptor-driven creation of buffers, images, pipelines and friends
//! - Swapchain negotiation and the rebuild-on-resize protocol
//! - Frames in flight with per-slot fences, semaphores and command pools
//! - A thin command recording context with debug labels

pub mod adapter;
pub mod command;
pub mod config;
pub mod debug;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod flatten;
pub mod frame;
pub mod handle;
pub mod image;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod recording;
pub mod render_pass;
pub mod rhi;
pub mod sampler;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use adapter::{AdapterInfo, GpuVendor, QueueFamilies};
pub use command::{CommandPoolDesc, SubmitDesc};
pub use config::{DescriptorBudget, LoaderEnvironment, RhiConfig};
pub use descriptors::{
    buffer_info, image_info, DescriptorInfos, DescriptorPoolDesc, DescriptorSetLayoutDesc,
    DescriptorWrite,
};
pub use device::Device;
pub use error::{Result, RhiError};
pub use frame::{FrameBackend, FrameController, SlotState, MAX_FRAMES_IN_FLIGHT};
pub use handle::*;
pub use image::{ImageViewDesc, TextureUpload};
pub use memory::{Buffer, BufferDesc, Image, ImageDesc};
pub use pipeline::{
    ComputePipelineDesc, GraphicsPipelineDesc, PipelineLayoutDesc, ShaderStageDesc,
    SpecializationDesc,
};
pub use recording::{
    BarrierDesc, BufferBarrier, CommandContext, DebugLabelScope, DescriptorBinding, ImageBarrier,
    RenderPassBegin,
};
pub use render_pass::{FramebufferDesc, RenderPassDesc, SubpassDesc};
pub use rhi::Rhi;
pub use sampler::{DefaultSampler, SamplerDesc};
pub use swapchain::{SwapchainManager, SwapchainState, WindowHost};

pub use ash::vk;
