//! Opaque typed handles over native Vulkan objects.
//!
//! Every wrapper owns exactly one native handle. Wrappers are neither `Clone`
//! nor reference counted; the creator destroys them explicitly through the
//! matching `destroy_*` call, which leaves a null handle behind.

use ash::vk;
use ash::vk::Handle;

use crate::error::Result;

/// Tag identifying which kind of native object a handle wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Image,
    ImageView,
    Sampler,
    ShaderModule,
    RenderPass,
    Framebuffer,
    PipelineLayout,
    Pipeline,
    DescriptorSetLayout,
    DescriptorPool,
    DescriptorSet,
    Fence,
    Semaphore,
    CommandPool,
    CommandBuffer,
    Queue,
}

impl ResourceKind {
    /// Human-readable name used in logs and descriptor errors.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Buffer => "buffer",
            Self::Image => "image",
            Self::ImageView => "image view",
            Self::Sampler => "sampler",
            Self::ShaderModule => "shader module",
            Self::RenderPass => "render pass",
            Self::Framebuffer => "framebuffer",
            Self::PipelineLayout => "pipeline layout",
            Self::Pipeline => "pipeline",
            Self::DescriptorSetLayout => "descriptor set layout",
            Self::DescriptorPool => "descriptor pool",
            Self::DescriptorSet => "descriptor set",
            Self::Fence => "fence",
            Self::Semaphore => "semaphore",
            Self::CommandPool => "command pool",
            Self::CommandBuffer => "command buffer",
            Self::Queue => "queue",
        }
    }
}

/// Common view over every typed handle.
pub trait RhiHandle {
    /// The wrapped native handle type.
    type Raw: Handle + Copy;

    /// Kind tag of this handle type.
    const KIND: ResourceKind;

    /// The wrapped native handle.
    fn raw(&self) -> Self::Raw;

    /// Whether the wrapper no longer refers to a native object.
    fn is_null(&self) -> bool {
        self.raw().as_raw() == 0
    }

    /// Kind tag of this handle.
    fn kind(&self) -> ResourceKind {
        Self::KIND
    }
}

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $raw:ty, $kind:ident) => {
        $(#[$meta])*
        #[derive(Debug, PartialEq, Eq, Hash)]
        pub struct $name {
            raw: $raw,
        }

        impl $name {
            /// Wrap a native handle. The wrapper takes over its lifetime.
            pub const fn from_raw(raw: $raw) -> Self {
                Self { raw }
            }

            /// Hand out the native handle, leaving null in the wrapper.
            pub(crate) fn take_raw(&mut self) -> $raw {
                std::mem::replace(&mut self.raw, <$raw>::null())
            }
        }

        impl RhiHandle for $name {
            type Raw = $raw;
            const KIND: ResourceKind = ResourceKind::$kind;

            fn raw(&self) -> $raw {
                self.raw
            }
        }
    };
}

define_handle!(
    /// View onto an image subresource range.
    ImageView, vk::ImageView, ImageView
);
define_handle!(Sampler, vk::Sampler, Sampler);
define_handle!(ShaderModule, vk::ShaderModule, ShaderModule);
define_handle!(RenderPass, vk::RenderPass, RenderPass);
define_handle!(Framebuffer, vk::Framebuffer, Framebuffer);
define_handle!(PipelineLayout, vk::PipelineLayout, PipelineLayout);
define_handle!(
    /// Graphics or compute pipeline.
    Pipeline, vk::Pipeline, Pipeline
);
define_handle!(DescriptorSetLayout, vk::DescriptorSetLayout, DescriptorSetLayout);
define_handle!(DescriptorPool, vk::DescriptorPool, DescriptorPool);
define_handle!(
    /// Descriptor set allocated from a [`DescriptorPool`]. Freed with its pool.
    DescriptorSet, vk::DescriptorSet, DescriptorSet
);
define_handle!(Fence, vk::Fence, Fence);
define_handle!(Semaphore, vk::Semaphore, Semaphore);
define_handle!(CommandPool, vk::CommandPool, CommandPool);
define_handle!(CommandBuffer, vk::CommandBuffer, CommandBuffer);
define_handle!(
    /// Device queue. Owned by the device and never destroyed on its own.
    Queue, vk::Queue, Queue
);

/// Collect the raw handles of a slice of wrappers.
pub(crate) fn raw_handles<H: RhiHandle>(handles: &[&H]) -> Vec<H::Raw> {
    handles.iter().map(|h| h.raw()).collect()
}

/// Create `count` objects in order. If one fails, the objects already created
/// are handed to `destroy` newest first before the error is returned.
pub(crate) fn create_all<T>(
    count: usize,
    mut create: impl FnMut(usize) -> Result<T>,
    mut destroy: impl FnMut(T),
) -> Result<Vec<T>> {
    let mut created = Vec::with_capacity(count);
    for index in 0..count {
        match create(index) {
            Ok(object) => created.push(object),
            Err(e) => {
                while let Some(object) = created.pop() {
                    destroy(object);
                }
                return Err(e);
            }
        }
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::error::RhiError;

    #[test]
    fn take_raw_leaves_null_behind() {
        let mut fence = Fence::from_raw(vk::Fence::from_raw(0x42));
        assert!(!fence.is_null());

        let raw = fence.take_raw();
        assert_eq!(raw.as_raw(), 0x42);
        assert!(fence.is_null());
        assert_eq!(fence.raw(), vk::Fence::null());
    }

    #[test]
    fn handles_carry_their_kind() {
        let sampler = Sampler::from_raw(vk::Sampler::from_raw(7));
        assert_eq!(sampler.kind(), ResourceKind::Sampler);
        assert_eq!(RenderPass::KIND.name(), "render pass");
        assert_eq!(Queue::KIND, ResourceKind::Queue);
    }

    #[test]
    fn failed_creation_unwinds_newest_first() {
        let destroyed = RefCell::new(Vec::new());
        let result = create_all(
            4,
            |i| {
                if i == 2 {
                    Err(RhiError::SwapchainCreation("view 2".to_string()))
                } else {
                    Ok(ImageView::from_raw(vk::ImageView::from_raw(i as u64 + 1)))
                }
            },
            |mut view| destroyed.borrow_mut().push(view.take_raw().as_raw()),
        );
        assert!(matches!(result, Err(RhiError::SwapchainCreation(_))));
        assert_eq!(destroyed.into_inner(), vec![2, 1]);
    }

    #[test]
    fn successful_creation_destroys_nothing() {
        let mut destroyed = 0;
        let views = create_all(
            3,
            |i| Ok(ImageView::from_raw(vk::ImageView::from_raw(i as u64 + 1))),
            |_| destroyed += 1,
        )
        .unwrap();
        assert_eq!(views.len(), 3);
        assert_eq!(destroyed, 0);
    }

    #[test]
    fn raw_handles_preserves_order() {
        let a = Semaphore::from_raw(vk::Semaphore::from_raw(1));
        let b = Semaphore::from_raw(vk::Semaphore::from_raw(2));
        let raws = raw_handles(&[&b, &a]);
        assert_eq!(raws, vec![vk::Semaphore::from_raw(2), vk::Semaphore::from_raw(1)]);
    }
}
