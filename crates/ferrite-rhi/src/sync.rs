//! Fences and binary semaphores.

use ash::vk;

use crate::device::Device;
use crate::error::Result;
use crate::handle::{raw_handles, Fence, RhiHandle, Semaphore};

impl Device {
    /// Create a caller-owned fence, optionally already signaled.
    pub fn create_fence(&self, signaled: bool) -> Result<Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { self.raw().create_fence(&create_info, None)? };
        Ok(Fence::from_raw(fence))
    }

    pub fn destroy_fence(&self, fence: &mut Fence) {
        unsafe { self.raw().destroy_fence(fence.take_raw(), None) };
    }

    /// Create a caller-owned binary semaphore.
    pub fn create_semaphore(&self) -> Result<Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { self.raw().create_semaphore(&create_info, None)? };
        Ok(Semaphore::from_raw(semaphore))
    }

    pub fn destroy_semaphore(&self, semaphore: &mut Semaphore) {
        unsafe { self.raw().destroy_semaphore(semaphore.take_raw(), None) };
    }

    /// Block until one or all of `fences` are signaled, or `timeout_ns` expires.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_for_fences(
        &self,
        fences: &[&Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<()> {
        let raw = raw_handles(fences);
        unsafe { self.raw().wait_for_fences(&raw, wait_all, timeout_ns)? };
        Ok(())
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn reset_fences(&self, fences: &[&Fence]) -> Result<()> {
        let raw = raw_handles(fences);
        unsafe { self.raw().reset_fences(&raw)? };
        Ok(())
    }

    /// Whether `fence` is currently signaled.
    pub fn fence_signaled(&self, fence: &Fence) -> Result<bool> {
        Ok(unsafe { self.raw().get_fence_status(fence.raw())? })
    }
}
