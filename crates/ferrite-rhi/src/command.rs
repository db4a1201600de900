//! Command pools, command buffers and queue submission.

use std::ops::Range;

use ash::vk;

use crate::device::Device;
use crate::error::{RhiError, Result};
use crate::flatten::{FlatArena, Flattened};
use crate::handle::{
    CommandBuffer, CommandPool, Fence, Queue, ResourceKind, RhiHandle, Semaphore,
};
use crate::memory::Buffer;

/// Portable description of a command pool.
#[derive(Debug, Clone, Copy)]
pub struct CommandPoolDesc {
    pub queue_family: u32,
    pub flags: vk::CommandPoolCreateFlags,
}

/// One batch of a queue submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitDesc<'a> {
    pub wait_semaphores: &'a [&'a Semaphore],
    /// One stage mask per wait semaphore.
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub command_buffers: &'a [&'a CommandBuffer],
    pub signal_semaphores: &'a [&'a Semaphore],
}

#[derive(Debug, Clone)]
struct SubmitRuns {
    wait: Range<usize>,
    stages: Range<usize>,
    buffers: Range<usize>,
    signal: Range<usize>,
}

/// Submissions flattened into contiguous handle arrays.
#[derive(Debug)]
pub(crate) struct FlatSubmits {
    semaphores: Flattened<vk::Semaphore>,
    stages: Flattened<vk::PipelineStageFlags>,
    buffers: Flattened<vk::CommandBuffer>,
    runs: Vec<SubmitRuns>,
}

impl FlatSubmits {
    pub(crate) fn new(submits: &[SubmitDesc<'_>]) -> Result<Self> {
        let kind = "queue submit";
        let mut semaphore_total = 0;
        let mut stage_total = 0;
        let mut buffer_total = 0;
        for (i, submit) in submits.iter().enumerate() {
            if submit.wait_semaphores.len() != submit.wait_stages.len() {
                return Err(RhiError::invalid(
                    kind,
                    format!(
                        "submit {i} waits on {} semaphores with {} stage masks",
                        submit.wait_semaphores.len(),
                        submit.wait_stages.len()
                    ),
                ));
            }
            semaphore_total += submit.wait_semaphores.len() + submit.signal_semaphores.len();
            stage_total += submit.wait_stages.len();
            buffer_total += submit.command_buffers.len();
        }

        let mut semaphores = FlatArena::with_declared_total(kind, semaphore_total);
        let mut stages = FlatArena::with_declared_total(kind, stage_total);
        let mut buffers = FlatArena::with_declared_total(kind, buffer_total);
        let mut runs = Vec::with_capacity(submits.len());
        for submit in submits {
            runs.push(SubmitRuns {
                wait: semaphores.push_run(submit.wait_semaphores.iter().map(|s| s.raw()))?,
                stages: stages.push_run(submit.wait_stages.iter().copied())?,
                buffers: buffers.push_run(submit.command_buffers.iter().map(|c| c.raw()))?,
                signal: semaphores.push_run(submit.signal_semaphores.iter().map(|s| s.raw()))?,
            });
        }

        Ok(Self {
            semaphores: semaphores.finish()?,
            stages: stages.finish()?,
            buffers: buffers.finish()?,
            runs,
        })
    }

    pub(crate) fn infos(&self) -> Vec<vk::SubmitInfo<'_>> {
        self.runs
            .iter()
            .map(|run| {
                vk::SubmitInfo::default()
                    .wait_semaphores(self.semaphores.slice(run.wait.clone()))
                    .wait_dst_stage_mask(self.stages.slice(run.stages.clone()))
                    .command_buffers(self.buffers.slice(run.buffers.clone()))
                    .signal_semaphores(self.semaphores.slice(run.signal.clone()))
            })
            .collect()
    }
}

impl Device {
    pub fn create_command_pool(&self, desc: &CommandPoolDesc) -> Result<CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(desc.queue_family)
            .flags(desc.flags);
        let pool = unsafe { self.raw().create_command_pool(&create_info, None)? };
        Ok(CommandPool::from_raw(pool))
    }

    /// Recycle every command buffer allocated from `pool`.
    ///
    /// None of them may still be pending on the GPU.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn reset_command_pool(&self, pool: &CommandPool) -> Result<()> {
        unsafe {
            self.raw()
                .reset_command_pool(pool.raw(), vk::CommandPoolResetFlags::empty())?;
        }
        Ok(())
    }

    pub fn destroy_command_pool(&self, pool: &mut CommandPool) {
        unsafe { self.raw().destroy_command_pool(pool.take_raw(), None) };
    }

    pub fn allocate_command_buffers(
        &self,
        pool: &CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool.raw())
            .level(level)
            .command_buffer_count(count);

        let buffers = unsafe { self.raw().allocate_command_buffers(&alloc_info)? };
        Ok(buffers.into_iter().map(CommandBuffer::from_raw).collect())
    }

    /// Return command buffers to their pool. The wrappers are left null.
    pub fn free_command_buffers(&self, pool: &CommandPool, buffers: &mut [CommandBuffer]) {
        let raw: Vec<_> = buffers.iter_mut().map(CommandBuffer::take_raw).collect();
        if !raw.is_empty() {
            unsafe { self.raw().free_command_buffers(pool.raw(), &raw) };
        }
    }

    pub fn begin_command_buffer(
        &self,
        cmd: &CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.raw().begin_command_buffer(cmd.raw(), &begin_info)? };
        Ok(())
    }

    pub fn end_command_buffer(&self, cmd: &CommandBuffer) -> Result<()> {
        unsafe { self.raw().end_command_buffer(cmd.raw())? };
        Ok(())
    }

    /// Submit one or more batches to `queue`, signaling `fence` once all complete.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn queue_submit(
        &self,
        queue: &Queue,
        submits: &[SubmitDesc<'_>],
        fence: Option<&Fence>,
    ) -> Result<()> {
        let flat = FlatSubmits::new(submits)?;
        let infos = flat.infos();
        let fence = fence.map_or(vk::Fence::null(), |f| f.raw());
        unsafe { self.raw().queue_submit(queue.raw(), &infos, fence)? };
        Ok(())
    }

    pub fn queue_wait_idle(&self, queue: &Queue) -> Result<()> {
        unsafe { self.raw().queue_wait_idle(queue.raw())? };
        Ok(())
    }

    /// Allocate a primary buffer from the shared upload pool and begin it for
    /// a one-time submit.
    pub fn begin_single_time_commands(&self) -> Result<CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.upload_pool())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let mut cmd = unsafe { self.raw().allocate_command_buffers(&alloc_info)? }
            .pop()
            .map(CommandBuffer::from_raw)
            .ok_or_else(|| RhiError::InvalidState("No command buffer allocated".to_string()))?;

        if let Err(e) = self.begin_command_buffer(&cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT) {
            unsafe {
                self.raw()
                    .free_command_buffers(self.upload_pool(), &[cmd.take_raw()]);
            }
            return Err(e);
        }

        Ok(cmd)
    }

    /// End, submit and wait for a buffer from [`Device::begin_single_time_commands`].
    ///
    /// Blocks on the graphics queue going idle; setup-time transfers only.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn end_single_time_commands(&self, mut cmd: CommandBuffer) -> Result<()> {
        let submit = SubmitDesc {
            command_buffers: &[&cmd],
            ..Default::default()
        };
        let result = self
            .end_command_buffer(&cmd)
            .and_then(|()| self.queue_submit(self.graphics_queue(), &[submit], None))
            .and_then(|()| self.queue_wait_idle(self.graphics_queue()));

        unsafe {
            self.raw()
                .free_command_buffers(self.upload_pool(), &[cmd.take_raw()]);
        }
        result
    }

    /// Record `f` into a single-use command buffer and wait for it to finish.
    pub fn execute_single_time_commands<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&CommandBuffer),
    {
        let cmd = self.begin_single_time_commands()?;
        f(&cmd);
        self.end_single_time_commands(cmd)
    }

    /// Copy `size` bytes between buffers and wait for completion.
    pub fn copy_buffer(
        &self,
        src: &Buffer,
        dst: &Buffer,
        src_offset: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<()> {
        let overruns = |offset: vk::DeviceSize, buffer: &Buffer| {
            offset.saturating_add(size) > buffer.size()
        };
        if overruns(src_offset, src) || overruns(dst_offset, dst) {
            return Err(RhiError::invalid(
                ResourceKind::Buffer.name(),
                format!(
                    "copy of {size} bytes ({src_offset} -> {dst_offset}) \
                     overruns buffers of {} and {} bytes",
                    src.size(),
                    dst.size()
                ),
            ));
        }
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        self.execute_single_time_commands(|cmd| unsafe {
            self.raw()
                .cmd_copy_buffer(cmd.raw(), src.raw(), dst.raw(), &[region]);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn sem(raw: u64) -> Semaphore {
        Semaphore::from_raw(vk::Semaphore::from_raw(raw))
    }

    fn cmd(raw: u64) -> CommandBuffer {
        CommandBuffer::from_raw(vk::CommandBuffer::from_raw(raw))
    }

    #[test]
    fn submits_flatten_into_shared_arrays() {
        let (a, b, c) = (sem(1), sem(2), sem(3));
        let (x, y) = (cmd(10), cmd(11));

        let submits = [
            SubmitDesc {
                wait_semaphores: &[&a],
                wait_stages: &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
                command_buffers: &[&x],
                signal_semaphores: &[&b, &c],
            },
            SubmitDesc {
                command_buffers: &[&y],
                ..Default::default()
            },
        ];

        let flat = FlatSubmits::new(&submits).unwrap();
        assert_eq!(flat.semaphores.len(), 3);
        assert_eq!(flat.buffers.len(), 2);

        let infos = flat.infos();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].wait_semaphore_count, 1);
        assert_eq!(infos[0].signal_semaphore_count, 2);
        assert_eq!(infos[0].command_buffer_count, 1);
        assert_eq!(infos[1].wait_semaphore_count, 0);
        assert_eq!(infos[1].command_buffer_count, 1);
        assert_eq!(
            flat.semaphores.as_slice(),
            &[
                vk::Semaphore::from_raw(1),
                vk::Semaphore::from_raw(2),
                vk::Semaphore::from_raw(3)
            ]
        );
    }

    #[test]
    fn mismatched_wait_stages_are_rejected() {
        let a = sem(1);
        let submits = [SubmitDesc {
            wait_semaphores: &[&a],
            ..Default::default()
        }];
        assert!(matches!(
            FlatSubmits::new(&submits),
            Err(RhiError::InvalidDescriptor { .. })
        ));
    }
}
