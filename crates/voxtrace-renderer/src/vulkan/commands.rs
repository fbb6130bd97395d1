//! Command pools, command buffers and queue submission.

use ash::vk;

use super::{resource_err, submit_err, VulkanContext};
use crate::device::FrameSubmit;
use crate::error::RtResult;

/// Command buffer manager.
///
/// Frame command buffers come from a resettable pool; one-shot command
/// buffers come from a transient pool and are freed after submission.
pub struct CommandManager {
    frame_pool: vk::CommandPool,
    transient_pool: vk::CommandPool,
    queue: vk::Queue,
    device: ash::Device,
}

impl CommandManager {
    pub unsafe fn new(ctx: &VulkanContext) -> RtResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(ctx.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let frame_pool = ctx
            .device
            .create_command_pool(&pool_info, None)
            .map_err(resource_err("command pool"))?;

        let transient_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(ctx.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let transient_pool = match ctx.device.create_command_pool(&transient_info, None) {
            Ok(pool) => pool,
            Err(e) => {
                ctx.device.destroy_command_pool(frame_pool, None);
                return Err(resource_err("transient command pool")(e));
            }
        };

        Ok(Self {
            frame_pool,
            transient_pool,
            queue: ctx.queue,
            device: ctx.device.clone(),
        })
    }

    pub unsafe fn allocate(&self, count: u32) -> RtResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.frame_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        self.device
            .allocate_command_buffers(&alloc_info)
            .map_err(resource_err("command buffer"))
    }

    pub unsafe fn free(&self, cmds: &[vk::CommandBuffer]) {
        if !cmds.is_empty() {
            self.device.free_command_buffers(self.frame_pool, cmds);
        }
    }

    /// Reset and begin recording a frame command buffer.
    pub unsafe fn begin(&self, cmd: vk::CommandBuffer) -> RtResult<()> {
        self.device
            .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            .map_err(resource_err("command buffer reset"))?;

        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        self.device
            .begin_command_buffer(cmd, &begin_info)
            .map_err(resource_err("command buffer begin"))
    }

    pub unsafe fn end(&self, cmd: vk::CommandBuffer) -> RtResult<()> {
        self.device
            .end_command_buffer(cmd)
            .map_err(resource_err("command buffer end"))
    }

    /// Submit a frame command buffer between its semaphores.
    pub unsafe fn submit(&self, submit: &FrameSubmit) -> RtResult<()> {
        let wait_semaphores = [submit.wait];
        let wait_stages = [submit.wait_stage];
        let signal_semaphores = [submit.signal];
        let command_buffers = [submit.cmd];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        self.device
            .queue_submit(self.queue, &[submit_info], submit.fence)
            .map_err(submit_err("frame"))
    }

    /// Begin a single-use command buffer.
    pub unsafe fn begin_single_time(&self) -> RtResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.transient_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = self
            .device
            .allocate_command_buffers(&alloc_info)
            .map_err(resource_err("command buffer"))?[0];

        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        if let Err(e) = self.device.begin_command_buffer(cmd, &begin_info) {
            self.device.free_command_buffers(self.transient_pool, &[cmd]);
            return Err(resource_err("command buffer begin")(e));
        }

        Ok(cmd)
    }

    /// End and submit a single-use command buffer, waiting for completion.
    ///
    /// The command buffer is freed whether or not the submission succeeded.
    pub unsafe fn end_single_time(&self, cmd: vk::CommandBuffer) -> RtResult<()> {
        let command_buffers = [cmd];
        let result = self.submit_and_wait(&command_buffers);
        self.device.free_command_buffers(self.transient_pool, &command_buffers);
        result
    }

    /// Free a single-use command buffer that will not be submitted.
    pub unsafe fn discard_single_time(&self, cmd: vk::CommandBuffer) {
        let _ = self.device.end_command_buffer(cmd);
        self.device.free_command_buffers(self.transient_pool, &[cmd]);
    }

    unsafe fn submit_and_wait(&self, command_buffers: &[vk::CommandBuffer]) -> RtResult<()> {
        let to_error = submit_err("one-shot");

        self.device.end_command_buffer(command_buffers[0]).map_err(to_error)?;

        let submit_info = vk::SubmitInfo::default().command_buffers(command_buffers);

        self.device
            .queue_submit(self.queue, &[submit_info], vk::Fence::null())
            .map_err(to_error)?;

        self.device.queue_wait_idle(self.queue).map_err(to_error)
    }

    pub unsafe fn destroy(&mut self) {
        self.device.destroy_command_pool(self.frame_pool, None);
        self.device.destroy_command_pool(self.transient_pool, None);
        self.frame_pool = vk::CommandPool::null();
        self.transient_pool = vk::CommandPool::null();
    }
}
