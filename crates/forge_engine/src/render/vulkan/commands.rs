//! Command recording and queue submission
//!
//! [`CommandBuffer`] wraps a primary command buffer during recording and owns
//! any "associated" buffers (staging memory, transient descriptor storage)
//! that must stay alive until the commands retire. [`Queue`] owns a command
//! pool on one queue family and provides blocking submission, which is all
//! the upload paths need; frame submission with semaphores is driven by the
//! presenter above the core.

use ash::vk;

use super::context::VulkanResult;
use super::pipeline::Pipeline;
use super::query::TimestampPool;
use super::resource::{Buffer, Image};

/// A primary command buffer under recording.
pub struct CommandBuffer {
    device: ash::Device,
    cmd_buf: vk::CommandBuffer,
    associated_buffers: Vec<Buffer>,
}

impl CommandBuffer {
    fn new(device: ash::Device, cmd_buf: vk::CommandBuffer) -> Self {
        Self {
            device,
            cmd_buf,
            associated_buffers: Vec::new(),
        }
    }

    /// The raw command buffer handle.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.cmd_buf
    }

    /// Keeps a buffer alive until this command buffer retires.
    pub fn bind_associated_buffer(&mut self, buffer: Buffer) {
        self.associated_buffers.push(buffer);
    }

    /// `vkCmdBeginRendering`
    pub fn begin_rendering(&mut self, rendering_info: &vk::RenderingInfo) {
        unsafe { self.device.cmd_begin_rendering(self.cmd_buf, rendering_info) };
    }

    /// `vkCmdEndRendering`
    pub fn end_rendering(&mut self) {
        unsafe { self.device.cmd_end_rendering(self.cmd_buf) };
    }

    /// Binds a pipeline at its bind point.
    pub fn bind_pipeline(&mut self, pipeline: &Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(self.cmd_buf, pipeline.bind_point(), pipeline.handle());
        }
    }

    /// Binds descriptor sets for a pipeline.
    pub fn bind_descriptor_sets(
        &mut self,
        pipeline: &Pipeline,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.cmd_buf,
                pipeline.bind_point(),
                pipeline.layout(),
                first_set,
                sets,
                &[],
            );
        }
    }

    /// Pushes constants visible to the given stages.
    pub fn push_constants<T: bytemuck::Pod>(
        &mut self,
        pipeline: &Pipeline,
        stages: vk::ShaderStageFlags,
        data: &T,
    ) {
        unsafe {
            self.device.cmd_push_constants(
                self.cmd_buf,
                pipeline.layout(),
                stages,
                0,
                bytemuck::bytes_of(data),
            );
        }
    }

    /// Binds an index buffer.
    pub fn bind_index_buffer(&mut self, buffer: &Buffer, index_type: vk::IndexType) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.cmd_buf, buffer.handle(), 0, index_type);
        }
    }

    /// Sets a full-extent viewport and scissor.
    pub fn set_viewport_scissor(&mut self, extent: vk::Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };
        unsafe {
            self.device.cmd_set_viewport(self.cmd_buf, 0, &[viewport]);
            self.device.cmd_set_scissor(self.cmd_buf, 0, &[scissor]);
        }
    }

    /// `vkCmdDispatch`
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(self.cmd_buf, x, y, z) };
    }

    /// Non-indexed draw.
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        unsafe { self.device.cmd_draw(self.cmd_buf, vertex_count, instance_count, 0, 0) };
    }

    /// `vkCmdDrawIndexedIndirectCount`
    pub fn draw_indexed_indirect_count(
        &mut self,
        buffer: &Buffer,
        offset: vk::DeviceSize,
        count_buffer: &Buffer,
        count_offset: vk::DeviceSize,
        max_draw_count: u32,
        stride: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed_indirect_count(
                self.cmd_buf,
                buffer.handle(),
                offset,
                count_buffer.handle(),
                count_offset,
                max_draw_count,
                stride,
            );
        }
    }

    /// Fills a buffer range with zeroes.
    pub fn zero_buffer(&mut self, buffer: &Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) {
        unsafe {
            self.device
                .cmd_fill_buffer(self.cmd_buf, buffer.handle(), offset, size, 0);
        }
    }

    /// Buffer-to-buffer copy.
    pub fn copy_buffer(&mut self, src: &Buffer, dst: &Buffer, region: vk::BufferCopy) {
        unsafe {
            self.device
                .cmd_copy_buffer(self.cmd_buf, src.handle(), dst.handle(), &[region]);
        }
    }

    /// Buffer-to-image copy.
    pub fn copy_buffer_to_image(
        &mut self,
        src: &Buffer,
        dst: &Image,
        layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    ) {
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                self.cmd_buf,
                src.handle(),
                dst.handle(),
                layout,
                &[region],
            );
        }
    }

    /// `vkCmdPipelineBarrier2`
    pub fn pipeline_barrier(&mut self, dependency_info: &vk::DependencyInfo) {
        unsafe { self.device.cmd_pipeline_barrier2(self.cmd_buf, dependency_info) };
    }

    /// A single buffer memory barrier.
    pub fn buffer_barrier(&mut self, barrier: vk::BufferMemoryBarrier2) {
        let barriers = [barrier];
        let dependency_info = vk::DependencyInfo::builder().buffer_memory_barriers(&barriers);
        unsafe { self.device.cmd_pipeline_barrier2(self.cmd_buf, &dependency_info) };
    }

    /// A single image memory barrier.
    pub fn image_barrier(&mut self, barrier: vk::ImageMemoryBarrier2) {
        let barriers = [barrier];
        let dependency_info = vk::DependencyInfo::builder().image_memory_barriers(&barriers);
        unsafe { self.device.cmd_pipeline_barrier2(self.cmd_buf, &dependency_info) };
    }

    /// `vkCmdSetEvent2`
    pub fn set_event(&mut self, event: vk::Event, dependency_info: &vk::DependencyInfo) {
        unsafe { self.device.cmd_set_event2(self.cmd_buf, event, dependency_info) };
    }

    /// `vkCmdWaitEvents2`
    pub fn wait_events(&mut self, events: &[vk::Event], dependency_infos: &[vk::DependencyInfo]) {
        unsafe {
            self.device
                .cmd_wait_events2(self.cmd_buf, events, dependency_infos);
        }
    }

    /// Resets a query pool for reuse this submission.
    pub fn reset_query_pool(&mut self, pool: &TimestampPool) {
        unsafe {
            self.device
                .cmd_reset_query_pool(self.cmd_buf, pool.handle(), 0, pool.count());
        }
    }

    /// Writes a timestamp after the given stages complete.
    pub fn write_timestamp(&mut self, stage: vk::PipelineStageFlags2, pool: &TimestampPool, query: u32) {
        unsafe {
            self.device
                .cmd_write_timestamp2(self.cmd_buf, stage, pool.handle(), query);
        }
    }
}

/// A device queue with its command pool.
pub struct Queue {
    device: ash::Device,
    queue: vk::Queue,
    family_index: u32,
    command_pool: vk::CommandPool,
}

impl Queue {
    pub(crate) fn new(
        device: ash::Device,
        queue: vk::Queue,
        family_index: u32,
    ) -> ash::prelude::VkResult<Self> {
        let pool_ci = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(family_index);
        let command_pool = unsafe { device.create_command_pool(&pool_ci, None) }?;
        Ok(Self {
            device,
            queue,
            family_index,
            command_pool,
        })
    }

    /// The queue family this queue belongs to.
    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    /// Allocates and begins a one-shot command buffer.
    pub fn request_cmd_buf(&mut self) -> VulkanResult<CommandBuffer> {
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd_buf = unsafe { self.device.allocate_command_buffers(&allocate_info) }?[0];
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd_buf, &begin_info) }?;
        Ok(CommandBuffer::new(self.device.clone(), cmd_buf))
    }

    /// Ends and submits a command buffer, blocking until it completes.
    /// Associated buffers are released afterwards.
    pub fn submit(&mut self, cmd_buf: CommandBuffer) -> VulkanResult<()> {
        unsafe { self.device.end_command_buffer(cmd_buf.cmd_buf) }?;

        let fence_ci = vk::FenceCreateInfo::builder();
        let fence = unsafe { self.device.create_fence(&fence_ci, None) }?;
        let cmd_buf_info =
            vk::CommandBufferSubmitInfo::builder().command_buffer(cmd_buf.cmd_buf).build();
        let cmd_buf_infos = [cmd_buf_info];
        let submit_info = vk::SubmitInfo2::builder().command_buffer_infos(&cmd_buf_infos);
        let result = unsafe {
            self.device
                .queue_submit2(self.queue, &[submit_info.build()], fence)
                .and_then(|()| self.device.wait_for_fences(&[fence], true, u64::MAX))
        };
        unsafe {
            self.device.destroy_fence(fence, None);
            self.device
                .free_command_buffers(self.command_pool, &[cmd_buf.cmd_buf]);
        }
        result?;
        drop(cmd_buf);
        Ok(())
    }

    /// Records and submits commands in one go, blocking until completion.
    pub fn immediate_submit(
        &mut self,
        record: impl FnOnce(&mut CommandBuffer) -> VulkanResult<()>,
    ) -> VulkanResult<()> {
        let mut cmd_buf = self.request_cmd_buf()?;
        record(&mut cmd_buf)?;
        self.submit(cmd_buf)
    }

    pub(crate) fn destroy(&mut self) {
        unsafe { self.device.destroy_command_pool(self.command_pool, None) };
    }
}
