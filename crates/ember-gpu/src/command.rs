//! Command buffer management.
//!
//! The [`CommandRecorder`] keeps one primary command buffer per swapchain
//! image. Buffers are recorded up front after every swapchain build and
//! replayed unchanged each frame.

use ash::vk;

use crate::error::{GpuError, Result};

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device
            .create_command_pool(&create_info, None)
            .map_err(GpuError::during("vkCreateCommandPool"))?;

        Ok(Self { pool })
    }

    /// Allocate primary command buffers.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(
        &self,
        device: &ash::Device,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        device
            .allocate_command_buffers(&alloc_info)
            .map_err(GpuError::during("vkAllocateCommandBuffers"))
    }

    /// Return command buffers to the pool.
    ///
    /// # Safety
    /// The buffers must not be pending execution.
    pub unsafe fn free(&self, device: &ash::Device, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() && self.pool != vk::CommandPool::null() {
            device.free_command_buffers(self.pool, buffers);
        }
    }

    /// Reset every buffer allocated from the pool.
    ///
    /// # Safety
    /// The device must be valid and no buffer from this pool may be in use.
    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        device
            .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
            .map_err(GpuError::during("vkResetCommandPool"))
    }

    /// Destroy the command pool. Calling this again is a no-op.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        if self.pool != vk::CommandPool::null() {
            device.destroy_command_pool(self.pool, None);
            self.pool = vk::CommandPool::null();
        }
    }
}

/// Geometry drawn by every recorded command buffer.
#[derive(Debug, Clone, Copy)]
pub struct DrawPayload {
    /// Bound at binding 0 when present.
    pub vertex_buffer: Option<vk::Buffer>,
    pub vertex_count: u32,
    /// 16-bit index buffer and its index count.
    pub index_buffer: Option<(vk::Buffer, u32)>,
    pub clear_color: [f32; 4],
}

impl Default for DrawPayload {
    fn default() -> Self {
        Self {
            vertex_buffer: None,
            vertex_count: 3,
            index_buffer: None,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Render targets a recording pass writes into.
#[derive(Debug, Clone, Copy)]
pub struct RecordTarget<'a> {
    pub render_pass: vk::RenderPass,
    pub pipeline: vk::Pipeline,
    /// One framebuffer per swapchain image, in image-index order.
    pub framebuffers: &'a [vk::Framebuffer],
    pub extent: vk::Extent2D,
}

/// Pre-recorded command buffers, one per swapchain image.
pub struct CommandRecorder {
    pool: CommandPool,
    buffers: Vec<vk::CommandBuffer>,
}

impl CommandRecorder {
    /// Create an empty recorder on `queue_family`.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, queue_family: u32) -> Result<Self> {
        let pool = CommandPool::new(device, queue_family, vk::CommandPoolCreateFlags::empty())?;
        Ok(Self {
            pool,
            buffers: Vec::new(),
        })
    }

    /// Number of recorded buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Command buffer for swapchain image `image_index`.
    pub fn buffer(&self, image_index: u32) -> Option<vk::CommandBuffer> {
        self.buffers.get(image_index as usize).copied()
    }

    /// Record one command buffer per framebuffer in `target`.
    ///
    /// Buffers are reallocated when the image count changed and reset
    /// otherwise. Returns the number of recorded buffers.
    ///
    /// # Safety
    /// No previously recorded buffer may be pending execution.
    #[cfg_attr(
        feature = "profiling",
        tracing::instrument(level = "debug", skip_all)
    )]
    pub unsafe fn record_all(
        &mut self,
        device: &ash::Device,
        target: &RecordTarget<'_>,
        payload: &DrawPayload,
    ) -> Result<usize> {
        let count = target.framebuffers.len();
        if self.buffers.len() == count {
            self.pool.reset(device)?;
        } else {
            self.free_buffers(device);
            let count = u32::try_from(count)
                .map_err(|_| GpuError::InvalidState("too many swapchain images".to_string()))?;
            self.buffers = self.pool.allocate(device, count)?;
        }

        for (&cmd, &framebuffer) in self.buffers.iter().zip(target.framebuffers) {
            record_draw(device, cmd, framebuffer, target, payload)?;
        }

        tracing::debug!("Recorded {} command buffers", self.buffers.len());
        Ok(self.buffers.len())
    }

    /// Free every recorded buffer, keeping the pool.
    ///
    /// # Safety
    /// No buffer may be pending execution.
    pub unsafe fn free_buffers(&mut self, device: &ash::Device) {
        self.pool.free(device, &self.buffers);
        self.buffers.clear();
    }

    /// Free the buffers and destroy the pool. Calling this again is a no-op.
    ///
    /// # Safety
    /// No buffer may be pending execution.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.free_buffers(device);
        self.pool.destroy(device);
    }
}

unsafe fn record_draw(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    framebuffer: vk::Framebuffer,
    target: &RecordTarget<'_>,
    payload: &DrawPayload,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default();
    device
        .begin_command_buffer(cmd, &begin_info)
        .map_err(GpuError::during("vkBeginCommandBuffer"))?;

    let clear_values = [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: payload.clear_color,
        },
    }];
    let render_area = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: target.extent,
    };
    let pass_info = vk::RenderPassBeginInfo::default()
        .render_pass(target.render_pass)
        .framebuffer(framebuffer)
        .render_area(render_area)
        .clear_values(&clear_values);

    device.cmd_begin_render_pass(cmd, &pass_info, vk::SubpassContents::INLINE);
    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, target.pipeline);

    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: target.extent.width as f32,
        height: target.extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    device.cmd_set_viewport(cmd, 0, &[viewport]);
    device.cmd_set_scissor(cmd, 0, &[render_area]);

    if let Some(vertex_buffer) = payload.vertex_buffer {
        device.cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer], &[0]);
    }
    match payload.index_buffer {
        Some((index_buffer, index_count)) => {
            device.cmd_bind_index_buffer(cmd, index_buffer, 0, vk::IndexType::UINT16);
            device.cmd_draw_indexed(cmd, index_count, 1, 0, 0, 0);
        }
        None => device.cmd_draw(cmd, payload.vertex_count, 1, 0, 0),
    }

    device.cmd_end_render_pass(cmd);
    device
        .end_command_buffer(cmd)
        .map_err(GpuError::during("vkEndCommandBuffer"))
}

/// Submit command buffers to a queue.
///
/// # Safety
/// All handles must be valid.
#[cfg_attr(
    feature = "profiling",
    tracing::instrument(level = "trace", skip_all)
)]
pub unsafe fn submit_command_buffers(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffers: &[vk::CommandBuffer],
    wait_semaphores: &[vk::Semaphore],
    wait_stages: &[vk::PipelineStageFlags],
    signal_semaphores: &[vk::Semaphore],
    fence: vk::Fence,
) -> Result<()> {
    let submit_info = vk::SubmitInfo::default()
        .command_buffers(command_buffers)
        .wait_semaphores(wait_semaphores)
        .wait_dst_stage_mask(wait_stages)
        .signal_semaphores(signal_semaphores);

    device
        .queue_submit(queue, &[submit_info], fence)
        .map_err(GpuError::during("vkQueueSubmit"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_payload_draws_one_triangle_on_black() {
        let payload = DrawPayload::default();
        assert!(payload.vertex_buffer.is_none());
        assert!(payload.index_buffer.is_none());
        assert_eq!(payload.vertex_count, 3);
        assert_eq!(payload.clear_color, [0.0, 0.0, 0.0, 1.0]);
    }
}
