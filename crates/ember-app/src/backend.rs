//! The device operations the frame scheduler drives, and their Vulkan
//! implementation.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use bytemuck::Pod;
use ember_gpu::command::{submit_command_buffers, CommandRecorder, DrawPayload, RecordTarget};
use ember_gpu::swapchain::{AcquireOutcome, PresentOutcome, Swapchain};
use ember_gpu::sync::{FrameSlot, SyncPool};
use ember_gpu::{
    GpuBuffer, GpuContext, GpuError, GraphicsPipeline, GraphicsPipelineConfig, RenderPass, Result,
};
use tracing::{debug, info, warn};
use winit::window::Window;

/// Primitive operations of the synchronization pool, swapchain resource set
/// and command recorder.
///
/// [`FrameScheduler`](crate::FrameScheduler) and
/// [`SwapchainLifecycle`](crate::SwapchainLifecycle) are written against this
/// trait only.
pub trait FrameBackend {
    /// Number of frame slots (frames in flight).
    fn slot_count(&self) -> usize;

    /// Block until the slot's fence is signaled.
    fn wait_for_slot(&mut self, slot: FrameSlot) -> Result<()>;

    /// Reset the slot's fence to unsignaled.
    fn reset_slot(&mut self, slot: FrameSlot) -> Result<()>;

    /// Number of images in the current swapchain, zero when none is built.
    fn image_count(&self) -> usize;

    /// Acquire the next image, signaling the slot's image-available semaphore.
    fn acquire_next_image(&mut self, slot: FrameSlot) -> Result<AcquireOutcome>;

    /// Submit the command buffer recorded for `image_index`, waiting on the
    /// slot's image-available semaphore and signaling its render-finished
    /// semaphore and fence.
    fn submit(&mut self, slot: FrameSlot, image_index: u32) -> Result<()>;

    /// Present `image_index` once the slot's render-finished semaphore fires.
    fn present(&mut self, slot: FrameSlot, image_index: u32) -> Result<PresentOutcome>;

    /// Size the swapchain should be built at. Zero while minimized.
    fn surface_extent(&self) -> Result<vk::Extent2D>;

    /// Block until the device has finished all submitted work.
    fn wait_idle(&mut self) -> Result<()>;

    /// Destroy the swapchain resource set. Safe to call repeatedly.
    fn teardown_swapchain(&mut self);

    /// Build a new swapchain resource set and return its image count.
    fn build_swapchain(&mut self, extent: vk::Extent2D) -> Result<usize>;

    /// Re-record every command buffer and return how many there are.
    fn record_commands(&mut self) -> Result<usize>;

    /// Number of currently recorded command buffers.
    fn command_buffer_count(&self) -> usize;

    /// Release every owned GPU object. Safe to call repeatedly.
    fn release(&mut self);
}

/// What every frame draws.
#[derive(Clone)]
pub struct Scene {
    /// Shaders and fixed-function state.
    pub pipeline: GraphicsPipelineConfig,
    vertex_data: Vec<u8>,
    vertex_count: u32,
    indices: Vec<u16>,
    /// Colour the render pass clears to.
    pub clear_color: [f32; 4],
}

impl Scene {
    /// A scene that draws three vertices generated by the vertex shader.
    pub fn new(pipeline: GraphicsPipelineConfig) -> Self {
        Self {
            pipeline,
            vertex_data: Vec::new(),
            vertex_count: 3,
            indices: Vec::new(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }

    /// Draw from a vertex buffer filled with `vertices`.
    pub fn with_vertices<T: Pod>(mut self, vertices: &[T]) -> Self {
        self.vertex_data = bytemuck::cast_slice(vertices).to_vec();
        self.vertex_count = u32::try_from(vertices.len()).unwrap_or(u32::MAX);
        self
    }

    /// Draw indexed with 16-bit `indices`.
    pub fn with_indices(mut self, indices: &[u16]) -> Self {
        self.indices = indices.to_vec();
        self
    }

    /// Set the clear colour.
    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }
}

/// Frame-loop settings that shape the backend.
#[derive(Debug, Clone, Copy)]
pub struct BackendSettings {
    pub frames_in_flight: usize,
    pub fence_timeout: Duration,
    pub vsync: bool,
}

/// [`FrameBackend`] over a real Vulkan device.
///
/// Owns the synchronization pool, the swapchain resource set, the render
/// pass and pipeline built for its format, the command recorder and the
/// draw payload buffers.
pub struct VulkanBackend {
    sync: SyncPool,
    swapchain: Option<Swapchain>,
    render_pass: Option<RenderPass>,
    pipeline: Option<GraphicsPipeline>,
    pipeline_config: GraphicsPipelineConfig,
    recorder: CommandRecorder,
    payload: DrawPayload,
    buffers: Vec<GpuBuffer>,
    vsync: bool,
    released: bool,
    // Dropped after the objects above: device, surface, instance.
    gpu: GpuContext,
    window: Arc<Window>,
}

impl VulkanBackend {
    /// Create the backend. The swapchain is built later by the lifecycle
    /// controller.
    pub fn new(
        gpu: GpuContext,
        window: Arc<Window>,
        settings: BackendSettings,
        scene: &Scene,
    ) -> Result<Self> {
        // SAFETY: the device is valid for the lifetime of `gpu`.
        let mut sync = unsafe {
            SyncPool::new(
                gpu.device(),
                settings.frames_in_flight,
                settings.fence_timeout,
            )?
        };

        // SAFETY: the device is valid and the graphics family exists.
        let recorder =
            match unsafe { CommandRecorder::new(gpu.device(), gpu.queue_families().graphics) } {
                Ok(recorder) => recorder,
                Err(e) => {
                    // SAFETY: nothing has been submitted yet.
                    unsafe { sync.destroy(gpu.device()) };
                    return Err(e);
                }
            };

        let mut backend = Self {
            sync,
            swapchain: None,
            render_pass: None,
            pipeline: None,
            pipeline_config: scene.pipeline.clone(),
            recorder,
            payload: DrawPayload {
                vertex_count: scene.vertex_count,
                clear_color: scene.clear_color,
                ..DrawPayload::default()
            },
            buffers: Vec::new(),
            vsync: settings.vsync,
            released: false,
            gpu,
            window,
        };

        if let Err(e) = backend.upload_scene(scene) {
            backend.release();
            return Err(e);
        }

        Ok(backend)
    }

    /// The GPU context the backend renders with.
    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    fn upload_scene(&mut self, scene: &Scene) -> Result<()> {
        let mut allocator = self.gpu.allocator().lock();

        if !scene.vertex_data.is_empty() {
            let buffer = allocator.create_buffer_with_data(
                &scene.vertex_data,
                vk::BufferUsageFlags::VERTEX_BUFFER,
                "scene vertices",
            )?;
            self.payload.vertex_buffer = Some(buffer.buffer);
            self.buffers.push(buffer);
        }

        if !scene.indices.is_empty() {
            let buffer = allocator.create_buffer_with_data(
                &scene.indices,
                vk::BufferUsageFlags::INDEX_BUFFER,
                "scene indices",
            )?;
            let index_count = u32::try_from(scene.indices.len())
                .map_err(|_| GpuError::InvalidState("too many indices".to_string()))?;
            self.payload.index_buffer = Some((buffer.buffer, index_count));
            self.buffers.push(buffer);
        }

        Ok(())
    }

    fn swapchain(&self) -> Result<&Swapchain> {
        self.swapchain
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("no swapchain is built".to_string()))
    }

    /// Recreate the render pass and pipeline if `format` differs from the
    /// one they were built for.
    fn ensure_render_pass(&mut self, format: vk::Format) -> Result<vk::RenderPass> {
        let device = self.gpu.device();

        if let Some(render_pass) = &self.render_pass {
            if render_pass.format() == format {
                return Ok(render_pass.handle());
            }
            debug!(
                "Swapchain format changed from {:?} to {:?}, rebuilding pipeline",
                render_pass.format(),
                format
            );
        }

        // SAFETY: the device is idle during a rebuild, so neither object is in use.
        unsafe {
            if let Some(mut pipeline) = self.pipeline.take() {
                pipeline.destroy(device);
            }
            if let Some(mut render_pass) = self.render_pass.take() {
                render_pass.destroy(device);
            }
        }

        // SAFETY: the device is valid.
        let mut render_pass = unsafe { RenderPass::new(device, format)? };
        // SAFETY: the device is valid and the render pass was just created.
        let pipeline =
            match unsafe { GraphicsPipeline::new(device, &self.pipeline_config, &render_pass) } {
                Ok(pipeline) => pipeline,
                Err(e) => {
                    // SAFETY: nothing references the new render pass yet.
                    unsafe { render_pass.destroy(device) };
                    return Err(e);
                }
            };

        let handle = render_pass.handle();
        self.render_pass = Some(render_pass);
        self.pipeline = Some(pipeline);
        Ok(handle)
    }
}

impl FrameBackend for VulkanBackend {
    fn slot_count(&self) -> usize {
        self.sync.len()
    }

    fn wait_for_slot(&mut self, slot: FrameSlot) -> Result<()> {
        // SAFETY: the fence belongs to this device.
        unsafe { self.sync.wait(self.gpu.device(), slot) }
    }

    fn reset_slot(&mut self, slot: FrameSlot) -> Result<()> {
        // SAFETY: callers only reset after waiting, so the fence is not pending.
        unsafe { self.sync.reset(self.gpu.device(), slot) }
    }

    fn image_count(&self) -> usize {
        self.swapchain.as_ref().map_or(0, Swapchain::image_count)
    }

    fn acquire_next_image(&mut self, slot: FrameSlot) -> Result<AcquireOutcome> {
        let semaphore = self.sync.get(slot).image_available;
        // SAFETY: the swapchain and semaphore are alive.
        unsafe {
            self.swapchain()?
                .acquire_next(self.gpu.swapchain_loader(), semaphore, u64::MAX)
        }
    }

    fn submit(&mut self, slot: FrameSlot, image_index: u32) -> Result<()> {
        let cmd = self.recorder.buffer(image_index).ok_or_else(|| {
            GpuError::InvalidState(format!("no command buffer for image {image_index}"))
        })?;
        let sync = self.sync.get(slot);

        // SAFETY: the command buffer is not pending; the scheduler waited for
        // the last fence that used this image.
        unsafe {
            submit_command_buffers(
                self.gpu.device(),
                self.gpu.graphics_queue(),
                &[cmd],
                &[sync.image_available],
                &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
                &[sync.render_finished],
                sync.in_flight,
            )
        }
    }

    fn present(&mut self, slot: FrameSlot, image_index: u32) -> Result<PresentOutcome> {
        let semaphore = self.sync.get(slot).render_finished;
        // SAFETY: the swapchain and semaphore are alive.
        unsafe {
            self.swapchain()?.present(
                self.gpu.swapchain_loader(),
                self.gpu.present_queue(),
                image_index,
                semaphore,
            )
        }
    }

    fn surface_extent(&self) -> Result<vk::Extent2D> {
        let current = self.gpu.surface_support()?.capabilities.current_extent;
        if current.width != u32::MAX {
            return Ok(current);
        }
        // The surface follows the window; use its framebuffer size.
        let size = self.window.inner_size();
        Ok(vk::Extent2D {
            width: size.width,
            height: size.height,
        })
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.gpu.wait_idle()
    }

    fn teardown_swapchain(&mut self) {
        if let Some(mut swapchain) = self.swapchain.take() {
            // SAFETY: the lifecycle controller waits for device idle first.
            unsafe { swapchain.teardown(self.gpu.device(), self.gpu.swapchain_loader()) };
        }
    }

    fn build_swapchain(&mut self, extent: vk::Extent2D) -> Result<usize> {
        let support = self.gpu.surface_support()?;
        if !support.is_adequate() {
            return Err(GpuError::Configuration(
                "surface reports no formats or present modes".to_string(),
            ));
        }

        // SAFETY: all handles come from the live GPU context.
        let mut swapchain = unsafe {
            Swapchain::new(
                self.gpu.device(),
                self.gpu.swapchain_loader(),
                self.gpu.surface().surface,
                &support,
                extent,
                self.vsync,
                &self.gpu.queue_families(),
            )?
        };

        let attached = self
            .ensure_render_pass(swapchain.format.format)
            .and_then(|render_pass| {
                // SAFETY: the render pass matches the swapchain format.
                unsafe { swapchain.create_framebuffers(self.gpu.device(), render_pass) }
            });
        if let Err(e) = attached {
            // SAFETY: the new set has never been used.
            unsafe { swapchain.teardown(self.gpu.device(), self.gpu.swapchain_loader()) };
            return Err(e);
        }

        if swapchain.present_mode != vk::PresentModeKHR::MAILBOX && !self.vsync {
            warn!("MAILBOX unavailable, presenting with {:?}", swapchain.present_mode);
        }
        info!(
            "Swapchain ready: {}x{}, {} images",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.image_count()
        );

        let image_count = swapchain.image_count();
        self.swapchain = Some(swapchain);
        Ok(image_count)
    }

    fn record_commands(&mut self) -> Result<usize> {
        let swapchain = self.swapchain()?;
        let framebuffers = swapchain.framebuffers();
        let extent = swapchain.extent;
        let (render_pass, pipeline) = match (&self.render_pass, &self.pipeline) {
            (Some(render_pass), Some(pipeline)) => (render_pass.handle(), pipeline.pipeline),
            _ => {
                return Err(GpuError::InvalidState(
                    "render pass not built before recording".to_string(),
                ))
            }
        };

        let target = RecordTarget {
            render_pass,
            pipeline,
            framebuffers: &framebuffers,
            extent,
        };
        // SAFETY: recording happens only after a device-idle wait.
        unsafe {
            self.recorder
                .record_all(self.gpu.device(), &target, &self.payload)
        }
    }

    fn command_buffer_count(&self) -> usize {
        self.recorder.len()
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let device = self.gpu.device();
        // SAFETY: the renderer waited for device idle before releasing.
        unsafe {
            self.recorder.destroy(device);
            if let Some(swapchain) = &mut self.swapchain {
                swapchain.destroy_framebuffers(device);
            }
            if let Some(pipeline) = &mut self.pipeline {
                pipeline.destroy(device);
            }
            if let Some(render_pass) = &mut self.render_pass {
                render_pass.destroy(device);
            }
            if let Some(swapchain) = &mut self.swapchain {
                swapchain.destroy_image_views(device);
                swapchain.destroy_swapchain(self.gpu.swapchain_loader());
            }
            self.sync.destroy(device);
        }
        self.swapchain = None;
        self.pipeline = None;
        self.render_pass = None;

        let mut allocator = self.gpu.allocator().lock();
        for mut buffer in self.buffers.drain(..) {
            if let Err(e) = allocator.free_buffer(&mut buffer) {
                warn!("Failed to free payload buffer: {e}");
            }
        }

        debug!("Frame resources released");
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.gpu.wait_idle();
            self.release();
        }
    }
}
