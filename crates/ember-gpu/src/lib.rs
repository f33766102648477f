//! Vulkan layer for the Ember frame pipeline.
//!
//! This crate provides:
//! - Instance, validation messenger and device selection
//! - Window surface and swapchain resource sets
//! - The per-slot synchronization pool
//! - Render pass, pipeline and pre-recorded command buffers
//! - Payload buffers via gpu-allocator

pub mod command;
pub mod context;
pub mod error;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use command::{
    submit_command_buffers, CommandPool, CommandRecorder, DrawPayload, RecordTarget,
};
pub use context::{GpuContext, GpuContextBuilder, QueueFamilyIndices};
pub use error::{ErrorKind, GpuError, Result};
pub use memory::{GpuAllocator, GpuBuffer};
pub use pipeline::{GraphicsPipeline, GraphicsPipelineConfig, RenderPass};
pub use shader::{read_spirv_file, ShaderModule};
pub use surface::{SurfaceContext, SurfaceSupport};
pub use swapchain::{AcquireOutcome, PresentOutcome, Swapchain};
pub use sync::{create_fence, create_semaphore, FrameSlot, FrameSync, SyncPool};

// Re-exported so downstream crates name the same `ash` and allocator types.
pub use ash;
pub use gpu_allocator::MemoryLocation;
