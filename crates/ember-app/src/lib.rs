//! Frame loop and swapchain lifecycle for Ember.
//!
//! This crate provides:
//! - The frame scheduler that drives acquire, submit and present per frame
//! - The lifecycle controller that rebuilds the swapchain on resize or
//!   out-of-date signals
//! - A [`FrameBackend`] seam with a Vulkan implementation
//! - A winit runner that owns the window and event loop
//!
//! # Example
//!
//! ```no_run
//! use ember_app::{run_frame_loop, AppConfig, Scene};
//! use ember_gpu::{read_spirv_file, GraphicsPipelineConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let pipeline = GraphicsPipelineConfig {
//!         vertex_shader: read_spirv_file("shaders/triangle.vert.spv")?,
//!         fragment_shader: read_spirv_file("shaders/triangle.frag.spv")?,
//!         ..Default::default()
//!     };
//!     run_frame_loop(AppConfig::new("Triangle"), Scene::new(pipeline))
//! }
//! ```

mod backend;
mod error;
mod lifecycle;
mod renderer;
mod resize;
mod runner;
mod scheduler;

#[cfg(test)]
mod mock;

pub use backend::{BackendSettings, FrameBackend, Scene, VulkanBackend};
pub use error::{FrameError, Result};
pub use lifecycle::{RebuildOutcome, SwapchainLifecycle};
pub use renderer::Renderer;
pub use resize::ResizeSignal;
pub use runner::{
    init_logging, run_frame_loop, AppConfig, DEFAULT_FENCE_TIMEOUT, DEFAULT_FRAMES_IN_FLIGHT,
};
pub use scheduler::{FrameScheduler, FrameState, FrameStats, TickOutcome};
