//! Window event loop driving the renderer.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use ember_gpu::GpuContextBuilder;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::backend::{BackendSettings, Scene, VulkanBackend};
use crate::renderer::Renderer;
use crate::resize::ResizeSignal;
use crate::scheduler::TickOutcome;

/// Default number of frames the CPU may prepare ahead of the GPU.
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;

/// Default bound on a single fence wait before the device is considered hung.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Force FIFO presentation.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Number of frame slots.
    pub frames_in_flight: usize,
    /// Longest a fence wait may block before failing.
    pub fence_timeout: Duration,
    /// Exit after this many presented frames.
    pub frame_limit: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Ember".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: false,
            validation: cfg!(debug_assertions),
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
            frame_limit: None,
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the target FPS.
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Set the number of frames in flight.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the fence wait timeout.
    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    /// Stop after `frames` presented frames.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Time budget per frame when a target FPS is set.
    pub fn target_frame_time(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default
/// `info` filter. Does nothing if a subscriber is already installed.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

/// Open a window and render `scene` until the window is closed or the frame
/// limit is reached.
///
/// Initializes logging, creates the GPU context and renderer, and blocks in
/// the event loop. A fatal frame error shuts the renderer down and is
/// returned without being logged.
pub fn run_frame_loop(config: AppConfig, scene: Scene) -> anyhow::Result<()> {
    init_logging();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner {
        config,
        scene,
        resize: ResizeSignal::new(),
        state: None,
        failure: None,
    };

    event_loop
        .run_app(&mut runner)
        .context("Event loop error")?;

    match runner.failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Internal runner that implements winit's `ApplicationHandler`.
struct AppRunner {
    config: AppConfig,
    scene: Scene,
    resize: ResizeSignal,
    state: Option<AppState>,
    failure: Option<anyhow::Error>,
}

/// Live window and renderer.
struct AppState {
    renderer: Renderer<VulkanBackend>,
    window: Arc<Window>,
    target_frame_time: Option<Duration>,
    frame_limit: Option<u64>,
    suspended: bool,
    last_frame_time: Instant,
    // FPS tracking
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
    fps_samples: u64,
}

impl ApplicationHandler for AppRunner {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating renderer...");

        match self.create_state(event_loop) {
            Ok(state) => {
                state.window.request_redraw();
                self.state = Some(state);
                info!("Renderer ready");
            }
            Err(e) => {
                self.failure = Some(e.context("Failed to initialize renderer"));
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.stop(event_loop);
            }
            WindowEvent::Resized(size) => {
                self.resize.notify();
                if let Some(state) = &mut self.state {
                    if state.suspended && size.width > 0 && size.height > 0 {
                        state.suspended = false;
                        event_loop.set_control_flow(ControlFlow::Poll);
                        state.window.request_redraw();
                    }
                }
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                match state.render_frame(event_loop) {
                    Ok(true) => {}
                    Ok(false) => {
                        info!("Frame limit reached");
                        self.stop(event_loop);
                    }
                    Err(e) => {
                        self.failure = Some(e.into());
                        self.stop(event_loop);
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            if !state.suspended {
                state.window.request_redraw();
            }
        }
    }
}

impl AppRunner {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState> {
        // Create window
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);

        // SAFETY: the window is kept alive by the backend, which owns the context.
        let gpu = unsafe {
            GpuContextBuilder::new()
                .app_name(&self.config.title)
                .validation(self.config.validation)
                .build(window.as_ref())?
        };

        info!("GPU: {}", gpu.device_name());

        let settings = BackendSettings {
            frames_in_flight: self.config.frames_in_flight,
            fence_timeout: self.config.fence_timeout,
            vsync: self.config.vsync,
        };
        let backend = VulkanBackend::new(gpu, window.clone(), settings, &self.scene)?;
        let renderer = Renderer::new(backend, self.resize.clone())?;

        Ok(AppState {
            renderer,
            window,
            target_frame_time: self.config.target_frame_time(),
            frame_limit: self.config.frame_limit,
            suspended: false,
            last_frame_time: Instant::now(),
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
            fps_samples: 0,
        })
    }

    fn stop(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut state) = self.state.take() {
            if let Err(e) = state.cleanup() {
                // Only the first failure is returned; a later one is logged.
                if self.failure.is_some() {
                    error!("Shutdown after failure also failed: {e:#}");
                } else {
                    self.failure = Some(e);
                }
            }
        }
        event_loop.exit();
    }
}

impl AppState {
    /// Render one frame. Returns `false` once the frame limit is reached.
    #[cfg_attr(
        feature = "profiling",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn render_frame(&mut self, event_loop: &ActiveEventLoop) -> crate::Result<bool> {
        let frame_start = Instant::now();

        match self.renderer.tick()? {
            TickOutcome::Presented { .. } => self.track_fps(),
            TickOutcome::Skipped { .. } | TickOutcome::Dropped { .. } => {}
            TickOutcome::Suspended => {
                // Nothing to draw until the window has a size again
                self.suspended = true;
                event_loop.set_control_flow(ControlFlow::Wait);
                return Ok(true);
            }
        }

        if let Some(limit) = self.frame_limit {
            if self.renderer.stats().presented >= limit {
                return Ok(false);
            }
        }

        // Frame pacing
        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }

        Ok(true)
    }

    fn track_fps(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_frame_time).as_secs_f64();
        self.last_frame_time = now;

        if dt > 0.0 {
            let fps = 1.0 / dt;
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
            self.fps_samples += 1;
        }
    }

    fn cleanup(&mut self) -> anyhow::Result<()> {
        let stats = self.renderer.stats();
        if self.fps_samples > 0 {
            let avg_fps = self.fps_sum / self.fps_samples as f64;
            info!("FPS Statistics:");
            info!("  Min: {:.1}", self.min_fps);
            info!("  Max: {:.1}", self.max_fps);
            info!("  Avg: {:.1}", avg_fps);
        }
        info!("  Frames presented: {}", stats.presented);
        info!("  Frames skipped: {}", stats.skipped);
        info!("  Frames dropped: {}", stats.dropped);
        info!("  Swapchain rebuilds: {}", stats.rebuilds);

        info!("Starting cleanup...");
        self.renderer.shutdown()?;
        info!("Cleanup complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = AppConfig::default();
        assert_eq!((config.width, config.height), (1280, 720));
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.fence_timeout, Duration::from_secs(10));
        assert!(!config.vsync);
        assert!(config.target_fps.is_none());
        assert!(config.frame_limit.is_none());
    }

    #[test]
    fn builder_sets_fields() {
        let config = AppConfig::new("test")
            .with_size(640, 480)
            .with_vsync(true)
            .with_frames_in_flight(3)
            .with_fence_timeout(Duration::from_millis(500))
            .with_frame_limit(100)
            .with_validation(false);

        assert_eq!(config.title, "test");
        assert_eq!((config.width, config.height), (640, 480));
        assert!(config.vsync);
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.fence_timeout, Duration::from_millis(500));
        assert_eq!(config.frame_limit, Some(100));
        assert!(!config.validation);
    }

    #[test]
    fn target_frame_time_from_fps() {
        let config = AppConfig::default().with_target_fps(50);
        assert_eq!(config.target_frame_time(), Some(Duration::from_millis(20)));
        assert_eq!(AppConfig::default().target_frame_time(), None);
        assert_eq!(
            AppConfig::default().with_target_fps(0).target_frame_time(),
            None
        );
    }
}
