//! Swapchain teardown and rebuild as one step.

use ember_gpu::{GpuError, Result};
use tracing::{debug, info};

use crate::backend::FrameBackend;

/// Result of a rebuild attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// A new resource set is live with this many images.
    Rebuilt { image_count: usize },
    /// The surface has zero area; nothing was touched. Try again once the
    /// window has a size.
    Suspended,
}

/// Tears down and rebuilds the swapchain resource set and its command
/// buffers. Never touches the synchronization pool.
#[derive(Debug, Default)]
pub struct SwapchainLifecycle {
    builds: u64,
}

impl SwapchainLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful builds, the initial one included.
    pub fn builds(&self) -> u64 {
        self.builds
    }

    /// Rebuild the swapchain resource set.
    ///
    /// Steps: check the surface has a non-zero extent, wait for device idle,
    /// tear the old set down, build the new one, re-record every command
    /// buffer.
    #[cfg_attr(
        feature = "profiling",
        tracing::instrument(level = "debug", skip_all)
    )]
    pub fn rebuild<B: FrameBackend>(&mut self, backend: &mut B) -> Result<RebuildOutcome> {
        let extent = backend.surface_extent()?;
        if extent.width == 0 || extent.height == 0 {
            debug!("Surface has zero extent, rebuild suspended");
            return Ok(RebuildOutcome::Suspended);
        }

        backend.wait_idle()?;
        backend.teardown_swapchain();

        let image_count = backend.build_swapchain(extent)?;
        let buffer_count = backend.record_commands()?;
        if buffer_count != image_count {
            return Err(GpuError::InvalidState(format!(
                "recorded {buffer_count} command buffers for {image_count} swapchain images"
            )));
        }

        self.builds += 1;
        if self.builds > 1 {
            info!(
                "Swapchain rebuilt at {}x{} ({} images)",
                extent.width, extent.height, image_count
            );
        }
        Ok(RebuildOutcome::Rebuilt { image_count })
    }
}
