//! Frame loop errors.

use ember_gpu::{ErrorKind, GpuError};
use thiserror::Error;

/// Errors that terminate the frame loop.
///
/// Out-of-date and suboptimal swapchains never show up here; the scheduler
/// absorbs them by rebuilding.
#[derive(Error, Debug)]
pub enum FrameError {
    /// A GPU call failed.
    #[error(transparent)]
    Gpu(#[from] GpuError),

    /// Resources ran out again after the rebuild that followed the first
    /// exhaustion.
    #[error("Resources still exhausted after swapchain rebuild: {0}")]
    ExhaustionRetryFailed(#[source] GpuError),

    /// The renderer was used after `shutdown`.
    #[error("Renderer has been shut down")]
    ShutDown,
}

impl FrameError {
    /// Failure class of the underlying GPU error, if any.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Gpu(e) | Self::ExhaustionRetryFailed(e) => e.kind(),
            Self::ShutDown => ErrorKind::Other,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, FrameError>;
