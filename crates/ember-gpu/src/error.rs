//! GPU error types.

use ash::vk;
use thiserror::Error;

/// Broad failure class used by the frame loop to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No compatible format, present mode or queue family. Not retried.
    Configuration,
    /// Driver or hardware fault. The process must shut down.
    DeviceLost,
    /// Allocation failure. May be retried once after a swapchain rebuild.
    ResourceExhaustion,
    /// Anything else; fatal at the current scope.
    Other,
}

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Hardware or configuration cannot satisfy the renderer.
    #[error("Unsupported configuration: {0}")]
    Configuration(String),

    /// The logical device was lost.
    #[error("Device lost during {op}")]
    DeviceLost { op: &'static str },

    /// Host or device memory, or a driver object pool, ran out.
    #[error("{op} failed: out of resources ({result})")]
    ResourceExhaustion {
        op: &'static str,
        result: vk::Result,
    },

    /// A fence wait exceeded the configured timeout; treated as a hung device.
    #[error("Fence wait timed out after {timeout_ms} ms")]
    FenceTimeout { timeout_ms: u64 },

    /// The driver rejected the swapchain configuration.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Any other Vulkan error.
    #[error("{op} failed: {result}")]
    Vulkan {
        op: &'static str,
        result: vk::Result,
    },

    /// The Vulkan loader could not be opened.
    #[error("Failed to load Vulkan: {0}")]
    Loader(String),

    /// Surface creation or query failed.
    #[error("Surface error: {0}")]
    Surface(String),

    /// Shader bytecode could not be read or turned into a module.
    #[error("Shader error: {0}")]
    Shader(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl GpuError {
    /// Classify a raw Vulkan result returned by `op`.
    pub fn vulkan(op: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost { op },
            vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_TOO_MANY_OBJECTS
            | vk::Result::ERROR_OUT_OF_POOL_MEMORY => Self::ResourceExhaustion { op, result },
            _ => Self::Vulkan { op, result },
        }
    }

    /// Returns a closure suitable for `map_err` that tags errors with `op`.
    pub fn during(op: &'static str) -> impl Fn(vk::Result) -> Self {
        move |result| Self::vulkan(op, result)
    }

    /// The failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::DeviceLost { .. } | Self::FenceTimeout { .. } => ErrorKind::DeviceLost,
            Self::ResourceExhaustion { .. } | Self::AllocationFailed(_) => {
                ErrorKind::ResourceExhaustion
            }
            _ => ErrorKind::Other,
        }
    }

    /// Whether the error is fatal for the whole process.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::DeviceLost | ErrorKind::Configuration)
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lost_is_classified() {
        let err = GpuError::vulkan("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(err, GpuError::DeviceLost { op: "vkQueueSubmit" }));
        assert_eq!(err.kind(), ErrorKind::DeviceLost);
        assert!(err.is_fatal());
    }

    #[test]
    fn memory_errors_are_exhaustion() {
        for result in [
            vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            vk::Result::ERROR_TOO_MANY_OBJECTS,
            vk::Result::ERROR_OUT_OF_POOL_MEMORY,
        ] {
            let err = GpuError::vulkan("vkAllocateCommandBuffers", result);
            assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
            assert!(!err.is_fatal());
        }
    }

    #[test]
    fn message_names_operation() {
        let err = GpuError::vulkan("vkCreateFramebuffer", vk::Result::ERROR_UNKNOWN);
        assert!(err.to_string().starts_with("vkCreateFramebuffer failed"));
        assert_eq!(err.kind(), ErrorKind::Other);
    }

    #[test]
    fn fence_timeout_counts_as_device_loss() {
        let err = GpuError::FenceTimeout { timeout_ms: 10_000 };
        assert_eq!(err.kind(), ErrorKind::DeviceLost);
    }
}
