//! Synchronization primitives and the per-frame-slot pool.

use std::time::Duration;

use ash::vk;

use crate::error::{GpuError, Result};

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    device
        .create_semaphore(&create_info, None)
        .map_err(GpuError::during("vkCreateSemaphore"))
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    device
        .create_fence(&create_info, None)
        .map_err(GpuError::during("vkCreateFence"))
}

/// Wait for a fence to be signaled.
///
/// A timeout is reported as [`GpuError::FenceTimeout`].
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn wait_for_fence(
    device: &ash::Device,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<()> {
    match device.wait_for_fences(&[fence], true, timeout_ns) {
        Ok(()) => Ok(()),
        Err(vk::Result::TIMEOUT) => Err(GpuError::FenceTimeout {
            timeout_ms: timeout_ns / 1_000_000,
        }),
        Err(e) => Err(GpuError::vulkan("vkWaitForFences", e)),
    }
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device
        .reset_fences(&[fence])
        .map_err(GpuError::during("vkResetFences"))
}

/// Index of a frame-in-flight slot, in `[0, frames_in_flight)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameSlot(usize);

impl FrameSlot {
    /// The slot used by frame `frame_counter` with `slot_count` slots.
    pub fn for_frame(frame_counter: u64, slot_count: usize) -> Self {
        debug_assert!(slot_count > 0);
        Self((frame_counter % slot_count as u64) as usize)
    }

    /// The raw slot index.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Synchronization objects owned by one frame slot.
pub struct FrameSync {
    /// Semaphore signaled when the acquired image is ready to be written.
    pub image_available: vk::Semaphore,
    /// Semaphore signaled when rendering is complete, waited on by present.
    pub render_finished: vk::Semaphore,
    /// Fence signaled when the slot's last submission finished on the GPU.
    pub in_flight: vk::Fence,
}

impl FrameSync {
    /// Create frame synchronization resources. The fence starts signaled.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        let image_available = create_semaphore(device)?;
        let render_finished = match create_semaphore(device) {
            Ok(s) => s,
            Err(e) => {
                device.destroy_semaphore(image_available, None);
                return Err(e);
            }
        };
        let in_flight = match create_fence(device, true) {
            Ok(f) => f,
            Err(e) => {
                device.destroy_semaphore(image_available, None);
                device.destroy_semaphore(render_finished, None);
                return Err(e);
            }
        };

        Ok(Self {
            image_available,
            render_finished,
            in_flight,
        })
    }

    /// Destroy synchronization resources.
    ///
    /// # Safety
    /// The device must be valid and resources must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.image_available, None);
        device.destroy_semaphore(self.render_finished, None);
        device.destroy_fence(self.in_flight, None);
    }
}

/// Fences and semaphores for every frame slot.
///
/// Created once at startup and kept across swapchain rebuilds.
pub struct SyncPool {
    frames: Vec<FrameSync>,
    timeout_ns: u64,
}

impl SyncPool {
    /// Create a pool with `frames_in_flight` slots.
    ///
    /// Fence waits that exceed `fence_timeout` fail with
    /// [`GpuError::FenceTimeout`].
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        frames_in_flight: usize,
        fence_timeout: Duration,
    ) -> Result<Self> {
        if frames_in_flight == 0 {
            return Err(GpuError::Configuration(
                "at least one frame in flight is required".to_string(),
            ));
        }

        let mut pool = Self {
            frames: Vec::with_capacity(frames_in_flight),
            timeout_ns: u64::try_from(fence_timeout.as_nanos()).unwrap_or(u64::MAX),
        };
        for _ in 0..frames_in_flight {
            match FrameSync::new(device) {
                Ok(sync) => pool.frames.push(sync),
                Err(e) => {
                    pool.destroy(device);
                    return Err(e);
                }
            }
        }

        tracing::debug!("Created sync pool with {} slots", frames_in_flight);
        Ok(pool)
    }

    /// Number of frame slots.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the pool has been destroyed.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Synchronization objects of `slot`.
    pub fn get(&self, slot: FrameSlot) -> &FrameSync {
        &self.frames[slot.index()]
    }

    /// Block until the slot's fence is signaled.
    ///
    /// # Safety
    /// The device must be valid.
    #[cfg_attr(feature = "profiling", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn wait(&self, device: &ash::Device, slot: FrameSlot) -> Result<()> {
        wait_for_fence(device, self.get(slot).in_flight, self.timeout_ns)
    }

    /// Reset the slot's fence to unsignaled.
    ///
    /// # Safety
    /// The device must be valid and the fence must not be pending.
    pub unsafe fn reset(&self, device: &ash::Device, slot: FrameSlot) -> Result<()> {
        reset_fence(device, self.get(slot).in_flight)
    }

    /// Destroy all resources. Calling this again is a no-op.
    ///
    /// # Safety
    /// The device must be valid and all resources must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for sync in self.frames.drain(..) {
            sync.destroy(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_wraps_modulo_frames_in_flight() {
        let slots: Vec<usize> = (0..7).map(|n| FrameSlot::for_frame(n, 3).index()).collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn slot_with_single_frame_in_flight() {
        assert_eq!(FrameSlot::for_frame(41, 1).index(), 0);
    }

    #[test]
    fn slot_handles_large_counters() {
        assert_eq!(FrameSlot::for_frame(u64::MAX, 2).index(), 1);
    }
}
