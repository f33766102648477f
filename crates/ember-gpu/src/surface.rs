//! Surface management for windowed rendering.
//!
//! Hides the raw-window-handle plumbing from the rest of the crate.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::error::{GpuError, Result};

/// The window surface and its extension loader.
pub struct SurfaceContext {
    /// The Vulkan surface handle.
    pub surface: vk::SurfaceKHR,
    /// Surface extension loader.
    pub surface_loader: ash::khr::surface::Instance,
}

impl SurfaceContext {
    /// Create a surface for `window`.
    ///
    /// # Safety
    /// The instance must be valid and outlive the surface; the window must
    /// have valid handles.
    pub unsafe fn from_window<W>(
        entry: &ash::Entry,
        instance: &ash::Instance,
        window: &W,
    ) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::Surface(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::Surface(format!("Failed to get window handle: {e}")))?;

        let surface = ash_window::create_surface(
            entry,
            instance,
            display.as_raw(),
            window_handle.as_raw(),
            None,
        )
        .map_err(|e| GpuError::Surface(e.to_string()))?;

        let surface_loader = ash::khr::surface::Instance::new(entry, instance);

        Ok(Self {
            surface,
            surface_loader,
        })
    }

    /// Query what the surface supports on `physical_device`.
    pub fn support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        unsafe {
            let capabilities = self
                .surface_loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
                .map_err(GpuError::during("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))?;

            let formats = self
                .surface_loader
                .get_physical_device_surface_formats(physical_device, self.surface)
                .map_err(GpuError::during("vkGetPhysicalDeviceSurfaceFormatsKHR"))?;

            let present_modes = self
                .surface_loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
                .map_err(GpuError::during("vkGetPhysicalDeviceSurfacePresentModesKHR"))?;

            Ok(SurfaceSupport {
                capabilities,
                formats,
                present_modes,
            })
        }
    }

    /// Whether queue family `family` can present to this surface.
    ///
    /// # Safety
    /// The physical device must be valid.
    pub unsafe fn supports_present(
        &self,
        physical_device: vk::PhysicalDevice,
        family: u32,
    ) -> Result<bool> {
        self.surface_loader
            .get_physical_device_surface_support(physical_device, family, self.surface)
            .map_err(GpuError::during("vkGetPhysicalDeviceSurfaceSupportKHR"))
    }

    /// Destroy the surface. Calling this again is a no-op.
    ///
    /// # Safety
    /// The surface must not be in use by a swapchain.
    pub unsafe fn destroy(&mut self) {
        if self.surface != vk::SurfaceKHR::null() {
            self.surface_loader.destroy_surface(self.surface, None);
            self.surface = vk::SurfaceKHR::null();
        }
    }
}

/// Surface capabilities query result.
pub struct SurfaceSupport {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    /// Whether a swapchain can be built at all.
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn support(current: vk::Extent2D, formats: usize, modes: usize) -> SurfaceSupport {
        SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                current_extent: current,
                ..Default::default()
            },
            formats: vec![vk::SurfaceFormatKHR::default(); formats],
            present_modes: vec![vk::PresentModeKHR::FIFO; modes],
        }
    }

    #[test]
    fn adequacy_needs_formats_and_modes() {
        let size = vk::Extent2D {
            width: 640,
            height: 480,
        };
        assert!(support(size, 1, 1).is_adequate());
        assert!(!support(size, 0, 1).is_adequate());
        assert!(!support(size, 2, 0).is_adequate());
    }
}
