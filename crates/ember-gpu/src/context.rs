//! GPU context management.
//!
//! [`GpuContext`] bundles everything that outlives the swapchain: instance,
//! validation messenger, window surface, logical device, queues and the
//! memory allocator. Dropping it releases them as logical device, surface,
//! instance.

use std::collections::HashSet;
use std::ffi::{c_char, CStr};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::error::{GpuError, Result};
use crate::instance::{
    create_instance, required_device_extensions, select_physical_device, DebugMessenger,
};
use crate::memory::GpuAllocator;
use crate::surface::{SurfaceContext, SurfaceSupport};

/// Graphics and presentation queue family indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    /// Whether one family serves both roles.
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// The distinct family indices.
    pub fn unique(&self) -> Vec<u32> {
        let mut families: Vec<u32> = [self.graphics, self.present]
            .into_iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        families.sort_unstable();
        families
    }
}

/// Instance-level objects, released surface first, instance last.
struct InstanceObjects {
    // Entry must be kept alive for the lifetime of the instance
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<DebugMessenger>,
    surface: SurfaceContext,
}

impl Drop for InstanceObjects {
    fn drop(&mut self) {
        unsafe {
            self.surface.destroy();
            if let Some(debug) = &mut self.debug {
                debug.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    physical_device: vk::PhysicalDevice,
    device_name: String,
    device: Arc<ash::Device>,
    allocator: Mutex<GpuAllocator>,
    swapchain_loader: ash::khr::swapchain::Device,
    queue_families: QueueFamilyIndices,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    // Declared last so it is dropped after the device.
    objects: InstanceObjects,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Name reported by the driver for the selected GPU.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// The window surface.
    pub fn surface(&self) -> &SurfaceContext {
        &self.objects.surface
    }

    /// Query current surface support on the selected GPU.
    pub fn surface_support(&self) -> Result<SurfaceSupport> {
        self.objects.surface.support(self.physical_device)
    }

    /// Swapchain extension loader.
    pub fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    /// Queue family indices.
    pub fn queue_families(&self) -> QueueFamilyIndices {
        self.queue_families
    }

    /// Get the graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the presentation queue.
    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device
                .device_wait_idle()
                .map_err(GpuError::during("vkDeviceWaitIdle"))
        }
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Frees all VkDeviceMemory before the device goes away
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
        }
        tracing::debug!("Logical device destroyed");
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Ember".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the GPU context for rendering into `window`.
    ///
    /// # Safety
    /// The window must outlive the context.
    pub unsafe fn build<W>(self, window: &W) -> Result<GpuContext>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let entry = ash::Entry::load().map_err(|e| GpuError::Loader(e.to_string()))?;

        let display = window
            .display_handle()
            .map_err(|e| GpuError::Surface(format!("Failed to get display handle: {e}")))?;

        let (instance, validation) =
            create_instance(&entry, &self.app_name, display.as_raw(), self.enable_validation)?;

        // From here on, dropping `objects` releases everything created so far.
        let debug = if validation {
            match DebugMessenger::new(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    tracing::warn!("Validation messenger unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };
        let surface = match SurfaceContext::from_window(&entry, &instance, window) {
            Ok(surface) => surface,
            Err(e) => {
                if let Some(mut debug) = debug {
                    debug.destroy();
                }
                instance.destroy_instance(None);
                return Err(e);
            }
        };
        let objects = InstanceObjects {
            entry,
            instance,
            debug,
            surface,
        };

        let (physical_device, queue_families) =
            select_physical_device(&objects.instance, &objects.surface)?;

        let properties = objects
            .instance
            .get_physical_device_properties(physical_device);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();
        tracing::info!(
            "Selected GPU: {} (graphics family {}, present family {})",
            device_name,
            queue_families.graphics,
            queue_families.present
        );

        let device = create_device(&objects.instance, physical_device, &queue_families)?;
        let graphics_queue = device.get_device_queue(queue_families.graphics, 0);
        let present_queue = device.get_device_queue(queue_families.present, 0);
        let device = Arc::new(device);

        let allocator = match GpuAllocator::new(&objects.instance, device.clone(), physical_device)
        {
            Ok(allocator) => allocator,
            Err(e) => {
                device.destroy_device(None);
                return Err(e);
            }
        };

        let swapchain_loader = ash::khr::swapchain::Device::new(&objects.instance, &device);

        Ok(GpuContext {
            physical_device,
            device_name,
            device,
            allocator: Mutex::new(allocator),
            swapchain_loader,
            queue_families,
            graphics_queue,
            present_queue,
            objects,
        })
    }
}

/// Create the logical device with one queue per unique family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_families: &QueueFamilyIndices,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extension_names: Vec<*const c_char> = required_device_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let features = vk::PhysicalDeviceFeatures::default();

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::during("vkCreateDevice"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_family_has_one_unique_entry() {
        let families = QueueFamilyIndices {
            graphics: 0,
            present: 0,
        };
        assert!(families.is_shared());
        assert_eq!(families.unique(), vec![0]);
    }

    #[test]
    fn split_families_are_both_listed() {
        let families = QueueFamilyIndices {
            graphics: 2,
            present: 1,
        };
        assert!(!families.is_shared());
        assert_eq!(families.unique(), vec![1, 2]);
    }
}
