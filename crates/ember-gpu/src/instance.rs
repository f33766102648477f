//! Vulkan instance creation, validation layers and physical device selection.

use std::ffi::{c_char, c_void, CStr, CString};

use ash::vk;
use raw_window_handle::RawDisplayHandle;

use crate::context::QueueFamilyIndices;
use crate::error::{GpuError, Result};
use crate::surface::SurfaceContext;

/// Validation layers to enable when validation is requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Required device extensions.
pub fn required_device_extensions() -> Vec<&'static CStr> {
    vec![ash::khr::swapchain::NAME]
}

/// Instance extensions needed to present to `display` (plus debug utils
/// when validating).
pub fn required_instance_extensions(
    display: RawDisplayHandle,
    enable_validation: bool,
) -> Result<Vec<*const c_char>> {
    let mut extensions = ash_window::enumerate_required_extensions(display)
        .map_err(|e| GpuError::Surface(format!("unsupported display: {e}")))?
        .to_vec();

    #[cfg(target_os = "macos")]
    {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
        extensions.push(ash::khr::get_physical_device_properties2::NAME.as_ptr());
    }

    if enable_validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    Ok(extensions)
}

/// Create a Vulkan instance.
///
/// Returns the instance and whether validation ended up enabled; a missing
/// validation layer is logged and skipped rather than treated as fatal.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    display: RawDisplayHandle,
    enable_validation: bool,
) -> Result<(ash::Instance, bool)> {
    let app_name = CString::new(app_name)
        .map_err(|_| GpuError::Configuration("application name contains NUL".to_string()))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Ember")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_1);

    let layers = if enable_validation {
        let available_layers = entry
            .enumerate_instance_layer_properties()
            .map_err(GpuError::during("vkEnumerateInstanceLayerProperties"))?;
        validation_layers()
            .into_iter()
            .filter(|layer| {
                let found = available_layers.iter().any(|props| {
                    CStr::from_ptr(props.layer_name.as_ptr()) == *layer
                });
                if !found {
                    tracing::warn!("Validation layer {:?} not available", layer);
                }
                found
            })
            .collect()
    } else {
        vec![]
    };
    let validation = !layers.is_empty();

    let extension_names = required_instance_extensions(display, validation)?;
    let layer_names: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    // Chained so instance creation and destruction are covered too.
    let mut debug_info = debug_messenger_info();

    let mut create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);
    if validation {
        create_info = create_info.push_next(&mut debug_info);
    }

    let instance = entry
        .create_instance(&create_info, None)
        .map_err(GpuError::during("vkCreateInstance"))?;

    Ok((instance, validation))
}

fn debug_messenger_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", "[{:?}] {}", message_type, message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vulkan", "[{:?}] {}", message_type, message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        tracing::debug!(target: "vulkan", "[{:?}] {}", message_type, message);
    } else {
        tracing::trace!(target: "vulkan", "[{:?}] {}", message_type, message);
    }

    vk::FALSE
}

/// Validation message forwarder.
pub struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    /// Install the messenger on `instance`.
    ///
    /// # Safety
    /// The instance must have been created with the debug utils extension.
    pub unsafe fn new(entry: &ash::Entry, instance: &ash::Instance) -> Result<Self> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let messenger = loader
            .create_debug_utils_messenger(&debug_messenger_info(), None)
            .map_err(GpuError::during("vkCreateDebugUtilsMessengerEXT"))?;
        Ok(Self { loader, messenger })
    }

    /// Remove the messenger. Calling this again is a no-op.
    ///
    /// # Safety
    /// Must happen before the instance is destroyed.
    pub unsafe fn destroy(&mut self) {
        if self.messenger != vk::DebugUtilsMessengerEXT::null() {
            self.loader
                .destroy_debug_utils_messenger(self.messenger, None);
            self.messenger = vk::DebugUtilsMessengerEXT::null();
        }
    }
}

/// Select the best physical device able to render to and present on `surface`.
///
/// # Safety
/// The instance and surface must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    surface: &SurfaceContext,
) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
    let devices = instance
        .enumerate_physical_devices()
        .map_err(GpuError::during("vkEnumeratePhysicalDevices"))?;

    if devices.is_empty() {
        return Err(GpuError::Configuration(
            "no GPU with Vulkan support found".to_string(),
        ));
    }

    let mut best = None;
    let mut best_score = i32::MIN;

    for device in devices {
        let properties = instance.get_physical_device_properties(device);
        let name = CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy();

        let Some(families) = find_queue_families(instance, device, surface)? else {
            tracing::debug!("Skipping {}: missing graphics or present queue", name);
            continue;
        };
        if !supports_device_extensions(instance, device)? {
            tracing::debug!("Skipping {}: swapchain extension unsupported", name);
            continue;
        }
        if !surface.support(device)?.is_adequate() {
            tracing::debug!("Skipping {}: no surface formats or present modes", name);
            continue;
        }

        let score = score_physical_device(instance, device);
        if score > best_score {
            best_score = score;
            best = Some((device, families));
        }
    }

    best.ok_or_else(|| {
        GpuError::Configuration("no GPU can render to and present on this surface".to_string())
    })
}

/// Find graphics and presentation queue families, preferring one family that
/// does both.
///
/// # Safety
/// The instance, physical device and surface must be valid.
pub unsafe fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface: &SurfaceContext,
) -> Result<Option<QueueFamilyIndices>> {
    let queue_families = instance.get_physical_device_queue_family_properties(physical_device);

    let mut graphics = None;
    let mut present = None;

    for (i, family) in queue_families.iter().enumerate() {
        let i = i as u32;
        let is_graphics =
            family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let can_present = surface.supports_present(physical_device, i)?;

        if is_graphics && can_present {
            return Ok(Some(QueueFamilyIndices {
                graphics: i,
                present: i,
            }));
        }
        if is_graphics && graphics.is_none() {
            graphics = Some(i);
        }
        if can_present && present.is_none() {
            present = Some(i);
        }
    }

    Ok(graphics
        .zip(present)
        .map(|(graphics, present)| QueueFamilyIndices { graphics, present }))
}

unsafe fn supports_device_extensions(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<bool> {
    let available = instance
        .enumerate_device_extension_properties(physical_device)
        .map_err(GpuError::during("vkEnumerateDeviceExtensionProperties"))?;

    Ok(required_device_extensions().iter().all(|required| {
        available
            .iter()
            .any(|props| CStr::from_ptr(props.extension_name.as_ptr()) == *required)
    }))
}

/// Score a physical device for selection.
unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i32 {
    let properties = instance.get_physical_device_properties(device);
    let features = instance.get_physical_device_features(device);

    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    };

    if features.geometry_shader == vk::TRUE {
        score += 10;
    }

    score
}
