//! Swapchain management.
//!
//! [`Swapchain`] is the resource set rendered into each frame: the swapchain
//! handle plus one image view and one framebuffer per presentable image. The
//! whole set is built and torn down as a unit; everything outside refers to
//! its images by index.

use ash::vk;

use crate::context::QueueFamilyIndices;
use crate::error::{GpuError, Result};
use crate::surface::SurfaceSupport;

/// Surface formats accepted as preferred, in order of preference.
pub const PREFERRED_FORMATS: [vk::Format; 2] =
    [vk::Format::B8G8R8A8_SRGB, vk::Format::B8G8R8A8_UNORM];

/// Colour space required of a preferred format.
pub const PREFERRED_COLOR_SPACE: vk::ColorSpaceKHR = vk::ColorSpaceKHR::SRGB_NONLINEAR;

/// Result of asking the swapchain for its next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image was acquired. `suboptimal` means presentation still works
    /// but the swapchain should be rebuilt.
    Acquired { image_index: u32, suboptimal: bool },
    /// No image was acquired; the swapchain must be rebuilt first.
    OutOfDate,
}

/// Result of presenting an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

impl PresentOutcome {
    /// Whether the swapchain should be rebuilt after this present.
    pub fn needs_rebuild(self) -> bool {
        !matches!(self, Self::Presented)
    }
}

/// Objects derived from one presentable image.
#[derive(Debug, Clone, Copy)]
struct SwapchainImage {
    view: vk::ImageView,
    framebuffer: vk::Framebuffer,
}

/// Swapchain resource set.
pub struct Swapchain {
    handle: vk::SwapchainKHR,
    images: Vec<SwapchainImage>,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create the swapchain and one image view per image.
    ///
    /// Framebuffers are attached afterwards with
    /// [`create_framebuffers`](Self::create_framebuffers) once a render pass
    /// compatible with [`format`](Self::format) exists.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        support: &SurfaceSupport,
        desired_extent: vk::Extent2D,
        vsync: bool,
        queue_families: &QueueFamilyIndices,
    ) -> Result<Self> {
        let caps = &support.capabilities;
        let surface_format = select_surface_format(&support.formats)?;
        let present_mode = select_present_mode(&support.present_modes, vsync);
        let extent = calculate_extent(caps, desired_extent.width, desired_extent.height);
        let image_count = select_image_count(caps);

        let family_indices = [queue_families.graphics, queue_families.present];
        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        create_info = if queue_families.is_shared() {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        };

        let handle = swapchain_loader
            .create_swapchain(&create_info, None)
            .map_err(swapchain_creation_error)?;

        let mut swapchain = Self {
            handle,
            images: Vec::new(),
            format: surface_format,
            present_mode,
            extent,
        };

        if let Err(e) = swapchain.create_image_views(device, swapchain_loader) {
            swapchain.teardown(device, swapchain_loader);
            return Err(e);
        }

        tracing::debug!(
            "Swapchain built: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            swapchain.images.len(),
            surface_format.format,
            present_mode
        );

        Ok(swapchain)
    }

    unsafe fn create_image_views(
        &mut self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) -> Result<()> {
        let images = swapchain_loader
            .get_swapchain_images(self.handle)
            .map_err(GpuError::during("vkGetSwapchainImagesKHR"))?;

        self.images.reserve(images.len());
        for image in images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                );

            let view = device
                .create_image_view(&view_info, None)
                .map_err(GpuError::during("vkCreateImageView"))?;

            self.images.push(SwapchainImage {
                view,
                framebuffer: vk::Framebuffer::null(),
            });
        }

        Ok(())
    }

    /// Create one framebuffer per image for `render_pass`.
    ///
    /// On failure the framebuffers created so far are left in place and are
    /// released by [`teardown`](Self::teardown).
    ///
    /// # Safety
    /// The device and render pass must be valid.
    pub unsafe fn create_framebuffers(
        &mut self,
        device: &ash::Device,
        render_pass: vk::RenderPass,
    ) -> Result<()> {
        for entry in &mut self.images {
            if entry.framebuffer != vk::Framebuffer::null() {
                continue;
            }
            let attachments = [entry.view];
            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);

            entry.framebuffer = device
                .create_framebuffer(&framebuffer_info, None)
                .map_err(GpuError::during("vkCreateFramebuffer"))?;
        }
        Ok(())
    }

    /// Number of presentable images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Framebuffers in image-index order.
    pub fn framebuffers(&self) -> Vec<vk::Framebuffer> {
        self.images.iter().map(|i| i.framebuffer).collect()
    }

    /// Acquire the next image, signaling `semaphore` when it is ready.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(
        feature = "profiling",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn acquire_next(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquireOutcome> {
        let result = swapchain_loader.acquire_next_image(
            self.handle,
            timeout_ns,
            semaphore,
            vk::Fence::null(),
        );

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(GpuError::vulkan("vkAcquireNextImageKHR", e)),
        }
    }

    /// Present an image after `wait_semaphore` is signaled.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(
        feature = "profiling",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn present(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let swapchains = [self.handle];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match swapchain_loader.queue_present(queue, &present_info) {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(GpuError::vulkan("vkQueuePresentKHR", e)),
        }
    }

    /// Destroy every framebuffer. Calling this again is a no-op.
    ///
    /// # Safety
    /// The framebuffers must not be in use.
    pub unsafe fn destroy_framebuffers(&mut self, device: &ash::Device) {
        for framebuffer in self.take_framebuffers() {
            device.destroy_framebuffer(framebuffer, None);
        }
    }

    /// Destroy every image view. Calling this again is a no-op.
    ///
    /// # Safety
    /// The views must not be in use and their framebuffers must be gone.
    pub unsafe fn destroy_image_views(&mut self, device: &ash::Device) {
        for view in self.take_image_views() {
            device.destroy_image_view(view, None);
        }
    }

    /// Destroy the swapchain handle and forget its images.
    ///
    /// # Safety
    /// The swapchain must not be in use and its views must be gone.
    pub unsafe fn destroy_swapchain(&mut self, swapchain_loader: &ash::khr::swapchain::Device) {
        if let Some(handle) = self.take_handle() {
            swapchain_loader.destroy_swapchain(handle, None);
        }
    }

    /// Live framebuffers, nulled in place so each is handed out once.
    fn take_framebuffers(&mut self) -> Vec<vk::Framebuffer> {
        self.images
            .iter_mut()
            .map(|entry| std::mem::replace(&mut entry.framebuffer, vk::Framebuffer::null()))
            .filter(|&framebuffer| framebuffer != vk::Framebuffer::null())
            .collect()
    }

    /// Live image views, nulled in place so each is handed out once.
    fn take_image_views(&mut self) -> Vec<vk::ImageView> {
        self.images
            .iter_mut()
            .map(|entry| std::mem::replace(&mut entry.view, vk::ImageView::null()))
            .filter(|&view| view != vk::ImageView::null())
            .collect()
    }

    /// The swapchain handle if still live. Forgets the images either way.
    fn take_handle(&mut self) -> Option<vk::SwapchainKHR> {
        self.images.clear();
        let handle = std::mem::replace(&mut self.handle, vk::SwapchainKHR::null());
        (handle != vk::SwapchainKHR::null()).then_some(handle)
    }

    /// Destroy framebuffers, image views and the swapchain, in that order.
    ///
    /// Safe on a partially built set and safe to call repeatedly.
    ///
    /// # Safety
    /// No submitted work may still reference the set.
    pub unsafe fn teardown(
        &mut self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) {
        self.destroy_framebuffers(device);
        self.destroy_image_views(device);
        self.destroy_swapchain(swapchain_loader);
    }
}

/// Map a `vkCreateSwapchainKHR` failure.
///
/// Device loss and exhaustion keep their class so the frame loop can react
/// to them; any other rejection, such as a lost surface, is a
/// [`GpuError::SwapchainCreation`].
fn swapchain_creation_error(result: vk::Result) -> GpuError {
    match GpuError::vulkan("vkCreateSwapchainKHR", result) {
        GpuError::Vulkan { op, result } => GpuError::SwapchainCreation(format!("{op}: {result}")),
        classified => classified,
    }
}

/// Select the surface format.
///
/// Prefers an entry from [`PREFERRED_FORMATS`] in [`PREFERRED_COLOR_SPACE`],
/// comparing both the format and the colour space. Falls back to the first
/// reported entry.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    for preferred in PREFERRED_FORMATS {
        if let Some(format) = available
            .iter()
            .find(|f| f.format == preferred && f.color_space == PREFERRED_COLOR_SPACE)
        {
            return Ok(*format);
        }
    }

    // A single UNDEFINED entry means the surface accepts anything.
    match available {
        [only] if only.format == vk::Format::UNDEFINED => Ok(vk::SurfaceFormatKHR {
            format: PREFERRED_FORMATS[0],
            color_space: PREFERRED_COLOR_SPACE,
        }),
        [first, ..] => Ok(*first),
        [] => Err(GpuError::Configuration(
            "surface reports no formats".to_string(),
        )),
    }
}

/// Select the present mode.
///
/// With `vsync` the result is always FIFO. Otherwise MAILBOX is preferred
/// and FIFO, which every surface supports, is the fallback.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if !vsync && available.contains(&vk::PresentModeKHR::MAILBOX) {
        return vk::PresentModeKHR::MAILBOX;
    }
    vk::PresentModeKHR::FIFO
}

/// Calculate swapchain extent.
///
/// A current extent of `u32::MAX` means the surface takes its size from the
/// swapchain, so the desired size is clamped to the supported range.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more image than the minimum, capped by the maximum (0 = unbounded).
pub fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && image_count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        image_count
    }
}
