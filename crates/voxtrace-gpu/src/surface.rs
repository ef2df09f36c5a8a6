//! Swapchain management for the window surface.

use crate::backend::{AcquireOutcome, PresentOutcome};
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::swapchain::{
    calculate_extent, select_image_count, select_present_mode, select_surface_format, Swapchain,
    SwapchainRequest, SWAPCHAIN_IMAGE_USAGE,
};
use ash::vk;

/// Surface capabilities query result.
pub struct SurfaceCapabilities {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Swapchain loader bound to the context's surface.
pub struct SurfaceContext {
    pub swapchain_loader: ash::khr::swapchain::Device,
}

impl SurfaceContext {
    pub fn new(gpu: &GpuContext) -> Self {
        Self {
            swapchain_loader: ash::khr::swapchain::Device::new(gpu.instance(), gpu.device()),
        }
    }

    /// Query surface capabilities.
    pub fn capabilities(&self, gpu: &GpuContext) -> Result<SurfaceCapabilities> {
        let loader = gpu.surface_loader();
        unsafe {
            let capabilities = loader
                .get_physical_device_surface_capabilities(gpu.physical_device(), gpu.surface())?;
            let formats =
                loader.get_physical_device_surface_formats(gpu.physical_device(), gpu.surface())?;
            let present_modes = loader
                .get_physical_device_surface_present_modes(gpu.physical_device(), gpu.surface())?;

            Ok(SurfaceCapabilities {
                capabilities,
                formats,
                present_modes,
            })
        }
    }

    /// Create a swapchain, handing `old` to the driver.
    ///
    /// # Safety
    /// The GPU context must be valid and `old` must belong to its surface.
    pub unsafe fn create_swapchain(
        &self,
        gpu: &GpuContext,
        request: &SwapchainRequest,
        old: Option<&Swapchain>,
    ) -> Result<Swapchain> {
        let caps = self.capabilities(gpu)?;

        let surface_format = select_surface_format(&caps.formats)
            .ok_or_else(|| GpuError::SwapchainCreation("surface reports no formats".to_string()))?;
        let present_mode = select_present_mode(&caps.present_modes, request.vsync);
        let extent = calculate_extent(&caps.capabilities, request.width, request.height);
        let image_count = select_image_count(&caps.capabilities, request.preferred_image_count);

        if !caps.capabilities.supported_usage_flags.contains(SWAPCHAIN_IMAGE_USAGE) {
            return Err(GpuError::SwapchainCreation(
                "surface images cannot be used as storage images".to_string(),
            ));
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(gpu.surface())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(SWAPCHAIN_IMAGE_USAGE)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |old| old.swapchain));

        let swapchain = self
            .swapchain_loader
            .create_swapchain(&create_info, None)
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let images = match self.swapchain_loader.get_swapchain_images(swapchain) {
            Ok(images) => images,
            Err(e) => {
                self.swapchain_loader.destroy_swapchain(swapchain, None);
                return Err(e.into());
            }
        };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(color_subresource_range());

            match gpu.device().create_image_view(&view_info, None) {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    for view in image_views {
                        gpu.device().destroy_image_view(view, None);
                    }
                    self.swapchain_loader.destroy_swapchain(swapchain, None);
                    return Err(e.into());
                }
            }
        }

        tracing::info!(
            "Created swapchain {}x{} with {} images ({:?}, {:?})",
            extent.width,
            extent.height,
            images.len(),
            surface_format.format,
            present_mode
        );

        Ok(Swapchain {
            swapchain,
            images,
            image_views,
            format: surface_format.format,
            extent,
        })
    }

    /// Destroy the swapchain and its image views.
    ///
    /// # Safety
    /// The swapchain must not be in use.
    pub unsafe fn destroy_swapchain(&self, gpu: &GpuContext, swapchain: Swapchain) {
        for view in swapchain.image_views {
            gpu.device().destroy_image_view(view, None);
        }
        self.swapchain_loader.destroy_swapchain(swapchain.swapchain, None);
    }

    /// Acquire the next image.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn acquire_next_image(
        &self,
        swapchain: &Swapchain,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquireOutcome> {
        let result = self.swapchain_loader.acquire_next_image(
            swapchain.swapchain,
            timeout_ns,
            semaphore,
            vk::Fence::null(),
        );

        match result {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            // No image was acquired and the semaphore stays unsignaled.
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Present an image.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn present(
        &self,
        queue: vk::Queue,
        swapchain: &Swapchain,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let swapchains = [swapchain.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match self.swapchain_loader.queue_present(queue, &present_info) {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(GpuError::from(e)),
        }
    }
}

/// Whole-image colour subresource range.
pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}
