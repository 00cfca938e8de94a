//! Swapchain negotiation

use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::vk;

use super::conversion::{format_from_vk, format_to_vk, present_mode_to_vk};
use crate::render::api::{Extent2D, SwapchainRequest};
use crate::render::{RenderError, RenderResult};

/// Live swapchain and its images
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
}

impl Swapchain {
    /// Create a swapchain, retiring `old` if it is not null
    pub fn new(
        loader: &SwapchainLoader,
        surface_loader: &Surface,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        request: &SwapchainRequest,
        old: vk::SwapchainKHR,
    ) -> RenderResult<Self> {
        let surface_caps =
            unsafe { surface_loader.get_physical_device_surface_capabilities(physical_device, surface)? };
        let surface_formats =
            unsafe { surface_loader.get_physical_device_surface_formats(physical_device, surface)? };
        let present_modes =
            unsafe { surface_loader.get_physical_device_surface_present_modes(physical_device, surface)? };

        let preferred = format_to_vk(request.preferred_format);
        let format = surface_formats
            .iter()
            .find(|sf| sf.format == preferred && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .or_else(|| surface_formats.iter().find(|sf| format_from_vk(sf.format).is_some()))
            .copied()
            .ok_or_else(|| RenderError::InitializationFailed("surface exposes no usable format".to_string()))?;

        let wanted_mode = present_mode_to_vk(request.present_mode);
        let present_mode = if present_modes.contains(&wanted_mode) {
            wanted_mode
        } else {
            vk::PresentModeKHR::FIFO
        };

        let extent = if surface_caps.current_extent.width == u32::MAX {
            vk::Extent2D {
                width: request
                    .extent
                    .width
                    .clamp(surface_caps.min_image_extent.width, surface_caps.max_image_extent.width),
                height: request
                    .extent
                    .height
                    .clamp(surface_caps.min_image_extent.height, surface_caps.max_image_extent.height),
            }
        } else {
            surface_caps.current_extent
        };
        if extent.width == 0 || extent.height == 0 {
            return Err(RenderError::SurfaceOutOfDate);
        }

        let image_count = if surface_caps.max_image_count > 0 {
            (surface_caps.min_image_count + 1).min(surface_caps.max_image_count)
        } else {
            surface_caps.min_image_count + 1
        };

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        let handle = unsafe { loader.create_swapchain(&create_info, None)? };
        let images = unsafe { loader.get_swapchain_images(handle)? };

        log::info!(
            "Swapchain created: {}x{} {:?} {:?}, {} images",
            extent.width,
            extent.height,
            format.format,
            present_mode,
            images.len()
        );
        Ok(Self {
            handle,
            images,
            format,
            extent,
            present_mode,
        })
    }

    /// Extent in core terms
    pub fn extent(&self) -> Extent2D {
        Extent2D::new(self.extent.width, self.extent.height)
    }
}
