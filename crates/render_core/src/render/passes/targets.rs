//! Surface-dependent images
//!
//! The swapchain plus, per swapchain image, the forward color and depth
//! attachments. Everything here is recreated at the new extent on resize.

use crate::render::api::{
    Extent2D, Format, GpuBackend, ImageAspect, ImageLayout, ImageUsage, ImageViewDesc, MemoryLocality, PresentMode,
    QueueKind, RawImage, RawImageView, SwapchainRequest,
};
use crate::render::resources::ImageHandle;
use crate::render::{RenderDevice, RenderResult};

/// Format of the offscreen forward color target
pub const FORWARD_COLOR_FORMAT: Format = Format::B8G8R8A8Unorm;

/// An arena image with its raw handles cached for recording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    /// Arena handle
    pub handle: ImageHandle,
    /// Backend image
    pub image: RawImage,
    /// Default view
    pub view: RawImageView,
}

/// Swapchain and per-image attachments at one extent
#[derive(Debug)]
pub struct SurfaceTargets {
    format: Format,
    extent: Extent2D,
    present_mode: PresentMode,
    depth_format: Format,
    swapchain_images: Vec<RawImage>,
    swapchain_views: Vec<RawImageView>,
    color: Vec<Attachment>,
    depth: Vec<Attachment>,
}

impl SurfaceTargets {
    /// Create (or recreate) the swapchain and its attachments
    pub fn create<B: GpuBackend>(
        device: &mut RenderDevice<B>,
        request: &SwapchainRequest,
        depth_format: Format,
    ) -> RenderResult<Self> {
        let info = device.backend.create_swapchain(request)?;
        let mut targets = Self {
            format: info.format,
            extent: info.extent,
            present_mode: info.present_mode,
            depth_format,
            swapchain_images: info.images,
            swapchain_views: Vec::new(),
            color: Vec::new(),
            depth: Vec::new(),
        };
        if let Err(err) = targets.create_attachments(device) {
            targets.release(device);
            return Err(err);
        }
        log::info!(
            "Surface targets at {}x{} ({} images, {:?})",
            targets.extent.width,
            targets.extent.height,
            targets.swapchain_images.len(),
            targets.present_mode
        );
        Ok(targets)
    }

    fn create_attachments<B: GpuBackend>(&mut self, device: &mut RenderDevice<B>) -> RenderResult<()> {
        let view_desc = ImageViewDesc {
            format: self.format,
            aspect: ImageAspect::Color,
            base_mip: 0,
            mip_count: 1,
        };
        for image in self.swapchain_images.clone() {
            let view = device.backend.create_image_view(image, &view_desc)?;
            self.swapchain_views.push(view);

            let color = device.arena.create_image(
                &mut device.backend,
                self.extent,
                FORWARD_COLOR_FORMAT,
                ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED,
                MemoryLocality::DeviceLocal,
            )?;
            self.color.push(attachment(device, color)?);

            let depth = device.arena.create_image(
                &mut device.backend,
                self.extent,
                self.depth_format,
                ImageUsage::DEPTH_STENCIL_ATTACHMENT,
                MemoryLocality::DeviceLocal,
            )?;
            self.depth.push(attachment(device, depth)?);
        }

        let transitions = self
            .depth
            .iter()
            .map(|depth| device.arena.transition(depth.handle, ImageLayout::DepthStencilAttachment))
            .collect::<RenderResult<Vec<_>>>()?;
        device
            .recorder
            .single_shot(&mut device.backend, QueueKind::Graphics, |session| {
                transitions.into_iter().for_each(|barrier| session.push(barrier));
                Ok(())
            })
    }

    /// Destroy views and attachments; the swapchain itself is kept for recreation
    ///
    /// The device must be idle.
    pub fn release<B: GpuBackend>(&mut self, device: &mut RenderDevice<B>) {
        for view in self.swapchain_views.drain(..) {
            device.backend.destroy_image_view(view);
        }
        for attachment in self.color.drain(..).chain(self.depth.drain(..)) {
            if let Err(err) = device.arena.destroy_immediate(&mut device.backend, attachment.handle) {
                log::warn!("Destroying surface attachment failed: {err}");
            }
        }
        self.swapchain_images.clear();
    }

    /// Swapchain format
    pub const fn format(&self) -> Format {
        self.format
    }

    /// Current extent
    pub const fn extent(&self) -> Extent2D {
        self.extent
    }

    /// Depth attachment format
    pub const fn depth_format(&self) -> Format {
        self.depth_format
    }

    /// Number of swapchain images
    pub fn image_count(&self) -> usize {
        self.swapchain_images.len()
    }

    /// Swapchain images
    pub fn swapchain_images(&self) -> &[RawImage] {
        &self.swapchain_images
    }

    /// Swapchain views
    pub fn swapchain_views(&self) -> &[RawImageView] {
        &self.swapchain_views
    }

    /// Forward color attachments, one per swapchain image
    pub fn color(&self) -> &[Attachment] {
        &self.color
    }

    /// Depth attachments, one per swapchain image
    pub fn depth(&self) -> &[Attachment] {
        &self.depth
    }
}

fn attachment<B: GpuBackend>(device: &RenderDevice<B>, handle: ImageHandle) -> RenderResult<Attachment> {
    let image = device.arena.image(handle)?;
    Ok(Attachment {
        handle,
        image: image.raw(),
        view: image.view(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::testing::headless_device;

    fn request(extent: Extent2D) -> SwapchainRequest {
        SwapchainRequest {
            extent,
            preferred_format: Format::B8G8R8A8Unorm,
            present_mode: PresentMode::Fifo,
        }
    }

    #[test]
    fn test_attachments_per_swapchain_image() {
        let mut device = headless_device();
        let targets =
            SurfaceTargets::create(&mut device, &request(Extent2D::new(800, 600)), Format::D32Sfloat).unwrap();

        assert_eq!(targets.image_count(), 3);
        assert_eq!(targets.color().len(), 3);
        assert_eq!(targets.depth().len(), 3);
        for depth in targets.depth() {
            assert_eq!(
                device.backend.image_layout(depth.image, 0),
                Some(ImageLayout::DepthStencilAttachment)
            );
        }
        assert!(device.backend.validation_errors().is_empty());
    }

    #[test]
    fn test_release_frees_attachments() {
        let mut device = headless_device();
        let mut targets =
            SurfaceTargets::create(&mut device, &request(Extent2D::new(64, 64)), Format::D32Sfloat).unwrap();
        targets.release(&mut device);
        assert_eq!(device.arena.live_counts().1, 0);
        assert!(targets.swapchain_views().is_empty());
    }
}
