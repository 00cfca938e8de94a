//! Texture upload
//!
//! Decoded pixels arrive as tightly packed RGBA8. Upload copies mip 0 through
//! a staging buffer and builds the rest of the chain with blits, all inside a
//! single blocking submission.

use super::arena::{ImageHandle, ResourceArena};
use crate::render::api::{
    AddressMode, Command, DeviceLimits, Extent2D, Filter, Format, GpuBackend, ImageAspect, ImageBarrier, ImageDesc,
    ImageLayout, ImageUsage, MemoryLocality, QueueKind, RawBuffer, RawImage, SamplerDesc,
};
use crate::render::commands::{CommandRecorder, RecordingSession};
use crate::render::{RenderError, RenderResult};

/// Format every uploaded texture uses
pub const TEXTURE_FORMAT: Format = Format::R8G8B8A8Srgb;

/// Decoded RGBA8 image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl ImageData {
    /// Wrap tightly packed RGBA8 pixels
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> RenderResult<Self> {
        Self::check_len(width, height, 4, pixels.len())?;
        Ok(Self { width, height, pixels })
    }

    /// Expand tightly packed RGB8 pixels to RGBA8 with opaque alpha
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> RenderResult<Self> {
        Self::check_len(width, height, 3, pixels.len())?;
        let rgb = image::RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| RenderError::InvalidArgument("RGB buffer does not match its extent".to_string()))?;
        let rgba = image::DynamicImage::ImageRgb8(rgb).to_rgba8();
        Ok(Self {
            width,
            height,
            pixels: rgba.into_raw(),
        })
    }

    /// Single-color image
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let texels = (width as usize) * (height as usize);
        Self {
            width,
            height,
            pixels: rgba.repeat(texels),
        }
    }

    fn check_len(width: u32, height: u32, channels: usize, len: usize) -> RenderResult<()> {
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidArgument(format!("image extent {width}x{height} is empty")));
        }
        let expected = (width as usize) * (height as usize) * channels;
        if len != expected {
            return Err(RenderError::InvalidArgument(format!(
                "{width}x{height} image with {channels} channels needs {expected} bytes, got {len}"
            )));
        }
        Ok(())
    }

    /// Extent of the image
    pub const fn extent(&self) -> Extent2D {
        Extent2D::new(self.width, self.height)
    }

    /// RGBA8 bytes
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

/// Length of a full mip chain for `extent`
pub fn mip_levels(extent: Extent2D) -> u32 {
    let largest = extent.width.max(extent.height).max(1);
    u32::BITS - largest.leading_zeros()
}

/// Sampler used for uploaded textures
pub fn texture_sampler_desc(limits: DeviceLimits, mip_levels: u32) -> SamplerDesc {
    #[allow(clippy::cast_precision_loss)]
    let max_lod = mip_levels as f32;
    SamplerDesc {
        filter: Filter::Linear,
        address_mode: AddressMode::Repeat,
        max_anisotropy: (limits.max_sampler_anisotropy > 0.0).then_some(limits.max_sampler_anisotropy),
        max_lod,
    }
}

impl ResourceArena {
    /// Upload an RGBA8 image with a full mip chain, leaving it shader-readable
    pub fn upload_texture<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        recorder: &mut CommandRecorder,
        data: &ImageData,
    ) -> RenderResult<ImageHandle> {
        let extent = data.extent();
        let mips = mip_levels(extent);
        let handle = self.create_image_with(
            backend,
            ImageDesc {
                extent,
                format: TEXTURE_FORMAT,
                mip_levels: mips,
                array_layers: 1,
                usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST,
            },
            MemoryLocality::DeviceLocal,
        )?;
        let image = self.image(handle)?.raw();

        let pixels = data.pixels();
        let upload = self.with_staging(backend, pixels.len() as u64, Some(pixels), |backend, staging| {
            let staging = staging.raw();
            recorder.single_shot(backend, QueueKind::Graphics, |session| {
                record_mip_chain(session, image, staging, extent, mips);
                Ok(())
            })
        });
        if let Err(err) = upload {
            self.destroy_immediate(backend, handle)?;
            return Err(err);
        }

        self.set_layout(handle, ImageLayout::ShaderReadOnly)?;
        log::debug!("Uploaded {}x{} texture with {} mips", extent.width, extent.height, mips);
        Ok(handle)
    }
}

fn mip_barrier(image: RawImage, base_mip: u32, mip_count: u32, old_layout: ImageLayout, new_layout: ImageLayout) -> Command {
    Command::ImageBarrier(ImageBarrier {
        image,
        aspect: ImageAspect::Color,
        old_layout,
        new_layout,
        base_mip,
        mip_count,
    })
}

fn record_mip_chain(session: &mut RecordingSession<'_>, image: RawImage, staging: RawBuffer, extent: Extent2D, mips: u32) {
    session.push(mip_barrier(image, 0, mips, ImageLayout::Undefined, ImageLayout::TransferDst));
    session.push(Command::CopyBufferToImage {
        buffer: staging,
        image,
        mip_level: 0,
        extent,
    });

    for level in 1..mips {
        session.push(mip_barrier(image, level - 1, 1, ImageLayout::TransferDst, ImageLayout::TransferSrc));
        session.push(Command::BlitMip {
            image,
            src_mip: level - 1,
            src_extent: extent.mip(level - 1),
        });
    }

    if mips > 1 {
        session.push(mip_barrier(image, 0, mips - 1, ImageLayout::TransferSrc, ImageLayout::ShaderReadOnly));
    }
    session.push(mip_barrier(image, mips - 1, 1, ImageLayout::TransferDst, ImageLayout::ShaderReadOnly));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::HeadlessBackend;

    #[test]
    fn test_mip_levels() {
        assert_eq!(mip_levels(Extent2D::new(1, 1)), 1);
        assert_eq!(mip_levels(Extent2D::new(256, 256)), 9);
        assert_eq!(mip_levels(Extent2D::new(300, 20)), 9);
        assert_eq!(mip_levels(Extent2D::new(1024, 512)), 11);
    }

    #[test]
    fn test_rgb_expands_with_opaque_alpha() {
        let data = ImageData::from_rgb(2, 1, vec![10, 20, 30, 40, 50, 60]).unwrap();
        assert_eq!(data.pixels(), &[10, 20, 30, 255, 40, 50, 60, 255]);
    }

    #[test]
    fn test_wrong_length_is_rejected() {
        assert!(matches!(
            ImageData::from_rgba(2, 2, vec![0; 15]),
            Err(RenderError::InvalidArgument(_))
        ));
        assert!(ImageData::from_rgb(0, 4, Vec::new()).is_err());
    }

    #[test]
    fn test_upload_builds_mip_chain_without_validation_errors() {
        let mut backend = HeadlessBackend::default();
        let mut arena = ResourceArena::new();
        let mut recorder = CommandRecorder::new();

        let mut pixels = Vec::new();
        for y in 0..4u8 {
            for x in 0..4u8 {
                pixels.extend_from_slice(&[x * 60, y * 60, 0, 255]);
            }
        }
        let data = ImageData::from_rgba(4, 4, pixels).unwrap();
        let handle = arena.upload_texture(&mut backend, &mut recorder, &data).unwrap();

        let image = arena.image(handle).unwrap();
        assert_eq!(image.mip_levels(), 3);
        assert_eq!(image.layout(), ImageLayout::ShaderReadOnly);
        for mip in 0..3 {
            assert_eq!(backend.image_layout(image.raw(), mip), Some(ImageLayout::ShaderReadOnly));
        }
        assert_eq!(backend.image_data(image.raw(), 0), Some(data.pixels()));
        assert_eq!(backend.image_data(image.raw(), 2).map(<[u8]>::len), Some(4));
        assert!(backend.validation_errors().is_empty(), "{:?}", backend.validation_errors());
    }

    #[test]
    fn test_sampler_uses_anisotropy_when_available() {
        let limits = DeviceLimits {
            min_uniform_buffer_offset_alignment: 256,
            max_push_constants_size: 128,
            max_sampler_anisotropy: 16.0,
        };
        let desc = texture_sampler_desc(limits, 9);
        assert_eq!(desc.max_anisotropy, Some(16.0));
        assert!((desc.max_lod - 9.0).abs() < f32::EPSILON);

        let none = texture_sampler_desc(DeviceLimits { max_sampler_anisotropy: 0.0, ..limits }, 1);
        assert_eq!(none.max_anisotropy, None);
    }
}
