//! Conversions between core descriptions and Vulkan types

use ash::vk;

use crate::render::api::{
    AddressMode, BindingKind, BufferUsage, ClearValue, Filter, Format, ImageAspect, ImageLayout, ImageUsage, LoadOp,
    MemoryProperties, PipelineStage, PresentMode, ShaderStages, StoreOp, VertexFormat,
};
use crate::render::RenderError;

impl From<vk::Result> for RenderError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::SurfaceOutOfDate,
            vk::Result::SUBOPTIMAL_KHR => Self::SurfaceSuboptimal,
            vk::Result::ERROR_DEVICE_LOST | vk::Result::ERROR_SURFACE_LOST_KHR => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => Self::PoolExhausted,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Self::ResourceExhausted(format!("{result:?}"))
            }
            vk::Result::TIMEOUT => Self::Timeout("vulkan"),
            other => Self::Api(other),
        }
    }
}

pub(super) fn format_to_vk(format: Format) -> vk::Format {
    match format {
        Format::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::R8G8B8A8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::B8G8R8A8Srgb => vk::Format::B8G8R8A8_SRGB,
        Format::D32Sfloat => vk::Format::D32_SFLOAT,
        Format::D32SfloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
        Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
    }
}

pub(super) fn format_from_vk(format: vk::Format) -> Option<Format> {
    match format {
        vk::Format::R8G8B8A8_UNORM => Some(Format::R8G8B8A8Unorm),
        vk::Format::R8G8B8A8_SRGB => Some(Format::R8G8B8A8Srgb),
        vk::Format::B8G8R8A8_UNORM => Some(Format::B8G8R8A8Unorm),
        vk::Format::B8G8R8A8_SRGB => Some(Format::B8G8R8A8Srgb),
        _ => None,
    }
}

pub(super) fn aspect_flags(aspect: ImageAspect, format: Option<Format>) -> vk::ImageAspectFlags {
    match (aspect, format) {
        (ImageAspect::Color, _) => vk::ImageAspectFlags::COLOR,
        (ImageAspect::Depth, Some(Format::D32SfloatS8Uint | Format::D24UnormS8Uint)) => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        (ImageAspect::Depth, _) => vk::ImageAspectFlags::DEPTH,
    }
}

pub(super) fn layout_to_vk(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

/// Stage and access scope of work that uses an image in `layout`
pub(super) fn layout_scope(layout: ImageLayout) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    match layout {
        ImageLayout::Undefined => (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
        ImageLayout::General => (
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
        ),
        ImageLayout::ColorAttachment => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        ImageLayout::DepthStencilAttachment => (
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        ImageLayout::ShaderReadOnly => (vk::PipelineStageFlags::FRAGMENT_SHADER, vk::AccessFlags::SHADER_READ),
        ImageLayout::TransferSrc => (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ),
        ImageLayout::TransferDst => (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
        ImageLayout::PresentSrc => (vk::PipelineStageFlags::BOTTOM_OF_PIPE, vk::AccessFlags::empty()),
    }
}

pub(super) fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    vk::BufferUsageFlags::from_raw(usage.bits())
}

pub(super) fn image_usage(usage: ImageUsage) -> vk::ImageUsageFlags {
    vk::ImageUsageFlags::from_raw(usage.bits())
}

pub(super) fn memory_properties(flags: vk::MemoryPropertyFlags) -> MemoryProperties {
    MemoryProperties::from_bits_truncate(flags.as_raw())
}

pub(super) fn shader_stages(stages: ShaderStages) -> vk::ShaderStageFlags {
    vk::ShaderStageFlags::from_raw(stages.bits())
}

pub(super) fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        BindingKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    }
}

pub(super) fn filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

pub(super) fn address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
    }
}

pub(super) fn load_op(op: LoadOp) -> vk::AttachmentLoadOp {
    match op {
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

pub(super) fn store_op(op: StoreOp) -> vk::AttachmentStoreOp {
    match op {
        StoreOp::Store => vk::AttachmentStoreOp::STORE,
        StoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
    }
}

pub(super) fn present_mode_to_vk(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
    }
}

pub(super) fn present_mode_from_vk(mode: vk::PresentModeKHR) -> PresentMode {
    match mode {
        vk::PresentModeKHR::MAILBOX => PresentMode::Mailbox,
        vk::PresentModeKHR::IMMEDIATE => PresentMode::Immediate,
        _ => PresentMode::Fifo,
    }
}

pub(super) fn pipeline_stage(stage: PipelineStage) -> vk::PipelineStageFlags {
    match stage {
        PipelineStage::TopOfPipe => vk::PipelineStageFlags::TOP_OF_PIPE,
        PipelineStage::Transfer => vk::PipelineStageFlags::TRANSFER,
        PipelineStage::FragmentShader => vk::PipelineStageFlags::FRAGMENT_SHADER,
        PipelineStage::ColorAttachmentOutput => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
    }
}

pub(super) fn vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float4 => vk::Format::R32G32B32A32_SFLOAT,
    }
}

pub(super) fn clear_value(value: ClearValue) -> vk::ClearValue {
    match value {
        ClearValue::Color(float32) => vk::ClearValue {
            color: vk::ClearColorValue { float32 },
        },
        ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_bits_match_vulkan() {
        assert_eq!(buffer_usage(BufferUsage::VERTEX), vk::BufferUsageFlags::VERTEX_BUFFER);
        assert_eq!(buffer_usage(BufferUsage::UNIFORM), vk::BufferUsageFlags::UNIFORM_BUFFER);
        assert_eq!(image_usage(ImageUsage::SAMPLED), vk::ImageUsageFlags::SAMPLED);
        assert_eq!(
            image_usage(ImageUsage::DEPTH_STENCIL_ATTACHMENT),
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        );
        assert_eq!(shader_stages(ShaderStages::FRAGMENT), vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(
            memory_properties(vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT),
            MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT
        );
    }

    #[test]
    fn test_surface_errors_map_to_recoverable_variants() {
        assert!(matches!(
            RenderError::from(vk::Result::ERROR_OUT_OF_DATE_KHR),
            RenderError::SurfaceOutOfDate
        ));
        assert!(matches!(
            RenderError::from(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
            RenderError::PoolExhausted
        ));
        assert!(matches!(RenderError::from(vk::Result::ERROR_DEVICE_LOST), RenderError::DeviceLost));
    }
}
