//! Backend-neutral GPU object descriptions
//!
//! Flag values mirror the Vulkan bit assignments so the Vulkan backend can
//! convert with `from_raw`.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

macro_rules! raw_handle {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
            pub struct $name(pub u64);

            impl $name {
                /// The null handle
                pub const NULL: Self = Self(0);

                /// Whether this is the null handle
                pub const fn is_null(self) -> bool {
                    self.0 == 0
                }
            }
        )*
    };
}

raw_handle!(
    /// Backend buffer object
    RawBuffer,
    /// Backend image object
    RawImage,
    /// Backend image view
    RawImageView,
    /// Backend sampler
    RawSampler,
    /// Backend memory allocation
    RawMemory,
    /// Backend fence
    RawFence,
    /// Backend binary semaphore
    RawSemaphore,
    /// Backend command buffer
    RawCommandBuffer,
    /// Backend descriptor pool
    RawDescriptorPool,
    /// Backend descriptor set
    RawDescriptorSet,
    /// Backend render pass
    RawRenderPass,
    /// Backend framebuffer
    RawFramebuffer,
    /// Backend graphics pipeline (with its layout)
    RawPipeline,
    /// Backend shader module
    RawShaderModule,
);

bitflags! {
    /// Buffer usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Source of a transfer
        const TRANSFER_SRC = 0x1;
        /// Destination of a transfer
        const TRANSFER_DST = 0x2;
        /// Uniform buffer
        const UNIFORM = 0x10;
        /// Storage buffer
        const STORAGE = 0x20;
        /// Index buffer
        const INDEX = 0x40;
        /// Vertex buffer
        const VERTEX = 0x80;
    }

    /// Image usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        /// Source of a transfer or blit
        const TRANSFER_SRC = 0x1;
        /// Destination of a transfer or blit
        const TRANSFER_DST = 0x2;
        /// Sampled from shaders
        const SAMPLED = 0x4;
        /// Storage image
        const STORAGE = 0x8;
        /// Color attachment
        const COLOR_ATTACHMENT = 0x10;
        /// Depth/stencil attachment
        const DEPTH_STENCIL_ATTACHMENT = 0x20;
    }

    /// Memory property flags of a physical memory type
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryProperties: u32 {
        /// Fast device memory
        const DEVICE_LOCAL = 0x1;
        /// Mappable by the host
        const HOST_VISIBLE = 0x2;
        /// Host writes visible without flushes
        const HOST_COHERENT = 0x4;
        /// Cached on the host
        const HOST_CACHED = 0x8;
        /// Lazily allocated
        const LAZILY_ALLOCATED = 0x10;
    }

    /// Shader stages
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        /// Vertex stage
        const VERTEX = 0x1;
        /// Fragment stage
        const FRAGMENT = 0x10;
    }
}

/// Where a resource's memory should live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocality {
    /// Device-local, not host mappable; filled through staging copies
    DeviceLocal,
    /// Host-visible and coherent; persistently mapped
    HostVisible,
}

impl MemoryLocality {
    /// Properties a memory type must carry to satisfy this locality
    pub const fn required_properties(self) -> MemoryProperties {
        match self {
            Self::DeviceLocal => MemoryProperties::DEVICE_LOCAL,
            Self::HostVisible => MemoryProperties::HOST_VISIBLE.union(MemoryProperties::HOST_COHERENT),
        }
    }
}

/// One physical memory type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    /// Properties of the type
    pub properties: MemoryProperties,
    /// Heap the type allocates from
    pub heap_index: u32,
}

/// Size and placement requirements reported for a new object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// Bytes to allocate
    pub size: u64,
    /// Required alignment
    pub alignment: u64,
    /// Bit `i` set when memory type `i` is usable
    pub memory_type_bits: u32,
}

/// Device limits the core depends on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceLimits {
    /// Alignment of dynamic uniform offsets and uniform ranges
    pub min_uniform_buffer_offset_alignment: u64,
    /// Bytes of push constant space
    pub max_push_constants_size: u32,
    /// Maximum sampler anisotropy (`0.0` when unsupported)
    pub max_sampler_anisotropy: f32,
}

/// Queue families the core submits to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Graphics (and present) queue
    Graphics,
    /// Transfer-capable queue used for uploads
    Transfer,
}

/// 2D extent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Extent2D {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Extent2D {
    /// Create an extent
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether either dimension is zero (minimized surface)
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Extent of mip level `level`
    pub fn mip(self, level: u32) -> Self {
        Self {
            width: (self.width >> level).max(1),
            height: (self.height >> level).max(1),
        }
    }

    /// Width over height
    #[allow(clippy::cast_precision_loss)]
    pub fn aspect(self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

/// Pixel formats used by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// 8-bit RGBA, linear
    R8G8B8A8Unorm,
    /// 8-bit RGBA, sRGB
    R8G8B8A8Srgb,
    /// 8-bit BGRA, linear
    B8G8R8A8Unorm,
    /// 8-bit BGRA, sRGB
    B8G8R8A8Srgb,
    /// 32-bit float depth
    D32Sfloat,
    /// 32-bit float depth + 8-bit stencil
    D32SfloatS8Uint,
    /// 24-bit depth + 8-bit stencil
    D24UnormS8Uint,
}

impl Format {
    /// Bytes per texel
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::D32SfloatS8Uint => 8,
            _ => 4,
        }
    }

    /// Whether this is a depth format
    pub const fn is_depth(self) -> bool {
        matches!(self, Self::D32Sfloat | Self::D32SfloatS8Uint | Self::D24UnormS8Uint)
    }

    /// Depth formats in order of preference
    pub const DEPTH_CANDIDATES: [Self; 3] = [Self::D32Sfloat, Self::D32SfloatS8Uint, Self::D24UnormS8Uint];
}

/// Image layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    /// Contents undefined
    Undefined,
    /// General purpose
    General,
    /// Written as a color attachment
    ColorAttachment,
    /// Written as a depth/stencil attachment
    DepthStencilAttachment,
    /// Read by shaders
    ShaderReadOnly,
    /// Source of transfers
    TransferSrc,
    /// Destination of transfers
    TransferDst,
    /// Ready for presentation
    PresentSrc,
}

/// Image aspect addressed by a view or barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageAspect {
    /// Color data
    Color,
    /// Depth data
    Depth,
}

impl ImageAspect {
    /// Aspect implied by a format
    pub const fn for_format(format: Format) -> Self {
        if format.is_depth() {
            Self::Depth
        } else {
            Self::Color
        }
    }
}

/// Buffer creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    /// Size in bytes
    pub size: u64,
    /// Usage flags
    pub usage: BufferUsage,
}

/// Image creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    /// Extent of mip 0
    pub extent: Extent2D,
    /// Pixel format
    pub format: Format,
    /// Number of mip levels
    pub mip_levels: u32,
    /// Number of array layers
    pub array_layers: u32,
    /// Usage flags
    pub usage: ImageUsage,
}

/// Image view parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageViewDesc {
    /// View format
    pub format: Format,
    /// Aspect
    pub aspect: ImageAspect,
    /// First mip visible through the view
    pub base_mip: u32,
    /// Number of mips visible through the view
    pub mip_count: u32,
}

/// Texture filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Nearest texel
    Nearest,
    /// Linear interpolation
    Linear,
}

/// Texture addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    /// Wrap around
    Repeat,
    /// Clamp to the edge texel
    ClampToEdge,
}

/// Sampler parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    /// Magnification and minification filter
    pub filter: Filter,
    /// Addressing mode on all axes
    pub address_mode: AddressMode,
    /// Anisotropy level, `None` to disable
    pub max_anisotropy: Option<f32>,
    /// Highest mip level the sampler may select
    pub max_lod: f32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: Filter::Linear,
            address_mode: AddressMode::Repeat,
            max_anisotropy: None,
            max_lod: 0.0,
        }
    }
}

/// Kind of a binding slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// Uniform buffer
    UniformBuffer,
    /// Combined image + sampler
    CombinedImageSampler,
}

/// One slot of a binding layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingSlot {
    /// Binding number
    pub binding: u32,
    /// Resource kind
    pub kind: BindingKind,
    /// Array length
    pub count: u32,
    /// Stages that read the binding
    pub stages: ShaderStages,
}

/// Ordered list of binding slots; the key binding-set pools are grouped by
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BindingLayout {
    slots: Vec<BindingSlot>,
}

impl BindingLayout {
    /// Create an empty layout
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Append a uniform buffer slot
    #[must_use]
    pub fn uniform_buffer(self, binding: u32, count: u32, stages: ShaderStages) -> Self {
        self.slot(binding, BindingKind::UniformBuffer, count, stages)
    }

    /// Append a combined image sampler slot
    #[must_use]
    pub fn combined_image_sampler(self, binding: u32, stages: ShaderStages) -> Self {
        self.slot(binding, BindingKind::CombinedImageSampler, 1, stages)
    }

    fn slot(mut self, binding: u32, kind: BindingKind, count: u32, stages: ShaderStages) -> Self {
        self.slots.push(BindingSlot {
            binding,
            kind,
            count,
            stages,
        });
        self
    }

    /// Slots in declaration order
    pub fn slots(&self) -> &[BindingSlot] {
        &self.slots
    }

    /// Descriptor count per kind, multiplied by `sets`
    pub fn descriptor_totals(&self, sets: u32) -> Vec<(BindingKind, u32)> {
        let mut totals: Vec<(BindingKind, u32)> = Vec::new();
        for slot in &self.slots {
            let amount = slot.count.saturating_mul(sets);
            match totals.iter_mut().find(|(kind, _)| *kind == slot.kind) {
                Some((_, total)) => *total += amount,
                None => totals.push((slot.kind, amount)),
            }
        }
        totals
    }
}

/// Resource written into a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    /// Range of a uniform buffer
    Buffer {
        /// Buffer
        buffer: RawBuffer,
        /// Byte offset
        offset: u64,
        /// Byte range
        range: u64,
    },
    /// Image view + sampler
    ImageSampler {
        /// View to sample
        view: RawImageView,
        /// Sampler
        sampler: RawSampler,
        /// Layout the image will be in when sampled
        layout: ImageLayout,
    },
}

/// One descriptor write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    /// Binding number
    pub binding: u32,
    /// Array element within the binding
    pub array_element: u32,
    /// Resource
    pub resource: DescriptorResource,
}

/// Attachment load behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOp {
    /// Clear on load
    Clear,
    /// Preserve previous contents
    Load,
    /// Contents undefined
    DontCare,
}

/// Attachment store behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    /// Keep results
    Store,
    /// Discard results
    DontCare,
}

/// One render pass attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDesc {
    /// Format
    pub format: Format,
    /// Load behavior
    pub load: LoadOp,
    /// Store behavior
    pub store: StoreOp,
    /// Layout expected on entry
    pub initial_layout: ImageLayout,
    /// Layout the pass leaves the image in
    pub final_layout: ImageLayout,
}

/// Single-subpass render pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPassDesc {
    /// Color attachments (framebuffer slots `0..n`)
    pub color: Vec<AttachmentDesc>,
    /// Optional depth attachment (framebuffer slot `n`)
    pub depth: Option<AttachmentDesc>,
}

impl RenderPassDesc {
    /// All attachments in framebuffer order
    pub fn attachments(&self) -> impl Iterator<Item = &AttachmentDesc> {
        self.color.iter().chain(self.depth.iter())
    }
}

/// Vertex attribute formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    /// Two floats
    Float2,
    /// Three floats
    Float3,
    /// Four floats
    Float4,
}

/// One vertex attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    /// Shader location
    pub location: u32,
    /// Format
    pub format: VertexFormat,
    /// Byte offset inside a vertex
    pub offset: u32,
}

/// Layout of the single interleaved vertex binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexInputLayout {
    /// Bytes per vertex
    pub stride: u32,
    /// Attributes
    pub attributes: Vec<VertexAttribute>,
}

/// Push constant range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConstantRange {
    /// Stages reading the range
    pub stages: ShaderStages,
    /// Size in bytes
    pub size: u32,
}

/// Graphics pipeline parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDesc {
    /// Render pass the pipeline draws in
    pub render_pass: RawRenderPass,
    /// Vertex shader module
    pub vertex_shader: RawShaderModule,
    /// Fragment shader module
    pub fragment_shader: RawShaderModule,
    /// Vertex input
    pub vertex_input: VertexInputLayout,
    /// Binding layouts by set index
    pub set_layouts: Vec<BindingLayout>,
    /// Optional push constant range
    pub push_constants: Option<PushConstantRange>,
    /// Depth test and write
    pub depth_test: bool,
    /// Back-face culling
    pub cull_back_faces: bool,
}

/// Attachment clear value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    /// Color clear
    Color([f32; 4]),
    /// Depth/stencil clear
    DepthStencil {
        /// Depth
        depth: f32,
        /// Stencil
        stencil: u32,
    },
}

/// Pipeline stage a semaphore wait blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    /// Before anything
    TopOfPipe,
    /// Transfers
    Transfer,
    /// Fragment shading
    FragmentShader,
    /// Color attachment writes
    ColorAttachmentOutput,
}

/// A queue submission
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitInfo {
    /// Command buffers in execution order
    pub command_buffers: Vec<RawCommandBuffer>,
    /// Semaphores waited on, with the stage they block
    pub wait: Vec<(RawSemaphore, PipelineStage)>,
    /// Semaphores signaled on completion
    pub signal: Vec<RawSemaphore>,
    /// Fence signaled on completion
    pub fence: Option<RawFence>,
}

/// Present mode preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PresentMode {
    /// Vsync queue, always supported
    Fifo,
    /// Low-latency triple buffering
    Mailbox,
    /// No vsync
    Immediate,
}

/// Swapchain creation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainRequest {
    /// Desired extent (the surface may override it)
    pub extent: Extent2D,
    /// Preferred surface format
    pub preferred_format: Format,
    /// Preferred present mode
    pub present_mode: PresentMode,
}

/// Negotiated swapchain properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainInfo {
    /// Surface format
    pub format: Format,
    /// Image extent
    pub extent: Extent2D,
    /// Present mode in use
    pub present_mode: PresentMode,
    /// Presentable images
    pub images: Vec<RawImage>,
}

/// Result of acquiring a presentable image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    /// Swapchain image index
    pub index: u32,
    /// The surface no longer matches the swapchain exactly
    pub suboptimal: bool,
}

/// Outcome of a present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    /// Presented and the swapchain matches the surface
    Optimal,
    /// Presented but the swapchain should be recreated
    Suboptimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_visible_requires_coherent() {
        let required = MemoryLocality::HostVisible.required_properties();
        assert!(required.contains(MemoryProperties::HOST_VISIBLE));
        assert!(required.contains(MemoryProperties::HOST_COHERENT));
        assert!(!required.contains(MemoryProperties::DEVICE_LOCAL));
    }

    #[test]
    fn test_limits_compare_by_value() {
        let limits = DeviceLimits {
            min_uniform_buffer_offset_alignment: 256,
            max_push_constants_size: 128,
            max_sampler_anisotropy: 16.0,
        };
        let without_anisotropy = DeviceLimits {
            max_sampler_anisotropy: 0.0,
            ..limits
        };
        assert_eq!(limits, limits);
        assert_ne!(limits, without_anisotropy);
    }

    #[test]
    fn test_mip_extent_never_reaches_zero() {
        let extent = Extent2D::new(256, 64);
        assert_eq!(extent.mip(2), Extent2D::new(64, 16));
        assert_eq!(extent.mip(8), Extent2D::new(1, 1));
    }

    #[test]
    fn test_descriptor_totals_group_by_kind() {
        let layout = BindingLayout::new()
            .uniform_buffer(0, 1, ShaderStages::VERTEX)
            .uniform_buffer(1, 3, ShaderStages::VERTEX)
            .combined_image_sampler(2, ShaderStages::FRAGMENT);

        let totals = layout.descriptor_totals(10);
        assert_eq!(
            totals,
            vec![(BindingKind::UniformBuffer, 40), (BindingKind::CombinedImageSampler, 10)]
        );
    }
}
