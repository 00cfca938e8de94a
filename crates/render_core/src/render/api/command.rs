//! Recorded GPU commands
//!
//! Command buffers are recorded into a `Vec<Command>` and handed to the
//! backend when recording ends. The Vulkan backend translates each entry to
//! the matching `vkCmd*` call; the headless backend executes them.

use super::types::{
    ClearValue, Extent2D, ImageAspect, ImageLayout, RawBuffer, RawDescriptorSet, RawFramebuffer, RawImage,
    RawPipeline, RawRenderPass,
};

/// Layout transition over a mip range of one image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    /// Image being transitioned
    pub image: RawImage,
    /// Aspect
    pub aspect: ImageAspect,
    /// Layout the image is in (`Undefined` discards contents)
    pub old_layout: ImageLayout,
    /// Layout after the barrier
    pub new_layout: ImageLayout,
    /// First mip
    pub base_mip: u32,
    /// Number of mips
    pub mip_count: u32,
}

/// One recorded command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Begin a render pass over a framebuffer
    BeginRenderPass {
        /// Render pass
        render_pass: RawRenderPass,
        /// Framebuffer
        framebuffer: RawFramebuffer,
        /// Render area
        extent: Extent2D,
        /// One clear value per attachment
        clear_values: Vec<ClearValue>,
    },
    /// End the current render pass
    EndRenderPass,
    /// Bind a graphics pipeline
    BindPipeline(RawPipeline),
    /// Full-extent viewport and scissor
    SetViewportScissor(Extent2D),
    /// Bind a binding set at a set index
    BindBindingSet {
        /// Pipeline whose layout the set is bound against
        pipeline: RawPipeline,
        /// Set index
        index: u32,
        /// Set
        set: RawDescriptorSet,
    },
    /// Inline constant update
    PushConstants {
        /// Pipeline whose layout declares the range
        pipeline: RawPipeline,
        /// Byte offset
        offset: u32,
        /// Bytes
        data: Vec<u8>,
    },
    /// Bind the vertex buffer at binding 0
    BindVertexBuffer {
        /// Buffer
        buffer: RawBuffer,
        /// Byte offset
        offset: u64,
    },
    /// Bind a `u32` index buffer
    BindIndexBuffer {
        /// Buffer
        buffer: RawBuffer,
        /// Byte offset
        offset: u64,
    },
    /// Non-indexed draw
    Draw {
        /// Vertices
        vertex_count: u32,
        /// First vertex
        first_vertex: u32,
    },
    /// Indexed draw
    DrawIndexed {
        /// Indices
        index_count: u32,
        /// First index
        first_index: u32,
        /// Added to every index
        vertex_offset: i32,
    },
    /// Buffer to buffer copy
    CopyBuffer {
        /// Source
        src: RawBuffer,
        /// Destination
        dst: RawBuffer,
        /// Source offset
        src_offset: u64,
        /// Destination offset
        dst_offset: u64,
        /// Bytes
        size: u64,
    },
    /// Tightly packed buffer contents into one mip (image in `TransferDst`)
    CopyBufferToImage {
        /// Source
        buffer: RawBuffer,
        /// Destination
        image: RawImage,
        /// Mip level
        mip_level: u32,
        /// Extent of that mip
        extent: Extent2D,
    },
    /// One mip into a tightly packed buffer (image in `TransferSrc`)
    CopyImageToBuffer {
        /// Source
        image: RawImage,
        /// Destination
        buffer: RawBuffer,
        /// Mip level
        mip_level: u32,
        /// Extent of that mip
        extent: Extent2D,
    },
    /// Linear downsample of `src_mip` into `src_mip + 1`
    BlitMip {
        /// Image
        image: RawImage,
        /// Source mip (in `TransferSrc`); destination is the next level (in `TransferDst`)
        src_mip: u32,
        /// Extent of the source mip
        src_extent: Extent2D,
    },
    /// Layout transition
    ImageBarrier(ImageBarrier),
}

impl Command {
    /// Short name used in logs and validation messages
    pub const fn name(&self) -> &'static str {
        match self {
            Self::BeginRenderPass { .. } => "BeginRenderPass",
            Self::EndRenderPass => "EndRenderPass",
            Self::BindPipeline(_) => "BindPipeline",
            Self::SetViewportScissor(_) => "SetViewportScissor",
            Self::BindBindingSet { .. } => "BindBindingSet",
            Self::PushConstants { .. } => "PushConstants",
            Self::BindVertexBuffer { .. } => "BindVertexBuffer",
            Self::BindIndexBuffer { .. } => "BindIndexBuffer",
            Self::Draw { .. } => "Draw",
            Self::DrawIndexed { .. } => "DrawIndexed",
            Self::CopyBuffer { .. } => "CopyBuffer",
            Self::CopyBufferToImage { .. } => "CopyBufferToImage",
            Self::CopyImageToBuffer { .. } => "CopyImageToBuffer",
            Self::BlitMip { .. } => "BlitMip",
            Self::ImageBarrier(_) => "ImageBarrier",
        }
    }

    /// Whether the command is only legal inside a render pass
    pub const fn requires_render_pass(&self) -> bool {
        matches!(self, Self::Draw { .. } | Self::DrawIndexed { .. } | Self::EndRenderPass)
    }

    /// Whether the command is only legal outside a render pass
    pub const fn forbidden_in_render_pass(&self) -> bool {
        matches!(
            self,
            Self::BeginRenderPass { .. }
                | Self::CopyBuffer { .. }
                | Self::CopyBufferToImage { .. }
                | Self::CopyImageToBuffer { .. }
                | Self::BlitMip { .. }
                | Self::ImageBarrier(_)
        )
    }
}
