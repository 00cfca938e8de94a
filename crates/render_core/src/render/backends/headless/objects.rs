//! Object tables of the headless device

use std::collections::{HashMap, HashSet};

use crate::render::api::{
    BindingLayout, BufferUsage, DescriptorResource, Extent2D, Format, ImageDesc, ImageLayout, ImageViewDesc,
    PresentMode, QueueKind, RawBuffer, RawCommandBuffer, RawDescriptorPool, RawDescriptorSet, RawFence, RawImage,
    RawImageView, RawMemory, RawRenderPass,
};
use crate::render::api::Command;

#[derive(Debug)]
pub(super) struct SimMemory {
    pub type_index: u32,
    pub heap_index: u32,
    pub bytes: Vec<u8>,
    pub host_visible: bool,
    pub mapped: bool,
}

#[derive(Debug)]
pub(super) struct SimBuffer {
    pub size: u64,
    pub usage: BufferUsage,
    pub binding: Option<(RawMemory, u64)>,
}

#[derive(Debug)]
pub(super) struct SimImage {
    pub desc: ImageDesc,
    pub bound: bool,
    pub swapchain: bool,
    /// Current layout per mip level
    pub layouts: Vec<ImageLayout>,
    /// Texel data per mip level; empty until first written
    pub mips: Vec<Vec<u8>>,
}

impl SimImage {
    pub fn new(desc: ImageDesc, swapchain: bool) -> Self {
        let levels = desc.mip_levels.max(1) as usize;
        Self {
            desc,
            bound: swapchain,
            swapchain,
            layouts: vec![ImageLayout::Undefined; levels],
            mips: vec![Vec::new(); levels],
        }
    }

    pub fn mip_extent(&self, level: u32) -> Extent2D {
        self.desc.extent.mip(level)
    }

    pub fn mip_bytes(&self, level: u32) -> usize {
        let extent = self.mip_extent(level);
        extent.width as usize * extent.height as usize * self.desc.format.bytes_per_pixel() as usize
    }

    pub fn mip_data_mut(&mut self, level: u32) -> &mut Vec<u8> {
        let size = self.mip_bytes(level);
        let data = &mut self.mips[level as usize];
        if data.len() != size {
            data.resize(size, 0);
        }
        data
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) struct SimView {
    pub image: RawImage,
    pub desc: ImageViewDesc,
}

#[derive(Debug)]
pub(super) struct SimPool {
    pub layout: BindingLayout,
    pub max_sets: u32,
    pub live: HashSet<RawDescriptorSet>,
}

#[derive(Debug)]
pub(super) struct SimSet {
    pub pool: RawDescriptorPool,
    pub layout: BindingLayout,
    pub writes: HashMap<(u32, u32), DescriptorResource>,
}

#[derive(Debug)]
pub(super) struct SimCommandBuffer {
    pub queue: QueueKind,
    pub commands: Vec<Command>,
    /// Submissions of this buffer not yet executed
    pub pending: u32,
}

#[derive(Debug)]
pub(super) struct SimFramebuffer {
    pub render_pass: RawRenderPass,
    pub attachments: Vec<RawImageView>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ImageHold {
    Available,
    Acquired,
    QueuedForPresent,
}

#[derive(Debug)]
pub(super) struct SimSwapchain {
    pub images: Vec<RawImage>,
    pub holds: Vec<ImageHold>,
    pub format: Format,
    pub extent: Extent2D,
    pub present_mode: PresentMode,
    pub next_index: u32,
}

#[derive(Debug)]
pub(super) enum QueueOp {
    Submit {
        id: u64,
        command_buffers: Vec<RawCommandBuffer>,
        fence: Option<RawFence>,
    },
    Present {
        image_index: u32,
    },
}

impl QueueOp {
    pub fn signals(&self, fence: RawFence) -> bool {
        matches!(self, Self::Submit { fence: Some(f), .. } if *f == fence)
    }
}

/// Whether a command names `buffer` directly
pub(super) fn command_uses_buffer(command: &Command, buffer: RawBuffer) -> bool {
    match command {
        Command::BindVertexBuffer { buffer: b, .. } | Command::BindIndexBuffer { buffer: b, .. } => *b == buffer,
        Command::CopyBuffer { src, dst, .. } => *src == buffer || *dst == buffer,
        Command::CopyBufferToImage { buffer: b, .. } | Command::CopyImageToBuffer { buffer: b, .. } => *b == buffer,
        _ => false,
    }
}

/// Whether a command names `image` directly
pub(super) fn command_uses_image(command: &Command, image: RawImage) -> bool {
    match command {
        Command::CopyBufferToImage { image: i, .. }
        | Command::CopyImageToBuffer { image: i, .. }
        | Command::BlitMip { image: i, .. } => *i == image,
        Command::ImageBarrier(barrier) => barrier.image == image,
        _ => false,
    }
}

/// Whether a command binds `set`
pub(super) fn command_uses_set(command: &Command, set: RawDescriptorSet) -> bool {
    matches!(command, Command::BindBindingSet { set: s, .. } if *s == set)
}

/// 2x2 box filter over RGBA-like texels of `bpp` bytes
pub(super) fn downsample(src: &[u8], src_extent: Extent2D, dst_extent: Extent2D, bpp: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dst_extent.width as usize * dst_extent.height as usize * bpp];
    let src_w = src_extent.width as usize;
    let src_h = src_extent.height as usize;
    for y in 0..dst_extent.height as usize {
        for x in 0..dst_extent.width as usize {
            let sx = (x * 2).min(src_w - 1);
            let sy = (y * 2).min(src_h - 1);
            let sx1 = (sx + 1).min(src_w - 1);
            let sy1 = (sy + 1).min(src_h - 1);
            for c in 0..bpp {
                let sum: u32 = [(sx, sy), (sx1, sy), (sx, sy1), (sx1, sy1)]
                    .iter()
                    .map(|&(px, py)| u32::from(src[(py * src_w + px) * bpp + c]))
                    .sum();
                dst[(y * dst_extent.width as usize + x) * bpp + c] = ((sum + 2) / 4) as u8;
            }
        }
    }
    dst
}
