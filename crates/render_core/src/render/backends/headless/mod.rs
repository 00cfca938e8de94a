//! Headless software device
//!
//! A deterministic stand-in for a GPU. It keeps the same object model as the
//! Vulkan backend (memory types and heaps, binary semaphores, fences, an
//! in-order queue, a swapchain) and executes recorded commands when the CPU
//! waits on their completion: copies move bytes, blits downsample, barriers
//! and render passes move image layouts.
//!
//! Every rule a Vulkan validation layer would enforce for the commands the
//! core records is checked during execution. Violations are logged and kept in
//! [`HeadlessBackend::validation_errors`] so tests can assert a clean run.
//!
//! Work submitted to the queue stays pending until something waits for it
//! (`wait_for_fence`, `queue_wait_idle`, `wait_idle`, or an acquire that needs
//! an image still queued for presentation), which mirrors a GPU running
//! behind the CPU.

mod executor;
mod objects;

use std::collections::{HashMap, HashSet, VecDeque};

use objects::{
    command_uses_buffer, command_uses_image, command_uses_set, ImageHold, QueueOp, SimBuffer, SimCommandBuffer,
    SimFramebuffer, SimImage, SimMemory, SimPool, SimSet, SimSwapchain, SimView,
};

use crate::render::api::{
    AcquiredImage, BindingKind, BindingLayout, BufferDesc, BufferUsage, Command, DescriptorResource,
    DescriptorWrite, DeviceLimits, Extent2D, Format, GpuBackend, ImageDesc, ImageLayout, ImageUsage, ImageViewDesc,
    MemoryProperties, MemoryRequirements, MemoryType, PipelineDesc, PresentMode, PresentStatus, QueueKind, RawBuffer,
    RawCommandBuffer, RawDescriptorPool, RawDescriptorSet, RawFence, RawFramebuffer, RawImage, RawImageView,
    RawMemory, RawPipeline, RawRenderPass, RawSampler, RawSemaphore, RawShaderModule, RenderPassDesc, SamplerDesc,
    SubmitInfo, SwapchainInfo, SwapchainRequest,
};
use crate::render::{RenderError, RenderResult};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// A SPIR-V header with no instructions
///
/// The headless device never runs shaders, so tests and the demo register
/// this module in place of compiled shader files.
pub fn stub_spirv() -> Vec<u32> {
    vec![SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]
}

/// Shape of the simulated device
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    /// Adapter name reported to the core
    pub adapter_name: String,
    /// Memory types in index order
    pub memory_types: Vec<MemoryType>,
    /// Heap sizes in bytes, indexed by `MemoryType::heap_index`
    pub heap_sizes: Vec<u64>,
    /// Initial surface extent
    pub surface_extent: Extent2D,
    /// Images per swapchain
    pub swapchain_image_count: u32,
    /// Surface format
    pub surface_format: Format,
    /// Reported limits
    pub limits: DeviceLimits,
    /// Depth formats usable as attachments
    pub depth_formats: Vec<Format>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            adapter_name: "Headless Device".to_string(),
            memory_types: vec![
                MemoryType {
                    properties: MemoryProperties::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    properties: MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
                    heap_index: 1,
                },
                MemoryType {
                    properties: MemoryProperties::HOST_VISIBLE
                        | MemoryProperties::HOST_COHERENT
                        | MemoryProperties::HOST_CACHED,
                    heap_index: 1,
                },
            ],
            heap_sizes: vec![512 << 20, 256 << 20],
            surface_extent: Extent2D::new(800, 600),
            swapchain_image_count: 3,
            surface_format: Format::B8G8R8A8Unorm,
            limits: DeviceLimits {
                min_uniform_buffer_offset_alignment: 256,
                max_push_constants_size: 128,
                max_sampler_anisotropy: 16.0,
            },
            depth_formats: Format::DEPTH_CANDIDATES.to_vec(),
        }
    }
}

impl HeadlessConfig {
    /// Set the initial surface extent
    #[must_use]
    pub fn with_surface_extent(mut self, extent: Extent2D) -> Self {
        self.surface_extent = extent;
        self
    }
}

/// Counters exposed for tests and the demo
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    /// Queue submissions accepted
    pub submissions: u64,
    /// Fence waits that had to drive pending work to completion
    pub blocking_fence_waits: u64,
    /// `queue_wait_idle` calls
    pub queue_idle_waits: u64,
    /// Draw commands executed
    pub draws: u64,
    /// Images presented
    pub presents: u64,
    /// Swapchains created
    pub swapchains_created: u64,
}

/// One executed command with its position on the queue timeline
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry {
    /// Submission the command belonged to
    pub submission: u64,
    /// Command buffer that held it
    pub command_buffer: RawCommandBuffer,
    /// The command
    pub command: Command,
}

/// Software device implementing [`GpuBackend`]
#[derive(Debug)]
pub struct HeadlessBackend {
    config: HeadlessConfig,
    next_id: u64,
    heap_usage: Vec<u64>,
    memory: HashMap<RawMemory, SimMemory>,
    buffers: HashMap<RawBuffer, SimBuffer>,
    images: HashMap<RawImage, SimImage>,
    views: HashMap<RawImageView, SimView>,
    samplers: HashSet<RawSampler>,
    fences: HashMap<RawFence, bool>,
    semaphores: HashMap<RawSemaphore, bool>,
    pools: HashMap<RawDescriptorPool, SimPool>,
    sets: HashMap<RawDescriptorSet, SimSet>,
    command_buffers: HashMap<RawCommandBuffer, SimCommandBuffer>,
    shader_modules: HashSet<RawShaderModule>,
    render_passes: HashMap<RawRenderPass, RenderPassDesc>,
    framebuffers: HashMap<RawFramebuffer, SimFramebuffer>,
    pipelines: HashMap<RawPipeline, PipelineDesc>,
    swapchain: Option<SimSwapchain>,
    surface_extent: Extent2D,
    surface_changed: bool,
    injected_acquire_failures: u32,
    injected_submit_failures: u32,
    device_lost: bool,
    queue: VecDeque<QueueOp>,
    tracing: bool,
    trace: Vec<TraceEntry>,
    validation: Vec<String>,
    stats: HeadlessStats,
}

impl HeadlessBackend {
    /// Create a device with the given shape
    pub fn new(config: HeadlessConfig) -> Self {
        log::info!(
            "Creating headless device '{}' with {} memory types",
            config.adapter_name,
            config.memory_types.len()
        );
        Self {
            heap_usage: vec![0; config.heap_sizes.len()],
            surface_extent: config.surface_extent,
            config,
            next_id: 0,
            memory: HashMap::new(),
            buffers: HashMap::new(),
            images: HashMap::new(),
            views: HashMap::new(),
            samplers: HashSet::new(),
            fences: HashMap::new(),
            semaphores: HashMap::new(),
            pools: HashMap::new(),
            sets: HashMap::new(),
            command_buffers: HashMap::new(),
            shader_modules: HashSet::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            pipelines: HashMap::new(),
            swapchain: None,
            surface_changed: false,
            injected_acquire_failures: 0,
            injected_submit_failures: 0,
            device_lost: false,
            queue: VecDeque::new(),
            tracing: true,
            trace: Vec::new(),
            validation: Vec::new(),
            stats: HeadlessStats::default(),
        }
    }

    // Test and demo controls

    /// Resize the surface; the next acquire or present reports out-of-date
    pub fn resize_surface(&mut self, extent: Extent2D) {
        log::debug!("Headless surface resized to {}x{}", extent.width, extent.height);
        self.surface_extent = extent;
        self.surface_changed = true;
    }

    /// Make the next `count` acquires fail with an out-of-date surface
    pub fn inject_acquire_failures(&mut self, count: u32) {
        self.injected_acquire_failures = count;
    }

    /// Make the next `count` graphics submissions fail before touching any semaphore
    pub fn inject_submit_failures(&mut self, count: u32) {
        self.injected_submit_failures = count;
    }

    /// Simulate device loss; every later queue operation fails
    pub fn lose_device(&mut self) {
        log::warn!("Headless device marked lost");
        self.device_lost = true;
    }

    /// Enable or disable command tracing
    pub fn set_tracing(&mut self, enabled: bool) {
        self.tracing = enabled;
    }

    /// Commands executed so far, in queue order
    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    /// Drop the recorded trace
    pub fn clear_trace(&mut self) {
        self.trace.clear();
    }

    /// Validation failures recorded so far
    pub fn validation_errors(&self) -> &[String] {
        &self.validation
    }

    /// Counters
    pub const fn stats(&self) -> HeadlessStats {
        self.stats
    }

    /// Queue operations submitted but not yet executed
    pub fn pending_operations(&self) -> usize {
        self.queue.len()
    }

    /// Whether `command_buffer` has a submission that has not executed
    pub fn is_pending(&self, command_buffer: RawCommandBuffer) -> bool {
        self.command_buffers
            .get(&command_buffer)
            .is_some_and(|cb| cb.pending > 0)
    }

    /// Current layout of one mip of an image
    pub fn image_layout(&self, image: RawImage, mip: u32) -> Option<ImageLayout> {
        self.images.get(&image).and_then(|img| img.layouts.get(mip as usize).copied())
    }

    /// Extent of an image
    pub fn image_extent(&self, image: RawImage) -> Option<Extent2D> {
        self.images.get(&image).map(|img| img.desc.extent)
    }

    /// Image behind a view
    pub fn view_image(&self, view: RawImageView) -> Option<RawImage> {
        self.views.get(&view).map(|v| v.image)
    }

    /// Texel data of one mip, empty if never written
    pub fn image_data(&self, image: RawImage, mip: u32) -> Option<&[u8]> {
        self.images
            .get(&image)
            .and_then(|img| img.mips.get(mip as usize))
            .map(Vec::as_slice)
    }

    /// Parameters of the current swapchain
    pub fn swapchain_state(&self) -> Option<(Format, Extent2D, PresentMode)> {
        self.swapchain
            .as_ref()
            .map(|swapchain| (swapchain.format, swapchain.extent, swapchain.present_mode))
    }

    /// Live object counts: (buffers, images, views, descriptor sets)
    pub fn live_objects(&self) -> (usize, usize, usize, usize) {
        (self.buffers.len(), self.images.len(), self.views.len(), self.sets.len())
    }

    /// Bytes allocated from each heap
    pub fn heap_usage(&self) -> &[u64] {
        &self.heap_usage
    }

    fn next_handle(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn report(&mut self, message: String) {
        log::error!("[headless validation] {}", message);
        self.validation.push(message);
    }

    fn check_alive(&self) -> RenderResult<()> {
        if self.device_lost {
            Err(RenderError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn pending_commands(&self) -> impl Iterator<Item = &Command> {
        self.queue
            .iter()
            .filter_map(|op| match op {
                QueueOp::Submit { command_buffers, .. } => Some(command_buffers),
                QueueOp::Present { .. } => None,
            })
            .flatten()
            .filter_map(|cb| self.command_buffers.get(cb))
            .flat_map(|cb| cb.commands.iter())
    }

    fn all_types_mask(&self) -> u32 {
        let count = self.config.memory_types.len().min(32);
        if count == 32 {
            u32::MAX
        } else {
            (1u32 << count) - 1
        }
    }

    fn device_local_mask(&self) -> u32 {
        self.config
            .memory_types
            .iter()
            .enumerate()
            .filter(|(_, ty)| ty.properties.contains(MemoryProperties::DEVICE_LOCAL))
            .fold(0u32, |mask, (index, _)| mask | (1 << index))
    }

    fn consume_semaphore(&mut self, semaphore: RawSemaphore, context: &str) {
        match self.semaphores.get_mut(&semaphore) {
            Some(armed) if *armed => *armed = false,
            Some(_) => self.report(format!("{context} waits on a semaphore with no pending signal")),
            None => self.report(format!("{context} waits on unknown semaphore {semaphore:?}")),
        }
    }

    fn arm_semaphore(&mut self, semaphore: RawSemaphore, context: &str) {
        match self.semaphores.get_mut(&semaphore) {
            Some(armed) if !*armed => *armed = true,
            Some(_) => self.report(format!("{context} signals a semaphore that is already signaled")),
            None => self.report(format!("{context} signals unknown semaphore {semaphore:?}")),
        }
    }

    fn validate_write(&self, layout: &BindingLayout, write: &DescriptorWrite) -> RenderResult<()> {
        let slot = layout
            .slots()
            .iter()
            .find(|slot| slot.binding == write.binding)
            .ok_or_else(|| RenderError::InvalidArgument(format!("binding {} not in layout", write.binding)))?;

        if write.array_element >= slot.count {
            return Err(RenderError::InvalidArgument(format!(
                "element {} out of range for binding {} (count {})",
                write.array_element, write.binding, slot.count
            )));
        }

        match (slot.kind, write.resource) {
            (BindingKind::UniformBuffer, DescriptorResource::Buffer { buffer, offset, range }) => {
                let buf = self
                    .buffers
                    .get(&buffer)
                    .ok_or_else(|| RenderError::InvalidArgument(format!("unknown buffer {buffer:?}")))?;
                if !buf.usage.contains(BufferUsage::UNIFORM) {
                    return Err(RenderError::InvalidArgument("buffer lacks UNIFORM usage".to_string()));
                }
                if offset % self.config.limits.min_uniform_buffer_offset_alignment != 0 {
                    return Err(RenderError::InvalidArgument(format!("uniform offset {offset} is misaligned")));
                }
                if offset.checked_add(range).map_or(true, |end| end > buf.size) {
                    return Err(RenderError::InvalidArgument(format!(
                        "uniform range {offset}+{range} exceeds buffer size {}",
                        buf.size
                    )));
                }
                Ok(())
            }
            (BindingKind::CombinedImageSampler, DescriptorResource::ImageSampler { view, sampler, .. }) => {
                if !self.views.contains_key(&view) {
                    return Err(RenderError::InvalidArgument(format!("unknown image view {view:?}")));
                }
                if !self.samplers.contains(&sampler) {
                    return Err(RenderError::InvalidArgument(format!("unknown sampler {sampler:?}")));
                }
                Ok(())
            }
            (kind, _) => Err(RenderError::InvalidArgument(format!(
                "resource does not match {kind:?} binding {}",
                write.binding
            ))),
        }
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(HeadlessConfig::default())
    }
}

impl GpuBackend for HeadlessBackend {
    fn adapter_name(&self) -> &str {
        &self.config.adapter_name
    }

    fn memory_types(&self) -> &[MemoryType] {
        &self.config.memory_types
    }

    fn limits(&self) -> DeviceLimits {
        self.config.limits
    }

    fn supports_depth_format(&self, format: Format) -> bool {
        self.config.depth_formats.contains(&format)
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> RenderResult<(RawBuffer, MemoryRequirements)> {
        if desc.size == 0 {
            return Err(RenderError::InvalidArgument("buffer size must be non-zero".to_string()));
        }
        let handle = RawBuffer(self.next_handle());
        self.buffers.insert(
            handle,
            SimBuffer {
                size: desc.size,
                usage: desc.usage,
                binding: None,
            },
        );
        let requirements = MemoryRequirements {
            size: desc.size.next_multiple_of(16),
            alignment: 16,
            memory_type_bits: self.all_types_mask(),
        };
        Ok((handle, requirements))
    }

    fn create_image(&mut self, desc: &ImageDesc) -> RenderResult<(RawImage, MemoryRequirements)> {
        if desc.extent.is_empty() || desc.mip_levels == 0 || desc.array_layers == 0 {
            return Err(RenderError::InvalidArgument(format!("degenerate image {desc:?}")));
        }
        let handle = RawImage(self.next_handle());
        let image = SimImage::new(*desc, false);
        let size = (0..desc.mip_levels).map(|level| image.mip_bytes(level) as u64).sum::<u64>()
            * u64::from(desc.array_layers);
        self.images.insert(handle, image);
        let requirements = MemoryRequirements {
            size: size.next_multiple_of(256),
            alignment: 256,
            memory_type_bits: self.device_local_mask(),
        };
        Ok((handle, requirements))
    }

    fn allocate_memory(&mut self, size: u64, memory_type_index: u32) -> RenderResult<RawMemory> {
        let ty = *self
            .config
            .memory_types
            .get(memory_type_index as usize)
            .ok_or_else(|| RenderError::InvalidArgument(format!("memory type {memory_type_index} does not exist")))?;
        let heap = ty.heap_index as usize;
        let heap_size = self.config.heap_sizes.get(heap).copied().unwrap_or(0);
        if self.heap_usage[heap] + size > heap_size {
            return Err(RenderError::OutOfMemory {
                requested: size,
                properties: ty.properties,
            });
        }
        self.heap_usage[heap] += size;

        let len = usize::try_from(size).map_err(|_| RenderError::OutOfMemory {
            requested: size,
            properties: ty.properties,
        })?;
        let handle = RawMemory(self.next_handle());
        self.memory.insert(
            handle,
            SimMemory {
                type_index: memory_type_index,
                heap_index: ty.heap_index,
                bytes: vec![0; len],
                host_visible: ty.properties.contains(MemoryProperties::HOST_VISIBLE),
                mapped: false,
            },
        );
        Ok(handle)
    }

    fn bind_buffer_memory(&mut self, buffer: RawBuffer, memory: RawMemory, offset: u64) -> RenderResult<()> {
        let allocation = self
            .memory
            .get(&memory)
            .ok_or_else(|| RenderError::InvalidArgument(format!("unknown memory {memory:?}")))?;
        let allocation_size = allocation.bytes.len() as u64;
        let buf = self
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| RenderError::InvalidArgument(format!("unknown buffer {buffer:?}")))?;
        if buf.binding.is_some() {
            return Err(RenderError::invalid_operation("buffer memory already bound"));
        }
        if offset + buf.size > allocation_size {
            return Err(RenderError::InvalidArgument("buffer does not fit in allocation".to_string()));
        }
        buf.binding = Some((memory, offset));
        Ok(())
    }

    fn bind_image_memory(&mut self, image: RawImage, memory: RawMemory, _offset: u64) -> RenderResult<()> {
        let allocation = self
            .memory
            .get(&memory)
            .ok_or_else(|| RenderError::InvalidArgument(format!("unknown memory {memory:?}")))?;
        let device_local = self.config.memory_types[allocation.type_index as usize]
            .properties
            .contains(MemoryProperties::DEVICE_LOCAL);
        let img = self
            .images
            .get_mut(&image)
            .ok_or_else(|| RenderError::InvalidArgument(format!("unknown image {image:?}")))?;
        if !device_local {
            return Err(RenderError::InvalidArgument("images require device-local memory".to_string()));
        }
        img.bound = true;
        Ok(())
    }

    fn map_memory(&mut self, memory: RawMemory) -> RenderResult<()> {
        let allocation = self
            .memory
            .get_mut(&memory)
            .ok_or_else(|| RenderError::InvalidArgument(format!("unknown memory {memory:?}")))?;
        if !allocation.host_visible {
            return Err(RenderError::invalid_operation("cannot map memory that is not host-visible"));
        }
        allocation.mapped = true;
        Ok(())
    }

    fn write_mapped(&mut self, memory: RawMemory, offset: u64, data: &[u8]) -> RenderResult<()> {
        let allocation = self
            .memory
            .get_mut(&memory)
            .ok_or_else(|| RenderError::InvalidArgument(format!("unknown memory {memory:?}")))?;
        if !allocation.mapped {
            return Err(RenderError::invalid_operation("memory is not mapped"));
        }
        let start = usize::try_from(offset).map_err(|_| RenderError::InvalidArgument(format!("offset {offset} out of range")))?;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| RenderError::InvalidArgument(format!("write at {offset} overflows")))?;
        let dst = allocation
            .bytes
            .get_mut(start..end)
            .ok_or_else(|| RenderError::InvalidArgument(format!("write {start}..{end} out of bounds")))?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn read_mapped(&self, memory: RawMemory, offset: u64, out: &mut [u8]) -> RenderResult<()> {
        let allocation = self
            .memory
            .get(&memory)
            .ok_or_else(|| RenderError::InvalidArgument(format!("unknown memory {memory:?}")))?;
        if !allocation.mapped {
            return Err(RenderError::invalid_operation("memory is not mapped"));
        }
        let start = usize::try_from(offset).map_err(|_| RenderError::InvalidArgument(format!("offset {offset} out of range")))?;
        let end = start
            .checked_add(out.len())
            .ok_or_else(|| RenderError::InvalidArgument(format!("read at {offset} overflows")))?;
        let src = allocation
            .bytes
            .get(start..end)
            .ok_or_else(|| RenderError::InvalidArgument(format!("read {start}..{end} out of bounds")))?;
        out.copy_from_slice(src);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: RawBuffer) {
        if self.pending_commands().any(|cmd| command_uses_buffer(cmd, buffer)) {
            self.report(format!("buffer {buffer:?} destroyed while referenced by pending work"));
        }
        if self.buffers.remove(&buffer).is_none() {
            self.report(format!("destroying unknown buffer {buffer:?}"));
        }
    }

    fn destroy_image(&mut self, image: RawImage) {
        if self.pending_commands().any(|cmd| command_uses_image(cmd, image)) {
            self.report(format!("image {image:?} destroyed while referenced by pending work"));
        }
        match self.images.get(&image) {
            Some(img) if img.swapchain => self.report(format!("image {image:?} is owned by the swapchain")),
            Some(_) => {
                self.images.remove(&image);
            }
            None => self.report(format!("destroying unknown image {image:?}")),
        }
    }

    fn free_memory(&mut self, memory: RawMemory) {
        match self.memory.remove(&memory) {
            Some(allocation) => {
                let heap = allocation.heap_index as usize;
                self.heap_usage[heap] = self.heap_usage[heap].saturating_sub(allocation.bytes.len() as u64);
            }
            None => self.report(format!("freeing unknown memory {memory:?}")),
        }
    }

    fn create_image_view(&mut self, image: RawImage, desc: &ImageViewDesc) -> RenderResult<RawImageView> {
        let img = self
            .images
            .get(&image)
            .ok_or_else(|| RenderError::InvalidArgument(format!("unknown image {image:?}")))?;
        if desc.base_mip + desc.mip_count > img.desc.mip_levels {
            return Err(RenderError::InvalidArgument("view mip range exceeds image".to_string()));
        }
        let handle = RawImageView(self.next_handle());
        self.views.insert(handle, SimView { image, desc: *desc });
        Ok(handle)
    }

    fn destroy_image_view(&mut self, view: RawImageView) {
        if self.views.remove(&view).is_none() {
            self.report(format!("destroying unknown image view {view:?}"));
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> RenderResult<RawSampler> {
        if let Some(anisotropy) = desc.max_anisotropy {
            if anisotropy > self.config.limits.max_sampler_anisotropy {
                return Err(RenderError::InvalidArgument(format!("anisotropy {anisotropy} above device limit")));
            }
        }
        let handle = RawSampler(self.next_handle());
        self.samplers.insert(handle);
        Ok(handle)
    }

    fn destroy_sampler(&mut self, sampler: RawSampler) {
        self.samplers.remove(&sampler);
    }

    fn create_fence(&mut self, signaled: bool) -> RenderResult<RawFence> {
        let handle = RawFence(self.next_handle());
        self.fences.insert(handle, signaled);
        Ok(handle)
    }

    fn wait_for_fence(&mut self, fence: RawFence, _timeout_ns: u64) -> RenderResult<()> {
        self.check_alive()?;
        match self.fences.get(&fence) {
            Some(true) => return Ok(()),
            Some(false) => {}
            None => return Err(RenderError::InvalidArgument(format!("unknown fence {fence:?}"))),
        }

        let Some(position) = self.queue.iter().position(|op| op.signals(fence)) else {
            // Nothing queued will ever signal it: a real device would hang here.
            log::error!("Fence {:?} waited on with no pending submission", fence);
            return Err(RenderError::Timeout("fence"));
        };
        self.stats.blocking_fence_waits += 1;
        self.execute_through(position);
        Ok(())
    }

    fn fence_signaled(&self, fence: RawFence) -> RenderResult<bool> {
        self.fences
            .get(&fence)
            .copied()
            .ok_or_else(|| RenderError::InvalidArgument(format!("unknown fence {fence:?}")))
    }

    fn reset_fence(&mut self, fence: RawFence) -> RenderResult<()> {
        if self.queue.iter().any(|op| op.signals(fence)) {
            self.report(format!("fence {fence:?} reset while its submission is pending"));
        }
        let state = self
            .fences
            .get_mut(&fence)
            .ok_or_else(|| RenderError::InvalidArgument(format!("unknown fence {fence:?}")))?;
        *state = false;
        Ok(())
    }

    fn destroy_fence(&mut self, fence: RawFence) {
        if self.queue.iter().any(|op| op.signals(fence)) {
            self.report(format!("fence {fence:?} destroyed while its submission is pending"));
        }
        self.fences.remove(&fence);
    }

    fn create_semaphore(&mut self) -> RenderResult<RawSemaphore> {
        let handle = RawSemaphore(self.next_handle());
        self.semaphores.insert(handle, false);
        Ok(handle)
    }

    fn destroy_semaphore(&mut self, semaphore: RawSemaphore) {
        self.semaphores.remove(&semaphore);
    }

    fn create_descriptor_pool(&mut self, layout: &BindingLayout, max_sets: u32) -> RenderResult<RawDescriptorPool> {
        if max_sets == 0 {
            return Err(RenderError::InvalidArgument("descriptor pool needs at least one set".to_string()));
        }
        let handle = RawDescriptorPool(self.next_handle());
        self.pools.insert(
            handle,
            SimPool {
                layout: layout.clone(),
                max_sets,
                live: HashSet::new(),
            },
        );
        Ok(handle)
    }

    fn allocate_descriptor_set(
        &mut self,
        pool: RawDescriptorPool,
        layout: &BindingLayout,
    ) -> RenderResult<RawDescriptorSet> {
        let sim_pool = self
            .pools
            .get(&pool)
            .ok_or_else(|| RenderError::InvalidArgument(format!("unknown descriptor pool {pool:?}")))?;
        if sim_pool.layout != *layout {
            return Err(RenderError::InvalidArgument("layout does not match the pool's layout".to_string()));
        }
        if sim_pool.live.len() >= sim_pool.max_sets as usize {
            return Err(RenderError::PoolExhausted);
        }
        let handle = RawDescriptorSet(self.next_handle());
        if let Some(sim_pool) = self.pools.get_mut(&pool) {
            sim_pool.live.insert(handle);
        }
        self.sets.insert(
            handle,
            SimSet {
                pool,
                layout: layout.clone(),
                writes: HashMap::new(),
            },
        );
        Ok(handle)
    }

    fn free_descriptor_set(&mut self, pool: RawDescriptorPool, set: RawDescriptorSet) -> RenderResult<()> {
        if self.pending_commands().any(|cmd| command_uses_set(cmd, set)) {
            self.report(format!("descriptor set {set:?} freed while bound by pending work"));
        }
        let owner = self
            .sets
            .get(&set)
            .map(|s| s.pool)
            .ok_or_else(|| RenderError::InvalidArgument(format!("unknown descriptor set {set:?}")))?;
        if owner != pool {
            return Err(RenderError::InvalidArgument(format!(
                "descriptor set {set:?} belongs to {owner:?}, not {pool:?}"
            )));
        }
        self.sets.remove(&set);
        if let Some(sim_pool) = self.pools.get_mut(&pool) {
            sim_pool.live.remove(&set);
        }
        Ok(())
    }

    fn write_descriptor_set(&mut self, set: RawDescriptorSet, writes: &[DescriptorWrite]) -> RenderResult<()> {
        let layout = self
            .sets
            .get(&set)
            .map(|s| s.layout.clone())
            .ok_or_else(|| RenderError::InvalidArgument(format!("unknown descriptor set {set:?}")))?;
        if self.pending_commands().any(|cmd| command_uses_set(cmd, set)) {
            self.report(format!("descriptor set {set:?} updated while bound by pending work"));
        }
        for write in writes {
            self.validate_write(&layout, write)?;
        }
        if let Some(sim_set) = self.sets.get_mut(&set) {
            for write in writes {
                sim_set.writes.insert((write.binding, write.array_element), write.resource);
            }
        }
        Ok(())
    }

    fn destroy_descriptor_pool(&mut self, pool: RawDescriptorPool) {
        if let Some(sim_pool) = self.pools.remove(&pool) {
            for set in sim_pool.live {
                self.sets.remove(&set);
            }
        }
    }

    fn allocate_command_buffer(&mut self, queue: QueueKind) -> RenderResult<RawCommandBuffer> {
        let handle = RawCommandBuffer(self.next_handle());
        self.command_buffers.insert(
            handle,
            SimCommandBuffer {
                queue,
                commands: Vec::new(),
                pending: 0,
            },
        );
        Ok(handle)
    }

    fn free_command_buffer(&mut self, _queue: QueueKind, command_buffer: RawCommandBuffer) {
        if self.is_pending(command_buffer) {
            self.report(format!("command buffer {command_buffer:?} freed while pending"));
        }
        self.command_buffers.remove(&command_buffer);
    }

    fn record(&mut self, command_buffer: RawCommandBuffer, commands: &[Command]) -> RenderResult<()> {
        if self.is_pending(command_buffer) {
            self.report(format!("command buffer {command_buffer:?} re-recorded while pending"));
        }
        let cb = self
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or_else(|| RenderError::InvalidArgument(format!("unknown command buffer {command_buffer:?}")))?;
        cb.commands = commands.to_vec();
        Ok(())
    }

    fn submit(&mut self, queue: QueueKind, submit: &SubmitInfo) -> RenderResult<()> {
        self.check_alive()?;
        if queue == QueueKind::Graphics && self.injected_submit_failures > 0 {
            self.injected_submit_failures -= 1;
            return Err(RenderError::ResourceExhausted("injected submission failure".to_string()));
        }
        let context = format!("{queue:?} submission");

        for cb in &submit.command_buffers {
            if !self.command_buffers.contains_key(cb) {
                return Err(RenderError::InvalidArgument(format!("unknown command buffer {cb:?}")));
            }
        }
        for &(semaphore, _) in &submit.wait {
            self.consume_semaphore(semaphore, &context);
        }
        for &cb in &submit.command_buffers {
            if self.is_pending(cb) {
                self.report(format!("command buffer {cb:?} submitted while still pending"));
            }
            if let Some(sim) = self.command_buffers.get_mut(&cb) {
                if sim.queue != queue {
                    log::debug!("Command buffer {:?} allocated for {:?} submitted to {:?}", cb, sim.queue, queue);
                }
                sim.pending += 1;
            }
        }
        for &semaphore in &submit.signal {
            self.arm_semaphore(semaphore, &context);
        }
        if let Some(fence) = submit.fence {
            if self.fences.get(&fence) == Some(&true) {
                self.report(format!("{context} uses fence {fence:?} that is already signaled"));
            }
        }

        let id = self.next_handle();
        self.queue.push_back(QueueOp::Submit {
            id,
            command_buffers: submit.command_buffers.clone(),
            fence: submit.fence,
        });
        self.stats.submissions += 1;
        Ok(())
    }

    fn queue_wait_idle(&mut self, _queue: QueueKind) -> RenderResult<()> {
        self.check_alive()?;
        self.stats.queue_idle_waits += 1;
        self.execute_all();
        Ok(())
    }

    fn wait_idle(&mut self) -> RenderResult<()> {
        self.check_alive()?;
        self.execute_all();
        Ok(())
    }

    fn create_shader_module(&mut self, code: &[u32]) -> RenderResult<RawShaderModule> {
        if code.len() < 5 || code[0] != SPIRV_MAGIC {
            return Err(RenderError::ShaderOrPipelineBuildFailure(
                "shader code is not SPIR-V (bad magic or truncated header)".to_string(),
            ));
        }
        let handle = RawShaderModule(self.next_handle());
        self.shader_modules.insert(handle);
        Ok(handle)
    }

    fn destroy_shader_module(&mut self, module: RawShaderModule) {
        self.shader_modules.remove(&module);
    }

    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> RenderResult<RawRenderPass> {
        if desc.color.is_empty() && desc.depth.is_none() {
            return Err(RenderError::InvalidArgument("render pass without attachments".to_string()));
        }
        if let Some(depth) = &desc.depth {
            if !depth.format.is_depth() {
                return Err(RenderError::InvalidArgument(format!("{:?} is not a depth format", depth.format)));
            }
        }
        let handle = RawRenderPass(self.next_handle());
        self.render_passes.insert(handle, desc.clone());
        Ok(handle)
    }

    fn destroy_render_pass(&mut self, render_pass: RawRenderPass) {
        self.render_passes.remove(&render_pass);
    }

    fn create_framebuffer(
        &mut self,
        render_pass: RawRenderPass,
        attachments: &[RawImageView],
        extent: Extent2D,
    ) -> RenderResult<RawFramebuffer> {
        let desc = self
            .render_passes
            .get(&render_pass)
            .ok_or_else(|| RenderError::InvalidArgument(format!("unknown render pass {render_pass:?}")))?;
        if desc.attachments().count() != attachments.len() {
            return Err(RenderError::InvalidArgument(format!(
                "render pass expects {} attachments, got {}",
                desc.attachments().count(),
                attachments.len()
            )));
        }
        for view in attachments {
            let sim_view = self
                .views
                .get(view)
                .ok_or_else(|| RenderError::InvalidArgument(format!("unknown image view {view:?}")))?;
            let image_extent = self
                .images
                .get(&sim_view.image)
                .map(|img| img.mip_extent(sim_view.desc.base_mip))
                .ok_or(RenderError::StaleHandle { kind: "image" })?;
            if image_extent != extent {
                return Err(RenderError::InvalidArgument(format!(
                    "attachment extent {image_extent:?} does not match framebuffer extent {extent:?}"
                )));
            }
        }
        let handle = RawFramebuffer(self.next_handle());
        self.framebuffers.insert(
            handle,
            SimFramebuffer {
                render_pass,
                attachments: attachments.to_vec(),
            },
        );
        Ok(handle)
    }

    fn destroy_framebuffer(&mut self, framebuffer: RawFramebuffer) {
        self.framebuffers.remove(&framebuffer);
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> RenderResult<RawPipeline> {
        if !self.shader_modules.contains(&desc.vertex_shader) || !self.shader_modules.contains(&desc.fragment_shader)
        {
            return Err(RenderError::ShaderOrPipelineBuildFailure("unknown shader module".to_string()));
        }
        if !self.render_passes.contains_key(&desc.render_pass) {
            return Err(RenderError::ShaderOrPipelineBuildFailure("unknown render pass".to_string()));
        }
        if let Some(range) = desc.push_constants {
            if range.size > self.config.limits.max_push_constants_size {
                return Err(RenderError::ShaderOrPipelineBuildFailure(format!(
                    "push constant range of {} bytes exceeds device limit",
                    range.size
                )));
            }
        }
        let handle = RawPipeline(self.next_handle());
        self.pipelines.insert(handle, desc.clone());
        Ok(handle)
    }

    fn destroy_pipeline(&mut self, pipeline: RawPipeline) {
        self.pipelines.remove(&pipeline);
    }

    fn surface_extent(&self) -> Extent2D {
        self.surface_extent
    }

    fn create_swapchain(&mut self, request: &SwapchainRequest) -> RenderResult<SwapchainInfo> {
        self.check_alive()?;
        if self.surface_extent.is_empty() {
            return Err(RenderError::SurfaceOutOfDate);
        }
        self.destroy_swapchain();

        let format = match request.preferred_format {
            Format::B8G8R8A8Unorm | Format::B8G8R8A8Srgb => request.preferred_format,
            _ => self.config.surface_format,
        };
        let desc = ImageDesc {
            extent: self.surface_extent,
            format,
            mip_levels: 1,
            array_layers: 1,
            usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_SRC,
        };
        let images: Vec<RawImage> = (0..self.config.swapchain_image_count)
            .map(|_| {
                let handle = RawImage(self.next_handle());
                self.images.insert(handle, SimImage::new(desc, true));
                handle
            })
            .collect();

        log::info!(
            "Headless swapchain created: {}x{} {:?}, {} images",
            desc.extent.width,
            desc.extent.height,
            format,
            images.len()
        );
        self.swapchain = Some(SimSwapchain {
            holds: vec![ImageHold::Available; images.len()],
            images: images.clone(),
            format,
            extent: self.surface_extent,
            present_mode: request.present_mode,
            next_index: 0,
        });
        self.surface_changed = false;
        self.stats.swapchains_created += 1;

        Ok(SwapchainInfo {
            format,
            extent: self.surface_extent,
            present_mode: request.present_mode,
            images,
        })
    }

    fn destroy_swapchain(&mut self) {
        if let Some(swapchain) = self.swapchain.take() {
            if swapchain.holds.iter().any(|hold| *hold == ImageHold::QueuedForPresent) {
                self.report("swapchain destroyed with presents still queued".to_string());
            }
            for image in swapchain.images {
                self.images.remove(&image);
            }
        }
    }

    fn acquire_next_image(&mut self, signal: RawSemaphore, _timeout_ns: u64) -> RenderResult<AcquiredImage> {
        self.check_alive()?;
        if self.injected_acquire_failures > 0 {
            self.injected_acquire_failures -= 1;
            return Err(RenderError::SurfaceOutOfDate);
        }
        if self.surface_changed {
            return Err(RenderError::SurfaceOutOfDate);
        }
        let (index, hold) = match &self.swapchain {
            Some(swapchain) => {
                let index = swapchain.next_index;
                (index, swapchain.holds[index as usize])
            }
            None => return Err(RenderError::invalid_operation("acquire without a swapchain")),
        };

        match hold {
            ImageHold::Acquired => {
                self.report(format!("swapchain image {index} acquired twice without presenting"));
                return Err(RenderError::invalid_operation("no presentable image available"));
            }
            ImageHold::QueuedForPresent => {
                // The presentation engine still holds it: run the queue until it is released.
                if let Some(position) = self
                    .queue
                    .iter()
                    .position(|op| matches!(op, QueueOp::Present { image_index } if *image_index == index))
                {
                    self.execute_through(position);
                }
            }
            ImageHold::Available => {}
        }

        if let Some(swapchain) = self.swapchain.as_mut() {
            swapchain.holds[index as usize] = ImageHold::Acquired;
            swapchain.next_index = (index + 1) % swapchain.images.len() as u32;
        }
        self.arm_semaphore(signal, "acquire");
        Ok(AcquiredImage {
            index,
            suboptimal: false,
        })
    }

    fn present(&mut self, image_index: u32, wait: RawSemaphore) -> RenderResult<PresentStatus> {
        self.check_alive()?;
        let hold = self
            .swapchain
            .as_ref()
            .and_then(|swapchain| swapchain.holds.get(image_index as usize).copied())
            .ok_or_else(|| RenderError::InvalidArgument(format!("swapchain image {image_index} does not exist")))?;
        if hold != ImageHold::Acquired {
            self.report(format!("presenting swapchain image {image_index} that was not acquired"));
        }
        self.consume_semaphore(wait, "present");

        if self.surface_changed {
            if let Some(swapchain) = self.swapchain.as_mut() {
                swapchain.holds[image_index as usize] = ImageHold::Available;
            }
            return Err(RenderError::SurfaceOutOfDate);
        }

        if let Some(swapchain) = self.swapchain.as_mut() {
            swapchain.holds[image_index as usize] = ImageHold::QueuedForPresent;
        }
        self.queue.push_back(QueueOp::Present { image_index });
        Ok(PresentStatus::Optimal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::{ImageAspect, ImageBarrier};

    fn host_buffer(device: &mut HeadlessBackend, size: u64, usage: BufferUsage) -> (RawBuffer, RawMemory) {
        let (buffer, reqs) = device.create_buffer(&BufferDesc { size, usage }).unwrap();
        let memory = device.allocate_memory(reqs.size, 1).unwrap();
        device.bind_buffer_memory(buffer, memory, 0).unwrap();
        device.map_memory(memory).unwrap();
        (buffer, memory)
    }

    #[test]
    fn test_submitted_work_runs_only_when_waited() {
        let mut device = HeadlessBackend::default();
        let (src, src_mem) = host_buffer(&mut device, 4, BufferUsage::TRANSFER_SRC);
        let (dst, dst_mem) = host_buffer(&mut device, 4, BufferUsage::TRANSFER_DST);
        device.write_mapped(src_mem, 0, &[1, 2, 3, 4]).unwrap();

        let cb = device.allocate_command_buffer(QueueKind::Transfer).unwrap();
        device
            .record(
                cb,
                &[Command::CopyBuffer {
                    src,
                    dst,
                    src_offset: 0,
                    dst_offset: 0,
                    size: 4,
                }],
            )
            .unwrap();
        let fence = device.create_fence(false).unwrap();
        device
            .submit(
                QueueKind::Transfer,
                &SubmitInfo {
                    command_buffers: vec![cb],
                    fence: Some(fence),
                    ..SubmitInfo::default()
                },
            )
            .unwrap();

        let mut out = [0u8; 4];
        device.read_mapped(dst_mem, 0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 0, 0]);
        assert!(device.is_pending(cb));

        device.wait_for_fence(fence, u64::MAX).unwrap();
        device.read_mapped(dst_mem, 0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(device.fence_signaled(fence).unwrap());
        assert!(!device.is_pending(cb));
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_waiting_on_unsubmitted_fence_times_out() {
        let mut device = HeadlessBackend::default();
        let fence = device.create_fence(false).unwrap();
        assert!(matches!(device.wait_for_fence(fence, 1), Err(RenderError::Timeout(_))));
    }

    #[test]
    fn test_barrier_with_wrong_old_layout_is_reported() {
        let mut device = HeadlessBackend::default();
        let (image, reqs) = device
            .create_image(&ImageDesc {
                extent: Extent2D::new(4, 4),
                format: Format::R8G8B8A8Unorm,
                mip_levels: 1,
                array_layers: 1,
                usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
            })
            .unwrap();
        let memory = device.allocate_memory(reqs.size, 0).unwrap();
        device.bind_image_memory(image, memory, 0).unwrap();

        let cb = device.allocate_command_buffer(QueueKind::Graphics).unwrap();
        device
            .record(
                cb,
                &[Command::ImageBarrier(ImageBarrier {
                    image,
                    aspect: ImageAspect::Color,
                    old_layout: ImageLayout::TransferDst,
                    new_layout: ImageLayout::ShaderReadOnly,
                    base_mip: 0,
                    mip_count: 1,
                })],
            )
            .unwrap();
        device
            .submit(
                QueueKind::Graphics,
                &SubmitInfo {
                    command_buffers: vec![cb],
                    ..SubmitInfo::default()
                },
            )
            .unwrap();
        device.queue_wait_idle(QueueKind::Graphics).unwrap();

        assert_eq!(device.validation_errors().len(), 1);
        assert_eq!(device.image_layout(image, 0), Some(ImageLayout::ShaderReadOnly));
    }

    #[test]
    fn test_heap_exhaustion_is_out_of_memory() {
        let mut device = HeadlessBackend::new(HeadlessConfig {
            heap_sizes: vec![1024, 1024],
            ..HeadlessConfig::default()
        });
        assert!(device.allocate_memory(1024, 1).is_ok());
        assert!(matches!(
            device.allocate_memory(16, 2),
            Err(RenderError::OutOfMemory { requested: 16, .. })
        ));
    }

    #[test]
    fn test_resized_surface_reports_out_of_date_until_recreated() {
        let mut device = HeadlessBackend::default();
        let request = SwapchainRequest {
            extent: Extent2D::new(800, 600),
            preferred_format: Format::B8G8R8A8Unorm,
            present_mode: PresentMode::Fifo,
        };
        device.create_swapchain(&request).unwrap();
        let semaphore = device.create_semaphore().unwrap();

        device.resize_surface(Extent2D::new(1024, 768));
        assert!(matches!(
            device.acquire_next_image(semaphore, u64::MAX),
            Err(RenderError::SurfaceOutOfDate)
        ));

        let info = device.create_swapchain(&request).unwrap();
        assert_eq!(info.extent, Extent2D::new(1024, 768));
        assert_eq!(device.acquire_next_image(semaphore, u64::MAX).unwrap().index, 0);
    }

    #[test]
    fn test_downsample_averages_quads() {
        let src = [0u8, 0, 0, 0, 4, 4, 4, 4, 8, 8, 8, 8, 12, 12, 12, 12];
        let out = objects::downsample(&src, Extent2D::new(2, 2), Extent2D::new(1, 1), 4);
        assert_eq!(out, vec![6, 6, 6, 6]);
    }
}
