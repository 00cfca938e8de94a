use super::command::Command;
use super::types::{
    AcquiredImage, BindingLayout, BufferDesc, DescriptorWrite, DeviceLimits, Extent2D, Format, ImageDesc,
    ImageViewDesc, MemoryRequirements, MemoryType, PipelineDesc, PresentStatus, QueueKind, RawBuffer,
    RawCommandBuffer, RawDescriptorPool, RawDescriptorSet, RawFence, RawFramebuffer, RawImage, RawImageView,
    RawMemory, RawPipeline, RawRenderPass, RawSampler, RawSemaphore, RawShaderModule, RenderPassDesc, SamplerDesc,
    SubmitInfo, SwapchainInfo, SwapchainRequest,
};
use crate::render::RenderResult;

/// Raw graphics-API surface driven by the render core
///
/// Backends own the native objects behind every `Raw*` handle. The core keeps
/// its own generational tables on top (see [`crate::render::RenderDevice`]),
/// so implementations only need to map raw ids to native objects.
///
/// Errors from the native API must be mapped onto the [`RenderError`]
/// taxonomy: out-of-date and suboptimal surfaces, device loss, memory
/// exhaustion and descriptor pool exhaustion each have their own variant.
///
/// [`RenderError`]: crate::render::RenderError
pub trait GpuBackend {
    /// Human readable adapter name
    fn adapter_name(&self) -> &str;

    /// Physical memory types, indexed by memory type index
    fn memory_types(&self) -> &[MemoryType];

    /// Limits the core depends on
    fn limits(&self) -> DeviceLimits;

    /// Whether `format` can be used as a depth attachment
    fn supports_depth_format(&self, format: Format) -> bool;

    // Memory and resources

    /// Create an unbound buffer and report its memory requirements
    fn create_buffer(&mut self, desc: &BufferDesc) -> RenderResult<(RawBuffer, MemoryRequirements)>;

    /// Create an unbound 2D image and report its memory requirements
    fn create_image(&mut self, desc: &ImageDesc) -> RenderResult<(RawImage, MemoryRequirements)>;

    /// Allocate `size` bytes from memory type `memory_type_index`
    fn allocate_memory(&mut self, size: u64, memory_type_index: u32) -> RenderResult<RawMemory>;

    /// Bind buffer storage
    fn bind_buffer_memory(&mut self, buffer: RawBuffer, memory: RawMemory, offset: u64) -> RenderResult<()>;

    /// Bind image storage
    fn bind_image_memory(&mut self, image: RawImage, memory: RawMemory, offset: u64) -> RenderResult<()>;

    /// Persistently map a host-visible allocation
    fn map_memory(&mut self, memory: RawMemory) -> RenderResult<()>;

    /// Copy `data` into a mapped allocation
    fn write_mapped(&mut self, memory: RawMemory, offset: u64, data: &[u8]) -> RenderResult<()>;

    /// Copy from a mapped allocation into `out`
    fn read_mapped(&self, memory: RawMemory, offset: u64, out: &mut [u8]) -> RenderResult<()>;

    /// Destroy a buffer
    fn destroy_buffer(&mut self, buffer: RawBuffer);

    /// Destroy an image
    fn destroy_image(&mut self, image: RawImage);

    /// Free an allocation (unmapping it first when mapped)
    fn free_memory(&mut self, memory: RawMemory);

    /// Create a view of an image (owned or swapchain)
    fn create_image_view(&mut self, image: RawImage, desc: &ImageViewDesc) -> RenderResult<RawImageView>;

    /// Destroy an image view
    fn destroy_image_view(&mut self, view: RawImageView);

    /// Create a sampler
    fn create_sampler(&mut self, desc: &SamplerDesc) -> RenderResult<RawSampler>;

    /// Destroy a sampler
    fn destroy_sampler(&mut self, sampler: RawSampler);

    // Synchronization

    /// Create a fence, optionally already signaled
    fn create_fence(&mut self, signaled: bool) -> RenderResult<RawFence>;

    /// Block until the fence signals or `timeout_ns` elapses
    fn wait_for_fence(&mut self, fence: RawFence, timeout_ns: u64) -> RenderResult<()>;

    /// Non-blocking fence query
    fn fence_signaled(&self, fence: RawFence) -> RenderResult<bool>;

    /// Return a fence to the unsignaled state
    fn reset_fence(&mut self, fence: RawFence) -> RenderResult<()>;

    /// Destroy a fence
    fn destroy_fence(&mut self, fence: RawFence);

    /// Create a binary semaphore
    fn create_semaphore(&mut self) -> RenderResult<RawSemaphore>;

    /// Destroy a semaphore
    fn destroy_semaphore(&mut self, semaphore: RawSemaphore);

    // Binding sets

    /// Create a pool able to hold `max_sets` sets of `layout`
    fn create_descriptor_pool(&mut self, layout: &BindingLayout, max_sets: u32) -> RenderResult<RawDescriptorPool>;

    /// Allocate one set; returns [`RenderError::PoolExhausted`] when the pool is full
    ///
    /// [`RenderError::PoolExhausted`]: crate::render::RenderError::PoolExhausted
    fn allocate_descriptor_set(
        &mut self,
        pool: RawDescriptorPool,
        layout: &BindingLayout,
    ) -> RenderResult<RawDescriptorSet>;

    /// Return one set to its pool
    fn free_descriptor_set(&mut self, pool: RawDescriptorPool, set: RawDescriptorSet) -> RenderResult<()>;

    /// Point bindings of a set at resources
    fn write_descriptor_set(&mut self, set: RawDescriptorSet, writes: &[DescriptorWrite]) -> RenderResult<()>;

    /// Destroy a pool and every set allocated from it
    fn destroy_descriptor_pool(&mut self, pool: RawDescriptorPool);

    // Commands and queues

    /// Allocate a primary command buffer for `queue`
    fn allocate_command_buffer(&mut self, queue: QueueKind) -> RenderResult<RawCommandBuffer>;

    /// Free a command buffer
    fn free_command_buffer(&mut self, queue: QueueKind, command_buffer: RawCommandBuffer);

    /// Replace the contents of a command buffer with `commands`
    fn record(&mut self, command_buffer: RawCommandBuffer, commands: &[Command]) -> RenderResult<()>;

    /// Submit work to a queue
    fn submit(&mut self, queue: QueueKind, submit: &SubmitInfo) -> RenderResult<()>;

    /// Block until `queue` has no outstanding work
    fn queue_wait_idle(&mut self, queue: QueueKind) -> RenderResult<()>;

    /// Block until the whole device is idle
    fn wait_idle(&mut self) -> RenderResult<()>;

    // Pipelines

    /// Create a shader module from SPIR-V words
    fn create_shader_module(&mut self, code: &[u32]) -> RenderResult<RawShaderModule>;

    /// Destroy a shader module
    fn destroy_shader_module(&mut self, module: RawShaderModule);

    /// Create a single-subpass render pass
    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> RenderResult<RawRenderPass>;

    /// Destroy a render pass
    fn destroy_render_pass(&mut self, render_pass: RawRenderPass);

    /// Associate image views with a render pass
    fn create_framebuffer(
        &mut self,
        render_pass: RawRenderPass,
        attachments: &[RawImageView],
        extent: Extent2D,
    ) -> RenderResult<RawFramebuffer>;

    /// Destroy a framebuffer
    fn destroy_framebuffer(&mut self, framebuffer: RawFramebuffer);

    /// Create a graphics pipeline and its layout
    fn create_pipeline(&mut self, desc: &PipelineDesc) -> RenderResult<RawPipeline>;

    /// Destroy a pipeline and its layout
    fn destroy_pipeline(&mut self, pipeline: RawPipeline);

    // Presentation

    /// Current extent of the presentation surface
    fn surface_extent(&self) -> Extent2D;

    /// Create (or recreate, retiring the old one) the swapchain
    fn create_swapchain(&mut self, request: &SwapchainRequest) -> RenderResult<SwapchainInfo>;

    /// Destroy the swapchain; its images become invalid
    fn destroy_swapchain(&mut self);

    /// Acquire the next presentable image, signaling `signal` when it is ready
    fn acquire_next_image(&mut self, signal: RawSemaphore, timeout_ns: u64) -> RenderResult<AcquiredImage>;

    /// Queue `image_index` for presentation after `wait` signals
    fn present(&mut self, image_index: u32, wait: RawSemaphore) -> RenderResult<PresentStatus>;
}
