//! [`GpuBackend`] over a Vulkan device

use std::collections::HashMap;
use std::ffi::{c_void, CStr};

use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::vk::{self, Handle};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

use super::context::{LogicalDevice, PhysicalDeviceInfo, VulkanInstance};
use super::conversion::{
    address_mode, aspect_flags, buffer_usage, clear_value, descriptor_type, filter, format_from_vk, format_to_vk,
    image_usage, layout_scope, layout_to_vk, load_op, memory_properties, pipeline_stage, present_mode_from_vk,
    shader_stages, store_op, vertex_format,
};
use super::swapchain::Swapchain;
use crate::core::RendererConfig;
use crate::render::api::{
    AcquiredImage, BindingLayout, BufferDesc, Command, DescriptorResource, DescriptorWrite, DeviceLimits, Extent2D,
    Format, GpuBackend, ImageBarrier, ImageDesc, ImageViewDesc, MemoryProperties, MemoryRequirements, MemoryType,
    PipelineDesc, PresentStatus, QueueKind, RawBuffer, RawCommandBuffer, RawDescriptorPool,
    RawDescriptorSet, RawFence, RawFramebuffer, RawImage, RawImageView, RawMemory, RawPipeline, RawRenderPass,
    RawSampler, RawSemaphore, RawShaderModule, RenderPassDesc, SamplerDesc, SubmitInfo, SwapchainInfo,
    SwapchainRequest,
};
use crate::render::{RenderError, RenderResult};

const ENTRY_POINT: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

struct PipelineEntry {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    push_stages: vk::ShaderStageFlags,
}

/// Vulkan implementation of [`GpuBackend`]
///
/// Raw handles carry the native handle value, so most calls convert with
/// [`Handle::from_raw`] instead of a lookup. Only state Vulkan does not keep
/// for us (mapped pointers, pipeline layouts, image formats, cached set
/// layouts) lives in side tables.
pub struct VulkanBackend {
    adapter_name: String,
    memory_types: Vec<MemoryType>,
    limits: DeviceLimits,
    physical: PhysicalDeviceInfo,
    device: LogicalDevice,
    swapchain_loader: SwapchainLoader,
    swapchain: Option<Swapchain>,
    surface_loader: Surface,
    surface: vk::SurfaceKHR,
    window_extent: Extent2D,
    command_pools: HashMap<QueueKind, vk::CommandPool>,
    mapped: HashMap<RawMemory, *mut c_void>,
    image_formats: HashMap<RawImage, Format>,
    set_layouts: HashMap<BindingLayout, vk::DescriptorSetLayout>,
    pipelines: HashMap<RawPipeline, PipelineEntry>,
    instance: VulkanInstance,
}

impl VulkanBackend {
    /// Create the instance, surface and device for a window
    pub fn new<W>(window: &W, config: &RendererConfig) -> RenderResult<Self>
    where
        W: HasRawWindowHandle + HasRawDisplayHandle,
    {
        let display = window.raw_display_handle();
        let instance = VulkanInstance::new(
            display,
            &config.application_name,
            config.application_version,
            config.validation_enabled(),
        )?;

        let surface_loader = Surface::new(&instance.entry, &instance.instance);
        let surface = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.instance,
                display,
                window.raw_window_handle(),
                None,
            )?
        };

        let physical = PhysicalDeviceInfo::select_suitable_device(&instance.instance, surface, &surface_loader)?;
        let device = LogicalDevice::new(&instance.instance, &physical)?;
        let swapchain_loader = SwapchainLoader::new(&instance.instance, &device.device);

        let mut command_pools = HashMap::new();
        for (queue, family) in [
            (QueueKind::Graphics, physical.graphics_family),
            (QueueKind::Transfer, physical.transfer_family),
        ] {
            let pool_info = vk::CommandPoolCreateInfo::builder()
                .queue_family_index(family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            let pool = unsafe { device.device.create_command_pool(&pool_info, None)? };
            command_pools.insert(queue, pool);
        }

        let memory_types = physical.memory.memory_types[..physical.memory.memory_type_count as usize]
            .iter()
            .map(|ty| MemoryType {
                properties: memory_properties(ty.property_flags),
                heap_index: ty.heap_index,
            })
            .collect();
        let device_limits = physical.properties.limits;
        let limits = DeviceLimits {
            min_uniform_buffer_offset_alignment: device_limits.min_uniform_buffer_offset_alignment,
            max_push_constants_size: device_limits.max_push_constants_size,
            max_sampler_anisotropy: if physical.features.sampler_anisotropy == vk::TRUE {
                device_limits.max_sampler_anisotropy
            } else {
                0.0
            },
        };

        Ok(Self {
            adapter_name: physical.name(),
            memory_types,
            limits,
            physical,
            device,
            swapchain_loader,
            swapchain: None,
            surface_loader,
            surface,
            window_extent: Extent2D::new(config.surface.width, config.surface.height),
            command_pools,
            mapped: HashMap::new(),
            image_formats: HashMap::new(),
            set_layouts: HashMap::new(),
            pipelines: HashMap::new(),
            instance,
        })
    }

    /// Record the window's framebuffer size, used when the surface leaves it to us
    pub fn set_window_extent(&mut self, extent: Extent2D) {
        self.window_extent = extent;
    }

    fn raw(&self) -> &ash::Device {
        &self.device.device
    }

    fn queue(&self, kind: QueueKind) -> vk::Queue {
        match kind {
            QueueKind::Graphics => self.device.graphics_queue,
            QueueKind::Transfer => self.device.transfer_queue,
        }
    }

    fn command_pool(&self, kind: QueueKind) -> RenderResult<vk::CommandPool> {
        self.command_pools
            .get(&kind)
            .copied()
            .ok_or_else(|| RenderError::invalid_operation(format!("no command pool for {kind:?}")))
    }

    fn set_layout(&mut self, layout: &BindingLayout) -> RenderResult<vk::DescriptorSetLayout> {
        if let Some(existing) = self.set_layouts.get(layout) {
            return Ok(*existing);
        }
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = layout
            .slots()
            .iter()
            .map(|slot| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(slot.binding)
                    .descriptor_type(descriptor_type(slot.kind))
                    .descriptor_count(slot.count)
                    .stage_flags(shader_stages(slot.stages))
                    .build()
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let created = unsafe { self.raw().create_descriptor_set_layout(&info, None)? };
        self.set_layouts.insert(layout.clone(), created);
        Ok(created)
    }

    fn record_command(&self, cb: vk::CommandBuffer, command: &Command) {
        let device = self.raw();
        unsafe {
            match command {
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    extent,
                    clear_values,
                } => {
                    let clears: Vec<vk::ClearValue> = clear_values.iter().copied().map(clear_value).collect();
                    let info = vk::RenderPassBeginInfo::builder()
                        .render_pass(vk::RenderPass::from_raw(render_pass.0))
                        .framebuffer(vk::Framebuffer::from_raw(framebuffer.0))
                        .render_area(vk::Rect2D {
                            offset: vk::Offset2D { x: 0, y: 0 },
                            extent: vk::Extent2D {
                                width: extent.width,
                                height: extent.height,
                            },
                        })
                        .clear_values(&clears);
                    device.cmd_begin_render_pass(cb, &info, vk::SubpassContents::INLINE);
                }
                Command::EndRenderPass => device.cmd_end_render_pass(cb),
                Command::BindPipeline(pipeline) => {
                    if let Some(entry) = self.pipelines.get(pipeline) {
                        device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, entry.pipeline);
                    }
                }
                Command::SetViewportScissor(extent) => {
                    let viewport = vk::Viewport {
                        x: 0.0,
                        y: 0.0,
                        width: extent.width as f32,
                        height: extent.height as f32,
                        min_depth: 0.0,
                        max_depth: 1.0,
                    };
                    let scissor = vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent: vk::Extent2D {
                            width: extent.width,
                            height: extent.height,
                        },
                    };
                    device.cmd_set_viewport(cb, 0, &[viewport]);
                    device.cmd_set_scissor(cb, 0, &[scissor]);
                }
                Command::BindBindingSet { pipeline, index, set } => {
                    if let Some(entry) = self.pipelines.get(pipeline) {
                        device.cmd_bind_descriptor_sets(
                            cb,
                            vk::PipelineBindPoint::GRAPHICS,
                            entry.layout,
                            *index,
                            &[vk::DescriptorSet::from_raw(set.0)],
                            &[],
                        );
                    }
                }
                Command::PushConstants { pipeline, offset, data } => {
                    if let Some(entry) = self.pipelines.get(pipeline) {
                        device.cmd_push_constants(cb, entry.layout, entry.push_stages, *offset, data);
                    }
                }
                Command::BindVertexBuffer { buffer, offset } => {
                    device.cmd_bind_vertex_buffers(cb, 0, &[vk::Buffer::from_raw(buffer.0)], &[*offset]);
                }
                Command::BindIndexBuffer { buffer, offset } => {
                    device.cmd_bind_index_buffer(cb, vk::Buffer::from_raw(buffer.0), *offset, vk::IndexType::UINT32);
                }
                Command::Draw {
                    vertex_count,
                    first_vertex,
                } => device.cmd_draw(cb, *vertex_count, 1, *first_vertex, 0),
                Command::DrawIndexed {
                    index_count,
                    first_index,
                    vertex_offset,
                } => device.cmd_draw_indexed(cb, *index_count, 1, *first_index, *vertex_offset, 0),
                Command::CopyBuffer {
                    src,
                    dst,
                    src_offset,
                    dst_offset,
                    size,
                } => {
                    let region = vk::BufferCopy {
                        src_offset: *src_offset,
                        dst_offset: *dst_offset,
                        size: *size,
                    };
                    device.cmd_copy_buffer(cb, vk::Buffer::from_raw(src.0), vk::Buffer::from_raw(dst.0), &[region]);
                }
                Command::CopyBufferToImage {
                    buffer,
                    image,
                    mip_level,
                    extent,
                } => {
                    let region = buffer_image_region(*mip_level, *extent);
                    device.cmd_copy_buffer_to_image(
                        cb,
                        vk::Buffer::from_raw(buffer.0),
                        vk::Image::from_raw(image.0),
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
                Command::CopyImageToBuffer {
                    image,
                    buffer,
                    mip_level,
                    extent,
                } => {
                    let region = buffer_image_region(*mip_level, *extent);
                    device.cmd_copy_image_to_buffer(
                        cb,
                        vk::Image::from_raw(image.0),
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        vk::Buffer::from_raw(buffer.0),
                        &[region],
                    );
                }
                Command::BlitMip {
                    image,
                    src_mip,
                    src_extent,
                } => {
                    let dst_extent = src_extent.mip(1);
                    let blit = vk::ImageBlit {
                        src_subresource: color_layers(*src_mip),
                        src_offsets: [vk::Offset3D::default(), offset_3d(*src_extent)],
                        dst_subresource: color_layers(src_mip + 1),
                        dst_offsets: [vk::Offset3D::default(), offset_3d(dst_extent)],
                    };
                    let handle = vk::Image::from_raw(image.0);
                    device.cmd_blit_image(
                        cb,
                        handle,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        handle,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[blit],
                        vk::Filter::LINEAR,
                    );
                }
                Command::ImageBarrier(barrier) => self.record_barrier(cb, barrier),
            }
        }
    }

    fn record_barrier(&self, cb: vk::CommandBuffer, barrier: &ImageBarrier) {
        let (src_stage, src_access) = layout_scope(barrier.old_layout);
        let (dst_stage, dst_access) = layout_scope(barrier.new_layout);
        let format = self.image_formats.get(&barrier.image).copied();
        let image_barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(layout_to_vk(barrier.old_layout))
            .new_layout(layout_to_vk(barrier.new_layout))
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(vk::Image::from_raw(barrier.image.0))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_flags(barrier.aspect, format),
                base_mip_level: barrier.base_mip,
                level_count: barrier.mip_count,
                base_array_layer: 0,
                layer_count: 1,
            })
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .build();
        unsafe {
            self.raw().cmd_pipeline_barrier(
                cb,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[image_barrier],
            );
        }
    }
}

fn color_layers(mip_level: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn offset_3d(extent: Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    }
}

fn buffer_image_region(mip_level: u32, extent: Extent2D) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: color_layers(mip_level),
        image_offset: vk::Offset3D::default(),
        image_extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
    }
}

impl GpuBackend for VulkanBackend {
    fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn memory_types(&self) -> &[MemoryType] {
        &self.memory_types
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn supports_depth_format(&self, format: Format) -> bool {
        let properties = unsafe {
            self.instance
                .instance
                .get_physical_device_format_properties(self.physical.device, format_to_vk(format))
        };
        properties
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> RenderResult<(RawBuffer, MemoryRequirements)> {
        let info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.raw().create_buffer(&info, None)? };
        let reqs = unsafe { self.raw().get_buffer_memory_requirements(buffer) };
        Ok((
            RawBuffer(buffer.as_raw()),
            MemoryRequirements {
                size: reqs.size,
                alignment: reqs.alignment,
                memory_type_bits: reqs.memory_type_bits,
            },
        ))
    }

    fn create_image(&mut self, desc: &ImageDesc) -> RenderResult<(RawImage, MemoryRequirements)> {
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format_to_vk(desc.format))
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(image_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.raw().create_image(&info, None)? };
        let reqs = unsafe { self.raw().get_image_memory_requirements(image) };
        let raw = RawImage(image.as_raw());
        self.image_formats.insert(raw, desc.format);
        Ok((
            raw,
            MemoryRequirements {
                size: reqs.size,
                alignment: reqs.alignment,
                memory_type_bits: reqs.memory_type_bits,
            },
        ))
    }

    fn allocate_memory(&mut self, size: u64, memory_type_index: u32) -> RenderResult<RawMemory> {
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        let memory = unsafe { self.raw().allocate_memory(&info, None) }.map_err(|err| match err {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                RenderError::OutOfMemory {
                    requested: size,
                    properties: self
                        .memory_types
                        .get(memory_type_index as usize)
                        .map_or(MemoryProperties::empty(), |ty| ty.properties),
                }
            }
            other => RenderError::from(other),
        })?;
        Ok(RawMemory(memory.as_raw()))
    }

    fn bind_buffer_memory(&mut self, buffer: RawBuffer, memory: RawMemory, offset: u64) -> RenderResult<()> {
        unsafe {
            self.raw().bind_buffer_memory(
                vk::Buffer::from_raw(buffer.0),
                vk::DeviceMemory::from_raw(memory.0),
                offset,
            )?;
        }
        Ok(())
    }

    fn bind_image_memory(&mut self, image: RawImage, memory: RawMemory, offset: u64) -> RenderResult<()> {
        unsafe {
            self.raw()
                .bind_image_memory(vk::Image::from_raw(image.0), vk::DeviceMemory::from_raw(memory.0), offset)?;
        }
        Ok(())
    }

    fn map_memory(&mut self, memory: RawMemory) -> RenderResult<()> {
        let ptr = unsafe {
            self.raw().map_memory(
                vk::DeviceMemory::from_raw(memory.0),
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )?
        };
        self.mapped.insert(memory, ptr);
        Ok(())
    }

    fn write_mapped(&mut self, memory: RawMemory, offset: u64, data: &[u8]) -> RenderResult<()> {
        let ptr = self
            .mapped
            .get(&memory)
            .copied()
            .ok_or_else(|| RenderError::invalid_operation("memory is not mapped"))?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>().add(offset as usize), data.len());
        }
        Ok(())
    }

    fn read_mapped(&self, memory: RawMemory, offset: u64, out: &mut [u8]) -> RenderResult<()> {
        let ptr = self
            .mapped
            .get(&memory)
            .copied()
            .ok_or_else(|| RenderError::invalid_operation("memory is not mapped"))?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.cast::<u8>().add(offset as usize), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: RawBuffer) {
        unsafe { self.raw().destroy_buffer(vk::Buffer::from_raw(buffer.0), None) };
    }

    fn destroy_image(&mut self, image: RawImage) {
        self.image_formats.remove(&image);
        unsafe { self.raw().destroy_image(vk::Image::from_raw(image.0), None) };
    }

    fn free_memory(&mut self, memory: RawMemory) {
        let handle = vk::DeviceMemory::from_raw(memory.0);
        unsafe {
            if self.mapped.remove(&memory).is_some() {
                self.raw().unmap_memory(handle);
            }
            self.raw().free_memory(handle, None);
        }
    }

    fn create_image_view(&mut self, image: RawImage, desc: &ImageViewDesc) -> RenderResult<RawImageView> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(vk::Image::from_raw(image.0))
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format_to_vk(desc.format))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_flags(desc.aspect, Some(desc.format)),
                base_mip_level: desc.base_mip,
                level_count: desc.mip_count,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe { self.raw().create_image_view(&info, None)? };
        Ok(RawImageView(view.as_raw()))
    }

    fn destroy_image_view(&mut self, view: RawImageView) {
        unsafe { self.raw().destroy_image_view(vk::ImageView::from_raw(view.0), None) };
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> RenderResult<RawSampler> {
        let anisotropy = desc.max_anisotropy.filter(|_| self.limits.max_sampler_anisotropy > 0.0);
        let mode = address_mode(desc.address_mode);
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(filter(desc.filter))
            .min_filter(filter(desc.filter))
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(mode)
            .address_mode_v(mode)
            .address_mode_w(mode)
            .anisotropy_enable(anisotropy.is_some())
            .max_anisotropy(anisotropy.unwrap_or(1.0).min(self.limits.max_sampler_anisotropy.max(1.0)))
            .compare_enable(false)
            .min_lod(0.0)
            .max_lod(desc.max_lod)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false);
        let sampler = unsafe { self.raw().create_sampler(&info, None)? };
        Ok(RawSampler(sampler.as_raw()))
    }

    fn destroy_sampler(&mut self, sampler: RawSampler) {
        unsafe { self.raw().destroy_sampler(vk::Sampler::from_raw(sampler.0), None) };
    }

    fn create_fence(&mut self, signaled: bool) -> RenderResult<RawFence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe { self.raw().create_fence(&vk::FenceCreateInfo::builder().flags(flags), None)? };
        Ok(RawFence(fence.as_raw()))
    }

    fn wait_for_fence(&mut self, fence: RawFence, timeout_ns: u64) -> RenderResult<()> {
        unsafe {
            self.raw()
                .wait_for_fences(&[vk::Fence::from_raw(fence.0)], true, timeout_ns)
                .map_err(|err| match err {
                    vk::Result::TIMEOUT => RenderError::Timeout("fence"),
                    other => RenderError::from(other),
                })
        }
    }

    fn fence_signaled(&self, fence: RawFence) -> RenderResult<bool> {
        Ok(unsafe { self.raw().get_fence_status(vk::Fence::from_raw(fence.0))? })
    }

    fn reset_fence(&mut self, fence: RawFence) -> RenderResult<()> {
        unsafe { self.raw().reset_fences(&[vk::Fence::from_raw(fence.0)])? };
        Ok(())
    }

    fn destroy_fence(&mut self, fence: RawFence) {
        unsafe { self.raw().destroy_fence(vk::Fence::from_raw(fence.0), None) };
    }

    fn create_semaphore(&mut self) -> RenderResult<RawSemaphore> {
        let semaphore = unsafe { self.raw().create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? };
        Ok(RawSemaphore(semaphore.as_raw()))
    }

    fn destroy_semaphore(&mut self, semaphore: RawSemaphore) {
        unsafe { self.raw().destroy_semaphore(vk::Semaphore::from_raw(semaphore.0), None) };
    }

    fn create_descriptor_pool(&mut self, layout: &BindingLayout, max_sets: u32) -> RenderResult<RawDescriptorPool> {
        let sizes: Vec<vk::DescriptorPoolSize> = layout
            .descriptor_totals(max_sets)
            .into_iter()
            .map(|(kind, count)| vk::DescriptorPoolSize {
                ty: descriptor_type(kind),
                descriptor_count: count,
            })
            .collect();
        let info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(&sizes);
        let pool = unsafe { self.raw().create_descriptor_pool(&info, None)? };
        Ok(RawDescriptorPool(pool.as_raw()))
    }

    fn allocate_descriptor_set(
        &mut self,
        pool: RawDescriptorPool,
        layout: &BindingLayout,
    ) -> RenderResult<RawDescriptorSet> {
        let set_layout = self.set_layout(layout)?;
        let layouts = [set_layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(vk::DescriptorPool::from_raw(pool.0))
            .set_layouts(&layouts);
        let sets = unsafe { self.raw().allocate_descriptor_sets(&info)? };
        sets.first()
            .map(|set| RawDescriptorSet(set.as_raw()))
            .ok_or(RenderError::PoolExhausted)
    }

    fn free_descriptor_set(&mut self, pool: RawDescriptorPool, set: RawDescriptorSet) -> RenderResult<()> {
        unsafe {
            self.raw().free_descriptor_sets(
                vk::DescriptorPool::from_raw(pool.0),
                &[vk::DescriptorSet::from_raw(set.0)],
            )?;
        }
        Ok(())
    }

    fn write_descriptor_set(&mut self, set: RawDescriptorSet, writes: &[DescriptorWrite]) -> RenderResult<()> {
        let buffer_infos: Vec<vk::DescriptorBufferInfo> = writes
            .iter()
            .map(|write| match write.resource {
                DescriptorResource::Buffer { buffer, offset, range } => vk::DescriptorBufferInfo {
                    buffer: vk::Buffer::from_raw(buffer.0),
                    offset,
                    range,
                },
                DescriptorResource::ImageSampler { .. } => vk::DescriptorBufferInfo::default(),
            })
            .collect();
        let image_infos: Vec<vk::DescriptorImageInfo> = writes
            .iter()
            .map(|write| match write.resource {
                DescriptorResource::ImageSampler { view, sampler, layout } => vk::DescriptorImageInfo {
                    sampler: vk::Sampler::from_raw(sampler.0),
                    image_view: vk::ImageView::from_raw(view.0),
                    image_layout: layout_to_vk(layout),
                },
                DescriptorResource::Buffer { .. } => vk::DescriptorImageInfo::default(),
            })
            .collect();

        let dst_set = vk::DescriptorSet::from_raw(set.0);
        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .enumerate()
            .map(|(i, write)| {
                let builder = vk::WriteDescriptorSet::builder()
                    .dst_set(dst_set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element);
                match write.resource {
                    DescriptorResource::Buffer { .. } => builder
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(std::slice::from_ref(&buffer_infos[i]))
                        .build(),
                    DescriptorResource::ImageSampler { .. } => builder
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(std::slice::from_ref(&image_infos[i]))
                        .build(),
                }
            })
            .collect();

        unsafe { self.raw().update_descriptor_sets(&vk_writes, &[]) };
        Ok(())
    }

    fn destroy_descriptor_pool(&mut self, pool: RawDescriptorPool) {
        unsafe { self.raw().destroy_descriptor_pool(vk::DescriptorPool::from_raw(pool.0), None) };
    }

    fn allocate_command_buffer(&mut self, queue: QueueKind) -> RenderResult<RawCommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool(queue)?)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.raw().allocate_command_buffers(&info)? };
        buffers
            .first()
            .map(|cb| RawCommandBuffer(cb.as_raw()))
            .ok_or_else(|| RenderError::ResourceExhausted("command buffer".to_string()))
    }

    fn free_command_buffer(&mut self, queue: QueueKind, command_buffer: RawCommandBuffer) {
        if let Ok(pool) = self.command_pool(queue) {
            unsafe {
                self.raw()
                    .free_command_buffers(pool, &[vk::CommandBuffer::from_raw(command_buffer.0)]);
            }
        }
    }

    fn record(&mut self, command_buffer: RawCommandBuffer, commands: &[Command]) -> RenderResult<()> {
        let cb = vk::CommandBuffer::from_raw(command_buffer.0);
        unsafe {
            self.raw()
                .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())?;
            self.raw()
                .begin_command_buffer(cb, &vk::CommandBufferBeginInfo::builder())?;
        }
        for command in commands {
            self.record_command(cb, command);
        }
        unsafe { self.raw().end_command_buffer(cb)? };
        Ok(())
    }

    fn submit(&mut self, queue: QueueKind, submit: &SubmitInfo) -> RenderResult<()> {
        let command_buffers: Vec<vk::CommandBuffer> = submit
            .command_buffers
            .iter()
            .map(|cb| vk::CommandBuffer::from_raw(cb.0))
            .collect();
        let wait_semaphores: Vec<vk::Semaphore> = submit
            .wait
            .iter()
            .map(|(semaphore, _)| vk::Semaphore::from_raw(semaphore.0))
            .collect();
        let wait_stages: Vec<vk::PipelineStageFlags> =
            submit.wait.iter().map(|(_, stage)| pipeline_stage(*stage)).collect();
        let signal_semaphores: Vec<vk::Semaphore> = submit
            .signal
            .iter()
            .map(|semaphore| vk::Semaphore::from_raw(semaphore.0))
            .collect();
        let fence = submit
            .fence
            .map_or_else(vk::Fence::null, |fence| vk::Fence::from_raw(fence.0));

        let info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        unsafe { self.raw().queue_submit(self.queue(queue), &[info], fence)? };
        Ok(())
    }

    fn queue_wait_idle(&mut self, queue: QueueKind) -> RenderResult<()> {
        unsafe { self.raw().queue_wait_idle(self.queue(queue))? };
        Ok(())
    }

    fn wait_idle(&mut self) -> RenderResult<()> {
        unsafe { self.raw().device_wait_idle()? };
        Ok(())
    }

    fn create_shader_module(&mut self, code: &[u32]) -> RenderResult<RawShaderModule> {
        let info = vk::ShaderModuleCreateInfo::builder().code(code);
        let module = unsafe { self.raw().create_shader_module(&info, None) }
            .map_err(|err| RenderError::ShaderOrPipelineBuildFailure(format!("shader module: {err:?}")))?;
        Ok(RawShaderModule(module.as_raw()))
    }

    fn destroy_shader_module(&mut self, module: RawShaderModule) {
        unsafe { self.raw().destroy_shader_module(vk::ShaderModule::from_raw(module.0), None) };
    }

    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> RenderResult<RawRenderPass> {
        let attachments: Vec<vk::AttachmentDescription> = desc
            .attachments()
            .map(|attachment| {
                vk::AttachmentDescription::builder()
                    .format(format_to_vk(attachment.format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(load_op(attachment.load))
                    .store_op(store_op(attachment.store))
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(layout_to_vk(attachment.initial_layout))
                    .final_layout(layout_to_vk(attachment.final_layout))
                    .build()
            })
            .collect();

        let color_refs: Vec<vk::AttachmentReference> = (0..desc.color.len() as u32)
            .map(|attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();
        let depth_ref = vk::AttachmentReference {
            attachment: desc.color.len() as u32,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if desc.depth.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let subpasses = [subpass.build()];

        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(stages)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
            .build();
        let dependencies = [dependency];

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let render_pass = unsafe { self.raw().create_render_pass(&info, None)? };
        Ok(RawRenderPass(render_pass.as_raw()))
    }

    fn destroy_render_pass(&mut self, render_pass: RawRenderPass) {
        unsafe { self.raw().destroy_render_pass(vk::RenderPass::from_raw(render_pass.0), None) };
    }

    fn create_framebuffer(
        &mut self,
        render_pass: RawRenderPass,
        attachments: &[RawImageView],
        extent: Extent2D,
    ) -> RenderResult<RawFramebuffer> {
        let views: Vec<vk::ImageView> = attachments.iter().map(|view| vk::ImageView::from_raw(view.0)).collect();
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(vk::RenderPass::from_raw(render_pass.0))
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let framebuffer = unsafe { self.raw().create_framebuffer(&info, None)? };
        Ok(RawFramebuffer(framebuffer.as_raw()))
    }

    fn destroy_framebuffer(&mut self, framebuffer: RawFramebuffer) {
        unsafe { self.raw().destroy_framebuffer(vk::Framebuffer::from_raw(framebuffer.0), None) };
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> RenderResult<RawPipeline> {
        let set_layouts = desc
            .set_layouts
            .iter()
            .map(|layout| self.set_layout(layout))
            .collect::<RenderResult<Vec<_>>>()?;

        let push_stages = desc
            .push_constants
            .map_or(vk::ShaderStageFlags::empty(), |range| shader_stages(range.stages));
        let push_ranges: Vec<vk::PushConstantRange> = desc
            .push_constants
            .map(|range| vk::PushConstantRange {
                stage_flags: shader_stages(range.stages),
                offset: 0,
                size: range.size,
            })
            .into_iter()
            .collect();

        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        let layout = unsafe { self.raw().create_pipeline_layout(&layout_info, None)? };

        let shader_stages_info = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vk::ShaderModule::from_raw(desc.vertex_shader.0))
                .name(ENTRY_POINT)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(vk::ShaderModule::from_raw(desc.fragment_shader.0))
                .name(ENTRY_POINT)
                .build(),
        ];

        let binding_descriptions = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: desc.vertex_input.stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = desc
            .vertex_input
            .attributes
            .iter()
            .map(|attribute| vk::VertexInputAttributeDescription {
                location: attribute.location,
                binding: 0,
                format: vertex_format(attribute.format),
                offset: attribute.offset,
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(if desc.cull_back_faces {
                vk::CullModeFlags::BACK
            } else {
                vk::CullModeFlags::NONE
            })
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);
        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_test)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);
        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages_info)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(vk::RenderPass::from_raw(desc.render_pass.0))
            .subpass(0)
            .build();

        let created =
            unsafe { self.raw().create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None) };
        let pipeline = match created.map(|pipelines| pipelines.first().copied()) {
            Ok(Some(pipeline)) => pipeline,
            other => {
                unsafe { self.raw().destroy_pipeline_layout(layout, None) };
                let reason = match other {
                    Err((_, err)) => format!("{err:?}"),
                    _ => "no pipeline returned".to_string(),
                };
                return Err(RenderError::ShaderOrPipelineBuildFailure(reason));
            }
        };

        let raw = RawPipeline(pipeline.as_raw());
        self.pipelines.insert(
            raw,
            PipelineEntry {
                pipeline,
                layout,
                push_stages,
            },
        );
        Ok(raw)
    }

    fn destroy_pipeline(&mut self, pipeline: RawPipeline) {
        if let Some(entry) = self.pipelines.remove(&pipeline) {
            unsafe {
                self.raw().destroy_pipeline(entry.pipeline, None);
                self.raw().destroy_pipeline_layout(entry.layout, None);
            }
        }
    }

    fn surface_extent(&self) -> Extent2D {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical.device, self.surface)
        };
        match caps {
            Ok(caps) if caps.current_extent.width != u32::MAX => {
                Extent2D::new(caps.current_extent.width, caps.current_extent.height)
            }
            _ => self.window_extent,
        }
    }

    fn create_swapchain(&mut self, request: &SwapchainRequest) -> RenderResult<SwapchainInfo> {
        let old = self.swapchain.take();
        let old_handle = old.as_ref().map_or_else(vk::SwapchainKHR::null, |s| s.handle);
        let created = Swapchain::new(
            &self.swapchain_loader,
            &self.surface_loader,
            self.physical.device,
            self.surface,
            request,
            old_handle,
        );
        if let Some(old) = old {
            unsafe { self.swapchain_loader.destroy_swapchain(old.handle, None) };
        }
        let swapchain = created?;

        let format = format_from_vk(swapchain.format.format).unwrap_or(request.preferred_format);
        let info = SwapchainInfo {
            format,
            extent: swapchain.extent(),
            present_mode: present_mode_from_vk(swapchain.present_mode),
            images: swapchain.images.iter().map(|image| RawImage(image.as_raw())).collect(),
        };
        for image in &info.images {
            self.image_formats.insert(*image, format);
        }
        self.swapchain = Some(swapchain);
        Ok(info)
    }

    fn destroy_swapchain(&mut self) {
        if let Some(swapchain) = self.swapchain.take() {
            for image in &swapchain.images {
                self.image_formats.remove(&RawImage(image.as_raw()));
            }
            unsafe { self.swapchain_loader.destroy_swapchain(swapchain.handle, None) };
        }
    }

    fn acquire_next_image(&mut self, signal: RawSemaphore, timeout_ns: u64) -> RenderResult<AcquiredImage> {
        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or_else(|| RenderError::invalid_operation("acquire without a swapchain"))?;
        let (index, suboptimal) = unsafe {
            self.swapchain_loader.acquire_next_image(
                swapchain.handle,
                timeout_ns,
                vk::Semaphore::from_raw(signal.0),
                vk::Fence::null(),
            )?
        };
        Ok(AcquiredImage { index, suboptimal })
    }

    fn present(&mut self, image_index: u32, wait: RawSemaphore) -> RenderResult<PresentStatus> {
        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or_else(|| RenderError::invalid_operation("present without a swapchain"))?;
        let wait_semaphores = [vk::Semaphore::from_raw(wait.0)];
        let swapchains = [swapchain.handle];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);
        let suboptimal = unsafe { self.swapchain_loader.queue_present(self.device.present_queue, &info)? };
        Ok(if suboptimal {
            PresentStatus::Suboptimal
        } else {
            PresentStatus::Optimal
        })
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let device = &self.device.device;
            let _ = device.device_wait_idle();
            for entry in self.pipelines.values() {
                device.destroy_pipeline(entry.pipeline, None);
                device.destroy_pipeline_layout(entry.layout, None);
            }
            for layout in self.set_layouts.values() {
                device.destroy_descriptor_set_layout(*layout, None);
            }
            for pool in self.command_pools.values() {
                device.destroy_command_pool(*pool, None);
            }
            if let Some(swapchain) = self.swapchain.take() {
                self.swapchain_loader.destroy_swapchain(swapchain.handle, None);
            }
            device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
        log::debug!("Vulkan backend destroyed");
    }
}
