//! Queue execution and command validation of the headless device

use std::collections::HashMap;

use super::objects::{downsample, ImageHold, QueueOp};
use super::{HeadlessBackend, TraceEntry};
use crate::render::api::{
    BufferUsage, Command, DescriptorResource, Extent2D, ImageBarrier, ImageLayout, ImageUsage, RawBuffer,
    RawCommandBuffer, RawDescriptorSet, RawFramebuffer, RawImage, RawMemory, RawPipeline, RawRenderPass,
};

/// Attachment written by the active render pass
#[derive(Debug, Clone, Copy)]
struct ActiveAttachment {
    image: RawImage,
    mip: u32,
    final_layout: ImageLayout,
}

#[derive(Debug)]
struct ActivePass {
    render_pass: RawRenderPass,
    attachments: Vec<ActiveAttachment>,
}

/// Bound state of one command buffer during execution
#[derive(Debug, Default)]
struct ExecState {
    pass: Option<ActivePass>,
    pipeline: Option<RawPipeline>,
    sets: HashMap<u32, RawDescriptorSet>,
    vertex_buffer: Option<(RawBuffer, u64)>,
    index_buffer: Option<(RawBuffer, u64)>,
}

impl HeadlessBackend {
    /// Execute queue operations up to and including `position`
    pub(super) fn execute_through(&mut self, position: usize) {
        for _ in 0..=position {
            let Some(op) = self.queue.pop_front() else {
                break;
            };
            self.execute_op(op);
        }
    }

    /// Drain the queue
    pub(super) fn execute_all(&mut self) {
        while let Some(op) = self.queue.pop_front() {
            self.execute_op(op);
        }
    }

    fn execute_op(&mut self, op: QueueOp) {
        match op {
            QueueOp::Submit {
                id,
                command_buffers,
                fence,
            } => {
                for cb in command_buffers {
                    self.execute_command_buffer(id, cb);
                }
                if let Some(fence) = fence {
                    if let Some(state) = self.fences.get_mut(&fence) {
                        *state = true;
                    }
                }
            }
            QueueOp::Present { image_index } => self.execute_present(image_index),
        }
    }

    fn execute_present(&mut self, image_index: u32) {
        let Some(image) = self
            .swapchain
            .as_ref()
            .and_then(|swapchain| swapchain.images.get(image_index as usize).copied())
        else {
            return;
        };
        let layout = self.image_layout(image, 0);
        if layout != Some(ImageLayout::PresentSrc) {
            self.report(format!(
                "present: swapchain image {image_index} is in {layout:?}, expected PresentSrc"
            ));
        }
        if let Some(swapchain) = self.swapchain.as_mut() {
            swapchain.holds[image_index as usize] = ImageHold::Available;
        }
        self.stats.presents += 1;
    }

    fn execute_command_buffer(&mut self, submission: u64, cb: RawCommandBuffer) {
        let commands = match self.command_buffers.get_mut(&cb) {
            Some(sim) => {
                sim.pending = sim.pending.saturating_sub(1);
                sim.commands.clone()
            }
            None => {
                self.report(format!("command buffer {cb:?} freed before it executed"));
                return;
            }
        };

        let mut state = ExecState::default();
        for command in &commands {
            if self.tracing {
                self.trace.push(TraceEntry {
                    submission,
                    command_buffer: cb,
                    command: command.clone(),
                });
            }
            self.execute_command(&mut state, command);
        }
        if state.pass.is_some() {
            self.report(format!("command buffer {cb:?} ended inside a render pass"));
        }
    }

    fn execute_command(&mut self, state: &mut ExecState, command: &Command) {
        let name = command.name();
        if command.requires_render_pass() && state.pass.is_none() {
            self.report(format!("{name}: recorded outside a render pass"));
            return;
        }
        if command.forbidden_in_render_pass() && state.pass.is_some() {
            self.report(format!("{name}: recorded inside a render pass"));
            return;
        }

        match command {
            Command::BeginRenderPass {
                render_pass,
                framebuffer,
                extent,
                clear_values,
            } => self.begin_render_pass(state, *render_pass, *framebuffer, *extent, clear_values.len()),
            Command::EndRenderPass => {
                if let Some(pass) = state.pass.take() {
                    for attachment in pass.attachments {
                        self.set_layout(attachment.image, attachment.mip, attachment.final_layout);
                    }
                }
            }
            Command::BindPipeline(pipeline) => self.bind_pipeline(state, *pipeline),
            Command::SetViewportScissor(_) => {}
            Command::BindBindingSet { pipeline, index, set } => {
                self.bind_binding_set(state, *pipeline, *index, *set);
            }
            Command::PushConstants { pipeline, offset, data } => {
                let range = self.pipelines.get(pipeline).map(|desc| desc.push_constants);
                match range {
                    None => self.report(format!("{name}: unknown pipeline {pipeline:?}")),
                    Some(None) => self.report(format!("{name}: pipeline declares no push constant range")),
                    Some(Some(range)) if *offset as usize + data.len() > range.size as usize => self.report(format!(
                        "{name}: {} bytes at offset {offset} exceed the {} byte range",
                        data.len(),
                        range.size
                    )),
                    Some(Some(_)) => {}
                }
            }
            Command::BindVertexBuffer { buffer, offset } => {
                if self.check_buffer(name, *buffer, BufferUsage::VERTEX) {
                    state.vertex_buffer = Some((*buffer, *offset));
                }
            }
            Command::BindIndexBuffer { buffer, offset } => {
                if self.check_buffer(name, *buffer, BufferUsage::INDEX) {
                    state.index_buffer = Some((*buffer, *offset));
                }
            }
            Command::Draw {
                vertex_count,
                first_vertex,
            } => {
                if self.check_draw(state, name, u64::from(*first_vertex) + u64::from(*vertex_count)) {
                    self.stats.draws += 1;
                }
            }
            Command::DrawIndexed {
                index_count,
                first_index,
                ..
            } => {
                let ok = self.check_draw(state, name, 0) && self.check_index_range(state, *first_index, *index_count);
                if ok {
                    self.stats.draws += 1;
                }
            }
            Command::CopyBuffer {
                src,
                dst,
                src_offset,
                dst_offset,
                size,
            } => self.copy_buffer(*src, *dst, *src_offset, *dst_offset, *size),
            Command::CopyBufferToImage {
                buffer,
                image,
                mip_level,
                extent,
            } => self.copy_buffer_to_image(*buffer, *image, *mip_level, *extent),
            Command::CopyImageToBuffer {
                image,
                buffer,
                mip_level,
                extent,
            } => self.copy_image_to_buffer(*image, *buffer, *mip_level, *extent),
            Command::BlitMip {
                image,
                src_mip,
                src_extent,
            } => self.blit_mip(*image, *src_mip, *src_extent),
            Command::ImageBarrier(barrier) => self.image_barrier(barrier),
        }
    }

    fn set_layout(&mut self, image: RawImage, mip: u32, layout: ImageLayout) {
        if let Some(slot) = self
            .images
            .get_mut(&image)
            .and_then(|img| img.layouts.get_mut(mip as usize))
        {
            *slot = layout;
        }
    }

    fn begin_render_pass(
        &mut self,
        state: &mut ExecState,
        render_pass: RawRenderPass,
        framebuffer: RawFramebuffer,
        extent: Extent2D,
        clear_count: usize,
    ) {
        let Some(desc) = self.render_passes.get(&render_pass).cloned() else {
            self.report(format!("BeginRenderPass: unknown render pass {render_pass:?}"));
            return;
        };
        let Some(views) = self.framebuffers.get(&framebuffer).map(|fb| (fb.render_pass, fb.attachments.clone())) else {
            self.report(format!("BeginRenderPass: unknown framebuffer {framebuffer:?}"));
            return;
        };
        if views.0 != render_pass {
            self.report("BeginRenderPass: framebuffer was created for a different render pass".to_string());
        }
        if clear_count < desc.attachments().count() {
            self.report(format!(
                "BeginRenderPass: {clear_count} clear values for {} attachments",
                desc.attachments().count()
            ));
        }

        let mut attachments = Vec::new();
        for (attachment, view) in desc.attachments().zip(views.1) {
            let Some(sim_view) = self.views.get(&view).copied() else {
                self.report(format!("BeginRenderPass: attachment view {view:?} was destroyed"));
                continue;
            };
            let mip = sim_view.desc.base_mip;
            let Some((image_extent, current)) = self
                .images
                .get(&sim_view.image)
                .map(|image| (image.mip_extent(mip), image.layouts[mip as usize]))
            else {
                self.report(format!("BeginRenderPass: attachment image {:?} was destroyed", sim_view.image));
                continue;
            };
            if image_extent != extent {
                self.report(format!(
                    "BeginRenderPass: render area {extent:?} does not match attachment extent {image_extent:?}"
                ));
            }
            if attachment.initial_layout != ImageLayout::Undefined && current != attachment.initial_layout {
                self.report(format!(
                    "BeginRenderPass: attachment {:?} is in {current:?}, render pass expects {:?}",
                    sim_view.image, attachment.initial_layout
                ));
            }
            let working = if attachment.format.is_depth() {
                ImageLayout::DepthStencilAttachment
            } else {
                ImageLayout::ColorAttachment
            };
            self.set_layout(sim_view.image, mip, working);
            attachments.push(ActiveAttachment {
                image: sim_view.image,
                mip,
                final_layout: attachment.final_layout,
            });
        }

        state.pass = Some(ActivePass {
            render_pass,
            attachments,
        });
    }

    fn bind_pipeline(&mut self, state: &mut ExecState, pipeline: RawPipeline) {
        let Some(desc) = self.pipelines.get(&pipeline) else {
            self.report(format!("BindPipeline: unknown pipeline {pipeline:?}"));
            return;
        };
        if let Some(pass) = &state.pass {
            if desc.render_pass != pass.render_pass {
                self.report("BindPipeline: pipeline built for a different render pass".to_string());
            }
        }
        state.pipeline = Some(pipeline);
    }

    fn bind_binding_set(&mut self, state: &mut ExecState, pipeline: RawPipeline, index: u32, set: RawDescriptorSet) {
        let Some(expected) = self
            .pipelines
            .get(&pipeline)
            .map(|desc| desc.set_layouts.get(index as usize).cloned())
        else {
            self.report(format!("BindBindingSet: unknown pipeline {pipeline:?}"));
            return;
        };
        let Some(actual) = self.sets.get(&set).map(|s| s.layout.clone()) else {
            self.report(format!("BindBindingSet: descriptor set {set:?} was freed"));
            return;
        };
        match expected {
            Some(layout) if layout == actual => {
                state.sets.insert(index, set);
            }
            Some(_) => self.report(format!("BindBindingSet: set {index} layout does not match the pipeline")),
            None => self.report(format!("BindBindingSet: pipeline has no set {index}")),
        }
    }

    fn check_buffer(&mut self, name: &str, buffer: RawBuffer, usage: BufferUsage) -> bool {
        match self.buffers.get(&buffer) {
            None => {
                self.report(format!("{name}: buffer {buffer:?} was destroyed"));
                false
            }
            Some(buf) if !buf.usage.contains(usage) => {
                self.report(format!("{name}: buffer {buffer:?} lacks {usage:?} usage"));
                false
            }
            Some(buf) if buf.binding.is_none() => {
                self.report(format!("{name}: buffer {buffer:?} has no memory bound"));
                false
            }
            Some(_) => true,
        }
    }

    /// Validate draw state; `vertex_end` is the highest vertex read (0 for indexed draws)
    fn check_draw(&mut self, state: &ExecState, name: &str, vertex_end: u64) -> bool {
        let Some(pipeline) = state.pipeline else {
            self.report(format!("{name}: no pipeline bound"));
            return false;
        };
        let Some(desc) = self.pipelines.get(&pipeline).cloned() else {
            self.report(format!("{name}: pipeline {pipeline:?} was destroyed"));
            return false;
        };

        let mut ok = true;
        for index in 0..desc.set_layouts.len() as u32 {
            if !state.sets.contains_key(&index) {
                self.report(format!("{name}: set {index} not bound"));
                ok = false;
            }
        }

        if desc.vertex_input.stride > 0 {
            match state.vertex_buffer {
                None => {
                    self.report(format!("{name}: no vertex buffer bound"));
                    ok = false;
                }
                Some((buffer, offset)) => {
                    let size = self.buffers.get(&buffer).map_or(0, |buf| buf.size);
                    if offset + vertex_end * u64::from(desc.vertex_input.stride) > size {
                        self.report(format!("{name}: vertex range exceeds vertex buffer"));
                        ok = false;
                    }
                }
            }
        }

        let attachments: Vec<RawImage> = state
            .pass
            .as_ref()
            .map(|pass| pass.attachments.iter().map(|a| a.image).collect())
            .unwrap_or_default();
        let sampled: Vec<(RawImage, u32, ImageLayout)> = state
            .sets
            .values()
            .filter_map(|set| self.sets.get(set))
            .flat_map(|set| set.writes.values())
            .filter_map(|resource| match resource {
                DescriptorResource::ImageSampler { view, layout, .. } => self
                    .views
                    .get(view)
                    .map(|v| (v.image, v.desc.base_mip, *layout)),
                DescriptorResource::Buffer { .. } => None,
            })
            .collect();
        for (image, mip, expected) in sampled {
            if attachments.contains(&image) {
                self.report(format!("{name}: image {image:?} sampled while bound as an attachment"));
                ok = false;
                continue;
            }
            let current = self.image_layout(image, mip);
            if current != Some(expected) {
                self.report(format!(
                    "{name}: sampled image {image:?} is in {current:?}, descriptor expects {expected:?}"
                ));
                ok = false;
            }
        }
        ok
    }

    fn check_index_range(&mut self, state: &ExecState, first_index: u32, index_count: u32) -> bool {
        let Some((buffer, offset)) = state.index_buffer else {
            self.report("DrawIndexed: no index buffer bound".to_string());
            return false;
        };
        let size = self.buffers.get(&buffer).map_or(0, |buf| buf.size);
        let end = offset + (u64::from(first_index) + u64::from(index_count)) * 4;
        if end > size {
            self.report(format!("DrawIndexed: index range ends at byte {end}, buffer holds {size}"));
            return false;
        }
        true
    }

    fn buffer_storage(&self, buffer: RawBuffer) -> Option<(RawMemory, u64, u64)> {
        self.buffers
            .get(&buffer)
            .and_then(|buf| buf.binding.map(|(memory, offset)| (memory, offset, buf.size)))
    }

    fn read_buffer(&self, buffer: RawBuffer, offset: u64, len: usize) -> Option<Vec<u8>> {
        let (memory, base, _) = self.buffer_storage(buffer)?;
        let start = (base + offset) as usize;
        self.memory
            .get(&memory)
            .and_then(|alloc| alloc.bytes.get(start..start + len))
            .map(<[u8]>::to_vec)
    }

    fn write_buffer(&mut self, buffer: RawBuffer, offset: u64, data: &[u8]) {
        if let Some((memory, base, _)) = self.buffer_storage(buffer) {
            let start = (base + offset) as usize;
            if let Some(dst) = self
                .memory
                .get_mut(&memory)
                .and_then(|alloc| alloc.bytes.get_mut(start..start + data.len()))
            {
                dst.copy_from_slice(data);
            }
        }
    }

    fn copy_buffer(&mut self, src: RawBuffer, dst: RawBuffer, src_offset: u64, dst_offset: u64, size: u64) {
        if !self.check_buffer("CopyBuffer", src, BufferUsage::TRANSFER_SRC)
            || !self.check_buffer("CopyBuffer", dst, BufferUsage::TRANSFER_DST)
        {
            return;
        }
        let src_size = self.buffers.get(&src).map_or(0, |buf| buf.size);
        let dst_size = self.buffers.get(&dst).map_or(0, |buf| buf.size);
        if src_offset + size > src_size || dst_offset + size > dst_size {
            self.report(format!("CopyBuffer: {size} byte copy out of bounds"));
            return;
        }
        if let Some(bytes) = self.read_buffer(src, src_offset, size as usize) {
            self.write_buffer(dst, dst_offset, &bytes);
        }
    }

    /// Check image usage, mip range and layout for a transfer
    fn check_transfer_image(
        &mut self,
        name: &str,
        image: RawImage,
        mip: u32,
        usage: ImageUsage,
        layout: ImageLayout,
    ) -> bool {
        let Some(img) = self.images.get(&image) else {
            self.report(format!("{name}: image {image:?} was destroyed"));
            return false;
        };
        if !img.desc.usage.contains(usage) {
            let message = format!("{name}: image {image:?} lacks {usage:?} usage");
            self.report(message);
            return false;
        }
        match img.layouts.get(mip as usize).copied() {
            None => {
                self.report(format!("{name}: mip {mip} does not exist"));
                false
            }
            Some(current) if current != layout => {
                self.report(format!("{name}: mip {mip} is in {current:?}, expected {layout:?}"));
                false
            }
            Some(_) => true,
        }
    }

    fn copy_buffer_to_image(&mut self, buffer: RawBuffer, image: RawImage, mip: u32, extent: Extent2D) {
        let name = "CopyBufferToImage";
        if !self.check_buffer(name, buffer, BufferUsage::TRANSFER_SRC)
            || !self.check_transfer_image(name, image, mip, ImageUsage::TRANSFER_DST, ImageLayout::TransferDst)
        {
            return;
        }
        let Some((expected, len)) = self.images.get(&image).map(|img| (img.mip_extent(mip), img.mip_bytes(mip))) else {
            return;
        };
        if expected != extent {
            self.report(format!("{name}: extent {extent:?} does not match mip extent {expected:?}"));
            return;
        }
        let Some(bytes) = self.read_buffer(buffer, 0, len) else {
            self.report(format!("{name}: buffer holds fewer than {len} bytes"));
            return;
        };
        if let Some(img) = self.images.get_mut(&image) {
            img.mip_data_mut(mip).copy_from_slice(&bytes);
        }
    }

    fn copy_image_to_buffer(&mut self, image: RawImage, buffer: RawBuffer, mip: u32, extent: Extent2D) {
        let name = "CopyImageToBuffer";
        if !self.check_buffer(name, buffer, BufferUsage::TRANSFER_DST)
            || !self.check_transfer_image(name, image, mip, ImageUsage::TRANSFER_SRC, ImageLayout::TransferSrc)
        {
            return;
        }
        let Some(img) = self.images.get_mut(&image) else {
            return;
        };
        if img.mip_extent(mip) != extent {
            let message = format!("{name}: extent {extent:?} does not match mip extent {:?}", img.mip_extent(mip));
            self.report(message);
            return;
        }
        let bytes = img.mip_data_mut(mip).clone();
        let size = self.buffers.get(&buffer).map_or(0, |buf| buf.size);
        if bytes.len() as u64 > size {
            self.report(format!("{name}: buffer holds fewer than {} bytes", bytes.len()));
            return;
        }
        self.write_buffer(buffer, 0, &bytes);
    }

    fn blit_mip(&mut self, image: RawImage, src_mip: u32, src_extent: Extent2D) {
        let name = "BlitMip";
        let usage = ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST;
        if !self.check_transfer_image(name, image, src_mip, usage, ImageLayout::TransferSrc)
            || !self.check_transfer_image(name, image, src_mip + 1, usage, ImageLayout::TransferDst)
        {
            return;
        }
        let Some(img) = self.images.get_mut(&image) else {
            return;
        };
        if img.mip_extent(src_mip) != src_extent {
            let message = format!(
                "{name}: source extent {src_extent:?} does not match mip {src_mip} extent {:?}",
                img.mip_extent(src_mip)
            );
            self.report(message);
            return;
        }
        let bpp = img.desc.format.bytes_per_pixel() as usize;
        let dst_extent = img.mip_extent(src_mip + 1);
        let src = img.mip_data_mut(src_mip).clone();
        let dst = downsample(&src, src_extent, dst_extent, bpp);
        img.mip_data_mut(src_mip + 1).copy_from_slice(&dst);
    }

    fn image_barrier(&mut self, barrier: &ImageBarrier) {
        let Some(img) = self.images.get(&barrier.image) else {
            self.report(format!("ImageBarrier: image {:?} was destroyed", barrier.image));
            return;
        };
        let end = barrier.base_mip + barrier.mip_count;
        if end > img.desc.mip_levels {
            let message = format!(
                "ImageBarrier: mips {}..{end} exceed the image's {} levels",
                barrier.base_mip, img.desc.mip_levels
            );
            self.report(message);
            return;
        }
        let mismatched: Vec<(u32, ImageLayout)> = (barrier.base_mip..end)
            .map(|mip| (mip, img.layouts[mip as usize]))
            .filter(|(_, current)| barrier.old_layout != ImageLayout::Undefined && *current != barrier.old_layout)
            .collect();
        for (mip, current) in mismatched {
            self.report(format!(
                "ImageBarrier: image {:?} mip {mip} is in {current:?}, barrier assumes {:?}",
                barrier.image, barrier.old_layout
            ));
        }
        for mip in barrier.base_mip..end {
            self.set_layout(barrier.image, mip, barrier.new_layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::{
        AttachmentDesc, BufferDesc, ClearValue, Format, GpuBackend, ImageAspect, ImageDesc, ImageViewDesc, LoadOp,
        QueueKind, RenderPassDesc, StoreOp, SubmitInfo,
    };

    fn run(device: &mut HeadlessBackend, commands: &[Command]) {
        let cb = device.allocate_command_buffer(QueueKind::Graphics).unwrap();
        device.record(cb, commands).unwrap();
        device
            .submit(
                QueueKind::Graphics,
                &SubmitInfo {
                    command_buffers: vec![cb],
                    ..SubmitInfo::default()
                },
            )
            .unwrap();
        device.wait_idle().unwrap();
    }

    fn color_target(device: &mut HeadlessBackend, extent: Extent2D) -> (RawImage, crate::render::api::RawImageView) {
        let (image, reqs) = device
            .create_image(&ImageDesc {
                extent,
                format: Format::R8G8B8A8Unorm,
                mip_levels: 1,
                array_layers: 1,
                usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED,
            })
            .unwrap();
        let memory = device.allocate_memory(reqs.size, 0).unwrap();
        device.bind_image_memory(image, memory, 0).unwrap();
        let view = device
            .create_image_view(
                image,
                &ImageViewDesc {
                    format: Format::R8G8B8A8Unorm,
                    aspect: ImageAspect::Color,
                    base_mip: 0,
                    mip_count: 1,
                },
            )
            .unwrap();
        (image, view)
    }

    #[test]
    fn test_render_pass_applies_final_layout() {
        let mut device = HeadlessBackend::default();
        let extent = Extent2D::new(16, 16);
        let (image, view) = color_target(&mut device, extent);
        let render_pass = device
            .create_render_pass(&RenderPassDesc {
                color: vec![AttachmentDesc {
                    format: Format::R8G8B8A8Unorm,
                    load: LoadOp::Clear,
                    store: StoreOp::Store,
                    initial_layout: ImageLayout::Undefined,
                    final_layout: ImageLayout::ShaderReadOnly,
                }],
                depth: None,
            })
            .unwrap();
        let framebuffer = device.create_framebuffer(render_pass, &[view], extent).unwrap();

        run(
            &mut device,
            &[
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    extent,
                    clear_values: vec![ClearValue::Color([0.0; 4])],
                },
                Command::EndRenderPass,
            ],
        );

        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
        assert_eq!(device.image_layout(image, 0), Some(ImageLayout::ShaderReadOnly));
    }

    #[test]
    fn test_draw_outside_render_pass_is_reported() {
        let mut device = HeadlessBackend::default();
        run(
            &mut device,
            &[Command::Draw {
                vertex_count: 3,
                first_vertex: 0,
            }],
        );
        assert_eq!(device.validation_errors().len(), 1);
        assert!(device.validation_errors()[0].contains("outside a render pass"));
        assert_eq!(device.stats().draws, 0);
    }

    #[test]
    fn test_vertex_buffer_needs_vertex_usage() {
        let mut device = HeadlessBackend::default();
        let (buffer, reqs) = device
            .create_buffer(&BufferDesc {
                size: 64,
                usage: BufferUsage::UNIFORM,
            })
            .unwrap();
        let memory = device.allocate_memory(reqs.size, 1).unwrap();
        device.bind_buffer_memory(buffer, memory, 0).unwrap();

        run(&mut device, &[Command::BindVertexBuffer { buffer, offset: 0 }]);
        assert_eq!(device.validation_errors().len(), 1);
    }

    #[test]
    fn test_trace_records_submission_order() {
        let mut device = HeadlessBackend::default();
        let (image, _) = color_target(&mut device, Extent2D::new(4, 4));
        let barrier = ImageBarrier {
            image,
            aspect: ImageAspect::Color,
            old_layout: ImageLayout::Undefined,
            new_layout: ImageLayout::ShaderReadOnly,
            base_mip: 0,
            mip_count: 1,
        };
        run(&mut device, &[Command::ImageBarrier(barrier)]);
        run(&mut device, &[Command::ImageBarrier(barrier)]);

        let trace = device.trace();
        assert_eq!(trace.len(), 2);
        assert!(trace[0].submission < trace[1].submission);
        assert!(device.validation_errors().is_empty());
    }
}
