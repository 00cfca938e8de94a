//! Forward pass
//!
//! Draws every visible render list entry into the offscreen color target
//! with depth testing. Set 0 carries the scene uniforms, set 1 the material,
//! and the model matrix travels as push constants.

use crate::foundation::math::Mat4;
use crate::render::api::{
    AttachmentDesc, ClearValue, Extent2D, GpuBackend, ImageLayout, LoadOp, RawBuffer, RawDescriptorSet,
    RawFramebuffer, RawRenderPass, RenderPassDesc, StoreOp,
};
use crate::render::commands::RecordingSession;
use crate::render::passes::graph::{GraphImage, ImageWrite, PassDeclaration};
use crate::render::passes::targets::{SurfaceTargets, FORWARD_COLOR_FORMAT};
use crate::render::pipeline::{ForwardPipeline, SceneCounts, ShadingModel};
use crate::render::resources::PushConstants;
use crate::render::{RenderDevice, RenderError, RenderResult};

/// One forward draw with every handle resolved to its backend object
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawItem {
    /// Vertex buffer
    pub vertex_buffer: RawBuffer,
    /// `u32` index buffer
    pub index_buffer: RawBuffer,
    /// First index
    pub first_index: u32,
    /// Index count; zero draws nothing
    pub index_count: u32,
    /// Material set for this frame slot
    pub material_set: RawDescriptorSet,
    /// Object to world
    pub world: Mat4,
    /// Hidden entries are skipped
    pub visible: bool,
}

/// Forward render pass, pipeline and framebuffers
#[derive(Debug)]
pub struct ForwardPass {
    render_pass: RawRenderPass,
    pipeline: ForwardPipeline,
    framebuffers: Vec<RawFramebuffer>,
    clear_color: [f32; 4],
}

impl ForwardPass {
    /// Writes forward color and depth, samples nothing
    pub fn declaration() -> PassDeclaration {
        PassDeclaration {
            name: "forward",
            writes: vec![
                ImageWrite {
                    image: GraphImage::ForwardColor,
                    final_layout: ImageLayout::ColorAttachment,
                },
                ImageWrite {
                    image: GraphImage::ForwardDepth,
                    final_layout: ImageLayout::DepthStencilAttachment,
                },
            ],
            samples: Vec::new(),
        }
    }

    /// Create the render pass, pipeline and one framebuffer per swapchain image
    pub fn new<B: GpuBackend>(
        device: &mut RenderDevice<B>,
        targets: &SurfaceTargets,
        model: ShadingModel,
        counts: SceneCounts,
        clear_color: [f32; 4],
    ) -> RenderResult<Self> {
        let render_pass = device.backend.create_render_pass(&RenderPassDesc {
            color: vec![AttachmentDesc {
                format: FORWARD_COLOR_FORMAT,
                load: LoadOp::Clear,
                store: StoreOp::Store,
                initial_layout: ImageLayout::Undefined,
                final_layout: ImageLayout::ColorAttachment,
            }],
            depth: Some(AttachmentDesc {
                format: targets.depth_format(),
                load: LoadOp::Clear,
                store: StoreOp::DontCare,
                initial_layout: ImageLayout::Undefined,
                final_layout: ImageLayout::DepthStencilAttachment,
            }),
        })?;
        let pipeline = match ForwardPipeline::build(&mut device.backend, &mut device.shaders, render_pass, model, counts)
        {
            Ok(pipeline) => pipeline,
            Err(err) => {
                device.backend.destroy_render_pass(render_pass);
                return Err(err);
            }
        };

        let mut pass = Self {
            render_pass,
            pipeline,
            framebuffers: Vec::new(),
            clear_color,
        };
        if let Err(err) = pass.create_framebuffers(device, targets) {
            pass.destroy(device);
            return Err(err);
        }
        Ok(pass)
    }

    /// Backend render pass
    pub const fn render_pass(&self) -> RawRenderPass {
        self.render_pass
    }

    /// Forward pipeline
    pub const fn pipeline(&self) -> &ForwardPipeline {
        &self.pipeline
    }

    /// Framebuffers, indexed by swapchain image
    pub fn framebuffers(&self) -> &[RawFramebuffer] {
        &self.framebuffers
    }

    /// One framebuffer per swapchain image over its color and depth attachments
    pub fn create_framebuffers<B: GpuBackend>(
        &mut self,
        device: &mut RenderDevice<B>,
        targets: &SurfaceTargets,
    ) -> RenderResult<()> {
        for (color, depth) in targets.color().iter().zip(targets.depth()) {
            let framebuffer =
                device
                    .backend
                    .create_framebuffer(self.render_pass, &[color.view, depth.view], targets.extent())?;
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    /// Destroy the framebuffers; the device must be idle
    pub fn release_framebuffers<B: GpuBackend>(&mut self, device: &mut RenderDevice<B>) {
        for framebuffer in self.framebuffers.drain(..) {
            device.backend.destroy_framebuffer(framebuffer);
        }
    }

    /// Replace the pipeline with one sized for `counts`; the device must be idle
    pub fn rebuild_pipeline<B: GpuBackend>(
        &mut self,
        device: &mut RenderDevice<B>,
        counts: SceneCounts,
    ) -> RenderResult<()> {
        let pipeline = ForwardPipeline::build(
            &mut device.backend,
            &mut device.shaders,
            self.render_pass,
            self.pipeline.model(),
            counts,
        )?;
        self.pipeline.destroy(&mut device.backend);
        self.pipeline = pipeline;
        Ok(())
    }

    /// Record the pass; returns the number of draws issued
    pub fn record(
        &self,
        session: &mut RecordingSession<'_>,
        image_index: usize,
        extent: Extent2D,
        scene_set: RawDescriptorSet,
        draws: &[DrawItem],
    ) -> RenderResult<usize> {
        let framebuffer = self
            .framebuffers
            .get(image_index)
            .copied()
            .ok_or_else(|| RenderError::InvalidArgument(format!("no forward framebuffer for image {image_index}")))?;
        let pipeline = self.pipeline.raw();
        let clear_values = vec![
            ClearValue::Color(self.clear_color),
            ClearValue::DepthStencil { depth: 1.0, stencil: 0 },
        ];

        let mut pass = session.begin_render_pass(self.render_pass, framebuffer, extent, clear_values);
        pass.set_viewport_scissor(extent);
        pass.bind_pipeline(pipeline);
        pass.bind_binding_set(pipeline, 0, scene_set);

        let mut issued = 0;
        for draw in draws.iter().filter(|draw| draw.visible && draw.index_count > 0) {
            let push = PushConstants::from_model(&draw.world);
            pass.push_constants(pipeline, bytemuck::bytes_of(&push));
            pass.bind_binding_set(pipeline, 1, draw.material_set);
            pass.bind_vertex_buffer(draw.vertex_buffer);
            pass.bind_index_buffer(draw.index_buffer);
            pass.draw_indexed(draw.index_count, draw.first_index);
            issued += 1;
        }
        Ok(issued)
    }

    /// Destroy everything the pass owns; the device must be idle
    pub fn destroy<B: GpuBackend>(&mut self, device: &mut RenderDevice<B>) {
        self.release_framebuffers(device);
        self.pipeline.destroy(&mut device.backend);
        device.backend.destroy_render_pass(self.render_pass);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::Command;

    fn draw(index_count: u32, visible: bool) -> DrawItem {
        DrawItem {
            vertex_buffer: RawBuffer(1),
            index_buffer: RawBuffer(2),
            first_index: 0,
            index_count,
            material_set: RawDescriptorSet(3),
            world: Mat4::identity(),
            visible,
        }
    }

    #[test]
    fn test_hidden_and_empty_entries_are_skipped() {
        let mut device = crate::render::testing::headless_device();
        let targets = crate::render::testing::surface_targets(&mut device);
        let pass = ForwardPass::new(
            &mut device,
            &targets,
            ShadingModel::Unlit,
            SceneCounts::new(1, 1),
            [0.1, 0.1, 0.1, 1.0],
        )
        .unwrap();

        let mut commands = Vec::new();
        let issued = {
            let mut session = RecordingSession::for_commands(&mut commands);
            pass.record(
                &mut session,
                0,
                targets.extent(),
                RawDescriptorSet(9),
                &[draw(3, true), draw(0, true), draw(6, false)],
            )
            .unwrap()
        };

        assert_eq!(issued, 1);
        let draws: Vec<_> = commands
            .iter()
            .filter(|command| matches!(command, Command::DrawIndexed { .. }))
            .collect();
        assert_eq!(draws.len(), 1);
        assert_eq!(commands.last(), Some(&Command::EndRenderPass));
        assert!(matches!(
            commands.first(),
            Some(Command::BeginRenderPass { clear_values, .. }) if clear_values.len() == 2
        ));
    }
}
