//! Postfx pass
//!
//! Samples the forward color target and writes it to the swapchain image
//! with a full-screen quad, leaving the image ready for presentation.

use crate::render::api::{
    AddressMode, AttachmentDesc, BindingLayout, BufferUsage, ClearValue, DescriptorResource, DescriptorWrite,
    Extent2D, Filter, GpuBackend, ImageLayout, LoadOp, MemoryLocality, RawBuffer, RawDescriptorSet, RawFramebuffer,
    RawPipeline, RawRenderPass, RenderPassDesc, SamplerDesc, ShaderStages, StoreOp,
};
use crate::render::commands::RecordingSession;
use crate::render::passes::graph::{GraphImage, ImageWrite, PassDeclaration};
use crate::render::passes::targets::SurfaceTargets;
use crate::render::pipeline::build_postfx_pipeline;
use crate::render::resources::{BindingSetHandle, BufferHandle, SamplerHandle};
use crate::render::{RenderDevice, RenderError, RenderResult};

/// Two triangles covering clip space: position then uv
pub const QUAD_VERTICES: [[f32; 4]; 6] = [
    [-1.0, 1.0, 0.0, 1.0],
    [-1.0, -1.0, 0.0, 0.0],
    [1.0, -1.0, 1.0, 0.0],
    [-1.0, 1.0, 0.0, 1.0],
    [1.0, -1.0, 1.0, 0.0],
    [1.0, 1.0, 1.0, 1.0],
];

fn input_layout() -> BindingLayout {
    BindingLayout::new().combined_image_sampler(0, ShaderStages::FRAGMENT)
}

/// Full-screen pass from the forward target to the swapchain
#[derive(Debug)]
pub struct PostFxPass {
    render_pass: RawRenderPass,
    pipeline: RawPipeline,
    layout: BindingLayout,
    quad: BufferHandle,
    quad_raw: RawBuffer,
    sampler: SamplerHandle,
    framebuffers: Vec<RawFramebuffer>,
    sets: Vec<BindingSetHandle>,
    raw_sets: Vec<RawDescriptorSet>,
}

impl PostFxPass {
    /// Samples forward color, writes the surface
    pub fn declaration() -> PassDeclaration {
        PassDeclaration {
            name: "postfx",
            writes: vec![ImageWrite {
                image: GraphImage::Surface,
                final_layout: ImageLayout::PresentSrc,
            }],
            samples: vec![GraphImage::ForwardColor],
        }
    }

    /// Create the pass for the swapchain format of `targets`
    pub fn new<B: GpuBackend>(device: &mut RenderDevice<B>, targets: &SurfaceTargets) -> RenderResult<Self> {
        let layout = input_layout();
        let render_pass = device.backend.create_render_pass(&RenderPassDesc {
            color: vec![AttachmentDesc {
                format: targets.format(),
                load: LoadOp::DontCare,
                store: StoreOp::Store,
                initial_layout: ImageLayout::Undefined,
                final_layout: ImageLayout::PresentSrc,
            }],
            depth: None,
        })?;
        let pipeline = match build_postfx_pipeline(&mut device.backend, &mut device.shaders, render_pass, &layout) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                device.backend.destroy_render_pass(render_pass);
                return Err(err);
            }
        };

        let quad_bytes: &[u8] = bytemuck::cast_slice(&QUAD_VERTICES);
        let quad = match device.create_buffer(
            quad_bytes.len() as u64,
            BufferUsage::VERTEX,
            MemoryLocality::DeviceLocal,
            Some(quad_bytes),
        ) {
            Ok(quad) => quad,
            Err(err) => {
                device.backend.destroy_pipeline(pipeline);
                device.backend.destroy_render_pass(render_pass);
                return Err(err);
            }
        };
        let sampler = match device.create_sampler(&SamplerDesc {
            filter: Filter::Linear,
            address_mode: AddressMode::ClampToEdge,
            max_anisotropy: None,
            max_lod: 0.0,
        }) {
            Ok(sampler) => sampler,
            Err(err) => {
                device.arena.destroy_immediate(&mut device.backend, quad)?;
                device.backend.destroy_pipeline(pipeline);
                device.backend.destroy_render_pass(render_pass);
                return Err(err);
            }
        };
        let quad_raw = device.arena.buffer(quad)?.raw();

        let mut pass = Self {
            render_pass,
            pipeline,
            layout,
            quad,
            quad_raw,
            sampler,
            framebuffers: Vec::new(),
            sets: Vec::new(),
            raw_sets: Vec::new(),
        };
        if let Err(err) = pass.create_targets(device, targets) {
            pass.destroy(device);
            return Err(err);
        }
        Ok(pass)
    }

    /// Backend render pass
    pub const fn render_pass(&self) -> RawRenderPass {
        self.render_pass
    }

    /// Framebuffers, indexed by swapchain image
    pub fn framebuffers(&self) -> &[RawFramebuffer] {
        &self.framebuffers
    }

    /// Input sets, indexed by swapchain image
    pub fn binding_sets(&self) -> &[BindingSetHandle] {
        &self.sets
    }

    /// Framebuffers over the swapchain views and input sets over the forward colors
    pub fn create_targets<B: GpuBackend>(
        &mut self,
        device: &mut RenderDevice<B>,
        targets: &SurfaceTargets,
    ) -> RenderResult<()> {
        let sampler = device.arena.sampler(self.sampler)?;
        for (view, color) in targets.swapchain_views().iter().zip(targets.color()) {
            let framebuffer = device
                .backend
                .create_framebuffer(self.render_pass, &[*view], targets.extent())?;
            self.framebuffers.push(framebuffer);

            let set = device.bindings.allocate(&mut device.backend, &self.layout)?;
            self.sets.push(set);
            device.bindings.write(
                &mut device.backend,
                set,
                &[DescriptorWrite {
                    binding: 0,
                    array_element: 0,
                    resource: DescriptorResource::ImageSampler {
                        view: color.view,
                        sampler,
                        layout: ImageLayout::ShaderReadOnly,
                    },
                }],
            )?;
            self.raw_sets.push(device.bindings.raw(set)?);
        }
        Ok(())
    }

    /// Destroy framebuffers and input sets; the device must be idle
    pub fn release_targets<B: GpuBackend>(&mut self, device: &mut RenderDevice<B>) {
        for framebuffer in self.framebuffers.drain(..) {
            device.backend.destroy_framebuffer(framebuffer);
        }
        for set in self.sets.drain(..) {
            if let Err(err) = device.bindings.free(&mut device.backend, set) {
                log::warn!("Freeing postfx input set failed: {err}");
            }
        }
        self.raw_sets.clear();
    }

    /// Record the pass for one swapchain image
    pub fn record(&self, session: &mut RecordingSession<'_>, image_index: usize, extent: Extent2D) -> RenderResult<()> {
        let (framebuffer, set) = self
            .framebuffers
            .get(image_index)
            .zip(self.raw_sets.get(image_index))
            .ok_or_else(|| RenderError::InvalidArgument(format!("no postfx targets for image {image_index}")))?;

        let mut pass = session.begin_render_pass(
            self.render_pass,
            *framebuffer,
            extent,
            vec![ClearValue::Color([0.0, 0.0, 0.0, 1.0])],
        );
        pass.set_viewport_scissor(extent);
        pass.bind_pipeline(self.pipeline);
        pass.bind_binding_set(self.pipeline, 0, *set);
        pass.bind_vertex_buffer(self.quad_raw);
        pass.draw(QUAD_VERTICES.len() as u32);
        Ok(())
    }

    /// Destroy everything the pass owns; the device must be idle
    pub fn destroy<B: GpuBackend>(&mut self, device: &mut RenderDevice<B>) {
        self.release_targets(device);
        for result in [
            device.arena.destroy_immediate(&mut device.backend, self.quad),
            device.arena.destroy_immediate(&mut device.backend, self.sampler),
        ] {
            if let Err(err) = result {
                log::warn!("Destroying postfx resource failed: {err}");
            }
        }
        device.backend.destroy_pipeline(self.pipeline);
        device.backend.destroy_render_pass(self.render_pass);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::Command;
    use crate::render::testing::{headless_device, surface_targets};

    #[test]
    fn test_one_input_set_per_swapchain_image() {
        let mut device = headless_device();
        let targets = surface_targets(&mut device);
        let pass = PostFxPass::new(&mut device, &targets).unwrap();
        assert_eq!(pass.framebuffers().len(), targets.image_count());
        assert_eq!(pass.binding_sets().len(), targets.image_count());
    }

    #[test]
    fn test_records_six_vertex_quad() {
        let mut device = headless_device();
        let targets = surface_targets(&mut device);
        let pass = PostFxPass::new(&mut device, &targets).unwrap();

        let mut commands = Vec::new();
        {
            let mut session = RecordingSession::for_commands(&mut commands);
            pass.record(&mut session, 2, targets.extent()).unwrap();
        }
        assert!(commands.contains(&Command::Draw {
            vertex_count: 6,
            first_vertex: 0
        }));

        let mut session = RecordingSession::for_commands(&mut commands);
        assert!(pass.record(&mut session, 7, targets.extent()).is_err());
    }
}
