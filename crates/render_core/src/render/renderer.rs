//! Frame orchestrator
//!
//! Drives one frame end to end:
//!
//! ```text
//! compile scene ─▶ acquire slot (fence) ─▶ prepare materials ─▶ write uniforms
//!      ─▶ resolve draws ─▶ acquire image ─▶ record graph ─▶ submit ─▶ present
//! ```
//!
//! # Frame slots
//!
//! The orchestrator cycles through `frames_in_flight` slots. A slot owns one
//! graphics command buffer, one fence/semaphore triple from the
//! [`SyncPool`] and one region of per-frame uniform storage. Waiting on the
//! slot's fence is the only blocking point of a steady-state frame; once it
//! returns, everything the slot owns may be rewritten.
//!
//! # Failure handling
//!
//! Every step that can fail on stale handles (materials, uniform writes,
//! buffer lookups) runs before a swapchain image is acquired. Once an image
//! is held, a failed frame still hands it back: a release batch transitions
//! the image to `PresentSrc`, consumes the acquire semaphore and signals the
//! slot fence, and the image is presented untouched. A frame that fails
//! before acquiring only re-signals its fence. Either way the next frame
//! starts from a consistent state.
//!
//! Surface changes reported by acquire or present drop the frame and rebuild
//! every surface-sized resource. A surface that is still out of date right
//! after one rebuild is returned as an error instead of looping.

use crate::core::RendererConfig;
use crate::render::api::{
    AcquiredImage, Extent2D, Format, GpuBackend, ImageAspect, ImageBarrier, ImageLayout, PresentStatus, QueueKind,
    RawDescriptorSet, SwapchainRequest,
};
use crate::render::commands::CommandBufferHandle;
use crate::render::frame_uniforms::FrameUniforms;
use crate::render::material::{MaterialHandle, MaterialLibrary, TextureHandle};
use crate::render::mesh::{MeshHandle, MeshLibrary, ModelData};
use crate::render::passes::{DrawItem, GraphFrame, RenderGraph, SurfaceTargets};
use crate::render::pipeline::{SceneCounts, TextureSlot};
use crate::render::resources::{select_depth_format, ImageData};
use crate::render::sync::{FrameSlot, SyncPool};
use crate::render::{RenderDevice, RenderError, RenderResult};
use crate::scene::{compile, CompiledScene, Scene};

/// Why a frame produced no image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The swapchain was rebuilt for a changed surface
    SurfaceOutOfDate,
    /// The surface has no area
    SurfaceMinimized,
}

/// Result of [`FrameOrchestrator::render_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted and queued for presentation
    Presented {
        /// Swapchain image rendered into
        image_index: u32,
        /// Frame slot used
        slot: usize,
        /// Forward draws recorded
        draws: usize,
    },
    /// Nothing was presented
    Skipped(SkipReason),
}

/// Where in the frame a failure happened
enum FrameError {
    /// No swapchain image is held
    BeforeAcquire(RenderError),
    /// `image_index` was acquired and must be handed back
    AfterAcquire { image_index: u32, error: RenderError },
}

/// Top-level renderer: owns the device, the passes and every frame slot
pub struct FrameOrchestrator<B: GpuBackend> {
    config: RendererConfig,
    sync: SyncPool,
    command_buffers: Vec<CommandBufferHandle>,
    uniforms: FrameUniforms,
    graph: RenderGraph,
    targets: SurfaceTargets,
    materials: MaterialLibrary,
    meshes: MeshLibrary,
    frame_number: u64,
    needs_recreate: bool,
    surface_retry: bool,
    shut_down: bool,
    device: RenderDevice<B>,
}

impl<B: GpuBackend> FrameOrchestrator<B> {
    /// Create a device over `backend` and build the renderer on it
    pub fn new(backend: B, config: RendererConfig) -> RenderResult<Self> {
        let device = RenderDevice::new(backend, &config);
        Self::with_device(device, config)
    }

    /// Build the renderer on an existing device
    ///
    /// Shaders the device already holds (see [`RenderDevice::preload_shader`])
    /// are used instead of reading the shader directory.
    pub fn with_device(mut device: RenderDevice<B>, config: RendererConfig) -> RenderResult<Self> {
        config
            .validate()
            .map_err(|err| RenderError::InvalidArgument(err.to_string()))?;
        let frames = config.frames_in_flight;

        let depth_format = select_depth_format(&device.backend)?;
        let targets = SurfaceTargets::create(&mut device, &swapchain_request(&config), depth_format)?;

        let counts = SceneCounts::new(1, 1);
        let graph = RenderGraph::new(&mut device, &targets, config.shading_model, counts, config.clear_color)?;
        let scene_layout = graph.forward().pipeline().scene_layout().clone();
        let uniforms = FrameUniforms::new(&mut device, &scene_layout, counts, frames)?;
        let sync = SyncPool::new(&mut device.backend, frames, config.fence_timeout_ns())?;

        let command_buffers = (0..frames)
            .map(|_| device.recorder.allocate(&mut device.backend, QueueKind::Graphics))
            .collect::<RenderResult<Vec<_>>>()?;

        log::info!(
            "Frame orchestrator ready: {} frames in flight, {:?} shading, {}x{} surface",
            frames,
            config.shading_model,
            targets.extent().width,
            targets.extent().height
        );
        Ok(Self {
            materials: MaterialLibrary::new(config.shading_model, frames),
            meshes: MeshLibrary::new(),
            config,
            sync,
            command_buffers,
            uniforms,
            graph,
            targets,
            frame_number: 0,
            needs_recreate: false,
            surface_retry: false,
            shut_down: false,
            device,
        })
    }

    // Accessors

    /// The device
    pub const fn device(&self) -> &RenderDevice<B> {
        &self.device
    }

    /// The device, mutably
    pub fn device_mut(&mut self) -> &mut RenderDevice<B> {
        &mut self.device
    }

    /// Active configuration
    pub const fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Uploaded meshes
    pub const fn meshes(&self) -> &MeshLibrary {
        &self.meshes
    }

    /// Materials and textures
    pub const fn materials(&self) -> &MaterialLibrary {
        &self.materials
    }

    /// Current swapchain and attachments
    pub const fn targets(&self) -> &SurfaceTargets {
        &self.targets
    }

    /// The pass graph
    pub const fn graph(&self) -> &RenderGraph {
        &self.graph
    }

    /// Per-slot scene uniforms
    pub const fn uniforms(&self) -> &FrameUniforms {
        &self.uniforms
    }

    /// Number of frames submitted so far
    pub const fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Command buffer of each frame slot
    pub fn slot_command_buffers(&self) -> &[CommandBufferHandle] {
        &self.command_buffers
    }

    // Assets

    /// Upload a model's textures, materials and meshes
    ///
    /// Returns the created meshes in model order. Blocks on the staging copies.
    pub fn load_model(&mut self, model: &ModelData) -> RenderResult<Vec<MeshHandle>> {
        let textures = model
            .textures
            .iter()
            .map(|image| self.materials.create_texture(&mut self.device, image))
            .collect::<RenderResult<Vec<_>>>()?;
        let materials = model
            .materials
            .iter()
            .map(|material| self.materials.create_material(&mut self.device, material, &textures))
            .collect::<RenderResult<Vec<_>>>()?;
        let fallback = self.materials.default_material(&mut self.device)?;

        let meshes = model
            .meshes
            .iter()
            .map(|mesh| self.meshes.upload(&mut self.device, mesh, &materials, fallback))
            .collect::<RenderResult<Vec<_>>>()?;
        log::info!(
            "Loaded model: {} meshes, {} materials, {} textures",
            meshes.len(),
            materials.len(),
            textures.len()
        );
        Ok(meshes)
    }

    /// Remove a mesh; its buffers outlive every frame that may still draw it
    pub fn remove_mesh(&mut self, mesh: MeshHandle) -> RenderResult<()> {
        self.meshes.remove(&mut self.device, mesh)
    }

    /// Upload a standalone texture
    pub fn create_texture(&mut self, data: &ImageData) -> RenderResult<TextureHandle> {
        self.materials.create_texture(&mut self.device, data)
    }

    /// Remove a texture no material samples anymore
    ///
    /// The image and sampler are released once in-flight frames retire.
    pub fn remove_texture(&mut self, texture: TextureHandle) -> RenderResult<()> {
        self.materials.remove_texture(&mut self.device, texture)
    }

    /// Hot-swap the texture a material samples
    ///
    /// Each frame slot picks up the change the next time it is prepared.
    pub fn set_material_texture(
        &mut self,
        material: MaterialHandle,
        slot: TextureSlot,
        texture: TextureHandle,
    ) -> RenderResult<()> {
        self.materials.set_texture(material, slot, texture)
    }

    // Frame loop

    /// Render and present one frame of `scene`
    pub fn render_frame(&mut self, scene: &Scene) -> RenderResult<FrameOutcome> {
        if self.shut_down {
            return Err(RenderError::invalid_operation("renderer has been shut down"));
        }
        if self.device.backend.surface_extent().is_empty() {
            log::trace!("Surface minimized, skipping frame {}", self.frame_number);
            return Ok(FrameOutcome::Skipped(SkipReason::SurfaceMinimized));
        }
        if self.needs_recreate {
            self.recreate_surface()?;
        }

        let compiled = compile(scene, &self.meshes, self.targets.extent().aspect())?;
        let counts = SceneCounts::new(compiled.cameras.len(), compiled.lights.len());
        if counts != self.uniforms.counts() {
            self.rebuild_scene_bindings(counts)?;
        }

        let slot = self.sync.acquire_slot(&mut self.device.backend, self.frame_number)?;
        self.device.arena.begin_frame(self.frame_number);
        let released = self
            .device
            .arena
            .release_retired(&mut self.device.backend, self.sync.completed_frame());
        if released > 0 {
            log::trace!("Released {released} retired resources");
        }

        let (acquired, draws) = match self.record_and_submit(&slot, &compiled) {
            Ok(submitted) => submitted,
            Err(FrameError::BeforeAcquire(err)) => {
                // The fence was reset but nothing will signal it.
                self.sync.abandon(&mut self.device.backend, &slot)?;
                return self.surface_error(err);
            }
            Err(FrameError::AfterAcquire { image_index, error }) => {
                self.release_image(&slot, image_index, &error)?;
                return self.surface_error(error);
            }
        };

        let presented = self
            .device
            .backend
            .present(acquired.index, SyncPool::signal_on_present(&slot));
        self.frame_number += 1;
        match presented {
            Ok(PresentStatus::Optimal) => {}
            Ok(PresentStatus::Suboptimal) => self.needs_recreate = true,
            Err(err) => return self.surface_error(err),
        }
        if acquired.suboptimal {
            self.needs_recreate = true;
        }

        self.surface_retry = false;
        Ok(FrameOutcome::Presented {
            image_index: acquired.index,
            slot: slot.index,
            draws,
        })
    }

    /// Everything between the fence wait and the queue submission
    fn record_and_submit(
        &mut self,
        slot: &FrameSlot,
        compiled: &CompiledScene,
    ) -> Result<(AcquiredImage, usize), FrameError> {
        let cb = self.slot_command_buffer(slot.index).map_err(FrameError::BeforeAcquire)?;
        let (draws, scene_set) = self.prepare_frame(cb, slot, compiled).map_err(FrameError::BeforeAcquire)?;

        let acquired = self
            .device
            .backend
            .acquire_next_image(slot.sync.image_available, self.config.fence_timeout_ns())
            .map_err(FrameError::BeforeAcquire)?;

        let issued = self
            .record_graph(cb, slot, acquired.index, scene_set, &draws)
            .map_err(|error| FrameError::AfterAcquire {
                image_index: acquired.index,
                error,
            })?;
        Ok((acquired, issued))
    }

    /// Slot work that needs no swapchain image
    ///
    /// The slot's fence has been waited on, so its uniform region and
    /// material sets are free to rewrite.
    fn prepare_frame(
        &mut self,
        cb: CommandBufferHandle,
        slot: &FrameSlot,
        compiled: &CompiledScene,
    ) -> RenderResult<(Vec<DrawItem>, RawDescriptorSet)> {
        self.device.recorder.retire(cb)?;
        self.materials.prepare_slot(&mut self.device, slot.index)?;
        self.uniforms.write(
            &mut self.device,
            slot.index,
            &compiled.info,
            &compiled.cameras,
            &compiled.lights,
        )?;
        let draws = self.draw_items(compiled, slot.index)?;
        let scene_set = self.device.bindings.raw(self.uniforms.scene_set(slot.index)?)?;
        Ok((draws, scene_set))
    }

    fn record_graph(
        &mut self,
        cb: CommandBufferHandle,
        slot: &FrameSlot,
        image_index: u32,
        scene_set: RawDescriptorSet,
        draws: &[DrawItem],
    ) -> RenderResult<usize> {
        let frame = GraphFrame {
            image_index: image_index as usize,
            scene_set,
            draws,
        };

        self.device.recorder.begin(cb)?;
        let recorded = {
            let mut session = self.device.recorder.session(cb)?;
            self.graph.record(&mut session, &frame)
        };
        self.device.recorder.end(&mut self.device.backend, cb)?;
        let issued = match recorded {
            Ok(issued) => issued,
            Err(err) => {
                self.device.recorder.retire(cb)?;
                return Err(err);
            }
        };

        self.device
            .recorder
            .submit(&mut self.device.backend, &[cb], SyncPool::signal_on_submit(slot))?;
        Ok(issued)
    }

    /// Hand an acquired image back after its frame failed
    ///
    /// The release batch waits on the acquire semaphore and signals the
    /// slot's fence, so the slot and the image are both reusable afterwards.
    /// If the batch cannot be submitted the fence is re-signalled instead.
    fn release_image(&mut self, slot: &FrameSlot, image_index: u32, cause: &RenderError) -> RenderResult<()> {
        if matches!(cause, RenderError::DeviceLost) {
            return Ok(());
        }
        log::warn!("Frame {} failed after acquiring image {image_index}: {cause}", self.frame_number);

        if let Err(err) = self.submit_release_batch(slot, image_index) {
            log::warn!("Releasing swapchain image {image_index} failed: {err}");
            return self.sync.abandon(&mut self.device.backend, slot);
        }
        self.frame_number += 1;

        match self
            .device
            .backend
            .present(image_index, SyncPool::signal_on_present(slot))
        {
            Ok(PresentStatus::Optimal) => {}
            Ok(PresentStatus::Suboptimal) => self.needs_recreate = true,
            Err(err) if err.is_surface_change() => self.needs_recreate = true,
            Err(err) => return Err(err),
        }
        Ok(())
    }

    fn submit_release_batch(&mut self, slot: &FrameSlot, image_index: u32) -> RenderResult<()> {
        let cb = self.slot_command_buffer(slot.index)?;
        let image = self
            .targets
            .swapchain_images()
            .get(image_index as usize)
            .copied()
            .ok_or_else(|| RenderError::InvalidArgument(format!("no swapchain image {image_index}")))?;

        let recorder = &mut self.device.recorder;
        recorder.discard(cb)?;
        recorder.begin(cb)?;
        recorder.session(cb)?.image_barrier(ImageBarrier {
            image,
            aspect: ImageAspect::Color,
            old_layout: ImageLayout::Undefined,
            new_layout: ImageLayout::PresentSrc,
            base_mip: 0,
            mip_count: 1,
        });
        recorder.end(&mut self.device.backend, cb)?;
        recorder.submit(&mut self.device.backend, &[cb], SyncPool::signal_on_submit(slot))
    }

    fn draw_items(&self, compiled: &CompiledScene, slot_index: usize) -> RenderResult<Vec<DrawItem>> {
        compiled
            .visible_entries()
            .map(|entry| {
                let set = self.materials.binding_set(entry.material, slot_index)?;
                Ok(DrawItem {
                    vertex_buffer: self.device.arena.buffer(entry.vertex_buffer)?.raw(),
                    index_buffer: self.device.arena.buffer(entry.index_buffer)?.raw(),
                    first_index: entry.first_index,
                    index_count: entry.index_count,
                    material_set: self.device.bindings.raw(set)?,
                    world: entry.world,
                    visible: entry.visible,
                })
            })
            .collect()
    }

    fn slot_command_buffer(&self, slot_index: usize) -> RenderResult<CommandBufferHandle> {
        self.command_buffers
            .get(slot_index)
            .copied()
            .ok_or_else(|| RenderError::InvalidArgument(format!("frame slot {slot_index} out of range")))
    }

    /// Drop the frame and rebuild the surface, at most once in a row
    fn surface_error(&mut self, err: RenderError) -> RenderResult<FrameOutcome> {
        if !err.is_surface_change() {
            return Err(err);
        }
        if self.surface_retry {
            log::warn!("Surface still out of date after recreation: {err}");
            self.surface_retry = false;
            self.needs_recreate = true;
            return Err(err);
        }

        log::warn!("Surface changed ({err}), recreating and skipping frame {}", self.frame_number);
        self.surface_retry = true;
        self.recreate_surface()?;
        Ok(FrameOutcome::Skipped(SkipReason::SurfaceOutOfDate))
    }

    // Surface

    /// Rebuild surface resources at the surface's current extent
    ///
    /// The new size replaces the configured surface size, which backends without
    /// a fixed surface size use for the new swapchain. A zero-area extent
    /// defers recreation until the surface has area again.
    pub fn resize(&mut self, width: u32, height: u32) -> RenderResult<()> {
        if width > 0 && height > 0 {
            self.config.surface.width = width;
            self.config.surface.height = height;
        }
        if self.device.backend.surface_extent().is_empty() {
            log::debug!("Resize to an empty surface deferred");
            self.needs_recreate = true;
            return Ok(());
        }
        self.recreate_surface()
    }

    fn recreate_surface(&mut self) -> RenderResult<()> {
        self.needs_recreate = true;
        self.device.wait_idle()?;
        self.sync.wait_all(&mut self.device.backend)?;
        self.device
            .arena
            .release_retired(&mut self.device.backend, self.sync.completed_frame());
        self.retire_command_buffers()?;

        self.graph.release_targets(&mut self.device);
        self.targets.release(&mut self.device);

        let depth_format = self.targets.depth_format();
        self.targets = SurfaceTargets::create(&mut self.device, &swapchain_request(&self.config), depth_format)?;
        self.graph.attach_targets(&mut self.device, &self.targets)?;
        self.needs_recreate = false;

        log::info!(
            "Surface resources recreated at {}x{}",
            self.targets.extent().width,
            self.targets.extent().height
        );
        Ok(())
    }

    /// Resize the scene arrays; blocks until the device is idle
    fn rebuild_scene_bindings(&mut self, counts: SceneCounts) -> RenderResult<()> {
        self.device.wait_idle()?;
        self.sync.wait_all(&mut self.device.backend)?;
        self.retire_command_buffers()?;

        self.uniforms.destroy(&mut self.device);
        self.graph.rebuild_forward_pipeline(&mut self.device, counts)?;
        let scene_layout = self.graph.forward().pipeline().scene_layout().clone();
        self.uniforms = FrameUniforms::new(&mut self.device, &scene_layout, counts, self.sync.len())?;

        log::info!(
            "Scene bindings rebuilt for {} cameras and {} lights",
            counts.cameras,
            counts.lights
        );
        Ok(())
    }

    fn retire_command_buffers(&mut self) -> RenderResult<()> {
        for cb in &self.command_buffers {
            self.device.recorder.retire(*cb)?;
        }
        Ok(())
    }

    // Teardown

    /// Wait for the GPU and release every renderer-owned object
    ///
    /// Called by `Drop`; calling it earlier makes later frames an error.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        if let Err(err) = self.device.wait_idle() {
            log::error!("Device did not go idle before shutdown: {err}");
        }

        self.graph.destroy(&mut self.device);
        self.targets.release(&mut self.device);
        self.device.backend.destroy_swapchain();
        self.uniforms.destroy(&mut self.device);
        self.sync.destroy(&mut self.device.backend);
        self.meshes.clear();
        self.device.destroy_all();
        log::info!("Frame orchestrator shut down after {} frames", self.frame_number);
    }
}

impl<B: GpuBackend> Drop for FrameOrchestrator<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<B: GpuBackend> std::fmt::Debug for FrameOrchestrator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameOrchestrator")
            .field("frame_number", &self.frame_number)
            .field("frames_in_flight", &self.sync.len())
            .field("extent", &self.targets.extent())
            .field("meshes", &self.meshes.len())
            .finish_non_exhaustive()
    }
}

fn swapchain_request(config: &RendererConfig) -> SwapchainRequest {
    SwapchainRequest {
        extent: Extent2D::new(config.surface.width, config.surface.height),
        preferred_format: Format::B8G8R8A8Srgb,
        present_mode: config.surface.present_mode,
    }
}
