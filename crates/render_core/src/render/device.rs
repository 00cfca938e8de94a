//! Render device
//!
//! Owns a backend together with every device-scoped table: the resource
//! arena, the binding-set allocator, the command recorder and the shader
//! cache. Nothing here is global, so several devices can live side by side.

use crate::core::RendererConfig;
use crate::render::api::{BufferUsage, GpuBackend, MemoryLocality, SamplerDesc};
use crate::render::commands::CommandRecorder;
use crate::render::resources::{
    BindingSetAllocator, BufferHandle, ImageData, ImageHandle, ResourceArena, ResourceHandle, SamplerHandle,
};
use crate::render::shader_cache::ShaderCache;
use crate::render::RenderResult;

/// A backend plus the tables built on top of it
#[derive(Debug)]
pub struct RenderDevice<B: GpuBackend> {
    pub(crate) backend: B,
    pub(crate) arena: ResourceArena,
    pub(crate) bindings: BindingSetAllocator,
    pub(crate) recorder: CommandRecorder,
    pub(crate) shaders: ShaderCache,
    destroyed: bool,
}

impl<B: GpuBackend> RenderDevice<B> {
    /// Wrap `backend` using the allocator settings of `config`
    pub fn new(backend: B, config: &RendererConfig) -> Self {
        log::info!("Render device on '{}'", backend.adapter_name());
        Self {
            backend,
            arena: ResourceArena::new(),
            bindings: BindingSetAllocator::new(config.binding_pool_capacity, config.max_binding_pools_per_layout),
            recorder: CommandRecorder::new(),
            shaders: ShaderCache::new(&config.shader_dir),
            destroyed: false,
        }
    }

    /// The backend
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// The backend, mutably
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Resource arena
    pub const fn arena(&self) -> &ResourceArena {
        &self.arena
    }

    /// Binding-set allocator
    pub const fn bindings(&self) -> &BindingSetAllocator {
        &self.bindings
    }

    /// Command recorder
    pub const fn recorder(&self) -> &CommandRecorder {
        &self.recorder
    }

    /// Shader cache
    pub const fn shaders(&self) -> &ShaderCache {
        &self.shaders
    }

    /// Register SPIR-V for `name` without touching the filesystem
    pub fn preload_shader(&mut self, name: &str, words: &[u32]) -> RenderResult<()> {
        self.shaders.preload(&mut self.backend, name, words).map(|_| ())
    }

    /// See [`ResourceArena::create_buffer`]
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: BufferUsage,
        locality: MemoryLocality,
        initial_data: Option<&[u8]>,
    ) -> RenderResult<BufferHandle> {
        self.arena
            .create_buffer(&mut self.backend, &mut self.recorder, size, usage, locality, initial_data)
    }

    /// See [`ResourceArena::read_buffer`]
    pub fn read_buffer(&mut self, handle: BufferHandle) -> RenderResult<Vec<u8>> {
        self.arena.read_buffer(&mut self.backend, &mut self.recorder, handle)
    }

    /// See [`ResourceArena::upload_texture`]
    pub fn upload_texture(&mut self, data: &ImageData) -> RenderResult<ImageHandle> {
        self.arena.upload_texture(&mut self.backend, &mut self.recorder, data)
    }

    /// See [`ResourceArena::create_sampler`]
    pub fn create_sampler(&mut self, desc: &SamplerDesc) -> RenderResult<SamplerHandle> {
        self.arena.create_sampler(&mut self.backend, desc)
    }

    /// Deferred destroy, see [`ResourceArena::destroy`]
    pub fn destroy(&mut self, handle: impl Into<ResourceHandle>) -> RenderResult<()> {
        self.arena.destroy(handle)
    }

    /// Block until the device is idle
    pub fn wait_idle(&mut self) -> RenderResult<()> {
        self.backend.wait_idle()
    }

    /// Tear down every table; further use of the device is an error
    pub fn destroy_all(&mut self) {
        if self.destroyed {
            return;
        }
        if let Err(err) = self.backend.wait_idle() {
            log::error!("Device did not go idle before teardown: {err}");
        }
        self.recorder.destroy_all(&mut self.backend);
        self.bindings.destroy_all(&mut self.backend);
        self.arena.destroy_all(&mut self.backend);
        self.shaders.destroy_all(&mut self.backend);
        self.destroyed = true;
        log::info!("Render device destroyed");
    }
}

impl<B: GpuBackend> Drop for RenderDevice<B> {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::HeadlessBackend;
    use crate::render::testing::headless_device;

    #[test]
    fn test_devices_are_independent() {
        let mut first = headless_device();
        let mut second = headless_device();
        first
            .create_buffer(64, BufferUsage::UNIFORM, MemoryLocality::HostVisible, None)
            .unwrap();
        assert_eq!(first.arena().live_counts().0, 1);
        assert_eq!(second.arena().live_counts().0, 0);
        second.destroy_all();
        assert!(!first.shaders().is_empty());
    }

    #[test]
    fn test_destroy_all_releases_backend_objects() {
        let mut device = RenderDevice::new(HeadlessBackend::default(), &RendererConfig::default());
        device
            .create_buffer(16, BufferUsage::VERTEX, MemoryLocality::DeviceLocal, Some(&[1; 16]))
            .unwrap();
        device.upload_texture(&ImageData::solid(4, 4, [1, 2, 3, 4])).unwrap();
        device.destroy_all();

        let (buffers, images, views, sets) = device.backend().live_objects();
        assert_eq!((buffers, images, views, sets), (0, 0, 0, 0));
        assert!(device.backend().validation_errors().is_empty());
    }
}
