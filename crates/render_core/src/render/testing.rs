//! Shared fixtures for unit tests

use crate::core::RendererConfig;
use crate::render::api::{Extent2D, Format, PresentMode, SwapchainRequest};
use crate::render::backends::{stub_spirv, HeadlessBackend};
use crate::render::passes::SurfaceTargets;
use crate::render::pipeline::shader_files;
use crate::render::{FrameOrchestrator, RenderDevice};

fn preload_stub_shaders(device: &mut RenderDevice<HeadlessBackend>) {
    for name in shader_files() {
        device.preload_shader(name, &stub_spirv()).unwrap();
    }
}

/// Headless device with every renderer shader registered
pub fn headless_device() -> RenderDevice<HeadlessBackend> {
    crate::foundation::logging::init_for_tests();
    let mut device = RenderDevice::new(HeadlessBackend::default(), &RendererConfig::default());
    preload_stub_shaders(&mut device);
    device
}

/// Orchestrator on a fresh headless device
pub fn headless_orchestrator(config: RendererConfig) -> FrameOrchestrator<HeadlessBackend> {
    crate::foundation::logging::init_for_tests();
    let mut device = RenderDevice::new(HeadlessBackend::default(), &config);
    preload_stub_shaders(&mut device);
    FrameOrchestrator::with_device(device, config).unwrap()
}

/// Swapchain and attachments at the headless surface's default extent
pub fn surface_targets(device: &mut RenderDevice<HeadlessBackend>) -> SurfaceTargets {
    let request = SwapchainRequest {
        extent: Extent2D::new(800, 600),
        preferred_format: Format::B8G8R8A8Unorm,
        present_mode: PresentMode::Fifo,
    };
    SurfaceTargets::create(device, &request, Format::D32Sfloat).unwrap()
}
