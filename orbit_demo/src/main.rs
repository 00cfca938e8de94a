//! Orbit demo
//!
//! Three cubes circle a pivot under one camera and one light. Frames run on
//! the headless device, so no window or GPU is needed; halfway through the
//! surface is resized to exercise swapchain recreation.
//!
//! Usage: `orbit_demo [config.toml|config.ron] [frames]`

use std::f32::consts::TAU;

use render_core::prelude::*;
use render_core::render::backends::stub_spirv;
use render_core::render::pipeline::shader_files;
use thiserror::Error;

const DEFAULT_FRAMES: u64 = 240;
const ORBIT_RADIUS: f32 = 3.0;
const CUBES: usize = 3;

#[derive(Error, Debug)]
enum DemoError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid frame count '{0}'")]
    FrameCount(String),
}

impl From<SceneError> for DemoError {
    fn from(err: SceneError) -> Self {
        Self::Render(err.into())
    }
}

/// Checkerboard built as RGB and expanded on load
fn checker_texture(size: u32) -> RenderResult<ImageData> {
    let mut pixels = Vec::with_capacity((size * size * 3) as usize);
    for y in 0..size {
        for x in 0..size {
            let light = ((x / 4) + (y / 4)) % 2 == 0;
            pixels.extend_from_slice(if light { &[230, 230, 230] } else { &[40, 60, 160] });
        }
    }
    ImageData::from_rgb(size, size, pixels)
}

fn orbit_model() -> RenderResult<ModelData> {
    Ok(ModelData {
        meshes: vec![MeshData::cube("checker cube", Some(0)), MeshData::cube("plain cube", Some(1))],
        materials: vec![
            MaterialData {
                name: "checker".to_string(),
                base_color_texture: Some(0),
                ..MaterialData::default()
            },
            MaterialData {
                name: "amber".to_string(),
                base_color_factor: [1.0, 0.6, 0.1, 1.0],
                ..MaterialData::default()
            },
        ],
        textures: vec![checker_texture(32)?],
    })
}

struct OrbitScene {
    scene: Scene,
    pivot: NodeId,
}

impl OrbitScene {
    fn new(meshes: &[MeshHandle]) -> Result<Self, SceneError> {
        let mut scene = Scene::new();
        let root = scene.root();

        let camera = scene.add_node(root)?;
        scene.set_transform(camera, &Transform::from_position(Vec3::new(0.0, 2.0, 10.0)))?;
        scene.attach(camera, Attachment::Camera(Camera::default()))?;

        let sun = scene.add_node(root)?;
        scene.set_transform(
            sun,
            &Transform::from_position_rotation(
                Vec3::new(0.0, 5.0, 0.0),
                Quat::from_axis_angle(&Vec3::x_axis(), -std::f32::consts::FRAC_PI_4),
            ),
        )?;
        scene.attach(sun, Attachment::Light(Light::new(Vec3::new(1.0, 0.95, 0.9))))?;

        let pivot = scene.add_node(root)?;
        for index in 0..CUBES {
            let angle = TAU * index as f32 / CUBES as f32;
            let cube = scene.add_node(pivot)?;
            let position = Vec3::new(ORBIT_RADIUS * angle.cos(), 0.0, ORBIT_RADIUS * angle.sin());
            scene.set_transform(cube, &Transform::from_position(position).with_uniform_scale(0.5))?;
            scene.attach(cube, Attachment::Mesh(meshes[index % meshes.len()]))?;
        }

        Ok(Self { scene, pivot })
    }

    fn advance(&mut self, frame: u64) -> Result<(), SceneError> {
        let angle = frame as f32 * 0.02;
        let spin = Quat::from_axis_angle(&Vec3::y_axis(), angle);
        self.scene
            .set_transform(self.pivot, &Transform::from_position_rotation(Vec3::zeros(), spin))
    }
}

fn load_config(path: Option<&String>) -> Result<RendererConfig, DemoError> {
    let Some(path) = path else {
        return Ok(RendererConfig::new("Orbit Demo"));
    };
    log::info!("Loading configuration from {path}");
    let config = RendererConfig::load_from_file(path)?;
    config.validate()?;
    Ok(config)
}

fn run() -> Result<(), DemoError> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = load_config(args.first())?;
    let frames = match args.get(1) {
        Some(count) => count.parse().map_err(|_| DemoError::FrameCount(count.clone()))?,
        None => DEFAULT_FRAMES,
    };

    let surface = Extent2D::new(config.surface.width, config.surface.height);
    let backend = HeadlessBackend::new(HeadlessConfig::default().with_surface_extent(surface));
    let mut device = RenderDevice::new(backend, &config);
    for name in shader_files() {
        device.preload_shader(name, &stub_spirv())?;
    }

    let mut renderer = FrameOrchestrator::with_device(device, config)?;
    let meshes = renderer.load_model(&orbit_model()?)?;
    if meshes.is_empty() {
        return Err(RenderError::InvalidArgument("model has no meshes".to_string()).into());
    }
    let mut orbit = OrbitScene::new(&meshes)?;

    let (mut presented, mut skipped) = (0u64, 0u64);
    for frame in 0..frames {
        if frame == frames / 2 {
            log::info!("Resizing surface to 1280x720");
            renderer.device_mut().backend_mut().resize_surface(Extent2D::new(1280, 720));
        }

        orbit.advance(frame)?;
        match renderer.render_frame(&orbit.scene)? {
            FrameOutcome::Presented { draws, .. } => {
                presented += 1;
                log::trace!("Frame {frame}: {draws} draws");
            }
            FrameOutcome::Skipped(reason) => {
                skipped += 1;
                log::info!("Frame {frame} skipped: {reason:?}");
            }
        }
    }

    renderer.device_mut().wait_idle()?;
    let stats = renderer.device().backend().stats();
    let errors = renderer.device().backend().validation_errors();
    log::info!("Presented {presented} frames, skipped {skipped}");
    log::info!(
        "Device: {} submissions, {} draws, {} presents, {} swapchains, {} blocking fence waits",
        stats.submissions,
        stats.draws,
        stats.presents,
        stats.swapchains_created,
        stats.blocking_fence_waits
    );
    if errors.is_empty() {
        log::info!("No validation errors");
    } else {
        for error in errors {
            log::error!("Validation: {error}");
        }
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
    log::info!("Starting orbit demo");

    if let Err(err) = run() {
        log::error!("Orbit demo failed: {err}");
        std::process::exit(1);
    }
    log::info!("Orbit demo finished");
}
