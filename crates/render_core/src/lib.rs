//! # Render Core
//!
//! Frame orchestration and GPU resource management for a Vulkan forward
//! renderer.
//!
//! ## Features
//!
//! - **Resource Arena**: buffers, images and samplers behind generational
//!   handles, with staged uploads and deferred destruction
//! - **Frames in flight**: fence and semaphore sets per frame slot
//! - **Binding sets**: growable descriptor pools per layout
//! - **Pass graph**: forward pass into an offscreen target, then a
//!   full-screen post-processing pass into the swapchain
//! - **Scene graph**: node arena compiled into a flat render list each frame
//! - **Headless backend**: a software device with validation for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_core::prelude::*;
//!
//! fn main() -> Result<(), RenderError> {
//!     let config = RendererConfig::default();
//!     let mut renderer = FrameOrchestrator::new(HeadlessBackend::default(), config)?;
//!     let meshes = renderer.load_model(&ModelData {
//!         meshes: vec![MeshData::cube("cube", None)],
//!         ..ModelData::default()
//!     })?;
//!
//!     let mut scene = Scene::new();
//!     let node = scene.add_node(scene.root())?;
//!     scene.attach(node, Attachment::Mesh(meshes[0]))?;
//!     renderer.render_frame(&scene)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod core;
pub mod foundation;
pub mod render;
pub mod scene;

/// Common imports for renderer users
pub mod prelude {
    pub use crate::{
        config::{Config, ConfigError},
        core::{RendererConfig, SurfaceConfig},
        foundation::math::{Mat4, Quat, Transform, Vec3, Vec4},
        render::{
            api::{Extent2D, GpuBackend, PresentMode},
            backends::{HeadlessBackend, HeadlessConfig},
            material::{MaterialData, MaterialHandle, TextureHandle},
            mesh::{MeshData, MeshHandle, ModelData, PrimitiveData, Vertex},
            pipeline::{ShadingModel, TextureSlot},
            resources::ImageData,
            ErrorSeverity, FrameOrchestrator, FrameOutcome, RenderDevice, RenderError, RenderResult, SkipReason,
        },
        scene::{Attachment, Camera, Light, NodeId, Scene, SceneError},
    };
}
