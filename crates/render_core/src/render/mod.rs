//! # Rendering Core
//!
//! GPU resource management and per-frame orchestration for a forward
//! renderer with a post-processing pass.
//!
//! ## Architecture
//!
//! - **RenderDevice**: a backend plus the device-scoped tables (resource
//!   arena, binding-set allocator, command recorder, shader cache)
//! - **FrameOrchestrator**: acquires frame slots and swapchain images, runs
//!   the scene compiler and the pass graph, submits and presents
//! - **Backends**: the Vulkan implementation and a headless software device
//!   with validation, selected through the [`api::GpuBackend`] trait
//!
//! Everything is driven from one thread; the GPU runs asynchronously and
//! frame slots bound how far the CPU may run ahead.

pub mod api;
pub mod backends;
pub mod commands;
pub mod device;
pub mod error;
pub mod frame_uniforms;
pub mod material;
pub mod mesh;
pub mod passes;
pub mod pipeline;
pub mod renderer;
pub mod resources;
pub mod shader_cache;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

mod renderer_tests;

pub use device::RenderDevice;
pub use error::{ErrorSeverity, RenderError, RenderResult};
pub use renderer::{FrameOrchestrator, FrameOutcome, SkipReason};
