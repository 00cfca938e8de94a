//! Backend seam
//!
//! Types and the [`GpuBackend`] trait shared by the render core and the
//! backends in [`crate::render::backends`].

/// The trait every backend implements
pub mod backend;
/// Backend-neutral recorded commands
pub mod command;
/// Handles, descriptors, formats and flags
pub mod types;

pub use backend::GpuBackend;
pub use command::{Command, ImageBarrier};
pub use types::*;
