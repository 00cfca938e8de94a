//! Render passes and the graph that orders them
//!
//! ```text
//! forward (color + depth, offscreen) ──ShaderReadOnly──▶ postfx (swapchain image) ──▶ present
//! ```

pub mod forward;
pub mod graph;
pub mod postfx;
pub mod targets;

pub use forward::{DrawItem, ForwardPass};
pub use graph::{derive_transitions, GraphFrame, GraphImage, ImageWrite, PassDeclaration, RenderGraph, Transition};
pub use postfx::{PostFxPass, QUAD_VERTICES};
pub use targets::{Attachment, SurfaceTargets, FORWARD_COLOR_FORMAT};
