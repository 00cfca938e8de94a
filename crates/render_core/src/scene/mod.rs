//! Scene graph and scene compilation
//!
//! ## Architecture
//!
//! ```text
//! Scene (node arena, owned by the application)
//!      ↓  compile()
//! CompiledScene (render list + camera/light uniforms, rebuilt every frame)
//!      ↓
//! Frame orchestrator
//! ```

mod camera;
mod compiler;
mod graph;
mod light;

pub use camera::Camera;
pub use compiler::{compile, CompiledScene, RenderListEntry};
pub use graph::{Attachment, NodeId, Scene, DEFAULT_AMBIENT};
pub use light::Light;

use thiserror::Error;

/// Scene construction and traversal errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    /// The node was removed or belongs to another scene
    #[error("Unknown scene node")]
    UnknownNode,

    /// The new parent is the node itself or one of its descendants
    #[error("Reparenting would create a cycle")]
    WouldCreateCycle,

    /// The root has no parent to change
    #[error("The root node cannot be moved or removed")]
    CannotMoveRoot,

    /// Traversal reached a node twice
    #[error("Cycle detected during scene traversal")]
    CycleDetected,
}
