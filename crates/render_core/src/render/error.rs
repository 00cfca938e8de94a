//! Render error taxonomy

use thiserror::Error;

use crate::render::api::MemoryProperties;
use crate::scene::SceneError;

/// How far an error reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// The failed operation is abandoned; the session continues
    Operation,
    /// The device is unusable; full teardown and reinit required
    Session,
    /// Recreate surface resources and skip the frame
    Recoverable,
    /// Failure while building immutable startup state
    Startup,
}

/// Errors raised by the render core and its backends
#[derive(Error, Debug)]
pub enum RenderError {
    /// Allocation or pool growth failed
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// No memory type matches, or the matching heap is full
    #[error("Out of memory: {requested} bytes with {properties:?}")]
    OutOfMemory {
        /// Bytes requested
        requested: u64,
        /// Properties the allocation needed
        properties: MemoryProperties,
    },

    /// A single descriptor pool has no room left
    #[error("Descriptor pool exhausted")]
    PoolExhausted,

    /// The device stopped responding
    #[error("Device lost")]
    DeviceLost,

    /// The swapchain no longer matches the surface and cannot be used
    #[error("Presentation surface out of date")]
    SurfaceOutOfDate,

    /// The swapchain still works but no longer matches the surface
    #[error("Presentation surface suboptimal")]
    SurfaceSuboptimal,

    /// Shader module or pipeline creation failed
    #[error("Shader or pipeline build failure: {0}")]
    ShaderOrPipelineBuildFailure(String),

    /// A caller passed an unusable argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A handle whose resource was destroyed
    #[error("Stale {kind} handle")]
    StaleHandle {
        /// Resource kind
        kind: &'static str,
    },

    /// Operation not legal in the current state
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Why
        reason: String,
    },

    /// A wait did not finish in time
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// Device or instance setup failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Scene graph error
    #[error(transparent)]
    Scene(#[from] SceneError),

    /// Vulkan result code without a dedicated variant
    #[cfg(feature = "vulkan")]
    #[error("Vulkan API error: {0:?}")]
    Api(ash::vk::Result),
}

impl RenderError {
    /// Shorthand for [`RenderError::InvalidOperation`]
    pub fn invalid_operation(reason: impl Into<String>) -> Self {
        Self::InvalidOperation { reason: reason.into() }
    }

    /// Classify the error
    pub const fn severity(&self) -> ErrorSeverity {
        match self {
            Self::DeviceLost => ErrorSeverity::Session,
            Self::SurfaceOutOfDate | Self::SurfaceSuboptimal => ErrorSeverity::Recoverable,
            Self::ShaderOrPipelineBuildFailure(_) | Self::InitializationFailed(_) => ErrorSeverity::Startup,
            _ => ErrorSeverity::Operation,
        }
    }

    /// Whether the orchestrator should rebuild surface resources
    pub const fn is_surface_change(&self) -> bool {
        matches!(self.severity(), ErrorSeverity::Recoverable)
    }
}

/// Result type for render operations
pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classes() {
        assert_eq!(RenderError::DeviceLost.severity(), ErrorSeverity::Session);
        assert!(RenderError::SurfaceOutOfDate.is_surface_change());
        assert!(RenderError::SurfaceSuboptimal.is_surface_change());
        assert_eq!(
            RenderError::ShaderOrPipelineBuildFailure("bad spirv".into()).severity(),
            ErrorSeverity::Startup
        );
        assert_eq!(
            RenderError::ResourceExhausted("pools".into()).severity(),
            ErrorSeverity::Operation
        );
    }
}
