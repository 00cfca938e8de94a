//! # Renderer Configuration
//!
//! Settings for the frame orchestrator and the device-scoped allocators.
//! Every field has a default, so a config file only needs the values it
//! overrides.

use serde::{Deserialize, Serialize};

use crate::config::{Config, ConfigError};
use crate::render::api::PresentMode;
use crate::render::pipeline::ShadingModel;

/// Presentation surface request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    /// Initial surface width in pixels
    pub width: u32,
    /// Initial surface height in pixels
    pub height: u32,
    /// Preferred present mode; falls back to FIFO when unsupported
    pub present_mode: PresentMode,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            present_mode: PresentMode::Mailbox,
        }
    }
}

/// # Renderer Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Application name for instance creation
    pub application_name: String,
    /// Application version (major, minor, patch)
    pub application_version: (u32, u32, u32),
    /// Number of frame slots in flight
    pub frames_in_flight: usize,
    /// Binding sets per descriptor pool
    pub binding_pool_capacity: u32,
    /// Upper bound on pools per binding layout (`None` grows without limit)
    pub max_binding_pools_per_layout: Option<u32>,
    /// Directory holding compiled SPIR-V shaders
    pub shader_dir: String,
    /// Forward pass clear color
    pub clear_color: [f32; 4],
    /// Lighting model of the forward pass
    pub shading_model: ShadingModel,
    /// Timeout for a single frame fence wait, in milliseconds
    pub fence_timeout_ms: u64,
    /// Whether to enable API validation layers (`None` = debug builds only)
    pub enable_validation: Option<bool>,
    /// Presentation surface request
    pub surface: SurfaceConfig,
}

impl RendererConfig {
    /// Create a new renderer configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            application_version: (1, 0, 0),
            frames_in_flight: 2,
            binding_pool_capacity: 50,
            max_binding_pools_per_layout: None,
            shader_dir: "target/shaders".to_string(),
            clear_color: [0.1, 0.1, 0.1, 1.0],
            shading_model: ShadingModel::DefaultLit,
            fence_timeout_ms: 5_000,
            enable_validation: None,
            surface: SurfaceConfig::default(),
        }
    }

    /// Set application version
    #[must_use]
    pub fn with_version(mut self, major: u32, minor: u32, patch: u32) -> Self {
        self.application_version = (major, minor, patch);
        self
    }

    /// Set number of frames in flight
    #[must_use]
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set binding sets per pool
    #[must_use]
    pub fn with_binding_pool_capacity(mut self, capacity: u32) -> Self {
        self.binding_pool_capacity = capacity;
        self
    }

    /// Limit how many pools a single layout may grow to
    #[must_use]
    pub fn with_max_binding_pools(mut self, pools: u32) -> Self {
        self.max_binding_pools_per_layout = Some(pools);
        self
    }

    /// Set shader directory
    #[must_use]
    pub fn with_shader_dir(mut self, dir: impl Into<String>) -> Self {
        self.shader_dir = dir.into();
        self
    }

    /// Set the forward shading model
    #[must_use]
    pub fn with_shading_model(mut self, model: ShadingModel) -> Self {
        self.shading_model = model;
        self
    }

    /// Set initial surface extent
    #[must_use]
    pub fn with_surface_extent(mut self, width: u32, height: u32) -> Self {
        self.surface.width = width;
        self.surface.height = height;
        self
    }

    /// Set preferred present mode
    #[must_use]
    pub fn with_present_mode(mut self, mode: PresentMode) -> Self {
        self.surface.present_mode = mode;
        self
    }

    /// Enable or disable validation layers
    #[must_use]
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Whether validation should be active for this build
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Fence timeout in nanoseconds
    pub fn fence_timeout_ns(&self) -> u64 {
        self.fence_timeout_ms.saturating_mul(1_000_000)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.is_empty() {
            return Err(ConfigError::Invalid("application name cannot be empty".to_string()));
        }

        if self.frames_in_flight == 0 {
            return Err(ConfigError::Invalid("frames in flight must be at least 1".to_string()));
        }

        if self.frames_in_flight > 8 {
            return Err(ConfigError::Invalid("frames in flight should not exceed 8".to_string()));
        }

        if self.binding_pool_capacity == 0 {
            return Err(ConfigError::Invalid("binding pool capacity must be at least 1".to_string()));
        }

        if self.max_binding_pools_per_layout == Some(0) {
            return Err(ConfigError::Invalid("binding pool limit must be at least 1".to_string()));
        }

        if self.surface.width == 0 || self.surface.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "surface extent {}x{} has a zero dimension",
                self.surface.width, self.surface.height
            )));
        }

        Ok(())
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new("Render Core Application")
    }
}

impl Config for RendererConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.binding_pool_capacity, 50);
        assert_eq!(config.clear_color, [0.1, 0.1, 0.1, 1.0]);
    }

    #[test]
    fn test_validation_rejects_bad_frame_counts() {
        assert!(RendererConfig::default().with_frames_in_flight(0).validate().is_err());
        assert!(RendererConfig::default().with_frames_in_flight(9).validate().is_err());
        assert!(RendererConfig::default().with_frames_in_flight(3).validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = r#"
            application_name = "orbit"
            frames_in_flight = 3
            shading_model = "Pbr"

            [surface]
            width = 1920
            height = 1080
            present_mode = "Fifo"
        "#;
        let config: RendererConfig = toml::from_str(text).unwrap();
        assert_eq!(config.application_name, "orbit");
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.surface.width, 1920);
        assert_eq!(config.surface.present_mode, PresentMode::Fifo);
        assert_eq!(config.binding_pool_capacity, 50);
        assert_eq!(config.shading_model, ShadingModel::Pbr);
    }

    #[test]
    fn test_ron_file_round_trip() {
        let path = std::env::temp_dir().join(format!("render_core_config_{}.ron", std::process::id()));
        let config = RendererConfig::new("ron test").with_binding_pool_capacity(8);
        config.save_to_file(&path).unwrap();

        let loaded = RendererConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let err = RendererConfig::load_from_file("settings.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_) | ConfigError::UnsupportedFormat(_)));
    }
}
