//! Core engine settings

pub mod config;

pub use config::{RendererConfig, SurfaceConfig};
