//! Backend implementations for the render core
//!
//! `headless` is always available and backs the test suite. `vulkan` drives a
//! real device and is enabled by the default `vulkan` feature.

/// Software device with validation, used by tests and the demo
pub mod headless;

/// Vulkan backend
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use headless::{stub_spirv, HeadlessBackend, HeadlessConfig, HeadlessStats, TraceEntry};

#[cfg(feature = "vulkan")]
pub use vulkan::VulkanBackend;
