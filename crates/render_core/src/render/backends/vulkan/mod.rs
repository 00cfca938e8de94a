//! Vulkan backend
//!
//! Instance and device setup, swapchain negotiation, and translation of the
//! recorded command stream into `vkCmd*` calls.

#![allow(unsafe_code)]

mod backend;
mod context;
mod conversion;
mod swapchain;

pub use backend::VulkanBackend;
pub use context::{LogicalDevice, PhysicalDeviceInfo, VulkanInstance};
