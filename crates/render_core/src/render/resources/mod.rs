//! Device-scoped GPU resources
//!
//! The [`ResourceArena`] owns buffers, images and samplers; the
//! [`BindingSetAllocator`] owns descriptor pools. Both are mutated only from
//! the thread driving the frame loop.

pub mod arena;
pub mod binding;
pub mod texture;
pub mod uniforms;

pub use arena::{
    find_memory_type, select_depth_format, BufferHandle, GpuBuffer, GpuImage, ImageHandle, ResourceArena,
    ResourceHandle, SamplerHandle,
};
pub use binding::{BindingSetAllocator, BindingSetHandle, DEFAULT_POOL_CAPACITY};
pub use texture::{mip_levels, texture_sampler_desc, ImageData, TEXTURE_FORMAT};
pub use uniforms::{CameraUniform, LightUniform, MaterialFactors, PushConstants, SceneInfo};
