//! std140 uniform layouts shared with the shaders
//!
//! Every struct here is copied byte for byte into a uniform buffer or push
//! constant range, so field order and padding must match the GLSL side.

use bytemuck::{Pod, Zeroable};

use crate::foundation::math::{to_cols_array, Mat4, Vec3, Vec4};

/// Scene-wide values at binding 0 of the scene set
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SceneInfo {
    /// Ambient light color
    pub ambient: [f32; 4],
    /// Number of valid entries in the camera array
    pub camera_count: u32,
    /// Number of valid entries in the light array
    pub light_count: u32,
    _pad: [u32; 2],
}

impl SceneInfo {
    /// Create scene info for the given counts
    pub fn new(ambient: Vec4, camera_count: u32, light_count: u32) -> Self {
        Self {
            ambient: ambient.into(),
            camera_count,
            light_count,
            _pad: [0; 2],
        }
    }
}

/// One entry of the camera array at binding 1
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraUniform {
    /// World to view
    pub view: [[f32; 4]; 4],
    /// View to clip
    pub projection: [[f32; 4]; 4],
    /// Camera position in world space (w = 1)
    pub view_position: [f32; 4],
}

impl CameraUniform {
    /// Pack camera matrices
    pub fn new(view: &Mat4, projection: &Mat4, position: Vec3) -> Self {
        Self {
            view: to_cols_array(view),
            projection: to_cols_array(projection),
            view_position: [position.x, position.y, position.z, 1.0],
        }
    }
}

/// One entry of the light array at binding 2
///
/// Each `vec3` occupies a full 16-byte slot under std140.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightUniform {
    /// Light color (w unused)
    pub color: [f32; 4],
    /// World position (w unused)
    pub position: [f32; 4],
    /// World direction (w unused)
    pub direction: [f32; 4],
}

impl LightUniform {
    /// Pack light values
    pub fn new(color: Vec3, position: Vec3, direction: Vec3) -> Self {
        Self {
            color: [color.x, color.y, color.z, 0.0],
            position: [position.x, position.y, position.z, 0.0],
            direction: [direction.x, direction.y, direction.z, 0.0],
        }
    }
}

/// Per-draw push constants
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PushConstants {
    /// Model matrix (column-major)
    pub model: [[f32; 4]; 4],
}

impl PushConstants {
    /// Push data for a world matrix
    pub fn from_model(model: &Mat4) -> Self {
        Self {
            model: to_cols_array(model),
        }
    }
}

/// Factors block at binding 0 of PBR material sets
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialFactors {
    /// Base color multiplier
    pub base_color: [f32; 4],
    /// Metallic, roughness, occlusion strength, unused
    pub metallic_roughness: [f32; 4],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_std140_sizes() {
        assert_eq!(std::mem::size_of::<SceneInfo>(), 32);
        assert_eq!(std::mem::size_of::<CameraUniform>(), 144);
        assert_eq!(std::mem::size_of::<LightUniform>(), 48);
        assert_eq!(std::mem::size_of::<PushConstants>(), 64);
        assert_eq!(std::mem::size_of::<MaterialFactors>(), 32);
    }

    #[test]
    fn test_scene_info_field_offsets() {
        let info = SceneInfo::new(Vec4::new(0.2, 0.2, 0.2, 1.0), 2, 3);
        let bytes = bytemuck::bytes_of(&info);
        assert_eq!(&bytes[16..20], &2u32.to_ne_bytes());
        assert_eq!(&bytes[20..24], &3u32.to_ne_bytes());
        assert_eq!(&bytes[24..32], &[0u8; 8]);
    }

    #[test]
    fn test_light_vec3s_are_padded() {
        let light = LightUniform::new(Vec3::new(1.0, 0.5, 0.25), Vec3::new(4.0, 5.0, 6.0), Vec3::new(0.0, 0.0, -1.0));
        let floats: &[f32] = bytemuck::cast_slice(bytemuck::bytes_of(&light));
        assert_eq!(&floats[4..7], &[4.0, 5.0, 6.0]);
        assert_eq!(&floats[8..11], &[0.0, 0.0, -1.0]);
    }
}
