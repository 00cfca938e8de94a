//! Perspective camera attachment

use crate::foundation::math::{perspective_vk, translation_of, Mat4};
use crate::render::resources::CameraUniform;

/// Perspective camera; its pose comes from the node it is attached to
///
/// The camera looks down its local -Z axis with +Y up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    /// Vertical field of view in radians
    pub fov_y: f32,
    /// Near plane distance
    pub near: f32,
    /// Far plane distance
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            fov_y: 45f32.to_radians(),
            near: 0.1,
            far: 100.0,
        }
    }
}

impl Camera {
    /// Camera with the given projection parameters
    pub const fn new(fov_y: f32, near: f32, far: f32) -> Self {
        Self { fov_y, near, far }
    }

    /// Projection for a surface aspect ratio
    pub fn projection(&self, aspect: f32) -> Mat4 {
        perspective_vk(self.fov_y, aspect, self.near, self.far)
    }

    /// Uniform for a camera placed at `world`
    ///
    /// A singular world matrix yields an identity view.
    pub fn uniform(&self, world: &Mat4, aspect: f32) -> CameraUniform {
        let view = world.try_inverse().unwrap_or_else(Mat4::identity);
        CameraUniform::new(&view, &self.projection(aspect), translation_of(world))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;
    use approx::assert_relative_eq;

    #[test]
    fn test_view_is_inverse_of_world() {
        let world = Mat4::new_translation(&Vec3::new(0.0, 2.0, 5.0));
        let uniform = Camera::default().uniform(&world, 16.0 / 9.0);

        let view = Mat4::from_column_slice(bytemuck::cast_slice(&uniform.view));
        assert_relative_eq!(view * world, Mat4::identity(), epsilon = 1e-5);
        assert_eq!(uniform.view_position, [0.0, 2.0, 5.0, 1.0]);
    }

    #[test]
    fn test_projection_uses_vulkan_clip_space() {
        let projection = Camera::new(std::f32::consts::FRAC_PI_2, 1.0, 10.0).projection(1.0);
        assert!(projection.m22 < 0.0);
        let near = projection * nalgebra::Vector4::new(0.0, 0.0, -1.0, 1.0);
        assert_relative_eq!(near.z / near.w, 0.0, epsilon = 1e-5);
    }
}
