//! Math types for transforms and camera projection
//!
//! Thin aliases over `nalgebra` plus the few helpers the render core needs
//! to turn scene transforms into shader-ready column-major arrays.

pub use nalgebra::{Matrix3, Matrix4, Quaternion, Unit, UnitQuaternion, Vector2, Vector3, Vector4};

/// 2D vector type
pub type Vec2 = Vector2<f32>;

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// Quaternion type for rotations
pub type Quat = UnitQuaternion<f32>;

/// Transform representing position, rotation, and scale
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    /// Position in 3D space
    pub position: Vec3,

    /// Rotation quaternion
    pub rotation: Quat,

    /// Scale factors
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::zeros(),
            rotation: Quat::identity(),
            scale: Vec3::new(1.0, 1.0, 1.0),
        }
    }
}

impl Transform {
    /// Create a new identity transform
    #[must_use]
    pub fn identity() -> Self {
        Self::default()
    }

    /// Create a transform with only position
    #[must_use]
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Create a transform with position and rotation
    #[must_use]
    pub fn from_position_rotation(position: Vec3, rotation: Quat) -> Self {
        Self {
            position,
            rotation,
            ..Default::default()
        }
    }

    /// Set a uniform scale
    #[must_use]
    pub fn with_uniform_scale(mut self, scale: f32) -> Self {
        self.scale = Vec3::new(scale, scale, scale);
        self
    }

    /// Convert to a transformation matrix (T * R * S)
    #[must_use]
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::new_translation(&self.position)
            * self.rotation.to_homogeneous()
            * Mat4::new_nonuniform_scaling(&self.scale)
    }
}

/// Right-handed perspective projection for Vulkan clip space
///
/// Y points down in clip space and depth maps to `0..1`.
#[must_use]
pub fn perspective_vk(fov_y_radians: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    let f = 1.0 / (fov_y_radians * 0.5).tan();
    let range = near - far;
    Mat4::new(
        f / aspect, 0.0, 0.0, 0.0,
        0.0, -f, 0.0, 0.0,
        0.0, 0.0, far / range, near * far / range,
        0.0, 0.0, -1.0, 0.0,
    )
}

/// Column-major array layout expected by std140 `mat4`
#[must_use]
pub fn to_cols_array(matrix: &Mat4) -> [[f32; 4]; 4] {
    let mut out = [[0.0; 4]; 4];
    for (column, dst) in matrix.column_iter().zip(out.iter_mut()) {
        for (value, slot) in column.iter().zip(dst.iter_mut()) {
            *slot = *value;
        }
    }
    out
}

/// Translation part of an affine matrix
#[must_use]
pub fn translation_of(matrix: &Mat4) -> Vec3 {
    Vec3::new(matrix.m14, matrix.m24, matrix.m34)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_transform_order_is_translate_rotate_scale() {
        let transform = Transform::from_position_rotation(
            Vec3::new(1.0, 2.0, 3.0),
            Quat::from_axis_angle(&Vec3::z_axis(), std::f32::consts::FRAC_PI_2),
        )
        .with_uniform_scale(2.0);

        let point = transform.to_matrix().transform_point(&nalgebra::Point3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(point.x, 1.0, epsilon = 1e-5);
        assert_relative_eq!(point.y, 4.0, epsilon = 1e-5);
        assert_relative_eq!(point.z, 3.0, epsilon = 1e-5);
    }

    #[test]
    fn test_perspective_maps_near_and_far_to_unit_depth() {
        let proj = perspective_vk(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);

        let near = proj * Vec4::new(0.0, 0.0, -0.1, 1.0);
        let far = proj * Vec4::new(0.0, 0.0, -100.0, 1.0);
        assert_relative_eq!(near.z / near.w, 0.0, epsilon = 1e-5);
        assert_relative_eq!(far.z / far.w, 1.0, epsilon = 1e-5);

        let up = proj * Vec4::new(0.0, 1.0, -1.0, 1.0);
        assert!(up.y / up.w < 0.0);
    }

    #[test]
    fn test_cols_array_is_column_major() {
        let m = Mat4::new_translation(&Vec3::new(5.0, 6.0, 7.0));
        let cols = to_cols_array(&m);
        assert_eq!(cols[3], [5.0, 6.0, 7.0, 1.0]);
        assert_eq!(cols[0], [1.0, 0.0, 0.0, 0.0]);
    }
}
