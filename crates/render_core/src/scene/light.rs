//! Light attachment

use crate::foundation::math::{translation_of, Mat4, Vec3, Vec4};
use crate::render::resources::LightUniform;

/// Light placed and aimed by its node; it shines down the local -Z axis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Light {
    /// Linear RGB color, intensity folded in
    pub color: Vec3,
}

impl Light {
    /// Light of the given color
    pub const fn new(color: Vec3) -> Self {
        Self { color }
    }

    /// Uniform for a light placed at `world`
    pub fn uniform(&self, world: &Mat4) -> LightUniform {
        let direction = (world * Vec4::new(0.0, 0.0, -1.0, 0.0)).xyz();
        LightUniform::new(self.color, translation_of(world), direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Quat;
    use approx::assert_relative_eq;

    #[test]
    fn test_direction_follows_node_rotation() {
        let rotation = Quat::from_axis_angle(&Vec3::y_axis(), std::f32::consts::FRAC_PI_2);
        let world = Mat4::new_translation(&Vec3::new(1.0, 2.0, 3.0)) * rotation.to_homogeneous();
        let uniform = Light::new(Vec3::new(1.0, 1.0, 1.0)).uniform(&world);

        assert_eq!(uniform.position, [1.0, 2.0, 3.0, 0.0]);
        assert_relative_eq!(uniform.direction[0], -1.0, epsilon = 1e-5);
        assert_relative_eq!(uniform.direction[2], 0.0, epsilon = 1e-5);
    }
}
