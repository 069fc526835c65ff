//! Math utilities and types
//!
//! Provides fundamental math types for 3D rendering, plus the projection and
//! frustum helpers used by the renderer. View space is right-handed Y-up;
//! projections target Vulkan clip space (Y-down NDC, depth in `[0, 1]`).
//! Perspective projections are reversed-Z: depth 1 at the near plane and 0
//! at the far plane, matching the `GreaterOrEqual` depth test and the
//! min-reduction depth pyramid.

pub use nalgebra::{Matrix3, Matrix4, Quaternion, Unit, Vector2, Vector3, Vector4};

/// 2D vector type
pub type Vec2 = Vector2<f32>;

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 3x3 matrix type
pub type Mat3 = Matrix3<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// 3D point type
pub type Point3 = nalgebra::Point3<f32>;

/// Quaternion type for rotations
pub type Quat = Unit<Quaternion<f32>>;

/// Integer division rounding towards positive infinity.
pub const fn ceil_div(value: u32, divisor: u32) -> u32 {
    (value + divisor - 1) / divisor
}

/// Largest power of two less than or equal to `value`.
///
/// Used to size the depth pyramid, which rounds the viewport *down* so that
/// every texel of a mip maps onto an exact 2x2 quad of its parent.
pub const fn previous_power_of_two(value: u32) -> u32 {
    1 << value.ilog2()
}

/// Reversed-Z perspective projection for Vulkan clip space.
///
/// Maps the near plane to depth 1 and the far plane to depth 0 and flips Y
/// for Vulkan's Y-down NDC.
pub fn perspective(aspect_ratio: f32, fov_y: f32, near: f32, far: f32) -> Mat4 {
    let focal = 1.0 / (fov_y * 0.5).tan();
    let mut proj = Mat4::zeros();
    proj[(0, 0)] = focal / aspect_ratio;
    proj[(1, 1)] = -focal;
    proj[(2, 2)] = near / (far - near);
    proj[(2, 3)] = (far * near) / (far - near);
    proj[(3, 2)] = -1.0;
    proj
}

/// Orthographic projection for Vulkan clip space with depth in `[0, 1]`.
pub fn ortho(left: f32, right: f32, bottom: f32, top: f32, near: f32, far: f32) -> Mat4 {
    let mut proj = Mat4::identity();
    proj[(0, 0)] = 2.0 / (right - left);
    proj[(1, 1)] = -2.0 / (top - bottom);
    proj[(2, 2)] = 1.0 / (near - far);
    proj[(0, 3)] = -(right + left) / (right - left);
    proj[(1, 3)] = -(top + bottom) / (top - bottom);
    proj[(2, 3)] = near / (near - far);
    proj
}

/// Right-handed look-at view matrix.
pub fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Mat4 {
    Mat4::look_at_rh(&Point3::from(eye), &Point3::from(target), &up)
}

/// Extracts the four side planes (left, right, bottom, top) of a
/// projection-view matrix in `(normal, distance)` form, normalised so plane
/// distances are in world units.
pub fn frustum_planes(proj_view: &Mat4) -> [Vec4; 4] {
    let m = proj_view.transpose();
    let row = |i: usize| m.column(i).into_owned();
    let mut planes = [
        row(3) + row(0), // left
        row(3) - row(0), // right
        row(3) + row(1), // bottom
        row(3) - row(1), // top
    ];
    for plane in &mut planes {
        *plane /= plane.xyz().magnitude();
    }
    planes
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn ceil_div_rounds_up() {
        assert_eq!(ceil_div(0, 32), 0);
        assert_eq!(ceil_div(1, 32), 1);
        assert_eq!(ceil_div(32, 32), 1);
        assert_eq!(ceil_div(33, 32), 2);
    }

    #[test]
    fn previous_power_of_two_rounds_down() {
        assert_eq!(previous_power_of_two(1), 1);
        assert_eq!(previous_power_of_two(1920), 1024);
        assert_eq!(previous_power_of_two(2048), 2048);
    }

    #[test]
    fn reversed_perspective_depth_endpoints() {
        let proj = perspective(16.0 / 9.0, std::f32::consts::FRAC_PI_2, 0.1, 100.0);
        let near = proj * Vec4::new(0.0, 0.0, -0.1, 1.0);
        let far = proj * Vec4::new(0.0, 0.0, -100.0, 1.0);
        assert_relative_eq!(near.z / near.w, 1.0, epsilon = 1e-5);
        assert_relative_eq!(far.z / far.w, 0.0, epsilon = 1e-5);
    }

    #[test]
    fn frustum_planes_are_normalised() {
        let proj = perspective(1.0, std::f32::consts::FRAC_PI_2, 0.1, 100.0);
        let view = look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::zeros(), Vec3::y());
        for plane in frustum_planes(&(proj * view)) {
            assert_relative_eq!(plane.xyz().magnitude(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn origin_inside_centered_frustum() {
        let proj = perspective(1.0, std::f32::consts::FRAC_PI_2, 0.1, 100.0);
        let view = look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::zeros(), Vec3::y());
        let inside = Vec3::new(0.0, 0.0, -1.0);
        for plane in frustum_planes(&(proj * view)) {
            // Signed distance of an in-frustum point to every side plane.
            assert!(plane.xyz().dot(&inside) + plane.w > 0.0);
        }
    }
}
