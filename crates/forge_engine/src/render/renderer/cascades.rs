//! Cascaded shadow map fitting
//!
//! Splits the `[near, shadow_distance]` range into four cascades with a
//! practical split scheme blending uniform and logarithmic distributions,
//! fits a bounding sphere to each camera-frustum slice, and builds a
//! texel-snapped orthographic projection per cascade so shadow edges don't
//! shimmer as the camera moves.

use crate::foundation::math::{look_at, ortho, perspective, Mat4, Vec2, Vec3, Vec4};

/// Number of shadow cascades.
pub const CASCADE_COUNT: usize = 4;

/// The global directional light. Duplicated in the shading shaders.
pub const LIGHT_DIRECTION: Vec3 = Vec3::new(0.6, 0.6, -0.6);

/// Cascade fitting parameters.
#[derive(Debug, Clone, Copy)]
pub struct CascadeParams {
    /// Camera near plane
    pub near: f32,
    /// Far end of the shadowed range
    pub shadow_distance: f32,
    /// Blend between uniform (0) and logarithmic (1) splits
    pub split_lambda: f32,
    /// Shadow map resolution in texels
    pub resolution: u32,
}

/// Per-frame cascade outputs, uploaded to the frame UBO.
#[derive(Debug, Clone, Copy)]
pub struct CascadeInfo {
    /// Light-space view-projection per cascade
    pub matrices: [Mat4; CASCADE_COUNT],
    /// View-space distance at which each cascade ends
    pub split_depths: [f32; CASCADE_COUNT],
}

fn split_distances(params: &CascadeParams) -> [f32; CASCADE_COUNT] {
    let clip_range = params.shadow_distance - params.near;
    let mut distances = [0.0f32; CASCADE_COUNT];
    for (i, distance) in distances.iter_mut().enumerate() {
        let p = (i + 1) as f32 / CASCADE_COUNT as f32;
        let log = params.near * ((params.near + clip_range) / params.near).powf(p);
        let uniform = params.near + clip_range * p;
        let d = params.split_lambda * (log - uniform) + uniform;
        *distance = (d - params.near) / clip_range;
    }
    distances
}

/// Computes the cascade matrices and split depths for a camera view.
pub fn update_cascades(params: &CascadeParams, view: &Mat4, aspect_ratio: f32) -> CascadeInfo {
    let clip_range = params.shadow_distance - params.near;
    let distances = split_distances(params);

    let camera_proj = perspective(
        aspect_ratio,
        std::f32::consts::FRAC_PI_2,
        params.near,
        params.shadow_distance,
    );
    let inv_camera = (camera_proj * view)
        .try_inverse()
        .unwrap_or_else(Mat4::identity);

    let mut matrices = [Mat4::identity(); CASCADE_COUNT];
    let mut split_depths = [0.0f32; CASCADE_COUNT];
    let mut last_split_distance = 0.0f32;
    for i in 0..CASCADE_COUNT {
        // Canonical clip-space cube corners; depth is reversed, so the near
        // plane sits at z = 1.
        let mut corners = [
            Vec3::new(-1.0, 1.0, 1.0),
            Vec3::new(1.0, 1.0, 1.0),
            Vec3::new(1.0, -1.0, 1.0),
            Vec3::new(-1.0, -1.0, 1.0),
            Vec3::new(-1.0, 1.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(-1.0, -1.0, 0.0),
        ];

        // Project the corners into world space.
        for corner in &mut corners {
            let inv_corner = inv_camera * Vec4::new(corner.x, corner.y, corner.z, 1.0);
            *corner = inv_corner.xyz() / inv_corner.w;
        }

        // Shrink the full frustum down to this cascade's slice.
        for j in 0..4 {
            let dist = corners[j + 4] - corners[j];
            corners[j + 4] = corners[j] + dist * distances[i];
            corners[j] += dist * last_split_distance;
        }

        let mut center = Vec3::zeros();
        for corner in &corners {
            center += corner;
        }
        center /= 8.0;

        let mut radius = 0.0f32;
        for corner in &corners {
            radius = radius.max((corner - center).magnitude());
        }
        // Quantise the radius so the ortho extents don't jitter frame to
        // frame.
        radius = (radius * 16.0).ceil() / 16.0;

        let up = Vec3::y();
        let mut proj = ortho(-radius, radius, -radius, radius, 0.0, radius * 2.0);
        let light_view = look_at(center + LIGHT_DIRECTION * radius, center, up);

        // Snap the projection origin to a shadow-map texel to avoid
        // shimmering around shadow edges.
        let half_resolution = params.resolution as f32 / 2.0;
        let origin = (proj * light_view * Vec4::new(0.0, 0.0, 0.0, 1.0)) * half_resolution;
        let rounded_origin = Vec2::new(origin.x.round(), origin.y.round());
        let round_offset = (rounded_origin - origin.xy()) / half_resolution;
        proj[(0, 3)] += round_offset.x;
        proj[(1, 3)] += round_offset.y;

        matrices[i] = proj * light_view;
        split_depths[i] = params.near + distances[i] * clip_range;
        last_split_distance = distances[i];
    }

    CascadeInfo {
        matrices,
        split_depths,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::look_at;
    use approx::assert_relative_eq;

    fn test_params() -> CascadeParams {
        CascadeParams {
            near: 0.1,
            shadow_distance: 2000.0,
            split_lambda: 0.85,
            resolution: 2048,
        }
    }

    #[test]
    fn split_depths_match_practical_scheme() {
        let params = test_params();
        let range = params.shadow_distance - params.near;
        let distances = split_distances(&params);
        for (i, &normalised) in distances.iter().enumerate() {
            let p = (i + 1) as f32 / 4.0;
            let log = 0.1f32 * (2000.0f32 / 0.1).powf(p);
            let uniform = 0.1 + range * p;
            let expected = (0.85 * (log - uniform) + uniform - 0.1) / range;
            assert_relative_eq!(normalised, expected, epsilon = 1e-5);
        }
        // Splits increase and the final one covers the whole range.
        assert!(distances.windows(2).all(|pair| pair[0] < pair[1]));
        assert_relative_eq!(distances[3], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn final_split_reaches_shadow_distance() {
        let params = test_params();
        let view = look_at(Vec3::new(0.0, 5.0, 0.0), Vec3::new(1.0, 5.0, 0.0), Vec3::y());
        let info = update_cascades(&params, &view, 16.0 / 9.0);
        assert_relative_eq!(info.split_depths[3], 2000.0, epsilon = 1e-2);
        assert!(info
            .split_depths
            .windows(2)
            .all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn cascade_origin_is_texel_snapped() {
        let params = test_params();
        let view = look_at(
            Vec3::new(3.713, 1.219, -7.4),
            Vec3::new(4.4, 1.0, -6.0),
            Vec3::y(),
        );
        let info = update_cascades(&params, &view, 1.5);
        let half_resolution = params.resolution as f32 / 2.0;
        for matrix in &info.matrices {
            let origin = matrix * Vec4::new(0.0, 0.0, 0.0, 1.0);
            let x = origin.x * half_resolution;
            let y = origin.y * half_resolution;
            // World origin lands on an exact texel boundary after snapping.
            assert_relative_eq!(x, x.round(), epsilon = 1e-2);
            assert_relative_eq!(y, y.round(), epsilon = 1e-2);
        }
    }

    #[test]
    fn cascades_cover_the_camera_position() {
        let params = test_params();
        let eye = Vec3::new(10.0, 2.0, 30.0);
        let view = look_at(eye, eye + Vec3::new(0.0, 0.0, -1.0), Vec3::y());
        let info = update_cascades(&params, &view, 16.0 / 9.0);
        // A point just in front of the camera projects inside cascade 0.
        let point = eye + Vec3::new(0.0, 0.0, -1.0);
        let projected = info.matrices[0] * Vec4::new(point.x, point.y, point.z, 1.0);
        let ndc = projected.xyz() / projected.w;
        assert!(ndc.x.abs() <= 1.0 && ndc.y.abs() <= 1.0);
        assert!((0.0..=1.0).contains(&ndc.z));
    }
}
