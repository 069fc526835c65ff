//! Scene contract
//!
//! The ECS and scene graph live outside the core; the renderer consumes a
//! flat view of renderable objects plus a camera. Object transforms are
//! world-space; bounding spheres are in object space and scaled by the
//! transform on the GPU.

use crate::foundation::math::{frustum_planes, perspective, Mat4, Vec3, Vec4};

/// A bounding sphere for culling.
#[derive(Debug, Clone, Copy)]
pub struct BoundingSphere {
    /// Sphere centre in object space
    pub center: Vec3,
    /// Sphere radius
    pub radius: f32,
}

/// Material slot names resolved through the texture streamer.
#[derive(Debug, Clone)]
pub struct Material {
    /// Albedo texture pack name
    pub albedo_name: String,
    /// Normal map pack name
    pub normal_name: String,
}

/// A point light.
#[derive(Debug, Clone, Copy)]
pub struct PointLight {
    /// Position in world space
    pub position: Vec3,
    /// Influence radius
    pub radius: f32,
    /// Linear-space colour
    pub colour: Vec3,
}

/// One renderable object as produced by the scene layer.
#[derive(Debug, Clone)]
pub struct SceneObject {
    /// World transform
    pub transform: Mat4,
    /// Name of the vertex-data blob; also keys the mesh info table
    pub mesh_name: String,
    /// Optional material; fallback textures are used when absent
    pub material: Option<Material>,
    /// Optional bounding sphere; objects without one are never culled
    pub bounding_sphere: Option<BoundingSphere>,
}

/// The renderer's input for one frame.
#[derive(Debug, Default)]
pub struct Scene {
    /// Renderable objects
    pub objects: Vec<SceneObject>,
    /// Point lights
    pub lights: Vec<PointLight>,
}

/// A perspective camera.
#[derive(Debug, Clone)]
pub struct Camera {
    /// Position in world space
    pub position: Vec3,
    /// Unit view direction
    pub forward: Vec3,
    /// Up vector
    pub up: Vec3,
    /// Vertical field of view in radians
    pub fov_y: f32,
    /// Near plane distance
    pub near: f32,
    /// Far plane distance
    pub far: f32,
}

impl Camera {
    /// The reversed-Z projection matrix for the given aspect ratio.
    pub fn projection_matrix(&self, aspect_ratio: f32) -> Mat4 {
        perspective(aspect_ratio, self.fov_y, self.near, self.far)
    }

    /// The view matrix.
    pub fn view_matrix(&self) -> Mat4 {
        crate::foundation::math::look_at(self.position, self.position + self.forward, self.up)
    }

    /// The four side frustum planes of this camera's projection-view.
    pub fn frustum_planes(&self, aspect_ratio: f32) -> [Vec4; 4] {
        frustum_planes(&(self.projection_matrix(aspect_ratio) * self.view_matrix()))
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::zeros(),
            forward: -Vec3::z(),
            up: Vec3::y(),
            fov_y: std::f32::consts::FRAC_PI_2,
            near: 0.1,
            far: 2000.0,
        }
    }
}
