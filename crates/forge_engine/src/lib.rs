//! # Forge Engine
//!
//! A Vulkan 1.3 rendering engine core built around four subsystems:
//!
//! - **Device memory allocator**: a TLSF suballocator over large driver
//!   memory pools ([`render::vulkan::Allocator`])
//! - **Render graph**: a frame-scoped pass DAG that schedules GPU work and
//!   synthesises synchronisation from declared accesses
//!   ([`render::vulkan::RenderGraph`])
//! - **GPU-driven renderer**: two-phase occlusion culling with a depth
//!   pyramid, indirect multi-draw, cascaded shadows and tiled deferred
//!   shading ([`render::renderer::DefaultRenderer`])
//! - **Shader compiler**: a source-language to SPIR-V compiler with a
//!   two-stack precedence parser ([`shaderc`])
//!
//! Windowing, input, the ECS and the asset packaging tool are external
//! collaborators; the engine consumes their contracts through the thin
//! types in [`assets`] and [`render::scene`].

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod assets;
pub mod core;
pub mod foundation;
pub mod render;
pub mod shaderc;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        assets::{DirectoryPack, Pack},
        core::config::EngineConfig,
        foundation::math::{Mat4, Vec2, Vec3, Vec4},
        render::renderer::DefaultRenderer,
        render::scene::{Camera, Scene, SceneObject},
        render::vulkan::{Context, ContextError, RenderGraph},
    };
}
