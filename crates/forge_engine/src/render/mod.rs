//! Rendering
//!
//! [`vulkan`] is the device layer; [`renderer`] drives per-frame render
//! graph construction for the GPU-driven deferred pipeline; [`scene`] is the
//! thin contract with the scene/ECS layer above the core.

pub mod renderer;
pub mod scene;
pub mod texture_streamer;
pub mod vulkan;
