//! Vulkan rendering backend
//!
//! Low-level device layer: context and feature gating, the TLSF device
//! memory allocator, resource wrappers, descriptor management, pipelines and
//! the frame render graph.

pub mod allocator;
pub mod commands;
pub mod context;
pub mod descriptor;
pub mod memory;
pub mod pipeline;
pub mod query;
pub mod render_graph;
pub mod resource;
pub mod sampler;
pub mod shader;

pub use allocator::{Allocation, Allocator};
pub use commands::{CommandBuffer, Queue};
pub use context::{Context, ContextError, MemoryUsage, VulkanError, VulkanResult};
pub use descriptor::{BindlessPool, DescriptorPool, DescriptorWriter, SetLayoutBuilder};
pub use memory::{BlockRange, MemoryPool};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use query::TimestampPool;
pub use render_graph::{
    BufferDescription, PassBuilder, PassKind, ReadFlags, RenderGraph, ResourceId, WriteFlags,
};
pub use resource::{Buffer, Image, ImageDescription};
pub use sampler::{SamplerKind, Samplers};
pub use shader::Shader;
