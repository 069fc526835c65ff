//! Tiled deferred shading
//!
//! Three passes over the G-buffer: a 32x32-tile light cull building per-tile
//! light lists, a compute shading pass writing the HDR image, and a
//! fullscreen-triangle tonemap blit into the frame's target.

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::assets::Pack;
use crate::foundation::math::ceil_div;
use crate::render::scene::PointLight;
use crate::render::vulkan::{
    BufferDescription, Context, DescriptorPool, DescriptorWriter, ImageDescription, PassKind,
    Pipeline, PipelineBuilder, ReadFlags, RenderGraph, ResourceId, SamplerKind, SetLayoutBuilder,
    Shader, VulkanResult, WriteFlags,
};

pub(crate) const TILE_SIZE: u32 = 32;
pub(crate) const TILE_MAX_LIGHT_COUNT: u32 = 256;

/// The geometry pass attachments consumed by deferred shading.
#[derive(Debug, Clone, Copy)]
pub struct GBuffer {
    /// RGBA8 albedo
    pub albedo: ResourceId,
    /// RG16 octahedral-encoded normals
    pub normal: ResourceId,
    /// Reversed-Z depth
    pub depth: ResourceId,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct GpuPointLight {
    position: [f32; 3],
    radius: f32,
    colour: [f32; 3],
    padding: f32,
}

/// Owns the deferred-path pipelines and drives their passes.
pub struct DeferredRenderer {
    context: Arc<Context>,
    viewport_extent: vk::Extent2D,
    tile_extent: vk::Extent2D,
    set_layout: vk::DescriptorSetLayout,
    descriptor_pool: DescriptorPool,
    light_cull_pipeline: Pipeline,
    deferred_pipeline: Pipeline,
    blit_tonemap_pipeline: Pipeline,
}

impl DeferredRenderer {
    /// Creates the deferred stage for a fixed viewport and target format.
    pub fn new(
        context: Arc<Context>,
        pack: &dyn Pack,
        viewport_extent: vk::Extent2D,
        target_format: vk::Format,
    ) -> VulkanResult<Self> {
        let tile_extent = vk::Extent2D {
            width: ceil_div(viewport_extent.width, TILE_SIZE),
            height: ceil_div(viewport_extent.height, TILE_SIZE),
        };

        let set_layout = SetLayoutBuilder::new()
            // Frame UBO.
            .binding(
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::COMPUTE | vk::ShaderStageFlags::FRAGMENT,
            )
            // Light buffer.
            .binding(1, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::COMPUTE)
            // Light visibility buffer.
            .binding(2, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::COMPUTE)
            // Albedo image.
            .binding(3, vk::DescriptorType::SAMPLED_IMAGE, vk::ShaderStageFlags::COMPUTE)
            // Normal image.
            .binding(4, vk::DescriptorType::SAMPLED_IMAGE, vk::ShaderStageFlags::COMPUTE)
            // Depth image.
            .binding(5, vk::DescriptorType::SAMPLED_IMAGE, vk::ShaderStageFlags::COMPUTE)
            // HDR image.
            .binding(6, vk::DescriptorType::STORAGE_IMAGE, vk::ShaderStageFlags::COMPUTE)
            // HDR image (sampled by the tonemap blit).
            .binding(
                7,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            )
            // Shadow map with compare sampler.
            .binding(
                8,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::COMPUTE,
            )
            .build(context.device())?;

        let descriptor_pool = DescriptorPool::new(
            context.device().clone(),
            4,
            &[
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: 4,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_BUFFER,
                    descriptor_count: 8,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLED_IMAGE,
                    descriptor_count: 12,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_IMAGE,
                    descriptor_count: 4,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: 8,
                },
            ],
        )?;

        let light_cull_shader = Shader::load(&context, pack, "shaders/light_cull.comp.spv")?;
        let light_cull_pipeline = PipelineBuilder::new()
            .add_set_layout(set_layout)
            .add_shader(&light_cull_shader)
            .set_constant(0, viewport_extent.width)
            .set_constant(1, viewport_extent.height)
            .set_constant(2, TILE_SIZE)
            .set_constant(3, TILE_MAX_LIGHT_COUNT)
            .build(&context)?;

        let deferred_shader = Shader::load(&context, pack, "shaders/deferred.comp.spv")?;
        let deferred_pipeline = PipelineBuilder::new()
            .add_set_layout(set_layout)
            .add_shader(&deferred_shader)
            .set_constant(0, viewport_extent.width)
            .set_constant(1, viewport_extent.height)
            .set_constant(2, TILE_SIZE)
            .set_constant(3, tile_extent.width)
            .build(&context)?;

        let triangle_shader = Shader::load(&context, pack, "shaders/fst.vert.spv")?;
        let blit_tonemap_shader = Shader::load(&context, pack, "shaders/blit_tonemap.frag.spv")?;
        let blit_tonemap_pipeline = PipelineBuilder::new()
            .add_colour_attachment(target_format)
            .add_set_layout(set_layout)
            .add_shader(&triangle_shader)
            .add_shader(&blit_tonemap_shader)
            .set_topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .build(&context)?;

        Ok(Self {
            context,
            viewport_extent,
            tile_extent,
            set_layout,
            descriptor_pool,
            light_cull_pipeline,
            deferred_pipeline,
            blit_tonemap_pipeline,
        })
    }

    /// Declares the G-buffer attachments on a fresh frame graph.
    pub fn create_gbuffer(&self, graph: &mut RenderGraph) -> GBuffer {
        let extent = self.viewport_extent;
        let albedo = ImageDescription::new(
            extent,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
        );
        let normal = ImageDescription::new(
            extent,
            vk::Format::R16G16_SNORM,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
        );
        let depth = ImageDescription::new(
            extent,
            vk::Format::D32_SFLOAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
        );
        GBuffer {
            albedo: graph.new_attachment("gbuffer-albedo", albedo),
            normal: graph.new_attachment("gbuffer-normal", normal),
            depth: graph.new_attachment("gbuffer-depth", depth),
        }
    }

    /// Frees the descriptor sets of the previous (retired) frame.
    pub fn begin_frame(&self) -> VulkanResult<()> {
        self.descriptor_pool.reset()
    }

    /// Adds the light-cull, shading and tonemap passes, consuming the
    /// G-buffer and writing `target`.
    pub fn build_pass(
        &self,
        graph: &mut RenderGraph,
        gbuffer: &GBuffer,
        frame_ubo: ResourceId,
        shadow_map: ResourceId,
        lights: &[PointLight],
        target: &mut ResourceId,
    ) -> VulkanResult<()> {
        let set = self.descriptor_pool.allocate(self.set_layout)?;

        let gpu_lights: Vec<GpuPointLight> = lights
            .iter()
            .map(|light| GpuPointLight {
                position: light.position.into(),
                radius: light.radius,
                colour: light.colour.into(),
                padding: 0.0,
            })
            .collect();

        let mut light_buffer_id = graph.new_buffer(
            "light-buffer",
            BufferDescription {
                // Count header padded to 16 bytes, then the light array.
                size: 16 + std::mem::size_of_val(gpu_lights.as_slice()) as vk::DeviceSize,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                host_accessible: true,
            },
        );
        let mut visibility_buffer_id = graph.new_buffer(
            "light-visibility",
            BufferDescription {
                size: vk::DeviceSize::from(
                    (1 + TILE_MAX_LIGHT_COUNT)
                        * 4
                        * self.tile_extent.width
                        * self.tile_extent.height,
                ),
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                host_accessible: false,
            },
        );

        let mut hdr_image_id = graph.new_attachment(
            "hdr-image",
            ImageDescription::new(
                self.viewport_extent,
                vk::Format::R16G16B16A16_SFLOAT,
                vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
            ),
        );

        let mut gbuffer_depth = gbuffer.depth;
        let mut frame_ubo_read = frame_ubo;
        {
            let context = self.context.clone();
            let pipeline = self.light_cull_pipeline.clone();
            let tile_extent = self.tile_extent;
            let gbuffer = *gbuffer;
            let shadow_sampler = self.context.samplers().get(SamplerKind::Shadow);
            let nearest_sampler = self.context.samplers().get(SamplerKind::Nearest);
            let light_buffer_id_captured = light_buffer_id;
            let visibility_id_captured = visibility_buffer_id;
            let hdr_captured = hdr_image_id;
            graph
                .add_pass("light-cull", PassKind::Compute)
                .read(&mut gbuffer_depth, ReadFlags::SAMPLED)
                .read(&mut frame_ubo_read, ReadFlags::empty())
                .write(&mut light_buffer_id, WriteFlags::empty())
                .write(&mut visibility_buffer_id, WriteFlags::empty())
                .on_record(move |graph, cmd_buf| {
                    let light_buffer = graph.get_buffer(light_buffer_id_captured)?;
                    let light_count = [gpu_lights.len() as u32];
                    light_buffer.write_data(&light_count, 0)?;
                    light_buffer.write_data(gpu_lights.as_slice(), 16)?;

                    // The set cannot be updated once this pass's bind is
                    // recorded, so every binding of the deferred chain is
                    // written up front.
                    let writer = DescriptorWriter::new(context.device(), set);
                    writer
                        .uniform_buffer(0, &graph.get_buffer(frame_ubo)?)
                        .storage_buffer(1, &light_buffer)
                        .storage_buffer(2, &graph.get_buffer(visibility_id_captured)?)
                        .sampled_image(
                            3,
                            graph.get_image(gbuffer.albedo)?.full_view(),
                            vk::ImageLayout::READ_ONLY_OPTIMAL,
                        )
                        .sampled_image(
                            4,
                            graph.get_image(gbuffer.normal)?.full_view(),
                            vk::ImageLayout::READ_ONLY_OPTIMAL,
                        )
                        .sampled_image(
                            5,
                            graph.get_image(gbuffer.depth)?.full_view(),
                            vk::ImageLayout::READ_ONLY_OPTIMAL,
                        )
                        .storage_image(6, graph.get_image(hdr_captured)?.full_view())
                        .combined_image_sampler(
                            7,
                            graph.get_image(hdr_captured)?.full_view(),
                            nearest_sampler,
                            vk::ImageLayout::READ_ONLY_OPTIMAL,
                        )
                        .combined_image_sampler(
                            8,
                            graph.get_image(shadow_map)?.full_view(),
                            shadow_sampler,
                            vk::ImageLayout::READ_ONLY_OPTIMAL,
                        );

                    cmd_buf.bind_pipeline(&pipeline);
                    cmd_buf.bind_descriptor_sets(&pipeline, 0, &[set]);
                    cmd_buf.dispatch(tile_extent.width, tile_extent.height, 1);
                    Ok(())
                });
        }

        {
            let pipeline = self.deferred_pipeline.clone();
            let extent = self.viewport_extent;
            let mut albedo = gbuffer.albedo;
            let mut normal = gbuffer.normal;
            let mut depth = gbuffer_depth;
            let mut visibility = visibility_buffer_id;
            let mut shadow_read = shadow_map;
            graph
                .add_pass("deferred", PassKind::Compute)
                .read(&mut albedo, ReadFlags::SAMPLED)
                .read(&mut normal, ReadFlags::SAMPLED)
                .read(&mut depth, ReadFlags::SAMPLED)
                .read(&mut visibility, ReadFlags::empty())
                .read(&mut shadow_read, ReadFlags::SAMPLED)
                .write(&mut hdr_image_id, WriteFlags::empty())
                .on_record(move |_graph, cmd_buf| {
                    cmd_buf.bind_pipeline(&pipeline);
                    cmd_buf.bind_descriptor_sets(&pipeline, 0, &[set]);
                    cmd_buf.dispatch(ceil_div(extent.width, 8), ceil_div(extent.height, 8), 1);
                    Ok(())
                });
        }

        {
            let pipeline = self.blit_tonemap_pipeline.clone();
            let mut hdr_read = hdr_image_id;
            graph
                .add_pass("blit-tonemap", PassKind::Graphics)
                .read(&mut hdr_read, ReadFlags::SAMPLED)
                .write(target, WriteFlags::empty())
                .on_record(move |_graph, cmd_buf| {
                    cmd_buf.bind_pipeline(&pipeline);
                    cmd_buf.bind_descriptor_sets(&pipeline, 0, &[set]);
                    cmd_buf.draw(3, 1);
                    Ok(())
                });
        }
        Ok(())
    }
}

impl Drop for DeferredRenderer {
    fn drop(&mut self) {
        unsafe {
            self.context
                .device()
                .destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}
