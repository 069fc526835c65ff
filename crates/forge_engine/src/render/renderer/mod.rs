//! GPU-driven renderer
//!
//! Builds the frame's render graph: a transfer pass uploading the frame UBO
//! and object array, two-phase occlusion culling (early cull against last
//! frame's visibility, an early G-buffer draw, a min-depth pyramid
//! reduction, then a late cull testing bounding spheres against the pyramid
//! and an additive late draw), four shadow cascades, and the tiled deferred
//! shading chain in [`deferred`].
//!
//! Culling and draw-command generation run entirely on the GPU: the object
//! array is the single source of truth, the cull shaders append
//! `DrawIndexedIndirectCommand`s and the draws are `drawIndirectCount` calls.

pub mod cascades;
pub mod deferred;

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::assets::Pack;
use crate::core::config::EngineConfig;
use crate::foundation::math::{ceil_div, frustum_planes, previous_power_of_two, Mat4, Vec4};
use crate::render::scene::{Camera, Scene};
use crate::render::texture_streamer::{TextureKind, TextureStreamer};
use crate::render::vulkan::{
    Buffer, BufferDescription, Context, DescriptorPool, DescriptorWriter, Image, ImageDescription,
    MemoryUsage, PassKind, Pipeline, PipelineBuilder, ReadFlags, RenderGraph, ResourceId,
    SamplerKind, SetLayoutBuilder, Shader, VulkanResult, WriteFlags,
};

use cascades::{update_cascades, CascadeParams, CASCADE_COUNT};
pub use deferred::{DeferredRenderer, GBuffer};

// Minimum required maximum work group count times the cull work group size.
const OBJECT_LIMIT: u32 = 65535 * 32;
const CULL_WORKGROUP_SIZE: u32 = 32;
const REDUCE_WORKGROUP_SIZE: u32 = 32;

/// Bytes per packed vertex: half3 position, 10/10/10 snorm normal, 2x half UV.
pub const VERTEX_SIZE: u64 = 16;

/// The ground truth for culling and indirect draws, laid out exactly as the
/// cull and vertex shaders read it (scalar layout).
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct GpuObject {
    transform: [f32; 16],
    center: [f32; 3],
    radius: f32,
    albedo_index: u32,
    normal_index: u32,
    index_count: u32,
    first_index: u32,
    vertex_offset: u32,
}

/// `VkDrawIndexedIndirectCommand` extended with the object index the vertex
/// shader uses to fetch the object array.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct GpuDrawCmd {
    index_count: u32,
    instance_count: u32,
    first_index: u32,
    vertex_offset: i32,
    first_instance: u32,
    object_index: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct FrameUbo {
    proj: [f32; 16],
    inv_proj: [f32; 16],
    view: [f32; 16],
    proj_view: [f32; 16],
    inv_proj_view: [f32; 16],
    cull_view: [f32; 16],
    view_position: [f32; 3],
    object_count: u32,
    frustum_planes: [[f32; 4]; 4],
    cascade_matrices: [[f32; 16]; CASCADE_COUNT],
    cascade_split_depths: [f32; CASCADE_COUNT],
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct DepthReduceData {
    mip_size: [u32; 2],
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct ShadowPushConstants {
    cascade_index: u32,
}

/// Index/vertex placement of one unique mesh within the shared buffers.
#[derive(Debug, Clone, Copy)]
struct MeshInfo {
    index_count: u32,
    index_offset: u32,
    vertex_offset: i32,
}

fn mat(m: &Mat4) -> [f32; 16] {
    m.as_slice().try_into().unwrap()
}

fn plane(p: &Vec4) -> [f32; 4] {
    [p.x, p.y, p.z, p.w]
}

fn vertex_data_name(mesh_name: &str) -> String {
    format!("{mesh_name}/vertices")
}

fn index_data_name(mesh_name: &str) -> String {
    format!("{mesh_name}/indices")
}

/// Drives per-frame render-graph construction for a fixed viewport.
pub struct DefaultRenderer {
    context: Arc<Context>,
    pack: Arc<dyn Pack>,
    viewport_extent: vk::Extent2D,
    depth_pyramid_extent: vk::Extent2D,
    shadow_params: CascadeParams,

    texture_streamer: TextureStreamer,
    deferred: DeferredRenderer,

    main_set_layout: vk::DescriptorSetLayout,
    reduce_set_layout: vk::DescriptorSetLayout,
    descriptor_pool: DescriptorPool,

    gbuffer_pipeline: Pipeline,
    shadow_pipeline: Pipeline,
    depth_reduce_pipeline: Pipeline,
    early_cull_pipeline: Pipeline,
    late_cull_pipeline: Pipeline,

    // Persists across frames so the early phase can reuse last frame's
    // visibility verdicts.
    object_visibility_buffer: Buffer,
    shadow_map: Image,

    vertex_buffer: Option<Buffer>,
    index_buffer: Option<Buffer>,
    mesh_infos: HashMap<String, MeshInfo>,

    object_count: u32,
    cull_view_locked: bool,
    cull_view: Mat4,
    frustum_planes: [Vec4; 4],
}

impl DefaultRenderer {
    /// Creates the renderer's pipelines and persistent resources.
    pub fn new(
        context: Arc<Context>,
        pack: Arc<dyn Pack>,
        config: &EngineConfig,
        viewport_extent: vk::Extent2D,
        target_format: vk::Format,
    ) -> VulkanResult<Self> {
        // Round the viewport down to powers of two so every pyramid texel
        // covers an exact quad of its parent mip.
        let depth_pyramid_extent = vk::Extent2D {
            width: previous_power_of_two(viewport_extent.width),
            height: previous_power_of_two(viewport_extent.height),
        };

        let texture_streamer =
            TextureStreamer::new(context.clone(), pack.clone(), config.streaming.max_textures)?;
        let deferred =
            DeferredRenderer::new(context.clone(), pack.as_ref(), viewport_extent, target_format)?;

        let main_set_layout = SetLayoutBuilder::new()
            // Frame UBO.
            .binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::ALL)
            // Object buffer.
            .binding(
                1,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::COMPUTE,
            )
            // Object visibility bitset.
            .binding(2, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::COMPUTE)
            // Draw buffer.
            .binding(
                3,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::COMPUTE,
            )
            // Depth pyramid.
            .binding(
                4,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::COMPUTE,
            )
            // Vertex buffer.
            .binding(5, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::VERTEX)
            .build(context.device())?;
        let reduce_set_layout = SetLayoutBuilder::new()
            .binding(
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::COMPUTE,
            )
            .binding(1, vk::DescriptorType::STORAGE_IMAGE, vk::ShaderStageFlags::COMPUTE)
            .build(context.device())?;

        // One main set plus one reduce set per pyramid mip, per frame.
        let descriptor_pool = DescriptorPool::new(
            context.device().clone(),
            24,
            &[
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: 4,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_BUFFER,
                    descriptor_count: 16,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: 24,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_IMAGE,
                    descriptor_count: 24,
                },
            ],
        )?;

        let gbuffer_vert = Shader::load(&context, pack.as_ref(), "shaders/default.vert.spv")?;
        let gbuffer_frag = Shader::load(&context, pack.as_ref(), "shaders/default.frag.spv")?;
        let gbuffer_pipeline = PipelineBuilder::new()
            .add_colour_attachment(vk::Format::R8G8B8A8_UNORM)
            .add_colour_attachment(vk::Format::R16G16_SNORM)
            .add_set_layout(main_set_layout)
            .add_set_layout(texture_streamer.set_layout())
            .add_shader(&gbuffer_vert)
            .add_shader(&gbuffer_frag)
            .set_cull_mode(vk::CullModeFlags::BACK, vk::FrontFace::COUNTER_CLOCKWISE)
            .set_depth_format(vk::Format::D32_SFLOAT)
            .set_depth_params(vk::CompareOp::GREATER_OR_EQUAL, true, true)
            .set_topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .build(&context)?;

        let shadow_shader = Shader::load(&context, pack.as_ref(), "shaders/shadow.vert.spv")?;
        let shadow_pipeline = PipelineBuilder::new()
            .add_set_layout(main_set_layout)
            .add_shader(&shadow_shader)
            .set_cull_mode(vk::CullModeFlags::BACK, vk::FrontFace::COUNTER_CLOCKWISE)
            .set_depth_bias(2.0, 5.0)
            .set_depth_format(vk::Format::D32_SFLOAT)
            .set_depth_params(vk::CompareOp::LESS_OR_EQUAL, true, true)
            .set_push_constant_range(
                vk::ShaderStageFlags::VERTEX,
                std::mem::size_of::<ShadowPushConstants>() as u32,
            )
            .set_topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .build(&context)?;

        let depth_reduce_shader = Shader::load(&context, pack.as_ref(), "shaders/depth_reduce.comp.spv")?;
        let depth_reduce_pipeline = PipelineBuilder::new()
            .add_set_layout(reduce_set_layout)
            .add_shader(&depth_reduce_shader)
            .set_push_constant_range(
                vk::ShaderStageFlags::COMPUTE,
                std::mem::size_of::<DepthReduceData>() as u32,
            )
            .build(&context)?;

        let draw_cull_shader = Shader::load(&context, pack.as_ref(), "shaders/draw_cull.comp.spv")?;
        // Specialisation constant 0 is k_late: the late phase additionally
        // tests occlusion against the depth pyramid and updates the
        // persistent visibility bit.
        let early_cull_pipeline = PipelineBuilder::new()
            .add_set_layout(main_set_layout)
            .add_shader(&draw_cull_shader)
            .set_constant(0, 0)
            .build(&context)?;
        let late_cull_pipeline = PipelineBuilder::new()
            .add_set_layout(main_set_layout)
            .add_shader(&draw_cull_shader)
            .set_constant(0, 1)
            .build(&context)?;

        let object_visibility_buffer = context.create_buffer(
            vk::DeviceSize::from(OBJECT_LIMIT) * 4 / 32,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryUsage::DeviceOnly,
        )?;
        {
            let visibility = object_visibility_buffer.clone();
            let mut queue = context.transfer_queue();
            queue.immediate_submit(|cmd_buf| {
                cmd_buf.zero_buffer(&visibility, 0, vk::WHOLE_SIZE);
                Ok(())
            })?;
        }

        let shadow_map = context.create_image(
            &ImageDescription {
                extent: vk::Extent2D {
                    width: config.shadow.resolution,
                    height: config.shadow.resolution,
                },
                format: vk::Format::D32_SFLOAT,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                mip_levels: 1,
                array_layers: CASCADE_COUNT as u32,
            },
            MemoryUsage::DeviceOnly,
        )?;

        Ok(Self {
            context,
            pack,
            viewport_extent,
            depth_pyramid_extent,
            shadow_params: CascadeParams {
                near: 0.1,
                shadow_distance: config.shadow.distance,
                split_lambda: config.shadow.split_lambda,
                resolution: config.shadow.resolution,
            },
            texture_streamer,
            deferred,
            main_set_layout,
            reduce_set_layout,
            descriptor_pool,
            gbuffer_pipeline,
            shadow_pipeline,
            depth_reduce_pipeline,
            early_cull_pipeline,
            late_cull_pipeline,
            object_visibility_buffer,
            shadow_map,
            vertex_buffer: None,
            index_buffer: None,
            mesh_infos: HashMap::new(),
            object_count: 0,
            cull_view_locked: false,
            cull_view: Mat4::identity(),
            frustum_planes: [Vec4::zeros(); 4],
        })
    }

    /// Freezes the culling view at its current value, for inspecting what
    /// the occlusion phases actually culled.
    pub fn set_cull_view_locked(&mut self, locked: bool) {
        self.cull_view_locked = locked;
    }

    /// Number of objects submitted for the current frame, after the limit
    /// clamp.
    pub fn object_count(&self) -> u32 {
        self.object_count
    }

    /// Uploads the vertex and index data of every unique mesh in the scene
    /// into the shared buffers and records each mesh's placement.
    ///
    /// Meshes whose data is missing from the pack are skipped; objects using
    /// them are silently dropped at frame-build time.
    pub fn load_scene(&mut self, scene: &Scene) -> VulkanResult<()> {
        let mut seen = HashSet::new();
        let mut unique_names = Vec::new();
        for object in &scene.objects {
            if seen.insert(object.mesh_name.clone()) {
                unique_names.push(object.mesh_name.clone());
            }
        }

        let mut vertex_buffer_size = 0u64;
        let mut index_buffer_size = 0u64;
        self.mesh_infos.clear();
        for name in &unique_names {
            let Ok(vertex_entry) = self.pack.stat(&vertex_data_name(name)) else {
                log::debug!("[graphics] no vertex data for mesh {name}");
                continue;
            };
            let Ok(index_entry) = self.pack.stat(&index_data_name(name)) else {
                log::debug!("[graphics] no index data for mesh {name}");
                continue;
            };
            self.mesh_infos.insert(
                name.clone(),
                MeshInfo {
                    index_count: (index_entry.size / 4) as u32,
                    index_offset: (index_buffer_size / 4) as u32,
                    vertex_offset: (vertex_buffer_size / VERTEX_SIZE) as i32,
                },
            );
            vertex_buffer_size += vertex_entry.size;
            index_buffer_size += index_entry.size;
        }
        if vertex_buffer_size == 0 {
            self.vertex_buffer = None;
            self.index_buffer = None;
            return Ok(());
        }

        let vertex_buffer = self.context.create_buffer(
            vertex_buffer_size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryUsage::DeviceOnly,
        )?;
        let index_buffer = self.context.create_buffer(
            index_buffer_size,
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryUsage::DeviceOnly,
        )?;

        let mut vertex_offset = 0u64;
        let mut index_offset = 0u64;
        for name in &unique_names {
            if !self.mesh_infos.contains_key(name) {
                continue;
            }
            vertex_offset +=
                self.upload_blob(&vertex_data_name(name), &vertex_buffer, vertex_offset)?;
            index_offset += self.upload_blob(&index_data_name(name), &index_buffer, index_offset)?;
        }
        debug_assert_eq!(vertex_offset, vertex_buffer_size);
        debug_assert_eq!(index_offset, index_buffer_size);

        self.vertex_buffer = Some(vertex_buffer);
        self.index_buffer = Some(index_buffer);
        Ok(())
    }

    fn upload_blob(&self, name: &str, target: &Buffer, offset: u64) -> VulkanResult<u64> {
        let read = || -> Result<Vec<u8>, crate::assets::PackError> {
            let mut stream = self.pack.open(name)?;
            let mut bytes = Vec::new();
            stream.read_to_end(&mut bytes)?;
            Ok(bytes)
        };
        let bytes = read()
            .map_err(|error| super::vulkan::VulkanError::InvalidOperation(error.to_string()))?;

        let staging = self.context.create_buffer(
            bytes.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryUsage::HostOnly,
        )?;
        staging.write_data(bytes.as_slice(), 0)?;

        let mut queue = self.context.transfer_queue();
        queue.immediate_submit(|cmd_buf| {
            cmd_buf.copy_buffer(
                &staging,
                target,
                vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: offset,
                    size: bytes.len() as u64,
                },
            );
            Ok(())
        })?;
        Ok(bytes.len() as u64)
    }

    fn gather_objects(&mut self, scene: &Scene) -> Vec<GpuObject> {
        let mut objects = Vec::with_capacity(scene.objects.len());
        for object in &scene.objects {
            // Missing mesh info skips the object entirely.
            let Some(mesh_info) = self.mesh_infos.get(&object.mesh_name).copied() else {
                continue;
            };

            let (mut albedo_index, mut normal_index) = (0, 1);
            if let Some(material) = &object.material {
                albedo_index = self
                    .texture_streamer
                    .ensure_texture(&material.albedo_name, TextureKind::Albedo);
                normal_index = self
                    .texture_streamer
                    .ensure_texture(&material.normal_name, TextureKind::Normal);
            }

            // An object without a bounding sphere is treated as infinitely
            // large so it always survives culling.
            let (center, radius) = object
                .bounding_sphere
                .map_or(([0.0; 3], f32::MAX), |sphere| {
                    (sphere.center.into(), sphere.radius)
                });
            objects.push(GpuObject {
                transform: mat(&object.transform),
                center,
                radius,
                albedo_index,
                normal_index,
                index_count: mesh_info.index_count,
                first_index: mesh_info.index_offset,
                vertex_offset: mesh_info.vertex_offset as u32,
            });
        }
        // Cap the object count just in case.
        objects.truncate(OBJECT_LIMIT as usize);
        objects
    }

    fn build_frame_ubo(&mut self, camera: &Camera, object_count: u32) -> FrameUbo {
        let aspect_ratio = self.viewport_extent.width as f32 / self.viewport_extent.height as f32;
        let proj = camera.projection_matrix(aspect_ratio);
        let view = camera.view_matrix();
        let proj_view = proj * view;
        if !self.cull_view_locked {
            self.frustum_planes = frustum_planes(&proj_view);
            self.cull_view = view;
        }

        let cascade_info = update_cascades(&self.shadow_params, &view, aspect_ratio);
        let mut cascade_matrices = [[0.0f32; 16]; CASCADE_COUNT];
        for (out, matrix) in cascade_matrices.iter_mut().zip(cascade_info.matrices.iter()) {
            *out = mat(matrix);
        }

        FrameUbo {
            proj: mat(&proj),
            inv_proj: mat(&proj.try_inverse().unwrap_or_else(Mat4::identity)),
            view: mat(&view),
            proj_view: mat(&proj_view),
            inv_proj_view: mat(&proj_view.try_inverse().unwrap_or_else(Mat4::identity)),
            cull_view: mat(&self.cull_view),
            view_position: camera.position.into(),
            object_count,
            frustum_planes: [
                plane(&self.frustum_planes[0]),
                plane(&self.frustum_planes[1]),
                plane(&self.frustum_planes[2]),
                plane(&self.frustum_planes[3]),
            ],
            cascade_matrices,
            cascade_split_depths: cascade_info.split_depths,
        }
    }

    /// Assembles the whole frame: per-frame buffers, culling, G-buffer,
    /// depth pyramid, shadows and deferred shading, ending in a write to
    /// `target`.
    pub fn build_pass(
        &mut self,
        graph: &mut RenderGraph,
        scene: &Scene,
        camera: &Camera,
        target: &mut ResourceId,
    ) -> VulkanResult<()> {
        // The previous frame has retired by the time a new graph is built,
        // so last frame's descriptor sets can be recycled.
        self.descriptor_pool.reset()?;
        self.deferred.begin_frame()?;

        let gbuffer = self.deferred.create_gbuffer(graph);
        let objects = self.gather_objects(scene);
        self.object_count = objects.len() as u32;
        let object_count = self.object_count;
        let frame_ubo_data = self.build_frame_ubo(camera, object_count);

        let main_set = self.descriptor_pool.allocate(self.main_set_layout)?;
        let pyramid_level_count = self
            .depth_pyramid_extent
            .width
            .max(self.depth_pyramid_extent.height)
            .ilog2()
            + 1;
        let reduce_sets: Vec<vk::DescriptorSet> = (0..pyramid_level_count)
            .map(|_| self.descriptor_pool.allocate(self.reduce_set_layout))
            .collect::<VulkanResult<_>>()?;

        let mut frame_ubo_id = graph.new_buffer(
            "frame-ubo",
            BufferDescription {
                size: std::mem::size_of::<FrameUbo>() as u64,
                usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                host_accessible: true,
            },
        );
        let mut object_buffer_id = graph.new_buffer(
            "object-buffer",
            BufferDescription {
                size: (std::mem::size_of_val(objects.as_slice()) as u64).max(4),
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                host_accessible: true,
            },
        );
        let mut draw_buffer_id = graph.new_buffer(
            "draw-buffer",
            BufferDescription {
                size: 4 + u64::from(object_count) * std::mem::size_of::<GpuDrawCmd>() as u64,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::INDIRECT_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST,
                host_accessible: false,
            },
        );

        let depth_pyramid_description = ImageDescription {
            extent: self.depth_pyramid_extent,
            format: vk::Format::R16_SFLOAT,
            usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
            mip_levels: pyramid_level_count,
            array_layers: 1,
        };
        let mut depth_pyramid_id = graph.new_attachment("depth-pyramid", depth_pyramid_description);

        // Setup: upload the UBO and object array and write every binding of
        // the shared set. Descriptor sets cannot be updated once a recorded
        // pass has bound them, so even the draw buffer and depth pyramid are
        // materialised and written here.
        {
            let context = self.context.clone();
            let visibility = self.object_visibility_buffer.clone();
            let vertex_buffer = self.vertex_buffer.clone();
            let reduce_sampler = self.context.samplers().get(SamplerKind::DepthReduce);
            let frame_ubo_captured = frame_ubo_id;
            let object_buffer_captured = object_buffer_id;
            let draw_buffer_captured = draw_buffer_id;
            let pyramid_captured = depth_pyramid_id;
            graph
                .add_pass("setup-frame", PassKind::Transfer)
                .write(&mut frame_ubo_id, WriteFlags::empty())
                .write(&mut object_buffer_id, WriteFlags::empty())
                .on_record(move |graph, _cmd_buf| {
                    let frame_ubo = graph.get_buffer(frame_ubo_captured)?;
                    frame_ubo.write_data(&[frame_ubo_data], 0)?;

                    let object_buffer = graph.get_buffer(object_buffer_captured)?;
                    object_buffer.write_data(objects.as_slice(), 0)?;

                    let writer = DescriptorWriter::new(context.device(), main_set);
                    writer
                        .uniform_buffer(0, &frame_ubo)
                        .storage_buffer(1, &object_buffer)
                        .storage_buffer(2, &visibility)
                        .storage_buffer(3, &graph.get_buffer(draw_buffer_captured)?)
                        .combined_image_sampler(
                            4,
                            graph.get_image(pyramid_captured)?.full_view(),
                            reduce_sampler,
                            vk::ImageLayout::READ_ONLY_OPTIMAL,
                        );
                    // With no scene loaded nothing is drawn; point the vertex
                    // pull binding at the object buffer so the set stays
                    // complete.
                    writer.storage_buffer(5, vertex_buffer.as_ref().unwrap_or(&object_buffer));
                    Ok(())
                });
        }

        // Early cull: frustum-test every object that was visible last frame.
        {
            let pipeline = self.early_cull_pipeline.clone();
            let mut frame_ubo_read = frame_ubo_id;
            let draw_buffer_captured_pre = draw_buffer_id;
            graph
                .add_pass("early-cull", PassKind::Compute)
                .read(&mut frame_ubo_read, ReadFlags::empty())
                .write(&mut draw_buffer_id, WriteFlags::empty())
                .on_record(move |graph, cmd_buf| {
                    let draw_buffer = graph.get_buffer(draw_buffer_captured_pre)?;
                    cmd_buf.zero_buffer(&draw_buffer, 0, 4);
                    cmd_buf.buffer_barrier(
                        vk::BufferMemoryBarrier2::builder()
                            .src_stage_mask(vk::PipelineStageFlags2::CLEAR)
                            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                            .dst_stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)
                            .dst_access_mask(vk::AccessFlags2::SHADER_STORAGE_READ)
                            .buffer(draw_buffer.handle())
                            .size(4)
                            .build(),
                    );

                    cmd_buf.bind_pipeline(&pipeline);
                    cmd_buf.bind_descriptor_sets(&pipeline, 0, &[main_set]);
                    cmd_buf.dispatch(ceil_div(object_count, CULL_WORKGROUP_SIZE).max(1), 1, 1);
                    Ok(())
                });
        }

        // Early draw: G-buffer from the early survivors.
        let mut gbuffer_albedo = gbuffer.albedo;
        let mut gbuffer_normal = gbuffer.normal;
        let mut gbuffer_depth = gbuffer.depth;
        {
            let pipeline = self.gbuffer_pipeline.clone();
            let texture_set = self.texture_streamer.descriptor_set();
            let index_buffer = self.index_buffer.clone();
            let mut draw_buffer_read = draw_buffer_id;
            let draw_buffer_captured = draw_buffer_id;
            graph
                .add_pass("early-draw", PassKind::Graphics)
                .read(&mut draw_buffer_read, ReadFlags::INDIRECT)
                .write(&mut gbuffer_albedo, WriteFlags::empty())
                .write(&mut gbuffer_normal, WriteFlags::empty())
                .write(&mut gbuffer_depth, WriteFlags::empty())
                .on_record(move |graph, cmd_buf| {
                    let Some(index_buffer) = index_buffer else {
                        return Ok(());
                    };
                    let draw_buffer = graph.get_buffer(draw_buffer_captured)?;
                    cmd_buf.bind_pipeline(&pipeline);
                    cmd_buf.bind_descriptor_sets(&pipeline, 0, &[main_set, texture_set]);
                    cmd_buf.bind_index_buffer(&index_buffer, vk::IndexType::UINT32);
                    cmd_buf.draw_indexed_indirect_count(
                        &draw_buffer,
                        4,
                        &draw_buffer,
                        0,
                        object_count,
                        std::mem::size_of::<GpuDrawCmd>() as u32,
                    );
                    Ok(())
                });
        }

        // Depth pyramid: min-reduce the early depth into a power-of-two mip
        // chain for hierarchical occlusion tests.
        {
            let context = self.context.clone();
            let pipeline = self.depth_reduce_pipeline.clone();
            let reduce_sampler = self.context.samplers().get(SamplerKind::DepthReduce);
            let pyramid_extent = self.depth_pyramid_extent;
            let mut depth_read = gbuffer_depth;
            let pyramid_captured = depth_pyramid_id;
            let depth_captured = gbuffer_depth;
            graph
                .add_pass("depth-reduce", PassKind::Compute)
                .read(&mut depth_read, ReadFlags::SAMPLED)
                .write(&mut depth_pyramid_id, WriteFlags::empty())
                .on_record(move |graph, cmd_buf| {
                    let depth_image = graph.get_image(depth_captured)?;
                    let pyramid = graph.get_image(pyramid_captured)?;

                    for (level, &set) in reduce_sets.iter().enumerate() {
                        let writer = DescriptorWriter::new(context.device(), set);
                        let input_view = if level == 0 {
                            depth_image.full_view()
                        } else {
                            pyramid.level_view(level as u32 - 1)
                        };
                        writer
                            .combined_image_sampler(
                                0,
                                input_view,
                                reduce_sampler,
                                vk::ImageLayout::READ_ONLY_OPTIMAL,
                            )
                            .storage_image(1, pyramid.level_view(level as u32));
                    }

                    cmd_buf.bind_pipeline(&pipeline);
                    for (level, &set) in reduce_sets.iter().enumerate() {
                        let mip_size = [
                            (pyramid_extent.width >> level).max(1),
                            (pyramid_extent.height >> level).max(1),
                        ];
                        cmd_buf.bind_descriptor_sets(&pipeline, 0, &[set]);
                        cmd_buf.push_constants(
                            &pipeline,
                            vk::ShaderStageFlags::COMPUTE,
                            &DepthReduceData { mip_size },
                        );
                        cmd_buf.dispatch(
                            ceil_div(mip_size[0], REDUCE_WORKGROUP_SIZE),
                            ceil_div(mip_size[1], REDUCE_WORKGROUP_SIZE),
                            1,
                        );

                        // Flip the just-written mip to a sampleable layout so
                        // the next iteration can reduce from it.
                        cmd_buf.image_barrier(
                            vk::ImageMemoryBarrier2::builder()
                                .src_stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)
                                .src_access_mask(vk::AccessFlags2::SHADER_STORAGE_WRITE)
                                .dst_stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)
                                .dst_access_mask(vk::AccessFlags2::SHADER_SAMPLED_READ)
                                .old_layout(vk::ImageLayout::GENERAL)
                                .new_layout(vk::ImageLayout::READ_ONLY_OPTIMAL)
                                .image(pyramid.handle())
                                .subresource_range(vk::ImageSubresourceRange {
                                    aspect_mask: vk::ImageAspectFlags::COLOR,
                                    base_mip_level: level as u32,
                                    level_count: 1,
                                    base_array_layer: 0,
                                    layer_count: 1,
                                })
                                .build(),
                        );
                    }

                    // The per-mip transitions happened behind the graph's
                    // back; restore the layout it believes the image is in.
                    cmd_buf.image_barrier(
                        vk::ImageMemoryBarrier2::builder()
                            .src_stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)
                            .src_access_mask(vk::AccessFlags2::SHADER_STORAGE_WRITE)
                            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                            .dst_access_mask(vk::AccessFlags2::SHADER_SAMPLED_READ)
                            .old_layout(vk::ImageLayout::READ_ONLY_OPTIMAL)
                            .new_layout(vk::ImageLayout::GENERAL)
                            .image(pyramid.handle())
                            .subresource_range(pyramid.range())
                            .build(),
                    );
                    Ok(())
                });
        }

        // Late cull: re-test every object against the frustum and the depth
        // pyramid; newly visible objects are appended and the persistent
        // visibility bit updated.
        {
            let pipeline = self.late_cull_pipeline.clone();
            let mut pyramid_read = depth_pyramid_id;
            let draw_buffer_captured = draw_buffer_id;
            graph
                .add_pass("late-cull", PassKind::Compute)
                .read(&mut pyramid_read, ReadFlags::empty())
                .write(&mut draw_buffer_id, WriteFlags::empty())
                .on_record(move |graph, cmd_buf| {
                    let draw_buffer = graph.get_buffer(draw_buffer_captured)?;
                    // The early draw still sources commands from this buffer.
                    cmd_buf.buffer_barrier(
                        vk::BufferMemoryBarrier2::builder()
                            .src_stage_mask(vk::PipelineStageFlags2::DRAW_INDIRECT)
                            .src_access_mask(vk::AccessFlags2::INDIRECT_COMMAND_READ)
                            .dst_stage_mask(vk::PipelineStageFlags2::CLEAR)
                            .dst_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                            .buffer(draw_buffer.handle())
                            .size(vk::WHOLE_SIZE)
                            .build(),
                    );
                    cmd_buf.zero_buffer(&draw_buffer, 0, 4);
                    cmd_buf.buffer_barrier(
                        vk::BufferMemoryBarrier2::builder()
                            .src_stage_mask(vk::PipelineStageFlags2::CLEAR)
                            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                            .dst_stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)
                            .dst_access_mask(vk::AccessFlags2::SHADER_STORAGE_READ)
                            .buffer(draw_buffer.handle())
                            .size(4)
                            .build(),
                    );

                    cmd_buf.bind_pipeline(&pipeline);
                    cmd_buf.bind_descriptor_sets(&pipeline, 0, &[main_set]);
                    cmd_buf.dispatch(ceil_div(object_count, CULL_WORKGROUP_SIZE).max(1), 1, 1);
                    Ok(())
                });
        }

        // Late draw: additive so the early draw's results are kept.
        {
            let pipeline = self.gbuffer_pipeline.clone();
            let texture_set = self.texture_streamer.descriptor_set();
            let index_buffer = self.index_buffer.clone();
            let mut draw_buffer_read = draw_buffer_id;
            let draw_buffer_captured = draw_buffer_id;
            graph
                .add_pass("late-draw", PassKind::Graphics)
                .read(&mut draw_buffer_read, ReadFlags::INDIRECT)
                .write(&mut gbuffer_albedo, WriteFlags::ADDITIVE)
                .write(&mut gbuffer_normal, WriteFlags::ADDITIVE)
                .write(&mut gbuffer_depth, WriteFlags::ADDITIVE)
                .on_record(move |graph, cmd_buf| {
                    let Some(index_buffer) = index_buffer else {
                        return Ok(());
                    };
                    let draw_buffer = graph.get_buffer(draw_buffer_captured)?;
                    cmd_buf.bind_pipeline(&pipeline);
                    cmd_buf.bind_descriptor_sets(&pipeline, 0, &[main_set, texture_set]);
                    cmd_buf.bind_index_buffer(&index_buffer, vk::IndexType::UINT32);
                    cmd_buf.draw_indexed_indirect_count(
                        &draw_buffer,
                        4,
                        &draw_buffer,
                        0,
                        object_count,
                        std::mem::size_of::<GpuDrawCmd>() as u32,
                    );
                    Ok(())
                });
        }

        // Shadow cascades: one rendering per layer of the shadow map.
        let mut shadow_map_id = graph.import_image("shadow-map", self.shadow_map.clone());
        {
            let pipeline = self.shadow_pipeline.clone();
            let index_buffer = self.index_buffer.clone();
            let resolution = self.shadow_params.resolution;
            let mut frame_ubo_read = frame_ubo_id;
            let mut draw_buffer_read = draw_buffer_id;
            let draw_buffer_captured = draw_buffer_id;
            let shadow_map_captured = shadow_map_id;
            graph
                .add_pass("shadow-cascades", PassKind::Graphics)
                .manual_rendering()
                .read(&mut frame_ubo_read, ReadFlags::empty())
                .read(&mut draw_buffer_read, ReadFlags::INDIRECT)
                .write(&mut shadow_map_id, WriteFlags::empty())
                .on_record(move |graph, cmd_buf| {
                    let Some(index_buffer) = index_buffer else {
                        return Ok(());
                    };
                    let shadow_map = graph.get_image(shadow_map_captured)?;
                    let draw_buffer = graph.get_buffer(draw_buffer_captured)?;
                    let extent = vk::Extent2D {
                        width: resolution,
                        height: resolution,
                    };

                    cmd_buf.bind_pipeline(&pipeline);
                    cmd_buf.bind_descriptor_sets(&pipeline, 0, &[main_set]);
                    cmd_buf.bind_index_buffer(&index_buffer, vk::IndexType::UINT32);
                    for cascade_index in 0..CASCADE_COUNT as u32 {
                        let depth_attachment = vk::RenderingAttachmentInfo::builder()
                            .image_view(shadow_map.layer_view(cascade_index))
                            .image_layout(vk::ImageLayout::ATTACHMENT_OPTIMAL)
                            .load_op(vk::AttachmentLoadOp::CLEAR)
                            .store_op(vk::AttachmentStoreOp::STORE)
                            .clear_value(vk::ClearValue {
                                depth_stencil: vk::ClearDepthStencilValue {
                                    depth: 1.0,
                                    stencil: 0,
                                },
                            });
                        let rendering_info = vk::RenderingInfo::builder()
                            .render_area(vk::Rect2D {
                                offset: vk::Offset2D::default(),
                                extent,
                            })
                            .layer_count(1)
                            .depth_attachment(&depth_attachment);
                        cmd_buf.begin_rendering(&rendering_info);
                        cmd_buf.set_viewport_scissor(extent);
                        cmd_buf.push_constants(
                            &pipeline,
                            vk::ShaderStageFlags::VERTEX,
                            &ShadowPushConstants { cascade_index },
                        );
                        cmd_buf.draw_indexed_indirect_count(
                            &draw_buffer,
                            4,
                            &draw_buffer,
                            0,
                            object_count,
                            std::mem::size_of::<GpuDrawCmd>() as u32,
                        );
                        cmd_buf.end_rendering();
                    }
                    Ok(())
                });
        }

        // Light culling, deferred shading and the tonemap blit.
        let lights = scene.lights.clone();
        self.deferred.build_pass(
            graph,
            &GBuffer {
                albedo: gbuffer_albedo,
                normal: gbuffer_normal,
                depth: gbuffer_depth,
            },
            frame_ubo_id,
            shadow_map_id,
            &lights,
            target,
        )
    }
}

impl Drop for DefaultRenderer {
    fn drop(&mut self) {
        unsafe {
            self.context
                .device()
                .destroy_descriptor_set_layout(self.main_set_layout, None);
            self.context
                .device()
                .destroy_descriptor_set_layout(self.reduce_set_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_structs_match_shader_layout() {
        // Object: mat4 + vec3 + float + five u32s, scalar layout, no
        // padding.
        assert_eq!(std::mem::size_of::<GpuObject>(), 64 + 12 + 4 + 5 * 4);
        // DrawCmd: VkDrawIndexedIndirectCommand (20 bytes) + object index.
        assert_eq!(std::mem::size_of::<GpuDrawCmd>(), 24);
        // Frame UBO: six mat4s, position + count, four planes, cascades.
        assert_eq!(
            std::mem::size_of::<FrameUbo>(),
            6 * 64 + 16 + 4 * 16 + 4 * 64 + 16
        );
    }

    #[test]
    fn object_limit_matches_dispatch_budget() {
        // ceil(limit / workgroup) must stay within the minimum guaranteed
        // work group count.
        assert_eq!(ceil_div(OBJECT_LIMIT, CULL_WORKGROUP_SIZE), 65535);
    }

    #[test]
    fn mesh_blob_names() {
        assert_eq!(vertex_data_name("rock"), "rock/vertices");
        assert_eq!(index_data_name("rock"), "rock/indices");
    }
}
