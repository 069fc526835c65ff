//! Pipeline construction
//!
//! A single builder covers both graphics and compute: a lone compute shader
//! produces a compute pipeline, anything else a dynamic-rendering graphics
//! pipeline (no render pass objects, attachment formats declared inline).
//! Viewport and scissor are always dynamic.

use std::sync::Arc;

use ash::vk;

use super::context::{Context, VulkanError, VulkanResult};
use super::shader::Shader;

struct PipelineInner {
    device: ash::Device,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// A compiled pipeline with its layout.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    /// The raw pipeline handle.
    pub fn handle(&self) -> vk::Pipeline {
        self.inner.pipeline
    }

    /// The pipeline layout.
    pub fn layout(&self) -> vk::PipelineLayout {
        self.inner.layout
    }

    /// Graphics or compute bind point.
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.inner.bind_point
    }
}

/// Builder for graphics and compute pipelines.
pub struct PipelineBuilder<'a> {
    colour_formats: Vec<vk::Format>,
    depth_format: Option<vk::Format>,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    shaders: Vec<&'a Shader>,
    cull_mode: vk::CullModeFlags,
    front_face: vk::FrontFace,
    depth_bias: Option<(f32, f32)>,
    depth_params: Option<(vk::CompareOp, bool, bool)>,
    push_constant_range: Option<vk::PushConstantRange>,
    topology: vk::PrimitiveTopology,
    spec_constants: Vec<(u32, u32)>,
}

impl Default for PipelineBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> PipelineBuilder<'a> {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self {
            colour_formats: Vec::new(),
            depth_format: None,
            set_layouts: Vec::new(),
            shaders: Vec::new(),
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_bias: None,
            depth_params: None,
            push_constant_range: None,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            spec_constants: Vec::new(),
        }
    }

    /// Appends a colour attachment format.
    pub fn add_colour_attachment(mut self, format: vk::Format) -> Self {
        self.colour_formats.push(format);
        self
    }

    /// Appends a descriptor set layout (set index = call order).
    pub fn add_set_layout(mut self, layout: vk::DescriptorSetLayout) -> Self {
        self.set_layouts.push(layout);
        self
    }

    /// Appends a shader stage.
    pub fn add_shader(mut self, shader: &'a Shader) -> Self {
        self.shaders.push(shader);
        self
    }

    /// Sets back/front-face culling.
    pub fn set_cull_mode(mut self, cull_mode: vk::CullModeFlags, front_face: vk::FrontFace) -> Self {
        self.cull_mode = cull_mode;
        self.front_face = front_face;
        self
    }

    /// Enables depth bias with the given constant and slope factors.
    pub fn set_depth_bias(mut self, constant: f32, slope: f32) -> Self {
        self.depth_bias = Some((constant, slope));
        self
    }

    /// Sets the depth attachment format.
    pub fn set_depth_format(mut self, format: vk::Format) -> Self {
        self.depth_format = Some(format);
        self
    }

    /// Sets the depth compare op and test/write enables.
    pub fn set_depth_params(mut self, compare_op: vk::CompareOp, test: bool, write: bool) -> Self {
        self.depth_params = Some((compare_op, test, write));
        self
    }

    /// Declares a push constant range starting at offset 0.
    pub fn set_push_constant_range(mut self, stages: vk::ShaderStageFlags, size: u32) -> Self {
        self.push_constant_range = Some(vk::PushConstantRange {
            stage_flags: stages,
            offset: 0,
            size,
        });
        self
    }

    /// Sets the primitive topology.
    pub fn set_topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    /// Sets a 32-bit specialisation constant on every stage.
    pub fn set_constant(mut self, constant_id: u32, value: u32) -> Self {
        self.spec_constants.push((constant_id, value));
        self
    }

    fn create_layout(&self, context: &Context) -> VulkanResult<vk::PipelineLayout> {
        let mut layout_ci = vk::PipelineLayoutCreateInfo::builder().set_layouts(&self.set_layouts);
        let ranges;
        if let Some(range) = self.push_constant_range {
            ranges = [range];
            layout_ci = layout_ci.push_constant_ranges(&ranges);
        }
        Ok(unsafe { context.device().create_pipeline_layout(&layout_ci, None) }?)
    }

    /// Builds the pipeline.
    pub fn build(self, context: &Context) -> VulkanResult<Pipeline> {
        if self.shaders.is_empty() {
            return Err(VulkanError::InvalidOperation(
                "pipeline built with no shaders".to_owned(),
            ));
        }

        let layout = self.create_layout(context)?;
        let device = context.device().clone();

        let spec_entries: Vec<vk::SpecializationMapEntry> = self
            .spec_constants
            .iter()
            .enumerate()
            .map(|(index, &(constant_id, _))| vk::SpecializationMapEntry {
                constant_id,
                offset: (index * 4) as u32,
                size: 4,
            })
            .collect();
        let spec_data: Vec<u8> = self
            .spec_constants
            .iter()
            .flat_map(|&(_, value)| value.to_le_bytes())
            .collect();
        let spec_info = vk::SpecializationInfo::builder()
            .map_entries(&spec_entries)
            .data(&spec_data)
            .build();

        let stages: Vec<vk::PipelineShaderStageCreateInfo> = self
            .shaders
            .iter()
            .map(|shader| {
                let mut stage = vk::PipelineShaderStageCreateInfo::builder()
                    .stage(shader.stage())
                    .module(shader.module())
                    .name(shader.entry_point());
                if !self.spec_constants.is_empty() {
                    stage = stage.specialization_info(&spec_info);
                }
                stage.build()
            })
            .collect();

        let is_compute =
            self.shaders.len() == 1 && self.shaders[0].stage() == vk::ShaderStageFlags::COMPUTE;
        if is_compute {
            let pipeline_ci = vk::ComputePipelineCreateInfo::builder()
                .stage(stages[0])
                .layout(layout);
            let pipeline = unsafe {
                device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_ci.build()], None)
            }
            .map_err(|(_, result)| {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                VulkanError::Api(result)
            })?[0];
            return Ok(Pipeline {
                inner: Arc::new(PipelineInner {
                    device,
                    pipeline,
                    layout,
                    bind_point: vk::PipelineBindPoint::COMPUTE,
                }),
            });
        }

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder();
        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::builder().topology(self.topology);
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let mut rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(self.cull_mode)
            .front_face(self.front_face)
            .line_width(1.0);
        if let Some((constant, slope)) = self.depth_bias {
            rasterization = rasterization
                .depth_bias_enable(true)
                .depth_bias_constant_factor(constant)
                .depth_bias_slope_factor(slope);
        }

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let (compare_op, depth_test, depth_write) =
            self.depth_params.unwrap_or((vk::CompareOp::ALWAYS, false, false));
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(depth_test)
            .depth_write_enable(depth_write)
            .depth_compare_op(compare_op);

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = self
            .colour_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::builder()
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
                    .build()
            })
            .collect();
        let colour_blend =
            vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(&self.colour_formats)
            .depth_attachment_format(self.depth_format.unwrap_or(vk::Format::UNDEFINED));

        let pipeline_ci = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&colour_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);
        let pipeline = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_ci.build()], None)
        }
        .map_err(|(_, result)| {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            VulkanError::Api(result)
        })?[0];

        Ok(Pipeline {
            inner: Arc::new(PipelineInner {
                device,
                pipeline,
                layout,
                bind_point: vk::PipelineBindPoint::GRAPHICS,
            }),
        })
    }
}
