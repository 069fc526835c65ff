//! Default sampler set
//!
//! The engine uses a small fixed set of samplers rather than a cache: plain
//! nearest and linear samplers, a min-reduction sampler for building the
//! depth pyramid (requires `samplerFilterMinmax`), and a compare sampler for
//! shadow lookups.

use ash::vk;

/// Selects one of the default samplers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    /// Nearest-texel
    Nearest,
    /// Linear filtering
    Linear,
    /// Linear filtering with MIN reduction, for the hierarchical depth
    /// pyramid
    DepthReduce,
    /// Linear filtering with `LessOrEqual` compare, for shadow maps
    Shadow,
}

/// The default samplers, owned by the context.
pub struct Samplers {
    nearest: vk::Sampler,
    linear: vk::Sampler,
    depth_reduce: vk::Sampler,
    shadow: vk::Sampler,
}

impl Samplers {
    pub(crate) fn new(
        device: &ash::Device,
        max_anisotropy: Option<f32>,
    ) -> ash::prelude::VkResult<Self> {
        let nearest_ci = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(vk::LOD_CLAMP_NONE);
        let nearest = unsafe { device.create_sampler(&nearest_ci, None) }?;

        let mut linear_ci = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(vk::LOD_CLAMP_NONE);
        if let Some(max_anisotropy) = max_anisotropy {
            linear_ci = linear_ci.anisotropy_enable(true).max_anisotropy(max_anisotropy);
        }
        let linear = unsafe { device.create_sampler(&linear_ci, None) }?;

        let mut reduction_ci = vk::SamplerReductionModeCreateInfo::builder()
            .reduction_mode(vk::SamplerReductionMode::MIN);
        let depth_reduce_ci = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_lod(vk::LOD_CLAMP_NONE)
            .push_next(&mut reduction_ci);
        let depth_reduce = unsafe { device.create_sampler(&depth_reduce_ci, None) }?;

        let shadow_ci = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE)
            .compare_enable(true)
            .compare_op(vk::CompareOp::LESS_OR_EQUAL);
        let shadow = unsafe { device.create_sampler(&shadow_ci, None) }?;

        Ok(Self {
            nearest,
            linear,
            depth_reduce,
            shadow,
        })
    }

    /// Returns the sampler of the given kind.
    pub fn get(&self, kind: SamplerKind) -> vk::Sampler {
        match kind {
            SamplerKind::Nearest => self.nearest,
            SamplerKind::Linear => self.linear,
            SamplerKind::DepthReduce => self.depth_reduce,
            SamplerKind::Shadow => self.shadow,
        }
    }

    pub(crate) fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_sampler(self.nearest, None);
            device.destroy_sampler(self.linear, None);
            device.destroy_sampler(self.depth_reduce, None);
            device.destroy_sampler(self.shadow, None);
        }
    }
}
