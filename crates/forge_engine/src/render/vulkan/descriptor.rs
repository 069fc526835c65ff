//! Descriptor set management
//!
//! Pass descriptor sets come from plain per-frame pools; the bindless texture
//! array uses an update-after-bind, partially-bound pool with a variable
//! descriptor count so the streamer can fill slots while frames using the set
//! are still in flight.

use ash::vk;

use super::context::VulkanResult;
use super::resource::Buffer;

/// Builder for descriptor set layouts.
pub struct SetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl Default for SetLayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SetLayoutBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Adds a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(1)
                .stage_flags(stages)
                .build(),
        );
        self
    }

    /// Builds the layout.
    pub fn build(self, device: &ash::Device) -> VulkanResult<vk::DescriptorSetLayout> {
        let layout_ci = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&self.bindings);
        Ok(unsafe { device.create_descriptor_set_layout(&layout_ci, None) }?)
    }
}

/// A descriptor pool for per-frame pass sets.
pub struct DescriptorPool {
    device: ash::Device,
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// Creates a pool sized for `max_sets` sets drawing from `sizes`.
    pub fn new(
        device: ash::Device,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> VulkanResult<Self> {
        let pool_ci = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(sizes);
        let pool = unsafe { device.create_descriptor_pool(&pool_ci, None) }?;
        Ok(Self { device, pool })
    }

    /// Allocates one set with the given layout.
    pub fn allocate(&self, layout: vk::DescriptorSetLayout) -> VulkanResult<vk::DescriptorSet> {
        let layouts = [layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        Ok(unsafe { self.device.allocate_descriptor_sets(&allocate_info) }?[0])
    }

    /// Returns every allocated set to the pool.
    pub fn reset(&self) -> VulkanResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty())
        }?;
        Ok(())
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe { self.device.destroy_descriptor_pool(self.pool, None) };
    }
}

/// The bindless combined-image-sampler array: one update-after-bind set with
/// a variable descriptor count, indexed by integer handles in shaders.
pub struct BindlessPool {
    device: ash::Device,
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
}

impl BindlessPool {
    /// Creates the array with `capacity` slots visible to `stages`.
    pub fn new(device: ash::Device, capacity: u32, stages: vk::ShaderStageFlags) -> VulkanResult<Self> {
        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING
            | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT];
        let mut binding_flags_ci = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
            .binding_flags(&binding_flags);
        let bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(capacity)
            .stage_flags(stages)
            .build()];
        let layout_ci = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut binding_flags_ci);
        let layout = unsafe { device.create_descriptor_set_layout(&layout_ci, None) }?;

        let sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: capacity,
        }];
        let pool_ci = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&sizes);
        let pool = match unsafe { device.create_descriptor_pool(&pool_ci, None) } {
            Ok(pool) => pool,
            Err(result) => {
                unsafe { device.destroy_descriptor_set_layout(layout, None) };
                return Err(result.into());
            }
        };

        let counts = [capacity];
        let mut variable_count_info =
            vk::DescriptorSetVariableDescriptorCountAllocateInfo::builder()
                .descriptor_counts(&counts);
        let layouts = [layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts)
            .push_next(&mut variable_count_info);
        let set = match unsafe { device.allocate_descriptor_sets(&allocate_info) } {
            Ok(sets) => sets[0],
            Err(result) => {
                unsafe {
                    device.destroy_descriptor_pool(pool, None);
                    device.destroy_descriptor_set_layout(layout, None);
                }
                return Err(result.into());
            }
        };

        Ok(Self {
            device,
            layout,
            pool,
            set,
        })
    }

    /// The array's set layout, for pipeline creation.
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// The array's descriptor set, bound once per pass.
    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Writes an image descriptor into `slot`.
    pub fn write_slot(
        &self,
        slot: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) {
        let image_info = [vk::DescriptorImageInfo {
            sampler,
            image_view: view,
            image_layout: layout,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(0)
            .dst_array_element(slot)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info);
        unsafe { self.device.update_descriptor_sets(&[write.build()], &[]) };
    }
}

impl Drop for BindlessPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Immediate-mode writer for one descriptor set.
pub struct DescriptorWriter<'d> {
    device: &'d ash::Device,
    set: vk::DescriptorSet,
}

impl<'d> DescriptorWriter<'d> {
    /// Creates a writer targeting `set`.
    pub fn new(device: &'d ash::Device, set: vk::DescriptorSet) -> Self {
        Self { device, set }
    }

    fn write_buffer(&self, binding: u32, ty: vk::DescriptorType, buffer: &Buffer) -> &Self {
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: buffer.handle(),
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(binding)
            .descriptor_type(ty)
            .buffer_info(&buffer_info);
        unsafe { self.device.update_descriptor_sets(&[write.build()], &[]) };
        self
    }

    fn write_image(
        &self,
        binding: u32,
        ty: vk::DescriptorType,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) -> &Self {
        let image_info = [vk::DescriptorImageInfo {
            sampler,
            image_view: view,
            image_layout: layout,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(binding)
            .descriptor_type(ty)
            .image_info(&image_info);
        unsafe { self.device.update_descriptor_sets(&[write.build()], &[]) };
        self
    }

    /// Writes a uniform buffer binding.
    pub fn uniform_buffer(&self, binding: u32, buffer: &Buffer) -> &Self {
        self.write_buffer(binding, vk::DescriptorType::UNIFORM_BUFFER, buffer)
    }

    /// Writes a storage buffer binding.
    pub fn storage_buffer(&self, binding: u32, buffer: &Buffer) -> &Self {
        self.write_buffer(binding, vk::DescriptorType::STORAGE_BUFFER, buffer)
    }

    /// Writes a combined image + sampler binding.
    pub fn combined_image_sampler(
        &self,
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) -> &Self {
        self.write_image(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            view,
            sampler,
            layout,
        )
    }

    /// Writes a sampled image binding.
    pub fn sampled_image(&self, binding: u32, view: vk::ImageView, layout: vk::ImageLayout) -> &Self {
        self.write_image(
            binding,
            vk::DescriptorType::SAMPLED_IMAGE,
            view,
            vk::Sampler::null(),
            layout,
        )
    }

    /// Writes a storage image binding (always `General` layout).
    pub fn storage_image(&self, binding: u32, view: vk::ImageView) -> &Self {
        self.write_image(
            binding,
            vk::DescriptorType::STORAGE_IMAGE,
            view,
            vk::Sampler::null(),
            vk::ImageLayout::GENERAL,
        )
    }
}
