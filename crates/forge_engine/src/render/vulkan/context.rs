//! Vulkan context
//!
//! Owns the instance, device, queues, default samplers and the per-memory-type
//! allocators. The engine requires Vulkan 1.3 with the feature set the
//! GPU-driven renderer depends on (indirect count draws, descriptor indexing,
//! sampler min/max reduction, synchronization2, dynamic rendering); missing
//! support surfaces as a [`ContextError`] rather than a crash at first use.

use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::{Arc, Mutex, MutexGuard};

use ash::extensions::ext::DebugUtils;
use ash::vk;
use thiserror::Error;

use super::allocator::{Allocation, Allocator};
use super::commands::Queue;
use super::resource::{Buffer, Image, ImageDescription};
use super::sampler::Samplers;

/// Errors from context creation.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The Vulkan loader could not be found or initialised
    #[error("vulkan loader unavailable")]
    LoaderUnavailable,

    /// The instance does not support Vulkan 1.3
    #[error("vulkan 1.3 not supported by the loader or driver")]
    VersionUnsupported,

    /// A required instance extension is missing
    #[error("instance extension {0} not supported")]
    InstanceExtensionUnsupported(String),

    /// No physical device is usable
    #[error("no suitable physical device found")]
    NoSuitableDevice,

    /// A required device feature is missing
    #[error("device feature {0} not supported")]
    DeviceFeatureUnsupported(&'static str),

    /// `vkCreateInstance` failed
    #[error("instance creation failed: {0:?}")]
    InstanceCreationFailed(vk::Result),

    /// `vkCreateDevice` failed
    #[error("device creation failed: {0:?}")]
    DeviceCreationFailed(vk::Result),
}

/// Errors from runtime Vulkan operations.
#[derive(Debug, Error)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("vulkan api error: {0:?}")]
    Api(vk::Result),

    /// Device memory exhausted even after shrinking the pool size
    #[error("out of device memory")]
    OutOfDeviceMemory,

    /// No memory type satisfies the request
    #[error("no suitable memory type found")]
    NoSuitableMemoryType,

    /// Invalid operation attempted
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<vk::Result> for VulkanError {
    fn from(result: vk::Result) -> Self {
        Self::Api(result)
    }
}

/// Result type for Vulkan operations.
pub type VulkanResult<T> = Result<T, VulkanError>;

/// Where a resource's memory should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUsage {
    /// GPU-only; fastest for render targets and static data
    DeviceOnly,
    /// Host-writable upload memory, device-local when available
    HostToDevice,
    /// Host memory for staging
    HostOnly,
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[vulkan] {message}");
        log::logger().flush();
        std::process::abort();
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[vulkan] {message}");
    } else {
        log::trace!("[vulkan] {message}");
    }
    vk::FALSE
}

/// The Vulkan device context shared by every rendering object.
pub struct Context {
    entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    graphics_queue: Mutex<Queue>,
    transfer_queue: Mutex<Queue>,
    graphics_family: u32,
    samplers: Samplers,
    allocators: Vec<Allocator>,
}

struct RequiredFeature {
    name: &'static str,
    supported: bool,
}

impl Context {
    /// Creates a context on the first physical device supporting the
    /// engine's feature set.
    pub fn new(app_name: &str) -> Result<Arc<Self>, ContextError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|error| {
            log::error!("[vulkan] failed to load loader: {error}");
            ContextError::LoaderUnavailable
        })?;

        let loader_version = match entry.try_enumerate_instance_version() {
            Ok(Some(version)) => version,
            Ok(None) => vk::API_VERSION_1_0,
            Err(_) => return Err(ContextError::LoaderUnavailable),
        };
        if loader_version < vk::API_VERSION_1_3 {
            log::error!(
                "[vulkan] loader only supports {}.{}",
                vk::api_version_major(loader_version),
                vk::api_version_minor(loader_version)
            );
            return Err(ContextError::VersionUnsupported);
        }

        let instance_extensions = unsafe { entry.enumerate_instance_extension_properties(None) }
            .map_err(|_| ContextError::LoaderUnavailable)?;
        let has_instance_extension = |name: &CStr| {
            instance_extensions
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
        };
        let mut enabled_instance_extensions: Vec<*const c_char> = Vec::new();
        let debug_utils_available = has_instance_extension(DebugUtils::name());
        if debug_utils_available {
            enabled_instance_extensions.push(DebugUtils::name().as_ptr());
        }

        // Enable the validation layer when present.
        let layers = unsafe { entry.enumerate_instance_layer_properties() }
            .map_err(|_| ContextError::LoaderUnavailable)?;
        let validation_layer = CString::new("VK_LAYER_KHRONOS_validation").unwrap();
        let mut enabled_layers: Vec<*const c_char> = Vec::new();
        if layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == validation_layer.as_c_str())
        {
            log::debug!("[vulkan] enabling validation layer");
            enabled_layers.push(validation_layer.as_ptr());
        }

        let app_name = CString::new(app_name).unwrap();
        let engine_name = CString::new("forge").unwrap();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .engine_name(&engine_name)
            .api_version(vk::API_VERSION_1_3);
        let instance_ci = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&enabled_layers)
            .enabled_extension_names(&enabled_instance_extensions);
        let instance = unsafe { entry.create_instance(&instance_ci, None) }
            .map_err(ContextError::InstanceCreationFailed)?;

        let debug_utils = if debug_utils_available {
            let loader = DebugUtils::new(&entry, &instance);
            let messenger_ci = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));
            let messenger = unsafe { loader.create_debug_utils_messenger(&messenger_ci, None) }
                .map_err(ContextError::InstanceCreationFailed)?;
            Some((loader, messenger))
        } else {
            None
        };

        let result = Self::create_device(&entry, &instance, debug_utils);
        match result {
            Ok(context) => Ok(context),
            Err((error, debug_utils)) => {
                unsafe {
                    if let Some((loader, messenger)) = debug_utils {
                        loader.destroy_debug_utils_messenger(messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                Err(error)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn create_device(
        entry: &ash::Entry,
        instance: &ash::Instance,
        debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    ) -> Result<Arc<Self>, (ContextError, Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>)> {
        macro_rules! bail {
            ($error:expr) => {
                return Err(($error, debug_utils))
            };
        }

        let physical_devices = match unsafe { instance.enumerate_physical_devices() } {
            Ok(devices) => devices,
            Err(_) => bail!(ContextError::NoSuitableDevice),
        };
        let Some(&physical_device) = physical_devices.first() else {
            bail!(ContextError::NoSuitableDevice);
        };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        if properties.api_version < vk::API_VERSION_1_3 {
            bail!(ContextError::VersionUnsupported);
        }
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        log::info!("[vulkan] using device {}", device_name.to_string_lossy());

        // Query the supported feature chain.
        let mut supported_11 = vk::PhysicalDeviceVulkan11Features::default();
        let mut supported_12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut supported_13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut supported = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut supported_11)
            .push_next(&mut supported_12)
            .push_next(&mut supported_13)
            .build();
        unsafe { instance.get_physical_device_features2(physical_device, &mut supported) };
        let features = supported.features;

        let required = [
            RequiredFeature {
                name: "multiDrawIndirect",
                supported: features.multi_draw_indirect != 0,
            },
            RequiredFeature {
                name: "textureCompressionBC",
                supported: features.texture_compression_bc != 0,
            },
            RequiredFeature {
                name: "shaderInt16",
                supported: features.shader_int16 != 0,
            },
            RequiredFeature {
                name: "storageBuffer16BitAccess",
                supported: supported_11.storage_buffer16_bit_access != 0,
            },
            RequiredFeature {
                name: "shaderDrawParameters",
                supported: supported_11.shader_draw_parameters != 0,
            },
            RequiredFeature {
                name: "drawIndirectCount",
                supported: supported_12.draw_indirect_count != 0,
            },
            RequiredFeature {
                name: "descriptorIndexing",
                supported: supported_12.descriptor_indexing != 0
                    && supported_12.runtime_descriptor_array != 0
                    && supported_12.descriptor_binding_partially_bound != 0
                    && supported_12.descriptor_binding_sampled_image_update_after_bind != 0
                    && supported_12.descriptor_binding_update_unused_while_pending != 0
                    && supported_12.shader_sampled_image_array_non_uniform_indexing != 0,
            },
            RequiredFeature {
                // The bindless texture array allocates its set with a
                // variable descriptor count.
                name: "descriptorBindingVariableDescriptorCount",
                supported: supported_12.descriptor_binding_variable_descriptor_count != 0,
            },
            RequiredFeature {
                name: "samplerFilterMinmax",
                supported: supported_12.sampler_filter_minmax != 0,
            },
            RequiredFeature {
                name: "scalarBlockLayout",
                supported: supported_12.scalar_block_layout != 0,
            },
            RequiredFeature {
                name: "bufferDeviceAddress",
                supported: supported_12.buffer_device_address != 0,
            },
            RequiredFeature {
                name: "vulkanMemoryModel",
                supported: supported_12.vulkan_memory_model != 0,
            },
            RequiredFeature {
                name: "synchronization2",
                supported: supported_13.synchronization2 != 0,
            },
            RequiredFeature {
                name: "dynamicRendering",
                supported: supported_13.dynamic_rendering != 0,
            },
        ];
        for feature in &required {
            if !feature.supported {
                log::error!("[vulkan] feature {} not supported", feature.name);
                bail!(ContextError::DeviceFeatureUnsupported(feature.name));
            }
        }
        let anisotropy_supported = features.sampler_anisotropy != 0;
        if !anisotropy_supported {
            log::warn!("[vulkan] feature samplerAnisotropy not supported");
        }

        // Queue selection: one graphics queue, plus a dedicated transfer
        // queue when the hardware has a transfer-only family.
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let Some(graphics_family) = queue_families.iter().position(|family| {
            family.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        }) else {
            bail!(ContextError::NoSuitableDevice);
        };
        let graphics_family = graphics_family as u32;
        let transfer_family = queue_families
            .iter()
            .enumerate()
            .find(|(_, family)| {
                family.queue_flags.contains(vk::QueueFlags::TRANSFER)
                    && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            })
            .map_or(graphics_family, |(index, _)| index as u32);

        let priorities = [1.0f32];
        let mut queue_infos = vec![vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_family)
            .queue_priorities(&priorities)
            .build()];
        if transfer_family != graphics_family {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(transfer_family)
                    .queue_priorities(&priorities)
                    .build(),
            );
        }

        let device_extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];

        let enabled_features = vk::PhysicalDeviceFeatures::builder()
            .multi_draw_indirect(true)
            .texture_compression_bc(true)
            .shader_int16(true)
            .sampler_anisotropy(anisotropy_supported)
            .build();
        let mut enabled_11 = vk::PhysicalDeviceVulkan11Features::builder()
            .storage_buffer16_bit_access(true)
            .shader_draw_parameters(true)
            .build();
        let mut enabled_12 = vk::PhysicalDeviceVulkan12Features::builder()
            .draw_indirect_count(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_update_unused_while_pending(true)
            .descriptor_binding_variable_descriptor_count(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .sampler_filter_minmax(true)
            .scalar_block_layout(true)
            .buffer_device_address(true)
            .vulkan_memory_model(true)
            .vulkan_memory_model_device_scope(true)
            .build();
        let mut enabled_13 = vk::PhysicalDeviceVulkan13Features::builder()
            .synchronization2(true)
            .dynamic_rendering(true)
            .build();
        let mut enabled_features2 = vk::PhysicalDeviceFeatures2::builder()
            .features(enabled_features)
            .push_next(&mut enabled_11)
            .push_next(&mut enabled_12)
            .push_next(&mut enabled_13);

        let device_ci = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&device_extensions)
            .push_next(&mut enabled_features2);
        let device = match unsafe { instance.create_device(physical_device, &device_ci, None) } {
            Ok(device) => device,
            Err(result) => bail!(ContextError::DeviceCreationFailed(result)),
        };

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let transfer_queue = unsafe { device.get_device_queue(transfer_family, 0) };
        let graphics = match Queue::new(device.clone(), graphics_queue, graphics_family) {
            Ok(queue) => queue,
            Err(_) => bail!(ContextError::DeviceCreationFailed(vk::Result::ERROR_INITIALIZATION_FAILED)),
        };
        let transfer = match Queue::new(device.clone(), transfer_queue, transfer_family) {
            Ok(queue) => queue,
            Err(_) => bail!(ContextError::DeviceCreationFailed(vk::Result::ERROR_INITIALIZATION_FAILED)),
        };

        let max_anisotropy = anisotropy_supported
            .then_some(properties.limits.max_sampler_anisotropy);
        let samplers = match Samplers::new(&device, max_anisotropy) {
            Ok(samplers) => samplers,
            Err(_) => bail!(ContextError::DeviceCreationFailed(vk::Result::ERROR_INITIALIZATION_FAILED)),
        };

        let buffer_image_granularity = properties.limits.buffer_image_granularity;
        let allocators = (0..memory_properties.memory_type_count)
            .map(|memory_type_index| {
                Allocator::new(
                    device.clone(),
                    &memory_properties,
                    memory_type_index,
                    buffer_image_granularity,
                )
            })
            .collect();

        Ok(Arc::new(Self {
            entry: entry.clone(),
            instance: instance.clone(),
            debug_utils,
            physical_device,
            device,
            properties,
            memory_properties,
            graphics_queue: Mutex::new(graphics),
            transfer_queue: Mutex::new(transfer),
            graphics_family,
            samplers,
            allocators,
        }))
    }

    /// The logical device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// The instance.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// The selected physical device.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Physical device properties and limits.
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// The graphics queue family index.
    pub fn graphics_family(&self) -> u32 {
        self.graphics_family
    }

    /// Locks the graphics queue for submission.
    pub fn graphics_queue(&self) -> MutexGuard<'_, Queue> {
        self.graphics_queue.lock().unwrap()
    }

    /// Locks the transfer queue for submission.
    pub fn transfer_queue(&self) -> MutexGuard<'_, Queue> {
        self.transfer_queue.lock().unwrap()
    }

    /// The default sampler set.
    pub fn samplers(&self) -> &Samplers {
        &self.samplers
    }

    /// The allocator owning the given memory type.
    pub fn allocator(&self, memory_type_index: u32) -> &Allocator {
        &self.allocators[memory_type_index as usize]
    }

    fn find_memory_type(
        &self,
        type_bits: u32,
        usage: MemoryUsage,
    ) -> VulkanResult<u32> {
        let host_coherent =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let preferences = match usage {
            MemoryUsage::DeviceOnly => vec![
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::empty(),
            ],
            // Prefer BAR-style device-local upload memory, fall back to
            // plain host-visible.
            MemoryUsage::HostToDevice => vec![
                vk::MemoryPropertyFlags::DEVICE_LOCAL | host_coherent,
                host_coherent,
            ],
            MemoryUsage::HostOnly => vec![host_coherent],
        };

        for wanted in preferences {
            for index in 0..self.memory_properties.memory_type_count {
                let memory_type = self.memory_properties.memory_types[index as usize];
                if type_bits & (1 << index) != 0 && memory_type.property_flags.contains(wanted) {
                    return Ok(index);
                }
            }
        }
        Err(VulkanError::NoSuitableMemoryType)
    }

    /// Creates a buffer bound to freshly suballocated memory.
    pub fn create_buffer(
        self: &Arc<Self>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_usage: MemoryUsage,
    ) -> VulkanResult<Buffer> {
        let buffer_ci = vk::BufferCreateInfo::builder()
            .size(size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_ci, None) }?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let allocation = match self.allocate_and_bind(requirements, memory_usage, |allocation| unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        }) {
            Ok(allocation) => allocation,
            Err(error) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(error);
            }
        };
        Ok(Buffer::new(self.device.clone(), buffer, allocation, size, usage))
    }

    /// Creates an image with views and bound device-memory.
    pub fn create_image(
        self: &Arc<Self>,
        description: &ImageDescription,
        memory_usage: MemoryUsage,
    ) -> VulkanResult<Image> {
        let image_ci = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(description.format)
            .extent(vk::Extent3D {
                width: description.extent.width,
                height: description.extent.height,
                depth: 1,
            })
            .mip_levels(description.mip_levels)
            .array_layers(description.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(description.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&image_ci, None) }?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = match self.allocate_and_bind(requirements, memory_usage, |allocation| unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }) {
            Ok(allocation) => allocation,
            Err(error) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(error);
            }
        };
        Image::new(self.device.clone(), image, Some(allocation), description)
    }

    fn allocate_and_bind(
        &self,
        requirements: vk::MemoryRequirements,
        memory_usage: MemoryUsage,
        bind: impl FnOnce(&Allocation) -> ash::prelude::VkResult<()>,
    ) -> VulkanResult<Allocation> {
        let memory_type_index = self.find_memory_type(requirements.memory_type_bits, memory_usage)?;
        let allocation = self.allocators[memory_type_index as usize].allocate(&requirements)?;
        bind(&allocation)?;
        Ok(allocation)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.graphics_queue.lock().unwrap().destroy();
            self.transfer_queue.lock().unwrap().destroy();
            self.samplers.destroy(&self.device);
            // Allocators free their device memory pools; they must go before
            // the device itself.
            self.allocators.clear();
            self.device.destroy_device(None);
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
