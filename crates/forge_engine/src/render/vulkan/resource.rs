//! Buffer and image wrappers
//!
//! RAII wrappers tying a Vulkan object to its [`Allocation`]. Both are
//! cheaply clonable (shared `Arc` internals) so the render graph can import
//! them and pass record callbacks can capture them without lifetimes.

use std::sync::Arc;

use ash::vk;

use super::allocator::Allocation;
use super::context::{VulkanError, VulkanResult};

/// Description of a 2D image resource.
#[derive(Debug, Clone, Copy)]
pub struct ImageDescription {
    /// Texel extent of mip 0
    pub extent: vk::Extent2D,
    /// Pixel format
    pub format: vk::Format,
    /// Usage flags
    pub usage: vk::ImageUsageFlags,
    /// Mip level count
    pub mip_levels: u32,
    /// Array layer count
    pub array_layers: u32,
}

impl ImageDescription {
    /// A single-mip, single-layer image description.
    pub fn new(extent: vk::Extent2D, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            extent,
            format,
            usage,
            mip_levels: 1,
            array_layers: 1,
        }
    }
}

struct BufferInner {
    device: ash::Device,
    buffer: vk::Buffer,
    // Freed (returned to its pool) when the buffer is destroyed.
    _allocation: Allocation,
    size: vk::DeviceSize,
    mapped: Option<*mut u8>,
}

unsafe impl Send for BufferInner {}
unsafe impl Sync for BufferInner {}

impl Drop for BufferInner {
    fn drop(&mut self) {
        unsafe { self.device.destroy_buffer(self.buffer, None) };
    }
}

/// A buffer bound to suballocated device memory.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    pub(crate) fn new(
        device: ash::Device,
        buffer: vk::Buffer,
        allocation: Allocation,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
    ) -> Self {
        let mapped = allocation.mapped_ptr();
        Self {
            inner: Arc::new(BufferInner {
                device,
                buffer,
                _allocation: allocation,
                size,
                mapped,
            }),
        }
    }

    /// The raw buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.inner.buffer
    }

    /// Size in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.inner.size
    }

    /// Host pointer for host-visible buffers.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.inner.mapped
    }

    /// Copies `data` into the buffer at `byte_offset`.
    ///
    /// Fails when the buffer is not host-visible or the write overruns it.
    pub fn write_data<T: bytemuck::Pod>(&self, data: &[T], byte_offset: u64) -> VulkanResult<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let Some(mapped) = self.inner.mapped else {
            return Err(VulkanError::InvalidOperation(
                "write to non-host-visible buffer".to_owned(),
            ));
        };
        if byte_offset + bytes.len() as u64 > self.inner.size {
            return Err(VulkanError::InvalidOperation(format!(
                "write of {} bytes at {byte_offset} overruns buffer of {}",
                bytes.len(),
                self.inner.size
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                mapped.add(byte_offset as usize),
                bytes.len(),
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.inner.buffer)
            .field("size", &self.inner.size)
            .finish()
    }
}

struct ImageInner {
    device: ash::Device,
    image: vk::Image,
    owned: bool,
    _allocation: Option<Allocation>,
    format: vk::Format,
    extent: vk::Extent2D,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
    array_layers: u32,
    full_view: vk::ImageView,
    level_views: Vec<vk::ImageView>,
    layer_views: Vec<vk::ImageView>,
}

impl Drop for ImageInner {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.full_view, None);
            for &view in &self.level_views {
                self.device.destroy_image_view(view, None);
            }
            for &view in &self.layer_views {
                self.device.destroy_image_view(view, None);
            }
            if self.owned {
                self.device.destroy_image(self.image, None);
            }
        }
    }
}

/// An image with its full, per-level and per-layer views.
#[derive(Clone)]
pub struct Image {
    inner: Arc<ImageInner>,
}

fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

fn create_view(
    device: &ash::Device,
    image: vk::Image,
    view_type: vk::ImageViewType,
    format: vk::Format,
    range: vk::ImageSubresourceRange,
) -> VulkanResult<vk::ImageView> {
    let view_ci = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(view_type)
        .format(format)
        .subresource_range(range);
    Ok(unsafe { device.create_image_view(&view_ci, None) }?)
}

impl Image {
    pub(crate) fn new(
        device: ash::Device,
        image: vk::Image,
        allocation: Option<Allocation>,
        description: &ImageDescription,
    ) -> VulkanResult<Self> {
        Self::build(device, image, allocation, description, true)
    }

    /// Wraps an externally-owned image (e.g. a swapchain image). The wrapper
    /// creates and destroys views but never destroys the image itself.
    pub fn import(
        device: ash::Device,
        image: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> VulkanResult<Self> {
        let description = ImageDescription::new(extent, format, vk::ImageUsageFlags::empty());
        Self::build(device, image, None, &description, false)
    }

    fn build(
        device: ash::Device,
        image: vk::Image,
        allocation: Option<Allocation>,
        description: &ImageDescription,
        owned: bool,
    ) -> VulkanResult<Self> {
        let aspect = aspect_for_format(description.format);
        let full_range = vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: description.mip_levels,
            base_array_layer: 0,
            layer_count: description.array_layers,
        };
        let full_view_type = if description.array_layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let full_view = create_view(&device, image, full_view_type, description.format, full_range)?;

        let mut level_views = Vec::new();
        if description.mip_levels > 1 {
            for level in 0..description.mip_levels {
                level_views.push(create_view(
                    &device,
                    image,
                    vk::ImageViewType::TYPE_2D,
                    description.format,
                    vk::ImageSubresourceRange {
                        aspect_mask: aspect,
                        base_mip_level: level,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                )?);
            }
        }

        let mut layer_views = Vec::new();
        if description.array_layers > 1 {
            for layer in 0..description.array_layers {
                layer_views.push(create_view(
                    &device,
                    image,
                    vk::ImageViewType::TYPE_2D,
                    description.format,
                    vk::ImageSubresourceRange {
                        aspect_mask: aspect,
                        base_mip_level: 0,
                        level_count: description.mip_levels,
                        base_array_layer: layer,
                        layer_count: 1,
                    },
                )?);
            }
        }

        Ok(Self {
            inner: Arc::new(ImageInner {
                device,
                image,
                owned,
                _allocation: allocation,
                format: description.format,
                extent: description.extent,
                aspect,
                mip_levels: description.mip_levels,
                array_layers: description.array_layers,
                full_view,
                level_views,
                layer_views,
            }),
        })
    }

    /// The raw image handle.
    pub fn handle(&self) -> vk::Image {
        self.inner.image
    }

    /// Pixel format.
    pub fn format(&self) -> vk::Format {
        self.inner.format
    }

    /// Extent of mip 0.
    pub fn extent(&self) -> vk::Extent2D {
        self.inner.extent
    }

    /// Image aspect derived from the format.
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.inner.aspect
    }

    /// Mip level count.
    pub fn mip_levels(&self) -> u32 {
        self.inner.mip_levels
    }

    /// Array layer count.
    pub fn array_layers(&self) -> u32 {
        self.inner.array_layers
    }

    /// View covering every level and layer.
    pub fn full_view(&self) -> vk::ImageView {
        self.inner.full_view
    }

    /// View of a single mip level.
    pub fn level_view(&self, level: u32) -> vk::ImageView {
        if self.inner.mip_levels == 1 {
            debug_assert_eq!(level, 0);
            return self.inner.full_view;
        }
        self.inner.level_views[level as usize]
    }

    /// View of a single array layer.
    pub fn layer_view(&self, layer: u32) -> vk::ImageView {
        if self.inner.array_layers == 1 {
            debug_assert_eq!(layer, 0);
            return self.inner.full_view;
        }
        self.inner.layer_views[layer as usize]
    }

    /// The full subresource range.
    pub fn range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.inner.aspect,
            base_mip_level: 0,
            level_count: self.inner.mip_levels,
            base_array_layer: 0,
            layer_count: self.inner.array_layers,
        }
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("handle", &self.inner.image)
            .field("format", &self.inner.format)
            .field("extent", &self.inner.extent)
            .finish()
    }
}
