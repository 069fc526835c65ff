//! Texture streaming
//!
//! Streams compressed, mip-chained textures from the asset pack into a
//! bindless descriptor array in the background. `ensure_texture` always
//! returns immediately: the fallback slot while a load is in flight, the
//! real slot once it has landed. Slot 0 is the albedo fallback (a loud
//! checkerboard), slot 1 the flat-normal fallback. A load failure is logged
//! once and pins the fallback index for that name.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use ash::vk;

use crate::assets::{ImageFilter, Pack, PackError, TextureHeader};
use crate::core::tasks::{self, TaskFuture};

use super::vulkan::{
    BindlessPool, CommandBuffer, Context, Image, ImageDescription, MemoryUsage, SamplerKind,
    VulkanResult,
};

/// Which fallback a texture resolves to while loading (or on failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureKind {
    /// Colour data; falls back to slot 0
    Albedo,
    /// Normal map data; falls back to slot 1
    Normal,
}

impl TextureKind {
    fn fallback_index(self) -> u32 {
        match self {
            Self::Albedo => 0,
            Self::Normal => 1,
        }
    }
}

struct LoadedTextures {
    images: Vec<Image>,
    indices: HashMap<String, u32>,
}

/// Background texture loader feeding the bindless array.
pub struct TextureStreamer {
    context: Arc<Context>,
    pack: Arc<dyn Pack>,
    bindless: Arc<BindlessPool>,
    loaded: Arc<Mutex<LoadedTextures>>,
    in_flight: HashMap<String, TaskFuture<u32>>,
}

fn blob_format(format: crate::assets::ImageFormat) -> vk::Format {
    use crate::assets::ImageFormat;
    match format {
        ImageFormat::Bc1Srgb => vk::Format::BC1_RGB_SRGB_BLOCK,
        ImageFormat::Bc3Srgba => vk::Format::BC3_SRGB_BLOCK,
        ImageFormat::Bc5Unorm => vk::Format::BC5_UNORM_BLOCK,
        ImageFormat::RgUnorm => vk::Format::R8G8_UNORM,
        ImageFormat::RgbaUnorm => vk::Format::R8G8B8A8_UNORM,
        ImageFormat::Bc7Srgb => vk::Format::BC7_SRGB_BLOCK,
    }
}

// TODO: Respect the blob's wrap modes once the sampler set grows clamped
//       variants.
fn blob_sampler(mag_filter: ImageFilter) -> SamplerKind {
    match mag_filter {
        ImageFilter::Linear => SamplerKind::Linear,
        ImageFilter::Nearest => SamplerKind::Nearest,
    }
}

fn upload_image(
    cmd_buf: &mut CommandBuffer,
    image: &Image,
    mip_data: impl Iterator<Item = VulkanResult<crate::render::vulkan::Buffer>>,
) -> VulkanResult<()> {
    // Transition the whole mip chain for transfer writes.
    cmd_buf.image_barrier(
        vk::ImageMemoryBarrier2::builder()
            .dst_stage_mask(vk::PipelineStageFlags2::COPY)
            .dst_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .image(image.handle())
            .subresource_range(image.range())
            .build(),
    );

    let mut mip_width = image.extent().width;
    let mut mip_height = image.extent().height;
    for (level, staging) in mip_data.enumerate() {
        let staging = staging?;
        let copy = vk::BufferImageCopy::builder()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: level as u32,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(vk::Extent3D {
                width: mip_width,
                height: mip_height,
                depth: 1,
            })
            .build();
        cmd_buf.copy_buffer_to_image(&staging, image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, copy);
        // The staging buffer must survive until the copy retires.
        cmd_buf.bind_associated_buffer(staging);

        mip_width = (mip_width >> 1).max(1);
        mip_height = (mip_height >> 1).max(1);
    }

    cmd_buf.image_barrier(
        vk::ImageMemoryBarrier2::builder()
            .src_stage_mask(vk::PipelineStageFlags2::COPY)
            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::SHADER_SAMPLED_READ)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::READ_ONLY_OPTIMAL)
            .image(image.handle())
            .subresource_range(image.range())
            .build(),
    );
    Ok(())
}

fn create_fallback_image(
    context: &Arc<Context>,
    extent: vk::Extent2D,
    format: vk::Format,
    pixel_data: &[u8],
) -> VulkanResult<Image> {
    let image = context.create_image(
        &ImageDescription::new(
            extent,
            format,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        ),
        MemoryUsage::DeviceOnly,
    )?;

    let staging = context.create_buffer(
        pixel_data.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryUsage::HostOnly,
    )?;
    staging.write_data(pixel_data, 0)?;

    let mut queue = context.transfer_queue();
    queue.immediate_submit(|cmd_buf| {
        upload_image(cmd_buf, &image, std::iter::once(Ok(staging.clone())))
    })?;
    Ok(image)
}

fn load_texture(
    context: &Arc<Context>,
    pack: &dyn Pack,
    bindless: &BindlessPool,
    loaded: &Mutex<LoadedTextures>,
    name: &str,
) -> Result<u32, PackError> {
    let mut stream = pack.open(name)?;
    let header = TextureHeader::decode(stream.as_mut())?;

    let image = context
        .create_image(
            &ImageDescription {
                extent: vk::Extent2D {
                    width: header.width,
                    height: header.height,
                },
                format: blob_format(header.format),
                usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
                mip_levels: header.mip_count,
                array_layers: 1,
            },
            MemoryUsage::DeviceOnly,
        )
        .map_err(|error| PackError::Io(std::io::Error::new(std::io::ErrorKind::Other, error.to_string())))?;

    // Read each mip level into its own staging buffer and queue the copies.
    let mut mip_levels = Vec::with_capacity(header.mip_count as usize);
    let mut mip_width = header.width;
    let mut mip_height = header.height;
    for _ in 0..header.mip_count {
        let mip_size = header.format.mip_size(mip_width, mip_height) as usize;
        let mut bytes = vec![0u8; mip_size];
        stream.read_exact(&mut bytes)?;
        mip_levels.push(bytes);
        mip_width = (mip_width >> 1).max(1);
        mip_height = (mip_height >> 1).max(1);
    }

    let upload = || -> VulkanResult<()> {
        let mut queue = context.transfer_queue();
        queue.immediate_submit(|cmd_buf| {
            let staging_buffers = mip_levels.iter().map(|bytes| {
                let staging = context.create_buffer(
                    bytes.len() as vk::DeviceSize,
                    vk::BufferUsageFlags::TRANSFER_SRC,
                    MemoryUsage::HostOnly,
                )?;
                staging.write_data(bytes.as_slice(), 0)?;
                Ok(staging)
            });
            upload_image(cmd_buf, &image, staging_buffers)
        })
    };
    upload().map_err(|error| PackError::Io(std::io::Error::new(std::io::ErrorKind::Other, error.to_string())))?;

    // Publish the image into the next bindless slot.
    let sampler = context.samplers().get(blob_sampler(header.mag_filter));
    let mut loaded = loaded.lock().unwrap();
    let index = loaded.images.len() as u32;
    bindless.write_slot(
        index,
        image.full_view(),
        sampler,
        vk::ImageLayout::READ_ONLY_OPTIMAL,
    );
    loaded.images.push(image);
    loaded.indices.insert(name.to_owned(), index);
    Ok(index)
}

impl TextureStreamer {
    /// Creates the streamer, its bindless array and the two fallback slots.
    pub fn new(
        context: Arc<Context>,
        pack: Arc<dyn Pack>,
        max_textures: u32,
    ) -> VulkanResult<Self> {
        let bindless = Arc::new(BindlessPool::new(
            context.device().clone(),
            max_textures,
            vk::ShaderStageFlags::FRAGMENT | vk::ShaderStageFlags::COMPUTE,
        )?);

        // Slot 0: an unmissable checkerboard for missing albedo textures.
        let albedo_colours: [[u8; 4]; 2] = [[0xff, 0x69, 0xb4, 0xff], [0x94, 0x00, 0xd3, 0xff]];
        let mut albedo_data = Vec::with_capacity(16 * 16 * 4);
        for y in 0..16usize {
            for x in 0..16usize {
                albedo_data.extend_from_slice(&albedo_colours[(x + y) % 2]);
            }
        }
        let albedo_fallback = create_fallback_image(
            &context,
            vk::Extent2D {
                width: 16,
                height: 16,
            },
            vk::Format::R8G8B8A8_UNORM,
            &albedo_data,
        )?;

        // Slot 1: a flat +Z normal.
        let normal_fallback = create_fallback_image(
            &context,
            vk::Extent2D {
                width: 1,
                height: 1,
            },
            vk::Format::R8G8_UNORM,
            &[127, 127],
        )?;

        bindless.write_slot(
            0,
            albedo_fallback.full_view(),
            context.samplers().get(SamplerKind::Nearest),
            vk::ImageLayout::READ_ONLY_OPTIMAL,
        );
        bindless.write_slot(
            1,
            normal_fallback.full_view(),
            context.samplers().get(SamplerKind::Linear),
            vk::ImageLayout::READ_ONLY_OPTIMAL,
        );

        let loaded = Arc::new(Mutex::new(LoadedTextures {
            images: vec![albedo_fallback, normal_fallback],
            indices: HashMap::new(),
        }));

        Ok(Self {
            context,
            pack,
            bindless,
            loaded,
            in_flight: HashMap::new(),
        })
    }

    /// The bindless array's set layout.
    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.bindless.layout()
    }

    /// The bindless descriptor set bound alongside pass sets.
    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.bindless.set()
    }

    /// Resolves a texture name to a bindless slot.
    ///
    /// The first call schedules a background load and returns the fallback
    /// slot; later calls return the fallback until the load completes, then
    /// the resolved slot forever after.
    pub fn ensure_texture(&mut self, name: &str, kind: TextureKind) -> u32 {
        if let Some(&index) = self.loaded.lock().unwrap().indices.get(name) {
            return index;
        }

        let fallback_index = kind.fallback_index();
        if let Some(future) = self.in_flight.get_mut(name) {
            if !future.is_complete() {
                return fallback_index;
            }
            let future = self.in_flight.remove(name).unwrap();
            let index = future.block_on();
            self.loaded
                .lock()
                .unwrap()
                .indices
                .insert(name.to_owned(), index);
            return index;
        }

        // Schedule the load; the worker publishes into the bindless array
        // and the future resolves to the final slot.
        let context = self.context.clone();
        let pack = self.pack.clone();
        let bindless = self.bindless.clone();
        let loaded = self.loaded.clone();
        let owned_name = name.to_owned();
        let future = tasks::schedule(move || {
            match load_texture(&context, pack.as_ref(), &bindless, &loaded, &owned_name) {
                Ok(index) => index,
                Err(error) => {
                    log::error!("[graphics] failed to load texture {owned_name}: {error}");
                    // Pin the fallback so we don't retry every frame.
                    loaded
                        .lock()
                        .unwrap()
                        .indices
                        .insert(owned_name, fallback_index);
                    fallback_index
                }
            }
        });
        self.in_flight.insert(name.to_owned(), future);
        fallback_index
    }
}

impl Drop for TextureStreamer {
    fn drop(&mut self) {
        // Wait for in-flight uploads so their staging memory and image
        // writes retire before the context can be torn down.
        for (_, future) in self.in_flight.drain() {
            let _ = future.block_on();
        }
    }
}
