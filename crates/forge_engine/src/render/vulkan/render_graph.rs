//! Frame render graph
//!
//! Passes declare reads and writes against virtual resource versions; a
//! write produces a fresh version of the same physical resource, giving the
//! graph an SSA-like view of the frame. `compile` builds a post-order pass
//! schedule from the target resource's producer and derives all image layout
//! transitions; `execute` records the passes with split-barrier
//! synchronisation: every write signals a per-version event at its write
//! stage, every read waits on the producing version's event. Transient
//! resources materialise lazily on first use and live for one frame.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use ash::vk;
use bitflags::bitflags;

use super::commands::CommandBuffer;
use super::context::{Context, MemoryUsage, VulkanError, VulkanResult};
use super::query::TimestampPool;
use super::resource::{Buffer, Image, ImageDescription};

bitflags! {
    /// How a pass reads a resource.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReadFlags: u32 {
        /// Read-modify-write companion of an additive write; scheduling only
        const ADDITIVE = 1 << 0;
        /// Used as a draw-indirect parameter buffer
        const INDIRECT = 1 << 1;
        /// Sampled in a shader rather than bound as an attachment
        const SAMPLED = 1 << 2;
        /// Presented downstream; the read version is re-cloned so a present
        /// pass can be the compile target
        const PRESENT = 1 << 3;
    }

    /// How a pass writes a resource.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteFlags: u32 {
        /// Keep existing contents (attachment load op Load instead of Clear)
        const ADDITIVE = 1 << 0;
    }

    /// Virtual resource classification.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResourceFlags: u32 {
        /// Buffer resource
        const BUFFER = 1 << 0;
        /// Image resource
        const IMAGE = 1 << 1;
        /// Imported from outside the graph; no producer
        const IMPORTED = 1 << 2;
        /// Declared but not yet written by any pass
        const UNINITIALISED = 1 << 3;
    }
}

/// What kind of work a pass records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    /// No GPU work of its own (not timestamped)
    None,
    /// Rasterisation inside a dynamic rendering scope
    Graphics,
    /// Compute dispatches
    Compute,
    /// Transfer and host-write work
    Transfer,
}

/// Identifies one version of one physical resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId {
    physical: u16,
    version: u16,
}

impl ResourceId {
    /// Index of the backing physical resource.
    pub fn physical_index(self) -> u16 {
        self.physical
    }

    /// Index of the virtual version.
    pub fn virtual_index(self) -> u16 {
        self.version
    }
}

/// Description of a transient buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferDescription {
    /// Size in bytes
    pub size: vk::DeviceSize,
    /// Usage flags
    pub usage: vk::BufferUsageFlags,
    /// Allocate from host-visible memory and keep it mapped
    pub host_accessible: bool,
}

enum ResourceObject {
    Buffer(Buffer),
    Image(Image),
}

type MaterialiseFn = Box<dyn FnOnce() -> VulkanResult<ResourceObject> + Send>;

/// A named, lazily materialised GPU resource.
struct PhysicalResource {
    name: String,
    thunk: Mutex<Option<MaterialiseFn>>,
    cell: OnceLock<ResourceObject>,
}

impl PhysicalResource {
    fn new(name: String, thunk: MaterialiseFn) -> Self {
        Self {
            name,
            thunk: Mutex::new(Some(thunk)),
            cell: OnceLock::new(),
        }
    }

    fn materialised(&self) -> VulkanResult<&ResourceObject> {
        if let Some(object) = self.cell.get() {
            return Ok(object);
        }
        let thunk = self.thunk.lock().unwrap().take();
        if let Some(thunk) = thunk {
            let object = thunk()?;
            let _ = self.cell.set(object);
        }
        self.cell.get().ok_or_else(|| {
            VulkanError::InvalidOperation(format!("resource '{}' failed to materialise", self.name))
        })
    }
}

/// One SSA version of a physical resource.
struct VirtualResource {
    producer: Option<usize>,
    flags: ResourceFlags,
    write_stage: vk::PipelineStageFlags2,
    write_access: vk::AccessFlags2,
    write_layout: vk::ImageLayout,
}

impl VirtualResource {
    fn new(producer: Option<usize>, flags: ResourceFlags) -> Self {
        Self {
            producer,
            flags,
            write_stage: vk::PipelineStageFlags2::NONE,
            write_access: vk::AccessFlags2::NONE,
            write_layout: vk::ImageLayout::UNDEFINED,
        }
    }

    fn is_image(&self) -> bool {
        self.flags.contains(ResourceFlags::IMAGE)
    }
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    id: ResourceId,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
}

type RecordFn = Box<dyn FnOnce(&RenderGraph, &mut CommandBuffer) -> VulkanResult<()> + Send>;

/// A single pass in the graph.
struct Pass {
    name: String,
    kind: PassKind,
    reads: Vec<(ResourceId, ReadFlags)>,
    writes: Vec<(ResourceId, WriteFlags)>,
    dst_stage: vk::PipelineStageFlags2,
    dst_access: vk::AccessFlags2,
    transitions: Vec<Transition>,
    visited: bool,
    manual_rendering: bool,
    on_record: Option<RecordFn>,
}

impl Pass {
    fn new(name: String, kind: PassKind) -> Self {
        Self {
            name,
            kind,
            reads: Vec::new(),
            writes: Vec::new(),
            dst_stage: vk::PipelineStageFlags2::NONE,
            dst_access: vk::AccessFlags2::NONE,
            transitions: Vec::new(),
            visited: false,
            manual_rendering: false,
            on_record: None,
        }
    }
}

struct Event {
    device: ash::Device,
    event: vk::Event,
}

impl Drop for Event {
    fn drop(&mut self) {
        unsafe { self.device.destroy_event(self.event, None) };
    }
}

/// Mutating view of a pass under construction.
pub struct PassBuilder<'graph> {
    graph: &'graph mut RenderGraph,
    index: usize,
}

impl<'graph> PassBuilder<'graph> {
    /// Declares a read of the given resource version.
    pub fn read(self, id: &mut ResourceId, flags: ReadFlags) -> Self {
        self.graph.passes[self.index].reads.push((*id, flags));
        if flags.contains(ReadFlags::PRESENT) {
            // A present pass produces a final version so that it can be the
            // target of compilation.
            *id = self.graph.clone_resource(*id, self.index);
        }
        self
    }

    /// Declares a write, replacing `id` with the freshly produced version.
    pub fn write(self, id: &mut ResourceId, flags: WriteFlags) -> Self {
        if flags.contains(WriteFlags::ADDITIVE) {
            // The pass doesn't fully overwrite the resource, so order it
            // after the previous producer.
            self.graph.passes[self.index].reads.push((*id, ReadFlags::ADDITIVE));
        }
        *id = self.graph.clone_resource(*id, self.index);
        self.graph.passes[self.index].writes.push((*id, flags));
        self
    }

    /// Suppresses the automatic dynamic-rendering scope of a graphics pass.
    /// Used by passes that render several times (e.g. once per shadow
    /// cascade layer) and begin/end rendering themselves.
    pub fn manual_rendering(self) -> Self {
        self.graph.passes[self.index].manual_rendering = true;
        self
    }

    /// Installs the record callback for this pass.
    pub fn on_record(
        self,
        record: impl FnOnce(&RenderGraph, &mut CommandBuffer) -> VulkanResult<()> + Send + 'static,
    ) {
        self.graph.passes[self.index].on_record = Some(Box::new(record));
    }
}

/// A frame-scoped pass DAG with synthesised GPU synchronisation.
pub struct RenderGraph {
    context: Option<Arc<Context>>,
    passes: Vec<Pass>,
    physical_resources: Vec<PhysicalResource>,
    virtual_resources: Vec<VirtualResource>,
    pass_order: Vec<usize>,
    events: Vec<Event>,
    timestamp_pool: Option<TimestampPool>,
}

impl RenderGraph {
    /// Creates an empty graph on the given context.
    pub fn new(context: Arc<Context>) -> Self {
        Self {
            context: Some(context),
            passes: Vec::new(),
            physical_resources: Vec::new(),
            virtual_resources: Vec::new(),
            pass_order: Vec::new(),
            events: Vec::new(),
            timestamp_pool: None,
        }
    }

    #[cfg(test)]
    fn new_detached() -> Self {
        Self {
            context: None,
            passes: Vec::new(),
            physical_resources: Vec::new(),
            virtual_resources: Vec::new(),
            pass_order: Vec::new(),
            events: Vec::new(),
            timestamp_pool: None,
        }
    }

    fn context(&self) -> &Arc<Context> {
        self.context.as_ref().expect("graph has no device context")
    }

    /// Adds a pass.
    pub fn add_pass(&mut self, name: impl Into<String>, kind: PassKind) -> PassBuilder<'_> {
        self.passes.push(Pass::new(name.into(), kind));
        PassBuilder {
            index: self.passes.len() - 1,
            graph: self,
        }
    }

    fn create_resource(
        &mut self,
        name: String,
        flags: ResourceFlags,
        thunk: MaterialiseFn,
    ) -> ResourceId {
        self.physical_resources.push(PhysicalResource::new(name, thunk));
        self.virtual_resources.push(VirtualResource::new(None, flags));
        ResourceId {
            physical: (self.physical_resources.len() - 1) as u16,
            version: (self.virtual_resources.len() - 1) as u16,
        }
    }

    fn clone_resource(&mut self, id: ResourceId, producer: usize) -> ResourceId {
        let flags = self.virtual_resources[id.version as usize].flags
            & !(ResourceFlags::IMPORTED | ResourceFlags::UNINITIALISED);
        self.virtual_resources
            .push(VirtualResource::new(Some(producer), flags));
        ResourceId {
            physical: id.physical,
            version: (self.virtual_resources.len() - 1) as u16,
        }
    }

    /// Imports an existing buffer; it has no producer inside the graph.
    pub fn import_buffer(&mut self, name: impl Into<String>, buffer: Buffer) -> ResourceId {
        self.create_resource(
            name.into(),
            ResourceFlags::BUFFER | ResourceFlags::IMPORTED,
            Box::new(move || Ok(ResourceObject::Buffer(buffer))),
        )
    }

    /// Imports an existing image; it has no producer inside the graph.
    pub fn import_image(&mut self, name: impl Into<String>, image: Image) -> ResourceId {
        self.create_resource(
            name.into(),
            ResourceFlags::IMAGE | ResourceFlags::IMPORTED,
            Box::new(move || Ok(ResourceObject::Image(image))),
        )
    }

    /// Declares a transient attachment; creation is deferred to first use.
    pub fn new_attachment(
        &mut self,
        name: impl Into<String>,
        description: ImageDescription,
    ) -> ResourceId {
        let context = self.context().clone();
        self.create_resource(
            name.into(),
            ResourceFlags::IMAGE | ResourceFlags::UNINITIALISED,
            Box::new(move || {
                Ok(ResourceObject::Image(
                    context.create_image(&description, MemoryUsage::DeviceOnly)?,
                ))
            }),
        )
    }

    /// Declares a transient buffer; creation is deferred to first use.
    pub fn new_buffer(
        &mut self,
        name: impl Into<String>,
        description: BufferDescription,
    ) -> ResourceId {
        let context = self.context().clone();
        self.create_resource(
            name.into(),
            ResourceFlags::BUFFER | ResourceFlags::UNINITIALISED,
            Box::new(move || {
                let memory_usage = if description.host_accessible {
                    MemoryUsage::HostToDevice
                } else {
                    MemoryUsage::DeviceOnly
                };
                Ok(ResourceObject::Buffer(context.create_buffer(
                    description.size,
                    description.usage,
                    memory_usage,
                )?))
            }),
        )
    }

    /// Materialises and returns the buffer behind `id`.
    pub fn get_buffer(&self, id: ResourceId) -> VulkanResult<Buffer> {
        match self.physical_resources[id.physical as usize].materialised()? {
            ResourceObject::Buffer(buffer) => Ok(buffer.clone()),
            ResourceObject::Image(_) => Err(VulkanError::InvalidOperation(format!(
                "resource '{}' is an image, not a buffer",
                self.physical_resources[id.physical as usize].name
            ))),
        }
    }

    /// Materialises and returns the image behind `id`.
    pub fn get_image(&self, id: ResourceId) -> VulkanResult<Image> {
        match self.physical_resources[id.physical as usize].materialised()? {
            ResourceObject::Image(image) => Ok(image.clone()),
            ResourceObject::Buffer(_) => Err(VulkanError::InvalidOperation(format!(
                "resource '{}' is a buffer, not an image",
                self.physical_resources[id.physical as usize].name
            ))),
        }
    }

    // Post-order traversal from the target's producer: visit the producers
    // of every read first, then append the pass itself. Imported resources
    // stop the recursion; reads of uninitialised versions are construction
    // bugs and rejected here.
    fn build_order(&mut self, target: ResourceId) {
        fn visit(
            passes: &mut [Pass],
            virtuals: &[VirtualResource],
            order: &mut Vec<usize>,
            index: usize,
        ) {
            if std::mem::replace(&mut passes[index].visited, true) {
                return;
            }
            let reads = passes[index].reads.clone();
            for (id, _flags) in reads {
                let resource = &virtuals[id.version as usize];
                assert!(
                    !resource.flags.contains(ResourceFlags::UNINITIALISED),
                    "pass '{}' reads uninitialised resource",
                    passes[index].name
                );
                if resource.flags.contains(ResourceFlags::IMPORTED) {
                    continue;
                }
                let producer = resource.producer.expect("non-imported resource has no producer");
                visit(passes, virtuals, order, producer);
            }
            order.push(index);
        }

        let producer = self.virtual_resources[target.version as usize]
            .producer
            .expect("compile target has no producer");
        let mut order = Vec::new();
        visit(&mut self.passes, &self.virtual_resources, &mut order, producer);
        self.pass_order = order;
    }

    fn build_sync(&mut self) {
        // Derive each produced version's write stage, access and layout from
        // the kind of its producing pass.
        for resource in &mut self.virtual_resources {
            if resource
                .flags
                .intersects(ResourceFlags::IMPORTED | ResourceFlags::UNINITIALISED)
            {
                continue;
            }
            let Some(producer) = resource.producer else {
                continue;
            };
            match self.passes[producer].kind {
                PassKind::Transfer | PassKind::None => {
                    resource.write_stage = vk::PipelineStageFlags2::ALL_TRANSFER;
                    resource.write_access = vk::AccessFlags2::TRANSFER_WRITE;
                    resource.write_layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
                }
                PassKind::Compute => {
                    resource.write_stage = vk::PipelineStageFlags2::COMPUTE_SHADER;
                    resource.write_access = vk::AccessFlags2::SHADER_STORAGE_WRITE;
                    // Image writes from compute are storage-image writes.
                    resource.write_layout = vk::ImageLayout::GENERAL;
                }
                PassKind::Graphics => {
                    resource.write_stage = vk::PipelineStageFlags2::ALL_GRAPHICS;
                    resource.write_access = vk::AccessFlags2::MEMORY_WRITE;
                    resource.write_layout = vk::ImageLayout::ATTACHMENT_OPTIMAL;
                }
            }
        }

        // Walk the schedule tracking each physical image's current layout,
        // recording a transition wherever a pass needs it elsewhere.
        let mut layout_map: HashMap<u16, vk::ImageLayout> = HashMap::new();
        for &pass_index in &self.pass_order {
            let mut transitions = Vec::new();
            let mut dst_stage = vk::PipelineStageFlags2::NONE;
            let mut dst_access = vk::AccessFlags2::NONE;

            let pass = &self.passes[pass_index];
            if pass.kind == PassKind::Transfer {
                dst_stage |= vk::PipelineStageFlags2::ALL_TRANSFER;
                dst_access |= vk::AccessFlags2::TRANSFER_READ;
            }

            for &(id, flags) in &pass.reads {
                if flags.contains(ReadFlags::ADDITIVE) {
                    continue;
                }
                match pass.kind {
                    PassKind::Graphics => {
                        dst_stage |= vk::PipelineStageFlags2::ALL_GRAPHICS;
                        dst_access |= vk::AccessFlags2::MEMORY_READ;
                    }
                    PassKind::Compute => {
                        dst_stage |= vk::PipelineStageFlags2::COMPUTE_SHADER;
                        dst_access |= vk::AccessFlags2::SHADER_READ;
                    }
                    _ => {}
                }
                if flags.contains(ReadFlags::INDIRECT) {
                    dst_stage |= vk::PipelineStageFlags2::DRAW_INDIRECT;
                    dst_access |= vk::AccessFlags2::INDIRECT_COMMAND_READ;
                }

                if self.virtual_resources[id.version as usize].is_image() {
                    let current = layout_map
                        .get(&id.physical)
                        .copied()
                        .unwrap_or(vk::ImageLayout::UNDEFINED);
                    let read_layout = if flags.contains(ReadFlags::PRESENT) {
                        vk::ImageLayout::PRESENT_SRC_KHR
                    } else if pass.kind == PassKind::Transfer {
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL
                    } else {
                        vk::ImageLayout::READ_ONLY_OPTIMAL
                    };
                    if current != read_layout {
                        transitions.push(Transition {
                            id,
                            old_layout: current,
                            new_layout: read_layout,
                        });
                        layout_map.insert(id.physical, read_layout);
                    }
                }
            }

            for &(id, _flags) in &pass.writes {
                let resource = &self.virtual_resources[id.version as usize];
                debug_assert_eq!(resource.producer, Some(pass_index));
                if resource.is_image() {
                    let current = layout_map
                        .get(&id.physical)
                        .copied()
                        .unwrap_or(vk::ImageLayout::UNDEFINED);
                    if current != resource.write_layout {
                        transitions.push(Transition {
                            id,
                            old_layout: current,
                            new_layout: resource.write_layout,
                        });
                        layout_map.insert(id.physical, resource.write_layout);
                    }
                }
            }

            let pass = &mut self.passes[pass_index];
            pass.transitions = transitions;
            pass.dst_stage = dst_stage;
            pass.dst_access = dst_access;
        }
    }

    /// Builds the pass schedule and synchronisation metadata for computing
    /// `target`.
    pub fn compile(&mut self, target: ResourceId) {
        log::trace!(
            "[graph] compiling for target '{}'",
            self.physical_resources[target.physical as usize].name
        );
        self.build_order(target);
        self.build_sync();
    }

    fn ensure_events(&mut self) -> VulkanResult<()> {
        let device = self.context().device().clone();
        while self.events.len() < self.virtual_resources.len() {
            let event_ci =
                vk::EventCreateInfo::builder().flags(vk::EventCreateFlags::DEVICE_ONLY);
            let event = unsafe { device.create_event(&event_ci, None) }?;
            self.events.push(Event {
                device: device.clone(),
                event,
            });
        }
        Ok(())
    }

    fn record_pass(
        &self,
        index: usize,
        on_record: Option<RecordFn>,
        cmd_buf: &mut CommandBuffer,
    ) -> VulkanResult<()> {
        let pass = &self.passes[index];
        log::trace!("[graph] recording pass '{}'", pass.name);

        // Wait on the event of every produced version this pass reads, with
        // a memory barrier from the producer's write scope into this pass's
        // read scope. Imported versions have no producer and no event; their
        // synchronisation is external.
        let waited_reads: Vec<ResourceId> = pass
            .reads
            .iter()
            .filter(|(id, _)| self.virtual_resources[id.version as usize].producer.is_some())
            .map(|&(id, _)| id)
            .collect();
        if !waited_reads.is_empty() {
            let events: Vec<vk::Event> = waited_reads
                .iter()
                .map(|id| self.events[id.version as usize].event)
                .collect();
            let barriers: Vec<vk::MemoryBarrier2> = waited_reads
                .iter()
                .map(|id| {
                    let resource = &self.virtual_resources[id.version as usize];
                    vk::MemoryBarrier2::builder()
                        .src_stage_mask(resource.write_stage)
                        .src_access_mask(resource.write_access)
                        .dst_stage_mask(pass.dst_stage)
                        .dst_access_mask(pass.dst_access)
                        .build()
                })
                .collect();
            let dependency_infos: Vec<vk::DependencyInfo> = barriers
                .iter()
                .map(|barrier| {
                    vk::DependencyInfo::builder()
                        .memory_barriers(std::slice::from_ref(barrier))
                        .build()
                })
                .collect();
            cmd_buf.wait_events(&events, &dependency_infos);
        }

        // Recorded layout transitions; made visible to everything after.
        if !pass.transitions.is_empty() {
            let mut barriers = Vec::with_capacity(pass.transitions.len());
            for transition in &pass.transitions {
                let image = self.get_image(transition.id)?;
                barriers.push(
                    vk::ImageMemoryBarrier2::builder()
                        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                        .dst_access_mask(vk::AccessFlags2::MEMORY_READ)
                        .old_layout(transition.old_layout)
                        .new_layout(transition.new_layout)
                        .image(image.handle())
                        .subresource_range(image.range())
                        .build(),
                );
            }
            let dependency_info = vk::DependencyInfo::builder().image_memory_barriers(&barriers);
            cmd_buf.pipeline_barrier(&dependency_info);
        }

        let auto_rendering = pass.kind == PassKind::Graphics && !pass.manual_rendering;
        if auto_rendering {
            self.begin_rendering(pass, cmd_buf)?;
        }

        if let Some(on_record) = on_record {
            on_record(self, cmd_buf)?;
        }

        if auto_rendering {
            cmd_buf.end_rendering();
        }

        // Signal this pass's produced versions at their write stages.
        for &(id, _) in &pass.writes {
            let resource = &self.virtual_resources[id.version as usize];
            let barrier = vk::MemoryBarrier2::builder()
                .src_stage_mask(resource.write_stage)
                .src_access_mask(resource.write_access)
                .build();
            let barriers = [barrier];
            let dependency_info = vk::DependencyInfo::builder().memory_barriers(&barriers);
            cmd_buf.set_event(self.events[id.version as usize].event, &dependency_info);
        }
        Ok(())
    }

    fn begin_rendering(&self, pass: &Pass, cmd_buf: &mut CommandBuffer) -> VulkanResult<()> {
        let mut colour_attachments = Vec::new();
        let mut depth_attachment = None;
        let mut extent = vk::Extent2D::default();

        let mut consider_resource = |id: ResourceId,
                                     load_op: vk::AttachmentLoadOp,
                                     store_op: vk::AttachmentStoreOp|
         -> VulkanResult<()> {
            if !self.virtual_resources[id.version as usize].is_image() {
                return Ok(());
            }
            let image = self.get_image(id)?;
            extent.width = extent.width.max(image.extent().width);
            extent.height = extent.height.max(image.extent().height);

            let attachment_info = vk::RenderingAttachmentInfo::builder()
                .image_view(image.full_view())
                .image_layout(vk::ImageLayout::ATTACHMENT_OPTIMAL)
                .load_op(load_op)
                .store_op(store_op)
                .build();
            if image.aspect() == vk::ImageAspectFlags::COLOR {
                colour_attachments.push(attachment_info);
            } else {
                debug_assert!(depth_attachment.is_none(), "multiple depth attachments");
                depth_attachment = Some(attachment_info);
            }
            Ok(())
        };

        for &(id, flags) in &pass.reads {
            if flags.intersects(ReadFlags::ADDITIVE | ReadFlags::SAMPLED) {
                // Additive reads are handled by the Load op on the write
                // side; sampled reads are not attachments.
                continue;
            }
            consider_resource(id, vk::AttachmentLoadOp::LOAD, vk::AttachmentStoreOp::NONE)?;
        }
        for &(id, flags) in &pass.writes {
            let additive = flags.contains(WriteFlags::ADDITIVE);
            consider_resource(
                id,
                if additive {
                    vk::AttachmentLoadOp::LOAD
                } else {
                    vk::AttachmentLoadOp::CLEAR
                },
                vk::AttachmentStoreOp::STORE,
            )?;
        }

        let mut rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .layer_count(1)
            .color_attachments(&colour_attachments);
        if let Some(depth) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth);
        }
        cmd_buf.begin_rendering(&rendering_info);
        cmd_buf.set_viewport_scissor(extent);
        Ok(())
    }

    /// Records every scheduled pass into `cmd_buf`, optionally bracketing
    /// each with timestamp queries.
    pub fn execute(
        &mut self,
        cmd_buf: &mut CommandBuffer,
        record_timestamps: bool,
    ) -> VulkanResult<()> {
        self.ensure_events()?;
        if record_timestamps {
            let device = self.context().device().clone();
            let pool = self
                .timestamp_pool
                .get_or_insert_with(|| TimestampPool::new(device));
            pool.recreate(self.pass_order.len() as u32 + 1)?;
            let pool = self.timestamp_pool.as_ref().unwrap();
            cmd_buf.reset_query_pool(pool);
            cmd_buf.write_timestamp(vk::PipelineStageFlags2::NONE, pool, 0);
        }

        let order = self.pass_order.clone();
        for (slot, &index) in order.iter().enumerate() {
            let on_record = self.passes[index].on_record.take();
            self.record_pass(index, on_record, cmd_buf)?;
            if record_timestamps && self.passes[index].kind != PassKind::None {
                let pool = self.timestamp_pool.as_ref().unwrap();
                cmd_buf.write_timestamp(
                    vk::PipelineStageFlags2::ALL_COMMANDS,
                    pool,
                    slot as u32 + 1,
                );
            }
        }
        Ok(())
    }

    /// GPU timestamps of the last executed frame, when enabled.
    pub fn timestamp_results(&self) -> VulkanResult<Vec<u64>> {
        match &self.timestamp_pool {
            Some(pool) => pool.results(),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Detached graphs have no device, so tests register resources through
    // this helper instead of import/new_attachment and only exercise the
    // compile stage (scheduling + synchronisation derivation).
    impl RenderGraph {
        fn test_resource(&mut self, name: &str, flags: ResourceFlags) -> ResourceId {
            self.create_resource(
                name.to_owned(),
                flags,
                Box::new(|| {
                    Err(VulkanError::InvalidOperation(
                        "test resource cannot materialise".to_owned(),
                    ))
                }),
            )
        }

        fn pass_named(&self, name: &str) -> &Pass {
            self.passes.iter().find(|pass| pass.name == name).unwrap()
        }

        fn order_of(&self, name: &str) -> usize {
            let index = self.passes.iter().position(|pass| pass.name == name).unwrap();
            self.pass_order.iter().position(|&i| i == index).unwrap()
        }
    }

    #[test]
    fn schedule_orders_producers_before_consumers() {
        let mut graph = RenderGraph::new_detached();
        let mut albedo =
            graph.test_resource("albedo", ResourceFlags::IMAGE | ResourceFlags::UNINITIALISED);
        let mut depth =
            graph.test_resource("depth", ResourceFlags::IMAGE | ResourceFlags::UNINITIALISED);
        let mut hdr =
            graph.test_resource("hdr", ResourceFlags::IMAGE | ResourceFlags::UNINITIALISED);

        graph
            .add_pass("gbuffer", PassKind::Graphics)
            .write(&mut albedo, WriteFlags::empty())
            .write(&mut depth, WriteFlags::empty());
        graph
            .add_pass("shade", PassKind::Compute)
            .read(&mut albedo, ReadFlags::empty())
            .read(&mut depth, ReadFlags::empty())
            .write(&mut hdr, WriteFlags::empty());

        graph.compile(hdr);
        assert_eq!(graph.pass_order.len(), 2);
        assert!(graph.order_of("gbuffer") < graph.order_of("shade"));
    }

    #[test]
    fn diamond_schedules_every_producer_once() {
        let mut graph = RenderGraph::new_detached();
        let mut a = graph.test_resource("a", ResourceFlags::BUFFER | ResourceFlags::UNINITIALISED);
        let mut b = graph.test_resource("b", ResourceFlags::BUFFER | ResourceFlags::UNINITIALISED);
        let mut c = graph.test_resource("c", ResourceFlags::BUFFER | ResourceFlags::UNINITIALISED);
        let mut d = graph.test_resource("d", ResourceFlags::BUFFER | ResourceFlags::UNINITIALISED);

        graph.add_pass("source", PassKind::Transfer).write(&mut a, WriteFlags::empty());
        graph
            .add_pass("left", PassKind::Compute)
            .read(&mut a, ReadFlags::empty())
            .write(&mut b, WriteFlags::empty());
        graph
            .add_pass("right", PassKind::Compute)
            .read(&mut a, ReadFlags::empty())
            .write(&mut c, WriteFlags::empty());
        graph
            .add_pass("join", PassKind::Compute)
            .read(&mut b, ReadFlags::empty())
            .read(&mut c, ReadFlags::empty())
            .write(&mut d, WriteFlags::empty());

        graph.compile(d);
        assert_eq!(graph.pass_order.len(), 4);
        assert_eq!(graph.order_of("source"), 0);
        assert_eq!(graph.order_of("join"), 3);
    }

    #[test]
    fn unreferenced_passes_are_culled() {
        let mut graph = RenderGraph::new_detached();
        let mut used =
            graph.test_resource("used", ResourceFlags::BUFFER | ResourceFlags::UNINITIALISED);
        let mut unused =
            graph.test_resource("unused", ResourceFlags::BUFFER | ResourceFlags::UNINITIALISED);

        graph.add_pass("needed", PassKind::Compute).write(&mut used, WriteFlags::empty());
        graph.add_pass("dead", PassKind::Compute).write(&mut unused, WriteFlags::empty());

        graph.compile(used);
        assert_eq!(graph.pass_order.len(), 1);
    }

    #[test]
    fn compute_write_then_sampled_read_transitions_once() {
        let mut graph = RenderGraph::new_detached();
        let mut image =
            graph.test_resource("storage", ResourceFlags::IMAGE | ResourceFlags::UNINITIALISED);
        let mut target =
            graph.test_resource("target", ResourceFlags::IMAGE | ResourceFlags::UNINITIALISED);

        graph.add_pass("produce", PassKind::Compute).write(&mut image, WriteFlags::empty());
        graph
            .add_pass("consume", PassKind::Graphics)
            .read(&mut image, ReadFlags::SAMPLED)
            .write(&mut target, WriteFlags::empty());

        graph.compile(target);

        // The producer transitions Undefined -> General for its storage
        // write; the consumer General -> ReadOnlyOptimal, exactly once.
        let produce = graph.pass_named("produce");
        assert_eq!(produce.transitions.len(), 1);
        assert_eq!(produce.transitions[0].old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(produce.transitions[0].new_layout, vk::ImageLayout::GENERAL);

        let consume = graph.pass_named("consume");
        let image_transitions: Vec<_> = consume
            .transitions
            .iter()
            .filter(|t| t.id.physical_index() == image.physical_index())
            .collect();
        assert_eq!(image_transitions.len(), 1);
        assert_eq!(image_transitions[0].old_layout, vk::ImageLayout::GENERAL);
        assert_eq!(image_transitions[0].new_layout, vk::ImageLayout::READ_ONLY_OPTIMAL);

        // The produced version carries the compute write scope for the split
        // barrier.
        let version = &graph.virtual_resources[image.virtual_index() as usize];
        assert_eq!(version.write_layout, vk::ImageLayout::GENERAL);
    }

    #[test]
    fn present_transition_lands_on_present_pass_only() {
        let mut graph = RenderGraph::new_detached();
        let mut swapchain =
            graph.test_resource("swapchain", ResourceFlags::IMAGE | ResourceFlags::IMPORTED);

        graph.add_pass("blit", PassKind::Graphics).write(&mut swapchain, WriteFlags::empty());
        graph
            .add_pass("present", PassKind::None)
            .read(&mut swapchain, ReadFlags::PRESENT);

        graph.compile(swapchain);

        let present = graph.pass_named("present");
        assert_eq!(present.transitions.len(), 1);
        assert_eq!(present.transitions[0].new_layout, vk::ImageLayout::PRESENT_SRC_KHR);

        let blit = graph.pass_named("blit");
        assert!(blit
            .transitions
            .iter()
            .all(|t| t.new_layout != vk::ImageLayout::PRESENT_SRC_KHR));
    }

    #[test]
    fn additive_write_orders_after_previous_producer() {
        let mut graph = RenderGraph::new_detached();
        let mut image =
            graph.test_resource("albedo", ResourceFlags::IMAGE | ResourceFlags::UNINITIALISED);

        graph.add_pass("early", PassKind::Graphics).write(&mut image, WriteFlags::empty());
        graph.add_pass("late", PassKind::Graphics).write(&mut image, WriteFlags::ADDITIVE);

        graph.compile(image);
        assert!(graph.order_of("early") < graph.order_of("late"));
        // No layout transition between the two attachment writes.
        assert!(graph.pass_named("late").transitions.is_empty());
    }

    #[test]
    fn indirect_reads_accumulate_draw_indirect_scope() {
        let mut graph = RenderGraph::new_detached();
        let mut draws =
            graph.test_resource("draws", ResourceFlags::BUFFER | ResourceFlags::UNINITIALISED);
        let mut target =
            graph.test_resource("target", ResourceFlags::IMAGE | ResourceFlags::UNINITIALISED);

        graph.add_pass("cull", PassKind::Compute).write(&mut draws, WriteFlags::empty());
        graph
            .add_pass("draw", PassKind::Graphics)
            .read(&mut draws, ReadFlags::INDIRECT)
            .write(&mut target, WriteFlags::empty());

        graph.compile(target);
        let draw = graph.pass_named("draw");
        assert!(draw.dst_stage.contains(vk::PipelineStageFlags2::DRAW_INDIRECT));
        assert!(draw.dst_access.contains(vk::AccessFlags2::INDIRECT_COMMAND_READ));

        // The cull pass's produced version signals from the compute stage.
        let version = &graph.virtual_resources[draws.virtual_index() as usize];
        assert_eq!(version.write_stage, vk::PipelineStageFlags2::COMPUTE_SHADER);
    }

    #[test]
    #[should_panic(expected = "reads uninitialised resource")]
    fn reading_uninitialised_resource_panics_at_compile() {
        let mut graph = RenderGraph::new_detached();
        let mut never_written =
            graph.test_resource("nothing", ResourceFlags::BUFFER | ResourceFlags::UNINITIALISED);
        let mut out =
            graph.test_resource("out", ResourceFlags::BUFFER | ResourceFlags::UNINITIALISED);

        // Capture the uninitialised version before anything writes it.
        let stale = never_written;
        graph.add_pass("init", PassKind::Transfer).write(&mut never_written, WriteFlags::empty());
        let mut stale = stale;
        graph
            .add_pass("broken", PassKind::Compute)
            .read(&mut stale, ReadFlags::empty())
            .write(&mut out, WriteFlags::empty());

        graph.compile(out);
    }
}
