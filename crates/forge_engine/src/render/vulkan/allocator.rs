//! Device memory allocator
//!
//! One [`Allocator`] per Vulkan memory type, each suballocating fixed-size
//! driver memory pools with the TLSF algorithm in [`super::memory`]. Requests
//! of a quarter-pool size or more bypass the pools entirely and own their
//! driver memory ("dedicated" allocations). When every pool is full a new one
//! is created, halving the pool size up to six times if the device itself is
//! out of memory at the target size.

use std::sync::{Arc, Mutex};

use ash::vk;

use super::context::{VulkanError, VulkanResult};
use super::memory::{BlockId, BlockRange, MemoryPool};

const BIG_POOL_SIZE: vk::DeviceSize = 128 * 1024 * 1024;
const SMALL_HEAP_CUTOFF: vk::DeviceSize = 1024 * 1024 * 1024;

struct Pool {
    memory: vk::DeviceMemory,
    mapped: *mut u8,
    tlsf: MemoryPool,
}

// Pools move between threads inside the allocator mutex; the mapped pointer
// is only dereferenced through Allocation handles.
unsafe impl Send for Pool {}

struct AllocatorInner {
    device: ash::Device,
    memory_type_index: u32,
    pool_size: vk::DeviceSize,
    mappable: bool,
    buffer_image_granularity: vk::DeviceSize,
    pools: Mutex<Vec<Pool>>,
}

impl AllocatorInner {
    fn allocate_device_memory(&self, size: vk::DeviceSize) -> ash::prelude::VkResult<vk::DeviceMemory> {
        let mut flags_info =
            vk::MemoryAllocateFlagsInfo::builder().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let memory_ai = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(self.memory_type_index)
            .push_next(&mut flags_info);
        unsafe { self.device.allocate_memory(&memory_ai, None) }
    }

    fn map_memory(&self, memory: vk::DeviceMemory) -> VulkanResult<*mut u8> {
        if !self.mappable {
            return Ok(std::ptr::null_mut());
        }
        let pointer = unsafe {
            self.device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }?;
        Ok(pointer.cast())
    }

    fn free(&self, kind: &AllocationKind, memory: vk::DeviceMemory) {
        match kind {
            AllocationKind::Dedicated => unsafe {
                self.device.free_memory(memory, None);
            },
            AllocationKind::Pooled { pool_index, block } => {
                let mut pools = self.pools.lock().unwrap();
                pools[*pool_index].tlsf.free(*block);
            }
        }
    }
}

impl Drop for AllocatorInner {
    fn drop(&mut self) {
        let pools = self.pools.get_mut().unwrap();
        for pool in pools.drain(..) {
            debug_assert_eq!(pool.tlsf.used_size(), 0, "allocation outlived its allocator");
            unsafe { self.device.free_memory(pool.memory, None) };
        }
    }
}

/// A suballocating device memory allocator for one memory type.
pub struct Allocator {
    inner: Arc<AllocatorInner>,
}

impl Allocator {
    /// Creates an allocator for `memory_type_index`. Pools are 128 MiB, or an
    /// eighth of the heap (aligned up to 32 bytes) for heaps of 1 GiB or
    /// less. Host-visible pool memory is mapped once and stays mapped.
    pub fn new(
        device: ash::Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        memory_type_index: u32,
        buffer_image_granularity: vk::DeviceSize,
    ) -> Self {
        let memory_type = memory_properties.memory_types[memory_type_index as usize];
        let heap_size = memory_properties.memory_heaps[memory_type.heap_index as usize].size;
        let mut pool_size = BIG_POOL_SIZE;
        if heap_size <= SMALL_HEAP_CUTOFF {
            pool_size = heap_size / 8;
        }
        pool_size = (pool_size + 31) & !31;
        log::debug!("[vulkan] using {pool_size} byte pools for memory type {memory_type_index}");

        let mappable = memory_type
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        Self {
            inner: Arc::new(AllocatorInner {
                device,
                memory_type_index,
                pool_size,
                mappable,
                buffer_image_granularity,
                pools: Mutex::new(Vec::new()),
            }),
        }
    }

    fn allocate_dedicated(&self, size: vk::DeviceSize) -> VulkanResult<Allocation> {
        let memory = self
            .inner
            .allocate_device_memory(size)
            .map_err(VulkanError::Api)?;
        let mapped = match self.inner.map_memory(memory) {
            Ok(mapped) => mapped,
            Err(error) => {
                unsafe { self.inner.device.free_memory(memory, None) };
                return Err(error);
            }
        };
        Ok(Allocation {
            inner: Some(self.inner.clone()),
            memory,
            offset: 0,
            mapped,
            kind: AllocationKind::Dedicated,
        })
    }

    /// Allocates memory satisfying `requirements`. The effective alignment is
    /// raised to `bufferImageGranularity` so buffers and images can share a
    /// pool without aliasing granularity pages.
    pub fn allocate(&self, requirements: &vk::MemoryRequirements) -> VulkanResult<Allocation> {
        debug_assert!(
            requirements.memory_type_bits & (1 << self.inner.memory_type_index) != 0,
            "memory type mismatch"
        );

        let alignment = requirements
            .alignment
            .max(self.inner.buffer_image_granularity)
            .max(1) as u32;
        let size = requirements.size;
        if size >= self.inner.pool_size >> 3 {
            return self.allocate_dedicated(size);
        }
        let size = size as u32;

        let mut pools = self.inner.pools.lock().unwrap();
        for (pool_index, pool) in pools.iter_mut().enumerate() {
            if let Some(block) = pool.tlsf.allocate(size, alignment) {
                return Ok(self.pooled_allocation(pool, pool_index, block));
            }
        }

        // Out of pool space: create a new pool, halving the size if the
        // device is out of memory at the current one.
        for shift in 0..6 {
            let pool_size = self.inner.pool_size >> shift;
            if pool_size < vk::DeviceSize::from(size) {
                break;
            }
            let memory = match self.inner.allocate_device_memory(pool_size) {
                Ok(memory) => memory,
                Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => continue,
                Err(result) => return Err(VulkanError::Api(result)),
            };
            log::trace!(
                "[vulkan] new pool of size {pool_size} created for memory type {}",
                self.inner.memory_type_index
            );
            let mapped = match self.inner.map_memory(memory) {
                Ok(mapped) => mapped,
                Err(error) => {
                    unsafe { self.inner.device.free_memory(memory, None) };
                    return Err(error);
                }
            };
            pools.push(Pool {
                memory,
                mapped,
                tlsf: MemoryPool::new(pool_size as u32),
            });

            let pool_index = pools.len() - 1;
            let pool = pools.last_mut().unwrap();
            if let Some(block) = pool.tlsf.allocate(size, alignment) {
                return Ok(self.pooled_allocation(pool, pool_index, block));
            }
        }
        Err(VulkanError::OutOfDeviceMemory)
    }

    fn pooled_allocation(&self, pool: &Pool, pool_index: usize, block: BlockId) -> Allocation {
        let offset = pool.tlsf.block_offset(block);
        let mapped = if pool.mapped.is_null() {
            std::ptr::null_mut()
        } else {
            unsafe { pool.mapped.add(offset as usize) }
        };
        Allocation {
            inner: Some(self.inner.clone()),
            memory: pool.memory,
            offset: vk::DeviceSize::from(offset),
            mapped,
            kind: AllocationKind::Pooled { pool_index, block },
        }
    }

    /// Snapshot of every pool's physical block list, for debugging.
    pub fn pool_ranges(&self) -> Vec<Vec<BlockRange>> {
        let pools = self.inner.pools.lock().unwrap();
        pools.iter().map(|pool| pool.tlsf.ranges()).collect()
    }
}

#[derive(Debug)]
enum AllocationKind {
    Dedicated,
    Pooled { pool_index: usize, block: BlockId },
}

/// A uniquely-owned span of device memory; returned to its allocator on drop.
#[derive(Debug)]
pub struct Allocation {
    inner: Option<Arc<AllocatorInner>>,
    memory: vk::DeviceMemory,
    offset: vk::DeviceSize,
    mapped: *mut u8,
    kind: AllocationKind,
}

// The mapped pointer aliases persistently-mapped pool memory; writes are
// externally synchronised by the owning resource.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Allocation {
    /// The backing driver memory object.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Byte offset of this allocation within its memory object.
    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    /// Host pointer to the allocation for host-visible memory types.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        (!self.mapped.is_null()).then_some(self.mapped)
    }
}

impl std::fmt::Debug for AllocatorInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorInner")
            .field("memory_type_index", &self.memory_type_index)
            .field("pool_size", &self.pool_size)
            .field("mappable", &self.mappable)
            .finish_non_exhaustive()
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        // A moved-from allocation holds no allocator and frees nothing.
        if let Some(inner) = self.inner.take() {
            inner.free(&self.kind, self.memory);
        }
    }
}
