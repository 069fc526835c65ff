//! Timestamp query pool

use ash::vk;

use super::context::VulkanResult;

/// A recreatable timestamp query pool.
pub struct TimestampPool {
    device: ash::Device,
    pool: vk::QueryPool,
    count: u32,
}

impl TimestampPool {
    pub(crate) fn new(device: ash::Device) -> Self {
        Self {
            device,
            pool: vk::QueryPool::null(),
            count: 0,
        }
    }

    /// Recreates the pool with space for `count` timestamps.
    pub fn recreate(&mut self, count: u32) -> VulkanResult<()> {
        if self.count == count {
            return Ok(());
        }
        self.destroy();
        let pool_ci = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(count);
        self.pool = unsafe { self.device.create_query_pool(&pool_ci, None) }?;
        self.count = count;
        Ok(())
    }

    /// The raw pool handle.
    pub fn handle(&self) -> vk::QueryPool {
        self.pool
    }

    /// Number of timestamp slots.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Reads back every written timestamp, waiting for availability.
    pub fn results(&self) -> VulkanResult<Vec<u64>> {
        let mut results = vec![0u64; self.count as usize];
        unsafe {
            self.device.get_query_pool_results(
                self.pool,
                0,
                self.count,
                &mut results,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
        }?;
        Ok(results)
    }

    fn destroy(&mut self) {
        if self.pool != vk::QueryPool::null() {
            unsafe { self.device.destroy_query_pool(self.pool, None) };
            self.pool = vk::QueryPool::null();
            self.count = 0;
        }
    }
}

impl Drop for TimestampPool {
    fn drop(&mut self) {
        self.destroy();
    }
}
