//! Growable descriptor set allocator.
//!
//! # Overview
//!
//! [`DescriptorAllocator`] hands out descriptor sets from a list of pools
//! that grows on demand. Pools are partitioned into `ready` (may still have
//! room) and `full` (an allocation from them failed). Every pool lives in
//! exactly one of the two lists between calls.
//!
//! When no ready pool is left a new one is created at the current growth
//! capacity, and the capacity for the next pool grows by half, up to
//! [`MAX_SETS_PER_POOL`].
//!
//! Sets are never freed one by one. [`reset_pools`](DescriptorAllocator::reset_pools)
//! returns every set of every pool at once, which is how the per-frame
//! allocators are recycled.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use kiln_rhi::descriptor::{DescriptorLayoutBuilder, PoolSizeRatio};
//! use kiln_rhi::descriptor_allocator::DescriptorAllocator;
//! use kiln_rhi::device::Device;
//!
//! # fn example(device: Arc<Device>) -> Result<(), kiln_rhi::RhiError> {
//! let ratios = [PoolSizeRatio::new(vk::DescriptorType::STORAGE_IMAGE, 1.0)];
//! let mut allocator: DescriptorAllocator = DescriptorAllocator::new(device.clone(), 10, &ratios)?;
//!
//! let layout = DescriptorLayoutBuilder::new()
//!     .add_binding(0, vk::DescriptorType::STORAGE_IMAGE)
//!     .build(device, vk::ShaderStageFlags::COMPUTE)?;
//! let set = allocator.allocate(layout.handle())?;
//!
//! // Later, once no submitted work references the sets:
//! allocator.reset_pools()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, warn};

use crate::descriptor::{PoolSizeRatio, pool_sizes};
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::gpu::GpuDevice;

/// Upper bound on the set capacity of a single pool.
pub const MAX_SETS_PER_POOL: u32 = 4096;

/// Capacity of the pool created after one of `capacity` sets.
#[inline]
pub fn next_pool_capacity(capacity: u32) -> u32 {
    (capacity.saturating_mul(3) / 2).min(MAX_SETS_PER_POOL)
}

fn is_pool_exhausted(error: &RhiError) -> bool {
    matches!(
        error,
        RhiError::VulkanError(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
            | RhiError::VulkanError(vk::Result::ERROR_FRAGMENTED_POOL)
    )
}

/// Allocator over a growing list of descriptor pools.
///
/// Not thread-safe: each scope (global, and one per frame slot) owns its own.
pub struct DescriptorAllocator<D: GpuDevice = Device> {
    device: Arc<D>,
    ratios: Vec<PoolSizeRatio>,
    ready: Vec<vk::DescriptorPool>,
    full: Vec<vk::DescriptorPool>,
    /// Capacity of the next pool to be created.
    sets_per_pool: u32,
    destroyed: bool,
}

impl<D: GpuDevice> DescriptorAllocator<D> {
    /// Creates the allocator with one pool of `initial_sets` sets.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] if `initial_sets` is zero, or the
    /// device error if the first pool cannot be created.
    pub fn new(device: Arc<D>, initial_sets: u32, ratios: &[PoolSizeRatio]) -> RhiResult<Self> {
        if initial_sets == 0 {
            return Err(RhiError::InvalidState(
                "descriptor allocator needs a non-zero initial capacity".to_string(),
            ));
        }

        let mut allocator = Self {
            device,
            ratios: ratios.to_vec(),
            ready: Vec::new(),
            full: Vec::new(),
            sets_per_pool: initial_sets.min(MAX_SETS_PER_POOL),
            destroyed: false,
        };

        let first = allocator.create_pool(allocator.sets_per_pool)?;
        allocator.ready.push(first);
        allocator.sets_per_pool = next_pool_capacity(initial_sets);

        debug!(
            "Descriptor allocator created ({} sets, next pool {})",
            initial_sets, allocator.sets_per_pool
        );

        Ok(allocator)
    }

    /// Creates an allocator from configured binding ratios.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn from_config(device: Arc<D>, config: &kiln_core::DescriptorPoolConfig) -> RhiResult<Self> {
        let ratios: Vec<PoolSizeRatio> = config.ratios.iter().copied().map(Into::into).collect();
        Self::new(device, config.initial_sets, &ratios)
    }

    /// Allocates one set with `layout`.
    ///
    /// A pool that runs out moves to the full list and the allocation is
    /// retried once on another pool.
    ///
    /// # Errors
    ///
    /// - [`RhiError::DescriptorPoolExhausted`] when the retry fails too
    /// - [`RhiError::InvalidState`] after [`destroy_pools`](Self::destroy_pools)
    /// - any other device error from pool creation or allocation
    pub fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> RhiResult<vk::DescriptorSet> {
        if self.destroyed {
            return Err(RhiError::InvalidState(
                "descriptor allocator used after destroy_pools".to_string(),
            ));
        }

        let pool = self.take_pool()?;
        match self.device.allocate_descriptor_set(pool, layout) {
            Ok(set) => {
                self.ready.push(pool);
                return Ok(set);
            }
            Err(e) if is_pool_exhausted(&e) => {
                debug!("Descriptor pool full, retrying on a fresh pool");
                self.full.push(pool);
            }
            Err(e) => {
                self.ready.push(pool);
                return Err(e);
            }
        }

        let pool = self.take_pool()?;
        match self.device.allocate_descriptor_set(pool, layout) {
            Ok(set) => {
                self.ready.push(pool);
                Ok(set)
            }
            Err(e) if is_pool_exhausted(&e) => {
                self.full.push(pool);
                error!(
                    "Descriptor allocation failed on two consecutive pools (next pool: {} sets)",
                    self.sets_per_pool
                );
                Err(RhiError::DescriptorPoolExhausted {
                    sets_per_pool: self.sets_per_pool,
                })
            }
            Err(e) => {
                self.ready.push(pool);
                Err(e)
            }
        }
    }

    /// Returns every set of every pool and marks all pools ready.
    ///
    /// The caller guarantees no submitted work still uses the sets.
    ///
    /// # Errors
    ///
    /// Returns the first device error. Pools are still merged into the ready
    /// list.
    pub fn reset_pools(&mut self) -> RhiResult<()> {
        let mut result = Ok(());
        for &pool in self.ready.iter().chain(self.full.iter()) {
            if let Err(e) = self.device.reset_descriptor_pool(pool) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.ready.append(&mut self.full);
        result
    }

    /// Destroys every pool. The allocator cannot be used afterwards.
    pub fn destroy_pools(&mut self) {
        if self.destroyed {
            return;
        }
        let count = self.pool_count();
        for pool in self.ready.drain(..).chain(self.full.drain(..)) {
            self.device.destroy_descriptor_pool(pool);
        }
        self.destroyed = true;
        debug!("Destroyed {} descriptor pool(s)", count);
    }

    #[inline]
    pub fn ready_pool_count(&self) -> usize {
        self.ready.len()
    }

    #[inline]
    pub fn full_pool_count(&self) -> usize {
        self.full.len()
    }

    #[inline]
    pub fn pool_count(&self) -> usize {
        self.ready.len() + self.full.len()
    }

    /// Capacity the next created pool will have.
    #[inline]
    pub fn sets_per_pool(&self) -> u32 {
        self.sets_per_pool
    }

    fn take_pool(&mut self) -> RhiResult<vk::DescriptorPool> {
        if let Some(pool) = self.ready.pop() {
            return Ok(pool);
        }

        let capacity = self.sets_per_pool;
        let pool = self.create_pool(capacity)?;
        self.sets_per_pool = next_pool_capacity(capacity);
        if capacity == MAX_SETS_PER_POOL {
            warn!(
                "Descriptor allocator at pool ceiling ({} pools of up to {} sets)",
                self.pool_count() + 1,
                MAX_SETS_PER_POOL
            );
        }
        Ok(pool)
    }

    fn create_pool(&self, capacity: u32) -> RhiResult<vk::DescriptorPool> {
        let sizes = pool_sizes(capacity, &self.ratios);
        let pool = self.device.create_descriptor_pool(capacity, &sizes)?;
        debug!("Created descriptor pool for {} sets", capacity);
        Ok(pool)
    }
}

impl<D: GpuDevice> Drop for DescriptorAllocator<D> {
    fn drop(&mut self) {
        self.destroy_pools();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevice;

    fn ratios() -> Vec<PoolSizeRatio> {
        vec![PoolSizeRatio::new(vk::DescriptorType::UNIFORM_BUFFER, 1.0)]
    }

    #[test]
    fn test_next_pool_capacity_grows_and_clamps() {
        assert_eq!(next_pool_capacity(10), 15);
        assert_eq!(next_pool_capacity(15), 22);
        assert_eq!(next_pool_capacity(3000), MAX_SETS_PER_POOL);
        assert_eq!(next_pool_capacity(MAX_SETS_PER_POOL), MAX_SETS_PER_POOL);
        assert_eq!(next_pool_capacity(u32::MAX), MAX_SETS_PER_POOL);
    }

    #[test]
    fn test_zero_initial_capacity_rejected() {
        let device = FakeDevice::new();
        assert!(DescriptorAllocator::new(device, 0, &ratios()).is_err());
    }

    #[test]
    fn test_new_creates_one_ready_pool() {
        let device = FakeDevice::new();
        let allocator = DescriptorAllocator::new(device.clone(), 10, &ratios()).unwrap();
        assert_eq!(allocator.ready_pool_count(), 1);
        assert_eq!(allocator.full_pool_count(), 0);
        assert_eq!(allocator.sets_per_pool(), 15);
        assert_eq!(device.descriptor_pool_capacities(), vec![10]);
    }

    #[test]
    fn test_allocate_after_destroy_is_invalid() {
        let device = FakeDevice::new();
        let mut allocator = DescriptorAllocator::new(device, 4, &ratios()).unwrap();
        allocator.destroy_pools();
        allocator.destroy_pools();
        let err = allocator
            .allocate(vk::DescriptorSetLayout::null())
            .unwrap_err();
        assert!(matches!(err, RhiError::InvalidState(_)));
        assert_eq!(allocator.pool_count(), 0);
    }

    #[test]
    fn test_other_errors_return_pool_to_ready() {
        let device = FakeDevice::new();
        let mut allocator = DescriptorAllocator::new(device.clone(), 4, &ratios()).unwrap();
        device.fail_next_descriptor_allocations_with(1, vk::Result::ERROR_OUT_OF_HOST_MEMORY);

        let err = allocator
            .allocate(vk::DescriptorSetLayout::null())
            .unwrap_err();
        assert!(matches!(
            err,
            RhiError::VulkanError(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        ));
        assert_eq!(allocator.ready_pool_count(), 1);
        assert_eq!(allocator.full_pool_count(), 0);
    }

    #[test]
    fn test_drop_destroys_pools() {
        let device = FakeDevice::new();
        {
            let mut allocator = DescriptorAllocator::new(device.clone(), 1, &ratios()).unwrap();
            allocator.allocate(vk::DescriptorSetLayout::null()).unwrap();
            allocator.allocate(vk::DescriptorSetLayout::null()).unwrap();
            assert_eq!(allocator.pool_count(), 2);
        }
        assert_eq!(device.live_objects(), 0);
    }
}
