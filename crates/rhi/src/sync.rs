//! Synchronization primitives.
//!
//! - [`Semaphore`] orders work between queue operations (acquire, render, present)
//! - [`Fence`] lets the host wait for submitted work to finish
//!
//! Both are generic over the [`GpuDevice`] they were created on and default to
//! the Vulkan [`Device`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use kiln_rhi::device::Device;
//! use kiln_rhi::sync::{Fence, Semaphore};
//!
//! # fn example(device: Arc<Device>) -> Result<(), kiln_rhi::RhiError> {
//! let image_ready: Semaphore = Semaphore::new(device.clone())?;
//!
//! // Created signaled so the first wait returns immediately
//! let frame_done: Fence = Fence::new(device, true)?;
//! frame_done.wait(Duration::from_secs(1))?;
//! frame_done.reset()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::RhiResult;
use crate::gpu::GpuDevice;

/// Binary semaphore for GPU-to-GPU ordering.
///
/// Created unsignaled. A semaphore must not be signaled again while a
/// previous signal has not been waited on.
pub struct Semaphore<D: GpuDevice = Device> {
    device: Arc<D>,
    semaphore: vk::Semaphore,
}

impl<D: GpuDevice> Semaphore<D> {
    /// Creates an unsignaled semaphore.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(device: Arc<D>) -> RhiResult<Self> {
        let semaphore = device.create_semaphore()?;
        debug!("Created semaphore");
        Ok(Self { device, semaphore })
    }

    /// Returns the Vulkan semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl<D: GpuDevice> Drop for Semaphore<D> {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.semaphore);
        debug!("Destroyed semaphore");
    }
}

/// Fence for GPU-to-host completion.
pub struct Fence<D: GpuDevice = Device> {
    device: Arc<D>,
    fence: vk::Fence,
}

impl<D: GpuDevice> Fence<D> {
    /// Creates a fence, optionally already signaled.
    ///
    /// Fences that are waited on before their first submission (frame slots,
    /// the immediate path) are created signaled.
    ///
    /// # Errors
    ///
    /// Returns an error if fence creation fails.
    pub fn new(device: Arc<D>, signaled: bool) -> RhiResult<Self> {
        let fence = device.create_fence(signaled)?;
        debug!(
            "Created fence ({})",
            if signaled { "signaled" } else { "unsignaled" }
        );
        Ok(Self { device, fence })
    }

    /// Returns the Vulkan fence handle.
    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Blocks until the fence is signaled.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Timeout`](crate::RhiError::Timeout) if `timeout`
    /// elapses first. Callers treat that as device loss.
    pub fn wait(&self, timeout: Duration) -> RhiResult<()> {
        self.device.wait_for_fences(&[self.fence], timeout)
    }

    /// Returns the fence to the unsignaled state.
    ///
    /// The fence must not be pending on a queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset fails.
    pub fn reset(&self) -> RhiResult<()> {
        self.device.reset_fences(&[self.fence])
    }

    /// Non-blocking status query.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is lost.
    pub fn is_signaled(&self) -> RhiResult<bool> {
        self.device.fence_status(self.fence)
    }
}

impl<D: GpuDevice> Drop for Fence<D> {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
        debug!("Destroyed fence");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevice;

    #[test]
    fn test_semaphore_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Semaphore>();
        assert_send_sync::<Fence>();
    }

    #[test]
    fn test_signaled_fence_wait_returns_immediately() {
        let device = FakeDevice::new();
        let fence = Fence::new(device.clone(), true).unwrap();
        assert!(fence.is_signaled().unwrap());
        fence.wait(Duration::from_millis(10)).unwrap();

        fence.reset().unwrap();
        assert!(!fence.is_signaled().unwrap());
    }

    #[test]
    fn test_unsignaled_fence_wait_times_out() {
        let device = FakeDevice::new();
        let fence = Fence::new(device, false).unwrap();
        let err = fence.wait(Duration::from_millis(5)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_drop_releases_handles() {
        let device = FakeDevice::new();
        {
            let _fence = Fence::new(device.clone(), false).unwrap();
            let _semaphore = Semaphore::new(device.clone()).unwrap();
            assert_eq!(device.live_objects(), 2);
        }
        assert_eq!(device.live_objects(), 0);
    }
}
