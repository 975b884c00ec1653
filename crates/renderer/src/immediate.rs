//! Blocking one-shot submissions.
//!
//! [`ImmediateSubmitter`] records a closure into its own command buffer,
//! submits it, and blocks until the GPU has executed it. Uploads and other
//! setup work go through here.
//!
//! It has its own command pool and fence, independent of the frame slots, so
//! waiting on it never interferes with frames in flight. It is not reachable
//! from [`RenderPass`](crate::pass::RenderPass) recording.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use kiln_rhi::RhiResult;
use kiln_rhi::command::{CommandBuffer, CommandPool};
use kiln_rhi::device::Device;
use kiln_rhi::gpu::{GpuDevice, QueueSubmit};
use kiln_rhi::sync::Fence;

use crate::label_timeout;

/// Synchronous submission path.
pub struct ImmediateSubmitter<D: GpuDevice = Device> {
    fence: Fence<D>,
    cmd: CommandBuffer<D>,
    _pool: CommandPool<D>,
    timeout: Duration,
    submissions: u64,
}

impl<D: GpuDevice> ImmediateSubmitter<D> {
    /// Creates the submitter. `timeout` bounds every wait.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool, buffer or fence cannot be created.
    pub fn new(device: Arc<D>, timeout: Duration) -> RhiResult<Self> {
        let pool = CommandPool::new_transient(device.clone())?;
        let cmd = pool.allocate_command_buffer()?;
        let fence = Fence::new(device, true)?;

        debug!("Immediate submitter created (timeout {:?})", timeout);

        Ok(Self {
            fence,
            cmd,
            _pool: pool,
            timeout,
            submissions: 0,
        })
    }

    /// Records `record`, submits it and waits for completion.
    ///
    /// When this returns `Ok`, every command recorded by `record` has
    /// executed and its writes are visible to the host.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Timeout`](kiln_rhi::RhiError::Timeout) if the GPU
    /// does not finish in time, which callers treat as device loss.
    pub fn submit_and_wait<F>(&mut self, record: F) -> RhiResult<()>
    where
        F: FnOnce(&CommandBuffer<D>),
    {
        self.fence.reset()?;
        self.cmd.reset()?;
        self.cmd.begin()?;

        record(&self.cmd);

        self.cmd.end()?;
        self.cmd
            .device()
            .queue_submit(&QueueSubmit::standalone(
                self.cmd.handle(),
                self.fence.handle(),
            ))?;
        self.submissions += 1;

        self.fence
            .wait(self.timeout)
            .map_err(label_timeout("immediate submission"))
            .inspect_err(|e| error!("Immediate submission failed: {}", e))
    }

    /// Number of submissions made so far.
    #[inline]
    pub fn submissions(&self) -> u64 {
        self.submissions
    }
}
