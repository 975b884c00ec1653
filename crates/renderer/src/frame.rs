//! Frame overlap and synchronization.
//!
//! # Overview
//!
//! [`FrameController`] owns [`FRAME_OVERLAP`] frame slots and drives one frame
//! per [`render_frame`](FrameController::render_frame) call. While the GPU
//! executes frame N, the CPU records frame N+1 into the other slot. Before a
//! slot is reused its fence is waited on, which is the only thing that keeps
//! the CPU from touching resources the GPU is still reading.
//!
//! Each slot owns:
//!
//! - a command pool and primary command buffer
//! - a completion fence, created signaled
//! - an acquire-ready and a render-complete semaphore
//! - a cleanup queue and a descriptor allocator scoped to the frame
//! - a host-visible uniform buffer
//!
//! # Synchronization Flow
//!
//! ```text
//! 1. Wait on the slot fence                     (slot: Submitted -> Complete)
//! 2. Flush slot cleanup, reset slot descriptors (slot: -> Idle)
//! 3. Acquire image, signals acquire_ready       (Stale: skip the frame)
//! 4. Record passes                              (slot: -> Recording)
//! 5. Reset fence, submit:
//!    - wait acquire_ready at COLOR_ATTACHMENT_OUTPUT
//!    - signal render_complete at ALL_GRAPHICS
//!    - signal the slot fence                    (slot: -> Submitted)
//! 6. Present, waits on render_complete
//! 7. Advance to the next slot
//! ```
//!
//! If a pass fails after the acquire, the slot still submits an empty batch
//! that consumes `acquire_ready`, and the image is presented unchanged.
//!
//! # External Images
//!
//! Images other than the target are tracked by handle. An image the
//! controller has never seen is assumed `UNDEFINED`; images that already
//! hold contents are registered with [`FrameController::track_image`], and
//! destroyed ones are dropped from tracking with
//! [`FrameController::forget_image`] or [`FrameController::retire_image`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::{debug, error, info, warn};

use kiln_core::{DescriptorPoolConfig, TimeoutConfig};
use kiln_rhi::buffer::{Buffer, BufferUsage};
use kiln_rhi::command::{CommandBuffer, CommandPool};
use kiln_rhi::descriptor_allocator::DescriptorAllocator;
use kiln_rhi::device::Device;
use kiln_rhi::gpu::{GpuDevice, QueueSubmit};
use kiln_rhi::image::Image;
use kiln_rhi::swapchain::{AcquireOutcome, PresentOutcome, PresentTarget};
use kiln_rhi::sync::{Fence, Semaphore};
use kiln_rhi::RhiResult;

use crate::cleanup::CleanupQueue;
use crate::pass::{FrameContext, ImageRef, RenderPass};
use crate::{FRAME_OVERLAP, label_timeout};

/// Lifecycle of a frame slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Free to record.
    Idle,
    Recording,
    /// Submitted; the GPU may still be executing it.
    Submitted,
    /// The slot fence was observed signaled.
    Complete,
}

/// What happened to a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Presented, but the target must be rebuilt.
    PresentedStale,
    /// The target was stale at acquire; nothing was submitted.
    Skipped,
}

/// Resources owned by one frame slot.
struct FrameSlot<D: GpuDevice> {
    cleanup: CleanupQueue,
    descriptors: DescriptorAllocator<D>,
    uniforms: Buffer<D>,
    acquire_ready: Semaphore<D>,
    render_complete: Semaphore<D>,
    fence: Fence<D>,
    cmd: CommandBuffer<D>,
    /// Frees `cmd`; declared after it.
    _pool: CommandPool<D>,
    state: SlotState,
}

impl<D: GpuDevice> FrameSlot<D> {
    fn new(device: &Arc<D>, descriptors: &DescriptorPoolConfig, uniform_size: u64) -> RhiResult<Self> {
        let pool = CommandPool::new(device.clone())?;
        let cmd = pool.allocate_command_buffer()?;

        Ok(Self {
            cleanup: CleanupQueue::new(),
            descriptors: DescriptorAllocator::from_config(device.clone(), descriptors)?,
            uniforms: Buffer::new(device.clone(), BufferUsage::Uniform, uniform_size)?,
            acquire_ready: Semaphore::new(device.clone())?,
            render_complete: Semaphore::new(device.clone())?,
            // Signaled so the first wait on a fresh slot returns at once
            fence: Fence::new(device.clone(), true)?,
            cmd,
            _pool: pool,
            state: SlotState::Idle,
        })
    }
}

/// Double-buffered frame pipeline.
///
/// # Thread Safety
///
/// Not thread-safe; driven from the render thread only.
pub struct FrameController<D: GpuDevice = Device> {
    slots: Vec<FrameSlot<D>>,
    current: usize,
    frame_number: u64,
    needs_rebuild: bool,
    fence_timeout: Duration,
    acquire_timeout: Duration,
    /// Last known layout of external images touched by passes.
    external_layouts: HashMap<vk::Image, vk::ImageLayout>,
}

impl<D: GpuDevice> FrameController<D> {
    /// Creates [`FRAME_OVERLAP`] slots.
    ///
    /// `uniform_size` is the size of each slot's uniform buffer and must not
    /// be zero.
    ///
    /// # Errors
    ///
    /// Returns an error if any slot resource cannot be created.
    pub fn new(
        device: Arc<D>,
        descriptors: &DescriptorPoolConfig,
        uniform_size: u64,
        timeouts: &TimeoutConfig,
    ) -> RhiResult<Self> {
        let mut slots = Vec::with_capacity(FRAME_OVERLAP);
        for i in 0..FRAME_OVERLAP {
            slots.push(FrameSlot::new(&device, descriptors, uniform_size)?);
            debug!("Created frame slot {}", i);
        }

        info!(
            "Frame controller created with {} frames in flight",
            FRAME_OVERLAP
        );

        Ok(Self {
            slots,
            current: 0,
            frame_number: 0,
            needs_rebuild: false,
            fence_timeout: timeouts.frame_fence(),
            acquire_timeout: timeouts.acquire(),
            external_layouts: HashMap::new(),
        })
    }

    /// Renders and presents one frame.
    ///
    /// `uniforms` is copied into the slot's uniform buffer before any pass
    /// records. Passes run in order.
    ///
    /// # Errors
    ///
    /// - [`RhiError::Timeout`] if the slot fence or the acquire does not
    ///   complete in time (fatal)
    /// - the error of a failing pass, after the acquired image was handed
    ///   back through an empty submission
    /// - any device error from recording, submission or presentation
    ///
    /// [`RhiError::Timeout`]: kiln_rhi::RhiError::Timeout
    ///
    /// A stale target is not an error: the rebuild flag is set and the
    /// outcome says what happened.
    ///
    /// # Panics
    ///
    /// Panics if `uniforms` is larger than the uniform buffer, or if the slot
    /// is reused while still recording or submitted.
    pub fn render_frame<T: PresentTarget>(
        &mut self,
        target: &mut T,
        uniforms: &[u8],
        passes: &mut [&mut dyn RenderPass<D>],
    ) -> RhiResult<FrameOutcome> {
        let index = self.current;
        let fence_timeout = self.fence_timeout;

        // 1. Wait until the GPU is done with this slot's previous frame
        {
            let slot = &mut self.slots[index];
            slot.fence
                .wait(fence_timeout)
                .map_err(label_timeout("frame fence"))
                .inspect_err(|e| error!("Frame slot {} wait failed: {}", index, e))?;
            if slot.state == SlotState::Submitted {
                slot.state = SlotState::Complete;
            }
        }

        // 2. Recycle per-frame resources
        self.begin_slot(index)?;

        // 3. Acquire
        let slot = &self.slots[index];
        let image_index = match target
            .acquire_next_image(slot.acquire_ready.handle(), self.acquire_timeout)?
        {
            AcquireOutcome::Ready {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    debug!("Acquired suboptimal image {}", image_index);
                    self.needs_rebuild = true;
                }
                image_index
            }
            AcquireOutcome::Stale => {
                warn!("Target stale at acquire; skipping frame {}", self.frame_number);
                self.needs_rebuild = true;
                self.advance();
                return Ok(FrameOutcome::Skipped);
            }
        };

        // 4. Record
        self.slots[index].state = SlotState::Recording;
        if let Err(e) = self.record(index, target, image_index, uniforms, passes) {
            error!("Recording frame {} failed: {}", self.frame_number, e);
            // acquire_ready is signaled and the image is ours; give both back
            self.record_passthrough(index, target, image_index)?;
            self.submit_and_present(index, target, image_index)?;
            self.advance();
            return Err(e);
        }

        // 5-6. Submit and present
        let outcome = self.submit_and_present(index, target, image_index)?;

        // 7. Advance
        self.advance();
        Ok(outcome)
    }

    /// Blocks until every slot's last submission has completed.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Timeout`](kiln_rhi::RhiError::Timeout) if a slot
    /// does not finish within the frame fence timeout.
    pub fn wait_all(&mut self) -> RhiResult<()> {
        for slot in &mut self.slots {
            slot.fence
                .wait(self.fence_timeout)
                .map_err(label_timeout("frame fence"))?;
            if slot.state == SlotState::Submitted {
                slot.state = SlotState::Complete;
            }
        }
        Ok(())
    }

    /// Flushes every slot's cleanup queue.
    ///
    /// Callers make sure the device is idle first.
    pub fn flush_all(&mut self) {
        for slot in &mut self.slots {
            slot.cleanup.flush();
        }
    }

    /// True once an acquire or present reported a stale or suboptimal target.
    #[inline]
    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    /// Forces a rebuild, e.g. after a window resize.
    pub fn request_rebuild(&mut self) {
        self.needs_rebuild = true;
    }

    /// Clears the rebuild flag after the target was rebuilt.
    pub fn acknowledge_rebuild(&mut self) {
        self.needs_rebuild = false;
    }

    /// Index of the slot the next frame will use.
    #[inline]
    pub fn current_slot(&self) -> usize {
        self.current
    }

    /// Frames started so far, skipped ones included.
    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.slots[slot].state
    }

    /// Cleanup queue of the slot the next frame will use.
    ///
    /// Actions pushed here run the next time that slot is reused.
    pub fn current_cleanup(&mut self) -> &mut CleanupQueue {
        &mut self.slots[self.current].cleanup
    }

    /// Pool count of a slot's descriptor allocator.
    pub fn slot_descriptor_pools(&self, slot: usize) -> usize {
        self.slots[slot].descriptors.pool_count()
    }

    /// Records the layout `image` is in, for images that enter the frame
    /// pipeline with contents (uploads, images written by other code).
    pub fn track_image(&mut self, image: vk::Image, layout: vk::ImageLayout) {
        self.external_layouts.insert(image, layout);
    }

    /// Stops tracking `image`. Call it before the image is destroyed so a
    /// later image reusing the handle starts from `UNDEFINED`.
    pub fn forget_image(&mut self, image: vk::Image) {
        self.external_layouts.remove(&image);
    }

    /// Last layout a frame left `image` in, if it is tracked.
    pub fn tracked_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.external_layouts.get(&image).copied()
    }

    /// Stops tracking `image` and drops it once no submitted frame can
    /// still use it.
    ///
    /// The image goes to the cleanup queue of the most recently submitted
    /// slot, which is flushed after that slot's fence is waited on. The
    /// caller must not hand it to any later frame.
    pub fn retire_image(&mut self, image: Image<D>) {
        self.forget_image(image.handle());
        let last = (self.current + FRAME_OVERLAP - 1) % FRAME_OVERLAP;
        self.slots[last].cleanup.defer_drop(image);
    }

    fn begin_slot(&mut self, index: usize) -> RhiResult<()> {
        let slot = &mut self.slots[index];
        assert!(
            matches!(slot.state, SlotState::Idle | SlotState::Complete),
            "frame slot {index} reused while {:?}",
            slot.state
        );
        slot.cleanup.flush();
        slot.descriptors.reset_pools()?;
        slot.state = SlotState::Idle;
        Ok(())
    }

    fn record<T: PresentTarget>(
        &mut self,
        index: usize,
        target: &T,
        image_index: u32,
        uniforms: &[u8],
        passes: &mut [&mut dyn RenderPass<D>],
    ) -> RhiResult<()> {
        let frame_number = self.frame_number;
        let slot = &mut self.slots[index];
        // Committed to `external_layouts` only once recording succeeded
        let mut pending: HashMap<vk::Image, vk::ImageLayout> = HashMap::new();

        slot.cmd.reset()?;
        slot.cmd.begin()?;

        if !uniforms.is_empty() {
            assert!(
                uniforms.len() as u64 <= slot.uniforms.size(),
                "{} bytes of uniforms do not fit the {} byte frame buffer",
                uniforms.len(),
                slot.uniforms.size()
            );
            slot.uniforms.write_data(0, uniforms)?;
        }

        let target_image = target.image(image_index);
        // Acquired images carry no contents we need
        let mut target_layout = vk::ImageLayout::UNDEFINED;

        let mut frame = FrameContext {
            cmd: &slot.cmd,
            target: target_image,
            target_view: target.image_view(image_index),
            extent: target.extent(),
            descriptors: &mut slot.descriptors,
            cleanup: &mut slot.cleanup,
            uniforms: &slot.uniforms,
            frame_number,
        };

        for pass in passes.iter_mut() {
            for access in pass.accesses() {
                let current = match access.image {
                    ImageRef::Target => &mut target_layout,
                    ImageRef::External(image) => pending.entry(image).or_insert_with(|| {
                        self.external_layouts
                            .get(&image)
                            .copied()
                            .unwrap_or(vk::ImageLayout::UNDEFINED)
                    }),
                };
                if *current != access.layout {
                    frame
                        .cmd
                        .transition_image(frame.resolve(access.image), *current, access.layout);
                    *current = access.layout;
                }
            }
            pass.record(&mut frame)?;
        }

        frame
            .cmd
            .transition_image(target_image, target_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        frame.cmd.end()?;

        self.external_layouts.extend(pending);
        Ok(())
    }

    /// Records a batch that only moves the target to `PRESENT_SRC_KHR`.
    fn record_passthrough<T: PresentTarget>(
        &mut self,
        index: usize,
        target: &T,
        image_index: u32,
    ) -> RhiResult<()> {
        let cmd = &self.slots[index].cmd;
        cmd.reset()?;
        cmd.begin()?;
        cmd.transition_image(
            target.image(image_index),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        cmd.end()
    }

    fn submit_and_present<T: PresentTarget>(
        &mut self,
        index: usize,
        target: &mut T,
        image_index: u32,
    ) -> RhiResult<FrameOutcome> {
        let slot = &mut self.slots[index];
        slot.fence.reset()?;
        let submit = QueueSubmit {
            command_buffer: slot.cmd.handle(),
            wait: Some((
                slot.acquire_ready.handle(),
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            )),
            signal: Some((
                slot.render_complete.handle(),
                vk::PipelineStageFlags2::ALL_GRAPHICS,
            )),
            fence: slot.fence.handle(),
        };
        slot.cmd.device().queue_submit(&submit)?;
        slot.state = SlotState::Submitted;

        match target.present(image_index, slot.render_complete.handle())? {
            PresentOutcome::Presented => Ok(FrameOutcome::Presented),
            PresentOutcome::Stale => {
                debug!("Target stale at present");
                self.needs_rebuild = true;
                Ok(FrameOutcome::PresentedStale)
            }
        }
    }

    fn advance(&mut self) {
        self.current = (self.current + 1) % FRAME_OVERLAP;
        self.frame_number += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_rhi::testing::{FakeDevice, FakeSwapchain, ScriptedAcquire};

    fn controller(device: &Arc<FakeDevice>) -> FrameController<FakeDevice> {
        let descriptors = DescriptorPoolConfig {
            initial_sets: 4,
            ratios: DescriptorPoolConfig::per_frame().ratios,
        };
        FrameController::new(device.clone(), &descriptors, 64, &TimeoutConfig::default()).unwrap()
    }

    fn swapchain(device: &Arc<FakeDevice>) -> FakeSwapchain {
        FakeSwapchain::new(
            device.clone(),
            3,
            vk::Extent2D {
                width: 8,
                height: 8,
            },
        )
    }

    #[test]
    fn test_frames_alternate_slots() {
        let device = FakeDevice::new();
        let mut frames = controller(&device);
        let mut target = swapchain(&device);

        assert_eq!(frames.current_slot(), 0);
        let outcome = frames.render_frame(&mut target, &[], &mut []).unwrap();
        assert_eq!(outcome, FrameOutcome::Presented);
        assert_eq!(frames.current_slot(), 1);
        assert_eq!(frames.slot_state(0), SlotState::Submitted);

        frames.render_frame(&mut target, &[], &mut []).unwrap();
        assert_eq!(frames.current_slot(), 0);
        assert_eq!(frames.frame_number(), 2);

        frames.wait_all().unwrap();
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_stale_acquire_skips_submission() {
        let device = FakeDevice::new();
        let mut frames = controller(&device);
        let mut target = swapchain(&device);
        target.script_acquire(ScriptedAcquire::Stale);

        let outcome = frames.render_frame(&mut target, &[], &mut []).unwrap();
        assert_eq!(outcome, FrameOutcome::Skipped);
        assert!(frames.needs_rebuild());
        assert_eq!(frames.current_slot(), 1);
        assert_eq!(device.submission_count(), 0);

        frames.acknowledge_rebuild();
        assert!(!frames.needs_rebuild());
    }

    #[test]
    fn test_suboptimal_acquire_renders_and_flags() {
        let device = FakeDevice::new();
        let mut frames = controller(&device);
        let mut target = swapchain(&device);
        target.script_acquire(ScriptedAcquire::Suboptimal);

        let outcome = frames.render_frame(&mut target, &[], &mut []).unwrap();
        assert_eq!(outcome, FrameOutcome::Presented);
        assert!(frames.needs_rebuild());
        assert_eq!(device.submission_count(), 1);
    }

    #[test]
    fn test_stale_present_is_reported() {
        let device = FakeDevice::new();
        let mut frames = controller(&device);
        let mut target = swapchain(&device);
        target.script_present(PresentOutcome::Stale);

        let outcome = frames.render_frame(&mut target, &[], &mut []).unwrap();
        assert_eq!(outcome, FrameOutcome::PresentedStale);
        assert!(frames.needs_rebuild());
        assert_eq!(frames.current_slot(), 1);
    }

    #[test]
    fn test_acquire_timeout_is_fatal() {
        let device = FakeDevice::new();
        let mut frames = controller(&device);
        let mut target = swapchain(&device);
        target.script_acquire(ScriptedAcquire::Timeout);

        let err = frames.render_frame(&mut target, &[], &mut []).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_target_ends_in_present_layout() {
        let device = FakeDevice::new();
        let mut frames = controller(&device);
        let mut target = swapchain(&device);

        frames.render_frame(&mut target, &[], &mut []).unwrap();
        let barriers = device.barriers();
        let last = barriers.last().unwrap();
        assert_eq!(last.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(last.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(last.image, target.image(0));
    }

    #[test]
    #[should_panic(expected = "do not fit")]
    fn test_oversized_uniforms_panic() {
        let device = FakeDevice::new();
        let mut frames = controller(&device);
        let mut target = swapchain(&device);
        let _ = frames.render_frame(&mut target, &[0u8; 65], &mut []);
    }

    #[test]
    fn test_frame_controller_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<FrameController>();
    }
}
