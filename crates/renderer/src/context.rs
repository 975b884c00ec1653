//! The composition root of the renderer.
//!
//! [`RenderContext`] owns everything with a GPU lifetime: the device handle,
//! the global descriptor allocator, the immediate submitter, the frame
//! controller and the session cleanup queue. Dropping it waits for the
//! device to go idle, then tears everything down in reverse order of
//! creation.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kiln_core::EngineConfig;
//! use kiln_renderer::context::RenderContext;
//! use kiln_renderer::pass::{ClearPass, ImageRef, RenderPass};
//! use kiln_rhi::buffer::BufferUsage;
//! use kiln_rhi::device::Device;
//! use kiln_rhi::swapchain::Swapchain;
//!
//! # fn example(device: Arc<Device>, swapchain: &mut Swapchain) -> Result<(), kiln_rhi::RhiError> {
//! let mut context: RenderContext = RenderContext::new(device, &EngineConfig::default(), 256)?;
//!
//! // Long-lived resources are registered with the session queue
//! let buffer = context.upload_buffer(BufferUsage::Storage, &[0u8; 64])?;
//! context.cleanup().defer_drop(buffer);
//!
//! let mut clear = ClearPass::new(ImageRef::Target, [0.1, 0.1, 0.1, 1.0]);
//! let mut passes: [&mut dyn RenderPass; 1] = [&mut clear];
//! context.render_frame(swapchain, &[0u8; 256], &mut passes)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use tracing::{error, info};

use kiln_core::EngineConfig;
use kiln_rhi::buffer::{Buffer, BufferUsage};
use kiln_rhi::command::CommandBuffer;
use kiln_rhi::descriptor_allocator::DescriptorAllocator;
use kiln_rhi::device::Device;
use kiln_rhi::gpu::GpuDevice;
use kiln_rhi::image::{CUBE_FACES, Image, ImageDesc};
use kiln_rhi::swapchain::PresentTarget;
use kiln_rhi::RhiResult;

use crate::cleanup::CleanupQueue;
use crate::frame::{FrameController, FrameOutcome};
use crate::immediate::ImmediateSubmitter;
use crate::pass::RenderPass;
use crate::upload::{self, GpuMesh};

/// Owner of all renderer state with a GPU lifetime.
pub struct RenderContext<D: GpuDevice = Device> {
    /// Flushed first on drop.
    cleanup: CleanupQueue,
    frames: FrameController<D>,
    immediate: ImmediateSubmitter<D>,
    descriptors: DescriptorAllocator<D>,
    device: Arc<D>,
}

impl<D: GpuDevice> RenderContext<D> {
    /// Creates the renderer state.
    ///
    /// `uniform_size` is the size of the uniform buffer every frame slot
    /// owns.
    ///
    /// # Errors
    ///
    /// Returns an error if any allocator, slot or submitter resource cannot
    /// be created.
    pub fn new(device: Arc<D>, config: &EngineConfig, uniform_size: u64) -> RhiResult<Self> {
        let descriptors =
            DescriptorAllocator::from_config(device.clone(), &config.descriptors.global)?;
        let immediate = ImmediateSubmitter::new(device.clone(), config.timeouts.immediate())?;
        let frames = FrameController::new(
            device.clone(),
            &config.descriptors.per_frame,
            uniform_size,
            &config.timeouts,
        )?;

        info!("Render context initialized");

        Ok(Self {
            cleanup: CleanupQueue::new(),
            frames,
            immediate,
            descriptors,
            device,
        })
    }

    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Allocator for sets that live as long as the session.
    #[inline]
    pub fn descriptors(&mut self) -> &mut DescriptorAllocator<D> {
        &mut self.descriptors
    }

    /// Session cleanup queue, flushed once at teardown.
    #[inline]
    pub fn cleanup(&mut self) -> &mut CleanupQueue {
        &mut self.cleanup
    }

    #[inline]
    pub fn frames(&self) -> &FrameController<D> {
        &self.frames
    }

    #[inline]
    pub fn frames_mut(&mut self) -> &mut FrameController<D> {
        &mut self.frames
    }

    /// Creates an uninitialized buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if creation fails.
    pub fn create_buffer(&self, usage: BufferUsage, size: vk::DeviceSize) -> RhiResult<Buffer<D>> {
        Buffer::new(self.device.clone(), usage, size)
    }

    /// Creates an image with undefined contents.
    ///
    /// # Errors
    ///
    /// Returns an error if creation fails.
    pub fn create_image(&self, desc: &ImageDesc, name: &str) -> RhiResult<Image<D>> {
        Image::new(self.device.clone(), desc, name)
    }

    /// See [`upload::upload_buffer`].
    pub fn upload_buffer(&mut self, usage: BufferUsage, data: &[u8]) -> RhiResult<Buffer<D>> {
        upload::upload_buffer(&mut self.immediate, &self.device, usage, data)
    }

    /// See [`upload::upload_mesh`].
    pub fn upload_mesh<V: Pod>(&mut self, vertices: &[V], indices: &[u32]) -> RhiResult<GpuMesh<D>> {
        upload::upload_mesh(&mut self.immediate, &self.device, vertices, indices)
    }

    /// See [`upload::upload_image`].
    ///
    /// The frame controller learns the image's `SHADER_READ_ONLY_OPTIMAL`
    /// layout, so passes can declare it without a discarding transition.
    pub fn upload_image(&mut self, data: &[u8], desc: &ImageDesc, name: &str) -> RhiResult<Image<D>> {
        let image = upload::upload_image(&mut self.immediate, &self.device, data, desc, name)?;
        self.frames
            .track_image(image.handle(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        Ok(image)
    }

    /// See [`upload::upload_cube_map`]. Tracked like [`Self::upload_image`].
    pub fn upload_cube_map(
        &mut self,
        faces: [&[u8]; CUBE_FACES as usize],
        size: u32,
        format: vk::Format,
        name: &str,
    ) -> RhiResult<Image<D>> {
        let image =
            upload::upload_cube_map(&mut self.immediate, &self.device, faces, size, format, name)?;
        self.frames
            .track_image(image.handle(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        Ok(image)
    }

    /// Drops `image` once in-flight frames are done with it.
    ///
    /// See [`FrameController::retire_image`].
    pub fn retire_image(&mut self, image: Image<D>) {
        self.frames.retire_image(image);
    }

    /// Stops layout tracking for an image the caller destroys itself,
    /// after the device went idle.
    pub fn forget_image(&mut self, image: vk::Image) {
        self.frames.forget_image(image);
    }

    /// Records and runs `record` synchronously.
    ///
    /// # Errors
    ///
    /// See [`ImmediateSubmitter::submit_and_wait`].
    pub fn immediate_submit<F>(&mut self, record: F) -> RhiResult<()>
    where
        F: FnOnce(&CommandBuffer<D>),
    {
        self.immediate.submit_and_wait(record)
    }

    /// Renders one frame. See [`FrameController::render_frame`].
    pub fn render_frame<T: PresentTarget>(
        &mut self,
        target: &mut T,
        uniforms: &[u8],
        passes: &mut [&mut dyn RenderPass<D>],
    ) -> RhiResult<FrameOutcome> {
        self.frames.render_frame(target, uniforms, passes)
    }

    /// Blocks until the device has finished all submitted work.
    ///
    /// # Errors
    ///
    /// Returns the device error, typically device loss.
    pub fn wait_idle(&self) -> RhiResult<()> {
        self.device.wait_idle()
    }
}

impl<D: GpuDevice> Drop for RenderContext<D> {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Device wait before teardown failed: {}", e);
        }
        self.cleanup.flush();
        self.frames.flush_all();
        info!("Render context destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_rhi::testing::FakeDevice;

    #[test]
    fn test_teardown_releases_every_object() {
        let device = FakeDevice::new();
        {
            let mut context = RenderContext::new(device.clone(), &EngineConfig::default(), 64).unwrap();
            let buffer = context.upload_buffer(BufferUsage::Vertex, &[0u8; 12]).unwrap();
            context.cleanup().defer_drop(buffer);
            assert!(device.live_objects() > 0);
        }
        assert_eq!(device.live_objects(), 0);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_render_context_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<RenderContext>();
    }
}
