//! Command pool and command buffer management.
//!
//! # Overview
//!
//! - [`CommandPool`] owns a `VkCommandPool` on the graphics family and hands
//!   out [`CommandBuffer`]s
//! - [`CommandBuffer`] records the commands kiln uses: synchronization2
//!   barriers, buffer and image copies, blits and clears
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kiln_rhi::command::CommandPool;
//! use kiln_rhi::device::Device;
//! use ash::vk;
//!
//! # fn example(device: Arc<Device>, image: vk::Image) -> Result<(), kiln_rhi::RhiError> {
//! let pool: CommandPool = CommandPool::new(device)?;
//! let cmd = pool.allocate_command_buffer()?;
//!
//! cmd.begin()?;
//! cmd.transition_image(
//!     image,
//!     vk::ImageLayout::UNDEFINED,
//!     vk::ImageLayout::TRANSFER_DST_OPTIMAL,
//! );
//! cmd.end()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::gpu::GpuDevice;

/// Command pool on the graphics queue family.
///
/// # Thread Safety
///
/// Command pools are externally synchronized. Each frame slot and the
/// immediate submitter own their own pool.
pub struct CommandPool<D: GpuDevice = Device> {
    device: Arc<D>,
    pool: vk::CommandPool,
}

impl<D: GpuDevice> CommandPool<D> {
    /// Creates a pool whose buffers can be reset individually.
    ///
    /// # Errors
    ///
    /// Returns an error if command pool creation fails.
    pub fn new(device: Arc<D>) -> RhiResult<Self> {
        Self::with_flags(device, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
    }

    /// Creates a pool for short-lived, one-shot command buffers.
    ///
    /// # Errors
    ///
    /// Returns an error if command pool creation fails.
    pub fn new_transient(device: Arc<D>) -> RhiResult<Self> {
        Self::with_flags(
            device,
            vk::CommandPoolCreateFlags::TRANSIENT
                | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )
    }

    fn with_flags(device: Arc<D>, flags: vk::CommandPoolCreateFlags) -> RhiResult<Self> {
        let pool = device.create_command_pool(flags)?;
        debug!("Command pool created ({:?})", flags);
        Ok(Self { device, pool })
    }

    /// Returns the Vulkan command pool handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Allocates one primary command buffer.
    ///
    /// The buffer is freed together with the pool, so it must not be used
    /// after the pool is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails.
    pub fn allocate_command_buffer(&self) -> RhiResult<CommandBuffer<D>> {
        let buffer = self
            .device
            .allocate_command_buffers(self.pool, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                RhiError::InvalidState("command buffer allocation returned nothing".to_string())
            })?;
        Ok(CommandBuffer {
            device: self.device.clone(),
            buffer,
        })
    }
}

impl<D: GpuDevice> Drop for CommandPool<D> {
    fn drop(&mut self) {
        self.device.destroy_command_pool(self.pool);
        debug!("Command pool destroyed");
    }
}

/// Primary command buffer.
///
/// Commands are recorded between [`begin`](Self::begin) and
/// [`end`](Self::end). The wrapper does not own the handle; it is released
/// by the [`CommandPool`] it came from.
pub struct CommandBuffer<D: GpuDevice = Device> {
    device: Arc<D>,
    buffer: vk::CommandBuffer,
}

impl<D: GpuDevice> CommandBuffer<D> {
    /// Returns the raw Vulkan command buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// Returns the device this buffer records against.
    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    // =========================================================================
    // Recording Control
    // =========================================================================

    /// Begins recording for a single submission.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is already recording or still pending.
    pub fn begin(&self) -> RhiResult<()> {
        self.device
            .begin_command_buffer(self.buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
    }

    /// Ends recording. The buffer is then ready for submission.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is not recording.
    pub fn end(&self) -> RhiResult<()> {
        self.device.end_command_buffer(self.buffer)
    }

    /// Returns the buffer to the initial state so it can be recorded again.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset fails.
    pub fn reset(&self) -> RhiResult<()> {
        self.device.reset_command_buffer(self.buffer)
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Records a synchronization2 pipeline barrier.
    pub fn pipeline_barrier2(&self, dependency: &vk::DependencyInfo<'_>) {
        self.device.cmd_pipeline_barrier2(self.buffer, dependency);
    }

    /// Moves every mip level and layer of `image` from `from` to `to`.
    ///
    /// The barrier covers all commands on both sides. The aspect is depth
    /// when `to` is a depth layout and color otherwise.
    pub fn transition_image(&self, image: vk::Image, from: vk::ImageLayout, to: vk::ImageLayout) {
        self.transition_image_aspect(image, from, to, aspect_for_layout(to));
    }

    /// Like [`transition_image`](Self::transition_image) with an explicit aspect.
    pub fn transition_image_aspect(
        &self,
        image: vk::Image,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
        aspect: vk::ImageAspectFlags,
    ) {
        let barrier = [vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ)
            .old_layout(from)
            .new_layout(to)
            .image(image)
            .subresource_range(full_subresource_range(aspect))];

        let dependency = vk::DependencyInfo::default().image_memory_barriers(&barrier);
        self.pipeline_barrier2(&dependency);
    }

    // =========================================================================
    // Transfer
    // =========================================================================

    /// Copies regions between two buffers.
    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.device.cmd_copy_buffer(self.buffer, src, dst, regions);
    }

    /// Fills `size` bytes of `dst` at `offset` with the repeated word `data`.
    pub fn fill_buffer(
        &self,
        dst: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    ) {
        self.device
            .cmd_fill_buffer(self.buffer, dst, offset, size, data);
    }

    /// Copies buffer regions into an image in `dst_layout`.
    pub fn copy_buffer_to_image(
        &self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.device
            .cmd_copy_buffer_to_image(self.buffer, src, dst, dst_layout, regions);
    }

    /// Records a blit.
    pub fn blit(&self, info: &vk::BlitImageInfo2<'_>) {
        self.device.cmd_blit_image2(self.buffer, info);
    }

    /// Blits the color contents of `src` onto `dst`, scaling with a linear filter.
    ///
    /// `src` must be in `TRANSFER_SRC_OPTIMAL` and `dst` in
    /// `TRANSFER_DST_OPTIMAL`.
    pub fn copy_image_to_image(
        &self,
        src: vk::Image,
        dst: vk::Image,
        src_size: vk::Extent2D,
        dst_size: vk::Extent2D,
    ) {
        let subresource = vk::ImageSubresourceLayers::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .mip_level(0)
            .base_array_layer(0)
            .layer_count(1);

        let region = [vk::ImageBlit2::default()
            .src_subresource(subresource)
            .src_offsets([vk::Offset3D::default(), far_corner(src_size)])
            .dst_subresource(subresource)
            .dst_offsets([vk::Offset3D::default(), far_corner(dst_size)])];

        let info = vk::BlitImageInfo2::default()
            .src_image(src)
            .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .dst_image(dst)
            .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .filter(vk::Filter::LINEAR)
            .regions(&region);

        self.blit(&info);
    }

    /// Clears every mip level and layer of a color image.
    pub fn clear_color_image(
        &self,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
    ) {
        let ranges = [full_subresource_range(vk::ImageAspectFlags::COLOR)];
        self.device
            .cmd_clear_color_image(self.buffer, image, layout, color, &ranges);
    }
}

/// Aspect implied by the layout an image is moved into.
pub fn aspect_for_layout(layout: vk::ImageLayout) -> vk::ImageAspectFlags {
    match layout {
        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

fn full_subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect)
        .base_mip_level(0)
        .level_count(vk::REMAINING_MIP_LEVELS)
        .base_array_layer(0)
        .layer_count(vk::REMAINING_ARRAY_LAYERS)
}

fn far_corner(size: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: size.width as i32,
        y: size.height as i32,
        z: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevice;

    #[test]
    fn test_command_buffer_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CommandBuffer>();
        assert_send::<CommandPool>();
    }

    #[test]
    fn test_aspect_for_layout() {
        assert_eq!(
            aspect_for_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            aspect_for_layout(vk::ImageLayout::PRESENT_SRC_KHR),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn test_far_corner_is_exclusive_extent() {
        let corner = far_corner(vk::Extent2D {
            width: 640,
            height: 480,
        });
        assert_eq!((corner.x, corner.y, corner.z), (640, 480, 1));
    }

    #[test]
    fn test_transition_records_barrier() {
        let device = FakeDevice::new();
        let pool = CommandPool::new(device.clone()).unwrap();
        let cmd = pool.allocate_command_buffer().unwrap();
        let image = vk::Image::null();

        cmd.begin().unwrap();
        cmd.transition_image(
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        );
        cmd.end().unwrap();

        let barriers = device.barriers();
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barriers[0].new_layout, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL);
        assert_eq!(barriers[0].aspect, vk::ImageAspectFlags::DEPTH);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_recording_outside_begin_is_flagged() {
        let device = FakeDevice::new();
        let pool = CommandPool::new(device.clone()).unwrap();
        let cmd = pool.allocate_command_buffer().unwrap();

        cmd.fill_buffer(vk::Buffer::null(), 0, 4, 7);
        assert_eq!(device.violations().len(), 1);
    }
}
