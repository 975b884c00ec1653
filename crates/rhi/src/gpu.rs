//! The device seam every RHI wrapper is written against.
//!
//! [`GpuDevice`] is the narrow set of device-level entry points the resource
//! wrappers, descriptor allocator and frame pipeline actually need. The Vulkan
//! [`Device`](crate::device::Device) implements it on top of `ash` and
//! `gpu-allocator`; the `testing` feature adds an in-process fake that
//! models fence, semaphore and pool semantics so the synchronization protocol
//! can be exercised without a GPU.
//!
//! Handles are plain `ash::vk` handle types in both implementations, so code
//! above this seam reads the same either way.

use std::time::Duration;

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::error::RhiResult;

/// Host access to memory bound to a buffer or image.
///
/// Only host-visible memory can be written or read; device-local memory
/// returns [`RhiError::InvalidState`](crate::RhiError::InvalidState).
pub trait DeviceMemory: Send + Sync + 'static {
    /// Size of the backing allocation in bytes.
    fn size(&self) -> u64;

    /// Copies `data` into the mapped range at `offset`.
    fn write_bytes(&mut self, offset: usize, data: &[u8]) -> RhiResult<()>;

    /// Copies the mapped range at `offset` into `out`.
    fn read_bytes(&self, offset: usize, out: &mut [u8]) -> RhiResult<()>;
}

/// One command buffer submission on the graphics queue.
#[derive(Clone, Copy, Debug)]
pub struct QueueSubmit {
    pub command_buffer: vk::CommandBuffer,
    /// Binary semaphore to wait on, and the stages that wait for it.
    pub wait: Option<(vk::Semaphore, vk::PipelineStageFlags2)>,
    /// Binary semaphore to signal, and the stages that must finish first.
    pub signal: Option<(vk::Semaphore, vk::PipelineStageFlags2)>,
    /// Fence signaled once the whole batch has executed.
    pub fence: vk::Fence,
}

impl QueueSubmit {
    /// A self-contained submission with no semaphore ordering.
    pub fn standalone(command_buffer: vk::CommandBuffer, fence: vk::Fence) -> Self {
        Self {
            command_buffer,
            wait: None,
            signal: None,
            fence,
        }
    }
}

/// Device-level operations used by kiln.
///
/// Methods mirror the Vulkan calls they wrap. Creation functions return
/// handles; destruction functions consume them. Recording functions
/// (`cmd_*`) must be called between `begin_command_buffer` and
/// `end_command_buffer`.
pub trait GpuDevice: Send + Sync + 'static {
    /// Memory bound to buffers and images created by this device.
    type Memory: DeviceMemory;

    // =========================================================================
    // Synchronization
    // =========================================================================

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence>;

    fn destroy_fence(&self, fence: vk::Fence);

    /// Blocks until every fence is signaled.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Timeout`](crate::RhiError::Timeout) when `timeout`
    /// expires first.
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: Duration) -> RhiResult<()>;

    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()>;

    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool>;

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore>;

    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Blocks until all queues are idle.
    fn wait_idle(&self) -> RhiResult<()>;

    // =========================================================================
    // Command Buffers
    // =========================================================================

    /// Creates a command pool on the graphics queue family.
    fn create_command_pool(&self, flags: vk::CommandPoolCreateFlags)
    -> RhiResult<vk::CommandPool>;

    fn destroy_command_pool(&self, pool: vk::CommandPool);

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>>;

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> RhiResult<()>;

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;

    /// Submits one batch to the graphics queue.
    fn queue_submit(&self, submit: &QueueSubmit) -> RhiResult<()>;

    // =========================================================================
    // Recording
    // =========================================================================

    fn cmd_pipeline_barrier2(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency: &vk::DependencyInfo<'_>,
    );

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    fn cmd_fill_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        dst: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    );

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    fn cmd_blit_image2(&self, command_buffer: vk::CommandBuffer, info: &vk::BlitImageInfo2<'_>);

    fn cmd_clear_color_image(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    );

    // =========================================================================
    // Descriptors
    // =========================================================================

    fn create_descriptor_set_layout(
        &self,
        info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> RhiResult<vk::DescriptorSetLayout>;

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<vk::DescriptorPool>;

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Returns every set allocated from `pool` to it at once.
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()>;

    /// Allocates one set.
    ///
    /// # Errors
    ///
    /// Pool exhaustion surfaces as `VulkanError(ERROR_OUT_OF_POOL_MEMORY)` or
    /// `VulkanError(ERROR_FRAGMENTED_POOL)` so callers can fall back to
    /// another pool.
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet>;

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]);

    // =========================================================================
    // Resources
    // =========================================================================

    /// Creates a buffer and binds freshly allocated memory to it.
    fn create_buffer(
        &self,
        info: &vk::BufferCreateInfo<'_>,
        location: MemoryLocation,
        name: &str,
    ) -> RhiResult<(vk::Buffer, Self::Memory)>;

    fn destroy_buffer(&self, buffer: vk::Buffer, memory: Self::Memory);

    /// Creates an image backed by device-local memory.
    fn create_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        name: &str,
    ) -> RhiResult<(vk::Image, Self::Memory)>;

    fn destroy_image(&self, image: vk::Image, memory: Self::Memory);

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> RhiResult<vk::ImageView>;

    fn destroy_image_view(&self, view: vk::ImageView);
}

/// Converts a wait bound to the nanosecond count Vulkan expects.
#[inline]
pub fn timeout_nanos(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}
