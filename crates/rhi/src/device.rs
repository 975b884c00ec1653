//! Vulkan logical device, queues and memory allocation.
//!
//! # Overview
//!
//! [`Device`] owns the `ash::Device`, the graphics and present queues, and a
//! `gpu-allocator` [`Allocator`]. It is the production implementation of
//! [`GpuDevice`]; every wrapper in this crate holds it behind an `Arc`.
//!
//! Vulkan 1.3 is required: `synchronization2` backs the barrier and submit
//! paths, and `dynamic_rendering` is what render passes outside this crate
//! record against.
//!
//! # Example
//!
//! ```no_run
//! use kiln_rhi::instance::Instance;
//! use kiln_rhi::physical_device::select_physical_device;
//! use kiln_rhi::device::Device;
//! use kiln_rhi::GpuDevice;
//! use ash::vk;
//!
//! # fn example(surface: vk::SurfaceKHR) -> Result<(), kiln_rhi::RhiError> {
//! let instance = Instance::new(false)?;
//! let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
//! let gpu = select_physical_device(instance.handle(), surface, &surface_loader)?;
//! let device = Device::new(&instance, &gpu)?;
//! device.wait_idle()?;
//! # Ok(())
//! # }
//! ```

use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use tracing::{debug, error, info};

use crate::error::{RhiError, RhiResult};
use crate::gpu::{DeviceMemory, GpuDevice, QueueSubmit, timeout_nanos};
use crate::instance::Instance;
use crate::physical_device::{PhysicalDeviceInfo, QueueFamilyIndices};

/// Required device extensions.
const DEVICE_EXTENSIONS: &[&std::ffi::CStr] = &[ash::khr::swapchain::NAME];

/// Vulkan logical device wrapper.
///
/// # Thread Safety
///
/// Shared across threads through `Arc`. The allocator sits behind a `Mutex`;
/// queue submission is only issued from the thread driving the frame loop.
pub struct Device {
    /// Vulkan logical device handle.
    device: ash::Device,
    /// Physical device handle.
    physical_device: vk::PhysicalDevice,
    /// GPU memory allocator, dropped before the device in `Drop`.
    allocator: ManuallyDrop<Mutex<Allocator>>,
    /// Graphics queue, also used for transfers and immediate submissions.
    graphics_queue: vk::Queue,
    /// Presentation queue.
    present_queue: vk::Queue,
    /// Queue family indices.
    queue_families: QueueFamilyIndices,
}

impl Device {
    /// Creates the logical device and its allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if the selected GPU lacks a graphics or present
    /// family, device creation fails, or the allocator cannot initialize.
    pub fn new(
        instance: &Instance,
        physical_device_info: &PhysicalDeviceInfo,
    ) -> RhiResult<Arc<Self>> {
        let queue_families = physical_device_info.queue_families;
        let (graphics_family, present_family) = match (
            queue_families.graphics_family,
            queue_families.present_family,
        ) {
            (Some(graphics), Some(present)) => (graphics, present),
            _ => return Err(RhiError::NoSuitableGpu),
        };

        let unique_families = queue_families.unique_families();
        let queue_priorities = [1.0f32];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let mut features_1_2 = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .descriptor_indexing(true);

        let mut features_1_3 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(true);

        let extension_names: Vec<*const std::ffi::c_char> =
            DEVICE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features)
            .push_next(&mut features_1_2)
            .push_next(&mut features_1_3);

        let device = unsafe {
            instance
                .handle()
                .create_device(physical_device_info.device, &create_info, None)?
        };

        info!(
            "Logical device created on '{}' ({} queue famil{})",
            physical_device_info.device_name(),
            unique_families.len(),
            if unique_families.len() == 1 { "y" } else { "ies" }
        );

        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_family, 0) };
        debug!(
            "Queues retrieved: graphics family {}, present family {}",
            graphics_family, present_family
        );

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: physical_device_info.device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;

        info!("GPU memory allocator initialized");

        Ok(Arc::new(Self {
            device,
            physical_device: physical_device_info.device,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            graphics_queue,
            present_queue,
            queue_families,
        }))
    }

    /// Returns the `ash` device for recording commands this crate does not wrap.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// Returns the physical device handle.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Returns the graphics queue handle.
    #[inline]
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Returns the presentation queue handle.
    #[inline]
    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Returns the queue family indices.
    #[inline]
    pub fn queue_families(&self) -> &QueueFamilyIndices {
        &self.queue_families
    }

    fn lock_allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn graphics_family(&self) -> u32 {
        self.queue_families.graphics_family.unwrap_or_default()
    }

    fn free_allocation(&self, allocation: Allocation) {
        if let Err(e) = self.lock_allocator().free(allocation) {
            error!("Failed to free allocation: {:?}", e);
        }
    }
}

impl GpuDevice for Device {
    type Memory = Allocation;

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.create_fence(&info, None)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: Duration) -> RhiResult<()> {
        match unsafe {
            self.device
                .wait_for_fences(fences, true, timeout_nanos(timeout))
        } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RhiError::Timeout {
                operation: "fence",
                waited: timeout,
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()> {
        unsafe { self.device.reset_fences(fences)? };
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool> {
        Ok(unsafe { self.device.get_fence_status(fence)? })
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device.create_semaphore(&info, None)? })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn create_command_pool(
        &self,
        flags: vk::CommandPoolCreateFlags,
    ) -> RhiResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.graphics_family())
            .flags(flags);
        Ok(unsafe { self.device.create_command_pool(&info, None)? })
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        Ok(unsafe { self.device.allocate_command_buffers(&info)? })
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?
        };
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> RhiResult<()> {
        let info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.device.begin_command_buffer(command_buffer, &info)? };
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer)? };
        Ok(())
    }

    fn queue_submit(&self, submit: &QueueSubmit) -> RhiResult<()> {
        let command_buffers =
            [vk::CommandBufferSubmitInfo::default().command_buffer(submit.command_buffer)];

        let wait_infos: Vec<vk::SemaphoreSubmitInfo> = submit
            .wait
            .iter()
            .map(|&(semaphore, stage)| semaphore_submit_info(semaphore, stage))
            .collect();
        let signal_infos: Vec<vk::SemaphoreSubmitInfo> = submit
            .signal
            .iter()
            .map(|&(semaphore, stage)| semaphore_submit_info(semaphore, stage))
            .collect();

        let info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&signal_infos);

        unsafe {
            self.device
                .queue_submit2(self.graphics_queue, &[info], submit.fence)?
        };
        Ok(())
    }

    fn cmd_pipeline_barrier2(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency: &vk::DependencyInfo<'_>,
    ) {
        unsafe { self.device.cmd_pipeline_barrier2(command_buffer, dependency) };
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(command_buffer, src, dst, regions) };
    }

    fn cmd_fill_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        dst: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    ) {
        unsafe {
            self.device
                .cmd_fill_buffer(command_buffer, dst, offset, size, data)
        };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(command_buffer, src, dst, dst_layout, regions)
        };
    }

    fn cmd_blit_image2(&self, command_buffer: vk::CommandBuffer, info: &vk::BlitImageInfo2<'_>) {
        unsafe { self.device.cmd_blit_image2(command_buffer, info) };
    }

    fn cmd_clear_color_image(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        unsafe {
            self.device
                .cmd_clear_color_image(command_buffer, image, layout, color, ranges)
        };
    }

    fn create_descriptor_set_layout(
        &self,
        info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> RhiResult<vk::DescriptorSetLayout> {
        Ok(unsafe { self.device.create_descriptor_set_layout(info, None)? })
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        Ok(unsafe { self.device.create_descriptor_pool(&info, None)? })
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())?
        };
        Ok(())
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info)? };
        sets.into_iter()
            .next()
            .ok_or(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        unsafe { self.device.update_descriptor_sets(writes, &[]) };
    }

    fn create_buffer(
        &self,
        info: &vk::BufferCreateInfo<'_>,
        location: MemoryLocation,
        name: &str,
    ) -> RhiResult<(vk::Buffer, Allocation)> {
        let buffer = unsafe { self.device.create_buffer(info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self.lock_allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            self.free_allocation(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        Ok((buffer, allocation))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, memory: Allocation) {
        self.free_allocation(memory);
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn create_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        name: &str,
    ) -> RhiResult<(vk::Image, Allocation)> {
        let image = unsafe { self.device.create_image(info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = self.lock_allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: info.tiling == vk::ImageTiling::LINEAR,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e.into());
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            self.free_allocation(allocation);
            unsafe { self.device.destroy_image(image, None) };
            return Err(e.into());
        }

        Ok((image, allocation))
    }

    fn destroy_image(&self, image: vk::Image, memory: Allocation) {
        self.free_allocation(memory);
        unsafe { self.device.destroy_image(image, None) };
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> RhiResult<vk::ImageView> {
        Ok(unsafe { self.device.create_image_view(info, None)? })
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }
}

fn semaphore_submit_info(
    semaphore: vk::Semaphore,
    stage: vk::PipelineStageFlags2,
) -> vk::SemaphoreSubmitInfo<'static> {
    vk::SemaphoreSubmitInfo::default()
        .semaphore(semaphore)
        .stage_mask(stage)
        .value(1)
}

impl DeviceMemory for Allocation {
    fn size(&self) -> u64 {
        Allocation::size(self)
    }

    fn write_bytes(&mut self, offset: usize, data: &[u8]) -> RhiResult<()> {
        let mapped = self
            .mapped_slice_mut()
            .ok_or_else(|| RhiError::InvalidState("memory is not host visible".to_string()))?;
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= mapped.len())
            .ok_or_else(|| {
                RhiError::OutOfBounds(format!(
                    "write of {} bytes at {} exceeds mapping of {} bytes",
                    data.len(),
                    offset,
                    mapped.len()
                ))
            })?;
        mapped[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn read_bytes(&self, offset: usize, out: &mut [u8]) -> RhiResult<()> {
        let mapped = self
            .mapped_slice()
            .ok_or_else(|| RhiError::InvalidState("memory is not host visible".to_string()))?;
        let end = offset
            .checked_add(out.len())
            .filter(|&end| end <= mapped.len())
            .ok_or_else(|| {
                RhiError::OutOfBounds(format!(
                    "read of {} bytes at {} exceeds mapping of {} bytes",
                    out.len(),
                    offset,
                    mapped.len()
                ))
            })?;
        out.copy_from_slice(&mapped[offset..end]);
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle during drop: {:?}", e);
            }
            // Memory blocks are released through the device, so the allocator goes first.
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        info!("Logical device destroyed");
    }
}

// Safety: ash::Device is Send+Sync, queue and physical device handles are plain
// handles, and the allocator is behind a Mutex.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_extensions_include_swapchain() {
        assert!(DEVICE_EXTENSIONS.contains(&ash::khr::swapchain::NAME));
    }

    #[test]
    fn test_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Device>();
    }

    #[test]
    fn test_allocation_is_device_memory() {
        fn assert_memory<T: DeviceMemory>() {}
        assert_memory::<Allocation>();
    }
}
