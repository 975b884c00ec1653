//! Descriptor set layouts and pool sizing.
//!
//! - [`DescriptorLayoutBuilder`] accumulates bindings and builds a
//!   [`DescriptorSetLayout`]
//! - [`PoolSizeRatio`] and [`pool_sizes`] turn a binding-kind mix into the
//!   per-type counts a pool is created with
//!
//! Allocation itself lives in [`descriptor_allocator`](crate::descriptor_allocator)
//! and writes in [`descriptor_writer`](crate::descriptor_writer).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use kiln_rhi::descriptor::{DescriptorLayoutBuilder, DescriptorSetLayout};
//! use kiln_rhi::device::Device;
//!
//! # fn example(device: Arc<Device>) -> Result<(), kiln_rhi::RhiError> {
//! let layout: DescriptorSetLayout = DescriptorLayoutBuilder::new()
//!     .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER)
//!     .add_binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
//!     .build(device, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use kiln_core::{BindingKind, BindingRatio};
use tracing::debug;

use crate::device::Device;
use crate::error::RhiResult;
use crate::gpu::GpuDevice;

/// Descriptor set layout.
///
/// Immutable after creation; share it through `Arc` when several owners
/// allocate against it.
pub struct DescriptorSetLayout<D: GpuDevice = Device> {
    device: Arc<D>,
    layout: vk::DescriptorSetLayout,
    binding_count: usize,
}

impl<D: GpuDevice> DescriptorSetLayout<D> {
    /// Creates a layout from explicit bindings.
    ///
    /// # Errors
    ///
    /// Returns an error if layout creation fails.
    pub fn new(device: Arc<D>, bindings: &[vk::DescriptorSetLayoutBinding<'_>]) -> RhiResult<Self> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        let layout = device.create_descriptor_set_layout(&create_info)?;

        debug!("Created descriptor set layout with {} binding(s)", bindings.len());

        Ok(Self {
            device,
            layout,
            binding_count: bindings.len(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    #[inline]
    pub fn binding_count(&self) -> usize {
        self.binding_count
    }
}

impl<D: GpuDevice> Drop for DescriptorSetLayout<D> {
    fn drop(&mut self) {
        self.device.destroy_descriptor_set_layout(self.layout);
        debug!("Destroyed descriptor set layout");
    }
}

/// Accumulates bindings for a layout.
///
/// Stage flags are supplied once at [`build`](Self::build) time and applied
/// to every binding.
#[derive(Clone, Debug, Default)]
pub struct DescriptorLayoutBuilder {
    bindings: Vec<(u32, vk::DescriptorType, u32)>,
}

impl DescriptorLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a single-descriptor binding.
    pub fn add_binding(self, binding: u32, ty: vk::DescriptorType) -> Self {
        self.add_array_binding(binding, ty, 1)
    }

    /// Adds a binding holding `count` descriptors.
    pub fn add_array_binding(mut self, binding: u32, ty: vk::DescriptorType, count: u32) -> Self {
        self.bindings.push((binding, ty, count));
        self
    }

    /// Removes every binding added so far.
    pub fn clear(&mut self) {
        self.bindings.clear();
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Binding descriptions with `stages` applied to each.
    pub fn bindings(
        &self,
        stages: vk::ShaderStageFlags,
    ) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        self.bindings
            .iter()
            .map(|&(binding, ty, count)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(ty)
                    .descriptor_count(count)
                    .stage_flags(stages)
            })
            .collect()
    }

    /// Creates the layout.
    ///
    /// # Errors
    ///
    /// Returns an error if layout creation fails.
    pub fn build<D: GpuDevice>(
        &self,
        device: Arc<D>,
        stages: vk::ShaderStageFlags,
    ) -> RhiResult<DescriptorSetLayout<D>> {
        DescriptorSetLayout::new(device, &self.bindings(stages))
    }
}

/// Descriptors of one type reserved per set of pool capacity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoolSizeRatio {
    pub ty: vk::DescriptorType,
    pub ratio: f32,
}

impl PoolSizeRatio {
    pub const fn new(ty: vk::DescriptorType, ratio: f32) -> Self {
        Self { ty, ratio }
    }
}

impl From<BindingRatio> for PoolSizeRatio {
    fn from(value: BindingRatio) -> Self {
        Self {
            ty: descriptor_type(value.kind),
            ratio: value.ratio,
        }
    }
}

/// Vulkan descriptor type for a configured binding kind.
pub fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::Sampler => vk::DescriptorType::SAMPLER,
        BindingKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        BindingKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        BindingKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        BindingKind::UniformBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        BindingKind::StorageBufferDynamic => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
    }
}

/// Per-type descriptor counts for a pool of `capacity` sets.
///
/// Each count is `ratio * capacity`, truncated, and never below one.
pub fn pool_sizes(capacity: u32, ratios: &[PoolSizeRatio]) -> Vec<vk::DescriptorPoolSize> {
    ratios
        .iter()
        .map(|r| {
            let count = (r.ratio * capacity as f32) as u32;
            vk::DescriptorPoolSize {
                ty: r.ty,
                descriptor_count: count.max(1),
            }
        })
        .collect()
}

/// Buffer range for a descriptor write.
pub fn buffer_info(
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
    range: vk::DeviceSize,
) -> vk::DescriptorBufferInfo {
    vk::DescriptorBufferInfo {
        buffer,
        offset,
        range,
    }
}

/// Image view, sampler and layout for a descriptor write.
pub fn image_info(
    view: vk::ImageView,
    sampler: vk::Sampler,
    layout: vk::ImageLayout,
) -> vk::DescriptorImageInfo {
    vk::DescriptorImageInfo {
        sampler,
        image_view: view,
        image_layout: layout,
    }
}
