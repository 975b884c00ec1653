//! Vulkan abstraction layer (Render Hardware Interface).
//!
//! This crate provides a safe abstraction over Vulkan using the `ash` crate.
//! It handles:
//! - Instance and device creation
//! - Swapchain management
//! - Command buffer recording
//! - Buffer and image management
//! - Descriptor layouts, pools and writes
//! - Synchronization primitives
//!
//! Every wrapper is generic over [`GpuDevice`] and defaults to the Vulkan
//! [`Device`]. The `testing` feature exposes [`testing::FakeDevice`], which
//! runs the same wrappers without a GPU.

mod error;

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod descriptor_allocator;
pub mod descriptor_writer;
pub mod device;
pub mod gpu;
pub mod image;
pub mod instance;
pub mod physical_device;
pub mod swapchain;
pub mod sync;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use buffer::{Buffer, BufferUsage};
pub use command::{CommandBuffer, CommandPool};
pub use descriptor::{DescriptorLayoutBuilder, DescriptorSetLayout, PoolSizeRatio};
pub use descriptor_allocator::DescriptorAllocator;
pub use descriptor_writer::DescriptorWriter;
pub use device::Device;
pub use error::{RhiError, RhiResult};
pub use gpu::{DeviceMemory, GpuDevice, QueueSubmit};
pub use image::{Image, ImageDesc};
pub use swapchain::{AcquireOutcome, PresentOutcome, PresentTarget, Swapchain};
pub use sync::{Fence, Semaphore};

// Re-export ash types that users might need
pub use ash::vk;
pub use gpu_allocator::MemoryLocation;
