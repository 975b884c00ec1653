//! GPU buffer management.
//!
//! # Overview
//!
//! - [`BufferUsage`] picks usage flags and a memory location for a role
//! - [`Buffer`] owns a `VkBuffer` and the memory bound to it
//!
//! Device-local buffers (vertex, index, storage) are filled through a staging
//! buffer and the immediate submission path; see `kiln_renderer::upload`.
//! Host-visible buffers (uniform, staging, readback) are written or read
//! directly.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kiln_rhi::buffer::{Buffer, BufferUsage};
//! use kiln_rhi::device::Device;
//!
//! # fn example(device: Arc<Device>) -> Result<(), kiln_rhi::RhiError> {
//! let vertices: [f32; 6] = [0.0, 0.5, -0.5, -0.5, 0.5, -0.5];
//! let staging: Buffer = Buffer::new_with_data(
//!     device,
//!     BufferUsage::Staging,
//!     bytemuck::cast_slice(&vertices),
//! )?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::gpu::{DeviceMemory, GpuDevice};

/// Role of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    /// Vertex data, device-local.
    Vertex,
    /// Index data, device-local.
    Index,
    /// Per-frame shader constants, host-visible.
    Uniform,
    /// General shader storage, device-local.
    Storage,
    /// Upload source, host-visible.
    Staging,
    /// Copy destination the host reads back.
    Readback,
}

impl BufferUsage {
    /// Converts to Vulkan buffer usage flags.
    pub fn to_vk_usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferUsage::Vertex => {
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Index => {
                vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Uniform => {
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC
            }
            BufferUsage::Storage => {
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::TRANSFER_SRC
            }
            BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
            BufferUsage::Readback => vk::BufferUsageFlags::TRANSFER_DST,
        }
    }

    /// Memory location for this role.
    pub fn memory_location(self) -> MemoryLocation {
        match self {
            BufferUsage::Vertex | BufferUsage::Index | BufferUsage::Storage => {
                MemoryLocation::GpuOnly
            }
            BufferUsage::Uniform | BufferUsage::Staging => MemoryLocation::CpuToGpu,
            BufferUsage::Readback => MemoryLocation::GpuToCpu,
        }
    }

    /// True when the host can map the memory.
    pub fn is_host_visible(self) -> bool {
        self.memory_location() != MemoryLocation::GpuOnly
    }

    /// Human-readable name, also used as the allocation name.
    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Vertex => "vertex",
            BufferUsage::Index => "index",
            BufferUsage::Uniform => "uniform",
            BufferUsage::Storage => "storage",
            BufferUsage::Staging => "staging",
            BufferUsage::Readback => "readback",
        }
    }
}

/// GPU buffer with bound memory.
///
/// Dropping the buffer destroys the handle and frees its memory immediately,
/// so a buffer still referenced by in-flight work must be handed to a
/// cleanup queue instead.
pub struct Buffer<D: GpuDevice = Device> {
    device: Arc<D>,
    buffer: vk::Buffer,
    /// Taken in `Drop`.
    memory: Option<D::Memory>,
    size: vk::DeviceSize,
    usage: BufferUsage,
}

impl<D: GpuDevice> Buffer<D> {
    /// Creates a buffer of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] for a zero size, or the device
    /// error if creation or allocation fails.
    pub fn new(device: Arc<D>, usage: BufferUsage, size: vk::DeviceSize) -> RhiResult<Self> {
        if size == 0 {
            return Err(RhiError::InvalidState(format!(
                "{} buffer of size 0",
                usage.name()
            )));
        }

        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage.to_vk_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let (buffer, memory) =
            device.create_buffer(&create_info, usage.memory_location(), usage.name())?;

        debug!("Created {} buffer ({} bytes)", usage.name(), size);

        Ok(Self {
            device,
            buffer,
            memory: Some(memory),
            size,
            usage,
        })
    }

    /// Creates a host-visible buffer initialized with `data`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] when `usage` is device-local.
    pub fn new_with_data(device: Arc<D>, usage: BufferUsage, data: &[u8]) -> RhiResult<Self> {
        if !usage.is_host_visible() {
            return Err(RhiError::InvalidState(format!(
                "{} buffers are device-local; upload through a staging buffer",
                usage.name()
            )));
        }
        let mut buffer = Self::new(device, usage, data.len() as vk::DeviceSize)?;
        buffer.write_data(0, data)?;
        Ok(buffer)
    }

    /// Writes `data` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::OutOfBounds`] if the write does not fit, or
    /// [`RhiError::InvalidState`] if the memory is not host-visible.
    pub fn write_data(&mut self, offset: vk::DeviceSize, data: &[u8]) -> RhiResult<()> {
        let end = offset.saturating_add(data.len() as vk::DeviceSize);
        if end > self.size {
            return Err(RhiError::OutOfBounds(format!(
                "write of {} bytes at {} into {} buffer of {} bytes",
                data.len(),
                offset,
                self.usage.name(),
                self.size
            )));
        }
        self.memory_mut()?.write_bytes(offset as usize, data)
    }

    /// Reads `out.len()` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`write_data`](Self::write_data).
    pub fn read_data(&self, offset: vk::DeviceSize, out: &mut [u8]) -> RhiResult<()> {
        let end = offset.saturating_add(out.len() as vk::DeviceSize);
        if end > self.size {
            return Err(RhiError::OutOfBounds(format!(
                "read of {} bytes at {} from {} buffer of {} bytes",
                out.len(),
                offset,
                self.usage.name(),
                self.size
            )));
        }
        self.memory()?.read_bytes(offset as usize, out)
    }

    /// Returns the Vulkan buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size requested at creation.
    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    fn memory(&self) -> RhiResult<&D::Memory> {
        self.memory
            .as_ref()
            .ok_or_else(|| RhiError::InvalidState("buffer memory already freed".to_string()))
    }

    fn memory_mut(&mut self) -> RhiResult<&mut D::Memory> {
        self.memory
            .as_mut()
            .ok_or_else(|| RhiError::InvalidState("buffer memory already freed".to_string()))
    }
}

impl<D: GpuDevice> Drop for Buffer<D> {
    fn drop(&mut self) {
        if let Some(memory) = self.memory.take() {
            self.device.destroy_buffer(self.buffer, memory);
        }
        debug!("Destroyed {} buffer", self.usage.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevice;

    #[test]
    fn test_buffer_usage_to_vk_usage() {
        assert!(
            BufferUsage::Vertex
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
        );
        assert!(
            BufferUsage::Uniform
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::UNIFORM_BUFFER)
        );
        assert_eq!(
            BufferUsage::Staging.to_vk_usage(),
            vk::BufferUsageFlags::TRANSFER_SRC
        );
        assert_eq!(
            BufferUsage::Readback.to_vk_usage(),
            vk::BufferUsageFlags::TRANSFER_DST
        );
    }

    #[test]
    fn test_buffer_usage_memory_location() {
        assert_eq!(BufferUsage::Vertex.memory_location(), MemoryLocation::GpuOnly);
        assert_eq!(BufferUsage::Index.memory_location(), MemoryLocation::GpuOnly);
        assert_eq!(BufferUsage::Uniform.memory_location(), MemoryLocation::CpuToGpu);
        assert_eq!(BufferUsage::Readback.memory_location(), MemoryLocation::GpuToCpu);
        assert!(!BufferUsage::Storage.is_host_visible());
        assert!(BufferUsage::Staging.is_host_visible());
    }

    #[test]
    fn test_buffer_usage_name() {
        assert_eq!(BufferUsage::Vertex.name(), "vertex");
        assert_eq!(BufferUsage::Readback.name(), "readback");
    }

    #[test]
    fn test_write_then_read_host_visible() {
        let device = FakeDevice::new();
        let mut buffer = Buffer::new(device, BufferUsage::Uniform, 16).unwrap();
        buffer.write_data(4, &[1, 2, 3, 4]).unwrap();

        let mut out = [0u8; 4];
        buffer.read_data(4, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_write_past_end_is_rejected() {
        let device = FakeDevice::new();
        let mut buffer = Buffer::new(device, BufferUsage::Staging, 8).unwrap();
        let err = buffer.write_data(6, &[0; 4]).unwrap_err();
        assert!(matches!(err, RhiError::OutOfBounds(_)));
    }

    #[test]
    fn test_device_local_rejects_initial_data() {
        let device = FakeDevice::new();
        let result = Buffer::new_with_data(device, BufferUsage::Vertex, &[0; 12]);
        assert!(matches!(result, Err(RhiError::InvalidState(_))));
    }

    #[test]
    fn test_zero_sized_buffer_rejected() {
        let device = FakeDevice::new();
        assert!(Buffer::new(device, BufferUsage::Storage, 0).is_err());
    }
}
