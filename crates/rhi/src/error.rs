//! RHI-specific error types.

use std::time::Duration;

use ash::vk;
use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] vk::Result),

    /// Failed to load Vulkan
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// Surface creation or query error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// A bounded wait on the GPU expired
    #[error("Timed out after {waited:?} waiting for {operation}")]
    Timeout {
        operation: &'static str,
        waited: Duration,
    },

    /// A descriptor allocation failed on a fresh pool after one retry
    #[error("Descriptor pool exhausted after retry (sets per pool: {sets_per_pool})")]
    DescriptorPoolExhausted { sets_per_pool: u32 },

    /// An object was used outside the state it supports
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A host access fell outside a mapped range
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),
}

impl RhiError {
    /// Returns true for device-loss-class failures.
    ///
    /// These have no recovery path at this layer; the frame driver is
    /// expected to tear down and terminate when it sees one.
    pub fn is_fatal(&self) -> bool {
        match self {
            RhiError::Timeout { .. } | RhiError::DescriptorPoolExhausted { .. } => true,
            RhiError::VulkanError(result) => matches!(
                *result,
                vk::Result::ERROR_DEVICE_LOST
                    | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
                    | vk::Result::ERROR_OUT_OF_HOST_MEMORY
            ),
            _ => false,
        }
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;
