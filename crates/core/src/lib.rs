//! Core utilities for kiln.
//!
//! This crate provides foundational types used across the workspace:
//! - Error types and result aliases
//! - Logging initialization
//! - Startup configuration

mod config;
mod error;
mod logging;

pub use config::{
    BindingKind, BindingRatio, DescriptorConfig, DescriptorPoolConfig, EngineConfig,
    TimeoutConfig, WindowConfig,
};
pub use error::{Error, Result};
pub use logging::{DEFAULT_LOG_FILTER, init_logging, init_logging_with};
