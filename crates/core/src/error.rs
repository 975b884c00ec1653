//! Error types shared by the kiln crates that sit above the RHI.

use thiserror::Error;

/// Top-level error type for configuration, windowing and application setup.
#[derive(Error, Debug)]
pub enum Error {
    /// Vulkan failures surfaced outside the RHI (surface creation, extension queries)
    #[error("Vulkan error: {0}")]
    Vulkan(String),

    /// Window creation or management errors
    #[error("Window error: {0}")]
    Window(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed configuration file
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    /// Configuration values that parse but cannot be used
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

/// Result type alias using kiln's Error type.
pub type Result<T> = std::result::Result<T, Error>;
