//! Startup configuration.
//!
//! The configuration is read once at startup from a TOML file and handed to the
//! subsystems that need it. Every section has defaults, so an empty file (or no
//! file at all) yields a working setup.
//!
//! # Example
//!
//! ```
//! use kiln_core::EngineConfig;
//!
//! let config = EngineConfig::from_toml_str(
//!     r#"
//!     [window]
//!     width = 800
//!     height = 600
//!
//!     [timeouts]
//!     frame_fence_ms = 500
//!     "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.window.width, 800);
//! assert_eq!(config.timeouts.frame_fence_ms, 500);
//! assert_eq!(config.timeouts.immediate_ms, 10_000);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::logging::DEFAULT_LOG_FILTER;

/// Kind of shader binding a descriptor pool reserves room for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingKind {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformBuffer,
    StorageBuffer,
    UniformBufferDynamic,
    StorageBufferDynamic,
}

/// How many descriptors of one kind a pool holds per set of capacity.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct BindingRatio {
    pub kind: BindingKind,
    pub ratio: f32,
}

impl BindingRatio {
    pub const fn new(kind: BindingKind, ratio: f32) -> Self {
        Self { kind, ratio }
    }
}

/// Sizing for one descriptor allocator.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct DescriptorPoolConfig {
    /// Number of sets the first pool is created with.
    pub initial_sets: u32,
    /// Binding-kind mix every pool of this allocator is built with.
    pub ratios: Vec<BindingRatio>,
}

impl DescriptorPoolConfig {
    /// Sizing for long-lived, scene-level sets.
    pub fn global() -> Self {
        Self {
            initial_sets: 10,
            ratios: vec![
                BindingRatio::new(BindingKind::CombinedImageSampler, 20.0),
                BindingRatio::new(BindingKind::StorageImage, 5.0),
                BindingRatio::new(BindingKind::UniformBuffer, 5.0),
                BindingRatio::new(BindingKind::StorageBuffer, 10.0),
            ],
        }
    }

    /// Sizing for the allocators owned by each frame slot.
    pub fn per_frame() -> Self {
        Self {
            initial_sets: 1000,
            ratios: vec![
                BindingRatio::new(BindingKind::StorageImage, 3.0),
                BindingRatio::new(BindingKind::StorageBuffer, 3.0),
                BindingRatio::new(BindingKind::UniformBuffer, 3.0),
                BindingRatio::new(BindingKind::CombinedImageSampler, 4.0),
            ],
        }
    }
}

/// Descriptor allocator sizing for the global and per-frame scopes.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct DescriptorConfig {
    pub global: DescriptorPoolConfig,
    pub per_frame: DescriptorPoolConfig,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            global: DescriptorPoolConfig::global(),
            per_frame: DescriptorPoolConfig::per_frame(),
        }
    }
}

/// Bounds on the blocking waits of the frame pipeline.
///
/// Exceeding any of these is treated as device loss.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Wait on a frame slot's completion fence.
    pub frame_fence_ms: u64,
    /// Wait for a presentable image.
    pub acquire_ms: u64,
    /// Wait on the immediate submission fence.
    pub immediate_ms: u64,
}

impl TimeoutConfig {
    #[inline]
    pub fn frame_fence(&self) -> Duration {
        Duration::from_millis(self.frame_fence_ms)
    }

    #[inline]
    pub fn acquire(&self) -> Duration {
        Duration::from_millis(self.acquire_ms)
    }

    #[inline]
    pub fn immediate(&self) -> Duration {
        Duration::from_millis(self.immediate_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            frame_fence_ms: 1_000,
            acquire_ms: 1_000,
            immediate_ms: 10_000,
        }
    }
}

/// Initial window parameters.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
    /// Present with FIFO. When false, MAILBOX or IMMEDIATE are used if available.
    pub vsync: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            title: "kiln".to_string(),
            vsync: true,
        }
    }
}

/// Complete startup configuration.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub window: WindowConfig,
    pub descriptors: DescriptorConfig,
    pub timeouts: TimeoutConfig,
    /// Enable the Khronos validation layer when it is installed.
    pub validation: bool,
    /// Fallback `tracing` filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            descriptors: DescriptorConfig::default(),
            timeouts: TimeoutConfig::default(),
            validation: cfg!(debug_assertions),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for malformed TOML and [`Error::InvalidConfig`]
    /// for values the renderer cannot run with.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration at `path`, or the defaults if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (scope, pools) in [
            ("global", &self.descriptors.global),
            ("per_frame", &self.descriptors.per_frame),
        ] {
            if pools.initial_sets == 0 {
                return Err(Error::InvalidConfig(format!(
                    "descriptors.{scope}.initial_sets must be greater than 0"
                )));
            }
            if let Some(bad) = pools.ratios.iter().find(|r| !(r.ratio > 0.0)) {
                return Err(Error::InvalidConfig(format!(
                    "descriptors.{scope}: ratio for {:?} must be positive",
                    bad.kind
                )));
            }
        }

        if self.timeouts.frame_fence_ms == 0 || self.timeouts.immediate_ms == 0 {
            return Err(Error::InvalidConfig(
                "fence timeouts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
