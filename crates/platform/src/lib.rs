//! Platform abstraction layer for kiln.
//!
//! This crate provides:
//! - Window creation and size tracking (winit)
//! - Vulkan surface creation (ash-window)
//! - Keyboard bindings for the demo loop

pub mod input;
pub mod window;

pub use input::{Action, InputState, KeyCode};
pub use window::{Surface, SurfaceSize, Window};
