//! Window and Vulkan surface.
//!
//! The window tracks its drawable size between resize events. A zero-area
//! size means the window is minimized and nothing can be presented to it.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::c_char;
use std::sync::Arc;
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window as WinitWindow, WindowAttributes};

use kiln_core::{Error, Result, WindowConfig};

/// Drawable size of a window in physical pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceSize {
    pub width: u32,
    pub height: u32,
}

impl SurfaceSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when either dimension is zero, as reported for minimized windows.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Width over height, or 1.0 for an empty size.
    pub fn aspect_ratio(&self) -> f32 {
        if self.is_empty() {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }

    pub fn to_extent(self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }
}

/// Owned `vk::SurfaceKHR`, destroyed on drop.
///
/// The instance it was created from must outlive it.
pub struct Surface {
    handle: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
}

impl Surface {
    /// Valid for as long as this `Surface` lives.
    #[inline]
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// Loader for capability, format and present mode queries.
    #[inline]
    pub fn loader(&self) -> &ash::khr::surface::Instance {
        &self.surface_loader
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        // SAFETY: the handle was created by ash_window::create_surface with the
        // instance this loader wraps, and is destroyed only here.
        unsafe {
            self.surface_loader.destroy_surface(self.handle, None);
        }
        tracing::debug!("Vulkan surface destroyed");
    }
}

/// A winit window plus the size kiln last saw for it.
pub struct Window {
    window: Arc<WinitWindow>,
    size: SurfaceSize,
    resized: bool,
}

impl Window {
    /// Creates a resizable window from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Window`] if winit cannot create the window.
    pub fn new(event_loop: &ActiveEventLoop, config: &WindowConfig) -> Result<Self> {
        let attrs = WindowAttributes::default()
            .with_title(config.title.as_str())
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .with_resizable(true);

        let window = event_loop
            .create_window(attrs)
            .map_err(|e| Error::Window(e.to_string()))?;

        let inner = window.inner_size();
        tracing::info!(
            "Window '{}' created: {}x{}",
            config.title,
            inner.width,
            inner.height
        );

        Ok(Self {
            window: Arc::new(window),
            size: SurfaceSize::new(inner.width, inner.height),
            resized: false,
        })
    }

    #[inline]
    pub fn inner(&self) -> &WinitWindow {
        &self.window
    }

    #[inline]
    pub fn size(&self) -> SurfaceSize {
        self.size
    }

    /// True while the window has no drawable area.
    #[inline]
    pub fn is_minimized(&self) -> bool {
        self.size.is_empty()
    }

    /// Records a resize event. Returns true if the size changed.
    pub fn resize(&mut self, width: u32, height: u32) -> bool {
        let size = SurfaceSize::new(width, height);
        if size == self.size {
            return false;
        }
        tracing::debug!("Window resized: {}x{}", width, height);
        self.size = size;
        self.resized = true;
        true
    }

    /// Returns whether a resize happened since the last call, and clears it.
    pub fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.resized)
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }

    /// Vulkan instance extensions needed to create a surface for this window.
    ///
    /// # Errors
    ///
    /// Returns an error if the display handle is unavailable or the platform
    /// has no Vulkan surface support.
    pub fn required_extensions(&self) -> Result<&'static [*const c_char]> {
        let display_handle = self
            .window
            .display_handle()
            .map_err(|e| Error::Window(format!("Failed to get display handle: {}", e)))?;

        ash_window::enumerate_required_extensions(display_handle.as_raw())
            .map_err(|e| Error::Vulkan(format!("Failed to query surface extensions: {}", e)))
    }

    /// Creates a Vulkan surface for this window.
    ///
    /// # Errors
    ///
    /// Returns an error if the raw handles are unavailable or surface
    /// creation fails.
    pub fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance) -> Result<Surface> {
        let display_handle = self
            .window
            .display_handle()
            .map_err(|e| Error::Window(format!("Failed to get display handle: {}", e)))?;

        let window_handle = self
            .window
            .window_handle()
            .map_err(|e| Error::Window(format!("Failed to get window handle: {}", e)))?;

        // SAFETY: entry and instance are valid for the call, the raw handles
        // come from a live winit window, and Surface::drop destroys the result.
        let handle = unsafe {
            ash_window::create_surface(
                entry,
                instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(|e| Error::Vulkan(format!("Failed to create Vulkan surface: {}", e)))?
        };

        let surface_loader = ash::khr::surface::Instance::new(entry, instance);

        tracing::info!("Vulkan surface created");

        Ok(Surface {
            handle,
            surface_loader,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_dimension_is_empty() {
        assert!(SurfaceSize::new(0, 720).is_empty());
        assert!(SurfaceSize::new(1280, 0).is_empty());
        assert!(!SurfaceSize::new(1, 1).is_empty());
    }

    #[test]
    fn test_aspect_ratio() {
        assert_eq!(SurfaceSize::new(1280, 640).aspect_ratio(), 2.0);
        assert_eq!(SurfaceSize::new(0, 0).aspect_ratio(), 1.0);
    }

    #[test]
    fn test_to_extent() {
        let extent = SurfaceSize::new(800, 600).to_extent();
        assert_eq!(extent.width, 800);
        assert_eq!(extent.height, 600);
    }
}
