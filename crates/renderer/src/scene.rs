//! Scene lifetime.
//!
//! A scene owns GPU resources that any in-flight frame may still be reading,
//! so it is only dropped after the device is idle. [`SceneSlot`] holds at
//! most one scene and enforces that, and carries the pending
//! [`SceneRequest`] raised by input handling until the frame loop acts on it
//! between frames.

use tracing::info;

use kiln_rhi::RhiResult;
use kiln_rhi::gpu::GpuDevice;

/// Scene change requested for the next frame boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SceneRequest {
    /// Drop the current scene and load it again.
    Reload,
    /// Drop the current scene.
    Clear,
}

/// Holder for the active scene.
#[derive(Debug)]
pub struct SceneSlot<S> {
    scene: Option<S>,
    pending: Option<SceneRequest>,
}

impl<S> Default for SceneSlot<S> {
    fn default() -> Self {
        Self {
            scene: None,
            pending: None,
        }
    }
}

impl<S> SceneSlot<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `scene`, dropping the previous one after an idle wait.
    ///
    /// # Errors
    ///
    /// Returns the idle wait error; the previous scene is then kept.
    pub fn load<D: GpuDevice>(&mut self, device: &D, scene: S) -> RhiResult<()> {
        self.unload(device)?;
        self.scene = Some(scene);
        info!("Scene loaded");
        Ok(())
    }

    /// Drops the current scene once the device is idle.
    ///
    /// Does nothing, and does not wait, when no scene is loaded.
    ///
    /// # Errors
    ///
    /// Returns the idle wait error; the scene is then kept.
    pub fn unload<D: GpuDevice>(&mut self, device: &D) -> RhiResult<()> {
        if self.scene.is_none() {
            return Ok(());
        }
        device.wait_idle()?;
        self.scene = None;
        info!("Scene unloaded");
        Ok(())
    }

    #[inline]
    pub fn get(&self) -> Option<&S> {
        self.scene.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self) -> Option<&mut S> {
        self.scene.as_mut()
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.scene.is_some()
    }

    /// Records a request. A later request replaces an unhandled one.
    pub fn request(&mut self, request: SceneRequest) {
        self.pending = Some(request);
    }

    /// Takes the pending request, if any.
    pub fn take_request(&mut self) -> Option<SceneRequest> {
        self.pending.take()
    }
}
