//! Frame pipeline and resource lifetimes.
//!
//! This crate drives the GPU on top of `kiln_rhi`:
//! - Double-buffered frame submission and presentation
//! - Deferred destruction scoped to a frame or the session
//! - Blocking uploads through a dedicated submission path
//! - Scene lifetime across reloads

pub mod cleanup;
pub mod context;
pub mod frame;
pub mod immediate;
pub mod pass;
pub mod scene;
pub mod upload;

pub use cleanup::CleanupQueue;
pub use context::RenderContext;
pub use frame::{FrameController, FrameOutcome, SlotState};
pub use immediate::ImmediateSubmitter;
pub use pass::{FrameContext, ImageAccess, ImageRef, RenderPass};
pub use scene::{SceneRequest, SceneSlot};

use kiln_rhi::RhiError;

/// Number of frames that can be in flight simultaneously.
pub const FRAME_OVERLAP: usize = 2;

/// Names the operation in a timeout raised by a fence wait.
pub(crate) fn label_timeout(operation: &'static str) -> impl FnOnce(RhiError) -> RhiError {
    move |e| match e {
        RhiError::Timeout { waited, .. } => RhiError::Timeout { operation, waited },
        other => other,
    }
}
