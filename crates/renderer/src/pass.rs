//! The interface rendering passes are written against.
//!
//! A [`RenderPass`] declares which images it touches and in which layout
//! ([`ImageAccess`]); the frame controller inserts the transitions before
//! calling [`RenderPass::record`]. Passes only see a [`FrameContext`], which
//! holds per-frame state and nothing that could block on the GPU.

use ash::vk;

use kiln_rhi::buffer::Buffer;
use kiln_rhi::command::CommandBuffer;
use kiln_rhi::descriptor_allocator::DescriptorAllocator;
use kiln_rhi::device::Device;
use kiln_rhi::gpu::GpuDevice;
use kiln_rhi::RhiResult;

use crate::cleanup::CleanupQueue;

/// An image a pass reads or writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageRef {
    /// The presentable image acquired for this frame.
    Target,
    /// An image owned by the caller, e.g. an offscreen draw image.
    External(vk::Image),
}

/// Layout a pass needs an image in while it records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageAccess {
    pub image: ImageRef,
    pub layout: vk::ImageLayout,
}

impl ImageAccess {
    pub const fn target(layout: vk::ImageLayout) -> Self {
        Self {
            image: ImageRef::Target,
            layout,
        }
    }

    pub const fn external(image: vk::Image, layout: vk::ImageLayout) -> Self {
        Self {
            image: ImageRef::External(image),
            layout,
        }
    }
}

/// Per-frame state handed to each pass.
pub struct FrameContext<'a, D: GpuDevice = Device> {
    /// Command buffer being recorded.
    pub cmd: &'a CommandBuffer<D>,
    pub target: vk::Image,
    pub target_view: vk::ImageView,
    pub extent: vk::Extent2D,
    /// Reset at the start of every use of the slot.
    pub descriptors: &'a mut DescriptorAllocator<D>,
    /// Flushed once this frame's submission has completed.
    pub cleanup: &'a mut CleanupQueue,
    /// Holds the bytes passed to `render_frame` for this frame.
    pub uniforms: &'a Buffer<D>,
    pub frame_number: u64,
}

impl<D: GpuDevice> FrameContext<'_, D> {
    /// Image handle behind `image` for this frame.
    #[inline]
    pub fn resolve(&self, image: ImageRef) -> vk::Image {
        match image {
            ImageRef::Target => self.target,
            ImageRef::External(image) => image,
        }
    }
}

/// One step of frame recording.
pub trait RenderPass<D: GpuDevice = Device> {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Images this pass uses and the layouts it expects them in.
    fn accesses(&self) -> &[ImageAccess];

    /// Records the pass. Every image in [`accesses`](Self::accesses) is
    /// already in its declared layout.
    ///
    /// # Errors
    ///
    /// Returns an error if recording cannot complete; the frame is abandoned.
    fn record(&mut self, frame: &mut FrameContext<'_, D>) -> RhiResult<()>;
}

/// Clears an image to a solid color.
#[derive(Clone, Debug)]
pub struct ClearPass {
    image: ImageRef,
    color: [f32; 4],
    accesses: [ImageAccess; 1],
}

impl ClearPass {
    pub fn new(image: ImageRef, color: [f32; 4]) -> Self {
        Self {
            image,
            color,
            accesses: [ImageAccess {
                image,
                layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            }],
        }
    }

    pub fn set_color(&mut self, color: [f32; 4]) {
        self.color = color;
    }

    pub fn color(&self) -> [f32; 4] {
        self.color
    }
}

impl<D: GpuDevice> RenderPass<D> for ClearPass {
    fn name(&self) -> &str {
        "clear"
    }

    fn accesses(&self) -> &[ImageAccess] {
        &self.accesses
    }

    fn record(&mut self, frame: &mut FrameContext<'_, D>) -> RhiResult<()> {
        let clear = vk::ClearColorValue {
            float32: self.color,
        };
        frame.cmd.clear_color_image(
            frame.resolve(self.image),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &clear,
        );
        Ok(())
    }
}

/// Scales an offscreen image onto the frame target.
#[derive(Clone, Debug)]
pub struct BlitToTargetPass {
    source: vk::Image,
    source_extent: vk::Extent2D,
    accesses: [ImageAccess; 2],
}

impl BlitToTargetPass {
    pub fn new(source: vk::Image, source_extent: vk::Extent2D) -> Self {
        Self {
            source,
            source_extent,
            accesses: [
                ImageAccess::external(source, vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
                ImageAccess::target(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            ],
        }
    }
}

impl<D: GpuDevice> RenderPass<D> for BlitToTargetPass {
    fn name(&self) -> &str {
        "blit to target"
    }

    fn accesses(&self) -> &[ImageAccess] {
        &self.accesses
    }

    fn record(&mut self, frame: &mut FrameContext<'_, D>) -> RhiResult<()> {
        frame
            .cmd
            .copy_image_to_image(self.source, frame.target, self.source_extent, frame.extent);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_clear_pass_declares_transfer_dst() {
        let pass = ClearPass::new(ImageRef::Target, [0.0, 0.0, 0.0, 1.0]);
        let accesses = <ClearPass as RenderPass>::accesses(&pass);
        assert_eq!(
            accesses,
            &[ImageAccess::target(vk::ImageLayout::TRANSFER_DST_OPTIMAL)]
        );
    }

    #[test]
    fn test_blit_pass_reads_source_writes_target() {
        let source = vk::Image::from_raw(7);
        let pass = BlitToTargetPass::new(
            source,
            vk::Extent2D {
                width: 64,
                height: 64,
            },
        );
        let accesses = <BlitToTargetPass as RenderPass>::accesses(&pass);
        assert_eq!(accesses[0].image, ImageRef::External(source));
        assert_eq!(accesses[0].layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(accesses[1].image, ImageRef::Target);
    }
}
