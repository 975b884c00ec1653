//! Integration tests for the blocking submission path and the render context.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_core::EngineConfig;
use kiln_renderer::RenderContext;
use kiln_renderer::frame::FrameOutcome;
use kiln_renderer::immediate::ImmediateSubmitter;
use kiln_renderer::pass::{
    BlitToTargetPass, ClearPass, FrameContext, ImageAccess, ImageRef, RenderPass,
};
use kiln_rhi::buffer::{Buffer, BufferUsage};
use kiln_rhi::image::ImageDesc;
use kiln_rhi::testing::{FakeDevice, FakeSwapchain};
use kiln_rhi::{RhiResult, vk};

const SENTINEL: u32 = 0xCAFE_F00D;

#[test]
fn test_submit_and_wait_blocks_until_gpu_wrote() {
    let latency = Duration::from_millis(50);
    let device = FakeDevice::with_latency(latency);
    let mut immediate = ImmediateSubmitter::new(device.clone(), Duration::from_secs(10)).unwrap();
    let readback = Buffer::new(device.clone(), BufferUsage::Readback, 16).unwrap();

    let started = Instant::now();
    immediate
        .submit_and_wait(|cmd| cmd.fill_buffer(readback.handle(), 0, vk::WHOLE_SIZE, SENTINEL))
        .unwrap();
    assert!(started.elapsed() >= latency);

    let mut bytes = [0u8; 16];
    readback.read_data(0, &mut bytes).unwrap();
    for word in bytes.chunks_exact(4) {
        assert_eq!(u32::from_le_bytes(word.try_into().unwrap()), SENTINEL);
    }
    assert!(device.violations().is_empty());
}

#[test]
fn test_context_uploads_and_renders_offscreen_image() {
    let device = FakeDevice::with_latency(Duration::from_millis(2));
    let mut context =
        RenderContext::new(device.clone(), &EngineConfig::default(), 16).unwrap();

    let draw_extent = vk::Extent2D {
        width: 32,
        height: 32,
    };
    let draw = context
        .create_image(
            &ImageDesc::new_2d(
                draw_extent,
                vk::Format::R16G16B16A16_SFLOAT,
                vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST,
            ),
            "draw",
        )
        .unwrap();

    let mut target = FakeSwapchain::new(
        device.clone(),
        2,
        vk::Extent2D {
            width: 64,
            height: 48,
        },
    );
    let mut clear = ClearPass::new(ImageRef::External(draw.handle()), [0.0, 0.5, 1.0, 1.0]);
    let mut blit = BlitToTargetPass::new(draw.handle(), draw_extent);

    for _ in 0..4 {
        let mut passes: [&mut dyn RenderPass<FakeDevice>; 2] = [&mut clear, &mut blit];
        let outcome = context
            .render_frame(&mut target, &[1u8; 16], &mut passes)
            .unwrap();
        assert_eq!(outcome, FrameOutcome::Presented);
    }

    // The draw image keeps its layout between frames: after the first frame
    // it only moves between TRANSFER_SRC and TRANSFER_DST
    let from_undefined = device
        .barriers()
        .iter()
        .filter(|b| b.image == draw.handle() && b.old_layout == vk::ImageLayout::UNDEFINED)
        .count();
    assert_eq!(from_undefined, 1);

    context.cleanup().defer_drop(draw);
    drop(context);
    assert_eq!(device.live_objects(), 0);
    assert!(device.violations().is_empty());
}

#[test]
fn test_session_cleanup_runs_after_idle() {
    let device = FakeDevice::with_latency(Duration::from_millis(5));
    let runs = Arc::new(AtomicUsize::new(0));
    {
        let mut context =
            RenderContext::new(device.clone(), &EngineConfig::default(), 16).unwrap();
        let mesh = context
            .upload_mesh(&[[0.0f32; 4]; 3], &[0, 1, 2])
            .unwrap();
        context.cleanup().defer_drop(mesh.vertices);
        context.cleanup().defer_drop(mesh.indices);

        let counter = runs.clone();
        let probe = device.clone();
        context.cleanup().push(move || {
            // Runs first, after the context waited for idle
            assert!(probe.events().contains(&kiln_rhi::testing::DeviceEvent::Idle));
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(device.live_objects(), 0);
}

/// Declares a sampled texture and records nothing.
struct SamplePass {
    accesses: [ImageAccess; 1],
}

impl RenderPass<FakeDevice> for SamplePass {
    fn name(&self) -> &str {
        "sample"
    }

    fn accesses(&self) -> &[ImageAccess] {
        &self.accesses
    }

    fn record(&mut self, _frame: &mut FrameContext<'_, FakeDevice>) -> RhiResult<()> {
        Ok(())
    }
}

#[test]
fn test_uploaded_texture_is_sampled_without_transition() {
    let device = FakeDevice::new();
    let mut context = RenderContext::new(device.clone(), &EngineConfig::default(), 16).unwrap();
    let texture = context
        .upload_image(
            &[7u8; 4 * 4 * 4],
            &ImageDesc::new_2d(
                vk::Extent2D {
                    width: 4,
                    height: 4,
                },
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageUsageFlags::SAMPLED,
            ),
            "texture",
        )
        .unwrap();
    assert_eq!(
        context.frames().tracked_layout(texture.handle()),
        Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    );

    let texture_barriers = |device: &FakeDevice| {
        device
            .barriers()
            .iter()
            .filter(|b| b.image == texture.handle())
            .count()
    };
    let after_upload = texture_barriers(&device);

    let mut target = FakeSwapchain::new(
        device.clone(),
        2,
        vk::Extent2D {
            width: 8,
            height: 8,
        },
    );
    let mut sample = SamplePass {
        accesses: [ImageAccess::external(
            texture.handle(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )],
    };
    for _ in 0..2 {
        let mut passes: [&mut dyn RenderPass<FakeDevice>; 1] = [&mut sample];
        context.render_frame(&mut target, &[], &mut passes).unwrap();
    }
    // No frame moved the uploaded pixels out of their layout
    assert_eq!(texture_barriers(&device), after_upload);

    let handle = texture.handle();
    let live = device.live_objects();
    context.retire_image(texture);
    assert_eq!(context.frames().tracked_layout(handle), None);
    assert_eq!(device.live_objects(), live);

    // Once both slots were reused, image and view are gone
    for _ in 0..2 {
        context.render_frame(&mut target, &[], &mut []).unwrap();
    }
    assert_eq!(device.live_objects(), live - 2);

    drop(context);
    assert_eq!(device.live_objects(), 0);
    assert!(device.violations().is_empty());
}
