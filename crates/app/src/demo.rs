//! GPU state of the demo: device, swapchain, render context and scene.

use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, error, info};

use kiln_core::EngineConfig;
use kiln_platform::{Surface, SurfaceSize, Window};
use kiln_renderer::pass::{BlitToTargetPass, ClearPass, ImageRef, RenderPass};
use kiln_renderer::upload::GpuMesh;
use kiln_renderer::{FrameOutcome, RenderContext, SceneRequest, SceneSlot};
use kiln_rhi::device::Device;
use kiln_rhi::image::{Image, ImageDesc};
use kiln_rhi::instance::Instance;
use kiln_rhi::physical_device::select_physical_device;
use kiln_rhi::swapchain::Swapchain;
use kiln_rhi::{RhiResult, vk};

const DRAW_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
const TEXTURE_SIZE: u32 = 64;

/// Shown while no scene is loaded.
const EMPTY_COLOR: [f32; 4] = [0.02, 0.02, 0.02, 1.0];

/// Per-frame data written into the slot's uniform buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct FrameUniforms {
    time: f32,
    frame: u32,
    extent: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    uv: [f32; 2],
}

/// Scene content: a textured quad plus a tint that changes per load.
struct DemoScene {
    _quad: GpuMesh<Device>,
    texture: Image<Device>,
    generation: u32,
}

impl DemoScene {
    fn load(context: &mut RenderContext, generation: u32) -> RhiResult<Self> {
        let vertices = [
            Vertex {
                position: [-0.5, -0.5, 0.0],
                uv: [0.0, 0.0],
            },
            Vertex {
                position: [0.5, -0.5, 0.0],
                uv: [1.0, 0.0],
            },
            Vertex {
                position: [0.5, 0.5, 0.0],
                uv: [1.0, 1.0],
            },
            Vertex {
                position: [-0.5, 0.5, 0.0],
                uv: [0.0, 1.0],
            },
        ];
        let quad = context.upload_mesh(&vertices, &[0, 1, 2, 2, 3, 0])?;

        let texture = context.upload_image(
            &checkerboard(TEXTURE_SIZE, generation),
            &ImageDesc::new_2d(
                vk::Extent2D {
                    width: TEXTURE_SIZE,
                    height: TEXTURE_SIZE,
                },
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageUsageFlags::SAMPLED,
            )
            .with_mipmaps(),
            "demo checkerboard",
        )?;

        info!("Demo scene generation {} uploaded", generation);
        Ok(Self {
            _quad: quad,
            texture,
            generation,
        })
    }

    fn tint(&self, time: f32) -> [f32; 4] {
        let phase = self.generation as f32 * 2.1;
        let wave = |offset: f32| 0.5 + 0.5 * (time + phase + offset).sin();
        [wave(0.0), wave(2.094), wave(4.188), 1.0]
    }
}

/// RGBA8 checkerboard whose square size depends on `generation`.
fn checkerboard(size: u32, generation: u32) -> Vec<u8> {
    let square = 4 << (generation % 3);
    (0..size * size)
        .flat_map(|i| {
            let (x, y) = (i % size, i / size);
            if ((x / square) + (y / square)) % 2 == 0 {
                [255u8, 255, 255, 255]
            } else {
                [40, 40, 40, 255]
            }
        })
        .collect()
}

/// Everything with a Vulkan lifetime. Fields drop in declaration order.
pub struct Gpu {
    scene: SceneSlot<DemoScene>,
    generation: u32,
    clear: ClearPass,
    blit: BlitToTargetPass,
    context: RenderContext,
    swapchain: Swapchain,
    surface: Surface,
    instance: Instance,
}

impl Gpu {
    /// Brings up Vulkan for `window` and loads the first scene.
    pub fn new(window: &Window, config: &EngineConfig) -> anyhow::Result<Self> {
        let instance = Instance::with_extensions(config.validation, window.required_extensions()?)?;
        let surface = window.create_surface(instance.entry(), instance.handle())?;
        let gpu_info = select_physical_device(instance.handle(), surface.handle(), surface.loader())?;
        let device = Device::new(&instance, &gpu_info)?;

        let size = window.size();
        let swapchain = Swapchain::new(
            &instance,
            device.clone(),
            surface.handle(),
            size.width,
            size.height,
            config.window.vsync,
        )?;

        let mut context = RenderContext::new(
            device,
            config,
            std::mem::size_of::<FrameUniforms>() as u64,
        )?;

        // Fixed-size offscreen target, scaled onto the swapchain every frame
        let draw_extent = vk::Extent2D {
            width: config.window.width,
            height: config.window.height,
        };
        let draw = context.create_image(
            &ImageDesc::new_2d(
                draw_extent,
                DRAW_FORMAT,
                vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST,
            ),
            "draw target",
        )?;
        let clear = ClearPass::new(ImageRef::External(draw.handle()), EMPTY_COLOR);
        let blit = BlitToTargetPass::new(draw.handle(), draw_extent);
        context.cleanup().defer_drop(draw);

        let mut gpu = Self {
            scene: SceneSlot::new(),
            generation: 0,
            clear,
            blit,
            context,
            swapchain,
            surface,
            instance,
        };
        gpu.reload_scene()?;
        Ok(gpu)
    }

    /// Forwards a scene change to the next frame boundary.
    pub fn request_scene(&mut self, request: SceneRequest) {
        self.scene.request(request);
    }

    /// Marks the swapchain for rebuild before the next frame.
    pub fn request_rebuild(&mut self) {
        self.context.frames_mut().request_rebuild();
    }

    fn reload_scene(&mut self) -> RhiResult<()> {
        let scene = DemoScene::load(&mut self.context, self.generation)?;
        self.generation += 1;
        self.forget_scene_texture();
        self.scene.load(self.context.device().as_ref(), scene)
    }

    fn clear_scene(&mut self) -> RhiResult<()> {
        self.forget_scene_texture();
        self.scene.unload(self.context.device().as_ref())
    }

    /// The old texture is destroyed with its scene; its handle may be reused.
    fn forget_scene_texture(&mut self) {
        if let Some(scene) = self.scene.get() {
            self.context.forget_image(scene.texture.handle());
        }
    }

    /// Applies pending scene and swapchain changes, then renders one frame.
    pub fn draw_frame(&mut self, size: SurfaceSize, time: Duration) -> RhiResult<()> {
        match self.scene.take_request() {
            Some(SceneRequest::Reload) => self.reload_scene()?,
            Some(SceneRequest::Clear) => self.clear_scene()?,
            None => {}
        }

        if self.context.frames().needs_rebuild() {
            self.context.wait_idle()?;
            self.swapchain.recreate(
                &self.instance,
                self.surface.handle(),
                size.width,
                size.height,
            )?;
            self.context.frames_mut().acknowledge_rebuild();
        }

        let seconds = time.as_secs_f32();
        let color = self.scene.get().map_or(EMPTY_COLOR, |s| s.tint(seconds));
        self.clear.set_color(color);

        let uniforms = FrameUniforms {
            time: seconds,
            frame: self.context.frames().frame_number() as u32,
            extent: [size.width, size.height],
        };
        let mut passes: [&mut dyn RenderPass; 2] = [&mut self.clear, &mut self.blit];
        match self.context.render_frame(
            &mut self.swapchain,
            bytemuck::bytes_of(&uniforms),
            &mut passes,
        )? {
            FrameOutcome::Presented => {}
            outcome => debug!("Frame {:?}, swapchain will be rebuilt", outcome),
        }
        Ok(())
    }
}

impl Drop for Gpu {
    fn drop(&mut self) {
        if let Err(e) = self.clear_scene() {
            error!("Failed to unload scene at shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniforms_are_tightly_packed() {
        assert_eq!(std::mem::size_of::<FrameUniforms>(), 16);
        assert_eq!(std::mem::size_of::<Vertex>(), 20);
    }

    #[test]
    fn test_checkerboard_size_and_pattern() {
        let pixels = checkerboard(16, 0);
        assert_eq!(pixels.len(), 16 * 16 * 4);
        assert_eq!(&pixels[0..4], &[255, 255, 255, 255]);
        // Square size 4 at generation 0: pixel (4, 0) is dark
        assert_eq!(&pixels[16..20], &[40, 40, 40, 255]);
    }
}
