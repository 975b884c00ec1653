//! kiln demo driver.
//!
//! Clears an offscreen image to an animated color, blits it to the
//! swapchain and keeps a small scene alive across reloads. `R` reloads the
//! scene, `C` clears it and `Escape` quits. Minimizing the window freezes
//! the frame loop until it is restored.

mod demo;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{error, info};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::PhysicalKey;
use winit::window::WindowId;

use kiln_core::EngineConfig;
use kiln_platform::{Action, InputState, Window};
use kiln_renderer::SceneRequest;

use demo::Gpu;

const CONFIG_PATH: &str = "kiln.toml";
const FROZEN_POLL: Duration = Duration::from_millis(100);

struct App {
    config: EngineConfig,
    /// Dropped before the window it renders to
    gpu: Option<Gpu>,
    window: Option<Window>,
    input: InputState,
    started: Instant,
    /// Set while the window is minimized
    frozen: bool,
}

impl App {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            gpu: None,
            window: None,
            input: InputState::new(),
            started: Instant::now(),
            frozen: false,
        }
    }

    fn handle_actions(&mut self, event_loop: &ActiveEventLoop) {
        for action in self.input.take_actions() {
            match action {
                Action::Exit => {
                    info!("Exit requested");
                    event_loop.exit();
                }
                Action::ReloadScene => self.request_scene(SceneRequest::Reload),
                Action::ClearScene => self.request_scene(SceneRequest::Clear),
            }
        }
    }

    fn request_scene(&mut self, request: SceneRequest) {
        if let Some(gpu) = self.gpu.as_mut() {
            info!("Scene {:?} requested", request);
            gpu.request_scene(request);
        }
    }

    fn redraw(&mut self) {
        let (Some(window), Some(gpu)) = (self.window.as_ref(), self.gpu.as_mut()) else {
            return;
        };
        if self.frozen {
            return;
        }

        if let Err(e) = gpu.draw_frame(window.size(), self.started.elapsed()) {
            if e.is_fatal() {
                error!("Fatal GPU error, terminating: {}", e);
                std::process::exit(1);
            }
            error!("Frame failed: {}", e);
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window = match Window::new(event_loop, &self.config.window) {
            Ok(window) => window,
            Err(e) => {
                error!("Failed to create window: {}", e);
                event_loop.exit();
                return;
            }
        };

        match Gpu::new(&window, &self.config) {
            Ok(gpu) => {
                info!("Initialization complete, entering main loop");
                self.gpu = Some(gpu);
                self.window = Some(window);
            }
            Err(e) => {
                error!("Failed to initialize Vulkan: {:?}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                let Some(window) = self.window.as_mut() else {
                    return;
                };
                window.resize(size.width, size.height);

                let minimized = window.is_minimized();
                if minimized != self.frozen {
                    info!("Frame loop {}", if minimized { "frozen" } else { "resumed" });
                    self.frozen = minimized;
                }
                if window.take_resized()
                    && !minimized
                    && let Some(gpu) = self.gpu.as_mut()
                {
                    gpu.request_rebuild();
                }
            }
            WindowEvent::Focused(false) => self.input.clear(),
            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(key) = event.physical_key {
                    if event.state.is_pressed() {
                        self.input.on_key_pressed(key);
                    } else {
                        self.input.on_key_released(key);
                    }
                }
                self.handle_actions(event_loop);
            }
            WindowEvent::RedrawRequested => self.redraw(),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.frozen {
            std::thread::sleep(FROZEN_POLL);
            return;
        }
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // Tear down the GPU while the window and surface are still alive
        self.gpu = None;
        info!("Shutdown complete");
    }
}

fn main() -> Result<()> {
    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_PATH));
    let config = EngineConfig::load(&config_path)?;

    kiln_core::init_logging_with(&config.log_filter);
    info!("Starting kiln");

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    Ok(())
}
