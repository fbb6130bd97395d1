//! voxtrace viewer: opens a window and drives the ray-traced frame loop.

mod camera;
mod scene;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use ash::vk;
use clap::Parser;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::{ElementState, MouseButton, MouseScrollDelta, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};

use voxtrace_renderer::raytracing::pipeline::{ShaderLibrary, SHADER_GROUPS};
use voxtrace_renderer::vulkan::VulkanDevice;
use voxtrace_renderer::{FrameStatus, Renderer, RtConfig};

use camera::OrbitCamera;
use scene::CUBE_INSTANCE;

#[derive(Parser, Debug)]
#[command(name = "voxtrace", about = "Ray-traced voxel scene viewer")]
struct Args {
    #[arg(long, default_value_t = 1280)]
    width: u32,
    #[arg(long, default_value_t = 720)]
    height: u32,
    /// Directory holding the compiled `.spv` shaders.
    #[arg(long)]
    shader_dir: Option<PathBuf>,
    /// Edge length of each voxel volume.
    #[arg(long, default_value_t = 32)]
    volume_size: u32,
    /// Image used as the cube's material texture.
    #[arg(long)]
    texture: Option<PathBuf>,
    #[arg(long)]
    no_vsync: bool,
    #[arg(long)]
    validation: bool,
}

struct App {
    args: Args,
    config: RtConfig,
    camera: OrbitCamera,
    // Dropped before the window it renders into.
    renderer: Option<Renderer<VulkanDevice>>,
    window: Option<Window>,
    start: Instant,
    dragging: bool,
    last_cursor: Option<(f64, f64)>,
    failed: bool,
}

impl App {
    fn new(args: Args, config: RtConfig) -> Self {
        Self {
            args,
            config,
            camera: OrbitCamera::default(),
            renderer: None,
            window: None,
            start: Instant::now(),
            dragging: false,
            last_cursor: None,
            failed: false,
        }
    }

    fn boot(&mut self, event_loop: &ActiveEventLoop) -> Result<(), Box<dyn std::error::Error>> {
        let attributes = Window::default_attributes()
            .with_title("voxtrace")
            .with_inner_size(LogicalSize::new(self.args.width, self.args.height));
        let window = event_loop.create_window(attributes)?;
        let size = window.inner_size();

        let shaders = ShaderLibrary::load(&self.config.shader_dir, SHADER_GROUPS)?;
        let scene = scene::demo_scene(self.args.volume_size, self.args.texture.as_deref())?;

        // SAFETY: the renderer is dropped before the window (field order and `exiting`).
        let device = unsafe {
            VulkanDevice::new(
                window.display_handle()?.as_raw(),
                window.window_handle()?.as_raw(),
                vk::Extent2D {
                    width: size.width,
                    height: size.height,
                },
                &self.config,
            )?
        };
        let renderer = Renderer::init(device, self.config.clone(), &scene, &shaders)?;

        self.renderer = Some(renderer);
        self.window = Some(window);
        self.start = Instant::now();
        Ok(())
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let (Some(renderer), Some(window)) = (self.renderer.as_mut(), self.window.as_ref()) else {
            return;
        };
        let t = self.start.elapsed().as_secs_f32();
        let size = window.inner_size();

        let result = renderer
            .set_instance_transform(CUBE_INSTANCE, scene::cube_transform(t))
            .and_then(|()| renderer.draw_frame(&self.camera.uniforms(size.width, size.height)));
        match result {
            Ok(FrameStatus::Presented) | Ok(FrameStatus::Skipped) => {}
            Ok(FrameStatus::Recreated) => info!(width = size.width, height = size.height, "swapchain recreated"),
            Err(e) => {
                error!("{e}");
                self.failed = true;
                event_loop.exit();
            }
        }
    }

    fn shutdown(&mut self) {
        if let Some(renderer) = self.renderer.take() {
            if let Err(e) = renderer.destroy() {
                warn!("renderer shutdown: {e}");
            }
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.renderer.is_some() {
            return;
        }
        if let Err(e) = self.boot(event_loop) {
            error!("startup failed: {e}");
            self.failed = true;
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => event_loop.exit(),
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state == ElementState::Pressed && event.logical_key == Key::Named(NamedKey::Escape) {
                    event_loop.exit();
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.notify_resize(size.width, size.height);
                }
            }
            WindowEvent::MouseInput {
                button: MouseButton::Left,
                state,
                ..
            } => {
                self.dragging = state == ElementState::Pressed;
                self.last_cursor = None;
            }
            WindowEvent::CursorMoved { position, .. } => {
                if self.dragging {
                    if let Some((x, y)) = self.last_cursor {
                        self.camera
                            .orbit(-(position.x - x) as f32 * 0.005, (position.y - y) as f32 * 0.005);
                    }
                    self.last_cursor = Some((position.x, position.y));
                }
            }
            WindowEvent::MouseWheel { delta, .. } => {
                let lines = match delta {
                    MouseScrollDelta::LineDelta(_, y) => y,
                    MouseScrollDelta::PixelDelta(p) => p.y as f32 / 40.0,
                };
                self.camera.zoom(0.9f32.powf(lines));
            }
            WindowEvent::RedrawRequested => self.redraw(event_loop),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match RtConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(dir) = &args.shader_dir {
        config.shader_dir = dir.clone();
    }
    config.vsync &= !args.no_vsync;
    config.validation |= args.validation;

    let event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(e) => {
            error!("cannot create event loop: {e}");
            return ExitCode::FAILURE;
        }
    };
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(args, config);
    if let Err(e) = event_loop.run_app(&mut app) {
        error!("event loop: {e}");
        return ExitCode::FAILURE;
    }
    app.shutdown();

    if app.failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
