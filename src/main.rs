// =============================================================================
// VULKAN TRIANGLE RENDERER
// =============================================================================
//
// Draws a single colored triangle with a resize-safe frame loop.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit App (window, input, event loop)                          │
// │    └── Renderer (frame ring, swapchain recreation)              │
// │          └── VulkanBackend (pipeline, vertex buffer, commands)  │
// │                └── Framebuffer + Swapchain                      │
// │                      └── Device (instance, queues, allocator)   │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the frame slot's fence
// 2. Acquire swapchain image (stale -> recreate, skip frame)
// 3. Record + submit the slot's command buffer
// 4. Present (stale -> recreate)
// 5. Advance to the next slot
//
// =============================================================================

mod backend;
mod config;
mod renderer;

use anyhow::Result;
use ash::vk;
use backend::Device;
use config::Config;
use renderer::{FrameStatus, Renderer, VulkanBackend};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // The logger is configured from the file, so the outcome is logged after
    let (config, outcome) = match Config::load_from_path(config::CONFIG_PATH) {
        Ok(Some(config)) => (config, Ok(true)),
        Ok(None) => (Config::default(), Ok(false)),
        Err(e) => (Config::default(), Err(e)),
    };

    init_logging(&config);

    match outcome {
        Ok(true) => {
            log::info!("Loaded configuration from {}", config::CONFIG_PATH);
            log::debug!("Config: {:?}", config);
        }
        Ok(false) => log::info!("No {} found, using defaults", config::CONFIG_PATH),
        Err(e) => log::warn!("{:#}. Using defaults.", e),
    }

    log::info!("Starting {}", config.window.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    app.shutdown()
}

/// Level comes from config; RUST_LOG overrides it when set
fn init_logging(config: &Config) {
    use env_logger::Builder;

    let mut builder = Builder::new();
    builder.filter_level(config.log_level());
    builder.parse_default_env();
    builder.init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

pub struct App {
    config: Config,

    // Dropped before the window: the surface must go first
    renderer: Option<Renderer<VulkanBackend>>,
    window: Option<Arc<Window>>,

    /// First unrecoverable error; returned from main
    fatal_error: Option<anyhow::Error>,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    pub fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            renderer: None,
            window: None,
            fatal_error: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // VULKAN INITIALIZATION
    // =========================================================================

    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        let device = Device::new(
            &self.config.window.title,
            self.config.enable_validation(),
            window,
        )?;

        let size = framebuffer_size(window);
        let backend = VulkanBackend::new(device, &self.config.graphics, size)?;
        self.renderer = Some(Renderer::new(backend, size));

        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("Fatal error: {:?}", error);
        if self.fatal_error.is_none() {
            self.fatal_error = Some(error);
        }
        event_loop.exit();
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let (Some(renderer), Some(window)) = (self.renderer.as_mut(), self.window.as_ref()) else {
            return;
        };

        match renderer.draw_frame(framebuffer_size(window)) {
            Ok(FrameStatus::Rendered) => self.update_fps(),
            Ok(FrameStatus::Dropped) | Ok(FrameStatus::Minimized) => {}
            Err(e) => self.fail(event_loop, e),
        }
    }

    // =========================================================================
    // FPS COUNTER
    // =========================================================================

    pub fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    /// Wait for the GPU, release everything and report how the run went
    fn shutdown(mut self) -> Result<()> {
        if let Some(mut renderer) = self.renderer.take() {
            if let Err(e) = renderer.wait_idle() {
                log::warn!("Device did not go idle cleanly: {:#}", e);
            }

            let stats = renderer.stats();
            log::info!(
                "Frames rendered: {}, dropped: {}, stale presents: {}, swapchain rebuilds: {}",
                stats.rendered,
                stats.dropped,
                stats.stale_presents,
                stats.swapchain_rebuilds
            );
        }
        self.window = None;

        match self.fatal_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn framebuffer_size(window: &Window) -> vk::Extent2D {
    let size = window.inner_size();
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            self.fail(event_loop, e.context("Failed to initialize Vulkan"));
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.request_resize();
                }
            }

            WindowEvent::RedrawRequested => self.redraw(event_loop),

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    /// Redraw continuously, but sleep on events while minimized
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let Some(ref window) = self.window else {
            return;
        };

        let size = window.inner_size();
        if size.width == 0 || size.height == 0 {
            event_loop.set_control_flow(ControlFlow::Wait);
        } else {
            event_loop.set_control_flow(ControlFlow::Poll);
            window.request_redraw();
        }
    }
}
