// =============================================================================
// VK-ARRAY-SUM - GPU array reduction on Vulkan
// =============================================================================
//
// Uploads an array of ones to device memory, sums it with a compute shader
// and reads the scalar back. Runs headless unless the config carries a
// [swapchain] table, in which case every unit of work is driven by the
// frame loop and an (empty) image is presented per frame.
//
// FRAME FLOW (windowed):
// 1. Acquire swapchain image, signaling the slot's fence
// 2. Wait on and reset that fence
// 3. Zero output, dispatch, copy result back, wait idle
// 4. Present, wait idle, rotate slot
//
// =============================================================================

mod app;
mod backend;
mod config;

use anyhow::{Context, Result};
use app::{ArraySum, WORK_QUEUE};
use backend::{frame, DeviceContext, FrameLoop, GpuDevice, Presenter, Swapchain};
use config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowId},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    init_logging(&config);
    match &config.source {
        Some(path) => log::info!("Loaded configuration from {:?}", path),
        None => log::info!("No config file found, using defaults"),
    }
    log::debug!("Config: {:?}", config);
    log::info!(
        "Starting vk-array-sum ({})",
        if config.is_headless() { "headless" } else { "windowed" }
    );

    if config.is_headless() {
        run_headless(&config)
    } else {
        let event_loop = EventLoop::new().context("Failed to create event loop")?;
        let mut app = App::new(config);
        event_loop.run_app(&mut app)?;
        app.finish()
    }
}

/// RUST_LOG wins over the configured level
fn init_logging(config: &Config) {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or(config.debug.log_level.as_str()))
        .format_timestamp_millis()
        .init();
}

fn run_headless(config: &Config) -> Result<()> {
    let device = DeviceContext::new(config, None)?;
    let mut workload = ArraySum::new(device.clone(), &config.compute)?;
    let expected = app::expected_sum(workload.element_count());

    for iteration in 0..config.compute.iterations {
        frame::run_headless(device.as_ref(), || {
            let sum = workload.execute()?;
            app::check_sum(sum, expected)
                .with_context(|| format!("Iteration {} produced a wrong result", iteration))
        })?;
    }

    log::info!("Finished {} iteration(s)", config.compute.iterations);
    Ok(())
}

// =============================================================================
// WINDOWED MODE
// =============================================================================

/// Field order is teardown order: GPU objects go before the device, and the
/// window outlives the surface created from it.
struct App {
    config: Config,
    frames: Option<FrameLoop<Swapchain>>,
    workload: Option<ArraySum>,
    device: Option<Arc<DeviceContext>>,
    window: Option<Window>,
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            frames: None,
            workload: None,
            device: None,
            window: None,
            fatal: None,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let swapchain_config = self
            .config
            .swapchain
            .as_ref()
            .context("Windowed mode without a [swapchain] section")?;

        let window_attributes = Window::default_attributes()
            .with_title(swapchain_config.title.as_str())
            .with_inner_size(winit::dpi::PhysicalSize::new(
                swapchain_config.image_width,
                swapchain_config.image_height,
            ))
            .with_resizable(false);
        let window = event_loop
            .create_window(window_attributes)
            .context("Failed to create window")?;

        let device = DeviceContext::new(&self.config, Some(&window))?;
        let swapchain = Swapchain::new(device.clone(), swapchain_config)?;
        let workload = ArraySum::new(device.clone(), &self.config.compute)?;
        workload.transition_swapchain_images(swapchain.images())?;

        let frames = FrameLoop::new(
            device.clone(),
            swapchain,
            swapchain_config.frames_in_flight as usize,
            WORK_QUEUE,
        )?;

        self.frames = Some(frames);
        self.workload = Some(workload);
        self.device = Some(device);
        self.window = Some(window);
        Ok(())
    }

    fn run_frame(&mut self) -> Result<()> {
        let (Some(frames), Some(workload)) = (self.frames.as_mut(), self.workload.as_mut()) else {
            return Ok(());
        };
        let expected = app::expected_sum(workload.element_count());
        frames.run_frame(|_image_index| app::check_sum(workload.execute()?, expected))
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:?}", error);
        self.fatal.get_or_insert(error);
        event_loop.exit();
    }

    /// Release everything in order and surface any error from the event loop.
    fn finish(mut self) -> Result<()> {
        if let Some(device) = &self.device {
            if let Err(e) = device.wait_idle() {
                log::warn!("Device wait idle failed during shutdown: {:?}", e);
            }
        }
        match self.fatal.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() || self.fatal.is_some() {
            return;
        }
        if let Err(e) = self.init(event_loop) {
            self.fail(event_loop, e.context("Failed to initialize"));
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.run_frame() {
                    self.fail(event_loop, e);
                }
            }
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

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
