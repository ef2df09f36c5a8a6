//! Window event loop and render thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use voxtrace_gpu::{DeferredQueue, GpuContextBuilder, VulkanDevice};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop, EventLoopProxy};
use winit::window::{Window, WindowId};

use crate::config::AppConfig;
use crate::frame::FramePass;
use crate::render_loop::RenderLoop;
use crate::window::SharedWindowState;

/// Builds the frame pass on the render thread, once the device exists.
pub type PassSetup<P> =
    Box<dyn FnOnce(&mut VulkanDevice, &mut DeferredQueue) -> anyhow::Result<P> + Send>;

/// Install the `tracing` subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

/// Open a window and render with the pass built by `setup` until the window
/// is closed.
///
/// The event loop stays on the calling thread. The device is created here
/// and moved to a render thread, which owns every GPU object from then on.
pub fn run<P>(config: AppConfig, setup: PassSetup<P>) -> anyhow::Result<()>
where
    P: FramePass<VulkanDevice> + 'static,
{
    init_logging();
    info!("{} starting...", config.title);

    let event_loop = EventLoop::<RenderExit>::with_user_event()
        .build()
        .context("Failed to create event loop")?;
    event_loop.set_control_flow(ControlFlow::Wait);

    let mut runner = Runner {
        config,
        setup: Some(setup),
        proxy: event_loop.create_proxy(),
        window: None,
        shared: None,
        render_thread: None,
        result: Ok(()),
    };
    event_loop.run_app(&mut runner).context("Event loop error")?;
    runner.result
}

/// Sent by the render thread when it stops on its own.
#[derive(Debug, Clone, Copy)]
struct RenderExit;

struct Runner<P> {
    config: AppConfig,
    setup: Option<PassSetup<P>>,
    proxy: EventLoopProxy<RenderExit>,
    // Dropped only after the render thread has been joined: the surface
    // refers to it.
    window: Option<Arc<Window>>,
    shared: Option<Arc<SharedWindowState>>,
    render_thread: Option<JoinHandle<anyhow::Result<()>>>,
    result: anyhow::Result<()>,
}

impl<P: FramePass<VulkanDevice> + 'static> Runner<P> {
    fn start(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<()> {
        let Some(setup) = self.setup.take() else {
            return Ok(());
        };

        let attributes = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        let window = Arc::new(
            event_loop
                .create_window(attributes)
                .context("Failed to create window")?,
        );

        let context = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .build(window.as_ref())
            .context("Failed to create GPU context")?;
        info!("GPU: {}", context.capabilities().summary());
        let device = VulkanDevice::new(context).context("Failed to create device")?;

        let size = window.inner_size();
        let shared = Arc::new(SharedWindowState::new(size.width, size.height));
        let config = self.config.clone();
        let state = Arc::clone(&shared);
        let proxy = self.proxy.clone();

        let handle = thread::Builder::new()
            .name("render".to_string())
            .spawn(move || {
                let result = render_thread(device, setup, state, &config);
                // The event loop may already be gone when the window closed.
                let _ = proxy.send_event(RenderExit);
                result
            })
            .context("Failed to spawn render thread")?;

        self.window = Some(window);
        self.shared = Some(shared);
        self.render_thread = Some(handle);
        Ok(())
    }

    /// Ask the render thread to stop, join it and leave the event loop.
    fn stop(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(shared) = &self.shared {
            shared.request_close();
        }
        if let Some(handle) = self.render_thread.take() {
            match handle.join() {
                Ok(Ok(())) => info!("Render thread finished"),
                Ok(Err(e)) => {
                    error!("Render thread failed: {e:#}");
                    self.result = Err(e);
                }
                Err(_) => {
                    error!("Render thread panicked");
                    self.result = Err(anyhow::anyhow!("render thread panicked"));
                }
            }
        }
        self.window = None;
        event_loop.exit();
    }
}

fn render_thread<P: FramePass<VulkanDevice> + 'static>(
    mut device: VulkanDevice,
    setup: PassSetup<P>,
    window: Arc<SharedWindowState>,
    config: &AppConfig,
) -> anyhow::Result<()> {
    let mut deferred = DeferredQueue::new();
    let pass = match setup(&mut device, &mut deferred) {
        Ok(pass) => pass,
        Err(e) => {
            // Inputs of builds that did succeed may still be queued.
            if let Err(cleanup) = deferred.flush(&mut device) {
                error!("Deferred cleanup failed: {cleanup}");
            }
            return Err(e.context("Scene setup failed"));
        }
    };
    let frames = RenderLoop::new(device, deferred, pass, window, config)
        .context("Failed to create frame resources")?;
    frames.run().context("Render loop failed")?;
    Ok(())
}

impl<P: FramePass<VulkanDevice> + 'static> ApplicationHandler<RenderExit> for Runner<P> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.render_thread.is_some() {
            return;
        }
        if let Err(e) = self.start(event_loop) {
            error!("Failed to initialize: {e:#}");
            self.result = Err(e);
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.stop(event_loop);
            }
            WindowEvent::Resized(size) => {
                if let Some(shared) = &self.shared {
                    shared.set_size(size.width, size.height);
                }
            }
            _ => {}
        }
    }

    fn user_event(&mut self, event_loop: &ActiveEventLoop, _event: RenderExit) {
        self.stop(event_loop);
    }
}
