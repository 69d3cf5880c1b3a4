// winit host for an `AppLoop`
//
// Window events become `AppEvent`s, redraws become iterations, and the event
// loop is asked to exit as soon as the application loop has terminated.

use anyhow::{Context, Result};
use raw_window_handle::HasDisplayHandle;
use std::sync::Arc;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes, WindowId},
};

use super::{AppCallbacks, AppEvent, AppLoop, AppResult, Platform};
use crate::backend::{DeviceDesc, VulkanGpu, WindowDesc};

/// Creates windows on the active event loop and Vulkan devices for them.
pub struct WinitPlatform<'a> {
    event_loop: &'a ActiveEventLoop,
    windows: &'a mut Vec<Arc<Window>>,
}

impl Platform for WinitPlatform<'_> {
    type Gpu = VulkanGpu;

    fn create_window(&mut self, desc: &WindowDesc) -> Result<Arc<Window>> {
        let attributes = WindowAttributes::default()
            .with_title(&desc.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(desc.width, desc.height))
            .with_resizable(desc.resizable);

        let window = Arc::new(
            self.event_loop
                .create_window(attributes)
                .context("Failed to create window")?,
        );
        log::info!("Window: {}x{} ({})", desc.width, desc.height, desc.title);

        self.windows.push(window.clone());
        Ok(window)
    }

    fn create_gpu_device(&mut self, desc: &DeviceDesc) -> Result<VulkanGpu> {
        let display = self
            .event_loop
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let app_name = self
            .windows
            .first()
            .map(|window| window.title())
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());

        VulkanGpu::new(&app_name, display, desc)
    }
}

pub struct Runner<A> {
    app_loop: AppLoop<A>,
    windows: Vec<Arc<Window>>,
}

impl<A> Runner<A>
where
    A: AppCallbacks<Gpu = VulkanGpu>,
{
    pub fn new(app_loop: AppLoop<A>) -> Self {
        Self {
            app_loop,
            windows: Vec::new(),
        }
    }

    fn exit_when_done(&self, event_loop: &ActiveEventLoop, result: AppResult) {
        if result.is_terminal() {
            log::info!("Application finished: {:?}", result);
            event_loop.exit();
        }
    }
}

impl<A> ApplicationHandler for Runner<A>
where
    A: AppCallbacks<Gpu = VulkanGpu>,
{
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let mut platform = WinitPlatform {
            event_loop,
            windows: &mut self.windows,
        };
        let result = self.app_loop.init(&mut platform);
        self.exit_when_done(event_loop, result);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let result = match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.app_loop.handle_event(&AppEvent::Quit)
            }
            WindowEvent::Resized(size) => self.app_loop.handle_event(&AppEvent::Resized {
                width: size.width,
                height: size.height,
            }),
            WindowEvent::RedrawRequested => self.app_loop.iterate(),
            _ => return,
        };
        self.exit_when_done(event_loop, result);
    }

    /// Keep redrawing as fast as presentation allows.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.app_loop.status().is_terminal() {
            return;
        }
        for window in &self.windows {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.app_loop.shutdown();
    }
}

/// Run `app_loop` on a new event loop until it terminates.
pub fn run<A>(app_loop: AppLoop<A>) -> Result<AppResult>
where
    A: AppCallbacks<Gpu = VulkanGpu>,
{
    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let mut runner = Runner::new(app_loop);
    event_loop
        .run_app(&mut runner)
        .context("Event loop failed")?;

    runner.app_loop.shutdown();
    Ok(runner.app_loop.status())
}
