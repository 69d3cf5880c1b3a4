// Application loop
//
// A program is four callbacks: init once, then events and iterations until
// one of them returns a terminal result, then quit. `AppLoop` enforces that
// order; the host (see `runner`) only forwards what happens to it.

pub mod runner;

use anyhow::Result;
use std::mem;

use crate::backend::{DeviceDesc, Gpu, WindowDesc};
use crate::config::Config;

/// Outcome of a callback. Anything but `Continue` ends the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppResult {
    Continue,
    Success,
    Failure,
}

impl AppResult {
    pub fn is_terminal(self) -> bool {
        self != AppResult::Continue
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEvent {
    /// The user asked to close the program.
    Quit,
    Resized { width: u32, height: u32 },
}

/// What the host provides to `AppCallbacks::init`.
pub trait Platform {
    type Gpu: Gpu;

    fn create_window(&mut self, desc: &WindowDesc) -> Result<<Self::Gpu as Gpu>::Window>;

    fn create_gpu_device(&mut self, desc: &DeviceDesc) -> Result<Self::Gpu>;
}

pub trait AppCallbacks: Sized {
    type Gpu: Gpu;

    /// Build the application. An error ends the program with `Failure`
    /// and `quit` is never called.
    fn init<P>(platform: &mut P, config: &Config) -> Result<Self>
    where
        P: Platform<Gpu = Self::Gpu>;

    fn event(&mut self, event: &AppEvent) -> AppResult {
        match event {
            AppEvent::Quit => AppResult::Success,
            _ => AppResult::Continue,
        }
    }

    fn iterate(&mut self) -> AppResult;

    /// Last call. Owns the application so it can release everything.
    fn quit(self, result: AppResult);
}

enum LoopState<A> {
    Uninitialized,
    Running(A),
    Terminated(AppResult),
}

pub struct AppLoop<A> {
    config: Config,
    state: LoopState<A>,
}

impl<A: AppCallbacks> AppLoop<A> {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: LoopState::Uninitialized,
        }
    }

    pub fn init<P>(&mut self, platform: &mut P) -> AppResult
    where
        P: Platform<Gpu = A::Gpu>,
    {
        if !matches!(self.state, LoopState::Uninitialized) {
            log::debug!("Application already initialized");
            return self.status();
        }

        match A::init(platform, &self.config) {
            Ok(app) => {
                self.state = LoopState::Running(app);
                AppResult::Continue
            }
            Err(e) => {
                log::error!("Initialization failed: {:#}", e);
                self.state = LoopState::Terminated(AppResult::Failure);
                AppResult::Failure
            }
        }
    }

    pub fn handle_event(&mut self, event: &AppEvent) -> AppResult {
        let result = match &mut self.state {
            LoopState::Running(app) => app.event(event),
            _ => return self.status(),
        };
        self.settle(result)
    }

    pub fn iterate(&mut self) -> AppResult {
        let result = match &mut self.state {
            LoopState::Running(app) => app.iterate(),
            _ => return self.status(),
        };
        self.settle(result)
    }

    /// The host is going away. A still-running application quits with
    /// `Success`.
    pub fn shutdown(&mut self) {
        if matches!(self.state, LoopState::Running(_)) {
            log::info!("Event loop ended while running, quitting");
            self.settle(AppResult::Success);
        }
    }

    pub fn status(&self) -> AppResult {
        match self.state {
            LoopState::Terminated(result) => result,
            _ => AppResult::Continue,
        }
    }

    #[cfg(test)]
    pub fn app(&self) -> Option<&A> {
        match &self.state {
            LoopState::Running(app) => Some(app),
            _ => None,
        }
    }

    fn settle(&mut self, result: AppResult) -> AppResult {
        if result.is_terminal() {
            let previous = mem::replace(&mut self.state, LoopState::Terminated(result));
            if let LoopState::Running(app) = previous {
                app.quit(result);
            }
        }
        result
    }
}
