// =============================================================================
// HELLO TRIANGLE - One triangle through the GPU abstraction
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (app::runner)                                 │
// │    └── AppLoop: init -> event/iterate ... -> quit               │
// │          └── TriangleApp (RenderState)                          │
// │                └── Gpu contract (backend)                       │
// │                      └── VulkanGpu: device, swapchain, passes   │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Acquire a command buffer
// 2. Wait for a swapchain image
// 3. Record one render pass: clear, viewport, pipeline, draw 3 vertices
// 4. Submit and present
//
// =============================================================================

mod app;
mod backend;
mod config;
mod files;
mod triangle;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use app::{AppLoop, AppResult};
use backend::VulkanGpu;
use config::Config;
use std::fs::File;
use std::process::ExitCode;
use triangle::TriangleApp;

fn main() -> Result<ExitCode> {
    let config = Config::load();

    init_logging(&config)?;
    log::info!("Starting {}", config.window.title);
    log::info!("Present mode: {}", config.graphics.present_mode);
    log::info!("Vertex source: {:?}", config.graphics.vertex_source);

    let app_loop = AppLoop::<TriangleApp<VulkanGpu>>::new(config);
    let result = app::runner::run(app_loop)?;

    Ok(match result {
        AppResult::Success => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

/// Initialize logging. `RUST_LOG` overrides the configured level.
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let level = config
        .debug
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);

    let mut builder = Builder::new();
    builder.filter_level(level);
    builder.parse_default_env();

    if config.debug.log_to_file {
        let file = File::create(&config.debug.log_file)
            .with_context(|| format!("Failed to create log file {:?}", config.debug.log_file))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.try_init().context("Logger already initialized")?;
    Ok(())
}
