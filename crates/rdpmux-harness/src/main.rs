//! Example host embedding `rdpmux-display` without a real emulator.
//!
//! Drives the library the way a VMM would: initialize a session, announce
//! a synthetic framebuffer, push a few dirty rectangles, and connect to
//! whatever consumer is listening on a given socket path. Useful for
//! exercising the pipeline end-to-end against a hand-written test consumer.

mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use config::HarnessConfig;

/// Drive the display multiplexing pipeline against a local socket path.
#[derive(Parser, Debug)]
#[command(name = "rdpmux-harness", version, about)]
struct Cli {
    /// 36-character VM identity string (routing identity on the transport).
    #[arg(long)]
    uuid: String,

    /// Numeric VM id, used to name the shared-memory region `/<id>.rdpmux`.
    #[arg(long)]
    vm_id: i32,

    /// Path of the consumer's transport socket.
    #[arg(long)]
    socket: PathBuf,

    /// Path to a TOML config file for the synthetic surface geometry and
    /// simulated refresh cadence. Fields not present fall back to defaults.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Width of the synthetic framebuffer. Overrides the config file.
    #[arg(long)]
    width: Option<i32>,

    /// Height of the synthetic framebuffer. Overrides the config file.
    #[arg(long)]
    height: Option<i32>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => HarnessConfig::load(path).context("failed to load harness config")?,
        None => HarnessConfig::default(),
    };
    if let Some(width) = cli.width {
        config.surface.width = width;
    }
    if let Some(height) = cli.height {
        config.surface.height = height;
    }

    let handle = rdpmux_display::init(&cli.uuid).context("failed to initialize display session")?;

    rdpmux_display::register_callbacks(
        &handle,
        |keycode, flags| tracing::info!(keycode, flags, "keyboard event from consumer"),
        |x, y, flags| tracing::info!(x, y, flags, "mouse event from consumer"),
    );

    rdpmux_display::connect(&handle, &cli.socket, cli.vm_id)
        .context("failed to connect transport")?;
    rdpmux_display::spawn_threads(&handle);

    let bpp = 4;
    let width = config.surface.width;
    let height = config.surface.height;
    let stride = width * bpp;
    let buffer = vec![0u8; (stride * height) as usize];

    // SAFETY: `buffer` outlives this call and is sized exactly `stride * height`.
    let surface = rdpmux_display::FrameSurface {
        data: buffer.as_ptr(),
        len: buffer.len(),
        width,
        height,
        format: 0,
        stride,
        bpp: bpp * 8,
    };

    rdpmux_display::display_switch(&handle, surface).context("initial display switch failed")?;

    tracing::info!("Session running, simulating guest activity");

    for tick in 0..config.simulation.ticks {
        rdpmux_display::display_update(&handle, (tick as i32) * 16, 0, 16, 16);
        rdpmux_display::display_refresh(&handle);
        std::thread::sleep(Duration::from_millis(config.simulation.tick_interval_ms));
    }

    std::thread::sleep(Duration::from_secs(1));
    rdpmux_display::cleanup(&handle);

    Ok(())
}
