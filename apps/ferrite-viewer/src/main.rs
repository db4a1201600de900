//! Ferrite Demo Viewer
//!
//! Opens a window and clears it every frame through the RHI frame protocol.
//! Minimizing and resizing exercise the swapchain rebuild path.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p ferrite-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--width <N>`: Initial window width (default: 800)
//! - `--height <N>`: Initial window height (default: 600)
//! - `--no-validation`: Disable Vulkan validation layers
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use ferrite_platform::{PlatformWindow, WindowConfig};
use ferrite_rhi::{Rhi, RhiConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app::ClearPass;

const TITLE: &str = "Ferrite Viewer";
const WIDTH: u32 = 800;
const HEIGHT: u32 = 600;

/// Command line options.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ViewerArgs {
    width: u32,
    height: u32,
    validation: bool,
}

impl Default for ViewerArgs {
    fn default() -> Self {
        Self {
            width: WIDTH,
            height: HEIGHT,
            validation: cfg!(debug_assertions),
        }
    }
}

impl ViewerArgs {
    /// Parse options, ignoring anything unrecognized or malformed.
    fn parse(args: &[String]) -> Self {
        let mut parsed = Self::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--width" | "--height" => {
                    if let Some(v) = args.get(i + 1).and_then(|v| v.parse::<u32>().ok()) {
                        if args[i] == "--width" {
                            parsed.width = v;
                        } else {
                            parsed.height = v;
                        }
                        i += 1;
                    }
                }
                "--no-validation" => parsed.validation = false,
                _ => {}
            }
            i += 1;
        }

        parsed
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }
    let args = ViewerArgs::parse(&args);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("{TITLE} starting...");

    let mut window =
        PlatformWindow::new(WindowConfig::new(TITLE).with_size(args.width, args.height))?;
    let config = RhiConfig::new().app_name(TITLE).validation(args.validation);
    let mut rhi = Rhi::new(&config, &mut window)?;
    info!("GPU: {}", rhi.adapter_info().summary());

    let mut pass = ClearPass::new(&rhi)?;
    let result = run(&mut rhi, &mut window, &mut pass);

    rhi.device().wait_idle()?;
    pass.destroy(&rhi);
    info!(frames = rhi.frames_issued(), "Shutting down");
    result
}

fn run(rhi: &mut Rhi, window: &mut PlatformWindow, pass: &mut ClearPass) -> anyhow::Result<()> {
    let mut frame = 0u64;
    loop {
        window.poll_events()?;
        if window.should_close() {
            return Ok(());
        }

        rhi.wait_for_fences()?;
        rhi.reset_command_pool()?;

        let mut rebuilt = Ok(());
        let recording = rhi.prepare_before_pass(window, |rhi| rebuilt = pass.rebuild(rhi))?;
        rebuilt?;
        if !recording {
            continue;
        }

        pass.record(rhi, frame)?;

        let mut rebuilt = Ok(());
        rhi.submit_rendering(window, |rhi| rebuilt = pass.rebuild(rhi))?;
        rebuilt?;
        frame += 1;
    }
}

fn print_help() {
    eprintln!(
        "Ferrite Demo Viewer

USAGE:
    cargo run -p ferrite-viewer -- [OPTIONS]

OPTIONS:
    --width <N>             Initial window width (default: {WIDTH})
    --height <N>            Initial window height (default: {HEIGHT})
    --no-validation         Disable Vulkan validation layers
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("ferrite-viewer")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_to_800x600() {
        let parsed = ViewerArgs::parse(&args(&[]));
        assert_eq!((parsed.width, parsed.height), (800, 600));
    }

    #[test]
    fn parses_size_and_validation_flags() {
        let parsed = ViewerArgs::parse(&args(&[
            "--width",
            "1024",
            "--no-validation",
            "--height",
            "768",
        ]));
        assert_eq!(
            parsed,
            ViewerArgs {
                width: 1024,
                height: 768,
                validation: false,
            }
        );
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let parsed = ViewerArgs::parse(&args(&["--width", "wide", "--height"]));
        assert_eq!((parsed.width, parsed.height), (800, 600));
    }
}
