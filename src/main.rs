// SPDX-License-Identifier: GPL-3.0-only

use camera_hal::Config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "camera-hal")]
#[command(about = "Inspect and drive cameras through the camera HAL")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available cameras
    List,

    /// Capture frames and print each completed request
    Capture {
        /// Camera id or index (from 'camera-hal list')
        #[arg(short, long, default_value = "0")]
        camera: String,

        /// Number of requests to complete
        #[arg(short, long, default_value = "8")]
        frames: u32,

        /// Frame size as WIDTHxHEIGHT
        #[arg(short, long)]
        size: Option<String>,
    },

    /// List the controls of a V4L2 device node
    Controls {
        /// Path such as /dev/video0 or /dev/v4l-subdev2
        device: PathBuf,
    },

    /// Read controls from a V4L2 device node
    Get {
        device: PathBuf,

        /// Control ids, decimal or 0x-prefixed
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Write controls on a V4L2 device node
    Set {
        device: PathBuf,

        /// Assignments as ID=VALUE
        #[arg(required = true)]
        values: Vec<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    // Initialize logging
    // RUST_LOG overrides the configured filter
    // Examples: RUST_LOG=debug, RUST_LOG=camera_hal=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List => cli::list_cameras(config),
        Commands::Capture {
            camera,
            frames,
            size,
        } => cli::capture(config, &camera, frames, size.as_deref()),
        Commands::Controls { device } => cli::list_controls(&device),
        Commands::Get { device, ids } => cli::get_controls(&device, &ids),
        Commands::Set { device, values } => cli::set_controls(&device, &values),
    }
}
