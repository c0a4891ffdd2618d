use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use facewatch::config::AppConfig;

#[derive(Parser)]
#[command(name = "facewatch", version, about = "Outlet presence monitoring with face recognition")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the supervisor and all camera workers for the configured outlet
    Run {
        #[arg(long, default_value = "facewatch.yaml")]
        config: PathBuf,
        /// Force per-camera preview JPEGs on
        #[arg(long)]
        preview: bool,
        /// Force per-camera preview JPEGs off
        #[arg(long, conflicts_with = "preview")]
        no_preview: bool,
        /// Use simulated sources instead of the configured cameras
        #[arg(long)]
        simulate: bool,
    },
    /// Capture face samples and store them as an enrolled identity
    Enroll {
        #[arg(long, default_value = "facewatch.yaml")]
        config: PathBuf,
        #[arg(long = "target_id")]
        target_id: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = 30)]
        samples: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Run { config, preview, no_preview, simulate } => {
            let config = AppConfig::load(&config)?;
            let preview_override = if preview {
                Some(true)
            } else if no_preview {
                Some(false)
            } else {
                None
            };
            facewatch::supervisor::run(config, preview_override, simulate)
        }
        Command::Enroll { config, target_id, name, samples } => {
            let config = AppConfig::load(&config)?;
            facewatch::enroll::enroll(&config, &target_id, &name, samples)
        }
    }
}
