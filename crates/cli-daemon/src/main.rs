//! CLI entry point for ripd
//!
//! Parses command line arguments, initializes logging, and starts the daemon.

use clap::Parser;
use ripd::{Config, Daemon};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// ripd - automated optical disc ripping and encoding daemon
#[derive(Parser, Debug)]
#[command(name = "ripd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Optical drive device, overriding the configured one
    #[arg(short, long)]
    device: Option<String>,

    /// Skip startup checks (makemkvcon, HandBrakeCLI). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let daemon_result = if args.skip_checks {
        tracing::warn!("Skipping startup checks (--skip-checks enabled)");
        Config::load(&args.config)
            .map_err(Into::into)
            .and_then(|mut config| {
                if let Some(device) = args.device.clone() {
                    config.drive.device = device;
                }
                Daemon::new_without_checks(config)
            })
    } else {
        Daemon::new(&args.config, args.device.clone())
    };

    match daemon_result {
        Ok(daemon) => {
            tracing::info!(
                config = %args.config.display(),
                device = %daemon.config.drive.device,
                "ripd initialized, status server on http://127.0.0.1:7979/jobs"
            );
            daemon.run_with_server().await;
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to initialize daemon: {}", e);
            ExitCode::FAILURE
        }
    }
}
