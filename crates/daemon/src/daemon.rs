//! Daemon composition and lifecycle.
//!
//! Wires the real tool adapters into a scheduler and runs it, optionally
//! alongside the status HTTP server.

use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::adapter::Tools;
use crate::encode::HandBrakeEncode;
use crate::metadata::ArmLookup;
use crate::rip::MakeMkvRip;
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::startup::{run_startup_checks, ensure_directories, StartupError};
use crate::status_server::run_status_server;
use ripd_config::{Config, ConfigError};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),
}

/// Daemon state: a wired scheduler plus the handle other components use to
/// reach it.
pub struct Daemon {
    pub config: Config,
    scheduler: Scheduler,
    handle: SchedulerHandle,
}

impl Daemon {
    /// Initialize the daemon with configuration from file.
    ///
    /// The full startup sequence:
    /// 1. Load config from file, apply environment overrides
    /// 2. Optionally override the drive device
    /// 3. Create working directories, probe makemkvcon and HandBrakeCLI
    /// 4. Wire tool adapters into a scheduler
    pub fn new<P: AsRef<Path>>(
        config_path: P,
        device_override: Option<String>,
    ) -> Result<Self, DaemonError> {
        let mut config = Config::load(config_path)?;
        if let Some(device) = device_override {
            config.drive.device = device;
        }

        run_startup_checks(&config)?;
        Ok(Self::build(config))
    }

    /// Initialize the daemon with an existing configuration.
    pub fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Ok(Self::build(config))
    }

    /// Initialize the daemon without probing external tools.
    ///
    /// Useful for testing when makemkvcon and HandBrakeCLI are not
    /// available. Working directories are still created.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        ensure_directories(&config)?;
        Ok(Self::build(config))
    }

    fn build(config: Config) -> Self {
        let tools = Tools {
            rip: Arc::new(MakeMkvRip::new(config.rip.clone())),
            encode: Arc::new(HandBrakeEncode::new(config.encode.clone())),
            metadata: Arc::new(ArmLookup::new(config.metadata.clone())),
        };

        let (scheduler, handle) = Scheduler::new(config.clone(), tools);
        Self {
            config,
            scheduler,
            handle,
        }
    }

    /// Handle for event transports, operator commands, and snapshots.
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Run the scheduling loop until every command handle is dropped.
    pub async fn run(self) {
        tracing::info!(
            device = %self.config.drive.device,
            output = %self.config.dirs.output_dir.display(),
            "Daemon starting"
        );
        self.scheduler.run().await;
        tracing::info!("Daemon stopped");
    }

    /// Run the scheduling loop with the status HTTP server alongside.
    pub async fn run_with_server(self) {
        let handle = self.handle();
        let _server = tokio::spawn(async move {
            if let Err(e) = run_status_server(handle).await {
                tracing::error!(error = %e, "Status server error");
            }
        });

        self.run().await;
    }
}
