//! Startup checks: preflight verification before the daemon accepts discs.
//!
//! - makemkvcon availability check
//! - HandBrakeCLI availability check
//! - Working directory creation (raw, staging, output, state)

use ripd_config::Config;
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("MakeMKV not available: {0}")]
    MakeMkvUnavailable(String),

    #[error("HandBrake not available: {0}")]
    HandBrakeUnavailable(String),

    #[error("Failed to create directory {path}: {source}")]
    DirectoryFailed {
        path: String,
        source: std::io::Error,
    },
}

/// Check that makemkvcon can be spawned.
///
/// makemkvcon has no version subcommand; invoked without arguments it prints
/// usage and exits non-zero. A successful spawn is the availability signal,
/// only a failure to launch (not in PATH, not executable) is an error.
pub fn check_makemkv_available(makemkv_path: &str) -> Result<(), StartupError> {
    Command::new(makemkv_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map_err(|e| {
            StartupError::MakeMkvUnavailable(format!(
                "failed to run {}; is MakeMKV installed and in PATH? Error: {}",
                makemkv_path, e
            ))
        })?;
    Ok(())
}

/// Check that `HandBrakeCLI --version` executes successfully.
pub fn check_handbrake_available(handbrake_path: &str) -> Result<(), StartupError> {
    let output = Command::new(handbrake_path)
        .arg("--version")
        .stderr(Stdio::null())
        .output()
        .map_err(|e| {
            StartupError::HandBrakeUnavailable(format!(
                "failed to run {} --version; is HandBrake installed and in PATH? Error: {}",
                handbrake_path, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::HandBrakeUnavailable(format!(
            "{} --version exited with {}",
            handbrake_path, output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    match parse_handbrake_version(&stdout) {
        Some(version) => tracing::info!(version = %version, "HandBrake available"),
        None => tracing::warn!("HandBrake available but version output unrecognized"),
    }

    Ok(())
}

/// Extract the version number from `HandBrakeCLI --version` output.
///
/// Expected shape: a line `HandBrake 1.7.2` (release builds may append a
/// date or git suffix after the number).
pub fn parse_handbrake_version(version_output: &str) -> Option<String> {
    let rest = version_output
        .lines()
        .find_map(|line| line.trim_start().strip_prefix("HandBrake "))?;

    let version = rest.split_whitespace().next()?;

    if version.chars().next()?.is_ascii_digit() {
        Some(version.to_string())
    } else {
        None
    }
}

/// Create the daemon's working directories.
pub fn ensure_directories(cfg: &Config) -> Result<(), StartupError> {
    for dir in [
        &cfg.dirs.raw_dir,
        &cfg.dirs.staging_dir,
        &cfg.dirs.output_dir,
        &cfg.dirs.state_dir,
    ] {
        create_dir(dir)?;
    }
    Ok(())
}

fn create_dir(path: &Path) -> Result<(), StartupError> {
    std::fs::create_dir_all(path).map_err(|source| StartupError::DirectoryFailed {
        path: path.display().to_string(),
        source,
    })
}

/// Run all startup checks in order
///
/// 1. Working directory creation
/// 2. MakeMKV availability
/// 3. HandBrake availability
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    ensure_directories(cfg)?;
    check_makemkv_available(&cfg.rip.makemkv_path)?;
    check_handbrake_available(&cfg.encode.handbrake_path)?;
    Ok(())
}
