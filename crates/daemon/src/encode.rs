//! HandBrakeCLI adapter: transcode one raw title to one output file.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::adapter::{
    pump_child_stdout, ChildEnd, EncodeTool, ToolFailure, ToolHandle,
};
use ripd_config::EncodeConfig;

/// HandBrakeCLI-backed implementation of [`EncodeTool`].
pub struct HandBrakeEncode {
    config: EncodeConfig,
}

impl HandBrakeEncode {
    pub fn new(config: EncodeConfig) -> Self {
        Self { config }
    }

    /// Build the transcode command for one input/output pair.
    pub fn build_command(&self, input: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.config.handbrake_path);
        cmd.arg("-i").arg(input);
        cmd.arg("-o").arg(output);
        cmd.arg("--preset").arg(&self.config.preset);
        cmd.arg("--encoder").arg(&self.config.encoder);
        cmd.arg("--quality").arg(self.config.quality.to_string());
        // All audio tracks, passed through untouched.
        cmd.arg("--all-audio").arg("--aencoder").arg("copy");
        cmd
    }
}

impl EncodeTool for HandBrakeEncode {
    fn encode(&self, input: &Path, output: &Path) -> ToolHandle<PathBuf> {
        let (handle, mut task) = ToolHandle::pair();
        let mut cmd = self.build_command(input, output);
        let output = output.to_path_buf();

        tokio::spawn(async move {
            let mut child = match cmd.stdout(Stdio::piped()).stderr(Stdio::null()).spawn() {
                Ok(child) => child,
                Err(e) => {
                    task.finish(Err(ToolFailure::transient(format!(
                        "failed to start HandBrakeCLI: {e}"
                    ))));
                    return;
                }
            };

            let reporter = task.progress_reporter();
            let end = pump_child_stdout(&mut child, &mut task, |line| {
                if let Some(pct) = parse_encoding_progress(line) {
                    reporter.report(pct);
                }
            })
            .await;

            let result = match end {
                Ok(ChildEnd::Exited(status)) if status.success() => {
                    if output.exists() {
                        Ok(output.clone())
                    } else {
                        Err(ToolFailure::transient(
                            "HandBrakeCLI reported success but produced no output file",
                        ))
                    }
                }
                Ok(ChildEnd::Exited(status)) => Err(match status.code() {
                    Some(code) => {
                        ToolFailure::transient(format!("HandBrakeCLI exited with code {code}"))
                    }
                    None => ToolFailure::transient("HandBrakeCLI terminated by signal"),
                }),
                Ok(ChildEnd::Cancelled) => Err(ToolFailure::permanent("encode cancelled")),
                Err(e) => Err(ToolFailure::transient(format!(
                    "HandBrakeCLI output error: {e}"
                ))),
            };

            if result.is_err() {
                // A torn output must not be mistaken for a finished encode.
                let _ = std::fs::remove_file(&output);
            }
            task.finish(result);
        });

        handle
    }
}

/// Parse the percent out of a HandBrake progress line:
/// `Encoding: task 1 of 1, 45.23 % (148.34 fps, avg 152.11 fps, ETA 00h12m34s)`
pub fn parse_encoding_progress(line: &str) -> Option<f32> {
    let rest = line.trim().strip_prefix("Encoding: task ")?;
    // Skip "N of M, " up to the percent value.
    let (_, after_comma) = rest.split_once(", ")?;
    let (value, after_value) = after_comma.split_once(' ')?;
    if !after_value.starts_with('%') {
        return None;
    }
    let pct: f32 = value.parse().ok()?;
    if (0.0..=100.0).contains(&pct) {
        Some(pct)
    } else {
        None
    }
}
