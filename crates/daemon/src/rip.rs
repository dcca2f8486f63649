//! MakeMKV adapter: disc scanning, title extraction, eject.
//!
//! Drives `makemkvcon` in robot mode (`-r`), where output is structured
//! CSV-ish lines:
//! - `CINFO:attr,code,"value"` (disc attributes)
//! - `TINFO:title,attr,code,"value"` (per-title attributes)
//! - `SINFO:title,stream,attr,code,"value"` (per-stream attributes)
//! - `PRGV:current,total,max` (progress)

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::adapter::{
    pump_child_stdout, ChildEnd, DiscInfo, RipRequest, RipTool, ToolFailure, ToolHandle, ToolTask,
};
use crate::jobs::TitleInfo;
use ripd_config::RipConfig;

// MakeMKV attribute codes (apdefs.h).
const ATTR_NAME: u32 = 2;
const ATTR_LANG_CODE: u32 = 3;
const ATTR_TYPE: u32 = 1;
const ATTR_DURATION: u32 = 9;
const ATTR_VOLUME_NAME: u32 = 19;

/// MakeMKV-backed implementation of [`RipTool`].
pub struct MakeMkvRip {
    config: RipConfig,
}

impl MakeMkvRip {
    pub fn new(config: RipConfig) -> Self {
        Self { config }
    }

    /// Build the robot-mode scan command for a device.
    pub fn build_scan_command(&self, device: &str) -> Command {
        let mut cmd = Command::new(&self.config.makemkv_path);
        cmd.arg("-r").arg("info").arg(device_source(device));
        cmd
    }

    /// Build the robot-mode extraction command for one title.
    ///
    /// MakeMKV names its own output file inside `dest_dir`; the caller finds
    /// and relocates it after a successful run.
    pub fn build_rip_command(&self, device: &str, title_index: u32, dest_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.config.makemkv_path);
        cmd.arg("-r")
            .arg("mkv")
            .arg(device_source(device))
            .arg(title_index.to_string())
            .arg(dest_dir);
        cmd
    }
}

impl RipTool for MakeMkvRip {
    fn scan(&self, device: &str) -> ToolHandle<DiscInfo> {
        let (handle, mut task) = ToolHandle::pair();
        let mut cmd = self.build_scan_command(device);
        let min_duration = self.config.min_title_duration_secs;
        let max_titles = self.config.max_titles;
        let device = device.to_string();

        tokio::spawn(async move {
            let mut child = match cmd.stdout(Stdio::piped()).stderr(Stdio::null()).spawn() {
                Ok(child) => child,
                Err(e) => {
                    task.finish(Err(ToolFailure::transient(format!(
                        "failed to start makemkvcon: {e}"
                    ))));
                    return;
                }
            };

            let mut parser = ScanParser::new();
            let reporter = task.progress_reporter();
            let end = pump_child_stdout(&mut child, &mut task, |line| {
                parser.parse_line(line);
                if let Some(pct) = parser.progress_percent() {
                    reporter.report(pct);
                }
            })
            .await;

            match end {
                Ok(ChildEnd::Exited(status)) if status.success() => {
                    let mut info = parser.finish();
                    info.titles = select_titles(&info.titles, min_duration, max_titles);
                    if info.titles.is_empty() {
                        task.finish(Err(ToolFailure::permanent(format!(
                            "no titles of at least {min_duration}s found on {device}"
                        ))));
                    } else {
                        task.finish(Ok(info));
                    }
                }
                Ok(ChildEnd::Exited(status)) => {
                    task.finish(Err(classify_exit_code(status.code())));
                }
                Ok(ChildEnd::Cancelled) => {
                    task.finish(Err(ToolFailure::permanent("scan cancelled")));
                }
                Err(e) => {
                    task.finish(Err(ToolFailure::transient(format!(
                        "makemkvcon output error: {e}"
                    ))));
                }
            }
        });

        handle
    }

    fn rip_title(&self, request: RipRequest) -> ToolHandle<PathBuf> {
        let (handle, mut task) = ToolHandle::pair();

        // MakeMKV picks its own filename, so extract into a scratch dir next
        // to the reserved path and move the single result into place.
        let scratch = scratch_dir(&request.dest, request.title_index);
        let mut cmd = self.build_rip_command(&request.device, request.title_index, &scratch);

        tokio::spawn(async move {
            if let Err(e) = fs::create_dir_all(&scratch) {
                task.finish(Err(ToolFailure::transient(format!(
                    "failed to create rip scratch dir: {e}"
                ))));
                return;
            }

            let mut child = match cmd.stdout(Stdio::piped()).stderr(Stdio::null()).spawn() {
                Ok(child) => child,
                Err(e) => {
                    task.finish(Err(ToolFailure::transient(format!(
                        "failed to start makemkvcon: {e}"
                    ))));
                    return;
                }
            };

            let mut progress = ProgressLine::default();
            let reporter = task.progress_reporter();
            let end = pump_child_stdout(&mut child, &mut task, |line| {
                if let Some(pct) = progress.observe(line) {
                    reporter.report(pct);
                }
            })
            .await;

            let result = match end {
                Ok(ChildEnd::Exited(status)) if status.success() => {
                    collect_ripped_file(&scratch, &request.dest)
                }
                Ok(ChildEnd::Exited(status)) => Err(classify_exit_code(status.code())),
                Ok(ChildEnd::Cancelled) => Err(ToolFailure::permanent("rip cancelled")),
                Err(e) => Err(ToolFailure::transient(format!(
                    "makemkvcon output error: {e}"
                ))),
            };

            if result.is_err() {
                let _ = fs::remove_dir_all(&scratch);
            }
            task.finish(result);
        });

        handle
    }

    fn eject(&self, device: &str) -> ToolHandle<()> {
        let (handle, task) = ToolHandle::pair();
        let device = device.to_string();

        tokio::spawn(async move {
            let status = Command::new("eject")
                .arg(&device)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;

            let result = match status {
                Ok(s) if s.success() => Ok(()),
                Ok(s) => Err(ToolFailure::transient(format!(
                    "eject {device} exited with {s}"
                ))),
                Err(e) => Err(ToolFailure::transient(format!("failed to run eject: {e}"))),
            };
            task.finish(result);
        });

        handle
    }
}

/// Convert a device path to MakeMKV's source syntax.
fn device_source(device: &str) -> String {
    if device.starts_with("disc:") {
        device.to_string()
    } else {
        format!("dev:{device}")
    }
}

fn scratch_dir(dest: &Path, title_index: u32) -> PathBuf {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".mkv_t{title_index:02}"))
}

/// Move the single mkv MakeMKV produced in the scratch dir to the reserved
/// destination and clean the scratch up.
fn collect_ripped_file(scratch: &Path, dest: &Path) -> Result<PathBuf, ToolFailure> {
    let io_err = |e: std::io::Error| ToolFailure::transient(format!("rip output error: {e}"));

    let produced = fs::read_dir(scratch)
        .map_err(io_err)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.extension().and_then(|e| e.to_str()) == Some("mkv"));

    let Some(produced) = produced else {
        return Err(ToolFailure::transient(
            "makemkvcon reported success but produced no mkv file",
        ));
    };

    fs::rename(&produced, dest).map_err(io_err)?;
    let _ = fs::remove_dir_all(scratch);
    Ok(dest.to_path_buf())
}

/// Map makemkvcon exit codes onto the retry taxonomy.
///
/// 2 means no readable disc and 253 means the license key was rejected;
/// neither gets better on retry. Everything else is assumed environmental.
pub fn classify_exit_code(code: Option<i32>) -> ToolFailure {
    match code {
        Some(2) => ToolFailure::permanent("makemkvcon: no disc in drive (exit code 2)"),
        Some(253) => {
            ToolFailure::permanent("makemkvcon: license key rejected or expired (exit code 253)")
        }
        Some(code) => ToolFailure::transient(format!("makemkvcon exited with code {code}")),
        None => ToolFailure::transient("makemkvcon terminated by signal"),
    }
}

/// Select which discovered titles to extract: drop anything shorter than the
/// minimum, keep the longest `max_titles`, present them in index order.
pub fn select_titles(titles: &[TitleInfo], min_duration_secs: u64, max_titles: usize) -> Vec<TitleInfo> {
    let mut selected: Vec<TitleInfo> = titles
        .iter()
        .filter(|t| t.duration_secs >= min_duration_secs)
        .cloned()
        .collect();

    if selected.len() > max_titles {
        selected.sort_by(|a, b| b.duration_secs.cmp(&a.duration_secs));
        selected.truncate(max_titles);
    }

    selected.sort_by_key(|t| t.index);
    selected
}

#[derive(Default)]
struct TitleBuild {
    duration_secs: u64,
    language: Option<String>,
}

/// Incremental parser for robot-mode scan output.
pub(crate) struct ScanParser {
    label: Option<String>,
    name: Option<String>,
    titles: BTreeMap<u32, TitleBuild>,
    // (title, stream) pairs identified as audio streams.
    audio_streams: std::collections::HashSet<(u32, u32)>,
    progress: ProgressLine,
}

impl ScanParser {
    pub(crate) fn new() -> Self {
        Self {
            label: None,
            name: None,
            titles: BTreeMap::new(),
            audio_streams: std::collections::HashSet::new(),
            progress: ProgressLine::default(),
        }
    }

    pub(crate) fn parse_line(&mut self, line: &str) {
        let line = line.trim();
        let Some((kind, content)) = line.split_once(':') else {
            return;
        };

        match kind {
            "CINFO" => self.parse_cinfo(content),
            "TINFO" => self.parse_tinfo(content),
            "SINFO" => self.parse_sinfo(content),
            "PRGV" => {
                self.progress.observe(line);
            }
            _ => {}
        }
    }

    pub(crate) fn progress_percent(&self) -> Option<f32> {
        self.progress.latest
    }

    pub(crate) fn finish(self) -> DiscInfo {
        let titles = self
            .titles
            .into_iter()
            .map(|(index, build)| TitleInfo {
                index,
                duration_secs: build.duration_secs,
                language: build.language,
            })
            .collect();

        DiscInfo {
            label: self.label.or(self.name),
            titles,
        }
    }

    fn parse_cinfo(&mut self, content: &str) {
        let parts = split_csv(content);
        if parts.len() < 3 {
            return;
        }
        let Ok(attr) = parts[0].parse::<u32>() else {
            return;
        };
        match attr {
            ATTR_VOLUME_NAME => self.label = non_empty(&parts[2]),
            ATTR_NAME => self.name = non_empty(&parts[2]),
            _ => {}
        }
    }

    fn parse_tinfo(&mut self, content: &str) {
        let parts = split_csv(content);
        if parts.len() < 4 {
            return;
        }
        let (Ok(title), Ok(attr)) = (parts[0].parse::<u32>(), parts[1].parse::<u32>()) else {
            return;
        };

        let build = self.titles.entry(title).or_default();
        if attr == ATTR_DURATION {
            build.duration_secs = parse_duration_secs(&parts[3]);
        }
    }

    fn parse_sinfo(&mut self, content: &str) {
        let parts = split_csv(content);
        if parts.len() < 5 {
            return;
        }
        let (Ok(title), Ok(stream), Ok(attr)) = (
            parts[0].parse::<u32>(),
            parts[1].parse::<u32>(),
            parts[2].parse::<u32>(),
        ) else {
            return;
        };

        match attr {
            ATTR_TYPE if parts[4].contains("Audio") => {
                self.audio_streams.insert((title, stream));
            }
            ATTR_LANG_CODE if self.audio_streams.contains(&(title, stream)) => {
                if let Some(build) = self.titles.get_mut(&title) {
                    if build.language.is_none() {
                        build.language = non_empty(&parts[4]);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Tracks the most recent `PRGV:current,total,max` progress value.
#[derive(Default)]
struct ProgressLine {
    latest: Option<f32>,
}

impl ProgressLine {
    /// Feed a line; returns the updated percent if the line carried progress.
    fn observe(&mut self, line: &str) -> Option<f32> {
        let content = line.trim().strip_prefix("PRGV:")?;
        let mut parts = content.split(',');
        let current: f64 = parts.next()?.trim().parse().ok()?;
        let _total = parts.next()?;
        let max: f64 = parts.next()?.trim().parse().ok()?;
        if max <= 0.0 {
            return None;
        }
        let pct = ((current / max) * 100.0) as f32;
        self.latest = Some(pct);
        Some(pct)
    }
}

/// Split robot-mode CSV content, honoring double-quoted fields.
fn split_csv(content: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in content.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                result.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    result.push(current);
    result
}

/// Parse a `H:MM:SS` or `MM:SS` duration to seconds. Unparseable input is 0.
fn parse_duration_secs(value: &str) -> u64 {
    let parts: Vec<&str> = value.split(':').collect();
    let nums: Vec<u64> = parts.iter().filter_map(|p| p.trim().parse().ok()).collect();
    if nums.len() != parts.len() {
        return 0;
    }
    match nums.as_slice() {
        [h, m, s] => h * 3600 + m * 60 + s,
        [m, s] => m * 60 + s,
        _ => 0,
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
