//! Job records and the durable job store.
//!
//! One job tracks a single disc from insertion to filed output. Jobs are
//! persisted as JSON files in a state directory, one file per job id, written
//! atomically (temp file + rename) so a crash mid-write never corrupts a record.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Stage of a job in the rip/encode pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    /// Disc detected, waiting for the rip slot.
    Detected,
    /// Scanning the disc for titles.
    Identifying,
    /// Extracting selected titles from the disc.
    Ripping,
    /// All raw titles extracted and marker-complete.
    RipComplete,
    /// Transcoding raw titles.
    Encoding,
    /// All outputs produced and marker-complete.
    EncodeComplete,
    /// Moving outputs to the media library.
    Finalizing,
    /// Job finished successfully.
    Done,
    /// Job failed; kept visible until retried or cleared.
    Failed,
}

impl Default for JobStage {
    fn default() -> Self {
        Self::Detected
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStage::Detected => write!(f, "detected"),
            JobStage::Identifying => write!(f, "identifying"),
            JobStage::Ripping => write!(f, "ripping"),
            JobStage::RipComplete => write!(f, "rip_complete"),
            JobStage::Encoding => write!(f, "encoding"),
            JobStage::EncodeComplete => write!(f, "encode_complete"),
            JobStage::Finalizing => write!(f, "finalizing"),
            JobStage::Done => write!(f, "done"),
            JobStage::Failed => write!(f, "failed"),
        }
    }
}

impl JobStage {
    /// Check if the stage is terminal (done or failed).
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStage::Done | JobStage::Failed)
    }

    /// Check if the stage occupies the exclusive rip slot.
    pub fn holds_rip_slot(self) -> bool {
        matches!(self, JobStage::Identifying | JobStage::Ripping)
    }

    /// Check whether a transition to `next` is a legal pipeline edge.
    ///
    /// Forward edges advance one stage at a time; the backward edges
    /// (Identifying/Ripping -> Detected, Encoding -> RipComplete) are the
    /// retry paths. Any non-terminal stage may fail. Terminal stages have
    /// no outgoing edges.
    pub fn can_advance_to(self, next: JobStage) -> bool {
        use JobStage::*;
        match (self, next) {
            (Detected, Identifying) => true,
            (Identifying, Ripping) => true,
            (Identifying, Detected) => true,
            (Ripping, RipComplete) => true,
            (Ripping, Detected) => true,
            (RipComplete, Encoding) => true,
            (Encoding, EncodeComplete) => true,
            (Encoding, RipComplete) => true,
            (EncodeComplete, Finalizing) => true,
            (Finalizing, Done) => true,
            (from, Failed) if !from.is_terminal() => true,
            _ => false,
        }
    }
}

/// One extractable title discovered on a disc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleInfo {
    /// Title index as reported by the ripping tool.
    pub index: u32,
    /// Duration in seconds.
    pub duration_secs: u64,
    /// Primary audio language code, if known.
    #[serde(default)]
    pub language: Option<String>,
}

/// Metadata resolved by the lookup collaborator. Absence never blocks a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscMetadata {
    pub title: String,
    #[serde(default)]
    pub year: Option<u32>,
    #[serde(default)]
    pub imdb_id: Option<String>,
}

/// Per-stage attempt counters for the retryable stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAttempts {
    #[serde(default)]
    pub identify: u32,
    #[serde(default)]
    pub rip: u32,
    #[serde(default)]
    pub encode: u32,
}

/// Represents one disc's journey from insertion to filed output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Stable identifier, derived from disc label and a random suffix.
    pub id: String,
    /// Device path of the originating drive.
    pub source_device: String,
    /// Volume label reported at detection time, if any.
    pub disc_label: Option<String>,
    /// Current pipeline stage.
    pub stage: JobStage,
    /// Attempt counters per retryable stage.
    #[serde(default)]
    pub attempts: StageAttempts,
    /// Titles selected during identification.
    #[serde(default)]
    pub titles: Vec<TitleInfo>,
    /// Raw extracted title files, populated after Ripping.
    #[serde(default)]
    pub raw_paths: Vec<PathBuf>,
    /// Encoded output files, populated after Encoding.
    #[serde(default)]
    pub output_paths: Vec<PathBuf>,
    /// Final library locations, populated after Finalizing.
    #[serde(default)]
    pub final_paths: Vec<PathBuf>,
    /// Resolved disc metadata, if any.
    #[serde(default)]
    pub metadata: Option<DiscMetadata>,
    /// Last failure reason, if any.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Unix timestamp (milliseconds) when the job was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) when the job was last updated.
    pub updated_at: i64,
}

impl Job {
    /// Update the job's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    /// Move the job to `next`, enforcing the pipeline edge table.
    pub fn transition(&mut self, next: JobStage) -> Result<(), StoreError> {
        if !self.stage.can_advance_to(next) {
            return Err(StoreError::InvalidTransition {
                from: self.stage,
                to: next,
            });
        }
        self.stage = next;
        self.touch();
        Ok(())
    }

    /// Mark the job as failed with a reason. Always a legal edge from a
    /// non-terminal stage.
    pub fn fail(&mut self, reason: &str) {
        self.stage = JobStage::Failed;
        self.last_error = Some(reason.to_string());
        self.touch();
    }

    /// Check if the job is in a terminal stage.
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Check if the job is active (non-terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// Error type for job store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error accessing the state directory
    #[error("State store IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record failed to serialize or deserialize
    #[error("Record serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// An active job already references this device
    #[error("An active job already exists for device {device}")]
    DuplicateDisc { device: String },

    /// Transition not present in the pipeline edge table
    #[error("Invalid stage transition: {from} -> {to}")]
    InvalidTransition { from: JobStage, to: JobStage },
}

/// Durable collection of job records, one JSON file per job id.
#[derive(Debug, Clone)]
pub struct JobStore {
    state_dir: PathBuf,
}

impl JobStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    /// Create a new job for a detected disc.
    ///
    /// Fails with `DuplicateDisc` if an active (non-terminal) record already
    /// references the same device; at-least-once event delivery makes this
    /// the dedup point for repeated device-ready notifications.
    pub fn create(&self, source_device: &str, disc_label: Option<&str>) -> Result<Job, StoreError> {
        let existing = self.load_all()?;
        if existing
            .iter()
            .any(|j| j.source_device == source_device && j.is_active())
        {
            return Err(StoreError::DuplicateDisc {
                device: source_device.to_string(),
            });
        }

        let now = current_timestamp_ms();
        let job = Job {
            id: new_job_id(disc_label.unwrap_or(source_device)),
            source_device: source_device.to_string(),
            disc_label: disc_label.map(str::to_string),
            stage: JobStage::Detected,
            attempts: StageAttempts::default(),
            titles: Vec::new(),
            raw_paths: Vec::new(),
            output_paths: Vec::new(),
            final_paths: Vec::new(),
            metadata: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        self.persist(&job)?;
        Ok(job)
    }

    /// Persist a job record, overwriting any previous version by id.
    ///
    /// The record is written to a temp file and renamed into place so a crash
    /// mid-write leaves either the old record or the new one, never a torn file.
    pub fn persist(&self, job: &Job) -> Result<(), StoreError> {
        fs::create_dir_all(&self.state_dir)?;

        let final_path = self.record_path(&job.id);
        let tmp_path = self.state_dir.join(format!("{}.json.tmp", job.id));

        let json = serde_json::to_string_pretty(job)?;
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &final_path)?;

        Ok(())
    }

    /// Load all persisted job records.
    ///
    /// Skips files that fail to parse and logs warnings; a corrupt record must
    /// not prevent recovery of the rest of the queue.
    pub fn load_all(&self) -> Result<Vec<Job>, StoreError> {
        if !self.state_dir.exists() {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();

        for entry in fs::read_dir(&self.state_dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match load_job_from_file(&path) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to load job record");
                }
            }
        }

        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    /// List persisted jobs, optionally filtered by stage.
    pub fn list(&self, stage: Option<JobStage>) -> Result<Vec<Job>, StoreError> {
        let jobs = self.load_all()?;
        Ok(match stage {
            Some(s) => jobs.into_iter().filter(|j| j.stage == s).collect(),
            None => jobs,
        })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", id))
    }
}

/// Loads a single job from a JSON file.
fn load_job_from_file(path: &Path) -> Result<Job, StoreError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Build a job id from the disc label (or device path as fallback).
///
/// The sanitized label keeps ids readable; the uuid suffix keeps them unique
/// across restarts when the same disc is ripped twice.
fn new_job_id(hint: &str) -> String {
    let slug: String = hint
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let slug = slug.trim_matches('_');
    let slug = if slug.is_empty() { "disc" } else { slug };

    let suffix = Uuid::new_v4().to_string();
    let suffix = suffix.split('-').next().unwrap_or("00000000");
    format!("{}-{}", slug, suffix)
}

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
