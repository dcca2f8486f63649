//! Queue manager: owns all job state and drives the pipeline.
//!
//! One scheduling loop receives disc events, operator commands, and stage
//! outcomes over channels; nothing else mutates jobs. Each stage start
//! follows write-ahead order: bump the attempt counter, persist the intended
//! stage, then launch the side effect. Completion markers let a restarted
//! daemon reconcile claimed stages against what actually finished.
//!
//! Slots: one exclusive rip slot covers Identifying and Ripping (the drive
//! is serial); a semaphore of N encode slots bounds concurrent transcodes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, RwLock, Semaphore};

use crate::adapter::Tools;
use crate::artifacts::ArtifactStore;
use crate::ingress::{DiscEvent, Ingress};
use crate::jobs::{Job, JobStage, JobStore, StageAttempts, StoreError};
use crate::naming::OutputNamer;
use crate::pipeline::{
    backoff_delay, spawn_encode, spawn_finalize, spawn_identify, spawn_rip, StageCancel,
    StageHandle, StageOutcome, StageOutput,
};
use ripd_config::Config;

/// Errors surfaced to operators through commands.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("No job with id {0}")]
    UnknownJob(String),

    #[error("Job {0} is already finished")]
    NotCancellable(String),

    #[error("Job {0} is not in the failed stage")]
    NotFailed(String),
}

/// Operator commands, answered over oneshot channels.
#[derive(Debug)]
pub enum Command {
    /// Enqueue a disc that detection missed.
    Enqueue {
        device: String,
        reply: oneshot::Sender<Result<String, SchedulerError>>,
    },
    /// Abandon a job. Running work is killed, the job lands in Failed.
    Cancel {
        job_id: String,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    /// Put a failed job back in the queue at the nearest verifiable boundary.
    Retry {
        job_id: String,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    /// List jobs, optionally filtered by stage.
    List {
        stage: Option<JobStage>,
        reply: oneshot::Sender<Vec<JobSnapshot>>,
    },
}

/// Read-only view of one job for the status surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSnapshot {
    pub id: String,
    pub source_device: String,
    pub disc_label: Option<String>,
    pub stage: JobStage,
    pub attempts: StageAttempts,
    pub titles: usize,
    /// Stage progress percent while a stage is running, absent otherwise.
    #[serde(default)]
    pub progress: Option<f32>,
    pub last_error: Option<String>,
    pub final_paths: Vec<PathBuf>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            source_device: job.source_device.clone(),
            disc_label: job.disc_label.clone(),
            stage: job.stage,
            attempts: job.attempts,
            titles: job.titles.len(),
            progress: None,
            last_error: job.last_error.clone(),
            final_paths: job.final_paths.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Shared snapshot of every job, refreshed by the scheduling loop.
pub type SharedSnapshot = Arc<RwLock<Vec<JobSnapshot>>>;

/// Handles other components use to reach a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub commands: mpsc::Sender<Command>,
    pub ingress: Ingress,
    pub snapshot: SharedSnapshot,
}

/// Concurrent encode slots: the configured value, or a quarter of the cores
/// (at least one) when left at zero.
pub fn effective_encode_slots(configured: u32) -> usize {
    if configured == 0 {
        (num_cpus::get() / 4).max(1)
    } else {
        configured as usize
    }
}

struct ActiveStage {
    stage: JobStage,
    cancel: StageCancel,
    progress: watch::Receiver<f32>,
    // Rip permit spans Identifying and Ripping; encode permit spans Encoding.
    // Dropped with the entry, releasing the slot.
    permit: Option<OwnedSemaphorePermit>,
    cancel_reason: Option<String>,
}

impl ActiveStage {
    fn new(stage: JobStage, driver: StageHandle, permit: Option<OwnedSemaphorePermit>) -> Self {
        Self {
            stage,
            cancel: driver.cancel,
            progress: driver.progress,
            permit,
            cancel_reason: None,
        }
    }
}

pub struct Scheduler {
    config: Config,
    store: JobStore,
    artifacts: ArtifactStore,
    namer: OutputNamer,
    tools: Tools,
    jobs: Vec<Job>,
    running: HashMap<String, ActiveStage>,
    backoff_until: HashMap<String, Instant>,
    // Set on storage failure: in-flight stages finish, nothing new starts.
    admission_halted: bool,
    rip_slot: Arc<Semaphore>,
    encode_slots: Arc<Semaphore>,
    outcome_tx: mpsc::Sender<StageOutcome>,
    outcome_rx: mpsc::Receiver<StageOutcome>,
    command_rx: mpsc::Receiver<Command>,
    event_rx: mpsc::Receiver<DiscEvent>,
    snapshot: SharedSnapshot,
}

impl Scheduler {
    pub fn new(config: Config, tools: Tools) -> (Self, SchedulerHandle) {
        let store = JobStore::new(&config.dirs.state_dir);
        let artifacts = ArtifactStore::new(&config.dirs.raw_dir, &config.dirs.staging_dir);
        let namer = OutputNamer::new(&config.dirs.output_dir);
        let encode_slots = effective_encode_slots(config.encode.encode_slots);

        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (outcome_tx, outcome_rx) = mpsc::channel(64);
        let snapshot: SharedSnapshot = Arc::new(RwLock::new(Vec::new()));

        let handle = SchedulerHandle {
            commands: command_tx,
            ingress: Ingress::new(event_tx),
            snapshot: Arc::clone(&snapshot),
        };

        let scheduler = Self {
            config,
            store,
            artifacts,
            namer,
            tools,
            jobs: Vec::new(),
            running: HashMap::new(),
            backoff_until: HashMap::new(),
            admission_halted: false,
            rip_slot: Arc::new(Semaphore::new(1)),
            encode_slots: Arc::new(Semaphore::new(encode_slots)),
            outcome_tx,
            outcome_rx,
            command_rx,
            event_rx,
            snapshot,
        };

        (scheduler, handle)
    }

    /// Run until the command channel closes.
    pub async fn run(mut self) {
        self.recover();

        let mut tick = tokio::time::interval(Duration::from_millis(250));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            self.dispatch_ready();
            self.refresh_snapshot().await;

            tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                event = self.event_rx.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event),
                    None => events_open = false,
                },
                Some(outcome) = self.outcome_rx.recv() => self.handle_outcome(outcome),
                _ = tick.tick() => {}
            }
        }

        self.refresh_snapshot().await;
    }

    /// Reload persisted jobs and reconcile claimed stages against completion
    /// markers. Attempt counters are preserved.
    fn recover(&mut self) {
        match self.store.load_all() {
            Ok(jobs) => self.jobs = jobs,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load job records, halting admission");
                self.admission_halted = true;
                return;
            }
        }

        for idx in 0..self.jobs.len() {
            let (id, stage) = {
                let job = &self.jobs[idx];
                (job.id.clone(), job.stage)
            };

            match stage {
                JobStage::Identifying => {
                    // Nothing verifiable on disk; identify again.
                    let job = &mut self.jobs[idx];
                    if job.transition(JobStage::Detected).is_ok() {
                        tracing::info!(job = %id, "Recovered interrupted identification");
                    }
                    self.persist_job(idx);
                }
                JobStage::Ripping => {
                    let expected: Vec<PathBuf> = self.jobs[idx]
                        .titles
                        .iter()
                        .map(|t| self.artifacts.raw_title_path(&id, t.index))
                        .collect();

                    if self.artifacts.all_complete(&expected) {
                        tracing::info!(job = %id, "All titles marker-complete, resuming at rip_complete");
                        let job = &mut self.jobs[idx];
                        job.raw_paths = expected;
                        let _ = job.transition(JobStage::RipComplete);
                    } else {
                        tracing::info!(job = %id, "Discarding incomplete rip artifacts");
                        if let Err(e) = self.artifacts.discard_incomplete(&self.artifacts.raw_dir(&id)) {
                            tracing::warn!(job = %id, error = %e, "Artifact cleanup failed");
                        }
                        let _ = self.jobs[idx].transition(JobStage::Detected);
                    }
                    self.persist_job(idx);
                }
                JobStage::Encoding => {
                    let expected: Vec<PathBuf> = self.jobs[idx]
                        .raw_paths
                        .iter()
                        .map(|raw| self.artifacts.output_path_for(&id, raw))
                        .collect();

                    if self.artifacts.all_complete(&expected) {
                        tracing::info!(job = %id, "All outputs marker-complete, resuming at encode_complete");
                        let job = &mut self.jobs[idx];
                        job.output_paths = expected;
                        let _ = job.transition(JobStage::EncodeComplete);
                    } else {
                        tracing::info!(job = %id, "Discarding incomplete encode artifacts");
                        if let Err(e) = self
                            .artifacts
                            .discard_incomplete(&self.artifacts.staging_dir(&id))
                        {
                            tracing::warn!(job = %id, error = %e, "Artifact cleanup failed");
                        }
                        let _ = self.jobs[idx].transition(JobStage::RipComplete);
                    }
                    self.persist_job(idx);
                }
                // Finalizing is re-run as-is: the final move is idempotent.
                _ => {}
            }
        }
    }

    /// Start every job whose stage is waiting and whose slot is free, oldest
    /// first.
    fn dispatch_ready(&mut self) {
        if self.admission_halted {
            return;
        }
        for idx in 0..self.jobs.len() {
            let (id, stage) = {
                let job = &self.jobs[idx];
                (job.id.clone(), job.stage)
            };

            if self.running.contains_key(&id) || !self.backoff_elapsed(&id) {
                continue;
            }

            match stage {
                JobStage::Detected => {
                    let Ok(permit) = Arc::clone(&self.rip_slot).try_acquire_owned() else {
                        continue;
                    };
                    self.backoff_until.remove(&id);

                    let job = &mut self.jobs[idx];
                    job.attempts.identify += 1;
                    if job.transition(JobStage::Identifying).is_err() || !self.persist_job(idx) {
                        continue;
                    }

                    tracing::info!(job = %id, attempt = self.jobs[idx].attempts.identify, "Identifying disc");
                    let driver =
                        spawn_identify(&self.tools, &self.jobs[idx], self.outcome_tx.clone());
                    self.running.insert(
                        id,
                        ActiveStage::new(JobStage::Identifying, driver, Some(permit)),
                    );
                }
                JobStage::RipComplete => {
                    let Ok(permit) = Arc::clone(&self.encode_slots).try_acquire_owned() else {
                        continue;
                    };
                    self.backoff_until.remove(&id);

                    let job = &mut self.jobs[idx];
                    job.attempts.encode += 1;
                    if job.transition(JobStage::Encoding).is_err() || !self.persist_job(idx) {
                        continue;
                    }

                    tracing::info!(job = %id, attempt = self.jobs[idx].attempts.encode, "Encoding titles");
                    let driver = spawn_encode(
                        &self.tools,
                        &self.artifacts,
                        &self.jobs[idx],
                        self.outcome_tx.clone(),
                    );
                    self.running.insert(
                        id,
                        ActiveStage::new(JobStage::Encoding, driver, Some(permit)),
                    );
                }
                JobStage::EncodeComplete => {
                    let job = &mut self.jobs[idx];
                    if job.transition(JobStage::Finalizing).is_err() || !self.persist_job(idx) {
                        continue;
                    }
                    self.start_finalize(idx, &id);
                }
                // A job recovered mid-finalize re-runs the stage directly.
                JobStage::Finalizing => self.start_finalize(idx, &id),
                _ => {}
            }
        }
    }

    fn start_finalize(&mut self, idx: usize, id: &str) {
        tracing::info!(job = %id, "Finalizing outputs");
        let driver = spawn_finalize(
            &self.tools,
            &self.artifacts,
            &self.namer,
            &self.jobs[idx],
            self.outcome_tx.clone(),
        );
        self.running.insert(
            id.to_string(),
            ActiveStage::new(JobStage::Finalizing, driver, None),
        );
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Enqueue { device, reply } => {
                let _ = reply.send(self.enqueue(&device));
            }
            Command::Cancel { job_id, reply } => {
                let _ = reply.send(self.cancel_job(&job_id));
            }
            Command::Retry { job_id, reply } => {
                let _ = reply.send(self.retry_job(&job_id));
            }
            Command::List { stage, reply } => {
                let _ = reply.send(self.list(stage));
            }
        }
    }

    fn handle_event(&mut self, event: DiscEvent) {
        match event {
            DiscEvent::DeviceReady(device) => match self.enqueue(&device) {
                Ok(id) => tracing::info!(job = %id, device = %device, "Disc detected"),
                Err(SchedulerError::Store(StoreError::DuplicateDisc { .. })) => {
                    tracing::debug!(device = %device, "Duplicate ready event ignored");
                }
                Err(e) => tracing::error!(device = %device, error = %e, "Failed to enqueue disc"),
            },
            DiscEvent::DeviceRemoved(device) => self.handle_device_removed(&device),
        }
    }

    /// Losing the device only matters while the disc is still needed: queued
    /// jobs and jobs holding the rip slot fail, later stages are unaffected.
    fn handle_device_removed(&mut self, device: &str) {
        for idx in 0..self.jobs.len() {
            let (id, stage, job_device) = {
                let job = &self.jobs[idx];
                (job.id.clone(), job.stage, job.source_device.clone())
            };
            if job_device != device {
                continue;
            }

            match stage {
                JobStage::Detected => {
                    tracing::warn!(job = %id, device = %device, "Device removed, failing queued job");
                    self.jobs[idx].fail("device removed");
                    self.persist_job(idx);
                }
                JobStage::Identifying | JobStage::Ripping => {
                    tracing::warn!(job = %id, device = %device, "Device removed mid-rip, aborting");
                    if let Some(active) = self.running.get_mut(&id) {
                        active.cancel_reason = Some("device removed".to_string());
                        active.cancel.cancel();
                    } else {
                        self.jobs[idx].fail("device removed");
                        self.persist_job(idx);
                    }
                }
                _ => {}
            }
        }
    }

    fn handle_outcome(&mut self, outcome: StageOutcome) {
        let Some(idx) = self.jobs.iter().position(|j| j.id == outcome.job_id) else {
            return;
        };
        let active = self.running.remove(&outcome.job_id);

        // A stale outcome (job already moved on, e.g. after an operator
        // retry) is dropped.
        if self.jobs[idx].stage != outcome.stage {
            return;
        }

        // An operator or device-removal cancel overrides whatever the tool
        // reported.
        if let Some(reason) = active.as_ref().and_then(|a| a.cancel_reason.clone()) {
            self.jobs[idx].fail(&reason);
            self.persist_job(idx);
            return;
        }

        let id = outcome.job_id.clone();
        match (outcome.stage, outcome.result) {
            (JobStage::Identifying, Ok(StageOutput::Identified { label, titles })) => {
                if titles.is_empty() {
                    self.jobs[idx].fail("no rippable titles found");
                    self.persist_job(idx);
                    return;
                }

                let job = &mut self.jobs[idx];
                if job.disc_label.is_none() {
                    job.disc_label = label;
                }
                job.titles = titles;
                job.attempts.rip += 1;
                if job.transition(JobStage::Ripping).is_err() || !self.persist_job(idx) {
                    return;
                }

                tracing::info!(job = %id, titles = self.jobs[idx].titles.len(), "Ripping titles");
                let driver = spawn_rip(
                    &self.tools,
                    &self.artifacts,
                    &self.jobs[idx],
                    self.outcome_tx.clone(),
                );
                // The rip slot permit carries over from identification.
                let permit = active.and_then(|a| a.permit);
                self.running
                    .insert(id, ActiveStage::new(JobStage::Ripping, driver, permit));
            }
            (JobStage::Ripping, Ok(StageOutput::Ripped { raw_paths })) => {
                // Trust markers, not the tool's word.
                if !self.artifacts.all_complete(&raw_paths) {
                    self.retry_or_fail(idx, "rip finished without complete markers", true);
                    return;
                }

                let job = &mut self.jobs[idx];
                job.raw_paths = raw_paths;
                job.last_error = None;
                if job.transition(JobStage::RipComplete).is_ok() {
                    self.persist_job(idx);
                    tracing::info!(job = %id, "Rip complete");
                }
            }
            (JobStage::Encoding, Ok(StageOutput::Encoded { output_paths })) => {
                if !self.artifacts.all_complete(&output_paths) {
                    self.retry_or_fail(idx, "encode finished without complete markers", true);
                    return;
                }

                let job = &mut self.jobs[idx];
                job.output_paths = output_paths;
                job.last_error = None;
                if job.transition(JobStage::EncodeComplete).is_ok() {
                    self.persist_job(idx);
                    tracing::info!(job = %id, "Encode complete");
                }
            }
            (
                JobStage::Finalizing,
                Ok(StageOutput::Finalized {
                    final_paths,
                    metadata,
                }),
            ) => {
                let job = &mut self.jobs[idx];
                job.final_paths = final_paths;
                if metadata.is_some() {
                    job.metadata = metadata;
                }
                job.last_error = None;
                if job.transition(JobStage::Done).is_ok() {
                    self.persist_job(idx);
                    tracing::info!(job = %id, "Job done");
                    self.cleanup_done(idx);
                    if self.config.drive.eject_after_rip {
                        let device = self.jobs[idx].source_device.clone();
                        self.eject(&device);
                    }
                }
            }
            (stage, Err(failure)) => {
                let message = failure.to_string();
                match stage {
                    // Finalizing never retries automatically: a failed move
                    // needs operator eyes, and staged outputs are preserved.
                    JobStage::Finalizing => {
                        tracing::error!(job = %id, error = %message, "Finalize failed");
                        self.jobs[idx].fail(&message);
                        self.persist_job(idx);
                    }
                    _ => self.retry_or_fail(idx, &message, failure.is_transient()),
                }
            }
            (stage, Ok(_)) => {
                tracing::error!(job = %id, stage = %stage, "Mismatched stage output");
            }
        }
    }

    /// Either schedule a retry at the stage's queue boundary or fail the job.
    fn retry_or_fail(&mut self, idx: usize, message: &str, transient: bool) {
        let (id, stage) = {
            let job = &self.jobs[idx];
            (job.id.clone(), job.stage)
        };

        // Revert target and the attempt counter that gates the retry.
        let (revert, attempts) = match stage {
            JobStage::Identifying => (JobStage::Detected, self.jobs[idx].attempts.identify),
            JobStage::Ripping => (JobStage::Detected, self.jobs[idx].attempts.rip),
            JobStage::Encoding => (JobStage::RipComplete, self.jobs[idx].attempts.encode),
            _ => {
                self.jobs[idx].fail(message);
                self.persist_job(idx);
                return;
            }
        };

        // Torn artifacts must not survive into the next attempt.
        let dir = match stage {
            JobStage::Ripping => Some(self.artifacts.raw_dir(&id)),
            JobStage::Encoding => Some(self.artifacts.staging_dir(&id)),
            _ => None,
        };
        if let Some(dir) = dir {
            if let Err(e) = self.artifacts.discard_incomplete(&dir) {
                tracing::warn!(job = %id, error = %e, "Artifact cleanup failed");
            }
        }

        if transient && attempts < self.config.retry.max_attempts {
            let delay = backoff_delay(attempts, &self.config.retry);
            tracing::warn!(
                job = %id,
                stage = %stage,
                attempt = attempts,
                delay_secs = delay.as_secs(),
                error = %message,
                "Stage failed, will retry"
            );
            let job = &mut self.jobs[idx];
            job.last_error = Some(message.to_string());
            if job.transition(revert).is_ok() {
                self.persist_job(idx);
                self.backoff_until.insert(id, Instant::now() + delay);
            }
        } else {
            tracing::error!(job = %id, stage = %stage, error = %message, "Stage failed permanently");
            self.jobs[idx].fail(message);
            self.persist_job(idx);
        }
    }

    fn cleanup_done(&mut self, idx: usize) {
        let id = self.jobs[idx].id.clone();
        if let Err(e) = self.artifacts.remove_staging_dir(&id) {
            tracing::warn!(job = %id, error = %e, "Staging cleanup failed");
        }
        if self.config.encode.delete_raw_after_done {
            if let Err(e) = self.artifacts.remove_raw_dir(&id) {
                tracing::warn!(job = %id, error = %e, "Raw cleanup failed");
            }
        }
    }

    fn eject(&self, device: &str) {
        let handle = self.tools.rip.eject(device);
        let device = device.to_string();
        tokio::spawn(async move {
            if let Err(e) = handle.outcome().await {
                tracing::warn!(device = %device, error = %e, "Disc eject failed");
            }
        });
    }

    fn enqueue(&mut self, device: &str) -> Result<String, SchedulerError> {
        let job = self.store.create(device, None)?;
        let id = job.id.clone();
        self.jobs.push(job);
        Ok(id)
    }

    fn cancel_job(&mut self, job_id: &str) -> Result<(), SchedulerError> {
        let idx = self
            .jobs
            .iter()
            .position(|j| j.id == job_id)
            .ok_or_else(|| SchedulerError::UnknownJob(job_id.to_string()))?;

        if self.jobs[idx].is_terminal() {
            return Err(SchedulerError::NotCancellable(job_id.to_string()));
        }

        if let Some(active) = self.running.get_mut(job_id) {
            active.cancel_reason = Some("cancelled by operator".to_string());
            active.cancel.cancel();
        } else {
            self.jobs[idx].fail("cancelled by operator");
            self.persist_job(idx);
        }
        Ok(())
    }

    /// Reset a failed job to the nearest boundary its markers can prove:
    /// complete outputs resume at encode_complete, complete raws at
    /// rip_complete, otherwise the disc is identified again from the start.
    fn retry_job(&mut self, job_id: &str) -> Result<(), SchedulerError> {
        let idx = self
            .jobs
            .iter()
            .position(|j| j.id == job_id)
            .ok_or_else(|| SchedulerError::UnknownJob(job_id.to_string()))?;

        if self.jobs[idx].stage != JobStage::Failed {
            return Err(SchedulerError::NotFailed(job_id.to_string()));
        }

        let target = {
            let job = &self.jobs[idx];
            if self.artifacts.all_complete(&job.output_paths) {
                JobStage::EncodeComplete
            } else if self.artifacts.all_complete(&job.raw_paths) {
                JobStage::RipComplete
            } else {
                JobStage::Detected
            }
        };

        tracing::info!(job = %job_id, stage = %target, "Operator retry");
        let job = &mut self.jobs[idx];
        // Operator override: Failed has no edges in the pipeline table.
        job.stage = target;
        job.attempts = StageAttempts::default();
        job.last_error = None;
        job.touch();
        self.persist_job(idx);
        self.backoff_until.remove(job_id);
        Ok(())
    }

    fn list(&self, stage: Option<JobStage>) -> Vec<JobSnapshot> {
        self.jobs
            .iter()
            .filter(|j| stage.map_or(true, |s| j.stage == s))
            .map(JobSnapshot::from)
            .collect()
    }

    fn backoff_elapsed(&self, job_id: &str) -> bool {
        self.backoff_until
            .get(job_id)
            .map_or(true, |t| Instant::now() >= *t)
    }

    /// Persist one job. A storage failure halts admission of new work:
    /// write-ahead ordering means no stage may start on a record that did not
    /// reach disk. In-flight stages are left to finish; markers keep their
    /// completed work recoverable.
    fn persist_job(&mut self, idx: usize) -> bool {
        if let Err(e) = self.store.persist(&self.jobs[idx]) {
            tracing::error!(
                job = %self.jobs[idx].id,
                error = %e,
                "Failed to persist job record, halting admission"
            );
            self.admission_halted = true;
            return false;
        }
        true
    }

    async fn refresh_snapshot(&self) {
        let view: Vec<JobSnapshot> = self
            .jobs
            .iter()
            .map(|job| {
                let mut snap = JobSnapshot::from(job);
                if let Some(active) = self.running.get(&job.id) {
                    snap.progress = Some(*active.progress.borrow());
                }
                snap
            })
            .collect();
        *self.snapshot.write().await = view;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{
        DiscInfo, EncodeTool, MetadataLookup, RipRequest, RipTool, ToolFailure, ToolHandle,
    };
    use crate::jobs::{DiscMetadata, TitleInfo};
    use std::collections::VecDeque;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout};

    struct FakeRip {
        label: String,
        titles: Vec<TitleInfo>,
        // Pre-scripted scan failures, consumed before scans succeed.
        scan_failures: Mutex<VecDeque<ToolFailure>>,
        // Percent reported at the start of each scan.
        scan_progress: Option<f32>,
        work_delay: Duration,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    impl FakeRip {
        fn new(titles: Vec<TitleInfo>) -> Self {
            Self {
                label: "EXAMPLE_DISC".to_string(),
                titles,
                scan_failures: Mutex::new(VecDeque::new()),
                scan_progress: None,
                work_delay: Duration::ZERO,
                active: Arc::new(AtomicUsize::new(0)),
                max_active: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn with_scan_failures(mut self, failures: Vec<ToolFailure>) -> Self {
            self.scan_failures = Mutex::new(failures.into());
            self
        }

        fn with_work_delay(mut self, delay: Duration) -> Self {
            self.work_delay = delay;
            self
        }

        fn with_scan_progress(mut self, pct: f32) -> Self {
            self.scan_progress = Some(pct);
            self
        }

        fn track(&self) -> SlotGuard {
            SlotGuard::enter(&self.active, &self.max_active)
        }
    }

    struct SlotGuard {
        active: Arc<AtomicUsize>,
    }

    impl SlotGuard {
        fn enter(active: &Arc<AtomicUsize>, max: &Arc<AtomicUsize>) -> Self {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max.fetch_max(now, Ordering::SeqCst);
            Self {
                active: Arc::clone(active),
            }
        }
    }

    impl Drop for SlotGuard {
        fn drop(&mut self) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl RipTool for FakeRip {
        fn scan(&self, _device: &str) -> ToolHandle<DiscInfo> {
            let (handle, task) = ToolHandle::pair();
            let scripted = self.scan_failures.lock().unwrap().pop_front();
            let result = match scripted {
                Some(failure) => Err(failure),
                None => Ok(DiscInfo {
                    label: Some(self.label.clone()),
                    titles: self.titles.clone(),
                }),
            };
            let guard = self.track();
            let delay = self.work_delay;
            let progress = self.scan_progress;
            tokio::spawn(async move {
                let mut task = task;
                if let Some(pct) = progress {
                    task.report_progress(pct);
                }
                let cancelled = tokio::select! {
                    _ = sleep(delay) => false,
                    _ = task.cancelled() => true,
                };
                drop(guard);
                if cancelled {
                    task.finish(Err(ToolFailure::permanent("scan cancelled")));
                } else {
                    task.finish(result);
                }
            });
            handle
        }

        fn rip_title(&self, request: RipRequest) -> ToolHandle<PathBuf> {
            let (handle, task) = ToolHandle::pair();
            let guard = self.track();
            let delay = self.work_delay;
            tokio::spawn(async move {
                let mut task = task;
                let cancelled = tokio::select! {
                    _ = sleep(delay) => false,
                    _ = task.cancelled() => true,
                };
                drop(guard);
                if cancelled {
                    task.finish(Err(ToolFailure::permanent("rip cancelled")));
                } else {
                    fs::write(&request.dest, b"raw").unwrap();
                    task.finish(Ok(request.dest));
                }
            });
            handle
        }

        fn eject(&self, _device: &str) -> ToolHandle<()> {
            let (handle, task) = ToolHandle::pair();
            task.finish(Ok(()));
            handle
        }
    }

    struct FakeEncode;
    impl EncodeTool for FakeEncode {
        fn encode(&self, _input: &Path, output: &Path) -> ToolHandle<PathBuf> {
            let (handle, task) = ToolHandle::pair();
            fs::write(output, b"encoded").unwrap();
            task.finish(Ok(output.to_path_buf()));
            handle
        }
    }

    // Pre-scripted encode failures, consumed before encodes succeed.
    struct ScriptedEncode {
        failures: Mutex<VecDeque<ToolFailure>>,
    }

    impl EncodeTool for ScriptedEncode {
        fn encode(&self, _input: &Path, output: &Path) -> ToolHandle<PathBuf> {
            let (handle, task) = ToolHandle::pair();
            match self.failures.lock().unwrap().pop_front() {
                Some(failure) => task.finish(Err(failure)),
                None => {
                    fs::write(output, b"encoded").unwrap();
                    task.finish(Ok(output.to_path_buf()));
                }
            }
            handle
        }
    }

    struct FakeMetadata {
        result: Option<DiscMetadata>,
    }
    impl MetadataLookup for FakeMetadata {
        fn lookup(&self, _hint: &str) -> ToolHandle<Option<DiscMetadata>> {
            let (handle, task) = ToolHandle::pair();
            task.finish(Ok(self.result.clone()));
            handle
        }
    }

    fn two_titles() -> Vec<TitleInfo> {
        vec![
            TitleInfo {
                index: 0,
                duration_secs: 7000,
                language: Some("eng".to_string()),
            },
            TitleInfo {
                index: 3,
                duration_secs: 6500,
                language: None,
            },
        ]
    }

    fn example_metadata() -> DiscMetadata {
        DiscMetadata {
            title: "Example".to_string(),
            year: Some(2001),
            imdb_id: Some("tt0123456".to_string()),
        }
    }

    fn test_config(temp: &TempDir) -> Config {
        let mut config = Config::default();
        config.dirs.raw_dir = temp.path().join("raw");
        config.dirs.staging_dir = temp.path().join("staging");
        config.dirs.output_dir = temp.path().join("media");
        config.dirs.state_dir = temp.path().join("state");
        config.encode.encode_slots = 2;
        // Tests retry immediately.
        config.retry.backoff_base_secs = 0;
        config
    }

    fn tools_with(rip: FakeRip, metadata: Option<DiscMetadata>) -> Tools {
        Tools {
            rip: Arc::new(rip),
            encode: Arc::new(FakeEncode),
            metadata: Arc::new(FakeMetadata { result: metadata }),
        }
    }

    async fn wait_for_stage(snapshot: &SharedSnapshot, job_id: &str, stage: JobStage) -> JobSnapshot {
        timeout(Duration::from_secs(5), async {
            loop {
                {
                    let view = snapshot.read().await;
                    if let Some(s) = view.iter().find(|s| s.id == job_id && s.stage == stage) {
                        return s.clone();
                    }
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not reach expected stage in time")
    }

    async fn enqueue(commands: &mpsc::Sender<Command>, device: &str) -> String {
        let (tx, rx) = oneshot::channel();
        commands
            .send(Command::Enqueue {
                device: device.to_string(),
                reply: tx,
            })
            .await
            .unwrap();
        rx.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_disc_to_library() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let tools = tools_with(FakeRip::new(two_titles()), Some(example_metadata()));
        let (scheduler, handle) = Scheduler::new(config, tools);
        let task = tokio::spawn(scheduler.run());

        assert!(handle.ingress.device_ready("/dev/sr0").await);

        // Find the job id once it appears in the snapshot.
        let job_id = timeout(Duration::from_secs(5), async {
            loop {
                {
                    let view = handle.snapshot.read().await;
                    if let Some(s) = view.first() {
                        return s.id.clone();
                    }
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let done = wait_for_stage(&handle.snapshot, &job_id, JobStage::Done).await;
        assert_eq!(done.attempts.identify, 1);
        assert_eq!(done.attempts.rip, 1);
        assert_eq!(done.attempts.encode, 1);
        assert_eq!(done.titles, 2);
        assert!(done.last_error.is_none());

        // Two outputs filed under the metadata-derived folder.
        let dir = temp.path().join("media/Example (2001) {imdb-tt0123456}");
        assert!(dir.join("Example (2001) - 01.mkv").exists());
        assert!(dir.join("Example (2001) - 02.mkv").exists());
        assert_eq!(done.final_paths.len(), 2);

        // Staging was cleaned up after filing.
        assert!(!temp.path().join("staging").join(&job_id).exists());

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_ready_events_make_one_job() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let tools = tools_with(
            FakeRip::new(two_titles()).with_work_delay(Duration::from_millis(100)),
            None,
        );
        let (scheduler, handle) = Scheduler::new(config, tools);
        let task = tokio::spawn(scheduler.run());

        handle.ingress.device_ready("/dev/sr0").await;
        handle.ingress.device_ready("/dev/sr0").await;
        handle.ingress.device_ready("/dev/sr0").await;
        sleep(Duration::from_millis(100)).await;

        let view = handle.snapshot.read().await.clone();
        assert_eq!(view.len(), 1);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rip_slot_is_exclusive_and_fifo() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let rip = FakeRip::new(two_titles()).with_work_delay(Duration::from_millis(30));
        let max_active = Arc::clone(&rip.max_active);
        let tools = tools_with(rip, None);
        let (scheduler, handle) = Scheduler::new(config, tools);
        let task = tokio::spawn(scheduler.run());

        let first = enqueue(&handle.commands, "/dev/sr0").await;
        let second = enqueue(&handle.commands, "/dev/sr1").await;

        wait_for_stage(&handle.snapshot, &first, JobStage::Done).await;
        wait_for_stage(&handle.snapshot, &second, JobStage::Done).await;

        // Scans and rips never overlapped across the two jobs.
        assert_eq!(max_active.load(Ordering::SeqCst), 1);

        // FIFO: the first-created job finished ripping no later than the
        // second one started; verified indirectly by both completing with
        // the exclusive slot never contended.
        let view = handle.snapshot.read().await.clone();
        assert!(view.iter().all(|s| s.stage == JobStage::Done));

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_job_and_frees_slot() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let rip = FakeRip::new(two_titles()).with_scan_failures(vec![ToolFailure::permanent(
            "makemkvcon: no disc in drive (exit code 2)",
        )]);
        let tools = tools_with(rip, None);
        let (scheduler, handle) = Scheduler::new(config, tools);
        let task = tokio::spawn(scheduler.run());

        let bad = enqueue(&handle.commands, "/dev/sr0").await;
        let failed = wait_for_stage(&handle.snapshot, &bad, JobStage::Failed).await;
        assert_eq!(failed.attempts.identify, 1);
        assert!(failed
            .last_error
            .as_deref()
            .unwrap()
            .contains("no disc in drive"));

        // The slot is free for the next disc.
        let good = enqueue(&handle.commands, "/dev/sr1").await;
        wait_for_stage(&handle.snapshot, &good, JobStage::Done).await;

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failures_retry_until_success() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let rip = FakeRip::new(two_titles()).with_scan_failures(vec![
            ToolFailure::transient("makemkvcon exited with code 1"),
            ToolFailure::transient("makemkvcon exited with code 1"),
        ]);
        let tools = tools_with(rip, None);
        let (scheduler, handle) = Scheduler::new(config, tools);
        let task = tokio::spawn(scheduler.run());

        let id = enqueue(&handle.commands, "/dev/sr0").await;
        let done = wait_for_stage(&handle.snapshot, &id, JobStage::Done).await;
        // Two failed attempts plus the one that stuck.
        assert_eq!(done.attempts.identify, 3);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_attempts() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let rip = FakeRip::new(two_titles()).with_scan_failures(vec![
            ToolFailure::transient("io error"),
            ToolFailure::transient("io error"),
            ToolFailure::transient("io error"),
        ]);
        let tools = tools_with(rip, None);
        let (scheduler, handle) = Scheduler::new(config, tools);
        let task = tokio::spawn(scheduler.run());

        let id = enqueue(&handle.commands, "/dev/sr0").await;
        let failed = wait_for_stage(&handle.snapshot, &id, JobStage::Failed).await;
        assert_eq!(failed.attempts.identify, 3);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_encode_retries_transiently_then_completes() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let tools = Tools {
            rip: Arc::new(FakeRip::new(two_titles())),
            encode: Arc::new(ScriptedEncode {
                failures: Mutex::new(
                    vec![
                        ToolFailure::transient("HandBrakeCLI exited with code 1"),
                        ToolFailure::transient("HandBrakeCLI exited with code 1"),
                    ]
                    .into(),
                ),
            }),
            metadata: Arc::new(FakeMetadata { result: None }),
        };
        let (scheduler, handle) = Scheduler::new(config, tools);
        let task = tokio::spawn(scheduler.run());

        let id = enqueue(&handle.commands, "/dev/sr0").await;
        let done = wait_for_stage(&handle.snapshot, &id, JobStage::Done).await;
        // Two failed encode attempts plus the one that stuck.
        assert_eq!(done.attempts.encode, 3);
        assert_eq!(done.attempts.rip, 1);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_admits_oldest_detected_first() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let store = JobStore::new(&config.dirs.state_dir);

        let mut newer = store.create("/dev/sr0", Some("NEWER")).unwrap();
        let mut older = store.create("/dev/sr1", Some("OLDER")).unwrap();
        newer.created_at = 2000;
        older.created_at = 1000;
        store.persist(&newer).unwrap();
        store.persist(&older).unwrap();

        let rip = FakeRip::new(two_titles()).with_work_delay(Duration::from_secs(30));
        let (mut scheduler, _handle) = Scheduler::new(config, tools_with(rip, None));
        scheduler.recover();
        scheduler.dispatch_ready();

        // The single rip slot went to the older job.
        assert!(scheduler.running.contains_key(&older.id));
        assert!(!scheduler.running.contains_key(&newer.id));
        assert_eq!(scheduler.jobs[0].id, older.id);
        assert_eq!(scheduler.jobs[0].stage, JobStage::Identifying);
        assert_eq!(scheduler.jobs[1].stage, JobStage::Detected);
    }

    #[tokio::test]
    async fn test_storage_failure_halts_admission() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let store = JobStore::new(&config.dirs.state_dir);
        store.create("/dev/sr0", None).unwrap();

        let (mut scheduler, _handle) =
            Scheduler::new(config, tools_with(FakeRip::new(two_titles()), None));
        scheduler.recover();

        // Job records become unwritable: a file blocks the state path.
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, b"x").unwrap();
        scheduler.store = JobStore::new(blocker.join("state"));

        scheduler.dispatch_ready();
        assert!(scheduler.running.is_empty());
        assert!(scheduler.admission_halted);

        // Nothing is admitted afterwards either.
        scheduler.dispatch_ready();
        assert!(scheduler.running.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_exposes_stage_progress() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let rip = FakeRip::new(two_titles())
            .with_work_delay(Duration::from_secs(30))
            .with_scan_progress(37.5);
        let tools = tools_with(rip, None);
        let (scheduler, handle) = Scheduler::new(config, tools);
        let task = tokio::spawn(scheduler.run());

        let id = enqueue(&handle.commands, "/dev/sr0").await;
        let identifying = wait_for_stage(&handle.snapshot, &id, JobStage::Identifying).await;
        // A running stage carries live progress in the snapshot.
        assert!(identifying.progress.is_some());

        timeout(Duration::from_secs(5), async {
            loop {
                {
                    let view = handle.snapshot.read().await;
                    if view.iter().any(|s| s.id == id && s.progress == Some(37.5)) {
                        return;
                    }
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("scan progress never reached the snapshot");

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_device_removed_fails_active_job() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let rip = FakeRip::new(two_titles()).with_work_delay(Duration::from_secs(30));
        let tools = tools_with(rip, None);
        let (scheduler, handle) = Scheduler::new(config, tools);
        let task = tokio::spawn(scheduler.run());

        let id = enqueue(&handle.commands, "/dev/sr0").await;
        wait_for_stage(&handle.snapshot, &id, JobStage::Identifying).await;

        handle.ingress.device_removed("/dev/sr0").await;
        let failed = wait_for_stage(&handle.snapshot, &id, JobStage::Failed).await;
        assert_eq!(failed.last_error.as_deref(), Some("device removed"));

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_command_fails_running_job() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let rip = FakeRip::new(two_titles()).with_work_delay(Duration::from_secs(30));
        let tools = tools_with(rip, None);
        let (scheduler, handle) = Scheduler::new(config, tools);
        let task = tokio::spawn(scheduler.run());

        let id = enqueue(&handle.commands, "/dev/sr0").await;
        wait_for_stage(&handle.snapshot, &id, JobStage::Identifying).await;

        let (tx, rx) = oneshot::channel();
        handle
            .commands
            .send(Command::Cancel {
                job_id: id.clone(),
                reply: tx,
            })
            .await
            .unwrap();
        rx.await.unwrap().unwrap();

        let failed = wait_for_stage(&handle.snapshot, &id, JobStage::Failed).await;
        assert_eq!(failed.last_error.as_deref(), Some("cancelled by operator"));

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_recover_ripping_with_complete_markers() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let store = JobStore::new(&config.dirs.state_dir);
        let artifacts = ArtifactStore::new(&config.dirs.raw_dir, &config.dirs.staging_dir);

        let mut job = store.create("/dev/sr0", Some("EXAMPLE")).unwrap();
        job.titles = two_titles();
        job.attempts.identify = 1;
        job.attempts.rip = 1;
        job.stage = JobStage::Ripping;
        for t in &job.titles {
            let p = artifacts.reserve_raw_location(&job.id, t.index).unwrap();
            fs::write(&p, b"raw").unwrap();
            artifacts.mark_complete(&p).unwrap();
        }
        store.persist(&job).unwrap();

        let (mut scheduler, _handle) =
            Scheduler::new(config, tools_with(FakeRip::new(vec![]), None));
        scheduler.recover();

        let recovered = &scheduler.jobs[0];
        assert_eq!(recovered.stage, JobStage::RipComplete);
        assert_eq!(recovered.raw_paths.len(), 2);
        assert_eq!(recovered.attempts.rip, 1);
    }

    #[tokio::test]
    async fn test_recover_ripping_incomplete_discards_and_restarts() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let store = JobStore::new(&config.dirs.state_dir);
        let artifacts = ArtifactStore::new(&config.dirs.raw_dir, &config.dirs.staging_dir);

        let mut job = store.create("/dev/sr0", Some("EXAMPLE")).unwrap();
        job.titles = two_titles();
        job.attempts.rip = 2;
        job.stage = JobStage::Ripping;
        // First title complete, second torn.
        let done = artifacts.reserve_raw_location(&job.id, 0).unwrap();
        fs::write(&done, b"raw").unwrap();
        artifacts.mark_complete(&done).unwrap();
        let torn = artifacts.reserve_raw_location(&job.id, 3).unwrap();
        fs::write(&torn, b"half").unwrap();
        store.persist(&job).unwrap();

        let (mut scheduler, _handle) =
            Scheduler::new(config, tools_with(FakeRip::new(vec![]), None));
        scheduler.recover();

        let recovered = &scheduler.jobs[0];
        assert_eq!(recovered.stage, JobStage::Detected);
        // Attempts preserved; the torn file is gone, the complete one stays.
        assert_eq!(recovered.attempts.rip, 2);
        assert!(done.exists());
        assert!(!torn.exists());
    }

    #[tokio::test]
    async fn test_recover_identifying_resets_to_detected() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let store = JobStore::new(&config.dirs.state_dir);

        let mut job = store.create("/dev/sr0", None).unwrap();
        job.attempts.identify = 1;
        job.stage = JobStage::Identifying;
        store.persist(&job).unwrap();

        let (mut scheduler, _handle) =
            Scheduler::new(config, tools_with(FakeRip::new(vec![]), None));
        scheduler.recover();

        assert_eq!(scheduler.jobs[0].stage, JobStage::Detected);
        assert_eq!(scheduler.jobs[0].attempts.identify, 1);
    }

    #[tokio::test]
    async fn test_recover_encoding_with_complete_markers() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let store = JobStore::new(&config.dirs.state_dir);
        let artifacts = ArtifactStore::new(&config.dirs.raw_dir, &config.dirs.staging_dir);

        let mut job = store.create("/dev/sr0", Some("EXAMPLE")).unwrap();
        job.titles = two_titles();
        job.stage = JobStage::Encoding;
        for t in &job.titles {
            let raw = artifacts.reserve_raw_location(&job.id, t.index).unwrap();
            fs::write(&raw, b"raw").unwrap();
            artifacts.mark_complete(&raw).unwrap();
            job.raw_paths.push(raw.clone());
            let out = artifacts.reserve_output_for(&job.id, &raw).unwrap();
            fs::write(&out, b"encoded").unwrap();
            artifacts.mark_complete(&out).unwrap();
        }
        store.persist(&job).unwrap();

        let (mut scheduler, _handle) =
            Scheduler::new(config, tools_with(FakeRip::new(vec![]), None));
        scheduler.recover();

        let recovered = &scheduler.jobs[0];
        assert_eq!(recovered.stage, JobStage::EncodeComplete);
        assert_eq!(recovered.output_paths.len(), 2);
    }

    #[tokio::test]
    async fn test_recovered_jobs_resume_to_done() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let store = JobStore::new(&config.dirs.state_dir);
        let artifacts = ArtifactStore::new(&config.dirs.raw_dir, &config.dirs.staging_dir);

        // Crashed mid-encode with raws complete; should resume, encode, and
        // finish without touching the drive again.
        let mut job = store.create("/dev/sr0", Some("EXAMPLE")).unwrap();
        job.titles = two_titles();
        job.stage = JobStage::Encoding;
        for t in &job.titles {
            let raw = artifacts.reserve_raw_location(&job.id, t.index).unwrap();
            fs::write(&raw, b"raw").unwrap();
            artifacts.mark_complete(&raw).unwrap();
            job.raw_paths.push(raw);
        }
        store.persist(&job).unwrap();
        let id = job.id.clone();

        let (scheduler, handle) = Scheduler::new(config, tools_with(FakeRip::new(vec![]), None));
        let task = tokio::spawn(scheduler.run());

        let done = wait_for_stage(&handle.snapshot, &id, JobStage::Done).await;
        assert_eq!(done.final_paths.len(), 2);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_command_resumes_at_marker_boundary() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let store = JobStore::new(&config.dirs.state_dir);
        let artifacts = ArtifactStore::new(&config.dirs.raw_dir, &config.dirs.staging_dir);

        let mut job = store.create("/dev/sr0", Some("EXAMPLE")).unwrap();
        job.titles = two_titles();
        for t in &job.titles {
            let raw = artifacts.reserve_raw_location(&job.id, t.index).unwrap();
            fs::write(&raw, b"raw").unwrap();
            artifacts.mark_complete(&raw).unwrap();
            job.raw_paths.push(raw);
        }
        job.attempts.encode = 3;
        job.fail("HandBrakeCLI exited with code 1");
        store.persist(&job).unwrap();

        let (mut scheduler, _handle) =
            Scheduler::new(config, tools_with(FakeRip::new(vec![]), None));
        scheduler.recover();
        scheduler.retry_job(&job.id).unwrap();

        let retried = &scheduler.jobs[0];
        // Raws are marker-complete, so the rip is not redone.
        assert_eq!(retried.stage, JobStage::RipComplete);
        assert_eq!(retried.attempts, StageAttempts::default());
        assert!(retried.last_error.is_none());
    }

    #[tokio::test]
    async fn test_retry_command_rejects_non_failed_job() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let store = JobStore::new(&config.dirs.state_dir);
        let job = store.create("/dev/sr0", None).unwrap();

        let (mut scheduler, _handle) =
            Scheduler::new(config, tools_with(FakeRip::new(vec![]), None));
        scheduler.recover();

        assert!(matches!(
            scheduler.retry_job(&job.id),
            Err(SchedulerError::NotFailed(_))
        ));
        assert!(matches!(
            scheduler.retry_job("nope"),
            Err(SchedulerError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters_terminal_archive() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let store = JobStore::new(&config.dirs.state_dir);

        let _queued = store.create("/dev/sr0", None).unwrap();
        let mut dead = store.create("/dev/sr1", None).unwrap();
        dead.fail("no disc");
        store.persist(&dead).unwrap();

        let (mut scheduler, _handle) =
            Scheduler::new(config, tools_with(FakeRip::new(vec![]), None));
        scheduler.recover();

        assert_eq!(scheduler.list(None).len(), 2);
        let failed = scheduler.list(Some(JobStage::Failed));
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, dead.id);
    }

    #[test]
    fn test_effective_encode_slots() {
        assert_eq!(effective_encode_slots(3), 3);
        assert!(effective_encode_slots(0) >= 1);
    }
}
