//! Stage drivers: the work each pipeline stage performs, run as spawned
//! tasks that report a single [`StageOutcome`] back to the scheduler.
//!
//! Drivers are idempotent over completion markers: a title that is already
//! marker-complete is skipped, so re-running a stage after a crash or retry
//! never redoes finished work.

use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::adapter::{RipRequest, ToolFailure, ToolHandle, Tools};
use crate::artifacts::ArtifactStore;
use crate::jobs::{DiscMetadata, Job, JobStage, TitleInfo};
use crate::naming::OutputNamer;
use ripd_config::RetryConfig;

/// What a successfully finished stage produced.
#[derive(Debug, Clone)]
pub enum StageOutput {
    Identified {
        label: Option<String>,
        titles: Vec<TitleInfo>,
    },
    Ripped {
        raw_paths: Vec<PathBuf>,
    },
    Encoded {
        output_paths: Vec<PathBuf>,
    },
    Finalized {
        final_paths: Vec<PathBuf>,
        metadata: Option<DiscMetadata>,
    },
}

/// Report from one finished stage task.
#[derive(Debug)]
pub struct StageOutcome {
    pub job_id: String,
    pub stage: JobStage,
    pub result: Result<StageOutput, ToolFailure>,
}

/// Cancel trigger for a running stage task. The task propagates the request
/// to whichever tool invocation is currently active.
#[derive(Clone)]
pub struct StageCancel {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl StageCancel {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                tx: std::sync::Arc::new(tx),
            },
            rx,
        )
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Control half of a running stage task: cancel it, observe its progress.
///
/// Progress is stage-level percent (0.0 to 100.0): a multi-title stage scales
/// per-title tool progress by how many titles are already finished.
pub struct StageHandle {
    pub cancel: StageCancel,
    pub progress: watch::Receiver<f32>,
}

fn stage_channels() -> (StageHandle, watch::Receiver<bool>, watch::Sender<f32>) {
    let (cancel, cancel_rx) = StageCancel::new();
    let (progress_tx, progress_rx) = watch::channel(0.0);
    (
        StageHandle {
            cancel,
            progress: progress_rx,
        },
        cancel_rx,
        progress_tx,
    )
}

/// Await a tool outcome while honoring a stage-level cancel request and
/// forwarding the tool's progress updates.
///
/// The select is biased so pending progress is drained before the outcome is
/// taken; the watch channel coalesces to the latest value either way.
async fn await_tool<T>(
    handle: ToolHandle<T>,
    cancel: &mut watch::Receiver<bool>,
    mut on_progress: impl FnMut(f32),
) -> Result<T, ToolFailure> {
    let canceller = handle.canceller();
    let mut tool_progress = handle.progress_receiver();
    if *cancel.borrow() {
        canceller.cancel();
    }

    let fut = handle.outcome();
    tokio::pin!(fut);

    let mut cancel_armed = true;
    let mut progress_armed = true;
    loop {
        tokio::select! {
            biased;
            changed = tool_progress.changed(), if progress_armed => {
                match changed {
                    Ok(()) => on_progress(*tool_progress.borrow()),
                    Err(_) => progress_armed = false,
                }
            }
            changed = cancel.changed(), if cancel_armed => {
                if changed.is_ok() && *cancel.borrow() {
                    canceller.cancel();
                }
                cancel_armed = false;
            }
            out = &mut fut => return out,
        }
    }
}

async fn send_outcome(
    tx: &mpsc::Sender<StageOutcome>,
    job_id: String,
    stage: JobStage,
    result: Result<StageOutput, ToolFailure>,
) {
    let outcome = StageOutcome {
        job_id,
        stage,
        result,
    };
    if tx.send(outcome).await.is_err() {
        tracing::debug!("Scheduler gone, dropping stage outcome");
    }
}

/// Scan the disc and select titles.
pub fn spawn_identify(tools: &Tools, job: &Job, tx: mpsc::Sender<StageOutcome>) -> StageHandle {
    let (stage, mut cancel_rx, progress_tx) = stage_channels();
    let handle = tools.rip.scan(&job.source_device);
    let job_id = job.id.clone();

    tokio::spawn(async move {
        let result = await_tool(handle, &mut cancel_rx, |pct| {
            let _ = progress_tx.send(pct);
        })
        .await
        .map(|info| StageOutput::Identified {
            label: info.label,
            titles: info.titles,
        });
        send_outcome(&tx, job_id, JobStage::Identifying, result).await;
    });

    stage
}

/// Extract each selected title, marking completions as they land.
pub fn spawn_rip(
    tools: &Tools,
    artifacts: &ArtifactStore,
    job: &Job,
    tx: mpsc::Sender<StageOutcome>,
) -> StageHandle {
    let (stage, mut cancel_rx, progress_tx) = stage_channels();
    let rip = tools.rip.clone();
    let artifacts = artifacts.clone();
    let job_id = job.id.clone();
    let device = job.source_device.clone();
    let titles = job.titles.clone();

    tokio::spawn(async move {
        let total = titles.len().max(1) as f32;
        let mut raw_paths = Vec::with_capacity(titles.len());
        let mut failure = None;

        for (done, title) in titles.iter().enumerate() {
            let dest = match artifacts.reserve_raw_location(&job_id, title.index) {
                Ok(dest) => dest,
                Err(e) => {
                    failure = Some(ToolFailure::transient(e.to_string()));
                    break;
                }
            };

            if artifacts.is_complete(&dest) {
                tracing::debug!(job = %job_id, title = title.index, "Title already extracted, skipping");
                raw_paths.push(dest);
                continue;
            }

            let handle = rip.rip_title(RipRequest {
                device: device.clone(),
                title_index: title.index,
                dest: dest.clone(),
            });

            let on_progress = |pct: f32| {
                let _ = progress_tx.send((done as f32 * 100.0 + pct) / total);
            };
            match await_tool(handle, &mut cancel_rx, on_progress).await {
                Ok(path) => {
                    if let Err(e) = artifacts.mark_complete(&path) {
                        failure = Some(ToolFailure::transient(e.to_string()));
                        break;
                    }
                    raw_paths.push(path);
                }
                Err(f) => {
                    failure = Some(f);
                    break;
                }
            }
        }

        let result = match failure {
            None => Ok(StageOutput::Ripped { raw_paths }),
            Some(f) => Err(f),
        };
        send_outcome(&tx, job_id, JobStage::Ripping, result).await;
    });

    stage
}

/// Transcode each raw title into staging, marking completions as they land.
pub fn spawn_encode(
    tools: &Tools,
    artifacts: &ArtifactStore,
    job: &Job,
    tx: mpsc::Sender<StageOutcome>,
) -> StageHandle {
    let (stage, mut cancel_rx, progress_tx) = stage_channels();
    let encode = tools.encode.clone();
    let artifacts = artifacts.clone();
    let job_id = job.id.clone();
    let raw_paths = job.raw_paths.clone();

    tokio::spawn(async move {
        let total = raw_paths.len().max(1) as f32;
        let mut output_paths = Vec::with_capacity(raw_paths.len());
        let mut failure = None;

        for (done, raw) in raw_paths.iter().enumerate() {
            let out = match artifacts.reserve_output_for(&job_id, raw) {
                Ok(out) => out,
                Err(e) => {
                    failure = Some(ToolFailure::transient(e.to_string()));
                    break;
                }
            };

            if artifacts.is_complete(&out) {
                tracing::debug!(job = %job_id, output = %out.display(), "Output already encoded, skipping");
                output_paths.push(out);
                continue;
            }

            let handle = encode.encode(raw, &out);
            let on_progress = |pct: f32| {
                let _ = progress_tx.send((done as f32 * 100.0 + pct) / total);
            };
            match await_tool(handle, &mut cancel_rx, on_progress).await {
                Ok(path) => {
                    if let Err(e) = artifacts.mark_complete(&path) {
                        failure = Some(ToolFailure::transient(e.to_string()));
                        break;
                    }
                    output_paths.push(path);
                }
                Err(f) => {
                    failure = Some(f);
                    break;
                }
            }
        }

        let result = match failure {
            None => Ok(StageOutput::Encoded { output_paths }),
            Some(f) => Err(f),
        };
        send_outcome(&tx, job_id, JobStage::Encoding, result).await;
    });

    stage
}

/// Resolve metadata (best effort), compute final names, move outputs into
/// the library.
pub fn spawn_finalize(
    tools: &Tools,
    artifacts: &ArtifactStore,
    namer: &OutputNamer,
    job: &Job,
    tx: mpsc::Sender<StageOutcome>,
) -> StageHandle {
    let (stage, mut cancel_rx, _progress_tx) = stage_channels();
    let lookup = tools.metadata.clone();
    let artifacts = artifacts.clone();
    let namer = namer.clone();
    let job_id = job.id.clone();
    let disc_label = job.disc_label.clone();
    let output_paths = job.output_paths.clone();
    // A previous attempt may have resolved metadata already.
    let known_metadata = job.metadata.clone();

    tokio::spawn(async move {
        let metadata = match known_metadata {
            Some(meta) => Some(meta),
            None => {
                let hint = disc_label.clone().unwrap_or_default();
                let handle = lookup.lookup(&hint);
                // Lookup failures are downgraded to "no metadata".
                await_tool(handle, &mut cancel_rx, |_| {}).await.unwrap_or(None)
            }
        };

        let finals = namer.final_paths(
            metadata.as_ref(),
            disc_label.as_deref(),
            &job_id,
            output_paths.len(),
        );

        let mut failure = None;
        for (src, dest) in output_paths.iter().zip(&finals) {
            if let Err(e) = artifacts.move_to_final(src, dest) {
                failure = Some(ToolFailure::permanent(e.to_string()));
                break;
            }
        }

        let result = match failure {
            None => Ok(StageOutput::Finalized {
                final_paths: finals,
                metadata,
            }),
            Some(f) => Err(f),
        };
        send_outcome(&tx, job_id, JobStage::Finalizing, result).await;
    });

    stage
}

/// Delay before retrying a stage that has failed `attempt` times:
/// base doubled per prior attempt, capped.
pub fn backoff_delay(attempt: u32, retry: &RetryConfig) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let secs = retry
        .backoff_base_secs
        .saturating_mul(1u64 << exp)
        .min(retry.backoff_cap_secs);
    Duration::from_secs(secs)
}
