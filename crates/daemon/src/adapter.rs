//! Tool adapter seam: uniform handles around external tool invocations.
//!
//! The scheduler never talks to makemkvcon or HandBrakeCLI directly. Each
//! adapter starts the work on a spawned task and returns a [`ToolHandle`]
//! exposing progress, cancellation, and the final outcome. Tests drive the
//! pipeline with scripted fakes behind the same traits.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

use crate::jobs::{DiscMetadata, TitleInfo};

/// Whether a tool failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Environmental: retry may succeed (tool crash, IO hiccup).
    Transient,
    /// Inherent to the input: retry is pointless (unreadable disc, bad args).
    Permanent,
}

/// A classified tool failure.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ToolFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ToolFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

/// What a disc scan discovered.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscInfo {
    /// Volume label reported by the tool, if any.
    pub label: Option<String>,
    /// Every title on the disc, unfiltered.
    pub titles: Vec<TitleInfo>,
}

/// Handle to one in-flight tool invocation.
///
/// Dropping the handle does not cancel the work; call [`ToolHandle::cancel`]
/// for that. If the driving task dies without reporting, the outcome is a
/// transient failure.
pub struct ToolHandle<T> {
    outcome: oneshot::Receiver<Result<T, ToolFailure>>,
    progress: watch::Receiver<f32>,
    cancel: Arc<watch::Sender<bool>>,
}

/// The task-side half of a [`ToolHandle`]: report progress, observe
/// cancellation, deliver the outcome.
pub struct ToolTask<T> {
    outcome: oneshot::Sender<Result<T, ToolFailure>>,
    progress: watch::Sender<f32>,
    cancel: watch::Receiver<bool>,
}

impl<T> ToolHandle<T> {
    /// Create a connected handle/task pair.
    pub fn pair() -> (ToolHandle<T>, ToolTask<T>) {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = watch::channel(0.0);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (
            ToolHandle {
                outcome: outcome_rx,
                progress: progress_rx,
                cancel: Arc::new(cancel_tx),
            },
            ToolTask {
                outcome: outcome_tx,
                progress: progress_tx,
                cancel: cancel_rx,
            },
        )
    }

    /// Latest reported progress in percent (0.0 to 100.0).
    pub fn progress(&self) -> f32 {
        *self.progress.borrow()
    }

    /// A progress receiver that outlives the handle, for callers that move
    /// the handle into an `outcome()` future but still want updates.
    pub fn progress_receiver(&self) -> watch::Receiver<f32> {
        self.progress.clone()
    }

    /// Request cancellation. The tool task kills its child process and
    /// reports a failure; the request itself never blocks.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// A cancel trigger that outlives the handle, for callers that move the
    /// handle into an `outcome()` future but still need to cancel it.
    pub fn canceller(&self) -> Canceller {
        Canceller(Arc::clone(&self.cancel))
    }

    /// Wait for the invocation to finish.
    pub async fn outcome(self) -> Result<T, ToolFailure> {
        match self.outcome.await {
            Ok(result) => result,
            Err(_) => Err(ToolFailure::transient("tool task exited without reporting")),
        }
    }
}

impl<T> ToolTask<T> {
    /// Report progress in percent. Ignores a closed handle.
    pub fn report_progress(&self, percent: f32) {
        let _ = self.progress.send(percent.clamp(0.0, 100.0));
    }

    /// A cloneable reporter for closures that outlive a borrow of the task.
    pub fn progress_reporter(&self) -> ProgressReporter {
        ProgressReporter(self.progress.clone())
    }

    /// Check whether the handle requested cancellation.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Wait until cancellation is requested. Pends forever if the handle
    /// is dropped without cancelling, so always race this with real work.
    pub async fn cancelled(&mut self) {
        while !*self.cancel.borrow() {
            if self.cancel.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Deliver the final outcome, consuming the task.
    pub fn finish(self, result: Result<T, ToolFailure>) {
        let _ = self.outcome.send(result);
    }
}

/// Detached cancel trigger for an in-flight tool invocation.
#[derive(Clone)]
pub struct Canceller(Arc<watch::Sender<bool>>);

impl Canceller {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Cloneable progress sender detached from the task borrow.
#[derive(Clone)]
pub struct ProgressReporter(watch::Sender<f32>);

impl ProgressReporter {
    pub fn report(&self, percent: f32) {
        let _ = self.0.send(percent.clamp(0.0, 100.0));
    }
}

/// How a child process ended while being pumped.
pub(crate) enum ChildEnd {
    Exited(std::process::ExitStatus),
    Cancelled,
}

/// Read a child's stdout line by line, feeding each line to `on_line`, while
/// honoring cancellation from the handle. On cancellation the child is killed
/// and reaped before returning.
pub(crate) async fn pump_child_stdout<T>(
    child: &mut tokio::process::Child,
    task: &mut ToolTask<T>,
    mut on_line: impl FnMut(&str),
) -> std::io::Result<ChildEnd> {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let mut lines = child.stdout.take().map(|s| BufReader::new(s).lines());

    loop {
        tokio::select! {
            next = async {
                match lines.as_mut() {
                    Some(l) => l.next_line().await,
                    None => Ok(None),
                }
            } => {
                match next? {
                    Some(line) => on_line(&line),
                    None => break,
                }
            }
            _ = task.cancelled() => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                return Ok(ChildEnd::Cancelled);
            }
        }
    }

    Ok(ChildEnd::Exited(child.wait().await?))
}

/// One title extraction request.
#[derive(Debug, Clone)]
pub struct RipRequest {
    pub device: String,
    pub title_index: u32,
    pub dest: PathBuf,
}

/// Disc scanning and title extraction.
pub trait RipTool: Send + Sync {
    /// Scan a device for its label and titles.
    fn scan(&self, device: &str) -> ToolHandle<DiscInfo>;

    /// Extract one title to the destination path.
    fn rip_title(&self, request: RipRequest) -> ToolHandle<PathBuf>;

    /// Eject the disc from a device. Best effort.
    fn eject(&self, device: &str) -> ToolHandle<()>;
}

/// Transcoding of one raw title to one output file.
pub trait EncodeTool: Send + Sync {
    fn encode(&self, input: &Path, output: &Path) -> ToolHandle<PathBuf>;
}

/// Best-effort metadata resolution. `None` is a valid, final answer.
pub trait MetadataLookup: Send + Sync {
    fn lookup(&self, hint: &str) -> ToolHandle<Option<DiscMetadata>>;
}

/// The three collaborators the scheduler drives, bundled for injection.
#[derive(Clone)]
pub struct Tools {
    pub rip: Arc<dyn RipTool>,
    pub encode: Arc<dyn EncodeTool>,
    pub metadata: Arc<dyn MetadataLookup>,
}
