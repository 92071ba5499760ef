//! Cancellable worker that drives one acquisition task and reports its progress.
//!
//! The worker owns its task for its whole lifetime. It emits [`WorkerEvent`]s on
//! a channel consumed by a single listener: progress that never goes backwards
//! after the initial reset, free-text log lines, and exactly one terminal event.
//! Cancellation is cooperative: [`WorkerHandle::stop`] sets a token that the
//! worker checks at every progress callback, between stages, and before any
//! artifact is committed. A stop observed before the terminal event always
//! ends the task as cancelled, with no artifact left behind.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::audio::AudioAcquirer;
use super::metadata::{MetadataExtractor, MetadataRecord, RawProbeResult};
use super::transcript::{TranscriptFetcher, TranscriptOutcome};
use crate::extractors::{AudioTranscode, DownloadProgress, DownloadStatus, MediaEngine, MediaReference};
use crate::output;
use crate::utils::ProcessTracker;
use crate::AcquisitionError;

/// Share of the progress bar taken by the download; post-processing fills the rest
const DOWNLOAD_SHARE: f64 = 0.9;

/// Buffered progress callbacks between the engine and the worker
const PROGRESS_BUFFER: usize = 64;

/// What a task acquires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Metadata,
    Transcript,
    Audio,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Metadata => write!(f, "metadata"),
            Operation::Transcript => write!(f, "transcript"),
            Operation::Audio => write!(f, "audio"),
        }
    }
}

/// Settings a task carries into the stages it runs
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOptions {
    pub save_dir: PathBuf,
    pub preferred_language: String,
    pub transcode: AudioTranscode,
}

/// One unit of worker-driven work
#[derive(Debug, Clone)]
pub struct AcquisitionTask {
    pub reference: MediaReference,
    pub operation: Operation,
    pub options: TaskOptions,
    probed: Option<(MetadataRecord, RawProbeResult)>,
}

impl AcquisitionTask {
    pub fn new(reference: MediaReference, operation: Operation, options: TaskOptions) -> Self {
        Self {
            reference,
            operation,
            options,
            probed: None,
        }
    }

    /// Reuse a probe the caller already ran, so the worker does not probe again
    pub fn with_probe(mut self, record: MetadataRecord, raw: RawProbeResult) -> Self {
        self.probed = Some((record, raw));
        self
    }
}

/// Result of a successful task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    Metadata(PathBuf),
    Transcript(TranscriptOutcome),
    Audio(PathBuf),
}

impl TaskOutput {
    /// File the task left in the save directory, if any
    pub fn artifact(&self) -> Option<&Path> {
        match self {
            TaskOutput::Metadata(path) | TaskOutput::Audio(path) => Some(path),
            TaskOutput::Transcript(outcome) => outcome.path(),
        }
    }
}

/// Stage label attached to progress events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Probing,
    FetchingCaptions,
    Downloading,
    Processing,
    Saving,
    Complete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Starting => "Starting",
            Phase::Probing => "Probing metadata",
            Phase::FetchingCaptions => "Fetching captions",
            Phase::Downloading => "Downloading",
            Phase::Processing => "Processing",
            Phase::Saving => "Saving",
            Phase::Complete => "Complete",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressEvent {
    /// Completed share of the task, in `[0, 1]`
    pub fraction: f64,
    pub phase: Phase,
}

/// Failure payload of the terminal error event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub message: String,
    pub causes: Vec<String>,
    pub cancelled: bool,
}

impl From<&AcquisitionError> for FailureReport {
    fn from(error: &AcquisitionError) -> Self {
        Self {
            message: error.to_string(),
            causes: error.cause_chain(),
            cancelled: error.is_cancelled(),
        }
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for cause in &self.causes {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum WorkerEvent {
    Progress(ProgressEvent),
    Log(String),
    Error(FailureReport),
    Finished,
}

impl WorkerEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerEvent::Error(_) | WorkerEvent::Finished)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Idle,
    Running,
    CancelRequested,
    Succeeded,
    Failed,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Succeeded | WorkerState::Failed)
    }
}

/// Cloneable control surface of a worker, usable from any task
#[derive(Clone)]
pub struct WorkerHandle {
    cancel: CancellationToken,
    state: Arc<watch::Sender<WorkerState>>,
    processes: ProcessTracker,
}

impl WorkerHandle {
    /// Ask the worker to stop at its next checkpoint
    pub fn stop(&self) {
        self.cancel.cancel();
        self.state.send_if_modified(|state| {
            if *state == WorkerState::Running {
                *state = WorkerState::CancelRequested;
                true
            } else {
                false
            }
        });
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// How many times subprocess cleanup has run for this worker
    pub fn cleanup_count(&self) -> usize {
        self.processes.termination_count()
    }

    /// How many subprocesses the worker has spawned so far
    pub fn spawned_processes(&self) -> usize {
        self.processes.spawned_count()
    }
}

/// Drives one [`AcquisitionTask`]; consumed by [`AcquisitionWorker::run`]
pub struct AcquisitionWorker {
    task: AcquisitionTask,
    engine: Arc<dyn MediaEngine>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<WorkerState>>,
    processes: ProcessTracker,
    last_fraction: f64,
}

impl AcquisitionWorker {
    pub fn new(
        task: AcquisitionTask,
        engine: Arc<dyn MediaEngine>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            task,
            engine,
            events,
            cancel: CancellationToken::new(),
            state: Arc::new(state),
            processes: ProcessTracker::new(),
            last_fraction: 0.0,
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            cancel: self.cancel.clone(),
            state: self.state.clone(),
            processes: self.processes.clone(),
        }
    }

    /// Run the task to a terminal state on a separate tokio task
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<TaskOutput, AcquisitionError>> {
        tokio::spawn(self.run())
    }

    /// Run the task to a terminal state.
    ///
    /// Subprocesses are cleaned up on every exit path before the single
    /// terminal event is sent.
    pub async fn run(mut self) -> Result<TaskOutput, AcquisitionError> {
        self.set_state(WorkerState::Running);
        tracing::info!(
            "Starting {} acquisition for: {}",
            self.task.operation,
            self.task.reference.url()
        );

        self.last_fraction = 0.0;
        self.emit(WorkerEvent::Progress(ProgressEvent {
            fraction: 0.0,
            phase: Phase::Starting,
        }));

        let outcome = match self.execute().await {
            Ok(output) => self.commit(output).await,
            Err(e) => Err(e),
        };

        let terminated = self.processes.terminate_all().await;
        if terminated > 0 {
            tracing::debug!("Terminated {} lingering subprocess(es)", terminated);
        }

        match &outcome {
            Ok(_) => {
                self.report_progress(1.0, Phase::Complete);
                self.set_state(WorkerState::Succeeded);
                tracing::info!("{} acquisition finished", self.task.operation);
                self.emit(WorkerEvent::Finished);
            }
            Err(error) => {
                self.set_state(WorkerState::Failed);
                if error.is_cancelled() {
                    tracing::info!("{} acquisition cancelled", self.task.operation);
                } else {
                    tracing::warn!("{} acquisition failed: {:#}", self.task.operation, FailureReport::from(error));
                }
                self.emit(WorkerEvent::Error(FailureReport::from(error)));
            }
        }

        outcome
    }

    async fn execute(&mut self) -> Result<TaskOutput, AcquisitionError> {
        self.checkpoint()?;

        let engine = self.engine.clone();
        let processes = self.processes.clone();
        let options = self.task.options.clone();

        let (record, raw) = match self.task.probed.take() {
            Some(probed) => probed,
            None => {
                self.report_progress(0.0, Phase::Probing);
                let probed = MetadataExtractor::new(engine.as_ref())
                    .probe(&self.task.reference, &processes)
                    .await?;
                self.checkpoint()?;
                probed
            }
        };

        let reference = self.task.reference.resolved(record.id.clone());
        let title = record.display_title().to_string();

        match self.task.operation {
            Operation::Metadata => {
                self.report_progress(0.5, Phase::Saving);
                self.checkpoint()?;
                let path = output::save_metadata(&record, &options.save_dir)?;
                self.log(format!("Metadata saved to {}", path.display()));
                Ok(TaskOutput::Metadata(path))
            }
            Operation::Transcript => {
                self.report_progress(0.3, Phase::FetchingCaptions);
                let outcome = TranscriptFetcher::new(engine.as_ref(), &options.preferred_language)
                    .with_cancel(self.cancel.clone())
                    .fetch(&reference, &raw, &options.save_dir, &title, &processes)
                    .await?;
                match outcome.path() {
                    Some(path) => self.log(format!("Transcript saved to {}", path.display())),
                    None => self.log(outcome.text().to_string()),
                }
                Ok(TaskOutput::Transcript(outcome))
            }
            Operation::Audio => {
                self.report_progress(0.0, Phase::Downloading);

                let (progress_tx, mut progress_rx) = mpsc::channel(PROGRESS_BUFFER);
                let acquirer = AudioAcquirer::new(engine.as_ref(), options.transcode.clone())
                    .with_cancel(self.cancel.clone());
                let acquisition = acquirer.acquire(
                    &reference,
                    &options.save_dir,
                    &title,
                    record.uploader.as_deref(),
                    progress_tx,
                    &processes,
                );
                tokio::pin!(acquisition);

                let mut processing_logged = false;
                let path = loop {
                    tokio::select! {
                        biased;
                        Some(update) = progress_rx.recv() => {
                            self.checkpoint()?;
                            self.on_download_progress(&update, &mut processing_logged);
                        }
                        result = &mut acquisition => break result?,
                    }
                };

                self.log(format!("Audio saved to {}", path.display()));
                Ok(TaskOutput::Audio(path))
            }
        }
    }

    /// Last checkpoint: a stop that arrived while the final stage was silent
    /// discards what it saved.
    async fn commit(&self, output: TaskOutput) -> Result<TaskOutput, AcquisitionError> {
        if let Err(cancelled) = self.checkpoint() {
            if let Some(path) = output.artifact() {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => tracing::debug!("Discarded {}", path.display()),
                    Err(e) => tracing::warn!("Failed to discard {}: {}", path.display(), e),
                }
            }
            return Err(cancelled);
        }
        Ok(output)
    }

    /// Cancellation checkpoint
    fn checkpoint(&self) -> Result<(), AcquisitionError> {
        if self.cancel.is_cancelled() {
            self.state.send_if_modified(|state| {
                if *state == WorkerState::Running {
                    *state = WorkerState::CancelRequested;
                    true
                } else {
                    false
                }
            });
            return Err(AcquisitionError::Cancelled);
        }
        Ok(())
    }

    fn on_download_progress(&mut self, update: &DownloadProgress, processing_logged: &mut bool) {
        match update.status {
            DownloadStatus::Downloading => {
                if let Some(fraction) = update.fraction() {
                    self.report_progress(fraction * DOWNLOAD_SHARE, Phase::Downloading);
                }
            }
            DownloadStatus::Finished => {
                self.report_progress(DOWNLOAD_SHARE, Phase::Processing);
                if !*processing_logged {
                    *processing_logged = true;
                    self.log("Processing file…".to_string());
                }
            }
            DownloadStatus::Error => {
                self.log("Engine reported a download error".to_string());
            }
        }
    }

    /// Emit progress unless it would move backwards
    fn report_progress(&mut self, fraction: f64, phase: Phase) {
        let fraction = fraction.clamp(0.0, 1.0);
        if fraction < self.last_fraction {
            return;
        }
        self.last_fraction = fraction;
        self.emit(WorkerEvent::Progress(ProgressEvent { fraction, phase }));
    }

    fn log(&self, line: String) {
        tracing::info!("{}", line);
        self.emit(WorkerEvent::Log(line));
    }

    fn emit(&self, event: WorkerEvent) {
        // The listener may have gone away; the task still runs to completion.
        let _ = self.events.send(event);
    }

    fn set_state(&self, next: WorkerState) {
        self.state.send_replace(next);
    }
}
