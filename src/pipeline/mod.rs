use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod audio;
pub mod metadata;
pub mod transcript;
pub mod worker;

pub use audio::AudioAcquirer;
pub use metadata::{MetadataExtractor, MetadataRecord, RawProbeResult};
pub use transcript::{select_language, vtt_to_text, TranscriptFetcher, TranscriptOutcome, NO_TRANSCRIPT};
pub use worker::{
    AcquisitionTask, AcquisitionWorker, FailureReport, Operation, Phase, ProgressEvent, TaskOptions,
    TaskOutput, WorkerEvent, WorkerHandle, WorkerState,
};

use crate::config::Config;
use crate::extractors::{validate_reference, AudioTranscode, MediaEngine, MediaReference, YtDlpEngine};
use crate::output;
use crate::utils::ProcessTracker;
use crate::AcquisitionError;

/// Everything one `run_all` invocation produced
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSummary {
    pub metadata: PathBuf,
    pub transcript: TranscriptOutcome,
    pub audio: PathBuf,
}

/// A validated and probed reference, ready for the acquisition stages
struct Prepared {
    reference: MediaReference,
    record: MetadataRecord,
    raw: RawProbeResult,
}

/// Public entry point: validates, probes once, then acquires the requested artifacts
pub struct AcquisitionPipeline {
    engine: Arc<dyn MediaEngine>,
    preferred_language: String,
    transcode: AudioTranscode,
}

impl AcquisitionPipeline {
    /// Create a pipeline backed by yt-dlp
    pub fn new(config: &Config) -> Self {
        Self::with_engine(Arc::new(YtDlpEngine::from_config(&config.engine)), config)
    }

    pub fn with_engine(engine: Arc<dyn MediaEngine>, config: &Config) -> Self {
        Self {
            engine,
            preferred_language: config.captions.preferred_language.clone(),
            transcode: config.transcode(),
        }
    }

    pub fn engine(&self) -> &dyn MediaEngine {
        self.engine.as_ref()
    }

    /// Save the metadata record of `url` as JSON and return its path
    pub async fn run_metadata_only(&self, url: &str, save_dir: &Path) -> Result<PathBuf, AcquisitionError> {
        let processes = ProcessTracker::new();
        let result = async {
            let prepared = self.prepare(url, save_dir, &processes).await?;
            output::save_metadata(&prepared.record, save_dir)
        }
        .await;

        cleanup(&processes).await;
        result
    }

    /// Fetch and save the transcript of `url`
    pub async fn run_transcript_only(
        &self,
        url: &str,
        save_dir: &Path,
    ) -> Result<TranscriptOutcome, AcquisitionError> {
        let processes = ProcessTracker::new();
        let result = async {
            let prepared = self.prepare(url, save_dir, &processes).await?;
            TranscriptFetcher::new(self.engine.as_ref(), &self.preferred_language)
                .fetch(
                    &prepared.reference,
                    &prepared.raw,
                    save_dir,
                    prepared.record.display_title(),
                    &processes,
                )
                .await
        }
        .await;

        cleanup(&processes).await;
        result
    }

    /// Validate and probe `url`, then hand back a worker that acquires its audio.
    ///
    /// Nothing has been downloaded yet when this returns; the caller drives the
    /// worker and may stop it through [`AcquisitionWorker::handle`]. A failure
    /// here is also reported on `events`, so listeners always see a terminal event.
    pub async fn prepare_audio(
        &self,
        url: &str,
        save_dir: &Path,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<AcquisitionWorker, AcquisitionError> {
        let processes = ProcessTracker::new();
        let prepared = self.prepare(url, save_dir, &processes).await;
        cleanup(&processes).await;

        let prepared = prepared.map_err(|e| report_failure(&events, e))?;
        let task = AcquisitionTask::new(prepared.reference, Operation::Audio, self.task_options(save_dir))
            .with_probe(prepared.record, prepared.raw);

        Ok(AcquisitionWorker::new(task, self.engine.clone(), events))
    }

    /// Acquire tagged audio for `url` through a worker, reporting on `events`
    pub async fn run_audio_only(
        &self,
        url: &str,
        save_dir: &Path,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<PathBuf, AcquisitionError> {
        let worker = self.prepare_audio(url, save_dir, events).await?;
        expect_audio(worker.run().await?)
    }

    /// Metadata, transcript, and audio from a single probe
    pub async fn run_all(
        &self,
        url: &str,
        save_dir: &Path,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<AcquisitionSummary, AcquisitionError> {
        let processes = ProcessTracker::new();
        let staged = async {
            let prepared = self.prepare(url, save_dir, &processes).await?;
            let title = prepared.record.display_title().to_string();

            let metadata = output::save_metadata(&prepared.record, save_dir)?;
            let _ = events.send(WorkerEvent::Log(format!("Metadata saved to {}", metadata.display())));

            let transcript = TranscriptFetcher::new(self.engine.as_ref(), &self.preferred_language)
                .fetch(&prepared.reference, &prepared.raw, save_dir, &title, &processes)
                .await?;
            let line = match transcript.path() {
                Some(path) => format!("Transcript saved to {}", path.display()),
                None => transcript.text().to_string(),
            };
            let _ = events.send(WorkerEvent::Log(line));

            Ok::<_, AcquisitionError>((prepared, metadata, transcript))
        }
        .await;
        cleanup(&processes).await;

        let (prepared, metadata, transcript) = staged.map_err(|e| report_failure(&events, e))?;

        let task = AcquisitionTask::new(prepared.reference, Operation::Audio, self.task_options(save_dir))
            .with_probe(prepared.record, prepared.raw);
        let audio = expect_audio(AcquisitionWorker::new(task, self.engine.clone(), events).run().await?)?;

        Ok(AcquisitionSummary {
            metadata,
            transcript,
            audio,
        })
    }

    /// Validate, make sure `save_dir` exists, and run the single probe
    async fn prepare(
        &self,
        url: &str,
        save_dir: &Path,
        processes: &ProcessTracker,
    ) -> Result<Prepared, AcquisitionError> {
        let reference = validate_reference(url)?;

        tokio::fs::create_dir_all(save_dir)
            .await
            .map_err(|e| AcquisitionError::persistence(save_dir, e))?;

        let (record, raw) = MetadataExtractor::new(self.engine.as_ref())
            .probe(&reference, processes)
            .await?;
        let reference = reference.resolved(raw.id().map(str::to_string));

        Ok(Prepared { reference, record, raw })
    }

    fn task_options(&self, save_dir: &Path) -> TaskOptions {
        TaskOptions {
            save_dir: save_dir.to_path_buf(),
            preferred_language: self.preferred_language.clone(),
            transcode: self.transcode.clone(),
        }
    }
}

async fn cleanup(processes: &ProcessTracker) {
    let remaining = processes.terminate_all().await;
    if remaining > 0 {
        tracing::debug!("Terminated {} lingering subprocess(es)", remaining);
    }
}

fn report_failure(events: &mpsc::UnboundedSender<WorkerEvent>, error: AcquisitionError) -> AcquisitionError {
    let _ = events.send(WorkerEvent::Error(FailureReport::from(&error)));
    error
}

fn expect_audio(output: TaskOutput) -> Result<PathBuf, AcquisitionError> {
    match output {
        TaskOutput::Audio(path) => Ok(path),
        other => Err(AcquisitionError::AudioAcquisition(anyhow::anyhow!(
            "worker produced {:?} instead of audio",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractors::fake::FakeEngine;
    use crate::extractors::MockMediaEngine;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    const URL: &str = "https://www.youtube.com/watch?v=abc123";

    const VTT: &str = "WEBVTT\n\n00:00:00.000 --> 00:00:02.000\nHello there\n";

    fn video() -> Value {
        json!({
            "id": "abc123",
            "title": "My Video",
            "uploader": "Someone",
            "view_count": 42,
            "duration": 61.5,
            "upload_date": "20240131",
            "subtitles": {"fr": [{"ext": "vtt"}], "en": [{"ext": "vtt"}]}
        })
    }

    fn pipeline(engine: Arc<dyn MediaEngine>) -> AcquisitionPipeline {
        AcquisitionPipeline::with_engine(engine, &Config::default())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_invalid_reference_never_reaches_engine() {
        let mut engine = MockMediaEngine::new();
        engine.expect_probe().never();
        engine.expect_download_captions().never();
        engine.expect_download_audio().never();
        let pipeline = pipeline(Arc::new(engine));
        let dir = TempDir::new().unwrap();

        for url in ["", "not a url", "ftp://youtube.com/watch?v=x", "https://vimeo.com/12345"] {
            let err = pipeline.run_metadata_only(url, dir.path()).await.unwrap_err();
            assert!(matches!(err, AcquisitionError::InvalidReference { .. }), "{url}: {err}");
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_metadata_only_writes_record_then_unique_copy() {
        let engine = Arc::new(FakeEngine::new(video()));
        let pipeline = pipeline(engine.clone());
        let dir = TempDir::new().unwrap();

        let first = pipeline.run_metadata_only(URL, dir.path()).await.unwrap();
        assert_eq!(first, dir.path().join("My Video.json"));

        let saved: Value = serde_json::from_str(&std::fs::read_to_string(&first).unwrap()).unwrap();
        assert_eq!(saved["url"], json!(URL));
        assert_eq!(saved["title"], json!("My Video"));
        assert_eq!(saved["view_count"], json!(42));
        assert_eq!(saved["like_count"], Value::Null);
        assert_eq!(saved["tags"], Value::Null);
        assert!(saved.get("subtitles").is_none());

        let second = pipeline.run_metadata_only(URL, dir.path()).await.unwrap();
        assert_eq!(second, dir.path().join("My Video (1).json"));
        assert_eq!(engine.probe_calls(), 2);
    }

    #[tokio::test]
    async fn test_metadata_only_creates_missing_save_dir() {
        let engine = Arc::new(FakeEngine::new(video()));
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("downloads").join("today");

        let path = pipeline(engine).run_metadata_only(URL, &nested).await.unwrap();
        assert_eq!(path, nested.join("My Video.json"));
    }

    #[tokio::test]
    async fn test_probe_failure_surfaces_extraction_error() {
        let engine = Arc::new(FakeEngine::failing_probe("ERROR: Video unavailable"));
        let dir = TempDir::new().unwrap();

        let err = pipeline(engine).run_transcript_only(URL, dir.path()).await.unwrap_err();
        assert!(matches!(err, AcquisitionError::Extraction(_)));
        assert_eq!(err.cause_chain(), vec!["ERROR: Video unavailable".to_string()]);
    }

    #[tokio::test]
    async fn test_transcript_only_probes_once_and_prefers_english() {
        let engine = Arc::new(FakeEngine::new(video()).with_captions("en", VTT));
        let dir = TempDir::new().unwrap();

        let outcome = pipeline(engine.clone())
            .run_transcript_only(URL, dir.path())
            .await
            .unwrap();

        assert_eq!(outcome.text(), "Hello there");
        assert_eq!(outcome.path(), Some(dir.path().join("My Video.txt").as_path()));
        assert_eq!(engine.probe_calls(), 1);
        assert_eq!(engine.caption_requests(), vec!["en".to_string()]);
    }

    #[tokio::test]
    async fn test_audio_only_runs_through_worker() {
        let engine = Arc::new(FakeEngine::new(video()).with_audio_progress(&[250, 1000], 1000));
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let path = pipeline(engine.clone())
            .run_audio_only(URL, dir.path(), tx)
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("My Video.mp3"));
        assert_eq!(engine.probe_calls(), 1);
        assert_eq!(engine.audio_requests()[0].tags.artist.as_deref(), Some("Someone"));

        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&WorkerEvent::Finished));
        assert_eq!(events.iter().filter(|event| event.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_prepare_audio_failure_emits_terminal_event() {
        let engine = Arc::new(FakeEngine::new(video()));
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = pipeline(engine.clone())
            .prepare_audio("https://example.com/video", dir.path(), tx)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, AcquisitionError::InvalidReference { .. }));
        assert_eq!(engine.probe_calls(), 0);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], WorkerEvent::Error(report) if !report.cancelled));
    }

    #[tokio::test]
    async fn test_run_all_shares_one_probe() {
        let engine = Arc::new(
            FakeEngine::new(video())
                .with_captions("en", VTT)
                .with_audio_progress(&[1000], 1000),
        );
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let summary = pipeline(engine.clone()).run_all(URL, dir.path(), tx).await.unwrap();

        assert_eq!(summary.metadata, dir.path().join("My Video.json"));
        assert_eq!(summary.transcript.path(), Some(dir.path().join("My Video.txt").as_path()));
        assert_eq!(summary.audio, dir.path().join("My Video.mp3"));
        assert_eq!(engine.probe_calls(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 3);

        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&WorkerEvent::Finished));
    }

    #[tokio::test]
    async fn test_run_all_stops_on_transcript_failure() {
        // English is advertised but the engine cannot deliver it
        let engine = Arc::new(FakeEngine::new(video()));
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = pipeline(engine.clone()).run_all(URL, dir.path(), tx).await.unwrap_err();

        assert!(matches!(err, AcquisitionError::Transcript { .. }));
        assert!(engine.audio_requests().is_empty());
        assert!(dir.path().join("My Video.json").exists());

        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(WorkerEvent::Error(_))));
    }
}
