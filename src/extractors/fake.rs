//! Scripted engine for exercising the pipeline without yt-dlp or the network.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};

use super::{AudioRequest, DownloadProgress, DownloadStatus, MediaEngine};
use crate::utils::ProcessTracker;
use crate::Result;

pub(crate) struct FakeEngine {
    info: Value,
    probe_error: Option<String>,
    captions: HashMap<String, String>,
    audio_progress: Vec<DownloadProgress>,
    audio_extension: String,
    audio_error: Option<String>,
    pause_after: Option<usize>,
    gate: Arc<Notify>,
    lingering_process: bool,
    probe_calls: AtomicUsize,
    caption_requests: Mutex<Vec<String>>,
    audio_requests: Mutex<Vec<AudioRequest>>,
}

impl FakeEngine {
    pub(crate) fn new(info: Value) -> Self {
        Self {
            info,
            probe_error: None,
            captions: HashMap::new(),
            audio_progress: Vec::new(),
            audio_extension: "mp3".to_string(),
            audio_error: None,
            pause_after: None,
            gate: Arc::new(Notify::new()),
            lingering_process: false,
            probe_calls: AtomicUsize::new(0),
            caption_requests: Mutex::new(Vec::new()),
            audio_requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing_probe(message: &str) -> Self {
        Self {
            probe_error: Some(message.to_string()),
            ..Self::new(Value::Null)
        }
    }

    pub(crate) fn with_captions(mut self, language: &str, vtt: &str) -> Self {
        self.captions.insert(language.to_string(), vtt.to_string());
        self
    }

    /// Send `downloading` updates for each byte count out of `total`, then `finished`
    pub(crate) fn with_audio_progress(mut self, downloaded: &[u64], total: u64) -> Self {
        self.audio_progress = downloaded
            .iter()
            .map(|bytes| DownloadProgress {
                status: DownloadStatus::Downloading,
                downloaded_bytes: *bytes,
                total_bytes: Some(total),
            })
            .collect();
        self.audio_progress.push(DownloadProgress {
            status: DownloadStatus::Finished,
            downloaded_bytes: total,
            total_bytes: Some(total),
        });
        self
    }

    pub(crate) fn with_audio_extension(mut self, extension: &str) -> Self {
        self.audio_extension = extension.to_string();
        self
    }

    pub(crate) fn with_audio_error(mut self, message: &str) -> Self {
        self.audio_error = Some(message.to_string());
        self
    }

    /// Block the download after `count` progress updates until [`FakeEngine::release`].
    /// A count equal to the number of updates blocks just before the file is written.
    pub(crate) fn pause_after(mut self, count: usize) -> Self {
        self.pause_after = Some(count);
        self
    }

    /// Leave a long-running subprocess behind for the worker to clean up
    pub(crate) fn with_lingering_process(mut self) -> Self {
        self.lingering_process = true;
        self
    }

    pub(crate) fn release(&self) {
        self.gate.notify_one();
    }

    pub(crate) fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn caption_requests(&self) -> Vec<String> {
        self.caption_requests.lock().unwrap().clone()
    }

    pub(crate) fn audio_requests(&self) -> Vec<AudioRequest> {
        self.audio_requests.lock().unwrap().clone()
    }

    fn id(&self) -> String {
        self.info
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("video")
            .to_string()
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn probe(&self, _url: &str, _processes: &ProcessTracker) -> Result<Value> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        match &self.probe_error {
            Some(message) => Err(anyhow::anyhow!(message.clone())),
            None => Ok(self.info.clone()),
        }
    }

    async fn download_captions(
        &self,
        _url: &str,
        language: &str,
        output_dir: &Path,
        _processes: &ProcessTracker,
    ) -> Result<PathBuf> {
        self.caption_requests.lock().unwrap().push(language.to_string());

        let vtt = self
            .captions
            .get(language)
            .ok_or_else(|| anyhow::anyhow!("no `{}` captions scripted", language))?;

        let path = output_dir.join(format!("{}.{}.vtt", self.id(), language));
        tokio::fs::write(&path, vtt).await?;
        Ok(path)
    }

    async fn download_audio(
        &self,
        request: &AudioRequest,
        progress: mpsc::Sender<DownloadProgress>,
        processes: &ProcessTracker,
    ) -> Result<PathBuf> {
        self.audio_requests.lock().unwrap().push(request.clone());

        if self.lingering_process {
            processes.spawn(Command::new("sleep").arg("30"))?;
        }

        for (index, update) in self.audio_progress.iter().enumerate() {
            if self.pause_after == Some(index) {
                self.gate.notified().await;
            }
            let _ = progress.send(update.clone()).await;
            tokio::task::yield_now().await;
        }
        if self.pause_after == Some(self.audio_progress.len()) {
            self.gate.notified().await;
        }

        if let Some(message) = &self.audio_error {
            anyhow::bail!("{}", message);
        }

        let path = request
            .staging_dir
            .join(format!("{}.{}", request.file_stem, self.audio_extension));
        tokio::fs::write(&path, b"ID3").await?;
        Ok(path)
    }

    fn platform_name(&self) -> &'static str {
        "YouTube"
    }
}
