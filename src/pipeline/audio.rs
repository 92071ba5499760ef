use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::extractors::{AudioRequest, AudioTranscode, DownloadProgress, MediaEngine, MediaReference, MetadataTags};
use crate::output;
use crate::utils::{sanitize_filename, unique_output_path, ProcessTracker};
use crate::AcquisitionError;

/// Downloads best audio, transcodes it, and tags it with artist and title
pub struct AudioAcquirer<'a> {
    engine: &'a dyn MediaEngine,
    transcode: AudioTranscode,
    cancel: CancellationToken,
}

impl<'a> AudioAcquirer<'a> {
    pub fn new(engine: &'a dyn MediaEngine, transcode: AudioTranscode) -> Self {
        Self {
            engine,
            transcode,
            cancel: CancellationToken::new(),
        }
    }

    /// Discard the downloaded file instead of saving it once `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Acquire the audio of `reference` into `save_dir` and return where it landed.
    ///
    /// The engine works inside a staging directory; the finished file is then
    /// moved to a collision-free name, so nothing in `save_dir` is overwritten.
    pub async fn acquire(
        &self,
        reference: &MediaReference,
        save_dir: &Path,
        title: &str,
        uploader: Option<&str>,
        progress: mpsc::Sender<DownloadProgress>,
        processes: &ProcessTracker,
    ) -> Result<PathBuf, AcquisitionError> {
        let safe_title = sanitize_filename(title);
        let planned = unique_output_path(save_dir, title, &self.transcode.codec);
        let file_stem = planned
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| safe_title.clone());

        tracing::info!(
            "Downloading audio as {} @ {} kbps to: {}",
            self.transcode.codec,
            self.transcode.quality_kbps,
            planned.display()
        );

        let staging = tempfile::Builder::new()
            .prefix(".mediagrab-audio-")
            .tempdir_in(save_dir)
            .map_err(|e| AcquisitionError::persistence(save_dir, e))?;

        let request = AudioRequest {
            url: reference.url().to_string(),
            staging_dir: staging.path().to_path_buf(),
            file_stem,
            transcode: self.transcode.clone(),
            tags: MetadataTags {
                artist: uploader.map(str::to_string),
                title: Some(safe_title.clone()),
            },
        };

        let produced = self
            .engine
            .download_audio(&request, progress, processes)
            .await
            .map_err(AcquisitionError::AudioAcquisition)?;

        if !produced.is_file() {
            return Err(AcquisitionError::AudioAcquisition(anyhow::anyhow!(
                "engine reported {} but no file was produced",
                produced.display()
            )));
        }

        let extension = produced
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.transcode.codec.clone());

        // Dropping `staging` removes the downloaded file.
        if self.cancel.is_cancelled() {
            return Err(AcquisitionError::Cancelled);
        }

        // Claim the final name first; the rename then only replaces our own placeholder.
        // The planned name may have been taken meanwhile, or the engine may have
        // produced another container than requested.
        let (final_path, placeholder) = output::claim_unique(save_dir, title, &extension)?;
        drop(placeholder);

        if let Err(e) = tokio::fs::rename(&produced, &final_path).await {
            if let Err(cleanup) = tokio::fs::remove_file(&final_path).await {
                tracing::warn!("Failed to release {}: {}", final_path.display(), cleanup);
            }
            return Err(AcquisitionError::persistence(&final_path, e));
        }

        tracing::info!("Audio saved to: {}", final_path.display());
        Ok(final_path)
    }
}
