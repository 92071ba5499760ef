use anyhow::Context;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;

use super::metadata::RawProbeResult;
use crate::extractors::{MediaEngine, MediaReference};
use crate::output;
use crate::utils::ProcessTracker;
use crate::AcquisitionError;

/// Text reported when the video advertises no caption tracks
pub const NO_TRANSCRIPT: &str = "No transcript available";

static CUE_TIMING: OnceLock<Regex> = OnceLock::new();
static INLINE_TAG: OnceLock<Regex> = OnceLock::new();

/// Compile `pattern` on first use and keep it in `cell`
fn cached_regex(cell: &'static OnceLock<Regex>, pattern: &str) -> Result<&'static Regex, regex::Error> {
    if let Some(regex) = cell.get() {
        return Ok(regex);
    }
    let regex = Regex::new(pattern)?;
    Ok(cell.get_or_init(|| regex))
}

/// Result of a transcript fetch
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptOutcome {
    /// The video has no caption tracks; nothing was written
    Unavailable,
    Saved {
        language: String,
        text: String,
        path: PathBuf,
    },
}

impl TranscriptOutcome {
    pub fn text(&self) -> &str {
        match self {
            TranscriptOutcome::Unavailable => NO_TRANSCRIPT,
            TranscriptOutcome::Saved { text, .. } => text,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            TranscriptOutcome::Unavailable => None,
            TranscriptOutcome::Saved { path, .. } => Some(path),
        }
    }
}

/// Pick `preferred` when available, otherwise the first advertised language.
///
/// `available` keeps the order of the probe payload, so the choice is stable
/// for a given video.
pub fn select_language(available: &[String], preferred: &str) -> Option<String> {
    if available.iter().any(|language| language == preferred) {
        return Some(preferred.to_string());
    }

    available.first().cloned()
}

/// Fetches one caption track and materializes it as plain text
pub struct TranscriptFetcher<'a> {
    engine: &'a dyn MediaEngine,
    preferred_language: &'a str,
    cancel: CancellationToken,
}

impl<'a> TranscriptFetcher<'a> {
    pub fn new(engine: &'a dyn MediaEngine, preferred_language: &'a str) -> Self {
        Self {
            engine,
            preferred_language,
            cancel: CancellationToken::new(),
        }
    }

    /// Abandon the fetch, writing nothing, once `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fetch the transcript for an already probed video and save it next to the other artifacts.
    ///
    /// A video without caption tracks yields [`TranscriptOutcome::Unavailable`]. Once a
    /// track is advertised, any failure to fetch or read it is an error.
    pub async fn fetch(
        &self,
        reference: &MediaReference,
        raw: &RawProbeResult,
        save_dir: &Path,
        title: &str,
        processes: &ProcessTracker,
    ) -> Result<TranscriptOutcome, AcquisitionError> {
        let languages = raw.caption_languages();
        let Some(language) = select_language(&languages, self.preferred_language) else {
            tracing::info!("No caption tracks advertised for: {}", reference.url());
            return Ok(TranscriptOutcome::Unavailable);
        };

        tracing::info!(
            "Fetching `{}` captions (available: {})",
            language,
            languages.join(", ")
        );

        let staging = tempfile::Builder::new()
            .prefix(".mediagrab-captions-")
            .tempdir_in(save_dir)
            .map_err(|e| AcquisitionError::persistence(save_dir, e))?;

        let failed = |source: anyhow::Error| AcquisitionError::Transcript {
            language: language.clone(),
            source,
        };

        let caption_file = self
            .engine
            .download_captions(reference.url(), &language, staging.path(), processes)
            .await
            .map_err(failed)?;

        let vtt = tokio::fs::read_to_string(&caption_file)
            .await
            .with_context(|| format!("Failed to read {}", caption_file.display()))
            .map_err(failed)?;

        let text = vtt_to_text(&vtt).map_err(|e| failed(e.into()))?;
        if text.is_empty() {
            return Err(failed(anyhow::anyhow!("caption track contained no text")));
        }

        if self.cancel.is_cancelled() {
            return Err(AcquisitionError::Cancelled);
        }

        let path = output::save_transcript(&text, save_dir, title)?;
        tracing::info!("Transcript saved to: {}", path.display());

        Ok(TranscriptOutcome::Saved {
            language,
            text,
            path,
        })
    }
}

/// Reduce a WebVTT document to its spoken text.
///
/// Header, NOTE/STYLE blocks, cue identifiers, timings, and inline tags are
/// dropped. Consecutive repeated lines, common in rolling auto-captions, are
/// collapsed.
pub fn vtt_to_text(vtt: &str) -> Result<String, regex::Error> {
    let timing = cached_regex(&CUE_TIMING, r"^\s*(?:\d+:)?\d{2}:\d{2}\.\d{3}\s+-->")?;
    let tag = cached_regex(&INLINE_TAG, r"<[^>]+>")?;

    let normalized = vtt.replace("\r\n", "\n");
    let mut lines: Vec<String> = Vec::new();

    for block in normalized.split("\n\n") {
        let block_lines: Vec<&str> = block.lines().collect();
        let Some(cue_start) = block_lines.iter().position(|line| timing.is_match(line)) else {
            continue;
        };

        for line in &block_lines[cue_start + 1..] {
            let text = decode_entities(&tag.replace_all(line, ""));
            let text = text.trim();
            if text.is_empty() || lines.last().map(String::as_str) == Some(text) {
                continue;
            }
            lines.push(text.to_string());
        }
    }

    Ok(lines.join("\n"))
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
