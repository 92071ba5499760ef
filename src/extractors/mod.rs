use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use url::Url;

pub mod options;
pub mod youtube;

#[cfg(test)]
pub(crate) mod fake;

pub use options::{AudioTranscode, ExtractionOptions, MetadataTags};
pub use youtube::YtDlpEngine;

use crate::utils::ProcessTracker;
use crate::{AcquisitionError, Result};

/// Domains accepted by [`validate_reference`], subdomains included
pub const SUPPORTED_HOSTS: &[&str] = &["youtube.com", "youtu.be"];

/// A validated video URL, plus the canonical id once it has been probed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaReference {
    url: String,
    canonical_id: Option<String>,
}

impl MediaReference {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn canonical_id(&self) -> Option<&str> {
        self.canonical_id.as_deref()
    }

    /// Copy of this reference resolved to the id reported by a probe
    pub fn resolved(&self, canonical_id: Option<String>) -> Self {
        Self {
            url: self.url.clone(),
            canonical_id,
        }
    }
}

/// Validate a URL before any network work happens.
///
/// The URL must parse, use HTTP(S), and its host must be one of
/// [`SUPPORTED_HOSTS`] or a subdomain of one.
pub fn validate_reference(url: &str) -> std::result::Result<MediaReference, AcquisitionError> {
    let trimmed = url.trim();
    let invalid = |reason: &str| AcquisitionError::InvalidReference {
        reference: url.to_string(),
        reason: reason.to_string(),
    };

    if trimmed.is_empty() {
        return Err(invalid("URL is empty"));
    }

    let parsed = Url::parse(trimmed).map_err(|_| invalid("not a valid URL"))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid("URL must use HTTP or HTTPS protocol"));
    }

    let host = parsed.host_str().unwrap_or_default().trim_end_matches('.');
    if !is_supported_host(host) {
        return Err(invalid("not a supported YouTube URL"));
    }

    Ok(MediaReference {
        url: trimmed.to_string(),
        canonical_id: None,
    })
}

fn is_supported_host(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    SUPPORTED_HOSTS.iter().any(|domain| {
        host == *domain
            || host
                .strip_suffix(domain)
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}

/// Status reported by the engine's progress callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Finished,
    Error,
}

/// One progress callback from a running download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub status: DownloadStatus,
    pub downloaded_bytes: u64,
    /// Exact total, or the engine's estimate when the exact size is unknown
    pub total_bytes: Option<u64>,
}

impl DownloadProgress {
    /// Completed share of this download, if the total is known
    pub fn fraction(&self) -> Option<f64> {
        match self.status {
            DownloadStatus::Finished => Some(1.0),
            _ => self
                .total_bytes
                .filter(|total| *total > 0)
                .map(|total| (self.downloaded_bytes as f64 / total as f64).clamp(0.0, 1.0)),
        }
    }
}

/// Everything the engine needs to download, transcode, and tag one audio file
#[derive(Debug, Clone, PartialEq)]
pub struct AudioRequest {
    pub url: String,
    /// Directory the engine writes into; the caller moves the result to its final name
    pub staging_dir: PathBuf,
    /// File stem, without extension
    pub file_stem: String,
    pub transcode: AudioTranscode,
    pub tags: MetadataTags,
}

/// Extraction and transcoding capability the pipeline orchestrates
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Probe a URL without downloading media and return the raw extraction payload
    async fn probe(&self, url: &str, processes: &ProcessTracker) -> Result<Value>;

    /// Download one caption track into `output_dir` and return the written file
    async fn download_captions(
        &self,
        url: &str,
        language: &str,
        output_dir: &Path,
        processes: &ProcessTracker,
    ) -> Result<PathBuf>;

    /// Download best audio, transcode and tag it, and return the produced file.
    ///
    /// Progress is sent periodically on `progress`.
    async fn download_audio(
        &self,
        request: &AudioRequest,
        progress: mpsc::Sender<DownloadProgress>,
        processes: &ProcessTracker,
    ) -> Result<PathBuf>;

    /// Get the name of the platform this engine serves
    fn platform_name(&self) -> &'static str;
}
