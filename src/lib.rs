//! mediagrab - acquire metadata, transcripts, and tagged audio for a single video
//!
//! This library validates a video URL, probes it once through an extraction engine
//! (yt-dlp by default), and then persists the requested artifacts into a save
//! directory without ever overwriting an existing file. Long-running acquisitions
//! run on a cancellable worker that reports progress over a channel.

pub mod cli;
pub mod config;
pub mod extractors;
pub mod output;
pub mod pipeline;
pub mod utils;

use std::path::PathBuf;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use extractors::{validate_reference, MediaEngine, MediaReference};
pub use pipeline::{
    AcquisitionPipeline, AcquisitionSummary, AcquisitionTask, AcquisitionWorker, MetadataRecord, Operation,
    ProgressEvent, RawProbeResult, TaskOutput, TranscriptOutcome, WorkerEvent, WorkerHandle,
    WorkerState,
};

/// Result type used for internal plumbing
pub type Result<T> = anyhow::Result<T>;

/// Failure taxonomy surfaced to every caller of the pipeline
#[derive(thiserror::Error, Debug)]
pub enum AcquisitionError {
    #[error("Invalid media reference `{reference}`: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("Metadata extraction failed")]
    Extraction(#[source] anyhow::Error),

    #[error("Transcript fetch failed for language `{language}`")]
    Transcript {
        language: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Audio acquisition failed")]
    AudioAcquisition(#[source] anyhow::Error),

    #[error("Failed to write {}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Acquisition cancelled")]
    Cancelled,
}

impl AcquisitionError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: impl Into<anyhow::Error>) -> Self {
        AcquisitionError::Persistence {
            path: path.into(),
            source: source.into(),
        }
    }

    /// Rendered messages of every underlying cause, outermost first
    pub fn cause_chain(&self) -> Vec<String> {
        let mut causes = Vec::new();
        let mut current = std::error::Error::source(self);
        while let Some(cause) = current {
            causes.push(cause.to_string());
            current = cause.source();
        }
        causes
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AcquisitionError::Cancelled)
    }
}
