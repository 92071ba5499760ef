use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::options::{ExtractionOptions, FILEPATH_MARKER, PROGRESS_MARKER};
use super::{AudioRequest, DownloadProgress, DownloadStatus, MediaEngine};
use crate::config::EngineConfig;
use crate::utils::ProcessTracker;
use crate::Result;

/// YouTube engine backed by the yt-dlp executable
pub struct YtDlpEngine {
    yt_dlp_path: String,
    no_playlist: bool,
    js_runtime: Option<String>,
    extra_args: Vec<String>,
}

impl YtDlpEngine {
    pub fn new() -> Self {
        Self::from_config(&EngineConfig::default())
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            yt_dlp_path: config.yt_dlp_path.clone(),
            no_playlist: config.no_playlist,
            js_runtime: config.js_runtime.clone(),
            extra_args: config.extra_args.clone(),
        }
    }

    /// Options shared by every invocation
    fn base_options(&self) -> ExtractionOptions {
        ExtractionOptions {
            no_playlist: self.no_playlist,
            js_runtime: self.js_runtime.clone(),
            extra_args: self.extra_args.clone(),
            ..ExtractionOptions::default()
        }
    }

    fn command(&self, options: &ExtractionOptions, url: &str) -> Command {
        let mut command = Command::new(&self.yt_dlp_path);
        command
            .args(options.to_args())
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    /// Run yt-dlp to completion and return its stdout
    async fn run(
        &self,
        options: &ExtractionOptions,
        url: &str,
        processes: &ProcessTracker,
    ) -> Result<Vec<u8>> {
        let mut child = processes
            .spawn(&mut self.command(options, url))
            .with_context(|| format!("Failed to start {}", self.yt_dlp_path))?;

        let mut stdout = child.stdout.take().context("yt-dlp stdout was not captured")?;
        let stderr = child.stderr.take().context("yt-dlp stderr was not captured")?;

        let stderr_reader = tokio::spawn(collect_stderr(stderr, None));
        let mut output = Vec::new();
        stdout.read_to_end(&mut output).await?;

        let status = child.wait().await?;
        let stderr = stderr_reader.await.unwrap_or_default();

        if !status.success() {
            anyhow::bail!("yt-dlp failed ({}): {}", status, stderr.trim());
        }

        Ok(output)
    }
}

#[async_trait]
impl MediaEngine for YtDlpEngine {
    async fn probe(&self, url: &str, processes: &ProcessTracker) -> Result<Value> {
        tracing::debug!("Extracting video info for: {}", url);

        let options = ExtractionOptions {
            skip_download: true,
            dump_json: true,
            ..self.base_options()
        };

        let output = self.run(&options, url, processes).await?;
        let info: Value =
            serde_json::from_slice(&output).context("yt-dlp returned malformed JSON")?;

        Ok(info)
    }

    async fn download_captions(
        &self,
        url: &str,
        language: &str,
        output_dir: &Path,
        processes: &ProcessTracker,
    ) -> Result<PathBuf> {
        tracing::debug!("Downloading `{}` captions for: {}", language, url);

        let options = ExtractionOptions {
            skip_download: true,
            caption_languages: vec![language.to_string()],
            caption_format: Some("vtt".to_string()),
            output_template: Some(
                output_dir
                    .join("%(id)s.%(ext)s")
                    .to_string_lossy()
                    .into_owned(),
            ),
            ..self.base_options()
        };

        self.run(&options, url, processes).await?;

        find_caption_file(output_dir)
            .await?
            .with_context(|| format!("yt-dlp did not write a `{}` caption file", language))
    }

    async fn download_audio(
        &self,
        request: &AudioRequest,
        progress: mpsc::Sender<DownloadProgress>,
        processes: &ProcessTracker,
    ) -> Result<PathBuf> {
        tracing::debug!("Downloading audio for: {}", request.url);

        let options = ExtractionOptions {
            audio: Some(request.transcode.clone()),
            metadata_tags: request.tags.clone(),
            output_template: Some(
                request
                    .staging_dir
                    .join(format!("{}.%(ext)s", escape_template(&request.file_stem)))
                    .to_string_lossy()
                    .into_owned(),
            ),
            report_progress: true,
            print_filepath: true,
            ..self.base_options()
        };

        let mut child = processes
            .spawn(&mut self.command(&options, &request.url))
            .with_context(|| format!("Failed to start {}", self.yt_dlp_path))?;

        let stdout = child.stdout.take().context("yt-dlp stdout was not captured")?;
        let stderr = child.stderr.take().context("yt-dlp stderr was not captured")?;
        // Progress lines land on stderr when --print puts yt-dlp in quiet mode.
        let stderr_reader = tokio::spawn(collect_stderr(stderr, Some(progress.clone())));

        let mut lines = BufReader::new(stdout).lines();
        let mut final_path = None;

        while let Some(line) = lines.next_line().await? {
            if let Some(update) = parse_progress_line(&line) {
                // A closed receiver means the caller stopped listening; keep draining output.
                let _ = progress.send(update).await;
            } else if let Some(path) = line.trim().strip_prefix(FILEPATH_MARKER) {
                final_path = Some(PathBuf::from(path));
            } else if !line.trim().is_empty() {
                tracing::debug!("yt-dlp: {}", line);
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_reader.await.unwrap_or_default();

        if !status.success() {
            anyhow::bail!("yt-dlp failed ({}): {}", status, stderr.trim());
        }

        let path = final_path.context("yt-dlp did not report the output file")?;
        if !path.exists() {
            anyhow::bail!("yt-dlp reported {} but it does not exist", path.display());
        }

        Ok(path)
    }

    fn platform_name(&self) -> &'static str {
        "YouTube"
    }
}

impl Default for YtDlpEngine {
    fn default() -> Self {
        Self::new()
    }
}

async fn collect_stderr(
    stderr: tokio::process::ChildStderr,
    progress: Option<mpsc::Sender<DownloadProgress>>,
) -> String {
    let mut buf = String::new();
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(update) = parse_progress_line(&line) {
            if let Some(progress) = &progress {
                let _ = progress.send(update).await;
            }
            continue;
        }
        buf.push_str(&line);
        buf.push('\n');
    }
    buf
}

/// First `.vtt` file in `dir`, by name
async fn find_caption_file(dir: &Path) -> Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut candidates = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("vtt") {
            candidates.push(path);
        }
    }

    candidates.sort();
    Ok(candidates.into_iter().next())
}

/// Parse one line produced by the progress template
fn parse_progress_line(line: &str) -> Option<DownloadProgress> {
    let mut fields = line.trim().strip_prefix(PROGRESS_MARKER)?.split_whitespace();

    let status = match fields.next()? {
        "downloading" => DownloadStatus::Downloading,
        "finished" => DownloadStatus::Finished,
        "error" => DownloadStatus::Error,
        _ => return None,
    };
    let downloaded_bytes = fields.next().and_then(parse_count).unwrap_or(0);
    let total = fields.next().and_then(parse_count);
    let estimate = fields.next().and_then(parse_count);

    Some(DownloadProgress {
        status,
        downloaded_bytes,
        total_bytes: total.or(estimate),
    })
}

/// yt-dlp prints `NA` for unknown values and floats for estimates
fn parse_count(field: &str) -> Option<u64> {
    field
        .parse::<u64>()
        .ok()
        .or_else(|| field.parse::<f64>().ok().map(|v| v.max(0.0) as u64))
}

/// Escape `%` so a literal file stem survives yt-dlp's output templating
fn escape_template(stem: &str) -> String {
    stem.replace('%', "%%")
}
