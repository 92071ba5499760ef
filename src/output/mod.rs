use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::pipeline::MetadataRecord;
use crate::utils::{format_duration, unique_output_path};
use crate::AcquisitionError;

/// Attempts made when another writer claims a free name first
const MAX_CLAIM_ATTEMPTS: usize = 16;

/// Save metadata as indented JSON at `<title>.json`, never overwriting
pub fn save_metadata(record: &MetadataRecord, save_dir: &Path) -> Result<PathBuf, AcquisitionError> {
    let mut content = serde_json::to_string_pretty(record)
        .map_err(|e| AcquisitionError::persistence(save_dir, e))?;
    content.push('\n');

    write_unique(save_dir, record.display_title(), "json", content.as_bytes())
}

/// Save transcript text at `<title>.txt`, never overwriting
pub fn save_transcript(text: &str, save_dir: &Path, title: &str) -> Result<PathBuf, AcquisitionError> {
    let mut content = text.to_string();
    if !content.ends_with('\n') {
        content.push('\n');
    }

    write_unique(save_dir, title, "txt", content.as_bytes())
}

/// Write `content` to the first free `<title>.<extension>` name in `save_dir`
fn write_unique(
    save_dir: &Path,
    title: &str,
    extension: &str,
    content: &[u8],
) -> Result<PathBuf, AcquisitionError> {
    let (path, file) = claim_unique(save_dir, title, extension)?;
    write_claimed(&path, file, content)?;
    tracing::debug!("Wrote {}", path.display());
    Ok(path)
}

/// Reserve the first free `<title>.<extension>` name in `save_dir` as an empty file
pub(crate) fn claim_unique(
    save_dir: &Path,
    title: &str,
    extension: &str,
) -> Result<(PathBuf, fs_err::File), AcquisitionError> {
    claim_first_free(|| unique_output_path(save_dir, title, extension))
}

fn claim_first_free(
    mut next_candidate: impl FnMut() -> PathBuf,
) -> Result<(PathBuf, fs_err::File), AcquisitionError> {
    let mut last_path = PathBuf::new();

    for _ in 0..MAX_CLAIM_ATTEMPTS {
        let path = next_candidate();

        // create_new refuses to clobber a file that appeared after the existence check
        let file = fs_err::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path);

        match file {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::debug!("{} was claimed concurrently, retrying", path.display());
                last_path = path;
            }
            Err(e) => return Err(AcquisitionError::persistence(&path, e)),
        }
    }

    Err(AcquisitionError::persistence(
        &last_path,
        anyhow::anyhow!("no free file name after {} attempts", MAX_CLAIM_ATTEMPTS),
    ))
}

/// Fill a freshly claimed file; a partial write is removed, not left behind
fn write_claimed(path: &Path, mut writer: impl Write, content: &[u8]) -> Result<(), AcquisitionError> {
    let written = writer.write_all(content).and_then(|_| writer.flush());
    drop(writer);

    if let Err(e) = written {
        if let Err(cleanup) = fs_err::remove_file(path) {
            tracing::warn!("Failed to remove partial file: {}", cleanup);
        }
        return Err(AcquisitionError::persistence(path, e));
    }
    Ok(())
}

/// Print a metadata record to the console
pub fn print_metadata(record: &MetadataRecord) {
    println!("Title: {}", record.display_title());
    if let Some(uploader) = record.uploader.as_ref().or(record.channel.as_ref()) {
        println!("Uploader: {}", uploader);
    }
    if let Some(duration) = record.duration {
        println!("Duration: {}", format_duration(duration));
    }
    if let Some(date) = record.upload_date.as_deref() {
        println!("Uploaded: {}", format_upload_date(date));
    }
    if let Some(views) = record.view_count {
        println!("Views: {}", views);
    }
    if let Some(likes) = record.like_count {
        println!("Likes: {}", likes);
    }
    if let Some(tags) = record.tags.as_ref().filter(|tags| !tags.is_empty()) {
        println!("Tags: {}", tags.join(", "));
    }
}

/// `YYYYMMDD` as `YYYY-MM-DD`; anything else is returned unchanged
pub fn format_upload_date(raw: &str) -> String {
    chrono::NaiveDate::parse_from_str(raw, "%Y%m%d")
        .map(|date| date.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|_| raw.to_string())
}
