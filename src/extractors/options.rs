use serde::{Deserialize, Serialize};

/// Prefix of the machine-readable progress lines requested from yt-dlp
pub const PROGRESS_MARKER: &str = "mediagrab-progress";

/// Prefix of the line yt-dlp prints with the final file path
pub const FILEPATH_MARKER: &str = "mediagrab-file:";

/// Target codec and quality for the audio post-processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioTranscode {
    pub codec: String,
    /// Constant bitrate in kbps
    pub quality_kbps: u32,
}

impl Default for AudioTranscode {
    fn default() -> Self {
        Self {
            codec: "mp3".to_string(),
            quality_kbps: 192,
        }
    }
}

/// Descriptive tags embedded into the output container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataTags {
    pub artist: Option<String>,
    pub title: Option<String>,
}

impl MetadataTags {
    fn is_empty(&self) -> bool {
        self.artist.is_none() && self.title.is_none()
    }

    /// ffmpeg arguments, shell-quoted the way yt-dlp splits post-processor args
    fn ffmpeg_args(&self) -> String {
        let mut args = Vec::new();
        if let Some(artist) = &self.artist {
            args.push(format!("-metadata artist={}", shell_quote(artist)));
        }
        if let Some(title) = &self.title {
            args.push(format!("-metadata title={}", shell_quote(title)));
        }
        args.join(" ")
    }
}

/// Recognized options for one yt-dlp invocation.
///
/// Start from [`ExtractionOptions::default`] and assign the fields a call needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionOptions {
    pub skip_download: bool,
    pub no_playlist: bool,
    /// Dump the full info dict as a single JSON document
    pub dump_json: bool,
    pub caption_languages: Vec<String>,
    pub caption_format: Option<String>,
    pub output_template: Option<String>,
    pub audio: Option<AudioTranscode>,
    pub metadata_tags: MetadataTags,
    /// Emit one parseable progress line per callback
    pub report_progress: bool,
    /// Print the final file path after all post-processing
    pub print_filepath: bool,
    /// JavaScript runtime handed to the extractor, e.g. `node:/usr/local/bin/node`
    pub js_runtime: Option<String>,
    pub extra_args: Vec<String>,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            skip_download: false,
            no_playlist: true,
            dump_json: false,
            caption_languages: Vec::new(),
            caption_format: None,
            output_template: None,
            audio: None,
            metadata_tags: MetadataTags::default(),
            report_progress: false,
            print_filepath: false,
            js_runtime: None,
            extra_args: Vec::new(),
        }
    }
}

impl ExtractionOptions {
    /// Render the yt-dlp argument vector, without the URL
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();

        if self.no_playlist {
            args.push("--no-playlist".into());
        }
        if self.skip_download {
            args.push("--skip-download".into());
        }
        if self.dump_json {
            args.push("--dump-single-json".into());
        }

        if !self.caption_languages.is_empty() {
            args.push("--write-subs".into());
            args.push("--sub-langs".into());
            args.push(self.caption_languages.join(","));
        }
        if let Some(format) = &self.caption_format {
            args.push("--sub-format".into());
            args.push(format.clone());
        }

        if let Some(audio) = &self.audio {
            args.extend([
                "--format".into(),
                "bestaudio/best".into(),
                "--extract-audio".into(),
                "--audio-format".into(),
                audio.codec.clone(),
                "--audio-quality".into(),
                format!("{}K", audio.quality_kbps),
            ]);
            if !self.metadata_tags.is_empty() {
                args.push("--postprocessor-args".into());
                args.push(format!("ExtractAudio:{}", self.metadata_tags.ffmpeg_args()));
            }
        }

        if let Some(template) = &self.output_template {
            args.push("--output".into());
            args.push(template.clone());
        }

        if self.report_progress {
            args.extend([
                "--newline".into(),
                "--progress".into(),
                "--progress-template".into(),
                format!(
                    "download:{} %(progress.status)s %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s",
                    PROGRESS_MARKER
                ),
            ]);
        }
        if self.print_filepath {
            args.push("--print".into());
            args.push(format!("after_move:{}%(filepath)s", FILEPATH_MARKER));
        }

        if let Some(runtime) = &self.js_runtime {
            args.push("--js-runtimes".into());
            args.push(runtime.clone());
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Quote a value for a POSIX-style shell word
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'\''"#))
}
