use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "mediagrab",
    about = "Grab metadata, transcripts, and tagged audio from YouTube videos",
    version,
    long_about = "Validates a YouTube URL, probes it once with yt-dlp, and saves the requested artifacts (metadata JSON, transcript text, tagged audio) into a directory without ever overwriting existing files."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable progress indicators
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Arguments shared by every acquisition command
#[derive(Args, Debug, Clone)]
pub struct Target {
    /// Video URL (youtube.com or youtu.be)
    #[arg(value_name = "URL")]
    pub url: String,

    /// Directory to save into (defaults to app.save_dir, then the current directory)
    #[arg(short, long, value_name = "DIR", env = "MEDIAGRAB_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Save the video's metadata as JSON
    Metadata(Target),

    /// Save the video's transcript as plain text
    Transcript(Target),

    /// Download best audio, transcode it, and tag it with artist and title
    Audio(Target),

    /// Metadata, transcript, and audio from a single probe
    All(Target),

    /// Show or initialize the configuration file
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
    },

    /// List supported platforms
    Platforms,
}
