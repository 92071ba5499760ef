use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::extractors::AudioTranscode;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Extraction engine settings
    pub engine: EngineConfig,

    /// Audio transcoding settings
    pub audio: AudioConfig,

    /// Caption selection settings
    pub captions: CaptionConfig,

    /// Application settings
    pub app: AppConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// yt-dlp executable, looked up in PATH unless absolute
    pub yt_dlp_path: String,

    /// Only ever fetch the single video, never a playlist around it
    pub no_playlist: bool,

    /// JavaScript runtime handed to yt-dlp, e.g. `node:/usr/local/bin/node`
    pub js_runtime: Option<String>,

    /// Extra raw arguments appended to every invocation
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Target codec and container
    pub codec: String,

    /// Constant bitrate in kbps
    pub quality_kbps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionConfig {
    /// Track picked first when the video advertises it
    pub preferred_language: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory used when no output directory is given
    pub save_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            yt_dlp_path: "yt-dlp".to_string(),
            no_playlist: true,
            js_runtime: None,
            extra_args: Vec::new(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        let transcode = AudioTranscode::default();
        Self {
            codec: transcode.codec,
            quality_kbps: transcode.quality_kbps,
        }
    }
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            preferred_language: "en".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file or create default
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content = fs_err::read_to_string(&config_path)
                .context("Failed to read config file")?;

            let config = Self::from_yaml(&content)?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save().await?;
            Ok(config)
        }
    }

    /// Parse and validate configuration from YAML
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self)
            .context("Failed to serialize config")?;

        fs_err::write(&config_path, content)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Get configuration file path
    pub fn config_path() -> Result<PathBuf> {
        // First try current directory for easy testing
        let local_config = PathBuf::from("config.yaml");
        if local_config.exists() {
            return Ok(local_config);
        }

        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?;

        Ok(config_dir.join("mediagrab").join("config.yaml"))
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.engine.yt_dlp_path.trim().is_empty() {
            anyhow::bail!("engine.yt_dlp_path must not be empty");
        }

        if self.audio.codec.trim().is_empty() {
            anyhow::bail!("audio.codec must not be empty");
        }

        if !(8..=512).contains(&self.audio.quality_kbps) {
            anyhow::bail!(
                "audio.quality_kbps must be between 8 and 512, got {}",
                self.audio.quality_kbps
            );
        }

        if self.captions.preferred_language.trim().is_empty() {
            anyhow::bail!("captions.preferred_language must not be empty");
        }

        Ok(())
    }

    /// Transcode settings for the audio acquirer
    pub fn transcode(&self) -> AudioTranscode {
        AudioTranscode {
            codec: self.audio.codec.clone(),
            quality_kbps: self.audio.quality_kbps,
        }
    }

    /// Display current configuration
    pub fn display(&self) {
        println!("Current Configuration:");
        println!("  yt-dlp: {}", self.engine.yt_dlp_path);
        println!("  No Playlist: {}", self.engine.no_playlist);
        if let Some(runtime) = &self.engine.js_runtime {
            println!("  JS Runtime: {}", runtime);
        }
        if !self.engine.extra_args.is_empty() {
            println!("  Extra Args: {}", self.engine.extra_args.join(" "));
        }
        println!("  Audio: {} @ {} kbps", self.audio.codec, self.audio.quality_kbps);
        println!("  Caption Language: {}", self.captions.preferred_language);
        match &self.app.save_dir {
            Some(dir) => println!("  Save Directory: {}", dir.display()),
            None => println!("  Save Directory: (current directory)"),
        }
    }
}
