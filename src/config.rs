//! Configuration management for castrec
//!
//! The config file feeds defaults; command-line flags override them; the merge
//! produces one validated [`CaptureSettings`] per session.

use anyhow::{Context, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::media::Track;

/// Highest frame rate accepted for a session
pub const MAX_FRAME_RATE: u32 = 240;

/// Sample rates with an AAC sampling frequency index
pub const SUPPORTED_SAMPLE_RATES: [u32; 12] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000,
];

/// Video codec selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VideoCodecKind {
    /// H.264 / AVC, widest compatibility
    #[default]
    H264,
    /// H.265 / HEVC, smaller files at the same perceived quality
    H265,
}

impl VideoCodecKind {
    pub fn is_high_efficiency(self) -> bool {
        matches!(self, VideoCodecKind::H265)
    }
}

impl FromStr for VideoCodecKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "h.264" | "avc" | "x264" => Ok(VideoCodecKind::H264),
            "h265" | "h.265" | "hevc" | "x265" => Ok(VideoCodecKind::H265),
            _ => Err(ConfigError::UnknownCodec(s.to_string())),
        }
    }
}

impl TryFrom<String> for VideoCodecKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VideoCodecKind> for String {
    fn from(value: VideoCodecKind) -> Self {
        value.to_string()
    }
}

impl fmt::Display for VideoCodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoCodecKind::H264 => write!(f, "h264"),
            VideoCodecKind::H265 => write!(f, "h265"),
        }
    }
}

/// Quality tier, mapped to a constant rate factor by the encoder
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    #[default]
    High,
    Ultra,
}

impl FromStr for Quality {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Quality::Low),
            "medium" => Ok(Quality::Medium),
            "high" => Ok(Quality::High),
            "ultra" => Ok(Quality::Ultra),
            _ => Err(ConfigError::UnknownQuality(s.to_string())),
        }
    }
}

/// Immutable per-session capture settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Target video bitrate in bits per second before the efficiency ratio
    pub video_bitrate: u32,
    /// Audio bitrate in bits per second
    pub audio_bitrate: u32,
    pub codec: VideoCodecKind,
    pub quality: Quality,
    /// Fraction of `video_bitrate` targeted by the high-efficiency codec
    pub efficiency_ratio: f64,
    pub capture_audio: bool,
    pub sample_rate: u32,
    pub channels: u16,
    pub capture_cursor: bool,
    pub output_path: PathBuf,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            frame_rate: 30,
            video_bitrate: 5_000_000,
            audio_bitrate: 128_000,
            codec: VideoCodecKind::H264,
            quality: Quality::High,
            efficiency_ratio: 0.7,
            capture_audio: true,
            sample_rate: 48000,
            channels: 2,
            capture_cursor: true,
            output_path: PathBuf::from("capture.mp4"),
        }
    }
}

impl CaptureSettings {
    /// Check every field before any resource is allocated
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_rate == 0 || self.frame_rate > MAX_FRAME_RATE {
            return Err(ConfigError::InvalidFrameRate {
                value: self.frame_rate,
                max: MAX_FRAME_RATE,
            });
        }
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(ConfigError::InvalidResolution {
                width: self.width,
                height: self.height,
            });
        }
        if self.video_bitrate == 0 {
            return Err(ConfigError::InvalidBitrate { track: Track::Video });
        }
        if !(self.efficiency_ratio > 0.0 && self.efficiency_ratio <= 1.0) {
            return Err(ConfigError::InvalidEfficiencyRatio(self.efficiency_ratio));
        }
        if self.capture_audio {
            if self.audio_bitrate == 0 {
                return Err(ConfigError::InvalidBitrate { track: Track::Audio });
            }
            if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
                return Err(ConfigError::UnsupportedSampleRate(self.sample_rate));
            }
            if !(1..=2).contains(&self.channels) {
                return Err(ConfigError::InvalidChannels(self.channels));
            }
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyOutputPath);
        }
        Ok(())
    }

    /// Video bitrate the codec actually targets
    pub fn effective_video_bitrate(&self) -> u32 {
        if self.codec.is_high_efficiency() {
            (self.video_bitrate as f64 * self.efficiency_ratio).round() as u32
        } else {
            self.video_bitrate
        }
    }
}

/// Tunables of the capture pipeline itself
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub video_queue_capacity: usize,
    pub audio_queue_capacity: usize,
    /// Bounded wait for the mux worker at stop
    pub join_timeout: Duration,
    /// Periodic keyframe fallback for units without a codec flag; 0 = two seconds of frames
    pub keyframe_fallback_interval: u32,
    /// Progress log cadence while capturing
    pub stats_interval: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            video_queue_capacity: 8,
            audio_queue_capacity: 64,
            join_timeout: Duration::from_secs(5),
            keyframe_fallback_interval: 0,
            stats_interval: Duration::from_secs(1),
        }
    }
}

impl PipelineOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.video_queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity { track: Track::Video });
        }
        if self.audio_queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity { track: Track::Audio });
        }
        Ok(())
    }

    pub fn keyframe_interval_for(&self, frame_rate: u32) -> u32 {
        if self.keyframe_fallback_interval > 0 {
            self.keyframe_fallback_interval
        } else {
            (frame_rate * 2).max(1)
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub encoder: EncoderConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub capture_cursor: bool,
    pub capture_audio: bool,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub codec: VideoCodecKind,
    pub quality: Quality,
    /// Bits per second
    pub video_bitrate: u32,
    /// Bits per second
    pub audio_bitrate: u32,
    pub efficiency_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory for generated file names
    pub directory: PathBuf,
    /// chrono format string, without extension
    pub filename_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub video_queue_capacity: usize,
    pub audio_queue_capacity: usize,
    pub join_timeout_ms: u64,
    pub keyframe_fallback_interval: u32,
    pub stats_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let s = CaptureSettings::default();
        Self {
            width: s.width,
            height: s.height,
            frame_rate: s.frame_rate,
            capture_cursor: s.capture_cursor,
            capture_audio: s.capture_audio,
            sample_rate: s.sample_rate,
            channels: s.channels,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        let s = CaptureSettings::default();
        Self {
            codec: s.codec,
            quality: s.quality,
            video_bitrate: s.video_bitrate,
            audio_bitrate: s.audio_bitrate,
            efficiency_ratio: s.efficiency_ratio,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            filename_format: "castrec_%Y%m%d_%H%M%S".to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let p = PipelineOptions::default();
        Self {
            video_queue_capacity: p.video_queue_capacity,
            audio_queue_capacity: p.audio_queue_capacity,
            join_timeout_ms: p.join_timeout.as_millis() as u64,
            keyframe_fallback_interval: p.keyframe_fallback_interval,
            stats_interval_ms: p.stats_interval.as_millis() as u64,
        }
    }
}

/// Command-line values that take precedence over the config file
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub frame_rate: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub output: Option<PathBuf>,
    pub codec: Option<VideoCodecKind>,
    pub quality: Option<Quality>,
    pub no_audio: bool,
    pub no_cursor: bool,
}

impl Config {
    /// Load from `path`, or from the default location, creating a default
    /// file there on first run
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from(path);
        }

        let config_path = Self::default_config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let mut config = Config::default();
            config.config_path = Some(config_path);
            config.save()?;
            Ok(config)
        }
    }

    fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "castrec", "castrec")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Output file name generated from `output.filename_format`
    pub fn generated_output_path<Tz: TimeZone>(
        &self,
        now: &DateTime<Tz>,
    ) -> Result<PathBuf, ConfigError>
    where
        Tz::Offset: fmt::Display,
    {
        let items: Vec<Item<'_>> = StrftimeItems::new(&self.output.filename_format).collect();
        if items.iter().any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::InvalidFilenameFormat(
                self.output.filename_format.clone(),
            ));
        }
        let stem = now.format_with_items(items.iter()).to_string();
        Ok(self.output.directory.join(format!("{}.mp4", stem)))
    }

    /// Merge file values with command-line overrides
    pub fn capture_settings<Tz: TimeZone>(
        &self,
        overrides: &SettingsOverrides,
        now: &DateTime<Tz>,
    ) -> Result<CaptureSettings, ConfigError>
    where
        Tz::Offset: fmt::Display,
    {
        let output_path = match &overrides.output {
            Some(path) => path.clone(),
            None => self.generated_output_path(now)?,
        };
        Ok(CaptureSettings {
            width: overrides.width.unwrap_or(self.capture.width),
            height: overrides.height.unwrap_or(self.capture.height),
            frame_rate: overrides.frame_rate.unwrap_or(self.capture.frame_rate),
            video_bitrate: self.encoder.video_bitrate,
            audio_bitrate: self.encoder.audio_bitrate,
            codec: overrides.codec.unwrap_or(self.encoder.codec),
            quality: overrides.quality.unwrap_or(self.encoder.quality),
            efficiency_ratio: self.encoder.efficiency_ratio,
            capture_audio: self.capture.capture_audio && !overrides.no_audio,
            sample_rate: self.capture.sample_rate,
            channels: self.capture.channels,
            capture_cursor: self.capture.capture_cursor && !overrides.no_cursor,
            output_path,
        })
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            video_queue_capacity: self.pipeline.video_queue_capacity,
            audio_queue_capacity: self.pipeline.audio_queue_capacity,
            join_timeout: Duration::from_millis(self.pipeline.join_timeout_ms),
            keyframe_fallback_interval: self.pipeline.keyframe_fallback_interval,
            stats_interval: Duration::from_millis(self.pipeline.stats_interval_ms.max(1)),
        }
    }
}
