//! castrec
//!
//! Records the screen (and optionally system audio) into a single MP4 file:
//! capture sources feed bounded queues, a mux worker encodes and writes the
//! container, and Ctrl+C or `--duration` ends the session cleanly.

mod capture;
mod config;
mod encoder;
mod error;
mod logging;
mod media;
mod mux;
mod pipeline;
mod threads;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use config::{Config, Quality, SettingsOverrides, VideoCodecKind};
use pipeline::{create_engine_channels, CaptureEngine, EngineCommand, StatsSnapshot, StopReport};

#[cfg(feature = "ffmpeg")]
const ABOUT: &str = "Screen and audio capture to MP4";

#[cfg(not(feature = "ffmpeg"))]
const ABOUT: &str = "Screen and audio capture to MP4\n\n\
    NOTE: this build has no codec backend and cannot record. \
    Rebuild with `cargo build --features ffmpeg` (needs the FFmpeg development libraries).";

#[derive(Debug, Parser)]
#[command(name = "castrec", version, about = ABOUT)]
struct Cli {
    /// Capture frame rate (defaults to the config file value)
    #[arg(long)]
    fps: Option<u32>,

    /// Output file; generated from the config's filename format when absent
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Video codec: h264 or h265
    #[arg(long)]
    codec: Option<VideoCodecKind>,

    /// Encoder quality tier
    #[arg(long, value_enum)]
    quality: Option<Quality>,

    /// Record video only
    #[arg(long)]
    no_audio: bool,

    /// Leave the cursor out of captured frames
    #[arg(long)]
    no_cursor: bool,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Stop automatically after this many seconds
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,

    /// Config file to use instead of the default location
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write the final statistics as JSON
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Debug logging on the console
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            frame_rate: self.fps,
            width: self.width,
            height: self.height,
            output: self.output.clone(),
            codec: self.codec,
            quality: self.quality,
            no_audio: self.no_audio,
            no_cursor: self.no_cursor,
        }
    }
}

/// JSON written by `--report`
#[derive(Debug, Serialize)]
struct SessionReport<'a> {
    session_id: Uuid,
    path: &'a Path,
    video_samples: usize,
    audio_samples: usize,
    #[serde(flatten)]
    stats: &'a StatsSnapshot,
}

impl<'a> From<&'a StopReport> for SessionReport<'a> {
    fn from(report: &'a StopReport) -> Self {
        Self {
            session_id: report.session_id,
            path: &report.path,
            video_samples: report.summary.video_samples,
            audio_samples: report.summary.audio_samples,
            stats: &report.stats,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let _log_guard = match logging::init_logging(cli.verbose) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to initialize file logging: {:#}", e);
            None
        }
    };

    let code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<()> {
    info!("castrec {} starting", env!("CARGO_PKG_VERSION"));

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    info!("Configuration loaded from {:?}", config.config_path()?);

    let settings = config
        .capture_settings(&cli.overrides(), &chrono::Local::now())
        .context("Invalid capture settings")?;
    settings.validate().context("Invalid capture settings")?;
    let options = config.pipeline_options();
    options.validate().context("Invalid pipeline options")?;

    let provider = encoder::default_provider().context(
        "No codec backend available; rebuild with `--features ffmpeg` to enable encoding",
    )?;
    #[cfg(feature = "ffmpeg")]
    {
        let hardware = encoder::ffmpeg::FfmpegProvider::hardware_encoders(settings.codec);
        if hardware.is_empty() {
            info!("No hardware {} encoders found", settings.codec);
        } else {
            info!("Hardware encoders available: {}", hardware.join(", "));
        }
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
    let (cmd_tx, mut cmd_rx, status_tx, _status_rx) = create_engine_channels();

    let mut engine = CaptureEngine::new(settings, options, provider, status_tx);
    engine
        .start_capture()
        .context("Failed to start capture session")?;
    info!(
        "Recording {}x{} @ {} fps to {:?}{}",
        engine.settings().width,
        engine.settings().height,
        engine.settings().frame_rate,
        engine.settings().output_path,
        if engine.settings().capture_audio { "" } else { " (no audio)" }
    );

    let handle = runtime.handle().clone();
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, stopping...");
        let tx = cmd_tx.clone();
        handle.spawn(async move {
            let _ = tx.send(EngineCommand::Shutdown).await;
        });
    })
    .unwrap_or_else(|e| warn!("Failed to set Ctrl+C handler: {}", e));

    let limit = cli.duration.map(Duration::from_secs);
    let report = runtime
        .block_on(engine.supervise(&mut cmd_rx, limit))
        .context("Capture session failed")?;

    print_summary(&report);
    if let Some(path) = &cli.report {
        write_report(path, &report)?;
        info!("Report written to {:?}", path);
    }
    Ok(())
}

fn print_summary(report: &StopReport) {
    let stats = &report.stats;
    println!();
    println!("Recording saved: {}", report.path.display());
    println!("  Frames captured: {}", stats.frames_captured);
    println!("  Frames dropped:  {}", stats.frames_dropped);
    println!("  Average FPS:     {:.1}", stats.average_fps);
    println!(
        "  Audio units:     {} ({} dropped)",
        stats.audio_units_written, stats.audio_units_dropped
    );
    println!("  Duration:        {:.1}s", stats.elapsed_secs);
    println!("  File size:       {:.2} MB", stats.file_size_mb());
}

fn write_report(path: &Path, report: &StopReport) -> Result<()> {
    let json = serde_json::to_string_pretty(&SessionReport::from(report))
        .context("Failed to serialize report")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write report: {:?}", path))
}
