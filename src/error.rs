//! Error taxonomy for capture sessions
//!
//! Setup-phase errors (`ConfigError`, `SourceError`, `EncoderInitError`,
//! `ContainerInitError`) abort a session before it reaches `Capturing`.
//! `UnitProcessingError` is per frame or per audio block and only ever shows
//! up in statistics. `FinalizeError` is reported after the engine is back to
//! `Idle`.

use std::path::PathBuf;
use thiserror::Error;

use crate::media::{SampleFormat, Track};

/// Invalid settings, caught before any resource is allocated
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Frame rate must be between 1 and {max}, got {value}")]
    InvalidFrameRate { value: u32, max: u32 },

    #[error("Resolution must be non-zero and even, got {width}x{height}")]
    InvalidResolution { width: u32, height: u32 },

    #[error("{track} bitrate must be positive")]
    InvalidBitrate { track: Track },

    #[error("Unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    #[error("Channel count must be 1 or 2, got {0}")]
    InvalidChannels(u16),

    #[error("High-efficiency bitrate ratio must be in (0, 1], got {0}")]
    InvalidEfficiencyRatio(f64),

    #[error("Unknown codec: {0}")]
    UnknownCodec(String),

    #[error("Unknown quality tier: {0}")]
    UnknownQuality(String),

    #[error("Invalid output filename format: {0:?}")]
    InvalidFilenameFormat(String),

    #[error("Output path is empty")]
    EmptyOutputPath,

    #[error("Queue capacity for {track} must be positive")]
    InvalidQueueCapacity { track: Track },
}

/// Capture source negotiation or start failure
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Source '{source_name}' failed to negotiate: {reason}")]
    Negotiation { source_name: String, reason: String },

    #[error("Source '{source_name}' failed to start: {reason}")]
    Start { source_name: String, reason: String },

    #[error("Source '{0}' is already running")]
    AlreadyRunning(String),
}

/// Codec could not be opened or was given invalid parameters
#[derive(Debug, Error)]
pub enum EncoderInitError {
    #[error("Encoder session is already initialized")]
    AlreadyInitialized,

    #[error("Codec unavailable: {0}")]
    CodecUnavailable(String),

    #[error("Invalid encoder parameters: {0}")]
    InvalidParameters(String),

    #[error("Codec backend error: {0}")]
    Backend(String),
}

/// Output container could not be created
#[derive(Debug, Error)]
pub enum ContainerInitError {
    #[error("Failed to open output {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid {track} track parameters: {reason}")]
    InvalidTrack { track: Track, reason: String },
}

/// Failure to encode or write a single unit. Recovered locally.
#[derive(Debug, Error)]
pub enum UnitProcessingError {
    #[error("Empty {0} buffer")]
    EmptyBuffer(Track),

    #[error("Malformed {track} buffer: {reason}")]
    MalformedBuffer { track: Track, reason: String },

    #[error("Frame is {got_width}x{got_height}, encoder expects {width}x{height}")]
    DimensionMismatch {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },

    #[error("Audio is {got_rate} Hz/{got_channels} ch, encoder expects {rate} Hz/{channels} ch")]
    FormatMismatch {
        rate: u32,
        channels: u16,
        got_rate: u32,
        got_channels: u16,
    },

    #[error("Unsupported sample format {0:?}")]
    UnsupportedSampleFormat(SampleFormat),

    #[error("{track} codec rejected unit: {reason}")]
    Encode { track: Track, reason: String },

    #[error("{0} track is not configured")]
    TrackNotConfigured(Track),

    #[error("{track} timestamp {ticks} does not follow previous {previous}")]
    NonMonotonicTimestamp { track: Track, ticks: i64, previous: i64 },

    #[error("{0} access unit is larger than 4 GiB")]
    UnitTooLarge(Track),

    #[error("I/O error while writing {track} unit: {source}")]
    Io {
        track: Track,
        #[source]
        source: std::io::Error,
    },

    #[error("Output stream is unusable after an earlier I/O failure")]
    StreamBroken,

    #[error("Already finalized")]
    Finalized,

    #[error("Encoder session is not initialized")]
    NotInitialized,
}

/// Flush or trailer-write failure
#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("Already finalized")]
    AlreadyFinalized,

    #[error("Encoder session is not initialized")]
    NotInitialized,

    #[error("Failed to flush {track} codec: {reason}")]
    Flush { track: Track, reason: String },

    #[error("Failed to write container trailer: {0}")]
    Io(#[from] std::io::Error),

    #[error("Output stream is unusable after an earlier I/O failure")]
    StreamBroken,
}

/// Errors surfaced by the capture engine to its caller
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    EncoderInit(#[from] EncoderInitError),

    #[error(transparent)]
    ContainerInit(#[from] ContainerInitError),

    #[error(transparent)]
    Finalize(#[from] FinalizeError),

    #[error("Cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: crate::pipeline::EngineState,
    },

    #[error("Mux worker did not exit within {0:?}")]
    WorkerTimeout(std::time::Duration),

    #[error("Mux worker panicked")]
    WorkerPanicked,

    #[error("Failed to spawn mux worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}
