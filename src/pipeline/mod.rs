//! Capture pipeline - sources feed bounded queues, one worker encodes and muxes

mod engine;
mod stats;
mod worker;

pub use engine::{create_engine_channels, CaptureEngine, SourceFactory, StopReport};
pub use stats::{average_fps, DropRateMonitor, Statistics, StatsSnapshot};

use std::fmt;
use std::path::PathBuf;

/// Lifecycle of the capture engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    /// Negotiating sources and opening the encoder and container
    Initializing,
    Capturing,
    /// Sources keep running; their units are discarded
    Paused,
    /// Draining queues and finalizing the file
    Stopping,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Initializing => "initializing",
            EngineState::Capturing => "capturing",
            EngineState::Paused => "paused",
            EngineState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Commands that can be sent to a supervised engine
#[derive(Debug, Clone)]
pub enum EngineCommand {
    /// Discard incoming units until resumed
    Pause,
    Resume,
    /// Finish the file and return
    Stop,
    /// Process is exiting; same as stop
    Shutdown,
}

/// Status updates from the engine
#[derive(Debug, Clone)]
pub enum EngineStatus {
    /// The engine entered a new state
    State(EngineState),
    /// Periodic statistics while capturing
    Progress(StatsSnapshot),
    /// A session finished and its file was finalized
    Finished {
        path: PathBuf,
        stats: StatsSnapshot,
    },
    /// An error occurred
    Error(String),
}
