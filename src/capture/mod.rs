//! Capture sources
//!
//! A source negotiates its output format first and only then starts producing
//! units from its own thread, handing each one to the registered [`Emitter`].
//! The pipeline never depends on which source variant is active.

mod synthetic;

pub use synthetic::{TestPatternSource, ToneSource};

use std::fmt;
use std::sync::Arc;

use crate::config::CaptureSettings;
use crate::error::SourceError;
use crate::media::{AudioFormat, RawAudioBuffer, RawVideoFrame, VideoGeometry};

/// Callback a running source pushes units into
pub struct Emitter<T> {
    callback: Arc<dyn Fn(T) + Send + Sync>,
}

impl<T> Emitter<T> {
    pub fn new(callback: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }

    pub fn emit(&self, unit: T) {
        (self.callback)(unit)
    }
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            callback: self.callback.clone(),
        }
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter").finish_non_exhaustive()
    }
}

/// A producer of raw media units
pub trait CaptureSource: Send {
    type Unit: Send + 'static;
    type Format: Clone + fmt::Debug + Send;

    fn name(&self) -> &str;

    /// Settle the output format. Must succeed before `start`.
    fn negotiate(&mut self) -> Result<Self::Format, SourceError>;

    /// Begin producing units on the source's own thread
    fn start(&mut self, emitter: Emitter<Self::Unit>) -> Result<(), SourceError>;

    /// Stop producing and wait for the producer thread. Idempotent.
    fn stop(&mut self);
}

pub type VideoSource = Box<dyn CaptureSource<Unit = RawVideoFrame, Format = VideoGeometry>>;
pub type AudioSource = Box<dyn CaptureSource<Unit = RawAudioBuffer, Format = AudioFormat>>;

/// Build the sources for a session. Audio is `None` when disabled.
pub fn create_capture_sources(settings: &CaptureSettings) -> (VideoSource, Option<AudioSource>) {
    let video: VideoSource = Box::new(TestPatternSource::new(
        settings.width,
        settings.height,
        settings.frame_rate,
        settings.capture_cursor,
    ));
    let audio = settings.capture_audio.then(|| {
        Box::new(ToneSource::new(settings.sample_rate, settings.channels)) as AudioSource
    });
    (video, audio)
}
