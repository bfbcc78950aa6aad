//! Sources driven by the test thread
//!
//! A scripted source hands its emitter to a [`ScriptHandle`] on start; the test
//! pushes units through the handle, playing the role of the capture thread.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::capture::{
    AudioSource, CaptureSource, Emitter, TestPatternSource, ToneSource, VideoSource,
};
use crate::config::CaptureSettings;
use crate::error::SourceError;
use crate::media::{
    AudioFormat, PixelLayout, RawAudioBuffer, RawVideoFrame, SampleFormat, VideoGeometry,
};
use crate::pipeline::SourceFactory;

type Slot<U> = Arc<Mutex<Option<Emitter<U>>>>;

pub struct ScriptedSource<U, F> {
    name: &'static str,
    format: F,
    slot: Slot<U>,
    pub fail_negotiate: bool,
    pub fail_start: bool,
}

impl<U, F: Clone> Clone for ScriptedSource<U, F> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            format: self.format.clone(),
            slot: self.slot.clone(),
            fail_negotiate: self.fail_negotiate,
            fail_start: self.fail_start,
        }
    }
}

pub struct ScriptHandle<U> {
    slot: Slot<U>,
}

impl<U> ScriptHandle<U> {
    /// Push one unit as the capture thread would; false when not started
    pub fn emit(&self, unit: U) -> bool {
        let emitter = self.slot.lock().unwrap().clone();
        match emitter {
            Some(emitter) => {
                emitter.emit(unit);
                true
            }
            None => false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }
}

impl<U, F> ScriptedSource<U, F> {
    pub fn new(name: &'static str, format: F) -> (Self, ScriptHandle<U>) {
        let slot: Slot<U> = Arc::new(Mutex::new(None));
        (
            Self {
                name,
                format,
                slot: slot.clone(),
                fail_negotiate: false,
                fail_start: false,
            },
            ScriptHandle { slot },
        )
    }
}

impl<U, F> CaptureSource for ScriptedSource<U, F>
where
    U: Send + 'static,
    F: Clone + fmt::Debug + Send,
{
    type Unit = U;
    type Format = F;

    fn name(&self) -> &str {
        self.name
    }

    fn negotiate(&mut self) -> Result<F, SourceError> {
        if self.fail_negotiate {
            return Err(SourceError::Negotiation {
                source_name: self.name.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(self.format.clone())
    }

    fn start(&mut self, emitter: Emitter<U>) -> Result<(), SourceError> {
        if self.fail_start {
            return Err(SourceError::Start {
                source_name: self.name.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        *self.slot.lock().unwrap() = Some(emitter);
        Ok(())
    }

    fn stop(&mut self) {
        self.slot.lock().unwrap().take();
    }
}

pub type ScriptedVideo = ScriptedSource<RawVideoFrame, VideoGeometry>;
pub type ScriptedAudio = ScriptedSource<RawAudioBuffer, AudioFormat>;

pub fn geometry(width: u32, height: u32, frame_rate: u32) -> VideoGeometry {
    VideoGeometry {
        width,
        height,
        frame_rate,
        layout: PixelLayout::Bgra32,
    }
}

pub fn stereo_48k() -> AudioFormat {
    AudioFormat {
        sample_rate: 48000,
        channels: 2,
        sample_format: SampleFormat::S16Le,
    }
}

/// Test-pattern frame `index`
pub fn video_frame(geometry: VideoGeometry, index: u64) -> RawVideoFrame {
    RawVideoFrame::packed(
        TestPatternSource::render(geometry.width, geometry.height, index, true),
        geometry.width,
        geometry.height,
        PixelLayout::Bgra32,
        std::time::Duration::ZERO,
    )
}

/// Tone buffer of `frames` samples per channel starting at sample `first`
pub fn tone_buffer(format: AudioFormat, first: u64, frames: usize) -> RawAudioBuffer {
    RawAudioBuffer {
        data: ToneSource::render(format.sample_rate, format.channels, first, frames),
        sample_rate: format.sample_rate,
        channels: format.channels,
        sample_format: SampleFormat::S16Le,
        captured_at: std::time::Duration::ZERO,
    }
}

/// Factory handing out clones of the scripted sources on every start
pub fn scripted_factory(video: ScriptedVideo, audio: Option<ScriptedAudio>) -> SourceFactory {
    Box::new(move |_settings: &CaptureSettings| {
        let video: VideoSource = Box::new(video.clone());
        let audio = audio.clone().map(|a| Box::new(a) as AudioSource);
        (video, audio)
    })
}
