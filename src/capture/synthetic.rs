//! Deterministic sources: a moving test pattern and a sine tone
//!
//! Both pace themselves against the wall clock from their own thread. The
//! content of unit `n` depends only on `n`, so a run is reproducible.

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{CaptureSource, Emitter};
use crate::error::SourceError;
use crate::media::{
    AudioFormat, PixelLayout, RawAudioBuffer, RawVideoFrame, SampleFormat, VideoGeometry,
};

const CURSOR_SIZE: u32 = 16;
const TONE_HZ: f32 = 440.0;
const TONE_AMPLITUDE: f32 = 0.25;
/// Tone buffers cover 10 ms
const BUFFERS_PER_SECOND: u32 = 100;

/// Producer thread shared by both sources
#[derive(Default)]
struct Producer {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Producer {
    fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Call `produce(n, elapsed)` once per `period`, catching up without
    /// sleeping when behind
    fn spawn<F>(&mut self, name: &str, period: Duration, mut produce: F) -> Result<(), SourceError>
    where
        F: FnMut(u64, Duration) + Send + 'static,
    {
        if self.is_running() {
            return Err(SourceError::AlreadyRunning(name.to_string()));
        }
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = std::thread::Builder::new()
            .name(format!("castrec-{}", name))
            .spawn(move || {
                let start = Instant::now();
                let mut n = 0u64;
                while flag.load(Ordering::SeqCst) {
                    let due = period.saturating_mul(n as u32);
                    let elapsed = start.elapsed();
                    if elapsed < due {
                        std::thread::sleep((due - elapsed).min(Duration::from_millis(5)));
                        continue;
                    }
                    produce(n, elapsed);
                    n += 1;
                }
                debug!(units = n, "Producer thread exiting");
            })
            .map_err(|e| SourceError::Start {
                source_name: name.to_string(),
                reason: e.to_string(),
            })?;
        self.running = running;
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Capture thread panicked");
            }
        }
    }
}

/// Moving colour bars with an optional cursor square
pub struct TestPatternSource {
    width: u32,
    height: u32,
    frame_rate: u32,
    draw_cursor: bool,
    negotiated: Option<VideoGeometry>,
    producer: Producer,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, frame_rate: u32, draw_cursor: bool) -> Self {
        Self {
            width,
            height,
            frame_rate,
            draw_cursor,
            negotiated: None,
            producer: Producer::default(),
        }
    }

    /// BGRA pixels of frame `index`
    pub fn render(width: u32, height: u32, index: u64, draw_cursor: bool) -> Vec<u8> {
        let (w, h) = (width as usize, height as usize);
        let mut data = vec![0u8; w * h * 4];
        let shift = (index as usize * 4) % w.max(1);
        for y in 0..h {
            for x in 0..w {
                let band = ((x + shift) * 8 / w.max(1)) as u8;
                let px = (y * w + x) * 4;
                data[px] = if band & 1 != 0 { 0xff } else { 0x10 };
                data[px + 1] = if band & 2 != 0 { 0xff } else { 0x10 };
                data[px + 2] = if band & 4 != 0 { 0xff } else { 0x10 };
                data[px + 3] = 0xff;
            }
        }

        if draw_cursor && width >= CURSOR_SIZE && height >= CURSOR_SIZE {
            let cx = (index as usize * 3) % (w - CURSOR_SIZE as usize + 1);
            let cy = (index as usize * 2) % (h - CURSOR_SIZE as usize + 1);
            for y in cy..cy + CURSOR_SIZE as usize {
                for x in cx..cx + CURSOR_SIZE as usize {
                    let px = (y * w + x) * 4;
                    data[px..px + 4].copy_from_slice(&[0xff, 0xff, 0xff, 0xff]);
                }
            }
        }
        data
    }
}

impl CaptureSource for TestPatternSource {
    type Unit = RawVideoFrame;
    type Format = VideoGeometry;

    fn name(&self) -> &str {
        "test-pattern"
    }

    fn negotiate(&mut self) -> Result<VideoGeometry, SourceError> {
        if self.width == 0 || self.height == 0 || self.frame_rate == 0 {
            return Err(SourceError::Negotiation {
                source_name: self.name().to_string(),
                reason: format!(
                    "cannot produce {}x{} at {} fps",
                    self.width, self.height, self.frame_rate
                ),
            });
        }
        let geometry = VideoGeometry {
            width: self.width,
            height: self.height,
            frame_rate: self.frame_rate,
            layout: PixelLayout::Bgra32,
        };
        self.negotiated = Some(geometry);
        Ok(geometry)
    }

    fn start(&mut self, emitter: Emitter<RawVideoFrame>) -> Result<(), SourceError> {
        let geometry = self.negotiated.ok_or_else(|| SourceError::Start {
            source_name: self.name().to_string(),
            reason: "format was not negotiated".to_string(),
        })?;
        let draw_cursor = self.draw_cursor;
        let period = Duration::from_secs(1) / geometry.frame_rate;
        self.producer.spawn("video", period, move |n, elapsed| {
            let data = Self::render(geometry.width, geometry.height, n, draw_cursor);
            emitter.emit(RawVideoFrame::packed(
                data,
                geometry.width,
                geometry.height,
                PixelLayout::Bgra32,
                elapsed,
            ));
        })
    }

    fn stop(&mut self) {
        self.producer.stop();
    }
}

impl Drop for TestPatternSource {
    fn drop(&mut self) {
        self.producer.stop();
    }
}

/// Continuous 440 Hz sine in 10 ms S16 buffers
pub struct ToneSource {
    sample_rate: u32,
    channels: u16,
    negotiated: Option<AudioFormat>,
    producer: Producer,
}

impl ToneSource {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            negotiated: None,
            producer: Producer::default(),
        }
    }

    /// Interleaved S16LE bytes for `frames` samples per channel starting at
    /// absolute sample `first`
    pub fn render(sample_rate: u32, channels: u16, first: u64, frames: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(frames * channels as usize * 2);
        for i in 0..frames as u64 {
            let t = ((first + i) % sample_rate as u64) as f32 / sample_rate as f32;
            let value = (TAU * TONE_HZ * t).sin() * TONE_AMPLITUDE;
            let sample = (value * i16::MAX as f32) as i16;
            for _ in 0..channels {
                data.extend_from_slice(&sample.to_le_bytes());
            }
        }
        data
    }
}

impl CaptureSource for ToneSource {
    type Unit = RawAudioBuffer;
    type Format = AudioFormat;

    fn name(&self) -> &str {
        "tone"
    }

    fn negotiate(&mut self) -> Result<AudioFormat, SourceError> {
        if self.sample_rate % BUFFERS_PER_SECOND != 0 || self.channels == 0 {
            return Err(SourceError::Negotiation {
                source_name: self.name().to_string(),
                reason: format!(
                    "cannot produce {} Hz with {} channels",
                    self.sample_rate, self.channels
                ),
            });
        }
        let format = AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            sample_format: SampleFormat::S16Le,
        };
        self.negotiated = Some(format);
        Ok(format)
    }

    fn start(&mut self, emitter: Emitter<RawAudioBuffer>) -> Result<(), SourceError> {
        let format = self.negotiated.ok_or_else(|| SourceError::Start {
            source_name: self.name().to_string(),
            reason: "format was not negotiated".to_string(),
        })?;
        let frames = (format.sample_rate / BUFFERS_PER_SECOND) as usize;
        let period = Duration::from_secs(1) / BUFFERS_PER_SECOND;
        self.producer.spawn("audio", period, move |n, elapsed| {
            emitter.emit(RawAudioBuffer {
                data: Self::render(format.sample_rate, format.channels, n * frames as u64, frames),
                sample_rate: format.sample_rate,
                channels: format.channels,
                sample_format: format.sample_format,
                captured_at: elapsed,
            });
        })
    }

    fn stop(&mut self) {
        self.producer.stop();
    }
}

impl Drop for ToneSource {
    fn drop(&mut self) {
        self.producer.stop();
    }
}
