//! Media data model shared by sources, encoder and muxer

mod convert;
mod time;

pub use convert::{convert_to_i420, deinterleave_to_planar, I420Frame};
pub use time::{Rational, Timestamp};

use std::fmt;
use std::time::Duration;

/// Track identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Track {
    Video,
    Audio,
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Track::Video => write!(f, "video"),
            Track::Audio => write!(f, "audio"),
        }
    }
}

/// Pixel layout of a raw video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Rgb24,
    Rgba32,
    Bgr24,
    Bgra32,
    /// Planar Y, U, V with 2x2 chroma subsampling
    Yuv420p,
}

impl PixelLayout {
    /// Bytes per pixel for packed layouts, `None` for planar ones
    pub fn packed_bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelLayout::Rgb24 | PixelLayout::Bgr24 => Some(3),
            PixelLayout::Rgba32 | PixelLayout::Bgra32 => Some(4),
            PixelLayout::Yuv420p => None,
        }
    }

    /// Tightly packed row stride of the first plane
    pub fn default_stride(self, width: u32) -> usize {
        self.packed_bytes_per_pixel().unwrap_or(1) * width as usize
    }
}

/// PCM sample encoding of a raw audio buffer (all little endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    S16Le,
    S24Le,
    S32Le,
    F32Le,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S16Le => 2,
            SampleFormat::S24Le => 3,
            SampleFormat::S32Le | SampleFormat::F32Le => 4,
        }
    }
}

/// Negotiated video geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoGeometry {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub layout: PixelLayout,
}

/// Negotiated audio format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

/// One raw frame from a video source
#[derive(Debug, Clone)]
pub struct RawVideoFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Row stride in bytes of the first plane
    pub stride: usize,
    pub layout: PixelLayout,
    /// Time since the source started
    pub captured_at: Duration,
}

impl RawVideoFrame {
    /// Frame with tightly packed rows
    pub fn packed(
        data: Vec<u8>,
        width: u32,
        height: u32,
        layout: PixelLayout,
        captured_at: Duration,
    ) -> Self {
        Self {
            data,
            width,
            height,
            stride: layout.default_stride(width),
            layout,
            captured_at,
        }
    }
}

/// One buffer of interleaved PCM from an audio source
#[derive(Debug, Clone)]
pub struct RawAudioBuffer {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    pub captured_at: Duration,
}

impl RawAudioBuffer {
    /// Number of samples per channel, or `None` if the byte length is ragged
    pub fn frames(&self) -> Option<usize> {
        let frame_bytes = self.sample_format.bytes_per_sample() * self.channels as usize;
        if frame_bytes == 0 || self.data.len() % frame_bytes != 0 {
            return None;
        }
        Some(self.data.len() / frame_bytes)
    }
}

/// Compressed output of one codec frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAccessUnit {
    pub track: Track,
    /// Video: frame index. Audio: cumulative sample count at the start of the unit.
    pub counter: u64,
    /// Keyframe flag as reported by the codec, if it reports one
    pub keyframe: Option<bool>,
    pub data: Vec<u8>,
}

impl EncodedAccessUnit {
    /// Container timestamp derived from the presentation counter
    pub fn timestamp(&self, frame_rate: u32, sample_rate: u32) -> Timestamp {
        match self.track {
            Track::Video => Timestamp::from_frame_index(self.counter, frame_rate),
            Track::Audio => Timestamp::from_sample_count(self.counter, sample_rate),
        }
    }
}
