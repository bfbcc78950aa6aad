//! Codec backend seam
//!
//! The session talks to codecs through these traits so that the FFmpeg
//! backend can be swapped for another implementation (or a test double)
//! without touching the pipeline.

use thiserror::Error;

use crate::config::{CaptureSettings, Quality, VideoCodecKind};
use crate::error::EncoderInitError;
use crate::media::I420Frame;

/// Error reported by a codec backend for a single operation
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CodecError(pub String);

/// One compressed packet as it leaves a codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecPacket {
    pub data: Vec<u8>,
    /// Presentation timestamp in the codec time base, if the codec set one
    pub pts: Option<i64>,
    /// Keyframe flag, if the codec reports one
    pub keyframe: Option<bool>,
}

/// Constant-rate-factor rate control with a bitrate ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateControl {
    pub crf: u8,
    /// Bits per second the codec aims for
    pub target_bitrate: u32,
    /// `maxrate`
    pub max_bitrate: u32,
    /// `bufsize`, in bits
    pub buffer_size: u32,
}

impl RateControl {
    pub fn for_settings(settings: &CaptureSettings) -> Self {
        let target = settings.effective_video_bitrate();
        Self {
            crf: crf_for(settings.quality),
            target_bitrate: target,
            max_bitrate: target.saturating_add(target / 4),
            buffer_size: target.saturating_mul(2),
        }
    }
}

fn crf_for(quality: Quality) -> u8 {
    match quality {
        Quality::Low => 32,
        Quality::Medium => 28,
        Quality::High => 23,
        Quality::Ultra => 18,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoEncoderParams {
    pub codec: VideoCodecKind,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub rate: RateControl,
    /// Frames between forced keyframes
    pub gop: u32,
    pub preset: &'static str,
}

impl VideoEncoderParams {
    pub fn new(settings: &CaptureSettings, width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            codec: settings.codec,
            width,
            height,
            frame_rate,
            rate: RateControl::for_settings(settings),
            gop: frame_rate.saturating_mul(2).max(1),
            preset: match settings.codec {
                VideoCodecKind::H264 => "fast",
                VideoCodecKind::H265 => "medium",
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioEncoderParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u32,
}

/// An open video encoder fed with I420 frames
pub trait VideoCodec: Send {
    /// Submit one frame. `pts` is the frame index.
    fn send_frame(&mut self, frame: &I420Frame, pts: i64) -> Result<(), CodecError>;

    /// Signal end of input so buffered frames are released
    fn send_eof(&mut self) -> Result<(), CodecError>;

    /// Next available packet, `None` when the codec needs more input
    fn receive_packet(&mut self) -> Result<Option<CodecPacket>, CodecError>;

    /// Out-of-band parameter sets, if the codec exposes them
    fn extradata(&self) -> Option<Vec<u8>>;
}

/// An open audio encoder fed with planar `f32` frames of `frame_size()` samples
pub trait AudioCodec: Send {
    fn frame_size(&self) -> usize;

    /// Submit exactly `frame_size()` samples per channel. `pts` is the sample index.
    fn send_frame(&mut self, planes: &[Vec<f32>], pts: i64) -> Result<(), CodecError>;

    fn send_eof(&mut self) -> Result<(), CodecError>;

    fn receive_packet(&mut self) -> Result<Option<CodecPacket>, CodecError>;

    /// AudioSpecificConfig
    fn extradata(&self) -> Option<Vec<u8>>;
}

/// Opens codecs for an encoder session
pub trait CodecProvider: Send + Sync {
    fn name(&self) -> &str;

    fn open_video(&self, params: &VideoEncoderParams)
        -> Result<Box<dyn VideoCodec>, EncoderInitError>;

    fn open_audio(&self, params: &AudioEncoderParams)
        -> Result<Box<dyn AudioCodec>, EncoderInitError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_control_caps() {
        let settings = CaptureSettings {
            video_bitrate: 8_000_000,
            quality: Quality::Medium,
            ..Default::default()
        };
        let rate = RateControl::for_settings(&settings);
        assert_eq!(rate.crf, 28);
        assert_eq!(rate.target_bitrate, 8_000_000);
        assert_eq!(rate.max_bitrate, 10_000_000);
        assert_eq!(rate.buffer_size, 16_000_000);
    }

    #[test]
    fn test_high_efficiency_codec_scales_target() {
        let settings = CaptureSettings {
            video_bitrate: 10_000_000,
            codec: VideoCodecKind::H265,
            efficiency_ratio: 0.6,
            ..Default::default()
        };
        let params = VideoEncoderParams::new(&settings, 1280, 720, 30);
        assert_eq!(params.rate.target_bitrate, 6_000_000);
        assert_eq!(params.gop, 60);
        assert_eq!(params.preset, "medium");
    }
}
