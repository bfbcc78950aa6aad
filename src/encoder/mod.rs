//! Encoder session: one video codec and at most one audio codec per capture
//!
//! The session converts raw frames and sample buffers into the formats the
//! codecs expect, re-blocks audio into fixed codec frames, and stamps every
//! access unit with its track-local presentation counter.

mod codec;
mod fifo;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub use codec::{
    AudioCodec, AudioEncoderParams, CodecError, CodecPacket, CodecProvider, RateControl,
    VideoCodec, VideoEncoderParams,
};
pub use fifo::AudioFifo;

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{CaptureSettings, VideoCodecKind, SUPPORTED_SAMPLE_RATES};
use crate::error::{EncoderInitError, FinalizeError, UnitProcessingError};
use crate::media::{
    convert_to_i420, deinterleave_to_planar, AudioFormat, EncodedAccessUnit, RawAudioBuffer,
    RawVideoFrame, Track, VideoGeometry,
};

/// Codec backend compiled into this build, if any
pub fn default_provider() -> Option<Arc<dyn CodecProvider>> {
    #[cfg(feature = "ffmpeg")]
    {
        return Some(Arc::new(ffmpeg::FfmpegProvider::new()));
    }

    #[cfg(not(feature = "ffmpeg"))]
    {
        None
    }
}

struct VideoPath {
    codec: Box<dyn VideoCodec>,
    kind: VideoCodecKind,
    geometry: VideoGeometry,
    /// Frames submitted so far, including ones the codec rejected
    counter: u64,
}

struct AudioPath {
    codec: Box<dyn AudioCodec>,
    format: AudioFormat,
    fifo: AudioFifo,
    frame_size: usize,
    /// Samples per channel consumed from the FIFO, rejected frames included
    submitted: u64,
    /// Counters of accepted frames the codec has not returned yet
    in_flight: VecDeque<u64>,
    /// Counter following the last emitted unit
    next_counter: u64,
}

enum SessionState {
    Uninitialized,
    Active {
        video: VideoPath,
        audio: Option<AudioPath>,
    },
    Finalized,
}

/// Stateful codec pair for one capture session
pub struct EncoderSession {
    provider: Arc<dyn CodecProvider>,
    state: SessionState,
}

impl EncoderSession {
    pub fn new(provider: Arc<dyn CodecProvider>) -> Self {
        Self {
            provider,
            state: SessionState::Uninitialized,
        }
    }

    /// Open the codecs for the negotiated formats. Callable once.
    pub fn initialize(
        &mut self,
        settings: &CaptureSettings,
        geometry: VideoGeometry,
        audio_format: Option<AudioFormat>,
    ) -> Result<(), EncoderInitError> {
        if !matches!(self.state, SessionState::Uninitialized) {
            return Err(EncoderInitError::AlreadyInitialized);
        }

        if geometry.width == 0 || geometry.height == 0 {
            return Err(EncoderInitError::InvalidParameters(format!(
                "non-positive dimensions {}x{}",
                geometry.width, geometry.height
            )));
        }
        if geometry.width % 2 != 0 || geometry.height % 2 != 0 {
            return Err(EncoderInitError::InvalidParameters(format!(
                "4:2:0 needs even dimensions, got {}x{}",
                geometry.width, geometry.height
            )));
        }
        if geometry.frame_rate == 0 {
            return Err(EncoderInitError::InvalidParameters(
                "frame rate must be positive".to_string(),
            ));
        }
        if let Some(format) = &audio_format {
            if !SUPPORTED_SAMPLE_RATES.contains(&format.sample_rate) {
                return Err(EncoderInitError::InvalidParameters(format!(
                    "unsupported sample rate {} Hz",
                    format.sample_rate
                )));
            }
            if !(1..=2).contains(&format.channels) {
                return Err(EncoderInitError::InvalidParameters(format!(
                    "unsupported channel count {}",
                    format.channels
                )));
            }
        }

        let video_params =
            VideoEncoderParams::new(settings, geometry.width, geometry.height, geometry.frame_rate);
        let video_codec = self.provider.open_video(&video_params)?;
        info!(
            backend = self.provider.name(),
            codec = %settings.codec,
            width = geometry.width,
            height = geometry.height,
            fps = geometry.frame_rate,
            crf = video_params.rate.crf,
            target_bitrate = video_params.rate.target_bitrate,
            "Opened video encoder"
        );

        let audio = match audio_format {
            Some(format) => {
                let params = AudioEncoderParams {
                    sample_rate: format.sample_rate,
                    channels: format.channels,
                    bitrate: settings.audio_bitrate,
                };
                let codec = self.provider.open_audio(&params)?;
                let frame_size = codec.frame_size();
                if frame_size == 0 {
                    return Err(EncoderInitError::InvalidParameters(
                        "audio codec reports a zero frame size".to_string(),
                    ));
                }
                info!(
                    sample_rate = format.sample_rate,
                    channels = format.channels,
                    frame_size,
                    bitrate = settings.audio_bitrate,
                    "Opened audio encoder"
                );
                Some(AudioPath {
                    codec,
                    format,
                    fifo: AudioFifo::new(format.channels as usize),
                    frame_size,
                    submitted: 0,
                    in_flight: VecDeque::new(),
                    next_counter: 0,
                })
            }
            None => None,
        };

        self.state = SessionState::Active {
            video: VideoPath {
                codec: video_codec,
                kind: settings.codec,
                geometry,
                counter: 0,
            },
            audio,
        };
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, SessionState::Active { .. })
    }

    pub fn video_codec(&self) -> Option<VideoCodecKind> {
        match &self.state {
            SessionState::Active { video, .. } => Some(video.kind),
            _ => None,
        }
    }

    /// Video parameter sets for the container, if the codec exposes them
    pub fn video_extradata(&self) -> Option<Vec<u8>> {
        match &self.state {
            SessionState::Active { video, .. } => video.codec.extradata(),
            _ => None,
        }
    }

    pub fn audio_extradata(&self) -> Option<Vec<u8>> {
        match &self.state {
            SessionState::Active {
                audio: Some(audio), ..
            } => audio.codec.extradata(),
            _ => None,
        }
    }

    /// Samples per channel in one audio access unit
    pub fn audio_frame_size(&self) -> Option<usize> {
        match &self.state {
            SessionState::Active {
                audio: Some(audio), ..
            } => Some(audio.frame_size),
            _ => None,
        }
    }

    /// Frames handed to the video codec, accepted or not
    pub fn video_frames_submitted(&self) -> u64 {
        match &self.state {
            SessionState::Active { video, .. } => video.counter,
            _ => 0,
        }
    }

    fn active(
        &mut self,
    ) -> Result<(&mut VideoPath, Option<&mut AudioPath>), UnitProcessingError> {
        match &mut self.state {
            SessionState::Active { video, audio } => Ok((video, audio.as_mut())),
            SessionState::Uninitialized => Err(UnitProcessingError::NotInitialized),
            SessionState::Finalized => Err(UnitProcessingError::Finalized),
        }
    }

    /// Encode one raw frame; may return zero or more access units.
    ///
    /// Every frame of the right size takes the next counter value, so a frame
    /// the codec rejects leaves a one-frame gap instead of pulling later
    /// frames earlier.
    pub fn encode_video(
        &mut self,
        frame: &RawVideoFrame,
    ) -> Result<Vec<EncodedAccessUnit>, UnitProcessingError> {
        let (video, _) = self.active()?;
        let geometry = video.geometry;
        if frame.width != geometry.width || frame.height != geometry.height {
            return Err(UnitProcessingError::DimensionMismatch {
                width: geometry.width,
                height: geometry.height,
                got_width: frame.width,
                got_height: frame.height,
            });
        }

        let pts = video.counter;
        video.counter += 1;

        let planar = convert_to_i420(frame)?;
        video
            .codec
            .send_frame(&planar, pts as i64)
            .map_err(|e| UnitProcessingError::Encode {
                track: Track::Video,
                reason: e.0,
            })?;

        drain_video(video).map_err(|e| UnitProcessingError::Encode {
            track: Track::Video,
            reason: e.0,
        })
    }

    /// Encode one raw sample buffer; emits one unit per full codec frame.
    ///
    /// The outer error rejects the whole buffer. A buffer spanning several
    /// codec frames keeps going past a frame the codec rejects; that frame's
    /// slot stays empty and the first such failure is reported alongside the
    /// units that were produced.
    pub fn encode_audio(
        &mut self,
        buffer: &RawAudioBuffer,
    ) -> Result<EncodedAudio, UnitProcessingError> {
        let (_, audio) = self.active()?;
        let audio = audio.ok_or(UnitProcessingError::TrackNotConfigured(Track::Audio))?;
        if buffer.sample_rate != audio.format.sample_rate
            || buffer.channels != audio.format.channels
        {
            return Err(UnitProcessingError::FormatMismatch {
                rate: audio.format.sample_rate,
                channels: audio.format.channels,
                got_rate: buffer.sample_rate,
                got_channels: buffer.channels,
            });
        }

        let planes = deinterleave_to_planar(buffer)?;
        audio.fifo.push(planes);

        let mut encoded = EncodedAudio::default();
        while let Some(frame) = audio.fifo.pop(audio.frame_size) {
            let result = submit_audio(audio, &frame)
                .and_then(|()| drain_audio(audio, &mut encoded.units));
            if let Err(e) = result {
                debug!(error = %e, submitted = audio.submitted, "Audio frame rejected");
                encoded.error.get_or_insert(UnitProcessingError::Encode {
                    track: Track::Audio,
                    reason: e.0,
                });
            }
        }
        Ok(encoded)
    }

    /// Flush both codecs and return the trailing access units. Callable once.
    ///
    /// A partial final audio frame is zero-padded to the codec frame size. A
    /// codec that fails to flush does not stop the other one from flushing.
    pub fn finalize(&mut self) -> Result<Flushed, FinalizeError> {
        let state = std::mem::replace(&mut self.state, SessionState::Finalized);
        let (mut video, audio) = match state {
            SessionState::Active { video, audio } => (video, audio),
            SessionState::Uninitialized => {
                self.state = SessionState::Uninitialized;
                return Err(FinalizeError::NotInitialized);
            }
            SessionState::Finalized => return Err(FinalizeError::AlreadyFinalized),
        };

        let mut flushed = Flushed::default();

        if let Err(e) = flush_video(&mut video, &mut flushed.units) {
            warn!(error = %e, "Video encoder flush failed");
            flushed.error = Some(FinalizeError::Flush {
                track: Track::Video,
                reason: e.0,
            });
        }

        if let Some(mut audio) = audio {
            if let Err(e) = flush_audio(&mut audio, &mut flushed.units) {
                warn!(error = %e, "Audio encoder flush failed");
                flushed.error.get_or_insert(FinalizeError::Flush {
                    track: Track::Audio,
                    reason: e.0,
                });
            }
        }

        debug!(
            trailing_units = flushed.units.len(),
            video_frames = video.counter,
            "Encoder session finalized"
        );
        Ok(flushed)
    }
}

/// Units produced from one audio buffer
#[derive(Debug, Default)]
pub struct EncodedAudio {
    pub units: Vec<EncodedAccessUnit>,
    /// First codec frame of the buffer that failed
    pub error: Option<UnitProcessingError>,
}

/// Trailing units released by [`EncoderSession::finalize`]
#[derive(Debug, Default)]
pub struct Flushed {
    pub units: Vec<EncodedAccessUnit>,
    /// First flush failure; units still held by that codec are lost
    pub error: Option<FinalizeError>,
}

fn flush_video(
    video: &mut VideoPath,
    units: &mut Vec<EncodedAccessUnit>,
) -> Result<(), CodecError> {
    video.codec.send_eof()?;
    units.extend(drain_video(video)?);
    Ok(())
}

fn drain_video(video: &mut VideoPath) -> Result<Vec<EncodedAccessUnit>, CodecError> {
    let mut units = Vec::new();
    while let Some(packet) = video.codec.receive_packet()? {
        let counter = match packet.pts {
            Some(pts) if pts >= 0 => pts as u64,
            _ => video.counter.saturating_sub(1),
        };
        units.push(EncodedAccessUnit {
            track: Track::Video,
            counter,
            keyframe: packet.keyframe,
            data: packet.data,
        });
    }
    Ok(units)
}

/// The frame's samples are consumed whether or not the codec takes them
fn submit_audio(audio: &mut AudioPath, frame: &[Vec<f32>]) -> Result<(), CodecError> {
    let counter = audio.submitted;
    audio.submitted += audio.frame_size as u64;
    audio.codec.send_frame(frame, counter as i64)?;
    audio.in_flight.push_back(counter);
    Ok(())
}

/// Units take the counters of the accepted frames in order; codec timestamps
/// (which include encoder priming) are ignored
fn drain_audio(
    audio: &mut AudioPath,
    units: &mut Vec<EncodedAccessUnit>,
) -> Result<(), CodecError> {
    while let Some(packet) = audio.codec.receive_packet()? {
        let counter = audio.in_flight.pop_front().unwrap_or(audio.next_counter);
        audio.next_counter = counter + audio.frame_size as u64;
        units.push(EncodedAccessUnit {
            track: Track::Audio,
            counter,
            keyframe: Some(true),
            data: packet.data,
        });
    }
    Ok(())
}

fn flush_audio(
    audio: &mut AudioPath,
    units: &mut Vec<EncodedAccessUnit>,
) -> Result<(), CodecError> {
    if let Some(tail) = audio.fifo.pop_padded(audio.frame_size) {
        submit_audio(audio, &tail)?;
        drain_audio(audio, units)?;
    }
    audio.codec.send_eof()?;
    drain_audio(audio, units)
}
