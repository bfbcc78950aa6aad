//! In-memory codecs with failure injection

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::encoder::{
    AudioCodec, AudioEncoderParams, CodecError, CodecPacket, CodecProvider, VideoCodec,
    VideoEncoderParams,
};
use crate::error::EncoderInitError;
use crate::media::I420Frame;
use crate::mux::aac_audio_specific_config;

pub const FAKE_AUDIO_FRAME_SIZE: usize = 1024;

const SPS: [u8; 5] = [0x67, 0x42, 0x00, 0x1e, 0xab];
const PPS: [u8; 3] = [0x68, 0xce, 0x38];

#[derive(Debug, Clone, Default)]
pub struct FakeVideoBehavior {
    /// Frames held inside the codec before output starts
    pub delay: usize,
    /// Zero-based `send_frame` calls that fail
    pub fail_on: Vec<u64>,
    pub fail_flush: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FakeAudioBehavior {
    pub fail_on: Vec<u64>,
    pub fail_flush: bool,
}

pub struct FakeCodecProvider {
    video: FakeVideoBehavior,
    audio: FakeAudioBehavior,
    available: bool,
    /// Frames the video codecs accepted, shared across opened codecs
    pub video_frames: Arc<AtomicU64>,
}

impl FakeCodecProvider {
    pub fn new(video: FakeVideoBehavior) -> Self {
        Self {
            video,
            audio: FakeAudioBehavior::default(),
            available: true,
            video_frames: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_audio(mut self, audio: FakeAudioBehavior) -> Self {
        self.audio = audio;
        self
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(FakeVideoBehavior::default())
        }
    }
}

impl CodecProvider for FakeCodecProvider {
    fn name(&self) -> &str {
        "fake"
    }

    fn open_video(
        &self,
        params: &VideoEncoderParams,
    ) -> Result<Box<dyn VideoCodec>, EncoderInitError> {
        if !self.available {
            return Err(EncoderInitError::CodecUnavailable(params.codec.to_string()));
        }
        Ok(Box::new(FakeVideoCodec {
            behavior: self.video.clone(),
            gop: params.gop.max(1) as i64,
            calls: 0,
            pending: VecDeque::new(),
            eof: false,
            accepted: self.video_frames.clone(),
        }))
    }

    fn open_audio(
        &self,
        params: &AudioEncoderParams,
    ) -> Result<Box<dyn AudioCodec>, EncoderInitError> {
        if !self.available {
            return Err(EncoderInitError::CodecUnavailable("aac".to_string()));
        }
        Ok(Box::new(FakeAudioCodec {
            behavior: self.audio.clone(),
            extradata: aac_audio_specific_config(params.sample_rate, params.channels),
            calls: 0,
            pending: VecDeque::new(),
        }))
    }
}

struct FakeVideoCodec {
    behavior: FakeVideoBehavior,
    gop: i64,
    calls: u64,
    pending: VecDeque<i64>,
    eof: bool,
    accepted: Arc<AtomicU64>,
}

impl VideoCodec for FakeVideoCodec {
    fn send_frame(&mut self, frame: &I420Frame, pts: i64) -> Result<(), CodecError> {
        let call = self.calls;
        self.calls += 1;
        if self.behavior.fail_on.contains(&call) {
            return Err(CodecError(format!("injected failure on frame call {}", call)));
        }
        if frame.y.len() != (frame.width * frame.height) as usize {
            return Err(CodecError("luma plane has the wrong size".to_string()));
        }
        self.pending.push_back(pts);
        self.accepted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn send_eof(&mut self) -> Result<(), CodecError> {
        if self.behavior.fail_flush {
            return Err(CodecError("injected flush failure".to_string()));
        }
        self.eof = true;
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<Option<CodecPacket>, CodecError> {
        if !self.eof && self.pending.len() <= self.behavior.delay {
            return Ok(None);
        }
        Ok(self.pending.pop_front().map(|pts| {
            let keyframe = pts % self.gop == 0;
            let header = if keyframe { 0x65 } else { 0x41 };
            let mut data = vec![0, 0, 0, 1];
            if keyframe {
                data.extend_from_slice(&SPS);
                data.extend_from_slice(&[0, 0, 0, 1]);
                data.extend_from_slice(&PPS);
                data.extend_from_slice(&[0, 0, 0, 1]);
            }
            data.extend_from_slice(&[header, 0x80 | (pts % 128) as u8, 0xff]);
            CodecPacket {
                data,
                pts: Some(pts),
                keyframe: Some(keyframe),
            }
        }))
    }

    fn extradata(&self) -> Option<Vec<u8>> {
        let mut out = vec![0, 0, 0, 1];
        out.extend_from_slice(&SPS);
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(&PPS);
        Some(out)
    }
}

struct FakeAudioCodec {
    behavior: FakeAudioBehavior,
    extradata: Vec<u8>,
    calls: u64,
    pending: VecDeque<i64>,
}

impl AudioCodec for FakeAudioCodec {
    fn frame_size(&self) -> usize {
        FAKE_AUDIO_FRAME_SIZE
    }

    fn send_frame(&mut self, planes: &[Vec<f32>], pts: i64) -> Result<(), CodecError> {
        let call = self.calls;
        self.calls += 1;
        if self.behavior.fail_on.contains(&call) {
            return Err(CodecError(format!("injected failure on audio call {}", call)));
        }
        if planes.iter().any(|p| p.len() != FAKE_AUDIO_FRAME_SIZE) {
            return Err(CodecError("audio frame has the wrong size".to_string()));
        }
        // report codec timestamps with priming, the session must ignore them
        self.pending.push_back(pts - FAKE_AUDIO_FRAME_SIZE as i64);
        Ok(())
    }

    fn send_eof(&mut self) -> Result<(), CodecError> {
        if self.behavior.fail_flush {
            return Err(CodecError("injected flush failure".to_string()));
        }
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<Option<CodecPacket>, CodecError> {
        Ok(self.pending.pop_front().map(|pts| CodecPacket {
            data: vec![0x21, 0x10, 0x04, 0x60, 0x8c, 0x1c],
            pts: Some(pts),
            keyframe: None,
        }))
    }

    fn extradata(&self) -> Option<Vec<u8>> {
        Some(self.extradata.clone())
    }
}
