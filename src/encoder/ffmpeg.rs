//! FFmpeg codec backend (libx264 / libx265 / native AAC)

use ffmpeg_next::{self as ffmpeg, codec, encoder, ffi, format, frame, Dictionary, Packet};
use tracing::{debug, info};

use super::codec::{
    AudioCodec, AudioEncoderParams, CodecError, CodecPacket, CodecProvider, VideoCodec,
    VideoEncoderParams,
};
use crate::config::VideoCodecKind;
use crate::error::EncoderInitError;
use crate::media::I420Frame;

const HARDWARE_H264: [&str; 4] = ["h264_videotoolbox", "h264_nvenc", "h264_qsv", "h264_vaapi"];
const HARDWARE_HEVC: [&str; 4] = ["hevc_videotoolbox", "hevc_nvenc", "hevc_qsv", "hevc_vaapi"];

/// Opens software encoders through libavcodec
#[derive(Debug, Default)]
pub struct FfmpegProvider;

impl FfmpegProvider {
    pub fn new() -> Self {
        Self
    }

    /// Hardware encoders this FFmpeg build knows about. Informational only;
    /// sessions always use the software encoders.
    pub fn hardware_encoders(codec: VideoCodecKind) -> Vec<&'static str> {
        if ffmpeg::init().is_err() {
            return Vec::new();
        }
        let names = match codec {
            VideoCodecKind::H264 => HARDWARE_H264,
            VideoCodecKind::H265 => HARDWARE_HEVC,
        };
        names
            .into_iter()
            .filter(|name| encoder::find_by_name(name).is_some())
            .collect()
    }
}

fn backend(e: ffmpeg::Error) -> EncoderInitError {
    EncoderInitError::Backend(e.to_string())
}

fn context_extradata(ctx: &codec::context::Context) -> Option<Vec<u8>> {
    // SAFETY: the context is open and owns its extradata buffer
    unsafe {
        let ptr = ctx.as_ptr();
        let data = (*ptr).extradata;
        let size = (*ptr).extradata_size;
        if data.is_null() || size <= 0 {
            return None;
        }
        Some(std::slice::from_raw_parts(data, size as usize).to_vec())
    }
}

/// Pull one packet; `None` when the encoder wants more input or is drained
fn receive(
    ctx: &mut encoder::Encoder,
    packet: &mut Packet,
) -> Result<Option<CodecPacket>, CodecError> {
    match ctx.receive_packet(packet) {
        Ok(()) => Ok(Some(CodecPacket {
            data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
            pts: packet.pts(),
            keyframe: Some(packet.is_key()),
        })),
        Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => Ok(None),
        Err(ffmpeg::Error::Eof) => Ok(None),
        Err(e) => Err(CodecError(e.to_string())),
    }
}

impl CodecProvider for FfmpegProvider {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn open_video(
        &self,
        params: &VideoEncoderParams,
    ) -> Result<Box<dyn VideoCodec>, EncoderInitError> {
        ffmpeg::init().map_err(backend)?;

        let (library, id) = match params.codec {
            VideoCodecKind::H264 => ("libx264", codec::Id::H264),
            VideoCodecKind::H265 => ("libx265", codec::Id::HEVC),
        };
        let found = encoder::find_by_name(library)
            .or_else(|| encoder::find(id))
            .ok_or_else(|| EncoderInitError::CodecUnavailable(params.codec.to_string()))?;
        debug!(encoder = found.name(), "Selected video encoder");

        let mut video = codec::context::Context::new_with_codec(found)
            .encoder()
            .video()
            .map_err(backend)?;
        video.set_width(params.width);
        video.set_height(params.height);
        video.set_format(format::Pixel::YUV420P);
        video.set_time_base((1, params.frame_rate as i32));
        video.set_frame_rate(Some((params.frame_rate as i32, 1)));
        video.set_gop(params.gop);
        video.set_max_b_frames(0);
        video.set_bit_rate(params.rate.target_bitrate as usize);
        video.set_max_bit_rate(params.rate.max_bitrate as usize);
        video.set_flags(codec::Flags::GLOBAL_HEADER);
        // SAFETY: the context is allocated and not yet opened
        unsafe {
            (*video.as_mut_ptr()).rc_buffer_size = params.rate.buffer_size as i32;
        }

        let mut opts = Dictionary::new();
        opts.set("preset", params.preset);
        opts.set("crf", &params.rate.crf.to_string());
        let opened = video.open_with(opts).map_err(|e| {
            EncoderInitError::InvalidParameters(format!("{} rejected parameters: {}", library, e))
        })?;
        let extradata = context_extradata(&opened);

        info!(
            encoder = library,
            preset = params.preset,
            gop = params.gop,
            max_bitrate = params.rate.max_bitrate,
            "FFmpeg video encoder ready"
        );
        Ok(Box::new(FfmpegVideo {
            encoder: opened,
            width: params.width,
            height: params.height,
            extradata,
            packet: Packet::empty(),
        }))
    }

    fn open_audio(
        &self,
        params: &AudioEncoderParams,
    ) -> Result<Box<dyn AudioCodec>, EncoderInitError> {
        ffmpeg::init().map_err(backend)?;

        let found = encoder::find(codec::Id::AAC)
            .ok_or_else(|| EncoderInitError::CodecUnavailable("aac".to_string()))?;
        let mut audio = codec::context::Context::new_with_codec(found)
            .encoder()
            .audio()
            .map_err(backend)?;
        audio.set_rate(params.sample_rate as i32);
        audio.set_format(format::Sample::F32(format::sample::Type::Planar));
        audio.set_bit_rate(params.bitrate as usize);
        audio.set_time_base((1, params.sample_rate as i32));
        audio.set_flags(codec::Flags::GLOBAL_HEADER);
        // SAFETY: the context is allocated and not yet opened
        unsafe {
            ffi::av_channel_layout_default(
                &mut (*audio.as_mut_ptr()).ch_layout,
                params.channels as i32,
            );
        }

        let opened = audio.open_with(Dictionary::new()).map_err(|e| {
            EncoderInitError::InvalidParameters(format!("aac rejected parameters: {}", e))
        })?;
        let frame_size = opened.frame_size() as usize;
        let extradata = context_extradata(&opened);

        Ok(Box::new(FfmpegAudio {
            encoder: opened,
            sample_rate: params.sample_rate,
            frame_size,
            extradata,
            packet: Packet::empty(),
        }))
    }
}

struct FfmpegVideo {
    encoder: encoder::video::Encoder,
    width: u32,
    height: u32,
    extradata: Option<Vec<u8>>,
    packet: Packet,
}

fn copy_plane(dst: &mut [u8], stride: usize, src: &[u8], width: usize, rows: usize) {
    for row in 0..rows {
        dst[row * stride..row * stride + width].copy_from_slice(&src[row * width..(row + 1) * width]);
    }
}

impl VideoCodec for FfmpegVideo {
    fn send_frame(&mut self, planar: &I420Frame, pts: i64) -> Result<(), CodecError> {
        if planar.width != self.width || planar.height != self.height {
            return Err(CodecError(format!(
                "frame is {}x{}, encoder expects {}x{}",
                planar.width, planar.height, self.width, self.height
            )));
        }
        let mut frame = frame::Video::new(format::Pixel::YUV420P, self.width, self.height);
        let (cw, ch) = (planar.chroma_width(), planar.chroma_height());
        let planes = [
            (&planar.y, self.width as usize, self.height as usize),
            (&planar.u, cw, ch),
            (&planar.v, cw, ch),
        ];
        for (index, (src, width, rows)) in planes.into_iter().enumerate() {
            let stride = frame.stride(index);
            copy_plane(frame.data_mut(index), stride, src, width, rows);
        }
        frame.set_pts(Some(pts));
        self.encoder
            .send_frame(&frame)
            .map_err(|e| CodecError(e.to_string()))
    }

    fn send_eof(&mut self) -> Result<(), CodecError> {
        self.encoder.send_eof().map_err(|e| CodecError(e.to_string()))
    }

    fn receive_packet(&mut self) -> Result<Option<CodecPacket>, CodecError> {
        receive(&mut self.encoder, &mut self.packet)
    }

    fn extradata(&self) -> Option<Vec<u8>> {
        self.extradata.clone()
    }
}

struct FfmpegAudio {
    encoder: encoder::audio::Encoder,
    sample_rate: u32,
    frame_size: usize,
    extradata: Option<Vec<u8>>,
    packet: Packet,
}

impl AudioCodec for FfmpegAudio {
    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn send_frame(&mut self, planes: &[Vec<f32>], pts: i64) -> Result<(), CodecError> {
        let mut frame = frame::Audio::empty();
        frame.set_format(format::Sample::F32(format::sample::Type::Planar));
        frame.set_samples(self.frame_size);
        frame.set_rate(self.sample_rate);
        // SAFETY: both layouts are valid; the frame buffer is allocated for
        // the format, sample count and layout set above
        let status = unsafe {
            let dst = frame.as_mut_ptr();
            ffi::av_channel_layout_copy(&mut (*dst).ch_layout, &(*self.encoder.as_ptr()).ch_layout);
            ffi::av_frame_get_buffer(dst, 0)
        };
        if status < 0 {
            return Err(CodecError(ffmpeg::Error::from(status).to_string()));
        }

        for (index, plane) in planes.iter().enumerate() {
            let dst = frame.data_mut(index);
            for (bytes, sample) in dst.chunks_exact_mut(4).zip(plane) {
                bytes.copy_from_slice(&sample.to_ne_bytes());
            }
        }
        frame.set_pts(Some(pts));
        self.encoder
            .send_frame(&frame)
            .map_err(|e| CodecError(e.to_string()))
    }

    fn send_eof(&mut self) -> Result<(), CodecError> {
        self.encoder.send_eof().map_err(|e| CodecError(e.to_string()))
    }

    fn receive_packet(&mut self) -> Result<Option<CodecPacket>, CodecError> {
        receive(&mut self.encoder, &mut self.packet)
    }

    fn extradata(&self) -> Option<Vec<u8>> {
        self.extradata.clone()
    }
}
