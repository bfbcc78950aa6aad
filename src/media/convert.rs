//! Pixel and sample format conversion ahead of the codecs

use crate::error::UnitProcessingError;
use crate::media::{PixelLayout, RawAudioBuffer, RawVideoFrame, SampleFormat, Track};

/// Planar 4:2:0 frame with tightly packed planes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I420Frame {
    pub width: u32,
    pub height: u32,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
}

impl I420Frame {
    pub fn chroma_width(&self) -> usize {
        (self.width as usize + 1) / 2
    }

    pub fn chroma_height(&self) -> usize {
        (self.height as usize + 1) / 2
    }
}

fn malformed(reason: impl Into<String>) -> UnitProcessingError {
    UnitProcessingError::MalformedBuffer {
        track: Track::Video,
        reason: reason.into(),
    }
}

/// Convert any supported layout to I420 using BT.601 limited range.
pub fn convert_to_i420(frame: &RawVideoFrame) -> Result<I420Frame, UnitProcessingError> {
    if frame.data.is_empty() {
        return Err(UnitProcessingError::EmptyBuffer(Track::Video));
    }
    let width = frame.width as usize;
    let height = frame.height as usize;
    if width == 0 || height == 0 {
        return Err(malformed("zero dimension"));
    }
    let cw = (width + 1) / 2;
    let ch = (height + 1) / 2;

    match frame.layout {
        PixelLayout::Yuv420p => {
            let stride = frame.stride.max(width);
            let chroma_stride = (stride + 1) / 2;
            let needed = stride * height + 2 * chroma_stride * ch;
            if frame.data.len() < needed {
                return Err(malformed(format!(
                    "need {} bytes for planar frame, got {}",
                    needed,
                    frame.data.len()
                )));
            }
            let (y_plane, rest) = frame.data.split_at(stride * height);
            let (u_plane, v_plane) = rest.split_at(chroma_stride * ch);
            Ok(I420Frame {
                width: frame.width,
                height: frame.height,
                y: copy_plane(y_plane, stride, width, height),
                u: copy_plane(u_plane, chroma_stride, cw, ch),
                v: copy_plane(v_plane, chroma_stride, cw, ch),
            })
        }
        layout => {
            let bpp = layout.packed_bytes_per_pixel().unwrap_or(3);
            let stride = frame.stride;
            if stride < width * bpp {
                return Err(malformed(format!(
                    "stride {} shorter than row of {} bytes",
                    stride,
                    width * bpp
                )));
            }
            let needed = stride * (height - 1) + width * bpp;
            if frame.data.len() < needed {
                return Err(malformed(format!(
                    "need {} bytes for {}x{} {:?}, got {}",
                    needed,
                    width,
                    height,
                    layout,
                    frame.data.len()
                )));
            }
            Ok(packed_to_i420(frame, layout, bpp))
        }
    }
}

fn copy_plane(src: &[u8], stride: usize, width: usize, height: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(width * height);
    for row in 0..height {
        let start = row * stride;
        out.extend_from_slice(&src[start..start + width]);
    }
    out
}

fn packed_to_i420(frame: &RawVideoFrame, layout: PixelLayout, bpp: usize) -> I420Frame {
    let width = frame.width as usize;
    let height = frame.height as usize;
    let cw = (width + 1) / 2;
    let ch = (height + 1) / 2;
    let (ri, gi, bi) = match layout {
        PixelLayout::Bgr24 | PixelLayout::Bgra32 => (2, 1, 0),
        _ => (0, 1, 2),
    };

    let rgb_at = |x: usize, y: usize| -> (i32, i32, i32) {
        let p = y * frame.stride + x * bpp;
        (
            frame.data[p + ri] as i32,
            frame.data[p + gi] as i32,
            frame.data[p + bi] as i32,
        )
    };

    let mut y_plane = vec![0u8; width * height];
    for y in 0..height {
        for x in 0..width {
            let (r, g, b) = rgb_at(x, y);
            y_plane[y * width + x] = (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8;
        }
    }

    let mut u_plane = vec![0u8; cw * ch];
    let mut v_plane = vec![0u8; cw * ch];
    for cy in 0..ch {
        for cx in 0..cw {
            let (mut r, mut g, mut b, mut n) = (0, 0, 0, 0);
            for dy in 0..2 {
                for dx in 0..2 {
                    let (x, y) = (cx * 2 + dx, cy * 2 + dy);
                    if x < width && y < height {
                        let (pr, pg, pb) = rgb_at(x, y);
                        r += pr;
                        g += pg;
                        b += pb;
                        n += 1;
                    }
                }
            }
            let (r, g, b) = (r / n, g / n, b / n);
            u_plane[cy * cw + cx] = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128) as u8;
            v_plane[cy * cw + cx] = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128) as u8;
        }
    }

    I420Frame {
        width: frame.width,
        height: frame.height,
        y: y_plane,
        u: u_plane,
        v: v_plane,
    }
}

/// Split interleaved PCM into one `f32` plane per channel, scaled to [-1, 1].
pub fn deinterleave_to_planar(buffer: &RawAudioBuffer) -> Result<Vec<Vec<f32>>, UnitProcessingError> {
    if buffer.data.is_empty() {
        return Err(UnitProcessingError::EmptyBuffer(Track::Audio));
    }
    let channels = buffer.channels as usize;
    let frames = buffer.frames().ok_or_else(|| UnitProcessingError::MalformedBuffer {
        track: Track::Audio,
        reason: format!(
            "{} bytes is not a whole number of {}-channel {:?} frames",
            buffer.data.len(),
            channels,
            buffer.sample_format
        ),
    })?;

    let width = buffer.sample_format.bytes_per_sample();
    let mut planes = vec![Vec::with_capacity(frames); channels];
    for (i, sample) in buffer.data.chunks_exact(width).enumerate() {
        planes[i % channels].push(decode_sample(sample, buffer.sample_format));
    }
    Ok(planes)
}

fn decode_sample(bytes: &[u8], format: SampleFormat) -> f32 {
    match format {
        SampleFormat::S16Le => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32768.0,
        SampleFormat::S24Le => {
            // sign-extend through the top byte of an i32
            let v = i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8;
            v as f32 / 8_388_608.0
        }
        SampleFormat::S32Le => {
            i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0
        }
        SampleFormat::F32Le => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}
