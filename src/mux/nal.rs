//! NAL unit handling for H.264 / H.265 sample payloads
//!
//! Encoders emit Annex-B byte streams (start-code delimited). MP4 samples
//! carry 4-byte big-endian length prefixes instead, and the parameter sets
//! move into the `avcC` / `hvcC` configuration record.

use crate::config::VideoCodecKind;

const H264_NAL_IDR: u8 = 5;
const H264_NAL_SPS: u8 = 7;
const H264_NAL_PPS: u8 = 8;
const H264_NAL_AUD: u8 = 9;

const HEVC_NAL_IRAP_FIRST: u8 = 16;
const HEVC_NAL_IRAP_LAST: u8 = 21;
const HEVC_NAL_VPS: u8 = 32;
const HEVC_NAL_SPS: u8 = 33;
const HEVC_NAL_PPS: u8 = 34;
const HEVC_NAL_AUD: u8 = 35;

/// Iterator over NAL payloads of an Annex-B stream, start codes removed
pub struct AnnexBNals<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> AnnexBNals<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let cursor = find_start_code(data, 0)
            .map(|(pos, len)| pos + len)
            .unwrap_or(data.len());
        Self { data, cursor }
    }
}

impl<'a> Iterator for AnnexBNals<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor < self.data.len() {
            let start = self.cursor;
            let (end, next) = match find_start_code(self.data, start) {
                Some((pos, len)) => (pos, pos + len),
                None => (self.data.len(), self.data.len()),
            };
            self.cursor = next;

            // trailing zero bytes belong to the next start code
            let mut nal_end = end;
            while nal_end > start && self.data[nal_end - 1] == 0 {
                nal_end -= 1;
            }
            if nal_end > start {
                return Some(&self.data[start..nal_end]);
            }
        }
        None
    }
}

/// Position and length of the next 3- or 4-byte start code at or after `from`
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// Whether a payload starts with an Annex-B start code
pub fn is_annex_b(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 1]) || data.starts_with(&[0, 0, 0, 1])
}

fn nal_type(codec: VideoCodecKind, nal: &[u8]) -> u8 {
    let Some(&header) = nal.first() else {
        return 0;
    };
    match codec {
        VideoCodecKind::H264 => header & 0x1f,
        VideoCodecKind::H265 => (header >> 1) & 0x3f,
    }
}

fn is_delimiter(codec: VideoCodecKind, nal: &[u8]) -> bool {
    match codec {
        VideoCodecKind::H264 => nal_type(codec, nal) == H264_NAL_AUD,
        VideoCodecKind::H265 => nal_type(codec, nal) == HEVC_NAL_AUD,
    }
}

/// Whether any NAL of the access unit is a random access point
pub fn contains_keyframe(codec: VideoCodecKind, nals: &[&[u8]]) -> bool {
    nals.iter().any(|nal| {
        let t = nal_type(codec, nal);
        match codec {
            VideoCodecKind::H264 => t == H264_NAL_IDR,
            VideoCodecKind::H265 => (HEVC_NAL_IRAP_FIRST..=HEVC_NAL_IRAP_LAST).contains(&t),
        }
    })
}

/// Parameter sets collected from a stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSets {
    pub vps: Option<Vec<u8>>,
    pub sps: Option<Vec<u8>>,
    pub pps: Option<Vec<u8>>,
}

impl ParameterSets {
    /// Record any parameter set NALs; first occurrence wins
    pub fn collect(&mut self, codec: VideoCodecKind, nals: &[&[u8]]) {
        for nal in nals {
            let t = nal_type(codec, nal);
            let slot = match (codec, t) {
                (VideoCodecKind::H264, H264_NAL_SPS) | (VideoCodecKind::H265, HEVC_NAL_SPS) => {
                    &mut self.sps
                }
                (VideoCodecKind::H264, H264_NAL_PPS) | (VideoCodecKind::H265, HEVC_NAL_PPS) => {
                    &mut self.pps
                }
                (VideoCodecKind::H265, HEVC_NAL_VPS) => &mut self.vps,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(nal.to_vec());
            }
        }
    }

    pub fn is_complete(&self, codec: VideoCodecKind) -> bool {
        let base = self.sps.is_some() && self.pps.is_some();
        match codec {
            VideoCodecKind::H264 => base,
            VideoCodecKind::H265 => base && self.vps.is_some(),
        }
    }
}

/// Decoder configuration for the video sample entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoDecoderConfig {
    /// Ready-made `avcC` / `hvcC` payload supplied by the encoder
    Record(Vec<u8>),
    /// Parameter sets to build the record from
    ParameterSets(ParameterSets),
}

impl VideoDecoderConfig {
    /// Interpret codec extradata, which may be Annex-B parameter sets or an
    /// already packed configuration record
    pub fn from_extradata(codec: VideoCodecKind, extradata: &[u8]) -> Option<Self> {
        if extradata.is_empty() {
            return None;
        }
        if is_annex_b(extradata) {
            let nals: Vec<&[u8]> = AnnexBNals::new(extradata).collect();
            let mut sets = ParameterSets::default();
            sets.collect(codec, &nals);
            return sets
                .is_complete(codec)
                .then_some(VideoDecoderConfig::ParameterSets(sets));
        }
        // configurationVersion = 1 marks a packed record
        (extradata[0] == 1).then(|| VideoDecoderConfig::Record(extradata.to_vec()))
    }

    /// Payload of the `avcC` or `hvcC` box
    pub fn record(&self, codec: VideoCodecKind) -> Vec<u8> {
        match self {
            VideoDecoderConfig::Record(record) => record.clone(),
            VideoDecoderConfig::ParameterSets(sets) => match codec {
                VideoCodecKind::H264 => avcc_record(sets),
                VideoCodecKind::H265 => hvcc_record(sets),
            },
        }
    }
}

fn avcc_record(sets: &ParameterSets) -> Vec<u8> {
    let sps = sets.sps.as_deref().unwrap_or_default();
    let pps = sets.pps.as_deref().unwrap_or_default();
    let (profile, compat, level) = if sps.len() >= 4 {
        (sps[1], sps[2], sps[3])
    } else {
        (0x42, 0x00, 0x1e)
    };

    let mut out = vec![1, profile, compat, level, 0xff, 0xe1];
    out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    out.extend_from_slice(sps);
    out.push(1);
    out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    out.extend_from_slice(pps);
    out
}

/// Drop the `03` of every `00 00 03` sequence so fields can be read by offset
fn strip_emulation_prevention(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal.len());
    let mut zeros = 0;
    for &byte in nal {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

fn hvcc_record(sets: &ParameterSets) -> Vec<u8> {
    let vps = sets.vps.as_deref().unwrap_or_default();
    let sps = sets.sps.as_deref().unwrap_or_default();
    let pps = sets.pps.as_deref().unwrap_or_default();

    // profile_tier_level starts at byte 3 of the SPS payload (after the 2-byte
    // NAL header and the vps id / sub-layer byte)
    let rbsp = strip_emulation_prevention(sps);
    let ptl_byte = rbsp.get(3).copied().unwrap_or(0x01);
    let compat = rbsp.get(4..8).unwrap_or(&[0x60, 0x00, 0x00, 0x00]);
    let constraints = rbsp.get(8..14).unwrap_or(&[0x90, 0, 0, 0, 0, 0]);
    let level = rbsp.get(14).copied().unwrap_or(93);

    let mut out = vec![1, ptl_byte];
    out.extend_from_slice(compat);
    out.extend_from_slice(constraints);
    out.push(level);
    // min_spatial_segmentation, parallelism, 4:2:0, 8-bit luma/chroma
    out.extend_from_slice(&[0xf0, 0x00, 0xfc, 0xfd, 0xf8, 0xf8]);
    // avgFrameRate unspecified
    out.extend_from_slice(&[0x00, 0x00]);
    // lengthSizeMinusOne = 3
    out.push(0x03);
    out.push(3);
    for (nal_type, nal) in [(HEVC_NAL_VPS, vps), (HEVC_NAL_SPS, sps), (HEVC_NAL_PPS, pps)] {
        out.push(0x80 | nal_type);
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&(nal.len() as u16).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

/// A video payload prepared for the `mdat`
pub struct PreparedSample {
    pub data: Vec<u8>,
    /// Random access point per the NAL types, `None` for opaque payloads
    pub keyframe: Option<bool>,
}

/// Convert one access unit to length-prefixed form, collecting parameter sets
/// and detecting random access points on the way. Payloads that are not
/// Annex-B are assumed to be length-prefixed already.
pub fn prepare_video_sample(
    codec: VideoCodecKind,
    data: &[u8],
    sets: &mut ParameterSets,
) -> PreparedSample {
    if !is_annex_b(data) {
        return PreparedSample {
            data: data.to_vec(),
            keyframe: None,
        };
    }

    let nals: Vec<&[u8]> = AnnexBNals::new(data).collect();
    sets.collect(codec, &nals);
    let keyframe = contains_keyframe(codec, &nals);

    let mut out = Vec::with_capacity(data.len() + nals.len());
    for nal in nals.iter().filter(|nal| !is_delimiter(codec, nal)) {
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    PreparedSample {
        data: out,
        keyframe: Some(keyframe),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 6] = [0x67, 0x64, 0x00, 0x28, 0xac, 0xd9];
    const PPS: [u8; 4] = [0x68, 0xeb, 0xe3, 0xcb];

    fn annex_b(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, nal) in nals.iter().enumerate() {
            if i % 2 == 0 {
                out.extend_from_slice(&[0, 0, 0, 1]);
            } else {
                out.extend_from_slice(&[0, 0, 1]);
            }
            out.extend_from_slice(nal);
        }
        out
    }

    #[test]
    fn test_iterates_mixed_start_codes() {
        let idr = [0x65, 0x88, 0x84, 0x00];
        let stream = annex_b(&[&SPS, &PPS, &idr]);
        let nals: Vec<&[u8]> = AnnexBNals::new(&stream).collect();
        assert_eq!(nals, vec![&SPS[..], &PPS[..], &idr[..3]]);
    }

    #[test]
    fn test_prepare_h264_sample() {
        let aud = [0x09, 0xf0];
        let idr = [0x65, 0x88, 0x84];
        let stream = annex_b(&[&aud, &SPS, &PPS, &idr]);

        let mut sets = ParameterSets::default();
        let sample = prepare_video_sample(VideoCodecKind::H264, &stream, &mut sets);
        assert_eq!(sample.keyframe, Some(true));
        assert!(sets.is_complete(VideoCodecKind::H264));
        // delimiter dropped, 3 NALs with 4-byte lengths remain
        assert_eq!(sample.data.len(), 3 * 4 + SPS.len() + PPS.len() + idr.len());
        assert_eq!(&sample.data[..4], &(SPS.len() as u32).to_be_bytes());

        let p_slice = annex_b(&[&[0x41, 0x9a, 0x02]]);
        let sample = prepare_video_sample(VideoCodecKind::H264, &p_slice, &mut sets);
        assert_eq!(sample.keyframe, Some(false));
        assert_eq!(sample.data, vec![0, 0, 0, 3, 0x41, 0x9a, 0x02]);
    }

    #[test]
    fn test_avcc_from_annex_b_extradata() {
        let extradata = annex_b(&[&SPS, &PPS]);
        let config = VideoDecoderConfig::from_extradata(VideoCodecKind::H264, &extradata).unwrap();
        let record = config.record(VideoCodecKind::H264);
        assert_eq!(&record[..6], &[1, 0x64, 0x00, 0x28, 0xff, 0xe1]);
        assert_eq!(&record[6..8], &(SPS.len() as u16).to_be_bytes());
        assert_eq!(record.len(), 6 + 2 + SPS.len() + 1 + 2 + PPS.len());
    }

    #[test]
    fn test_packed_extradata_is_kept() {
        let packed = vec![1, 0x64, 0x00, 0x28, 0xff, 0xe1, 0, 0];
        let config = VideoDecoderConfig::from_extradata(VideoCodecKind::H264, &packed).unwrap();
        assert_eq!(config, VideoDecoderConfig::Record(packed.clone()));
        assert_eq!(config.record(VideoCodecKind::H264), packed);

        assert!(VideoDecoderConfig::from_extradata(VideoCodecKind::H264, &[]).is_none());
        // SPS without PPS is not enough
        let partial = annex_b(&[&SPS]);
        assert!(VideoDecoderConfig::from_extradata(VideoCodecKind::H264, &partial).is_none());
    }

    #[test]
    fn test_strip_emulation_prevention() {
        assert_eq!(
            strip_emulation_prevention(&[0x60, 0, 0, 3, 0, 0x90, 0, 0, 3, 0, 0, 3, 0]),
            vec![0x60, 0, 0, 0, 0x90, 0, 0, 0, 0, 0]
        );
        // a lone 03 or one after a single zero is data
        assert_eq!(strip_emulation_prevention(&[3, 0, 3, 0]), vec![3, 0, 3, 0]);
    }

    #[test]
    fn test_hevc_types_and_record() {
        let vps = [0x40, 0x01, 0x0c];
        // Main profile, level 3 (90), as x265 writes it: escaped zero runs
        let sps = [
            0x42, 0x01, 0x01, 0x01, 0x60, 0x00, 0x00, 0x03, 0x00, 0x90, 0x00, 0x00, 0x03, 0x00,
            0x00, 0x03, 0x00, 0x5a, 0xa0,
        ];
        let pps = [0x44, 0x01, 0xc1];
        let idr = [0x26, 0x01, 0xaf];

        let stream = annex_b(&[&vps, &sps, &pps, &idr]);
        let mut sets = ParameterSets::default();
        let sample = prepare_video_sample(VideoCodecKind::H265, &stream, &mut sets);
        assert_eq!(sample.keyframe, Some(true));
        assert!(sets.is_complete(VideoCodecKind::H265));

        let record = VideoDecoderConfig::ParameterSets(sets).record(VideoCodecKind::H265);
        assert_eq!(record[0], 1);
        assert_eq!(record[1], 0x01);
        assert_eq!(&record[2..6], &[0x60, 0x00, 0x00, 0x00]);
        assert_eq!(&record[6..12], &[0x90, 0, 0, 0, 0, 0]);
        assert_eq!(record[12], 90);
        assert_eq!(record[21], 0x03);
        assert_eq!(record[22], 3);
        assert_eq!(record[23], 0x80 | 32);
    }
}
