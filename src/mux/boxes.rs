//! ISO base media file format box writers

use crate::config::VideoCodecKind;

/// Movie header timescale (milliseconds)
pub const MOVIE_TIMESCALE: u32 = 1000;

/// Size of the 64-bit `mdat` header written ahead of the first sample
pub const MDAT_HEADER_LEN: u64 = 16;

/// One sample already written to `mdat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    pub offset: u64,
    pub size: u32,
    /// Decode/presentation time in track ticks
    pub ticks: i64,
    pub sync: bool,
}

#[derive(Debug, Clone)]
pub enum TrackMedia {
    Video {
        codec: VideoCodecKind,
        width: u32,
        height: u32,
        /// `avcC` / `hvcC` payload, absent when the encoder never provided one
        config_record: Option<Vec<u8>>,
    },
    Audio {
        sample_rate: u32,
        channels: u16,
        audio_specific_config: Vec<u8>,
        bitrate: u32,
    },
}

/// Everything `moov` needs to know about one track
#[derive(Debug, Clone)]
pub struct TrackLayout<'a> {
    pub track_id: u32,
    pub media: TrackMedia,
    pub timescale: u32,
    /// Duration of the last sample, and of every sample without a successor gap
    pub default_duration: u32,
    pub samples: &'a [SampleInfo],
}

impl TrackLayout<'_> {
    fn first_ticks(&self) -> i64 {
        self.samples.first().map(|s| s.ticks).unwrap_or(0)
    }

    /// Per-sample durations: gap to the next sample, nominal for the last one
    pub fn durations(&self) -> Vec<u32> {
        let mut out: Vec<u32> = self
            .samples
            .windows(2)
            .map(|w| (w[1].ticks - w[0].ticks).clamp(1, u32::MAX as i64) as u32)
            .collect();
        if !self.samples.is_empty() {
            out.push(self.default_duration);
        }
        out
    }

    /// Media duration in track ticks
    pub fn media_duration(&self) -> u64 {
        self.durations().iter().map(|&d| d as u64).sum()
    }

    /// Presentation duration in movie ticks, including a leading empty edit
    pub fn movie_duration(&self) -> u64 {
        to_movie_ticks(self.first_ticks().max(0) as u64 + self.media_duration(), self.timescale)
    }
}

fn to_movie_ticks(ticks: u64, timescale: u32) -> u64 {
    let timescale = timescale.max(1) as u128;
    ((ticks as u128 * MOVIE_TIMESCALE as u128 + timescale / 2) / timescale) as u64
}

pub fn build_box(typ: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
    out.extend_from_slice(typ);
    out.extend_from_slice(payload);
    out
}

fn full_box(typ: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 4);
    body.push(version);
    body.extend_from_slice(&flags.to_be_bytes()[1..]);
    body.extend_from_slice(payload);
    build_box(typ, &body)
}

pub fn ftyp() -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(b"isom");
    payload.extend_from_slice(&0x200u32.to_be_bytes());
    payload.extend_from_slice(b"isomiso2mp41");
    build_box(b"ftyp", &payload)
}

/// Header of a 64-bit `mdat`; `size` includes the 16 header bytes
pub fn mdat_header(size: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..4].copy_from_slice(&1u32.to_be_bytes());
    out[4..8].copy_from_slice(b"mdat");
    out[8..].copy_from_slice(&size.to_be_bytes());
    out
}

const UNITY_MATRIX: [u32; 9] = [
    0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000,
];

pub fn moov(tracks: &[TrackLayout<'_>]) -> Vec<u8> {
    let duration = tracks.iter().map(|t| t.movie_duration()).max().unwrap_or(0);
    let next_track_id = tracks.iter().map(|t| t.track_id).max().unwrap_or(0) + 1;

    let mut payload = mvhd(duration, next_track_id);
    for track in tracks {
        payload.extend_from_slice(&trak(track));
    }
    build_box(b"moov", &payload)
}

fn mvhd(duration: u64, next_track_id: u32) -> Vec<u8> {
    let mut p = Vec::with_capacity(108);
    p.extend_from_slice(&0u64.to_be_bytes()); // creation + modification
    p.extend_from_slice(&MOVIE_TIMESCALE.to_be_bytes());
    p.extend_from_slice(&(duration.min(u32::MAX as u64) as u32).to_be_bytes());
    p.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
    p.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
    p.extend_from_slice(&[0u8; 10]);
    for v in UNITY_MATRIX {
        p.extend_from_slice(&v.to_be_bytes());
    }
    p.extend_from_slice(&[0u8; 24]); // pre_defined
    p.extend_from_slice(&next_track_id.to_be_bytes());
    full_box(b"mvhd", 0, 0, &p)
}

fn trak(track: &TrackLayout<'_>) -> Vec<u8> {
    let mut payload = tkhd(track);
    if track.first_ticks() > 0 {
        payload.extend_from_slice(&edts(track));
    }
    payload.extend_from_slice(&mdia(track));
    build_box(b"trak", &payload)
}

fn tkhd(track: &TrackLayout<'_>) -> Vec<u8> {
    let (volume, width, height) = match &track.media {
        TrackMedia::Video { width, height, .. } => (0u16, *width, *height),
        TrackMedia::Audio { .. } => (0x0100u16, 0, 0),
    };
    let mut p = Vec::with_capacity(84);
    p.extend_from_slice(&0u64.to_be_bytes()); // creation + modification
    p.extend_from_slice(&track.track_id.to_be_bytes());
    p.extend_from_slice(&0u32.to_be_bytes());
    p.extend_from_slice(&(track.movie_duration().min(u32::MAX as u64) as u32).to_be_bytes());
    p.extend_from_slice(&[0u8; 8]);
    p.extend_from_slice(&0u16.to_be_bytes()); // layer
    p.extend_from_slice(&0u16.to_be_bytes()); // alternate group
    p.extend_from_slice(&volume.to_be_bytes());
    p.extend_from_slice(&0u16.to_be_bytes());
    for v in UNITY_MATRIX {
        p.extend_from_slice(&v.to_be_bytes());
    }
    p.extend_from_slice(&(width << 16).to_be_bytes());
    p.extend_from_slice(&(height << 16).to_be_bytes());
    // enabled | in movie
    full_box(b"tkhd", 0, 0x3, &p)
}

fn edts(track: &TrackLayout<'_>) -> Vec<u8> {
    let lead = to_movie_ticks(track.first_ticks() as u64, track.timescale);
    let body = to_movie_ticks(track.media_duration(), track.timescale);
    let mut p = Vec::new();
    p.extend_from_slice(&2u32.to_be_bytes());
    // empty edit covering the lead-in
    p.extend_from_slice(&(lead as u32).to_be_bytes());
    p.extend_from_slice(&(-1i32).to_be_bytes());
    p.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    p.extend_from_slice(&(body as u32).to_be_bytes());
    p.extend_from_slice(&0i32.to_be_bytes());
    p.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    build_box(b"edts", &full_box(b"elst", 0, 0, &p))
}

fn mdia(track: &TrackLayout<'_>) -> Vec<u8> {
    let mut payload = mdhd(track);
    payload.extend_from_slice(&hdlr(&track.media));
    payload.extend_from_slice(&minf(track));
    build_box(b"mdia", &payload)
}

fn mdhd(track: &TrackLayout<'_>) -> Vec<u8> {
    let mut p = Vec::with_capacity(20);
    p.extend_from_slice(&0u64.to_be_bytes());
    p.extend_from_slice(&track.timescale.to_be_bytes());
    p.extend_from_slice(&(track.media_duration().min(u32::MAX as u64) as u32).to_be_bytes());
    p.extend_from_slice(&0x55c4u16.to_be_bytes()); // "und"
    p.extend_from_slice(&0u16.to_be_bytes());
    full_box(b"mdhd", 0, 0, &p)
}

fn hdlr(media: &TrackMedia) -> Vec<u8> {
    let (handler, name): (&[u8; 4], &[u8]) = match media {
        TrackMedia::Video { .. } => (b"vide", b"VideoHandler"),
        TrackMedia::Audio { .. } => (b"soun", b"SoundHandler"),
    };
    let mut p = Vec::new();
    p.extend_from_slice(&0u32.to_be_bytes());
    p.extend_from_slice(handler);
    p.extend_from_slice(&[0u8; 12]);
    p.extend_from_slice(name);
    p.push(0);
    full_box(b"hdlr", 0, 0, &p)
}

fn minf(track: &TrackLayout<'_>) -> Vec<u8> {
    let mut payload = match track.media {
        TrackMedia::Video { .. } => full_box(b"vmhd", 0, 1, &[0u8; 8]),
        TrackMedia::Audio { .. } => full_box(b"smhd", 0, 0, &[0u8; 4]),
    };
    let url = full_box(b"url ", 0, 1, &[]);
    let mut dref = 1u32.to_be_bytes().to_vec();
    dref.extend_from_slice(&url);
    payload.extend_from_slice(&build_box(b"dinf", &full_box(b"dref", 0, 0, &dref)));
    payload.extend_from_slice(&stbl(track));
    build_box(b"minf", &payload)
}

fn stbl(track: &TrackLayout<'_>) -> Vec<u8> {
    let mut payload = stsd(&track.media);
    payload.extend_from_slice(&stts(&track.durations()));
    payload.extend_from_slice(&stsc(track.samples.len()));
    payload.extend_from_slice(&stsz(track.samples));
    payload.extend_from_slice(&chunk_offsets(track.samples));
    if matches!(track.media, TrackMedia::Video { .. }) {
        payload.extend_from_slice(&stss(track.samples));
    }
    build_box(b"stbl", &payload)
}

fn stsd(media: &TrackMedia) -> Vec<u8> {
    let entry = match media {
        TrackMedia::Video {
            codec,
            width,
            height,
            config_record,
        } => visual_sample_entry(*codec, *width, *height, config_record.as_deref()),
        TrackMedia::Audio {
            sample_rate,
            channels,
            audio_specific_config,
            bitrate,
        } => mp4a(*sample_rate, *channels, audio_specific_config, *bitrate),
    };
    let mut p = 1u32.to_be_bytes().to_vec();
    p.extend_from_slice(&entry);
    full_box(b"stsd", 0, 0, &p)
}

fn visual_sample_entry(
    codec: VideoCodecKind,
    width: u32,
    height: u32,
    config_record: Option<&[u8]>,
) -> Vec<u8> {
    let mut p = Vec::with_capacity(86);
    p.extend_from_slice(&[0u8; 6]);
    p.extend_from_slice(&1u16.to_be_bytes()); // data reference index
    p.extend_from_slice(&[0u8; 16]);
    p.extend_from_slice(&(width.min(u16::MAX as u32) as u16).to_be_bytes());
    p.extend_from_slice(&(height.min(u16::MAX as u32) as u16).to_be_bytes());
    p.extend_from_slice(&0x0048_0000u32.to_be_bytes());
    p.extend_from_slice(&0x0048_0000u32.to_be_bytes());
    p.extend_from_slice(&0u32.to_be_bytes());
    p.extend_from_slice(&1u16.to_be_bytes()); // frame count
    p.extend_from_slice(&[0u8; 32]); // compressor name
    p.extend_from_slice(&0x0018u16.to_be_bytes());
    p.extend_from_slice(&0xffffu16.to_be_bytes());

    let (entry_type, config_type) = match codec {
        VideoCodecKind::H264 => (b"avc1", b"avcC"),
        VideoCodecKind::H265 => (b"hvc1", b"hvcC"),
    };
    if let Some(record) = config_record {
        p.extend_from_slice(&build_box(config_type, record));
    }
    build_box(entry_type, &p)
}

fn mp4a(sample_rate: u32, channels: u16, asc: &[u8], bitrate: u32) -> Vec<u8> {
    let mut p = Vec::with_capacity(64);
    p.extend_from_slice(&[0u8; 6]);
    p.extend_from_slice(&1u16.to_be_bytes());
    p.extend_from_slice(&[0u8; 8]);
    p.extend_from_slice(&channels.to_be_bytes());
    p.extend_from_slice(&16u16.to_be_bytes()); // sample size
    p.extend_from_slice(&0u16.to_be_bytes());
    p.extend_from_slice(&0u16.to_be_bytes());
    // 16.16 rate; rates above 65535 Hz do not fit and are written as 0
    let rate = if sample_rate <= u16::MAX as u32 { sample_rate << 16 } else { 0 };
    p.extend_from_slice(&rate.to_be_bytes());
    p.extend_from_slice(&esds(asc, bitrate));
    build_box(b"mp4a", &p)
}

fn esds(asc: &[u8], bitrate: u32) -> Vec<u8> {
    let mut dec_specific = vec![0x05, asc.len() as u8];
    dec_specific.extend_from_slice(asc);

    let mut dec_config = vec![0x04, (13 + dec_specific.len()) as u8];
    dec_config.push(0x40); // MPEG-4 audio
    dec_config.push(0x15); // audio stream
    dec_config.extend_from_slice(&[0, 0, 0]); // buffer size
    dec_config.extend_from_slice(&bitrate.to_be_bytes()); // max
    dec_config.extend_from_slice(&bitrate.to_be_bytes()); // avg
    dec_config.extend_from_slice(&dec_specific);

    let sl_config = [0x06, 0x01, 0x02];

    let mut es = vec![0x03, (3 + dec_config.len() + sl_config.len()) as u8];
    es.extend_from_slice(&1u16.to_be_bytes()); // ES id
    es.push(0);
    es.extend_from_slice(&dec_config);
    es.extend_from_slice(&sl_config);
    full_box(b"esds", 0, 0, &es)
}

fn stts(durations: &[u32]) -> Vec<u8> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for &d in durations {
        match runs.last_mut() {
            Some((count, delta)) if *delta == d => *count += 1,
            _ => runs.push((1, d)),
        }
    }
    let mut p = (runs.len() as u32).to_be_bytes().to_vec();
    for (count, delta) in runs {
        p.extend_from_slice(&count.to_be_bytes());
        p.extend_from_slice(&delta.to_be_bytes());
    }
    full_box(b"stts", 0, 0, &p)
}

fn stsc(sample_count: usize) -> Vec<u8> {
    // one sample per chunk
    let mut p = Vec::new();
    if sample_count == 0 {
        p.extend_from_slice(&0u32.to_be_bytes());
    } else {
        p.extend_from_slice(&1u32.to_be_bytes());
        p.extend_from_slice(&1u32.to_be_bytes());
        p.extend_from_slice(&1u32.to_be_bytes());
        p.extend_from_slice(&1u32.to_be_bytes());
    }
    full_box(b"stsc", 0, 0, &p)
}

fn stsz(samples: &[SampleInfo]) -> Vec<u8> {
    let mut p = Vec::with_capacity(8 + samples.len() * 4);
    p.extend_from_slice(&0u32.to_be_bytes());
    p.extend_from_slice(&(samples.len() as u32).to_be_bytes());
    for s in samples {
        p.extend_from_slice(&s.size.to_be_bytes());
    }
    full_box(b"stsz", 0, 0, &p)
}

fn chunk_offsets(samples: &[SampleInfo]) -> Vec<u8> {
    let wide = samples.iter().any(|s| s.offset > u32::MAX as u64);
    let mut p = (samples.len() as u32).to_be_bytes().to_vec();
    for s in samples {
        if wide {
            p.extend_from_slice(&s.offset.to_be_bytes());
        } else {
            p.extend_from_slice(&(s.offset as u32).to_be_bytes());
        }
    }
    if wide {
        full_box(b"co64", 0, 0, &p)
    } else {
        full_box(b"stco", 0, 0, &p)
    }
}

fn stss(samples: &[SampleInfo]) -> Vec<u8> {
    let sync: Vec<u32> = samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.sync)
        .map(|(i, _)| i as u32 + 1)
        .collect();
    let mut p = (sync.len() as u32).to_be_bytes().to_vec();
    for index in sync {
        p.extend_from_slice(&index.to_be_bytes());
    }
    full_box(b"stss", 0, 0, &p)
}

/// AAC-LC AudioSpecificConfig for a sample rate and channel count
pub fn aac_audio_specific_config(sample_rate: u32, channels: u16) -> Vec<u8> {
    const AAC_LC: u8 = 2;
    let sfi: u8 = match sample_rate {
        96000 => 0,
        88200 => 1,
        64000 => 2,
        48000 => 3,
        44100 => 4,
        32000 => 5,
        24000 => 6,
        22050 => 7,
        16000 => 8,
        12000 => 9,
        11025 => 10,
        8000 => 11,
        _ => 4,
    };
    let chan = (channels.min(7)) as u8;
    vec![(AAC_LC << 3) | (sfi >> 1), ((sfi & 1) << 7) | (chan << 3)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ticks: i64, sync: bool) -> SampleInfo {
        SampleInfo {
            offset: 48,
            size: 10,
            ticks,
            sync,
        }
    }

    #[test]
    fn test_durations_fill_gaps() {
        let samples = [sample(0, true), sample(1, false), sample(3, false)];
        let layout = TrackLayout {
            track_id: 1,
            media: TrackMedia::Video {
                codec: VideoCodecKind::H264,
                width: 64,
                height: 64,
                config_record: None,
            },
            timescale: 30,
            default_duration: 1,
            samples: &samples,
        };
        assert_eq!(layout.durations(), vec![1, 2, 1]);
        assert_eq!(layout.media_duration(), 4);
        // 4 / 30 s = 133.3ms
        assert_eq!(layout.movie_duration(), 133);
    }

    #[test]
    fn test_stts_run_length() {
        let body = stts(&[1, 1, 1, 2, 1]);
        // header(12) + entry_count(4) + 3 runs * 8
        assert_eq!(body.len(), 12 + 4 + 24);
        assert_eq!(&body[12..16], &3u32.to_be_bytes());
        assert_eq!(&body[16..24], &[0, 0, 0, 3, 0, 0, 0, 1]);
    }

    #[test]
    fn test_audio_specific_config() {
        assert_eq!(aac_audio_specific_config(48000, 2), vec![0x11, 0x90]);
        assert_eq!(aac_audio_specific_config(44100, 2), vec![0x12, 0x10]);
        assert_eq!(aac_audio_specific_config(44100, 1), vec![0x12, 0x08]);
    }

    #[test]
    fn test_stss_is_one_based() {
        let samples = [sample(0, true), sample(1, false), sample(2, true)];
        let body = stss(&samples);
        assert_eq!(&body[12..16], &2u32.to_be_bytes());
        assert_eq!(&body[16..20], &1u32.to_be_bytes());
        assert_eq!(&body[20..24], &3u32.to_be_bytes());
    }

    #[test]
    fn test_wide_offsets_switch_to_co64() {
        let mut far = sample(0, true);
        far.offset = u32::MAX as u64 + 10;
        let body = chunk_offsets(&[far]);
        assert_eq!(&body[4..8], b"co64");
        assert_eq!(body.len(), 12 + 4 + 8);
    }
}
