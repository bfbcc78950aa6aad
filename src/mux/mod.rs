//! Streaming MP4 muxer
//!
//! Samples are appended to a single 64-bit `mdat` as they arrive (one sample
//! per chunk); the `moov` index is written once at [`Mp4Muxer::finalize`].
//! A file cut short before finalize holds the data but no index.

mod boxes;
mod nal;

pub use boxes::aac_audio_specific_config;
pub use nal::{AnnexBNals, ParameterSets, VideoDecoderConfig};

use std::fs::File;
use std::io::{self, Cursor, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::VideoCodecKind;
use crate::error::{ContainerInitError, FinalizeError, UnitProcessingError};
use crate::media::{Rational, Timestamp, Track};
use boxes::{SampleInfo, TrackLayout, TrackMedia, MDAT_HEADER_LEN};

/// Seekable byte sink the muxer writes into
pub trait OutputStream: Write + Seek {
    /// Drop everything past `len` bytes
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl OutputStream for Cursor<Vec<u8>> {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.get_mut().truncate(len as usize);
        Ok(())
    }
}

/// Output file that remembers its path so an aborted session can remove it
#[derive(Debug)]
pub struct FileOutput {
    file: File,
    path: PathBuf,
}

impl FileOutput {
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::create(path)?,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for FileOutput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl OutputStream for FileOutput {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }
}

#[derive(Debug, Clone)]
pub struct VideoTrackConfig {
    pub codec: VideoCodecKind,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Codec extradata (Annex-B parameter sets or a packed record)
    pub extradata: Option<Vec<u8>>,
    /// Periodic keyframe fallback for units without a codec flag
    pub keyframe_interval: u32,
}

#[derive(Debug, Clone)]
pub struct AudioTrackConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples_per_frame: u32,
    /// AAC AudioSpecificConfig
    pub extradata: Option<Vec<u8>>,
    pub bitrate: u32,
}

#[derive(Debug, Clone)]
pub struct MuxerConfig {
    pub video: VideoTrackConfig,
    pub audio: Option<AudioTrackConfig>,
}

impl MuxerConfig {
    fn validate(&self) -> Result<(), ContainerInitError> {
        let invalid = |track, reason: &str| ContainerInitError::InvalidTrack {
            track,
            reason: reason.to_string(),
        };
        let v = &self.video;
        if v.width == 0 || v.height == 0 {
            return Err(invalid(Track::Video, "zero dimension"));
        }
        if v.width > u16::MAX as u32 || v.height > u16::MAX as u32 {
            return Err(invalid(Track::Video, "dimension exceeds 65535"));
        }
        if v.frame_rate == 0 {
            return Err(invalid(Track::Video, "zero frame rate"));
        }
        if let Some(a) = &self.audio {
            if a.sample_rate == 0 {
                return Err(invalid(Track::Audio, "zero sample rate"));
            }
            if a.channels == 0 {
                return Err(invalid(Track::Audio, "zero channels"));
            }
            if a.samples_per_frame == 0 {
                return Err(invalid(Track::Audio, "zero samples per frame"));
            }
        }
        Ok(())
    }
}

/// What finalize produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxSummary {
    pub video_samples: usize,
    pub audio_samples: usize,
    pub video_duration: Timestamp,
    pub audio_duration: Timestamp,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MuxState {
    /// Nothing written yet
    Fresh,
    /// Header and `mdat` open
    Writing,
    Finalized,
    /// The output could not be repositioned after a failed write
    Broken,
}

struct VideoTrack {
    config: VideoTrackConfig,
    time_base: Rational,
    decoder_config: Option<VideoDecoderConfig>,
    parameter_sets: ParameterSets,
    samples: Vec<SampleInfo>,
}

struct AudioTrack {
    config: AudioTrackConfig,
    time_base: Rational,
    audio_specific_config: Vec<u8>,
    samples: Vec<SampleInfo>,
}

/// MP4 writer for one video track and an optional audio track
pub struct Mp4Muxer<W: OutputStream> {
    out: W,
    state: MuxState,
    mdat_start: u64,
    mdat_end: u64,
    file_size: u64,
    video: VideoTrack,
    audio: Option<AudioTrack>,
}

impl Mp4Muxer<FileOutput> {
    /// Create the output file and declare the tracks
    pub fn create(path: &Path, config: MuxerConfig) -> Result<Self, ContainerInitError> {
        config.validate()?;
        let out = FileOutput::create(path).map_err(|source| ContainerInitError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = ?path, codec = %config.video.codec, "Opened MP4 output");
        Self::new(out, config)
    }

    /// Remove the output file of a session that never started
    pub fn discard(self) -> io::Result<()> {
        let path = self.out.path.clone();
        drop(self);
        std::fs::remove_file(&path)?;
        debug!(path = ?path, "Discarded output file");
        Ok(())
    }
}

impl<W: OutputStream> Mp4Muxer<W> {
    pub fn new(out: W, config: MuxerConfig) -> Result<Self, ContainerInitError> {
        config.validate()?;

        let decoder_config = config
            .video
            .extradata
            .as_deref()
            .and_then(|data| VideoDecoderConfig::from_extradata(config.video.codec, data));
        let video = VideoTrack {
            time_base: Rational::new(1, config.video.frame_rate as i64),
            decoder_config,
            parameter_sets: ParameterSets::default(),
            samples: Vec::new(),
            config: config.video,
        };

        let audio = config.audio.map(|audio| AudioTrack {
            time_base: Rational::new(1, audio.sample_rate as i64),
            audio_specific_config: audio
                .extradata
                .clone()
                .filter(|asc| asc.len() >= 2)
                .unwrap_or_else(|| aac_audio_specific_config(audio.sample_rate, audio.channels)),
            samples: Vec::new(),
            config: audio,
        });

        Ok(Self {
            out,
            state: MuxState::Fresh,
            mdat_start: 0,
            mdat_end: 0,
            file_size: 0,
            video,
            audio,
        })
    }

    /// Bytes of the container so far
    pub fn bytes_written(&self) -> u64 {
        self.file_size
    }

    pub fn video_samples(&self) -> usize {
        self.video.samples.len()
    }

    pub fn audio_samples(&self) -> usize {
        self.audio.as_ref().map(|a| a.samples.len()).unwrap_or(0)
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn check_writable(&self) -> Result<(), UnitProcessingError> {
        match self.state {
            MuxState::Finalized => Err(UnitProcessingError::Finalized),
            MuxState::Broken => Err(UnitProcessingError::StreamBroken),
            MuxState::Fresh | MuxState::Writing => Ok(()),
        }
    }

    fn check_ticks(
        track: Track,
        ticks: i64,
        previous: Option<&SampleInfo>,
    ) -> Result<(), UnitProcessingError> {
        let previous = previous.map(|s| s.ticks).unwrap_or(-1);
        if ticks <= previous {
            return Err(UnitProcessingError::NonMonotonicTimestamp {
                track,
                ticks,
                previous,
            });
        }
        Ok(())
    }

    /// Append one video access unit at `timestamp`
    pub fn write_video_unit(
        &mut self,
        data: &[u8],
        timestamp: Timestamp,
        keyframe: Option<bool>,
    ) -> Result<(), UnitProcessingError> {
        self.check_writable()?;
        if data.is_empty() {
            return Err(UnitProcessingError::EmptyBuffer(Track::Video));
        }
        let ticks = timestamp.to_ticks(self.video.time_base);
        Self::check_ticks(Track::Video, ticks, self.video.samples.last())?;

        let codec = self.video.config.codec;
        let prepared = nal::prepare_video_sample(codec, data, &mut self.video.parameter_sets);
        let sync = match keyframe.or(prepared.keyframe) {
            Some(flag) => flag,
            None => {
                let n = self.video.samples.len() as u64;
                let interval = self.video.config.keyframe_interval.max(1) as u64;
                n % interval == 0
            }
        };
        let size = u32::try_from(prepared.data.len())
            .map_err(|_| UnitProcessingError::UnitTooLarge(Track::Video))?;

        let offset = self.append(Track::Video, &prepared.data)?;

        if self.video.decoder_config.is_none() && self.video.parameter_sets.is_complete(codec) {
            debug!("Video decoder configuration taken from in-band parameter sets");
            self.video.decoder_config = Some(VideoDecoderConfig::ParameterSets(
                self.video.parameter_sets.clone(),
            ));
        }
        self.video.samples.push(SampleInfo {
            offset,
            size,
            ticks,
            sync,
        });
        Ok(())
    }

    /// Append one audio access unit at `timestamp`
    pub fn write_audio_unit(
        &mut self,
        data: &[u8],
        timestamp: Timestamp,
    ) -> Result<(), UnitProcessingError> {
        self.check_writable()?;
        let Some(audio) = self.audio.as_ref() else {
            return Err(UnitProcessingError::TrackNotConfigured(Track::Audio));
        };
        if data.is_empty() {
            return Err(UnitProcessingError::EmptyBuffer(Track::Audio));
        }
        let ticks = timestamp.to_ticks(audio.time_base);
        Self::check_ticks(Track::Audio, ticks, audio.samples.last())?;
        let size = u32::try_from(data.len())
            .map_err(|_| UnitProcessingError::UnitTooLarge(Track::Audio))?;

        let offset = self.append(Track::Audio, data)?;

        if let Some(audio) = self.audio.as_mut() {
            audio.samples.push(SampleInfo {
                offset,
                size,
                ticks,
                sync: true,
            });
        }
        Ok(())
    }

    /// Write the header on first use, then `data` at the end of `mdat`.
    /// Returns the absolute offset of `data`.
    fn append(&mut self, track: Track, data: &[u8]) -> Result<u64, UnitProcessingError> {
        if self.state == MuxState::Fresh {
            let mut header = boxes::ftyp();
            let mdat_start = header.len() as u64;
            header.extend_from_slice(&boxes::mdat_header(0));
            if let Err(source) = self.out.write_all(&header) {
                self.recover(0);
                return Err(UnitProcessingError::Io { track, source });
            }
            self.mdat_start = mdat_start;
            self.mdat_end = mdat_start + MDAT_HEADER_LEN;
            self.state = MuxState::Writing;
            debug!("Wrote container header");
        }

        let offset = self.mdat_end;
        if let Err(source) = self.out.write_all(data) {
            self.recover(offset);
            return Err(UnitProcessingError::Io { track, source });
        }
        self.mdat_end += data.len() as u64;
        self.file_size = self.mdat_end;
        Ok(offset)
    }

    /// Rewind to the last good position after a failed write, or give up on
    /// the stream when that is impossible
    fn recover(&mut self, position: u64) {
        if let Err(e) = self.out.seek(SeekFrom::Start(position)) {
            warn!(error = %e, "Output stream could not be rewound, marking it broken");
            self.state = MuxState::Broken;
        }
    }

    /// Write the `moov` index and close the file for writing.
    ///
    /// With nothing written this produces `ftyp` plus an empty `moov`.
    pub fn finalize(&mut self) -> Result<MuxSummary, FinalizeError> {
        match self.state {
            MuxState::Finalized => return Err(FinalizeError::AlreadyFinalized),
            MuxState::Broken => return Err(FinalizeError::StreamBroken),
            MuxState::Fresh | MuxState::Writing => {}
        }

        let result = self.write_trailer();
        self.state = if result.is_ok() {
            MuxState::Finalized
        } else {
            MuxState::Broken
        };
        let file_size = result?;
        self.file_size = file_size;

        let summary = MuxSummary {
            video_samples: self.video.samples.len(),
            audio_samples: self.audio_samples(),
            video_duration: self.track_duration(Track::Video),
            audio_duration: self.track_duration(Track::Audio),
            bytes_written: file_size,
        };
        info!(
            video_samples = summary.video_samples,
            audio_samples = summary.audio_samples,
            bytes = summary.bytes_written,
            "Finalized MP4"
        );
        Ok(summary)
    }

    fn write_trailer(&mut self) -> Result<u64, FinalizeError> {
        let moov_start = match self.state {
            MuxState::Fresh => {
                self.out.seek(SeekFrom::Start(0))?;
                let header = boxes::ftyp();
                self.out.write_all(&header)?;
                header.len() as u64
            }
            _ => {
                let mdat_size = self.mdat_end - self.mdat_start;
                self.out.seek(SeekFrom::Start(self.mdat_start))?;
                self.out.write_all(&boxes::mdat_header(mdat_size))?;
                self.out.seek(SeekFrom::Start(self.mdat_end))?;
                self.mdat_end
            }
        };

        let moov = boxes::moov(&self.layouts());
        self.out.write_all(&moov)?;
        self.out.flush()?;

        let end = moov_start + moov.len() as u64;
        self.out.truncate(end)?;
        Ok(end)
    }

    fn layouts(&self) -> Vec<TrackLayout<'_>> {
        let video = &self.video;
        let mut layouts = vec![TrackLayout {
            track_id: 1,
            media: TrackMedia::Video {
                codec: video.config.codec,
                width: video.config.width,
                height: video.config.height,
                config_record: video
                    .decoder_config
                    .as_ref()
                    .map(|c| c.record(video.config.codec)),
            },
            timescale: video.config.frame_rate,
            default_duration: 1,
            samples: &video.samples,
        }];

        if let Some(audio) = &self.audio {
            layouts.push(TrackLayout {
                track_id: 2,
                media: TrackMedia::Audio {
                    sample_rate: audio.config.sample_rate,
                    channels: audio.config.channels,
                    audio_specific_config: audio.audio_specific_config.clone(),
                    bitrate: audio.config.bitrate,
                },
                timescale: audio.config.sample_rate,
                default_duration: audio.config.samples_per_frame,
                samples: &audio.samples,
            });
        }
        layouts
    }

    /// Media duration of a track as exact milliseconds
    pub fn track_duration(&self, track: Track) -> Timestamp {
        let layouts = self.layouts();
        let index = match track {
            Track::Video => 0,
            Track::Audio => 1,
        };
        layouts
            .get(index)
            .map(|l| {
                Timestamp::from_ticks(
                    l.media_duration() as i64,
                    Rational::new(1, l.timescale as i64),
                )
            })
            .unwrap_or(Timestamp::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mp4::{find_box, parse_boxes, read_tracks};

    const SPS: [u8; 6] = [0x67, 0x64, 0x00, 0x28, 0xac, 0xd9];
    const PPS: [u8; 4] = [0x68, 0xeb, 0xe3, 0xcb];

    fn extradata() -> Vec<u8> {
        [&[0, 0, 0, 1][..], &SPS, &[0, 0, 0, 1], &PPS].concat()
    }

    fn config(audio: bool) -> MuxerConfig {
        MuxerConfig {
            video: VideoTrackConfig {
                codec: VideoCodecKind::H264,
                width: 64,
                height: 48,
                frame_rate: 30,
                extradata: Some(extradata()),
                keyframe_interval: 30,
            },
            audio: audio.then(|| AudioTrackConfig {
                sample_rate: 48000,
                channels: 2,
                samples_per_frame: 1024,
                extradata: None,
                bitrate: 128_000,
            }),
        }
    }

    fn idr() -> Vec<u8> {
        vec![0, 0, 0, 1, 0x65, 0x88, 0x84, 0x21]
    }

    fn p_slice() -> Vec<u8> {
        vec![0, 0, 0, 1, 0x41, 0x9a, 0x02, 0x33]
    }

    #[test]
    fn test_empty_container_is_well_formed() {
        let mut muxer = Mp4Muxer::new(Cursor::new(Vec::new()), config(true)).unwrap();
        let summary = muxer.finalize().unwrap();
        assert_eq!(summary.video_samples, 0);

        let bytes = muxer.into_inner().into_inner();
        let top = parse_boxes(&bytes);
        let types: Vec<&[u8; 4]> = top.iter().map(|b| &b.typ).collect();
        assert_eq!(types, vec![b"ftyp", b"moov"]);
        assert_eq!(summary.bytes_written, bytes.len() as u64);

        let tracks = read_tracks(&bytes);
        assert_eq!(tracks.len(), 2);
        assert!(tracks.iter().all(|t| t.sample_count == 0));
    }

    #[test]
    fn test_video_and_audio_samples() {
        let mut muxer = Mp4Muxer::new(Cursor::new(Vec::new()), config(true)).unwrap();
        for i in 0..10u64 {
            let data = if i == 0 { idr() } else { p_slice() };
            muxer
                .write_video_unit(&data, Timestamp::from_frame_index(i, 30), Some(i == 0))
                .unwrap();
            muxer
                .write_audio_unit(&[0x21, 0x10, i as u8], Timestamp::from_sample_count(i * 1024, 48000))
                .unwrap();
        }
        let summary = muxer.finalize().unwrap();
        assert_eq!(summary.video_duration, Timestamp::from_frame_index(10, 30));
        assert_eq!(summary.audio_duration, Timestamp::from_sample_count(10 * 1024, 48000));

        let bytes = muxer.into_inner().into_inner();
        let top = parse_boxes(&bytes);
        assert!(find_box(&top, b"mdat").is_some());

        let tracks = read_tracks(&bytes);
        let video = &tracks[0];
        assert_eq!(video.handler, *b"vide");
        assert_eq!(video.timescale, 30);
        assert_eq!(video.sample_count, 10);
        assert_eq!(video.sample_deltas, vec![1; 10]);
        assert_eq!(video.sync_samples, Some(vec![1]));
        assert_eq!(video.sample_entry, *b"avc1");

        let audio = &tracks[1];
        assert_eq!(audio.handler, *b"soun");
        assert_eq!(audio.timescale, 48000);
        assert_eq!(audio.sample_deltas, vec![1024; 10]);
        assert_eq!(audio.media_duration, 10 * 1024);
        assert_eq!(audio.sample_entry, *b"mp4a");

        // the first video sample is length-prefixed inside mdat
        let first = video.chunk_offsets[0] as usize;
        assert_eq!(&bytes[first..first + 4], &4u32.to_be_bytes());
        assert_eq!(bytes[first + 4], 0x65);
    }

    #[test]
    fn test_gap_extends_previous_duration() {
        let mut muxer = Mp4Muxer::new(Cursor::new(Vec::new()), config(false)).unwrap();
        for i in [0u64, 1, 3, 4] {
            muxer
                .write_video_unit(&p_slice(), Timestamp::from_frame_index(i, 30), Some(i == 0))
                .unwrap();
        }
        muxer.finalize().unwrap();
        let tracks = read_tracks(&muxer.into_inner().into_inner());
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].sample_deltas, vec![1, 2, 1, 1]);
        assert_eq!(tracks[0].media_duration, 5);
    }

    #[test]
    fn test_non_monotonic_timestamp_is_rejected() {
        let mut muxer = Mp4Muxer::new(Cursor::new(Vec::new()), config(false)).unwrap();
        let ts = Timestamp::from_frame_index(5, 30);
        muxer.write_video_unit(&idr(), ts, Some(true)).unwrap();
        let err = muxer.write_video_unit(&p_slice(), ts, None).unwrap_err();
        assert!(matches!(
            err,
            UnitProcessingError::NonMonotonicTimestamp { ticks: 5, previous: 5, .. }
        ));
        // still usable afterwards
        muxer
            .write_video_unit(&p_slice(), Timestamp::from_frame_index(6, 30), Some(false))
            .unwrap();
        assert_eq!(muxer.video_samples(), 2);
    }

    #[test]
    fn test_periodic_keyframe_fallback_only_without_flag() {
        let mut cfg = config(false);
        cfg.video.keyframe_interval = 3;
        let mut muxer = Mp4Muxer::new(Cursor::new(Vec::new()), cfg).unwrap();
        // opaque (already length-prefixed) payloads carry no NAL information
        let opaque = [0, 0, 0, 2, 0x41, 0x00];
        for i in 0..7u64 {
            let flag = if i == 5 { Some(true) } else { None };
            muxer
                .write_video_unit(&opaque, Timestamp::from_frame_index(i, 30), flag)
                .unwrap();
        }
        muxer.finalize().unwrap();
        let tracks = read_tracks(&muxer.into_inner().into_inner());
        assert_eq!(tracks[0].sync_samples, Some(vec![1, 4, 6, 7]));
    }

    #[test]
    fn test_writes_after_finalize_fail() {
        let mut muxer = Mp4Muxer::new(Cursor::new(Vec::new()), config(true)).unwrap();
        muxer.finalize().unwrap();
        assert!(matches!(
            muxer.write_video_unit(&idr(), Timestamp::ZERO, Some(true)),
            Err(UnitProcessingError::Finalized)
        ));
        assert!(matches!(
            muxer.finalize(),
            Err(FinalizeError::AlreadyFinalized)
        ));
    }

    #[test]
    fn test_audio_without_track_is_rejected() {
        let mut muxer = Mp4Muxer::new(Cursor::new(Vec::new()), config(false)).unwrap();
        assert!(matches!(
            muxer.write_audio_unit(&[1, 2], Timestamp::ZERO),
            Err(UnitProcessingError::TrackNotConfigured(Track::Audio))
        ));
    }

    #[test]
    fn test_invalid_track_parameters() {
        let mut cfg = config(true);
        cfg.video.frame_rate = 0;
        assert!(matches!(
            Mp4Muxer::new(Cursor::new(Vec::new()), cfg),
            Err(ContainerInitError::InvalidTrack { track: Track::Video, .. })
        ));

        let mut cfg = config(true);
        if let Some(audio) = cfg.audio.as_mut() {
            audio.channels = 0;
        }
        assert!(matches!(
            Mp4Muxer::new(Cursor::new(Vec::new()), cfg),
            Err(ContainerInitError::InvalidTrack { track: Track::Audio, .. })
        ));
    }

    #[test]
    fn test_unwritable_path_fails_to_open() {
        let path = std::env::temp_dir()
            .join(format!("castrec-missing-{}", uuid::Uuid::new_v4()))
            .join("out.mp4");
        assert!(matches!(
            Mp4Muxer::create(&path, config(true)),
            Err(ContainerInitError::Open { .. })
        ));
    }

    /// Sink that fails a chosen write call and optionally refuses to seek
    struct FlakySink {
        inner: Cursor<Vec<u8>>,
        fail_write: Option<usize>,
        writes: usize,
        seek_broken: bool,
    }

    impl Write for FlakySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.writes += 1;
            if Some(self.writes) == self.fail_write {
                // half of the payload lands before the error
                self.inner.write_all(&buf[..buf.len() / 2])?;
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FlakySink {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            if self.seek_broken {
                return Err(io::Error::new(io::ErrorKind::Other, "not seekable"));
            }
            self.inner.seek(pos)
        }
    }

    impl OutputStream for FlakySink {
        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.inner.get_mut().truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn test_failed_write_rewinds_and_stays_usable() {
        let sink = FlakySink {
            inner: Cursor::new(Vec::new()),
            // 1: header, 2: first sample, 3: second sample fails
            fail_write: Some(3),
            writes: 0,
            seek_broken: false,
        };
        let mut muxer = Mp4Muxer::new(sink, config(false)).unwrap();
        muxer
            .write_video_unit(&idr(), Timestamp::from_frame_index(0, 30), Some(true))
            .unwrap();
        assert!(matches!(
            muxer.write_video_unit(&p_slice(), Timestamp::from_frame_index(1, 30), Some(false)),
            Err(UnitProcessingError::Io { .. })
        ));
        muxer
            .write_video_unit(&p_slice(), Timestamp::from_frame_index(2, 30), Some(false))
            .unwrap();
        muxer.finalize().unwrap();

        let bytes = muxer.into_inner().inner.into_inner();
        let tracks = read_tracks(&bytes);
        assert_eq!(tracks[0].sample_count, 2);
        assert_eq!(tracks[0].sample_deltas, vec![2, 1]);
        // the second sample directly follows the first
        assert_eq!(
            tracks[0].chunk_offsets[1],
            tracks[0].chunk_offsets[0] + tracks[0].sample_sizes[0] as u64
        );
    }

    #[test]
    fn test_unrecoverable_stream_fails_identically() {
        let sink = FlakySink {
            inner: Cursor::new(Vec::new()),
            fail_write: Some(2),
            writes: 0,
            seek_broken: true,
        };
        let mut muxer = Mp4Muxer::new(sink, config(false)).unwrap();
        assert!(matches!(
            muxer.write_video_unit(&idr(), Timestamp::ZERO, Some(true)),
            Err(UnitProcessingError::Io { .. })
        ));
        for i in 1..3u64 {
            assert!(matches!(
                muxer.write_video_unit(&p_slice(), Timestamp::from_frame_index(i, 30), None),
                Err(UnitProcessingError::StreamBroken)
            ));
        }
        assert!(matches!(muxer.finalize(), Err(FinalizeError::StreamBroken)));
    }

    #[test]
    fn test_file_output_and_discard() {
        let path = std::env::temp_dir().join(format!("castrec-mux-{}.mp4", uuid::Uuid::new_v4()));
        let mut muxer = Mp4Muxer::create(&path, config(true)).unwrap();
        muxer
            .write_video_unit(&idr(), Timestamp::ZERO, Some(true))
            .unwrap();
        let summary = muxer.finalize().unwrap();
        let on_disk = std::fs::metadata(&path).unwrap().len();
        assert_eq!(on_disk, summary.bytes_written);

        let muxer = Mp4Muxer::create(&path, config(true)).unwrap();
        muxer.discard().unwrap();
        assert!(!path.exists());
    }
}
