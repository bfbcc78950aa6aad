//! Minimal MP4 reader for assertions on muxer output

#[derive(Debug, Clone)]
pub struct Mp4Box {
    pub typ: [u8; 4],
    pub offset: usize,
    pub size: usize,
    pub header: usize,
}

impl Mp4Box {
    pub fn payload<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.offset + self.header..self.offset + self.size]
    }
}

/// Parse sibling boxes laid out back to back in `data`
pub fn parse_boxes(data: &[u8]) -> Vec<Mp4Box> {
    let mut boxes = Vec::new();
    let mut offset = 0usize;
    while offset + 8 <= data.len() {
        let size32 = be_u32(&data[offset..offset + 4]) as usize;
        let mut typ = [0u8; 4];
        typ.copy_from_slice(&data[offset + 4..offset + 8]);
        let (size, header) = match size32 {
            1 => (be_u64(&data[offset + 8..offset + 16]) as usize, 16),
            0 => (data.len() - offset, 8),
            n => (n, 8),
        };
        assert!(size >= header, "box {:?} too small", typ);
        assert!(offset + size <= data.len(), "box {:?} overruns its parent", typ);
        boxes.push(Mp4Box {
            typ,
            offset,
            size,
            header,
        });
        offset += size;
    }
    assert_eq!(offset, data.len(), "trailing bytes after last box");
    boxes
}

pub fn find_box<'a>(boxes: &'a [Mp4Box], typ: &[u8; 4]) -> Option<&'a Mp4Box> {
    boxes.iter().find(|b| &b.typ == typ)
}

/// Payload of the box reached by following `path` from `data`
pub fn descend<'a>(data: &'a [u8], path: &[&[u8; 4]]) -> Option<&'a [u8]> {
    let mut current = data;
    for typ in path {
        let boxes = parse_boxes(current);
        let found = find_box(&boxes, typ)?;
        current = found.payload(current);
    }
    Some(current)
}

pub fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

pub fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

pub fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Sample table of one `trak`, flattened
#[derive(Debug, Clone)]
pub struct TrackSummary {
    pub track_id: u32,
    pub handler: [u8; 4],
    pub timescale: u32,
    pub media_duration: u64,
    pub sample_entry: [u8; 4],
    /// Child boxes of the sample entry (e.g. `avcC`, `esds`)
    pub sample_entry_children: Vec<[u8; 4]>,
    pub sample_count: usize,
    pub sample_deltas: Vec<u32>,
    pub sample_sizes: Vec<u32>,
    pub chunk_offsets: Vec<u64>,
    pub sync_samples: Option<Vec<u32>>,
}

impl TrackSummary {
    /// Decode times of every sample, in track ticks
    pub fn decode_times(&self) -> Vec<u64> {
        let mut t = 0u64;
        self.sample_deltas
            .iter()
            .map(|d| {
                let at = t;
                t += *d as u64;
                at
            })
            .collect()
    }
}

/// Read every track of a complete file
pub fn read_tracks(data: &[u8]) -> Vec<TrackSummary> {
    let top = parse_boxes(data);
    let moov = find_box(&top, b"moov").expect("moov box");
    let moov_payload = moov.payload(data);
    parse_boxes(moov_payload)
        .iter()
        .filter(|b| &b.typ == b"trak")
        .map(|trak| read_track(trak.payload(moov_payload)))
        .collect()
}

fn read_track(trak: &[u8]) -> TrackSummary {
    let tkhd = descend(trak, &[b"tkhd"]).expect("tkhd");
    let track_id = be_u32(&tkhd[12..16]);

    let mdhd = descend(trak, &[b"mdia", b"mdhd"]).expect("mdhd");
    let timescale = be_u32(&mdhd[12..16]);
    let media_duration = be_u32(&mdhd[16..20]) as u64;

    let hdlr = descend(trak, &[b"mdia", b"hdlr"]).expect("hdlr");
    let mut handler = [0u8; 4];
    handler.copy_from_slice(&hdlr[8..12]);

    let stbl = descend(trak, &[b"mdia", b"minf", b"stbl"]).expect("stbl");
    let boxes = parse_boxes(stbl);
    let payload = |typ: &[u8; 4]| find_box(&boxes, typ).map(|b| b.payload(stbl));

    let stsd = payload(b"stsd").expect("stsd");
    let entries = parse_boxes(&stsd[8..]);
    let entry = entries.first().expect("sample entry");
    let entry_payload = entry.payload(&stsd[8..]);
    // visual entries carry 78 bytes of fields, audio entries 28
    let fields = if &entry.typ == b"mp4a" { 28 } else { 78 };
    let sample_entry_children = parse_boxes(&entry_payload[fields..])
        .iter()
        .map(|b| b.typ)
        .collect();

    let stts = payload(b"stts").expect("stts");
    let mut sample_deltas = Vec::new();
    let runs = be_u32(&stts[4..8]) as usize;
    for i in 0..runs {
        let at = 8 + i * 8;
        let count = be_u32(&stts[at..at + 4]);
        let delta = be_u32(&stts[at + 4..at + 8]);
        sample_deltas.extend(std::iter::repeat(delta).take(count as usize));
    }

    let stsz = payload(b"stsz").expect("stsz");
    let sample_count = be_u32(&stsz[8..12]) as usize;
    let sample_sizes = (0..sample_count)
        .map(|i| be_u32(&stsz[12 + i * 4..16 + i * 4]))
        .collect();

    let chunk_offsets = if let Some(stco) = payload(b"stco") {
        let n = be_u32(&stco[4..8]) as usize;
        (0..n).map(|i| be_u32(&stco[8 + i * 4..12 + i * 4]) as u64).collect()
    } else {
        let co64 = payload(b"co64").expect("stco or co64");
        let n = be_u32(&co64[4..8]) as usize;
        (0..n).map(|i| be_u64(&co64[8 + i * 8..16 + i * 8])).collect()
    };

    let sync_samples = payload(b"stss").map(|stss| {
        let n = be_u32(&stss[4..8]) as usize;
        (0..n).map(|i| be_u32(&stss[8 + i * 4..12 + i * 4])).collect()
    });

    TrackSummary {
        track_id,
        handler,
        timescale,
        media_duration,
        sample_entry: entry.typ,
        sample_entry_children,
        sample_count,
        sample_deltas,
        sample_sizes,
        chunk_offsets,
        sync_samples,
    }
}

/// Sample payloads of a track, in order
pub fn sample_data<'a>(data: &'a [u8], track: &TrackSummary) -> Vec<&'a [u8]> {
    track
        .chunk_offsets
        .iter()
        .zip(&track.sample_sizes)
        .map(|(&offset, &size)| &data[offset as usize..offset as usize + size as usize])
        .collect()
}

#[test]
fn test_mp4_reader_on_muxed_file() {
    use crate::config::VideoCodecKind;
    use crate::media::Timestamp;
    use crate::mux::{Mp4Muxer, MuxerConfig, VideoTrackConfig};
    use std::io::Cursor;

    let mut muxer = Mp4Muxer::new(
        Cursor::new(Vec::new()),
        MuxerConfig {
            video: VideoTrackConfig {
                codec: VideoCodecKind::H264,
                width: 16,
                height: 16,
                frame_rate: 25,
                extradata: None,
                keyframe_interval: 25,
            },
            audio: None,
        },
    )
    .unwrap();
    muxer
        .write_video_unit(&[0, 0, 1, 0x65, 0xaa], Timestamp::ZERO, None)
        .unwrap();
    muxer.finalize().unwrap();
    let bytes = muxer.into_inner().into_inner();

    let tracks = read_tracks(&bytes);
    assert_eq!(tracks[0].track_id, 1);
    assert_eq!(tracks[0].decode_times(), vec![0]);
    assert_eq!(sample_data(&bytes, &tracks[0]), vec![&[0, 0, 0, 2, 0x65, 0xaa][..]]);
    // no parameter sets were ever seen, so the entry has no avcC
    assert!(tracks[0].sample_entry_children.is_empty());
    assert_eq!(tracks[0].sync_samples, Some(vec![1]));
}
