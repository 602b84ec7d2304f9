//! CMAF demuxer: a header segment followed by fragments, each a
//! self-contained `moof`+`mdat` pair.
//!
//! Unlike the generic container codec, which tolerates unknown box
//! types as opaque content, the fragment loop enforces a strict
//! expected-box sequence; anything else is a fatal contract violation
//! by the upstream source.

use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use tracing::debug;

use super::{ConsumerMap, DemuxEvent};
use crate::boxes::{parse_boxes, BoxHeader, BoxNode, BoxType, FieldValue};
use crate::sample_table::{rescale, rescale_signed, OutputSample, SamplesInfo};
use crate::{Error, Result};

const SAMPLE_IS_NON_SYNC: u32 = 0x0001_0000;
const TRUN_DATA_OFFSET_PRESENT: u32 = 0x000001;
const TRUN_FIRST_SAMPLE_FLAGS_PRESENT: u32 = 0x000004;
const TRUN_SAMPLE_DURATION_PRESENT: u32 = 0x000100;
const TRUN_SAMPLE_SIZE_PRESENT: u32 = 0x000200;
const TRUN_SAMPLE_FLAGS_PRESENT: u32 = 0x000400;
const TRUN_SAMPLE_CTS_PRESENT: u32 = 0x000800;

/// Per-track defaults merged from `trex` and the current `tfhd`.
#[derive(Debug, Clone, Copy, Default)]
struct SampleDefaults {
    duration: Option<u32>,
    size: Option<u32>,
    flags: Option<u32>,
}

#[derive(Debug, Clone)]
struct FragmentTrack {
    timescale: u32,
    trex: SampleDefaults,
}

/// One sample announced by a `moof`, waiting for its `mdat` bytes.
#[derive(Debug, Clone)]
struct FragmentSample {
    track_id: u32,
    /// Absolute stream offset of the payload.
    offset: u64,
    size: u32,
    dts: u64,
    cts_offset: i64,
    duration: u32,
    timescale: u32,
    keyframe: bool,
}

#[derive(Debug)]
enum CmafState {
    /// Waiting for `ftyp` + `moov`.
    ReadingHeader,
    /// Between fragments: `styp`, `sidx` and `moof` are accepted.
    ReadingFragmentHeader,
    /// A `moof` was parsed; its `mdat` payload is streaming in.
    ReadingFragmentData {
        samples: Vec<FragmentSample>,
        next: usize,
        /// Absolute offset of the first byte past the current `mdat`.
        mdat_end: u64,
    },
}

impl CmafState {
    fn name(&self) -> &'static str {
        match self {
            Self::ReadingHeader => "reading_cmaf_header",
            Self::ReadingFragmentHeader => "reading_fragment_header",
            Self::ReadingFragmentData { .. } => "reading_fragment_data",
        }
    }
}

/// Push-based demuxer for CMAF header + fragment streams.
///
/// Each `moof` establishes sample timing for its own fragment only;
/// `sidx` is consumed for its timescale and otherwise ignored.
#[derive(Debug)]
pub struct CmafDemuxer {
    state: CmafState,
    buffer: BytesMut,
    /// Absolute stream offset of `buffer[0]`.
    position: u64,
    ftyp_seen: bool,
    movie_timescale: u32,
    tracks: HashMap<u32, FragmentTrack>,
    /// Timescale overrides announced by `sidx`, per reference track.
    sidx_timescales: HashMap<u32, u32>,
    consumers: ConsumerMap,
}

impl CmafDemuxer {
    pub fn new() -> Self {
        Self {
            state: CmafState::ReadingHeader,
            buffer: BytesMut::new(),
            position: 0,
            ftyp_seen: false,
            movie_timescale: 0,
            tracks: HashMap::new(),
            sidx_timescales: HashMap::new(),
            consumers: ConsumerMap::default(),
        }
    }

    /// Feed the next chunk of source bytes.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<DemuxEvent>> {
        self.buffer.extend_from_slice(data);
        let mut events = Vec::new();
        while self.step(&mut events)? {}
        Ok(events)
    }

    /// Bind a discovered track to an output consumer handle.
    pub fn attach_consumer(&mut self, track_id: u32, consumer: u32) -> Result<Vec<DemuxEvent>> {
        self.consumers.attach(track_id, consumer)
    }

    /// Signal that the source has no more bytes.
    pub fn end_of_stream(&mut self) -> Result<Vec<DemuxEvent>> {
        let mut events = Vec::new();
        while self.step(&mut events)? {}
        match &self.state {
            CmafState::ReadingFragmentData { samples, next, .. } if *next < samples.len() => {
                Err(Error::invalid_box(format!(
                    "stream ended with {} fragment samples missing",
                    samples.len() - next
                )))
            }
            CmafState::ReadingHeader => {
                Err(Error::invalid_box("stream ended before the CMAF header"))
            }
            _ => Ok(events),
        }
    }

    fn step(&mut self, events: &mut Vec<DemuxEvent>) -> Result<bool> {
        match &self.state {
            CmafState::ReadingHeader => self.read_header(events),
            CmafState::ReadingFragmentHeader => self.read_fragment_header(),
            CmafState::ReadingFragmentData { .. } => self.read_fragment_data(events),
        }
    }

    /// Take the next fully buffered box, or report that more bytes are
    /// needed. Rejects box types not in `accepted` for this state.
    fn take_box(&mut self, accepted: &[BoxType]) -> Result<Option<(BoxType, BoxNode)>> {
        let (header, _) = match BoxHeader::parse(&self.buffer) {
            Ok(parsed) => parsed,
            Err(Error::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !accepted.contains(&header.box_type) {
            return Err(Error::UnexpectedBox {
                state: self.state.name(),
                box_type: header.box_type,
            });
        }
        let unbounded = self.buffer[..4] == [0, 0, 0, 0];
        let total = header.header_size as u64 + header.content_size;
        if unbounded || (self.buffer.len() as u64) < total {
            return Ok(None);
        }
        let (tree, _) = parse_boxes(&self.buffer[..total as usize])?;
        self.buffer.advance(total as usize);
        self.position += total;
        Ok(tree.0.into_iter().next())
    }

    fn read_header(&mut self, events: &mut Vec<DemuxEvent>) -> Result<bool> {
        let accepted = if self.ftyp_seen {
            &[BoxType::MOOV][..]
        } else {
            &[BoxType::FTYP][..]
        };
        let Some((box_type, node)) = self.take_box(accepted)? else {
            return Ok(false);
        };
        if box_type == BoxType::FTYP {
            self.ftyp_seen = true;
            return Ok(true);
        }

        // The fragmented moov carries empty sample tables; reuse the
        // table reader for track discovery only.
        let info = SamplesInfo::new(&node, 0)?;
        self.movie_timescale = info.output_timescale();
        self.consumers.set_expected(info.tracks());
        for track in info.tracks() {
            self.tracks.insert(
                track.track_id,
                FragmentTrack {
                    timescale: track.timescale,
                    trex: SampleDefaults::default(),
                },
            );
            events.push(DemuxEvent::NewTrack(track.clone()));
        }
        if let Some(mvex) = node.child(BoxType::MVEX) {
            for trex in mvex.children().all(BoxType::TREX) {
                let track_id = trex.field_u64("track_id")? as u32;
                if let Some(track) = self.tracks.get_mut(&track_id) {
                    track.trex = SampleDefaults {
                        duration: non_zero(trex.field_u64("default_sample_duration")?),
                        size: non_zero(trex.field_u64("default_sample_size")?),
                        flags: non_zero(trex.field_u64("default_sample_flags")?),
                    };
                }
            }
        }
        debug!(tracks = self.tracks.len(), "cmaf header read");
        self.state = CmafState::ReadingFragmentHeader;
        Ok(true)
    }

    fn read_fragment_header(&mut self) -> Result<bool> {
        let moof_start = self.position;
        let Some((box_type, node)) =
            self.take_box(&[BoxType::STYP, BoxType::SIDX, BoxType::MOOF])?
        else {
            return Ok(false);
        };
        match box_type {
            BoxType::STYP => Ok(true),
            BoxType::SIDX => {
                // sidx contributes a timescale for its reference track
                // and nothing else.
                let reference_id = node.field_u64("reference_id")? as u32;
                let timescale = node.field_u64("timescale")? as u32;
                if timescale > 0 {
                    self.sidx_timescales.insert(reference_id, timescale);
                }
                Ok(true)
            }
            _ => {
                let samples = self.unpack_moof(&node, moof_start)?;
                debug!(
                    samples = samples.len(),
                    moof_start, "fragment header read"
                );
                self.state = CmafState::ReadingFragmentData {
                    samples,
                    next: 0,
                    // Filled in once the mdat header arrives.
                    mdat_end: 0,
                };
                Ok(true)
            }
        }
    }

    /// Expand a `moof` into absolute-offset fragment samples.
    fn unpack_moof(&self, moof: &BoxNode, moof_start: u64) -> Result<Vec<FragmentSample>> {
        let mut samples = Vec::new();
        for traf in moof.children().all(BoxType::TRAF) {
            let tfhd = traf.require_child(BoxType::TFHD)?;
            let track_id = tfhd.field_u64("track_id")? as u32;
            let track = self.tracks.get(&track_id).ok_or_else(|| {
                Error::invalid_box(format!("moof references unknown track {track_id}"))
            })?;

            let defaults = SampleDefaults {
                duration: opt_u32(tfhd, "default_sample_duration").or(track.trex.duration),
                size: opt_u32(tfhd, "default_sample_size").or(track.trex.size),
                flags: opt_u32(tfhd, "default_sample_flags").or(track.trex.flags),
            };
            // default-base-is-moof unless an explicit base is given.
            let base = tfhd
                .field("base_data_offset")
                .and_then(FieldValue::as_u64)
                .unwrap_or(moof_start);

            let mut dts = traf
                .require_child(BoxType::TFDT)?
                .field_u64("base_media_decode_time")?;
            let timescale = self
                .sidx_timescales
                .get(&track_id)
                .copied()
                .unwrap_or(track.timescale);

            for trun in traf.children().all(BoxType::TRUN) {
                let flags = trun.field_u64("flags")? as u32;
                let data_offset = if flags & TRUN_DATA_OFFSET_PRESENT != 0 {
                    trun.field_i64("data_offset")?
                } else {
                    0
                };
                let first_sample_flags = if flags & TRUN_FIRST_SAMPLE_FLAGS_PRESENT != 0 {
                    opt_u32(trun, "first_sample_flags")
                } else {
                    None
                };

                let mut offset = base.checked_add_signed(data_offset).ok_or_else(|| {
                    Error::malformed(
                        &[BoxType::MOOF, BoxType::TRAF, BoxType::TRUN],
                        "data_offset",
                        "resolves before the start of the stream",
                    )
                })?;
                for (i, entry) in trun.field_list("samples")?.iter().enumerate() {
                    let duration = sample_u32(entry, "sample_duration", flags, TRUN_SAMPLE_DURATION_PRESENT)
                        .or(defaults.duration)
                        .ok_or_else(|| {
                            Error::invalid_box(format!("track {track_id}: no sample duration"))
                        })?;
                    let size = sample_u32(entry, "sample_size", flags, TRUN_SAMPLE_SIZE_PRESENT)
                        .or(defaults.size)
                        .ok_or_else(|| {
                            Error::invalid_box(format!("track {track_id}: no sample size"))
                        })?;
                    let sample_flags = sample_u32(entry, "sample_flags", flags, TRUN_SAMPLE_FLAGS_PRESENT)
                        .or(if i == 0 { first_sample_flags } else { None })
                        .or(defaults.flags)
                        .unwrap_or(0);
                    let cts_offset = if flags & TRUN_SAMPLE_CTS_PRESENT != 0 {
                        sample_i64(entry, "sample_composition_offset").unwrap_or(0)
                    } else {
                        0
                    };

                    samples.push(FragmentSample {
                        track_id,
                        offset,
                        size,
                        dts,
                        cts_offset,
                        duration,
                        timescale,
                        keyframe: sample_flags & SAMPLE_IS_NON_SYNC == 0,
                    });
                    offset += size as u64;
                    dts += duration as u64;
                }
            }
        }
        samples.sort_by_key(|s| s.offset);
        Ok(samples)
    }

    fn read_fragment_data(&mut self, events: &mut Vec<DemuxEvent>) -> Result<bool> {
        let CmafState::ReadingFragmentData {
            samples,
            next,
            mdat_end,
        } = &mut self.state
        else {
            return Ok(false);
        };

        if *mdat_end == 0 {
            let (header, _) = match BoxHeader::parse(&self.buffer) {
                Ok(parsed) => parsed,
                Err(Error::InsufficientData) => return Ok(false),
                Err(e) => return Err(e),
            };
            if header.box_type != BoxType::MDAT {
                return Err(Error::UnexpectedBox {
                    state: "reading_fragment_data",
                    box_type: header.box_type,
                });
            }
            let total = header.header_size as u64 + header.content_size;
            *mdat_end = self.position + total;
            self.buffer.advance(header.header_size as usize);
            self.position += header.header_size as u64;
        }

        // Pop samples whose full byte range is buffered, skipping gaps.
        let avail_end = self.position + self.buffer.len() as u64;
        let mut popped = Vec::new();
        while let Some(s) = samples.get(*next) {
            let end = s.offset + s.size as u64;
            if end > avail_end {
                break;
            }
            let Some(rel) = s.offset.checked_sub(self.position) else {
                return Err(Error::malformed(
                    &[BoxType::MOOF, BoxType::TRAF, BoxType::TRUN],
                    "data_offset",
                    "sample placed before the mdat payload",
                ));
            };
            let rel = rel as usize;
            let skip = rel + s.size as usize;
            popped.push(OutputSample {
                track_id: s.track_id,
                payload: bytes::Bytes::copy_from_slice(&self.buffer[rel..skip]),
                dts: rescale(s.dts, s.timescale, self.movie_timescale),
                pts: rescale_signed(
                    s.dts as i64 + s.cts_offset,
                    s.timescale,
                    self.movie_timescale,
                ),
                duration: rescale(s.duration as u64, s.timescale, self.movie_timescale) as u32,
                keyframe: s.keyframe,
            });
            self.buffer.advance(skip);
            self.position += skip as u64;
            *next += 1;
        }
        let progressed = !popped.is_empty();

        if *next == samples.len() {
            // Skip any padding to the end of mdat, then loop back for
            // the next fragment.
            let pad = mdat_end.saturating_sub(self.position);
            if (self.buffer.len() as u64) < pad {
                self.consumers.route(popped, events);
                return Ok(progressed);
            }
            self.buffer.advance(pad as usize);
            self.position += pad;
            self.state = CmafState::ReadingFragmentHeader;
            self.consumers.route(popped, events);
            return Ok(true);
        }

        self.consumers.route(popped, events);
        Ok(progressed)
    }
}

impl Default for CmafDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

fn non_zero(value: u64) -> Option<u32> {
    (value != 0).then_some(value as u32)
}

fn opt_u32(node: &BoxNode, name: &str) -> Option<u32> {
    node.field(name).and_then(FieldValue::as_u64).map(|v| v as u32)
}

/// Read a flag-gated per-sample field. A trun with a single enabled
/// per-sample field stores plain values, not groups.
fn sample_u32(entry: &FieldValue, name: &str, flags: u32, bit: u32) -> Option<u32> {
    if flags & bit == 0 {
        return None;
    }
    match entry {
        FieldValue::Group(_) => entry
            .group_field(name)
            .and_then(FieldValue::as_u64)
            .map(|v| v as u32),
        other => other.as_u64().map(|v| v as u32),
    }
}

fn sample_i64(entry: &FieldValue, name: &str) -> Option<i64> {
    match entry {
        FieldValue::Group(_) => entry.group_field(name).and_then(FieldValue::as_i64),
        other => other.as_i64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::mux::{CmafMuxer, MediaDescriptor};
    use crate::segment::{InputSample, SegmentConfig};

    fn test_stream() -> (Vec<u8>, Vec<(u64, usize)>) {
        let config = SegmentConfig {
            timescale: 1000,
            min_duration: 1500,
            target_duration: 2000,
            chunk: None,
        };
        let mut muxer = CmafMuxer::new(1000, config).unwrap();
        muxer
            .add_track(
                1,
                1000,
                MediaDescriptor::Avc {
                    config: Bytes::from_static(b"\x01\x64"),
                    width: 640,
                    height: 360,
                },
            )
            .unwrap();

        let mut stream = Vec::new();
        stream.extend_from_slice(&muxer.header().unwrap());

        let mut expected = Vec::new();
        let mut dts = 0u64;
        while dts < 4500 {
            let size = 16 + (dts / 100 % 7) as usize;
            expected.push((dts, size));
            muxer
                .push_sample(
                    1,
                    InputSample {
                        payload: Bytes::from(vec![0x42; size]),
                        dts,
                        pts: dts as i64,
                        duration: 100,
                        keyframe: dts % 2000 == 0,
                    },
                )
                .unwrap();
            dts += 100;
        }
        stream.extend_from_slice(&muxer.next_segment().unwrap());
        stream.extend_from_slice(&muxer.next_segment().unwrap());
        muxer.end_track(1);
        if let Some(tail) = muxer.finish().unwrap() {
            stream.extend_from_slice(&tail);
        }
        (stream, expected)
    }

    fn samples(events: &[DemuxEvent]) -> Vec<&OutputSample> {
        events
            .iter()
            .filter_map(|e| match e {
                DemuxEvent::Sample { sample, .. } => Some(sample),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_full_stream_replay() {
        let (stream, expected) = test_stream();
        let mut demuxer = CmafDemuxer::new();

        let mut events = demuxer.push(&stream).unwrap();
        assert!(matches!(events[0], DemuxEvent::NewTrack(ref t) if t.track_id == 1));
        // Samples demuxed before the consumer attached flush in order.
        assert!(samples(&events).is_empty());
        events.extend(demuxer.attach_consumer(1, 0).unwrap());
        events.extend(demuxer.end_of_stream().unwrap());

        let got = samples(&events);
        assert_eq!(got.len(), expected.len());
        for (sample, (dts, size)) in got.iter().zip(&expected) {
            assert_eq!(sample.dts, *dts);
            assert_eq!(sample.payload.len(), *size);
            assert_eq!(sample.duration, 100);
        }
        assert!(got[0].keyframe);
        assert!(!got[1].keyframe);
    }

    #[test]
    fn test_arbitrary_chunk_sizes() {
        let (stream, expected) = test_stream();
        let mut demuxer = CmafDemuxer::new();
        let mut events = Vec::new();
        for chunk in stream.chunks(13) {
            events.extend(demuxer.push(chunk).unwrap());
            if !events.is_empty() && demuxer.consumers.bindings.is_empty() {
                if let DemuxEvent::NewTrack(_) = events[0] {
                    events.extend(demuxer.attach_consumer(1, 0).unwrap());
                }
            }
        }
        events.extend(demuxer.end_of_stream().unwrap());
        assert_eq!(samples(&events).len(), expected.len());
    }

    fn test_header() -> Vec<u8> {
        let config = SegmentConfig {
            timescale: 1000,
            min_duration: 1500,
            target_duration: 2000,
            chunk: None,
        };
        let mut muxer = CmafMuxer::new(1000, config).unwrap();
        muxer
            .add_track(
                1,
                1000,
                MediaDescriptor::Avc {
                    config: Bytes::from_static(b"\x01\x64"),
                    width: 640,
                    height: 360,
                },
            )
            .unwrap();
        muxer.header().unwrap().to_vec()
    }

    /// One-sample `moof`+`mdat` with a caller-chosen trun data offset.
    fn fragment_with_offset(data_offset: i64) -> Vec<u8> {
        use crate::boxes::serialize_boxes;
        use crate::mux::assembly;

        let samples = vec![InputSample {
            payload: Bytes::from(vec![0x42; 16]),
            dts: 0,
            pts: 0,
            duration: 100,
            keyframe: true,
        }];
        let tracks = [assembly::FragmentTrack {
            track_id: 1,
            base_decode_time: 0,
            samples: &samples,
        }];
        let mut out = Vec::new();
        out.extend_from_slice(
            &serialize_boxes(&assembly::moof(1, &tracks, &[data_offset])).unwrap(),
        );
        out.extend_from_slice(
            &serialize_boxes(&assembly::mdat(Bytes::from(vec![0x42; 16]))).unwrap(),
        );
        out
    }

    #[test]
    fn test_trun_offset_into_moof_rejected() {
        let mut demuxer = CmafDemuxer::new();
        demuxer.push(&test_header()).unwrap();
        // data_offset 0 places the first sample inside the moof itself,
        // before the mdat payload.
        let err = demuxer.push(&fragment_with_offset(0)).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedField {
                field: "data_offset",
                ..
            }
        ));
    }

    #[test]
    fn test_trun_offset_underflow_rejected() {
        let mut demuxer = CmafDemuxer::new();
        demuxer.push(&test_header()).unwrap();
        let err = demuxer
            .push(&fragment_with_offset(-1_000_000))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedField {
                field: "data_offset",
                ..
            }
        ));
    }

    #[test]
    fn test_unexpected_box_in_header() {
        let mut demuxer = CmafDemuxer::new();
        let mut bogus = Vec::new();
        bogus.extend_from_slice(&16u32.to_be_bytes());
        bogus.extend_from_slice(b"mdat");
        bogus.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            demuxer.push(&bogus),
            Err(Error::UnexpectedBox {
                state: "reading_cmaf_header",
                ..
            })
        ));
    }

    #[test]
    fn test_unexpected_box_between_fragments() {
        let (stream, _) = test_stream();
        let mut demuxer = CmafDemuxer::new();
        // Header only: ftyp + moov.
        let mut fed = 0;
        while !matches!(demuxer.state, CmafState::ReadingFragmentHeader) {
            demuxer.push(&stream[fed..fed + 1]).unwrap();
            fed += 1;
        }
        let mut bogus = Vec::new();
        bogus.extend_from_slice(&8u32.to_be_bytes());
        bogus.extend_from_slice(b"free");
        assert!(matches!(
            demuxer.push(&bogus),
            Err(Error::UnexpectedBox {
                state: "reading_fragment_header",
                ..
            })
        ));
    }
}
