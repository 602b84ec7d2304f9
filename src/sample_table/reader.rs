//! Read-side sample table reconstruction.
//!
//! [`SamplesInfo`] inverts a parsed `moov` into a flat sample stream
//! ordered by absolute byte offset across all tracks. Chunks from
//! different tracks are physically interleaved in `mdat`, so samples
//! must be visited in storage order, not per-track order.

use std::collections::HashSet;

use bytes::Bytes;

use super::{rescale, rescale_signed};
use crate::boxes::{BoxNode, BoxType, FieldValue};
use crate::{Error, Result};

/// Per-track description extracted from `moov`, handed to consumers as
/// the one-time "format discovered" notification.
#[derive(Debug, Clone)]
pub struct TrackDescription {
    pub track_id: u32,
    /// Native media timescale (mdhd).
    pub timescale: u32,
    /// Sample entry type from stsd (`avc1`, `hvc1`, `mp4a`, `Opus`, ..).
    pub sample_entry: BoxType,
    /// Opaque codec configuration (`avcC`/`hvcC` content, ES descriptor,
    /// `dOps` content). Not interpreted by this engine.
    pub codec_config: Bytes,
}

impl TrackDescription {
    /// Whether the sample entry describes a video track.
    pub fn is_video(&self) -> bool {
        matches!(self.sample_entry, BoxType::AVC1 | BoxType::HVC1)
    }
}

/// One demuxed sample with its payload attached.
///
/// Timestamps are rescaled from the track's native timescale to the
/// movie timescale (mvhd) with exact rational scaling and integer
/// truncation.
#[derive(Debug, Clone)]
pub struct OutputSample {
    pub track_id: u32,
    pub payload: Bytes,
    pub dts: u64,
    pub pts: i64,
    pub duration: u32,
    pub keyframe: bool,
}

#[derive(Debug, Clone)]
struct PendingSample {
    track_id: u32,
    offset: u64,
    size: u32,
    dts: u64,
    cts_offset: i64,
    duration: u32,
    timescale: u32,
    keyframe: bool,
}

/// Flat, offset-ordered sample stream derived once from a parsed `moov`.
///
/// Consumed destructively: samples are popped as their `mdat` bytes
/// arrive, tracked by a monotonically advancing byte cursor.
#[derive(Debug, Clone)]
pub struct SamplesInfo {
    tracks: Vec<TrackDescription>,
    samples: Vec<PendingSample>,
    next: usize,
    /// Absolute byte offset the next supplied buffer starts at.
    position: u64,
    output_timescale: u32,
}

impl SamplesInfo {
    /// Build from a parsed `moov` node. `mdat_data_offset` is the
    /// absolute file offset of the first `mdat` content byte, which is
    /// where the byte cursor starts.
    pub fn new(moov: &BoxNode, mdat_data_offset: u64) -> Result<Self> {
        let mvhd = moov.require_child(BoxType::MVHD)?;
        let output_timescale = mvhd.field_u64("timescale")? as u32;
        if output_timescale == 0 {
            return Err(Error::invalid_box("mvhd timescale is zero"));
        }

        let mut tracks = Vec::new();
        let mut samples = Vec::new();
        for trak in moov.children().all(BoxType::TRAK) {
            let (desc, track_samples) = unpack_track(trak)?;
            tracks.push(desc);
            samples.extend(track_samples);
        }

        samples.sort_by_key(|s| s.offset);
        // Ranges must not overlap each other or start before the mdat
        // data; the pop cursor only moves forward from there.
        let mut prev_end = mdat_data_offset;
        for s in &samples {
            if s.offset < prev_end {
                return Err(Error::invalid_box(format!(
                    "sample range at offset {} overlaps or precedes mdat data",
                    s.offset
                )));
            }
            prev_end = s.offset + s.size as u64;
        }

        Ok(Self {
            tracks,
            samples,
            next: 0,
            position: mdat_data_offset,
            output_timescale,
        })
    }

    /// Track descriptions in `moov` order.
    pub fn tracks(&self) -> &[TrackDescription] {
        &self.tracks
    }

    /// The movie timescale output timestamps are expressed in.
    pub fn output_timescale(&self) -> u32 {
        self.output_timescale
    }

    /// Number of samples not yet popped.
    pub fn remaining(&self) -> usize {
        self.samples.len() - self.next
    }

    /// Pop every sample whose full byte range is contained in `data`.
    ///
    /// `data[0]` must sit at the current byte cursor (the cursor starts
    /// at the `mdat` data offset and advances past each popped sample,
    /// skipping gap bytes between samples). Returns the popped samples
    /// and the number of bytes consumed; callers drop that prefix from
    /// their buffer before the next call.
    pub fn pop_available_samples(&mut self, data: &[u8]) -> (Vec<OutputSample>, usize) {
        let start = self.position;
        let avail_end = start + data.len() as u64;
        let mut out = Vec::new();

        while let Some(s) = self.samples.get(self.next) {
            let end = s.offset + s.size as u64;
            if end > avail_end {
                break;
            }
            let rel = (s.offset - start) as usize;
            let payload = Bytes::copy_from_slice(&data[rel..rel + s.size as usize]);

            let dts = rescale(s.dts, s.timescale, self.output_timescale);
            let pts = rescale_signed(
                s.dts as i64 + s.cts_offset,
                s.timescale,
                self.output_timescale,
            );
            let duration =
                rescale(s.duration as u64, s.timescale, self.output_timescale) as u32;
            out.push(OutputSample {
                track_id: s.track_id,
                payload,
                dts,
                pts,
                duration,
                keyframe: s.keyframe,
            });

            self.position = end;
            self.next += 1;
        }

        (out, (self.position - start) as usize)
    }
}

fn unpack_track(trak: &BoxNode) -> Result<(TrackDescription, Vec<PendingSample>)> {
    let tkhd = trak.require_child(BoxType::TKHD)?;
    let track_id = tkhd.field_u64("track_id")? as u32;

    let mdia = trak.require_child(BoxType::MDIA)?;
    let mdhd = mdia.require_child(BoxType::MDHD)?;
    let timescale = mdhd.field_u64("timescale")? as u32;
    if timescale == 0 {
        return Err(Error::invalid_box(format!(
            "track {track_id} mdhd timescale is zero"
        )));
    }

    let stbl = mdia
        .require_child(BoxType::MINF)?
        .require_child(BoxType::STBL)?;

    let (sample_entry, codec_config) = unpack_stsd(stbl.require_child(BoxType::STSD)?)?;
    let desc = TrackDescription {
        track_id,
        timescale,
        sample_entry,
        codec_config,
    };

    let deltas = unpack_runs(stbl.require_child(BoxType::STTS)?, "sample_delta")?;
    let cts_runs = match stbl.child(BoxType::CTTS) {
        Some(ctts) => unpack_signed_runs(ctts, "sample_offset")?,
        None => Vec::new(),
    };
    let sizes = unpack_sizes(stbl.require_child(BoxType::STSZ)?)?;
    let stsc = unpack_stsc(stbl.require_child(BoxType::STSC)?)?;
    let chunk_offsets = unpack_chunk_offsets(stbl)?;
    let sync: Option<HashSet<u32>> = match stbl.child(BoxType::STSS) {
        Some(stss) => {
            let mut set = HashSet::new();
            for entry in stss.field_list("entries")? {
                let n = entry
                    .as_u64()
                    .ok_or_else(|| Error::invalid_box("stss entry is not an integer"))?;
                set.insert(n as u32);
            }
            Some(set)
        }
        // No stss means every sample is a sync sample.
        None => None,
    };

    let sample_count = sizes.len() as u32;
    let durations = expand_runs(&deltas, sample_count);
    let cts_offsets = expand_signed_runs(&cts_runs, sample_count);

    let mut samples = Vec::with_capacity(sample_count as usize);
    let mut dts = 0u64;
    let mut sample_idx = 0u32;

    for (chunk_idx, chunk_offset) in chunk_offsets.iter().enumerate() {
        let per_chunk = samples_in_chunk(&stsc, chunk_idx as u32 + 1);
        let mut offset = *chunk_offset;
        for _ in 0..per_chunk {
            if sample_idx >= sample_count {
                break;
            }
            let i = sample_idx as usize;
            let keyframe = match &sync {
                Some(set) => set.contains(&(sample_idx + 1)),
                None => true,
            };
            samples.push(PendingSample {
                track_id,
                offset,
                size: sizes[i],
                dts,
                cts_offset: cts_offsets[i],
                duration: durations[i],
                timescale,
                keyframe,
            });
            offset += sizes[i] as u64;
            dts += durations[i] as u64;
            sample_idx += 1;
        }
    }

    if sample_idx != sample_count {
        return Err(Error::invalid_box(format!(
            "track {track_id}: {sample_count} samples declared but chunks cover {sample_idx}"
        )));
    }

    Ok((desc, samples))
}

fn unpack_stsd(stsd: &BoxNode) -> Result<(BoxType, Bytes)> {
    let (entry_type, entry) = stsd
        .children()
        .iter()
        .next()
        .ok_or_else(|| Error::invalid_box("stsd has no sample entry"))?;

    let config = match entry {
        // Unknown entry types parse as opaque; carry their bytes whole.
        BoxNode::Opaque(content) => content.clone(),
        BoxNode::Value { .. } => match *entry_type {
            BoxType::AVC1 => entry.require_child(BoxType::AVCC)?.content().cloned(),
            BoxType::HVC1 => entry.require_child(BoxType::HVCC)?.content().cloned(),
            BoxType::OPUS => entry.require_child(BoxType::DOPS)?.content().cloned(),
            BoxType::MP4A => entry
                .require_child(BoxType::ESDS)?
                .field("es_descriptor")
                .and_then(FieldValue::as_bin)
                .cloned(),
            _ => Some(Bytes::new()),
        }
        .ok_or_else(|| Error::invalid_box("sample entry codec configuration is missing"))?,
    };

    Ok((*entry_type, config))
}

fn unpack_runs(node: &BoxNode, value_name: &str) -> Result<Vec<(u32, u32)>> {
    let mut runs = Vec::new();
    for entry in node.field_list("entries")? {
        let count = group_u64(entry, "sample_count")? as u32;
        let value = group_u64(entry, value_name)? as u32;
        runs.push((count, value));
    }
    Ok(runs)
}

fn unpack_signed_runs(node: &BoxNode, value_name: &str) -> Result<Vec<(u32, i64)>> {
    let mut runs = Vec::new();
    for entry in node.field_list("entries")? {
        let count = group_u64(entry, "sample_count")? as u32;
        let value = entry
            .group_field(value_name)
            .and_then(FieldValue::as_i64)
            .ok_or_else(|| Error::invalid_box(format!("missing entry field `{value_name}`")))?;
        runs.push((count, value));
    }
    Ok(runs)
}

fn unpack_sizes(stsz: &BoxNode) -> Result<Vec<u32>> {
    let uniform = stsz.field_u64("sample_size")? as u32;
    let count = stsz.field_u64("sample_count")? as u32;
    if uniform > 0 {
        return Ok(vec![uniform; count as usize]);
    }
    let entries = stsz.field_list("entries")?;
    if entries.len() as u32 != count {
        return Err(Error::invalid_box(format!(
            "stsz declares {count} samples but lists {}",
            entries.len()
        )));
    }
    entries
        .iter()
        .map(|e| {
            e.as_u64()
                .map(|v| v as u32)
                .ok_or_else(|| Error::invalid_box("stsz entry is not an integer"))
        })
        .collect()
}

fn unpack_stsc(stsc: &BoxNode) -> Result<Vec<(u32, u32)>> {
    let mut runs = Vec::new();
    for entry in stsc.field_list("entries")? {
        let first_chunk = group_u64(entry, "first_chunk")? as u32;
        let per_chunk = group_u64(entry, "samples_per_chunk")? as u32;
        runs.push((first_chunk, per_chunk));
    }
    Ok(runs)
}

fn unpack_chunk_offsets(stbl: &BoxNode) -> Result<Vec<u64>> {
    let node = match stbl.child(BoxType::STCO) {
        Some(stco) => stco,
        None => stbl.require_child(BoxType::CO64)?,
    };
    node.field_list("entries")?
        .iter()
        .map(|e| {
            e.as_u64()
                .ok_or_else(|| Error::invalid_box("chunk offset is not an integer"))
        })
        .collect()
}

/// Samples in the 1-based chunk number per the stsc runs.
fn samples_in_chunk(stsc: &[(u32, u32)], chunk_number: u32) -> u32 {
    let mut per_chunk = 0;
    for (first_chunk, count) in stsc {
        if *first_chunk > chunk_number {
            break;
        }
        per_chunk = *count;
    }
    per_chunk
}

fn expand_runs(runs: &[(u32, u32)], sample_count: u32) -> Vec<u32> {
    let mut values = Vec::with_capacity(sample_count as usize);
    for (count, value) in runs {
        for _ in 0..*count {
            if values.len() as u32 >= sample_count {
                break;
            }
            values.push(*value);
        }
    }
    let last = values.last().copied().unwrap_or(0);
    values.resize(sample_count as usize, last);
    values
}

fn expand_signed_runs(runs: &[(u32, i64)], sample_count: u32) -> Vec<i64> {
    let mut values = Vec::with_capacity(sample_count as usize);
    for (count, value) in runs {
        for _ in 0..*count {
            if values.len() as u32 >= sample_count {
                break;
            }
            values.push(*value);
        }
    }
    values.resize(sample_count as usize, 0);
    values
}

fn group_u64(entry: &FieldValue, name: &str) -> Result<u64> {
    entry
        .group_field(name)
        .and_then(FieldValue::as_u64)
        .ok_or_else(|| Error::invalid_box(format!("missing entry field `{name}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::BoxTree;
    use crate::sample_table::SampleTable;

    fn full_fields(extra: Vec<(&'static str, FieldValue)>) -> Vec<(&'static str, FieldValue)> {
        let mut fields = vec![
            ("version", FieldValue::UInt(0)),
            ("flags", FieldValue::UInt(0)),
        ];
        fields.extend(extra);
        fields
    }

    fn test_trak(track_id: u32, timescale: u32, table: &SampleTable) -> BoxNode {
        let tkhd = BoxNode::with_fields(full_fields(vec![(
            "track_id",
            FieldValue::UInt(track_id as u64),
        )]));
        let mdhd = BoxNode::with_fields(full_fields(vec![(
            "timescale",
            FieldValue::UInt(timescale as u64),
        )]));

        let avcc = BoxNode::Opaque(Bytes::from_static(b"\x01avc-config"));
        let avc1 = BoxNode::Value {
            fields: Vec::new(),
            children: BoxTree::new(vec![(BoxType::AVCC, avcc)]),
        };
        let stsd = BoxNode::Value {
            fields: full_fields(vec![("entry_count", FieldValue::UInt(1))]),
            children: BoxTree::new(vec![(BoxType::AVC1, avc1)]),
        };

        let mut stbl_children = vec![
            (BoxType::STSD, stsd),
            (BoxType::STTS, table.stts_node()),
            (BoxType::STSC, table.stsc_node()),
            (BoxType::STSZ, table.stsz_node()),
        ];
        if let Some(stss) = table.stss_node() {
            stbl_children.push((BoxType::STSS, stss));
        }
        if let Some(ctts) = table.ctts_node() {
            stbl_children.push((BoxType::CTTS, ctts));
        }
        stbl_children.push(table.chunk_offset_node());

        let stbl = BoxNode::Value {
            fields: Vec::new(),
            children: BoxTree::new(stbl_children),
        };
        let minf = BoxNode::Value {
            fields: Vec::new(),
            children: BoxTree::new(vec![(BoxType::STBL, stbl)]),
        };
        let mdia = BoxNode::Value {
            fields: Vec::new(),
            children: BoxTree::new(vec![(BoxType::MDHD, mdhd), (BoxType::MINF, minf)]),
        };
        BoxNode::Value {
            fields: Vec::new(),
            children: BoxTree::new(vec![(BoxType::TKHD, tkhd), (BoxType::MDIA, mdia)]),
        }
    }

    fn test_moov(timescale: u32, traks: Vec<BoxNode>) -> BoxNode {
        let mvhd = BoxNode::with_fields(full_fields(vec![(
            "timescale",
            FieldValue::UInt(timescale as u64),
        )]));
        let mut children = vec![(BoxType::MVHD, mvhd)];
        for trak in traks {
            children.push((BoxType::TRAK, trak));
        }
        BoxNode::Value {
            fields: Vec::new(),
            children: BoxTree::new(children),
        }
    }

    #[test]
    fn test_single_track_replay() {
        let mut table = SampleTable::new();
        table.store_sample(Bytes::from_static(b"aaaaaaaaaa"), 0, 0, true);
        table.store_sample(Bytes::from_static(b"bbbbbbbbbbbbbbbbbbbb"), 1000, 0, false);
        let mdat = table.flush_chunk(48);

        let moov = test_moov(1000, vec![test_trak(1, 1000, &table)]);
        let mut info = SamplesInfo::new(&moov, 48).unwrap();
        assert_eq!(info.remaining(), 2);
        assert_eq!(info.tracks().len(), 1);
        assert_eq!(info.tracks()[0].sample_entry, BoxType::AVC1);
        assert!(info.tracks()[0].is_video());

        let (samples, consumed) = info.pop_available_samples(&mdat);
        assert_eq!(consumed, 30);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].payload.as_ref(), b"aaaaaaaaaa");
        assert_eq!(samples[0].dts, 0);
        assert!(samples[0].keyframe);
        assert_eq!(samples[1].payload.as_ref(), b"bbbbbbbbbbbbbbbbbbbb");
        assert_eq!(samples[1].dts, 1000);
        assert!(!samples[1].keyframe);
        assert_eq!(info.remaining(), 0);
    }

    #[test]
    fn test_interleaved_tracks_pop_in_offset_order() {
        // Video chunk at 100, audio chunk at 150, video chunk at 180.
        let mut video = SampleTable::new();
        video.store_sample(Bytes::from(vec![b'v'; 50]), 0, 0, true);
        video.flush_chunk(100);
        let mut audio = SampleTable::new();
        audio.store_sample(Bytes::from(vec![b'a'; 30]), 0, 0, true);
        audio.flush_chunk(150);
        video.store_sample(Bytes::from(vec![b'w'; 40]), 1000, 0, false);
        video.flush_chunk(180);

        let moov = test_moov(
            1000,
            vec![test_trak(1, 1000, &video), test_trak(2, 1000, &audio)],
        );
        let mut info = SamplesInfo::new(&moov, 100).unwrap();

        let mut mdat = Vec::new();
        mdat.extend_from_slice(&[b'v'; 50]);
        mdat.extend_from_slice(&[b'a'; 30]);
        mdat.extend_from_slice(&[b'w'; 40]);

        let (samples, consumed) = info.pop_available_samples(&mdat);
        assert_eq!(consumed, 120);
        let order: Vec<u32> = samples.iter().map(|s| s.track_id).collect();
        assert_eq!(order, vec![1, 2, 1]);
        assert_eq!(samples[1].payload.as_ref(), &[b'a'; 30]);
    }

    #[test]
    fn test_partial_data_then_resume() {
        let mut table = SampleTable::new();
        table.store_sample(Bytes::from(vec![1u8; 10]), 0, 0, true);
        table.store_sample(Bytes::from(vec![2u8; 10]), 100, 0, false);
        let mdat = table.flush_chunk(0);

        let moov = test_moov(1000, vec![test_trak(1, 1000, &table)]);
        let mut info = SamplesInfo::new(&moov, 0).unwrap();

        // Only the first sample fits in 15 bytes.
        let (samples, consumed) = info.pop_available_samples(&mdat[..15]);
        assert_eq!(samples.len(), 1);
        assert_eq!(consumed, 10);
        assert_eq!(info.remaining(), 1);

        let (samples, consumed) = info.pop_available_samples(&mdat[10..]);
        assert_eq!(samples.len(), 1);
        assert_eq!(consumed, 10);
        assert_eq!(samples[0].payload.as_ref(), &[2u8; 10]);
    }

    #[test]
    fn test_gap_bytes_skipped() {
        // Chunk starts 8 bytes past the cursor; the gap is consumed.
        let mut table = SampleTable::new();
        table.store_sample(Bytes::from(vec![9u8; 4]), 0, 0, true);
        table.flush_chunk(8);

        let moov = test_moov(1000, vec![test_trak(1, 1000, &table)]);
        let mut info = SamplesInfo::new(&moov, 0).unwrap();

        let mut data = vec![0u8; 8];
        data.extend_from_slice(&[9u8; 4]);
        let (samples, consumed) = info.pop_available_samples(&data);
        assert_eq!(samples.len(), 1);
        assert_eq!(consumed, 12);
    }

    #[test]
    fn test_timescale_rescaling() {
        let mut table = SampleTable::new();
        table.store_sample(Bytes::from(vec![0u8; 4]), 0, 3000, true);
        table.store_sample(Bytes::from(vec![0u8; 4]), 3000, 0, false);
        let mdat = table.flush_chunk(0);

        // Track at 90000 Hz, movie timescale 1000.
        let moov = test_moov(1000, vec![test_trak(1, 90000, &table)]);
        let mut info = SamplesInfo::new(&moov, 0).unwrap();
        let (samples, _) = info.pop_available_samples(&mdat);
        assert_eq!(samples[1].dts, 33); // 3000 / 90 truncated
        assert_eq!(samples[0].pts, 33);
        assert_eq!(samples[0].duration, 33);
    }

    #[test]
    fn test_uniform_stsz_read() {
        let stsz = BoxNode::with_fields(full_fields(vec![
            ("sample_size", FieldValue::UInt(100)),
            ("sample_count", FieldValue::UInt(3)),
        ]));
        let sizes = unpack_sizes(&stsz).unwrap();
        assert_eq!(sizes, vec![100, 100, 100]);
    }

    #[test]
    fn test_offset_before_mdat_rejected() {
        let mut table = SampleTable::new();
        table.store_sample(Bytes::from(vec![0u8; 10]), 0, 0, true);
        table.flush_chunk(0); // mdat data starts at 48

        let moov = test_moov(1000, vec![test_trak(1, 1000, &table)]);
        assert!(matches!(
            SamplesInfo::new(&moov, 48),
            Err(Error::InvalidBox(_))
        ));
    }

    #[test]
    fn test_overlapping_ranges_rejected() {
        let mut a = SampleTable::new();
        a.store_sample(Bytes::from(vec![0u8; 10]), 0, 0, true);
        a.flush_chunk(0);
        let mut b = SampleTable::new();
        b.store_sample(Bytes::from(vec![0u8; 10]), 0, 0, true);
        b.flush_chunk(5); // overlaps track a's [0, 10)

        let moov = test_moov(1000, vec![test_trak(1, 1000, &a), test_trak(2, 1000, &b)]);
        assert!(matches!(
            SamplesInfo::new(&moov, 0),
            Err(Error::InvalidBox(_))
        ));
    }
}
