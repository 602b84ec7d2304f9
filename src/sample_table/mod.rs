//! Sample table construction and read-back.
//!
//! The build side accumulates per-track timing, size, sync and chunk
//! information sample-by-sample:
//! - stts: sample durations (decoding deltas), run-length encoded
//! - ctts: composition time offsets, run-length encoded
//! - stsz: sample sizes
//! - stss: sync sample numbers (1-based)
//! - stsc: sample-to-chunk runs
//! - stco/co64: chunk offsets
//!
//! The read side ([`SamplesInfo`]) inverts a parsed `moov` back into a
//! flat, byte-offset-ordered sample stream for progressive demuxing.

mod reader;

pub use reader::{OutputSample, SamplesInfo, TrackDescription};

use bytes::{Bytes, BytesMut};

use crate::boxes::{BoxNode, BoxTree, BoxType, FieldValue};

/// Rescale a timestamp or duration between timescales.
///
/// Exact rational scaling with integer truncation; the widening multiply
/// never overflows for 64-bit inputs.
pub fn rescale(value: u64, from_timescale: u32, to_timescale: u32) -> u64 {
    if from_timescale == to_timescale {
        return value;
    }
    (value as u128 * to_timescale as u128 / from_timescale as u128) as u64
}

/// Signed variant of [`rescale`], truncating toward zero.
pub fn rescale_signed(value: i64, from_timescale: u32, to_timescale: u32) -> i64 {
    if from_timescale == to_timescale {
        return value;
    }
    (value as i128 * to_timescale as i128 / from_timescale as i128) as i64
}

/// Per-track sample table under construction.
///
/// Samples are appended with [`store_sample`](Self::store_sample) and
/// grouped into chunks with [`flush_chunk`](Self::flush_chunk). The
/// total of all run-length counts in the delta table always equals the
/// number of samples stored.
#[derive(Debug, Clone, Default)]
pub struct SampleTable {
    // stts: (count, delta) runs
    decoding_deltas: Vec<(u32, u32)>,
    // ctts: (count, offset) runs
    composition_offsets: Vec<(u32, i32)>,
    sample_sizes: Vec<u32>,
    // 1-based sample numbers
    sync_samples: Vec<u32>,
    chunk_offsets: Vec<u64>,
    // stsc: (first_chunk, samples_per_chunk) runs
    samples_per_chunk: Vec<(u32, u32)>,
    // Payloads awaiting the next flush_chunk.
    pending: Vec<Bytes>,
    last_dts: Option<u64>,
    sample_count: u32,
}

impl SampleTable {
    /// Create an empty sample table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one sample to the open chunk.
    ///
    /// `dts` is the decode timestamp in the track timescale. The delta
    /// recorded for a sample is the distance to the previous sample's
    /// dts; the very first sample is provisionally recorded with delta 0
    /// and rewritten to the second sample's delta once it arrives. This
    /// retroactive fixup is intentional, not a lookahead approximation.
    pub fn store_sample(&mut self, payload: Bytes, dts: u64, cts_offset: i32, keyframe: bool) {
        let size = payload.len() as u32;
        self.pending.push(payload);
        self.sample_sizes.push(size);
        self.sample_count += 1;

        let delta = match self.last_dts {
            Some(last) => dts.saturating_sub(last) as u32,
            None => 0,
        };
        self.last_dts = Some(dts);

        if self.sample_count == 2 && !self.decoding_deltas.is_empty() {
            // Rewrite the assumed zero delta of the first sample.
            self.decoding_deltas[0].1 = delta;
        }
        push_run(&mut self.decoding_deltas, delta);
        push_run(&mut self.composition_offsets, cts_offset);

        if keyframe {
            self.sync_samples.push(self.sample_count);
        }
    }

    /// Close the open chunk at the given absolute byte offset.
    ///
    /// Returns the concatenated payloads of the chunk. An empty pending
    /// buffer is a no-op and records no chunk entry.
    pub fn flush_chunk(&mut self, offset: u64) -> Bytes {
        if self.pending.is_empty() {
            return Bytes::new();
        }

        let count = self.pending.len() as u32;
        let mut data = BytesMut::with_capacity(self.pending.iter().map(Bytes::len).sum());
        for payload in self.pending.drain(..) {
            data.extend_from_slice(&payload);
        }

        self.chunk_offsets.push(offset);
        let chunk_number = self.chunk_offsets.len() as u32;
        match self.samples_per_chunk.last() {
            Some((_, last_count)) if *last_count == count => {}
            _ => self.samples_per_chunk.push((chunk_number, count)),
        }

        data.freeze()
    }

    /// Number of samples stored so far.
    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    /// Number of samples awaiting the next chunk flush.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    /// Total duration in the track timescale (sum over delta runs).
    pub fn total_duration(&self) -> u64 {
        self.decoding_deltas
            .iter()
            .map(|(count, delta)| *count as u64 * *delta as u64)
            .sum()
    }

    /// The stts node.
    pub fn stts_node(&self) -> BoxNode {
        let entries = self
            .decoding_deltas
            .iter()
            .map(|(count, delta)| {
                FieldValue::Group(vec![
                    ("sample_count", FieldValue::UInt(*count as u64)),
                    ("sample_delta", FieldValue::UInt(*delta as u64)),
                ])
            })
            .collect();
        full_box_node(
            0,
            vec![
                ("entry_count", FieldValue::UInt(self.decoding_deltas.len() as u64)),
                ("entries", FieldValue::List(entries)),
            ],
        )
    }

    /// The ctts node, or `None` when every composition offset is zero.
    pub fn ctts_node(&self) -> Option<BoxNode> {
        if self.composition_offsets.iter().all(|(_, off)| *off == 0) {
            return None;
        }
        // Version 1 allows the negative offsets the builder accepts.
        let entries = self
            .composition_offsets
            .iter()
            .map(|(count, offset)| {
                FieldValue::Group(vec![
                    ("sample_count", FieldValue::UInt(*count as u64)),
                    ("sample_offset", FieldValue::Int(*offset as i64)),
                ])
            })
            .collect();
        Some(full_box_node(
            1,
            vec![
                (
                    "entry_count",
                    FieldValue::UInt(self.composition_offsets.len() as u64),
                ),
                ("entries", FieldValue::List(entries)),
            ],
        ))
    }

    /// The stsz node. Always written with `sample_size = 0` and an
    /// explicit size list.
    pub fn stsz_node(&self) -> BoxNode {
        let entries = self
            .sample_sizes
            .iter()
            .map(|size| FieldValue::UInt(*size as u64))
            .collect();
        full_box_node(
            0,
            vec![
                ("sample_size", FieldValue::UInt(0)),
                ("sample_count", FieldValue::UInt(self.sample_count as u64)),
                ("entries", FieldValue::List(entries)),
            ],
        )
    }

    /// The stss node, or `None` when every sample is a sync sample
    /// (absence of stss means exactly that).
    pub fn stss_node(&self) -> Option<BoxNode> {
        if self.sync_samples.len() as u32 == self.sample_count {
            return None;
        }
        let entries = self
            .sync_samples
            .iter()
            .map(|n| FieldValue::UInt(*n as u64))
            .collect();
        Some(full_box_node(
            0,
            vec![
                ("entry_count", FieldValue::UInt(self.sync_samples.len() as u64)),
                ("entries", FieldValue::List(entries)),
            ],
        ))
    }

    /// The stsc node.
    pub fn stsc_node(&self) -> BoxNode {
        let entries = self
            .samples_per_chunk
            .iter()
            .map(|(first_chunk, count)| {
                FieldValue::Group(vec![
                    ("first_chunk", FieldValue::UInt(*first_chunk as u64)),
                    ("samples_per_chunk", FieldValue::UInt(*count as u64)),
                    ("sample_description_index", FieldValue::UInt(1)),
                ])
            })
            .collect();
        full_box_node(
            0,
            vec![
                (
                    "entry_count",
                    FieldValue::UInt(self.samples_per_chunk.len() as u64),
                ),
                ("entries", FieldValue::List(entries)),
            ],
        )
    }

    /// The chunk-offset node: stco when every offset fits in 32 bits,
    /// co64 otherwise.
    pub fn chunk_offset_node(&self) -> (BoxType, BoxNode) {
        let box_type = if self.chunk_offsets.iter().any(|o| *o > u32::MAX as u64) {
            BoxType::CO64
        } else {
            BoxType::STCO
        };
        let entries = self
            .chunk_offsets
            .iter()
            .map(|offset| FieldValue::UInt(*offset))
            .collect();
        let node = full_box_node(
            0,
            vec![
                ("entry_count", FieldValue::UInt(self.chunk_offsets.len() as u64)),
                ("entries", FieldValue::List(entries)),
            ],
        );
        (box_type, node)
    }
}

fn push_run<T: Copy + PartialEq>(runs: &mut Vec<(u32, T)>, value: T) {
    match runs.last_mut() {
        Some((count, last)) if *last == value => *count += 1,
        _ => runs.push((1, value)),
    }
}

fn full_box_node(version: u64, mut fields: Vec<(&'static str, FieldValue)>) -> BoxNode {
    let mut all = vec![
        ("version", FieldValue::UInt(version)),
        ("flags", FieldValue::UInt(0)),
    ];
    all.append(&mut fields);
    BoxNode::Value {
        fields: all,
        children: BoxTree::default(),
    }
}
