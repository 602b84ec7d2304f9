//! CMAF segment and chunk boundary selection.
//!
//! Samples are queued per track and drained as whole segments (or
//! partial segments, "chunks") once every participating track can cut
//! at a common boundary timestamp. Segments must start with a keyframe
//! on every track that has keyframes, so boundaries are keyframe-gated;
//! audio-only tracks cut at the first sample past the boundary.
//!
//! "Not enough data" is a retry signal, not a failure: collection never
//! consumes or reorders queued samples until a boundary is final, so a
//! failed attempt can be repeated verbatim once more samples arrive.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use tracing::debug;

use crate::sample_table::rescale;
use crate::{Error, Result};

/// Durations bounding partial-segment (chunk) cuts, in the config
/// timescale.
///
/// A chunk never ends before `min_duration`. A keyframe arriving
/// between `min_duration` and `max_duration` cuts an independent chunk;
/// once `max_duration` passes without one, the chunk is cut anyway and
/// marked non-independent. Tracks without keyframes cut at
/// `target_duration`.
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    pub min_duration: u64,
    pub target_duration: u64,
    pub max_duration: u64,
}

/// Segmentation parameters. All durations are in `timescale` units.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Timescale boundary arithmetic is performed in.
    pub timescale: u32,
    /// A segment never ends before this duration.
    pub min_duration: u64,
    /// Preferred segment duration.
    pub target_duration: u64,
    /// Chunking bounds; `None` disables partial segments.
    pub chunk: Option<ChunkConfig>,
}

impl SegmentConfig {
    /// Validate duration ordering.
    pub fn validate(&self) -> Result<()> {
        if self.min_duration > self.target_duration {
            return Err(Error::InvalidDurationRange {
                min: self.min_duration,
                target: self.target_duration,
            });
        }
        if let Some(chunk) = &self.chunk {
            if chunk.min_duration > chunk.target_duration {
                return Err(Error::InvalidDurationRange {
                    min: chunk.min_duration,
                    target: chunk.target_duration,
                });
            }
            if chunk.target_duration > chunk.max_duration {
                return Err(Error::InvalidDurationRange {
                    min: chunk.target_duration,
                    target: chunk.max_duration,
                });
            }
        }
        Ok(())
    }
}

/// One sample queued for segmentation, timestamps in the track's native
/// timescale.
#[derive(Debug, Clone)]
pub struct InputSample {
    pub payload: Bytes,
    pub dts: u64,
    pub pts: i64,
    pub duration: u64,
    pub keyframe: bool,
}

/// One track's slice of a collected segment.
#[derive(Debug, Clone)]
pub struct SegmentTrack {
    pub track_id: u32,
    pub timescale: u32,
    pub samples: Vec<InputSample>,
}

/// A collected (partial) segment. `start`/`end` are in the config
/// timescale; per-track samples keep their native timestamps.
#[derive(Debug, Clone)]
pub struct Segment {
    pub start: u64,
    pub end: u64,
    /// Whether every keyframe track starts this segment with a keyframe.
    pub independent: bool,
    pub tracks: Vec<SegmentTrack>,
}

#[derive(Debug)]
struct TrackQueue {
    timescale: u32,
    has_keyframes: bool,
    samples: VecDeque<InputSample>,
    ended: bool,
}

impl TrackQueue {
    /// Sample dts values rescaled to the given timescale, front first.
    fn ts(&self, index: usize, to: u32) -> u64 {
        rescale(self.samples[index].dts, self.timescale, to)
    }
}

/// Multi-track segment assembler.
///
/// Queues are keyed by track id in a `BTreeMap`, so when several tracks
/// are simultaneously eligible they are always visited in ascending
/// track-id order and collection is deterministic.
#[derive(Debug)]
pub struct SegmentAssembler {
    config: SegmentConfig,
    queues: BTreeMap<u32, TrackQueue>,
    /// Boundary timestamp of the previous cut, config timescale.
    /// `None` until the first sample establishes the origin.
    segment_start: Option<u64>,
}

impl SegmentAssembler {
    /// Create an assembler with a validated config.
    pub fn new(config: SegmentConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            queues: BTreeMap::new(),
            segment_start: None,
        })
    }

    /// Register a participating track. `has_keyframes` marks tracks
    /// whose cuts must land on keyframes (video); tracks without
    /// keyframes (audio) cut at the first sample past the boundary.
    pub fn add_track(&mut self, track_id: u32, timescale: u32, has_keyframes: bool) {
        self.queues.insert(
            track_id,
            TrackQueue {
                timescale,
                has_keyframes,
                samples: VecDeque::new(),
                ended: false,
            },
        );
    }

    /// Queue one sample.
    pub fn push(&mut self, track_id: u32, sample: InputSample) -> Result<()> {
        let queue = self
            .queues
            .get_mut(&track_id)
            .ok_or_else(|| Error::invalid_box(format!("unknown track {track_id}")))?;
        queue.samples.push_back(sample);
        Ok(())
    }

    /// Mark a track's input as finished; it no longer blocks boundaries.
    pub fn end_track(&mut self, track_id: u32) {
        if let Some(queue) = self.queues.get_mut(&track_id) {
            queue.ended = true;
        }
    }

    /// The validated configuration this assembler runs with.
    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    /// Number of samples currently queued across all tracks.
    pub fn queued_samples(&self) -> usize {
        self.queues.values().map(|q| q.samples.len()).sum()
    }

    /// Collect one full segment.
    ///
    /// The boundary is the latest keyframe inside
    /// `[start + min, start + target]`, falling back to the earliest
    /// keyframe past the target. With several keyframe tracks, the
    /// boundary is raised until all of them can cut on a keyframe
    /// (fixpoint, visiting tracks in ascending id order). Returns
    /// [`Error::InsufficientData`] until every track has enough queued
    /// samples to prove the boundary; no samples are consumed before
    /// the boundary is final.
    pub fn collect_segment(&mut self) -> Result<Segment> {
        let start = self.origin()?;
        let min = start + self.config.min_duration;
        let target = start + self.config.target_duration;

        // The lowest-id keyframe track proposes a boundary from the
        // [min, target] window; the remaining keyframe tracks then raise
        // it to the least common keyframe timestamp (fixpoint).
        let mut boundary = match self.queues.values().find(|q| q.has_keyframes) {
            Some(queue) => self.keyframe_cut(queue, min, target)?,
            None => target,
        };
        loop {
            let mut raised = false;
            for queue in self.queues.values().filter(|q| q.has_keyframes) {
                let cut = self.keyframe_at_or_after(queue, boundary)?;
                if cut > boundary {
                    boundary = cut;
                    raised = true;
                    break;
                }
            }
            if !raised {
                break;
            }
        }

        // Every other track must be able to prove its own cut point.
        for queue in self.queues.values().filter(|q| !q.has_keyframes) {
            self.plain_cut(queue, boundary)?;
        }

        Ok(self.drain_until(start, boundary))
    }

    /// Collect one partial segment (chunk).
    ///
    /// A keyframe inside `[start + min, start + max)` cuts an
    /// independent chunk; once samples pass `start + max` without one,
    /// the chunk is cut there and marked non-independent. An assembler
    /// with no keyframe tracks cuts at `start + target`. Requires
    /// `chunk` bounds in the config.
    pub fn collect_chunk(&mut self) -> Result<Segment> {
        let chunk = self
            .config
            .chunk
            .clone()
            .ok_or_else(|| Error::invalid_box("chunk durations not configured"))?;
        let start = self.origin()?;
        let min = start + chunk.min_duration;
        let mid = start + chunk.target_duration;
        let end = start + chunk.max_duration;

        let mut boundary = None;
        for queue in self.queues.values().filter(|q| q.has_keyframes) {
            let cut = self.chunk_cut(queue, min, end)?;
            // The latest eligible cut wins so every keyframe track can
            // start its next chunk on or after the boundary.
            boundary = Some(boundary.map_or(cut, |b: u64| b.max(cut)));
        }
        let boundary = boundary.unwrap_or(mid);

        for queue in self.queues.values().filter(|q| !q.has_keyframes) {
            self.plain_cut(queue, boundary)?;
        }

        Ok(self.drain_until(start, boundary))
    }

    /// Drain everything still queued as a final segment. `None` when
    /// nothing is buffered. Intended for end-of-stream flushing, after
    /// all tracks are ended.
    pub fn drain(&mut self) -> Option<Segment> {
        if self.queues.values().all(|q| q.samples.is_empty()) {
            return None;
        }
        let start = self.segment_start.unwrap_or(0);
        let end = self
            .queues
            .values()
            .filter(|q| !q.samples.is_empty())
            .map(|q| {
                let last = q.samples.len() - 1;
                q.ts(last, self.config.timescale)
                    + rescale(
                        q.samples[last].duration,
                        q.timescale,
                        self.config.timescale,
                    )
            })
            .max()
            .unwrap_or(start);
        Some(self.drain_until(start, end.max(start)))
    }

    fn origin(&mut self) -> Result<u64> {
        if let Some(start) = self.segment_start {
            return Ok(start);
        }
        let first = self
            .queues
            .values()
            .filter_map(|q| {
                if q.samples.is_empty() {
                    None
                } else {
                    Some(q.ts(0, self.config.timescale))
                }
            })
            .min()
            .ok_or(Error::InsufficientData)?;
        // All tracks must have reported in before the origin is fixed.
        if self
            .queues
            .values()
            .any(|q| q.samples.is_empty() && !q.ended)
        {
            return Err(Error::InsufficientData);
        }
        self.segment_start = Some(first);
        Ok(first)
    }

    /// Keyframe-gated segment cut for one track: the latest keyframe in
    /// `[min, target]`, else the earliest keyframe past `target`.
    fn keyframe_cut(&self, queue: &TrackQueue, min: u64, target: u64) -> Result<u64> {
        let ts = self.config.timescale;
        let mut in_window = None;
        for (i, sample) in queue.samples.iter().enumerate() {
            let t = queue.ts(i, ts);
            if sample.keyframe && t >= min {
                if t <= target {
                    in_window = Some(t);
                } else {
                    return Ok(in_window.unwrap_or(t));
                }
            }
            if t > target && in_window.is_some() {
                return Ok(in_window.unwrap_or(t));
            }
        }
        // The window is only decided once a sample beyond it exists.
        if queue.ended {
            return in_window.map_or(Err(Error::InsufficientData), Ok);
        }
        Err(Error::InsufficientData)
    }

    /// Earliest keyframe at or after `boundary`. An ended track keeps
    /// the boundary unchanged; a live track without one yet needs more
    /// data.
    fn keyframe_at_or_after(&self, queue: &TrackQueue, boundary: u64) -> Result<u64> {
        let ts = self.config.timescale;
        for (i, sample) in queue.samples.iter().enumerate() {
            let t = queue.ts(i, ts);
            if sample.keyframe && t >= boundary {
                return Ok(t);
            }
        }
        if queue.ended {
            Ok(boundary)
        } else {
            Err(Error::InsufficientData)
        }
    }

    /// Chunk cut for one keyframe track: the earliest keyframe in
    /// `[min, end)`, else `end` once a sample at or past it proves no
    /// earlier keyframe exists.
    fn chunk_cut(&self, queue: &TrackQueue, min: u64, end: u64) -> Result<u64> {
        let ts = self.config.timescale;
        for (i, sample) in queue.samples.iter().enumerate() {
            let t = queue.ts(i, ts);
            if sample.keyframe && t >= min && t < end {
                return Ok(t);
            }
            if t >= end {
                return Ok(end);
            }
        }
        if queue.ended {
            return Ok(end);
        }
        Err(Error::InsufficientData)
    }

    /// Verify a keyframe-less track has a sample at or past the
    /// boundary (or has ended), so the cut point is proven.
    fn plain_cut(&self, queue: &TrackQueue, boundary: u64) -> Result<()> {
        let ts = self.config.timescale;
        let reaches = (0..queue.samples.len()).any(|i| queue.ts(i, ts) >= boundary);
        if reaches || queue.ended {
            Ok(())
        } else {
            Err(Error::InsufficientData)
        }
    }

    fn drain_until(&mut self, start: u64, boundary: u64) -> Segment {
        let ts = self.config.timescale;
        let mut tracks = Vec::new();
        let mut independent = true;

        for (track_id, queue) in self.queues.iter_mut() {
            let mut samples = Vec::new();
            loop {
                let within = queue
                    .samples
                    .front()
                    .is_some_and(|s| rescale(s.dts, queue.timescale, ts) < boundary);
                if !within {
                    break;
                }
                if let Some(sample) = queue.samples.pop_front() {
                    samples.push(sample);
                }
            }
            if queue.has_keyframes {
                if let Some(first) = samples.first() {
                    independent &= first.keyframe;
                }
            }
            if !samples.is_empty() {
                tracks.push(SegmentTrack {
                    track_id: *track_id,
                    timescale: queue.timescale,
                    samples,
                });
            }
        }

        self.segment_start = Some(boundary);
        debug!(
            start,
            end = boundary,
            independent,
            tracks = tracks.len(),
            "finalized segment"
        );
        Segment {
            start,
            end: boundary,
            independent,
            tracks,
        }
    }
}
