//! Demuxing: push-based state machines for plain ISOM files and CMAF
//! segment streams.
//!
//! Both demuxers accept arbitrary byte chunks with no box alignment,
//! buffer partial boxes internally and report progress as events.
//! Samples are held back until every discovered track has an output
//! consumer attached, then flushed in original order.

mod cmaf;

pub use cmaf::CmafDemuxer;

use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};
use tracing::debug;

use crate::boxes::{parse_boxes, BoxHeader, BoxNode, BoxType};
use crate::sample_table::{OutputSample, SamplesInfo, TrackDescription};
use crate::{Error, Result};

/// One unit of demuxer progress.
#[derive(Debug, Clone)]
pub enum DemuxEvent {
    /// A track was discovered; emitted once per track, before any of
    /// its samples.
    NewTrack(TrackDescription),
    /// A sample for an attached consumer.
    Sample { consumer: u32, sample: OutputSample },
    /// The source should continue delivering bytes from this absolute
    /// offset. Any bytes pushed before the reposition are discarded.
    Seek { offset: u64 },
}

/// Track-to-consumer bindings, resolved in one reconciliation step.
///
/// Samples demuxed before every track has a consumer are held in
/// arrival order and flushed when the last binding lands.
#[derive(Debug, Default)]
struct ConsumerMap {
    expected: Vec<u32>,
    bindings: HashMap<u32, u32>,
    held: Vec<OutputSample>,
}

impl ConsumerMap {
    fn set_expected(&mut self, tracks: &[TrackDescription]) {
        self.expected = tracks.iter().map(|t| t.track_id).collect();
    }

    fn complete(&self) -> bool {
        !self.expected.is_empty()
            && self
                .expected
                .iter()
                .all(|id| self.bindings.contains_key(id))
    }

    fn attach(&mut self, track_id: u32, consumer: u32) -> Result<Vec<DemuxEvent>> {
        if self.expected.is_empty() {
            return Err(Error::invalid_box(
                "consumers cannot attach before tracks are discovered",
            ));
        }
        if !self.expected.contains(&track_id) {
            return Err(Error::invalid_box(format!("unknown track {track_id}")));
        }
        if self.bindings.insert(track_id, consumer).is_some() {
            return Err(Error::invalid_box(format!(
                "track {track_id} already has a consumer"
            )));
        }

        let mut events = Vec::new();
        if self.complete() {
            let held = std::mem::take(&mut self.held);
            for sample in held {
                self.route_one(sample, &mut events);
            }
        }
        Ok(events)
    }

    fn route(&mut self, samples: Vec<OutputSample>, events: &mut Vec<DemuxEvent>) {
        for sample in samples {
            if self.complete() {
                self.route_one(sample, events);
            } else {
                self.held.push(sample);
            }
        }
    }

    fn route_one(&self, sample: OutputSample, events: &mut Vec<DemuxEvent>) {
        if let Some(&consumer) = self.bindings.get(&sample.track_id) {
            events.push(DemuxEvent::Sample { consumer, sample });
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum IsomState {
    /// Reading top-level boxes until `moov` (and `mdat`) are located.
    ReadingMetadata,
    /// A seek past `mdat` was issued; metadata reading resumes at the
    /// delivered offset.
    SkippingMdat,
    /// Streaming `mdat` content into the sample reader. `remaining` is
    /// the content left on the wire; `None` for a size-0 `mdat` that
    /// runs to end of stream.
    ReadingMdat { remaining: Option<u64> },
    /// All samples delivered; trailing boxes are ignored.
    Trailing,
}

impl IsomState {
    fn name(self) -> &'static str {
        match self {
            Self::ReadingMetadata => "metadata_reading",
            Self::SkippingMdat => "mdat_skipping",
            Self::ReadingMdat { .. } => "mdat_reading",
            Self::Trailing => "trailing",
        }
    }
}

/// Push-based demuxer for plain (non-fragmented) ISOM files.
///
/// Non-fast-start files put `moov` after `mdat`. With a seekable source
/// the demuxer skips `mdat` via [`DemuxEvent::Seek`], reads `moov`,
/// then seeks back; without one it buffers the whole `mdat` in memory
/// until `moov` arrives (a documented resource trade-off).
#[derive(Debug)]
pub struct IsomDemuxer {
    seekable: bool,
    state: IsomState,
    buffer: BytesMut,
    /// Absolute stream offset of `buffer[0]`.
    position: u64,
    ftyp_seen: bool,
    moov: Option<BoxNode>,
    samples_info: Option<SamplesInfo>,
    /// `(content_offset, content_size)` of an `mdat` found before
    /// `moov` on a seekable source.
    skipped_mdat: Option<(u64, u64)>,
    /// Content of an `mdat` found before `moov` on a non-seekable
    /// source, with its absolute content offset.
    stashed_mdat: Option<(u64, Bytes)>,
    consumers: ConsumerMap,
}

impl IsomDemuxer {
    pub fn new(seekable: bool) -> Self {
        Self {
            seekable,
            state: IsomState::ReadingMetadata,
            buffer: BytesMut::new(),
            position: 0,
            ftyp_seen: false,
            moov: None,
            samples_info: None,
            skipped_mdat: None,
            stashed_mdat: None,
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
    ///
    /// Once every track is bound, samples held back so far are flushed
    /// in demux order.
    pub fn attach_consumer(&mut self, track_id: u32, consumer: u32) -> Result<Vec<DemuxEvent>> {
        self.consumers.attach(track_id, consumer)
    }

    /// Signal that the source has no more bytes.
    pub fn end_of_stream(&mut self) -> Result<Vec<DemuxEvent>> {
        let mut events = Vec::new();
        while self.step(&mut events)? {}
        match self.state {
            IsomState::ReadingMdat { .. } => {
                let remaining = self.samples_info.as_ref().map_or(0, SamplesInfo::remaining);
                if remaining > 0 {
                    return Err(Error::invalid_box(format!(
                        "stream ended with {remaining} samples missing"
                    )));
                }
                self.set_state(IsomState::Trailing);
                Ok(events)
            }
            IsomState::Trailing => Ok(events),
            IsomState::ReadingMetadata | IsomState::SkippingMdat => Err(Error::invalid_box(
                "stream ended before metadata was complete",
            )),
        }
    }

    /// One state-machine step. `Ok(false)` means more input is needed.
    fn step(&mut self, events: &mut Vec<DemuxEvent>) -> Result<bool> {
        match self.state {
            IsomState::ReadingMetadata | IsomState::SkippingMdat => self.read_metadata(events),
            IsomState::ReadingMdat { remaining } => self.read_mdat(remaining, events),
            IsomState::Trailing => {
                let len = self.buffer.len();
                self.advance(len);
                Ok(false)
            }
        }
    }

    fn read_metadata(&mut self, events: &mut Vec<DemuxEvent>) -> Result<bool> {
        let (header, _) = match BoxHeader::parse(&self.buffer) {
            Ok(parsed) => parsed,
            Err(Error::InsufficientData) => return Ok(false),
            Err(e) => return Err(e),
        };
        // A 32-bit size of 0 means "to end of stream", which the header
        // parser resolves against the current buffer only.
        let unbounded = self.buffer[..4] == [0, 0, 0, 0];
        let total = header.header_size as u64 + header.content_size;

        if !self.ftyp_seen && header.box_type != BoxType::FTYP {
            return Err(Error::UnexpectedBox {
                state: self.state.name(),
                box_type: header.box_type,
            });
        }

        if header.box_type == BoxType::MDAT {
            return self.metadata_mdat(&header, unbounded, events);
        }

        // Every other box is taken whole; unknown types pass through as
        // opaque and are simply skipped at the top level.
        if unbounded || (self.buffer.len() as u64) < total {
            return Ok(false);
        }
        if header.box_type == BoxType::MOOV {
            let (tree, _) = parse_boxes(&self.buffer[..total as usize])?;
            if let Some((_, node)) = tree.0.into_iter().next() {
                self.moov = Some(node);
            }
            self.advance(total as usize);
            return self.metadata_complete(events);
        }
        if header.box_type == BoxType::FTYP {
            self.ftyp_seen = true;
        }
        self.advance(total as usize);
        Ok(true)
    }

    /// `mdat` encountered during metadata reading.
    fn metadata_mdat(
        &mut self,
        header: &BoxHeader,
        unbounded: bool,
        events: &mut Vec<DemuxEvent>,
    ) -> Result<bool> {
        let content_offset = self.position + header.header_size as u64;

        if self.moov.is_some() {
            // Fast-start file: stream the content directly.
            self.buffer.advance(header.header_size as usize);
            self.position = content_offset;
            self.begin_mdat(content_offset, (!unbounded).then_some(header.content_size), events)?;
            return Ok(true);
        }

        if unbounded {
            return Err(Error::invalid_box(
                "mdat extends to end of stream but moov has not been read",
            ));
        }

        if self.seekable {
            // Skip past mdat, read moov, come back later.
            let resume = self.position + header.header_size as u64 + header.content_size;
            self.skipped_mdat = Some((content_offset, header.content_size));
            self.buffer.clear();
            self.position = resume;
            self.set_state(IsomState::SkippingMdat);
            events.push(DemuxEvent::Seek { offset: resume });
            return Ok(false);
        }

        // Non-seekable: hold the whole mdat until moov shows up.
        let total = header.header_size as u64 + header.content_size;
        if (self.buffer.len() as u64) < total {
            return Ok(false);
        }
        let content = Bytes::copy_from_slice(
            &self.buffer[header.header_size as usize..total as usize],
        );
        self.stashed_mdat = Some((content_offset, content));
        self.advance(total as usize);
        Ok(true)
    }

    /// `moov` is parsed; decide how to reach the sample data.
    fn metadata_complete(&mut self, events: &mut Vec<DemuxEvent>) -> Result<bool> {
        if let Some((content_offset, content_size)) = self.skipped_mdat.take() {
            self.announce_tracks(content_offset, events)?;
            self.buffer.clear();
            self.position = content_offset;
            self.set_state(IsomState::ReadingMdat {
                remaining: Some(content_size),
            });
            events.push(DemuxEvent::Seek {
                offset: content_offset,
            });
            return Ok(false);
        }

        if let Some((content_offset, content)) = self.stashed_mdat.take() {
            self.announce_tracks(content_offset, events)?;
            let info = self.require_info()?;
            let (samples, _) = info.pop_available_samples(&content);
            let remaining = info.remaining();
            self.consumers.route(samples, events);
            if remaining > 0 {
                return Err(Error::invalid_box(format!(
                    "mdat ended with {remaining} samples missing"
                )));
            }
            self.set_state(IsomState::Trailing);
            return Ok(true);
        }

        // Fast-start: mdat has not arrived yet, keep reading metadata.
        Ok(true)
    }

    fn begin_mdat(
        &mut self,
        content_offset: u64,
        content_size: Option<u64>,
        events: &mut Vec<DemuxEvent>,
    ) -> Result<()> {
        self.announce_tracks(content_offset, events)?;
        self.set_state(IsomState::ReadingMdat {
            remaining: content_size,
        });
        Ok(())
    }

    /// Build the sample reader from `moov` and emit track events.
    fn announce_tracks(
        &mut self,
        mdat_content_offset: u64,
        events: &mut Vec<DemuxEvent>,
    ) -> Result<()> {
        let moov = self
            .moov
            .as_ref()
            .ok_or_else(|| Error::invalid_box("moov missing"))?;
        let info = SamplesInfo::new(moov, mdat_content_offset)?;
        self.consumers.set_expected(info.tracks());
        for track in info.tracks() {
            events.push(DemuxEvent::NewTrack(track.clone()));
        }
        debug!(
            tracks = info.tracks().len(),
            samples = info.remaining(),
            "sample tables unpacked"
        );
        self.samples_info = Some(info);
        Ok(())
    }

    fn read_mdat(
        &mut self,
        remaining: Option<u64>,
        events: &mut Vec<DemuxEvent>,
    ) -> Result<bool> {
        let avail = match remaining {
            Some(rem) => (self.buffer.len() as u64).min(rem) as usize,
            None => self.buffer.len(),
        };

        // Field access keeps the borrow off `self.buffer`.
        let info = self
            .samples_info
            .as_mut()
            .ok_or_else(|| Error::invalid_box("sample tables not yet unpacked"))?;
        let (samples, consumed) = info.pop_available_samples(&self.buffer[..avail]);
        let done = info.remaining() == 0;
        self.consumers.route(samples, events);
        self.advance(consumed);

        let mut remaining = remaining.map(|rem| rem - consumed as u64);
        if done {
            // Drop padding between the last sample and the end of mdat.
            match &mut remaining {
                Some(rem) => {
                    let skip = (self.buffer.len() as u64).min(*rem) as usize;
                    self.advance(skip);
                    *rem -= skip as u64;
                    if *rem == 0 {
                        self.set_state(IsomState::Trailing);
                        return Ok(true);
                    }
                }
                None => {
                    let len = self.buffer.len();
                    self.advance(len);
                }
            }
        }
        self.state = IsomState::ReadingMdat { remaining };
        Ok(consumed > 0)
    }

    fn require_info(&mut self) -> Result<&mut SamplesInfo> {
        self.samples_info
            .as_mut()
            .ok_or_else(|| Error::invalid_box("sample tables not yet unpacked"))
    }

    fn advance(&mut self, n: usize) {
        self.buffer.advance(n);
        self.position += n as u64;
    }

    fn set_state(&mut self, state: IsomState) {
        debug!(from = self.state.name(), to = state.name(), "demux state");
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{MediaDescriptor, MuxOutput, Muxer};

    fn avc_media() -> MediaDescriptor {
        MediaDescriptor::Avc {
            config: Bytes::from_static(b"\x01\x64\x00\x1f"),
            width: 1280,
            height: 720,
        }
    }

    fn collect_data(outputs: &[MuxOutput]) -> Vec<u8> {
        let mut data = Vec::new();
        for output in outputs {
            match output {
                MuxOutput::Data(bytes) => data.extend_from_slice(bytes),
                MuxOutput::Patch { offset, data: patch } => {
                    let start = *offset as usize;
                    data[start..start + patch.len()].copy_from_slice(patch);
                }
            }
        }
        data
    }

    /// ftyp + mdat + trailing moov, one video track, two samples.
    fn test_file() -> Vec<u8> {
        let mut muxer = Muxer::new(1000, false);
        muxer.add_track(1, 1000).unwrap();
        muxer.set_media(1, avc_media()).unwrap();
        let mut outputs = muxer.start().unwrap();
        muxer
            .push_sample(1, Bytes::from_static(b"first-frame"), 0, 0, true)
            .unwrap();
        muxer
            .push_sample(1, Bytes::from_static(b"second-frame!"), 1000, 0, false)
            .unwrap();
        outputs.extend(muxer.flush_chunk(1).unwrap());
        outputs.extend(muxer.finalize().unwrap());
        collect_data(&outputs)
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
    fn test_whole_file_single_push() {
        let file = test_file();
        let mut demuxer = IsomDemuxer::new(false);

        let mut events = demuxer.push(&file).unwrap();
        assert!(matches!(events[0], DemuxEvent::NewTrack(ref t) if t.track_id == 1));
        // Samples wait for the consumer.
        assert!(samples(&events).is_empty());

        events.extend(demuxer.attach_consumer(1, 7).unwrap());
        events.extend(demuxer.end_of_stream().unwrap());
        let got = samples(&events);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].payload.as_ref(), b"first-frame");
        assert_eq!(got[0].dts, 0);
        assert_eq!(got[1].payload.as_ref(), b"second-frame!");
        assert_eq!(got[1].dts, 1000);
        assert!(events.iter().all(|e| {
            !matches!(e, DemuxEvent::Sample { consumer, .. } if *consumer != 7)
        }));
    }

    #[test]
    fn test_arbitrary_chunk_sizes() {
        let file = test_file();
        let mut demuxer = IsomDemuxer::new(false);
        let mut events = Vec::new();
        for chunk in file.chunks(7) {
            events.extend(demuxer.push(chunk).unwrap());
        }
        events.extend(demuxer.attach_consumer(1, 1).unwrap());
        events.extend(demuxer.end_of_stream().unwrap());
        assert_eq!(samples(&events).len(), 2);
    }

    #[test]
    fn test_seekable_source_skips_mdat() {
        let file = test_file();
        let mut demuxer = IsomDemuxer::new(true);

        // Feed up to a few bytes into mdat; demuxer asks to skip ahead.
        let events = demuxer.push(&file[..60]).unwrap();
        let Some(DemuxEvent::Seek { offset: resume }) = events.last() else {
            panic!("expected a seek past mdat, got {events:?}");
        };
        let resume = *resume as usize;
        assert!(resume > 60 && resume < file.len());

        // Deliver from the seek target: moov parses, tracks appear and
        // the demuxer asks to go back to the mdat content.
        let mut events = demuxer.push(&file[resume..]).unwrap();
        assert!(matches!(events[0], DemuxEvent::NewTrack(_)));
        let Some(DemuxEvent::Seek { offset: back }) = events.last() else {
            panic!("expected a seek back to mdat, got {events:?}");
        };
        let back = *back as usize;
        assert!(back < resume);

        events.extend(demuxer.attach_consumer(1, 3).unwrap());
        events.extend(demuxer.push(&file[back..resume]).unwrap());
        events.extend(demuxer.end_of_stream().unwrap());
        let got = samples(&events);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].payload.as_ref(), b"first-frame");
    }

    #[test]
    fn test_box_before_ftyp_rejected() {
        let mut demuxer = IsomDemuxer::new(false);
        let mut bogus = Vec::new();
        bogus.extend_from_slice(&16u32.to_be_bytes());
        bogus.extend_from_slice(b"mdat");
        bogus.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            demuxer.push(&bogus),
            Err(Error::UnexpectedBox {
                state: "metadata_reading",
                ..
            })
        ));
    }

    #[test]
    fn test_attach_unknown_track_rejected() {
        let file = test_file();
        let mut demuxer = IsomDemuxer::new(false);
        demuxer.push(&file).unwrap();
        assert!(demuxer.attach_consumer(9, 0).is_err());
    }

    #[test]
    fn test_attach_before_discovery_rejected() {
        let mut demuxer = IsomDemuxer::new(false);
        assert!(demuxer.attach_consumer(1, 0).is_err());
    }
}
