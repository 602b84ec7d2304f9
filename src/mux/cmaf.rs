//! CMAF muxer: a header segment followed by `styp`+`sidx`+`moof`+`mdat`
//! fragments, with boundaries chosen by the segmentation engine.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use super::{assembly, MediaDescriptor, Track};
use crate::boxes::serialize_boxes;
use crate::segment::{InputSample, Segment, SegmentAssembler, SegmentConfig};
use crate::{Error, Result};

/// Fragmented CMAF muxer.
///
/// Samples are queued per track; [`next_segment`](Self::next_segment)
/// and [`next_chunk`](Self::next_chunk) return
/// [`Error::InsufficientData`] until the segmentation engine can prove
/// a boundary, at which point one whole fragment is emitted.
#[derive(Debug)]
pub struct CmafMuxer {
    movie_timescale: u32,
    tracks: BTreeMap<u32, Track>,
    assembler: SegmentAssembler,
    sequence_number: u32,
    header_emitted: bool,
}

impl CmafMuxer {
    pub fn new(movie_timescale: u32, config: SegmentConfig) -> Result<Self> {
        Ok(Self {
            movie_timescale,
            tracks: BTreeMap::new(),
            assembler: SegmentAssembler::new(config)?,
            sequence_number: 1,
            header_emitted: false,
        })
    }

    /// Register a track with its codec descriptor. Video tracks gate
    /// segment boundaries on keyframes.
    pub fn add_track(
        &mut self,
        track_id: u32,
        timescale: u32,
        media: MediaDescriptor,
    ) -> Result<()> {
        if self.header_emitted {
            return Err(Error::invalid_box(
                "tracks must be added before the header segment",
            ));
        }
        let is_video = media.is_video();
        let mut track = Track::new(track_id, timescale);
        track.media = Some(media);
        self.assembler.add_track(track_id, timescale, is_video);
        self.tracks.insert(track_id, track);
        Ok(())
    }

    /// The CMAF header segment: `ftyp` + fragmented `moov` with `mvex`.
    pub fn header(&mut self) -> Result<Bytes> {
        let tracks: Vec<&Track> = self.tracks.values().collect();
        if tracks.is_empty() {
            return Err(Error::invalid_box("no tracks registered"));
        }
        let mut out = BytesMut::new();
        out.extend_from_slice(&serialize_boxes(&assembly::ftyp())?);
        out.extend_from_slice(&serialize_boxes(&assembly::moov(
            &tracks,
            self.movie_timescale,
            true,
        )?)?);
        self.header_emitted = true;
        Ok(out.freeze())
    }

    /// Queue one sample for segmentation.
    pub fn push_sample(&mut self, track_id: u32, sample: InputSample) -> Result<()> {
        self.assembler.push(track_id, sample)
    }

    /// Mark a track's input as finished.
    pub fn end_track(&mut self, track_id: u32) {
        self.assembler.end_track(track_id);
    }

    /// Emit the next full segment as one fragment.
    pub fn next_segment(&mut self) -> Result<Bytes> {
        let segment = self.assembler.collect_segment()?;
        self.fragment(segment)
    }

    /// Emit the next partial segment (chunk) as one fragment.
    pub fn next_chunk(&mut self) -> Result<Bytes> {
        let segment = self.assembler.collect_chunk()?;
        self.fragment(segment)
    }

    /// Flush whatever is still queued as a final fragment. Call after
    /// ending every track.
    pub fn finish(&mut self) -> Result<Option<Bytes>> {
        match self.assembler.drain() {
            Some(segment) => Ok(Some(self.fragment(segment)?)),
            None => Ok(None),
        }
    }

    fn fragment(&mut self, segment: Segment) -> Result<Bytes> {
        let fragment_tracks: Vec<assembly::FragmentTrack<'_>> = segment
            .tracks
            .iter()
            .map(|t| assembly::FragmentTrack {
                track_id: t.track_id,
                base_decode_time: t.samples.first().map_or(0, |s| s.dts),
                samples: &t.samples,
            })
            .collect();

        // The moof size does not depend on the data-offset values, so a
        // zero-offset pass measures it and a second pass fills them in.
        let zero_offsets = vec![0i64; fragment_tracks.len()];
        let measured = serialize_boxes(&assembly::moof(
            self.sequence_number,
            &fragment_tracks,
            &zero_offsets,
        ))?;

        let mut mdat = BytesMut::new();
        let mut offsets = Vec::with_capacity(fragment_tracks.len());
        for track in &segment.tracks {
            offsets.push(measured.len() as i64 + 8 + mdat.len() as i64);
            for sample in &track.samples {
                mdat.extend_from_slice(&sample.payload);
            }
        }

        let moof_bytes = serialize_boxes(&assembly::moof(
            self.sequence_number,
            &fragment_tracks,
            &offsets,
        ))?;
        let mdat_bytes = serialize_boxes(&assembly::mdat(mdat.freeze()))?;

        let referenced_size = (moof_bytes.len() + mdat_bytes.len()) as u32;
        let reference_id = segment.tracks.first().map_or(1, |t| t.track_id);
        let sidx_bytes = serialize_boxes(&assembly::sidx(
            reference_id,
            self.assembler_timescale(),
            segment.start,
            referenced_size,
            (segment.end - segment.start) as u32,
            segment.independent,
        ))?;

        let mut out = BytesMut::new();
        out.extend_from_slice(&serialize_boxes(&assembly::styp())?);
        out.extend_from_slice(&sidx_bytes);
        out.extend_from_slice(&moof_bytes);
        out.extend_from_slice(&mdat_bytes);

        debug!(
            sequence_number = self.sequence_number,
            start = segment.start,
            end = segment.end,
            independent = segment.independent,
            bytes = out.len(),
            "emitted fragment"
        );
        self.sequence_number += 1;
        Ok(out.freeze())
    }

    fn assembler_timescale(&self) -> u32 {
        self.assembler.config().timescale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::{parse_boxes, BoxType, FieldValue};

    fn test_config() -> SegmentConfig {
        SegmentConfig {
            timescale: 1000,
            min_duration: 1500,
            target_duration: 2000,
            chunk: None,
        }
    }

    fn video_sample(dts: u64, keyframe: bool) -> InputSample {
        InputSample {
            payload: Bytes::from(vec![0xAB; 16]),
            dts,
            pts: dts as i64,
            duration: 100,
            keyframe,
        }
    }

    fn video_muxer() -> CmafMuxer {
        let mut muxer = CmafMuxer::new(1000, test_config()).unwrap();
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
        muxer
    }

    #[test]
    fn test_header_segment_shape() {
        let mut muxer = video_muxer();
        let header = muxer.header().unwrap();
        let (tree, rest) = parse_boxes(&header).unwrap();
        assert!(rest.is_empty());
        assert!(tree.get(BoxType::FTYP).is_some());
        let moov = tree.require(BoxType::MOOV).unwrap();
        assert!(moov.child(BoxType::MVEX).is_some());
        assert_eq!(moov.require_child(BoxType::MVHD).unwrap().field_u64("duration").unwrap(), 0);
    }

    #[test]
    fn test_fragment_emission() {
        let mut muxer = video_muxer();
        muxer.header().unwrap();

        assert!(matches!(
            muxer.next_segment(),
            Err(Error::InsufficientData)
        ));

        let mut dts = 0;
        while dts < 2500 {
            muxer
                .push_sample(1, video_sample(dts, dts % 2000 == 0))
                .unwrap();
            dts += 100;
        }

        let fragment = muxer.next_segment().unwrap();
        let (tree, rest) = parse_boxes(&fragment).unwrap();
        assert!(rest.is_empty());
        assert!(tree.get(BoxType::STYP).is_some());
        assert!(tree.get(BoxType::SIDX).is_some());

        let moof = tree.require(BoxType::MOOF).unwrap();
        assert_eq!(
            moof.require_child(BoxType::MFHD).unwrap().field_u64("sequence_number").unwrap(),
            1
        );
        let traf = moof.require_child(BoxType::TRAF).unwrap();
        assert_eq!(
            traf.require_child(BoxType::TFDT)
                .unwrap()
                .field_u64("base_media_decode_time")
                .unwrap(),
            0
        );
        let trun = traf.require_child(BoxType::TRUN).unwrap();
        assert_eq!(trun.field_u64("sample_count").unwrap(), 20);
        assert_eq!(
            tree.require(BoxType::MDAT).unwrap().content().unwrap().len(),
            20 * 16
        );

        // The data offset points at the first mdat payload byte,
        // measured from the start of moof.
        let moof_size = {
            let styp_len = 24u64; // 8 + 4 + 4 + 2 brands
            let sidx = &fragment[styp_len as usize..];
            let sidx_len = u32::from_be_bytes([sidx[0], sidx[1], sidx[2], sidx[3]]) as usize;
            let moof_start = styp_len as usize + sidx_len;
            u32::from_be_bytes([
                fragment[moof_start],
                fragment[moof_start + 1],
                fragment[moof_start + 2],
                fragment[moof_start + 3],
            ]) as i64
        };
        assert_eq!(trun.field_i64("data_offset").unwrap(), moof_size + 8);

        // Sequence numbers advance per fragment.
        let fragment2 = muxer.next_segment();
        assert!(matches!(fragment2, Err(Error::InsufficientData)));
        muxer.end_track(1);
        let tail = muxer.finish().unwrap().unwrap();
        let (tree2, _) = parse_boxes(&tail).unwrap();
        assert_eq!(
            tree2
                .require(BoxType::MOOF)
                .unwrap()
                .require_child(BoxType::MFHD)
                .unwrap()
                .field_u64("sequence_number")
                .unwrap(),
            2
        );
    }

    #[test]
    fn test_fragment_base_decode_time_advances() {
        let mut muxer = video_muxer();
        muxer.header().unwrap();
        let mut dts = 0;
        while dts < 4500 {
            muxer
                .push_sample(1, video_sample(dts, dts % 2000 == 0))
                .unwrap();
            dts += 100;
        }

        muxer.next_segment().unwrap();
        let second = muxer.next_segment().unwrap();
        let (tree, _) = parse_boxes(&second).unwrap();
        let tfdt = tree
            .require(BoxType::MOOF)
            .unwrap()
            .require_child(BoxType::TRAF)
            .unwrap()
            .require_child(BoxType::TFDT)
            .unwrap();
        assert_eq!(tfdt.field_u64("base_media_decode_time").unwrap(), 2000);

        let sidx = tree.require(BoxType::SIDX).unwrap();
        assert_eq!(sidx.field_u64("earliest_presentation_time").unwrap(), 2000);
        let reference = &sidx.field_list("references").unwrap()[0];
        assert_eq!(
            reference
                .group_field("starts_with_sap")
                .and_then(FieldValue::as_u64),
            Some(1)
        );
    }
}
