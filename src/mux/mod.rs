//! Muxing: track state, box assembly and the progressive (ISOM) muxer.
//!
//! The progressive muxer writes `ftyp`, an open-ended `mdat` filled by
//! interleaved per-track chunk flushes, and a trailing `moov` built from
//! the accumulated sample tables. Sinks that can seek receive a patch
//! instruction for the `mdat` size header; sinks that cannot get the
//! whole `mdat` buffered in memory and emitted at finalization (a
//! deliberate resource trade-off, not an oversight).

pub mod assembly;
mod cmaf;

pub use cmaf::CmafMuxer;

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::sample_table::{rescale, SampleTable};
use crate::{Error, Result};

/// Opaque codec description for one track. The variant tag determines
/// handler type, media header choice (`vmhd` vs `smhd`) and default
/// volume; the payloads are carried into `stsd` uninterpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaDescriptor {
    /// H.264: `avcC` content (parameter sets).
    Avc { config: Bytes, width: u16, height: u16 },
    /// H.265: `hvcC` content.
    Hevc { config: Bytes, width: u16, height: u16 },
    /// AAC: ES descriptor carried in `esds`.
    Aac {
        es_descriptor: Bytes,
        channels: u16,
        sample_rate: u32,
    },
    /// Opus: `dOps` content.
    Opus {
        config: Bytes,
        channels: u16,
        sample_rate: u32,
    },
}

impl MediaDescriptor {
    /// Whether this is a video descriptor.
    pub fn is_video(&self) -> bool {
        matches!(self, Self::Avc { .. } | Self::Hevc { .. })
    }
}

/// One output track of the progressive muxer.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: u32,
    pub timescale: u32,
    media: Option<MediaDescriptor>,
    sample_table: SampleTable,
}

impl Track {
    fn new(id: u32, timescale: u32) -> Self {
        Self {
            id,
            timescale,
            media: None,
            sample_table: SampleTable::new(),
        }
    }

    /// The codec descriptor, once discovered.
    pub fn media(&self) -> Option<&MediaDescriptor> {
        self.media.as_ref()
    }

    /// The sample table built so far.
    pub fn sample_table(&self) -> &SampleTable {
        &self.sample_table
    }
}

/// One piece of muxer output.
#[derive(Debug, Clone)]
pub enum MuxOutput {
    /// Append these bytes to the sink.
    Data(Bytes),
    /// Overwrite previously written bytes at the given absolute offset.
    /// Only emitted for seekable sinks.
    Patch { offset: u64, data: Bytes },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MuxState {
    Created,
    Writing,
    Finalized,
}

/// Progressive ISOM muxer.
///
/// Chunk flushes from different tracks land in `mdat` in call order, so
/// callers control the physical interleaving. The `mdat` header is
/// always written in its 16-byte extended form so chunk offsets are
/// known before the total size is.
#[derive(Debug)]
pub struct Muxer {
    movie_timescale: u32,
    seekable: bool,
    tracks: BTreeMap<u32, Track>,
    state: MuxState,
    /// Absolute offset of the next byte the sink will receive.
    position: u64,
    /// Absolute offset of the `mdat` header.
    mdat_start: u64,
    /// Bytes of `mdat` content written (or buffered) so far.
    mdat_content: u64,
    /// Chunk data awaiting finalization on non-seekable sinks.
    buffered: BytesMut,
}

const MDAT_HEADER_SIZE: u64 = 16;

impl Muxer {
    pub fn new(movie_timescale: u32, seekable: bool) -> Self {
        Self {
            movie_timescale,
            seekable,
            tracks: BTreeMap::new(),
            state: MuxState::Created,
            position: 0,
            mdat_start: 0,
            mdat_content: 0,
            buffered: BytesMut::new(),
        }
    }

    /// Register an output track.
    pub fn add_track(&mut self, id: u32, timescale: u32) -> Result<()> {
        if self.state != MuxState::Created {
            return Err(Error::invalid_box("tracks must be added before start"));
        }
        self.tracks.insert(id, Track::new(id, timescale));
        Ok(())
    }

    /// Record a track's codec descriptor.
    ///
    /// The first descriptor sticks; a different one arriving later is a
    /// [`Error::VariableFormat`] error.
    pub fn set_media(&mut self, track_id: u32, media: MediaDescriptor) -> Result<()> {
        let track = self.track_mut(track_id)?;
        match &track.media {
            None => {
                track.media = Some(media);
                Ok(())
            }
            Some(existing) if *existing == media => Ok(()),
            Some(_) => Err(Error::VariableFormat { track_id }),
        }
    }

    /// Begin the stream: emits `ftyp` and the `mdat` header position.
    pub fn start(&mut self) -> Result<Vec<MuxOutput>> {
        if self.state != MuxState::Created {
            return Err(Error::invalid_box("muxer already started"));
        }
        self.state = MuxState::Writing;

        let ftyp = crate::boxes::serialize_boxes(&assembly::ftyp())?;
        self.mdat_start = ftyp.len() as u64;

        let mut out = vec![MuxOutput::Data(ftyp)];
        if self.seekable {
            // Placeholder extended header, patched at finalization.
            let mut header = BytesMut::with_capacity(MDAT_HEADER_SIZE as usize);
            header.put_u32(1);
            header.put_slice(b"mdat");
            header.put_u64(MDAT_HEADER_SIZE);
            out.push(MuxOutput::Data(header.freeze()));
            self.position = self.mdat_start + MDAT_HEADER_SIZE;
        } else {
            self.position = self.mdat_start;
        }
        Ok(out)
    }

    /// Append one sample to a track's open chunk.
    pub fn push_sample(
        &mut self,
        track_id: u32,
        payload: Bytes,
        dts: u64,
        cts_offset: i32,
        keyframe: bool,
    ) -> Result<()> {
        if self.state != MuxState::Writing {
            return Err(Error::invalid_box("muxer is not writing"));
        }
        let track = self.track_mut(track_id)?;
        track.sample_table.store_sample(payload, dts, cts_offset, keyframe);
        Ok(())
    }

    /// Close a track's open chunk and write it into `mdat`.
    ///
    /// An empty chunk produces no output and no table entry.
    pub fn flush_chunk(&mut self, track_id: u32) -> Result<Vec<MuxOutput>> {
        if self.state != MuxState::Writing {
            return Err(Error::invalid_box("muxer is not writing"));
        }
        let offset = self.mdat_start + MDAT_HEADER_SIZE + self.mdat_content;
        let track = self.track_mut(track_id)?;
        let chunk = track.sample_table.flush_chunk(offset);
        if chunk.is_empty() {
            return Ok(Vec::new());
        }
        self.mdat_content += chunk.len() as u64;
        if self.seekable {
            self.position += chunk.len() as u64;
            Ok(vec![MuxOutput::Data(chunk)])
        } else {
            self.buffered.extend_from_slice(&chunk);
            Ok(Vec::new())
        }
    }

    /// Finish the stream: flushes open chunks, completes `mdat` and
    /// emits the trailing `moov`.
    pub fn finalize(&mut self) -> Result<Vec<MuxOutput>> {
        if self.state != MuxState::Writing {
            return Err(Error::invalid_box("muxer is not writing"));
        }

        let ids: Vec<u32> = self.tracks.keys().copied().collect();
        let mut out = Vec::new();
        for id in ids {
            out.extend(self.flush_chunk(id)?);
        }
        self.state = MuxState::Finalized;

        for track in self.tracks.values() {
            if track.media.is_none() {
                return Err(Error::invalid_box(format!(
                    "track {} has no media descriptor",
                    track.id
                )));
            }
        }

        let mdat_size = MDAT_HEADER_SIZE + self.mdat_content;
        let mut header = BytesMut::with_capacity(MDAT_HEADER_SIZE as usize);
        header.put_u32(1);
        header.put_slice(b"mdat");
        header.put_u64(mdat_size);

        if self.seekable {
            out.push(MuxOutput::Patch {
                offset: self.mdat_start,
                data: header.freeze(),
            });
        } else {
            out.push(MuxOutput::Data(header.freeze()));
            out.push(MuxOutput::Data(self.buffered.split().freeze()));
            self.position = self.mdat_start + mdat_size;
        }

        let tracks: Vec<&Track> = self.tracks.values().collect();
        let moov = assembly::moov(&tracks, self.movie_timescale, false)?;
        let moov_bytes = crate::boxes::serialize_boxes(&moov)?;
        self.position += moov_bytes.len() as u64;
        debug!(
            mdat_bytes = self.mdat_content,
            moov_bytes = moov_bytes.len(),
            tracks = self.tracks.len(),
            "finalized progressive mux"
        );
        out.push(MuxOutput::Data(moov_bytes));
        Ok(out)
    }

    fn track_mut(&mut self, track_id: u32) -> Result<&mut Track> {
        self.tracks
            .get_mut(&track_id)
            .ok_or_else(|| Error::invalid_box(format!("unknown track {track_id}")))
    }
}

/// Track duration in the movie timescale, for `tkhd`/`mvhd`.
fn movie_duration(track: &Track, movie_timescale: u32) -> u64 {
    rescale(
        track.sample_table().total_duration(),
        track.timescale,
        movie_timescale,
    )
}
