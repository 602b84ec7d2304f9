//! cmafbox: ISO-BMFF container engine for MP4 and CMAF
//!
//! This crate parses, muxes and demuxes the nested "box" binary format
//! of ISO/IEC 14496-12 files and CMAF segment streams. It is pipeline
//! framework agnostic: callers deliver ordered byte buffers in and
//! consume ordered samples or boxes out, with all suspension modeled as
//! explicit insufficient-data returns.
//!
//! # Modules
//!
//! - `boxes` - declarative box schema and the generic container codec
//! - `sample_table` - incremental stts/stsc/stsz/stco/ctts/stss
//!   construction and its inverse, the flat offset-ordered sample reader
//! - `mux` - progressive ISOM muxer, CMAF muxer and pure box assembly
//! - `segment` - keyframe-aligned CMAF segment/chunk boundary engine
//! - `demux` - push-based ISOM and CMAF demux state machines
//!
//! # Architecture
//!
//! Box layouts live in one declarative schema table interpreted by a
//! single recursive codec, so every supported box round-trips
//! byte-exact through the same two functions. On top of that sit the
//! sample-table engine (write and read sides), stateless assembly
//! functions producing `moov`/`moof`/`sidx` trees, the segmentation
//! engine that picks keyframe-aligned boundaries across tracks, and the
//! demux state machines that turn byte streams back into per-track
//! sample streams.

pub mod boxes;
pub mod demux;
pub mod error;
pub mod mux;
pub mod sample_table;
pub mod segment;

pub use boxes::{parse_boxes, serialize_boxes, BoxNode, BoxTree, BoxType, FieldValue};
pub use demux::{CmafDemuxer, DemuxEvent, IsomDemuxer};
pub use error::{Error, Result};
pub use mux::{CmafMuxer, MediaDescriptor, MuxOutput, Muxer};
pub use sample_table::{OutputSample, SampleTable, SamplesInfo, TrackDescription};
pub use segment::{InputSample, Segment, SegmentAssembler, SegmentConfig};
