//! Pure box-tree assembly for muxer output.
//!
//! Everything here maps track/segment metadata to [`BoxTree`] values;
//! serialization happens through the generic schema codec, so sizes are
//! always derived bottom-up.

use bytes::Bytes;

use super::{movie_duration, MediaDescriptor, Track};
use crate::boxes::{BoxNode, BoxTree, BoxType, FieldValue};
use crate::segment::InputSample;
use crate::Result;

/// Identity transform matrix.
const MATRIX: [u8; 36] = matrix_bytes();

const fn matrix_bytes() -> [u8; 36] {
    let words: [u32; 9] = [
        0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000,
    ];
    let mut out = [0u8; 36];
    let mut i = 0;
    while i < 9 {
        let be = words[i].to_be_bytes();
        out[i * 4] = be[0];
        out[i * 4 + 1] = be[1];
        out[i * 4 + 2] = be[2];
        out[i * 4 + 3] = be[3];
        i += 1;
    }
    out
}

// ISO 639-2 "und" packed into 5-bit letters.
const LANGUAGE_UND: u64 = 0x55C4;

fn u(value: u64) -> FieldValue {
    FieldValue::UInt(value)
}

fn int(value: i64) -> FieldValue {
    FieldValue::Int(value)
}

fn fx(int_part: u64, frac: u64) -> FieldValue {
    FieldValue::Fixed {
        int: int_part,
        frac,
    }
}

fn bin(data: impl Into<Bytes>) -> FieldValue {
    FieldValue::Bin(data.into())
}

fn node(
    fields: Vec<(&'static str, FieldValue)>,
    children: Vec<(BoxType, BoxNode)>,
) -> BoxNode {
    BoxNode::Value {
        fields,
        children: BoxTree::new(children),
    }
}

fn full(
    version: u64,
    flags: u64,
    mut rest: Vec<(&'static str, FieldValue)>,
) -> Vec<(&'static str, FieldValue)> {
    let mut fields = vec![("version", u(version)), ("flags", u(flags))];
    fields.append(&mut rest);
    fields
}

fn brand_list(brands: &[&'static [u8; 4]]) -> FieldValue {
    FieldValue::List(
        brands
            .iter()
            .map(|b| FieldValue::Bin(Bytes::from_static(*b)))
            .collect(),
    )
}

/// `ftyp` for both progressive files and CMAF header segments.
pub fn ftyp() -> BoxTree {
    let node = node(
        vec![
            ("major_brand", bin(Bytes::from_static(b"isom"))),
            ("minor_version", u(0x200)),
            (
                "compatible_brands",
                brand_list(&[b"isom", b"iso5", b"dash", b"mp42"]),
            ),
        ],
        Vec::new(),
    );
    BoxTree::new(vec![(BoxType::FTYP, node)])
}

/// `styp` heading each CMAF media segment.
pub fn styp() -> BoxTree {
    let node = node(
        vec![
            ("major_brand", bin(Bytes::from_static(b"msdh"))),
            ("minor_version", u(0)),
            ("compatible_brands", brand_list(&[b"msdh", b"msix"])),
        ],
        Vec::new(),
    );
    BoxTree::new(vec![(BoxType::STYP, node)])
}

/// `moov` with one `trak` per track. For `fragmented` output the sample
/// tables are left empty (samples live in fragments) and an `mvex` with
/// per-track `trex` defaults is appended.
pub fn moov(tracks: &[&Track], movie_timescale: u32, fragmented: bool) -> Result<BoxTree> {
    let duration = tracks
        .iter()
        .map(|t| movie_duration(t, movie_timescale))
        .max()
        .unwrap_or(0);
    let duration = if fragmented { 0 } else { duration };
    let next_track_id = tracks.iter().map(|t| t.id).max().unwrap_or(0) as u64 + 1;

    let mut children = vec![(
        BoxType::MVHD,
        node(
            full(
                1,
                0,
                vec![
                    ("creation_time", u(0)),
                    ("modification_time", u(0)),
                    ("timescale", u(movie_timescale as u64)),
                    ("duration", u(duration)),
                    ("rate", fx(1, 0)),
                    ("volume", fx(1, 0)),
                    ("matrix", bin(Bytes::copy_from_slice(&MATRIX))),
                    ("next_track_id", u(next_track_id)),
                ],
            ),
            Vec::new(),
        ),
    )];

    for track in tracks {
        children.push((
            BoxType::TRAK,
            trak(track, movie_timescale, fragmented)?,
        ));
    }

    if fragmented {
        let trex_children = tracks
            .iter()
            .map(|t| (BoxType::TREX, trex(t.id)))
            .collect();
        children.push((BoxType::MVEX, node(Vec::new(), trex_children)));
    }

    Ok(BoxTree::new(vec![(BoxType::MOOV, node(Vec::new(), children))]))
}

fn trak(track: &Track, movie_timescale: u32, fragmented: bool) -> Result<BoxNode> {
    let media = track.media().ok_or_else(|| {
        crate::Error::invalid_box(format!("track {} has no media descriptor", track.id))
    })?;
    let is_video = media.is_video();
    let duration = if fragmented {
        0
    } else {
        movie_duration(track, movie_timescale)
    };

    let (width, height) = match media {
        MediaDescriptor::Avc { width, height, .. }
        | MediaDescriptor::Hevc { width, height, .. } => (*width as u64, *height as u64),
        _ => (0, 0),
    };

    let tkhd = node(
        full(
            1,
            // Enabled, in movie, in preview.
            0x7,
            vec![
                ("creation_time", u(0)),
                ("modification_time", u(0)),
                ("track_id", u(track.id as u64)),
                ("duration", u(duration)),
                ("layer", int(0)),
                ("alternate_group", int(0)),
                ("volume", if is_video { fx(0, 0) } else { fx(1, 0) }),
                ("matrix", bin(Bytes::copy_from_slice(&MATRIX))),
                ("width", fx(width, 0)),
                ("height", fx(height, 0)),
            ],
        ),
        Vec::new(),
    );

    let media_duration = if fragmented {
        0
    } else {
        track.sample_table().total_duration()
    };
    let mdhd = node(
        full(
            1,
            0,
            vec![
                ("creation_time", u(0)),
                ("modification_time", u(0)),
                ("timescale", u(track.timescale as u64)),
                ("duration", u(media_duration)),
                ("language", u(LANGUAGE_UND)),
            ],
        ),
        Vec::new(),
    );

    let (handler, name) = if is_video {
        (b"vide", "VideoHandler")
    } else {
        (b"soun", "SoundHandler")
    };
    let hdlr = node(
        full(
            0,
            0,
            vec![
                ("handler_type", bin(Bytes::from_static(handler))),
                ("name", FieldValue::Str(name.to_owned())),
            ],
        ),
        Vec::new(),
    );

    let media_header = if is_video {
        (
            BoxType::VMHD,
            node(full(0, 1, vec![("graphics_mode", u(0))]), Vec::new()),
        )
    } else {
        (
            BoxType::SMHD,
            node(full(0, 0, vec![("balance", fx(0, 0))]), Vec::new()),
        )
    };

    let minf = node(
        Vec::new(),
        vec![
            media_header,
            (BoxType::DINF, dinf()),
            (BoxType::STBL, stbl(track, media, fragmented)),
        ],
    );

    let mdia = node(
        Vec::new(),
        vec![
            (BoxType::MDHD, mdhd),
            (BoxType::HDLR, hdlr),
            (BoxType::MINF, minf),
        ],
    );

    Ok(node(
        Vec::new(),
        vec![(BoxType::TKHD, tkhd), (BoxType::MDIA, mdia)],
    ))
}

fn dinf() -> BoxNode {
    // Self-contained data reference.
    let url = node(full(0, 1, Vec::new()), Vec::new());
    let dref = node(
        full(0, 0, vec![("entry_count", u(1))]),
        vec![(BoxType::URL, url)],
    );
    node(Vec::new(), vec![(BoxType::DREF, dref)])
}

fn stbl(track: &Track, media: &MediaDescriptor, fragmented: bool) -> BoxNode {
    let stsd = node(
        full(0, 0, vec![("entry_count", u(1))]),
        vec![sample_entry(media)],
    );

    let mut children = vec![(BoxType::STSD, stsd)];
    if fragmented {
        children.push((BoxType::STTS, empty_table()));
        children.push((BoxType::STSC, empty_table()));
        children.push((
            BoxType::STSZ,
            node(
                full(
                    0,
                    0,
                    vec![
                        ("sample_size", u(0)),
                        ("sample_count", u(0)),
                        ("entries", FieldValue::List(Vec::new())),
                    ],
                ),
                Vec::new(),
            ),
        ));
        children.push((BoxType::STCO, empty_table()));
    } else {
        let table = track.sample_table();
        children.push((BoxType::STTS, table.stts_node()));
        if let Some(ctts) = table.ctts_node() {
            children.push((BoxType::CTTS, ctts));
        }
        if let Some(stss) = table.stss_node() {
            children.push((BoxType::STSS, stss));
        }
        children.push((BoxType::STSC, table.stsc_node()));
        children.push((BoxType::STSZ, table.stsz_node()));
        children.push(table.chunk_offset_node());
    }

    node(Vec::new(), children)
}

fn empty_table() -> BoxNode {
    node(
        full(
            0,
            0,
            vec![
                ("entry_count", u(0)),
                ("entries", FieldValue::List(Vec::new())),
            ],
        ),
        Vec::new(),
    )
}

fn sample_entry(media: &MediaDescriptor) -> (BoxType, BoxNode) {
    match media {
        MediaDescriptor::Avc {
            config,
            width,
            height,
        } => (
            BoxType::AVC1,
            visual_entry(*width, *height, BoxType::AVCC, config.clone()),
        ),
        MediaDescriptor::Hevc {
            config,
            width,
            height,
        } => (
            BoxType::HVC1,
            visual_entry(*width, *height, BoxType::HVCC, config.clone()),
        ),
        MediaDescriptor::Aac {
            es_descriptor,
            channels,
            sample_rate,
        } => {
            let esds = node(
                full(0, 0, vec![("es_descriptor", bin(es_descriptor.clone()))]),
                Vec::new(),
            );
            (
                BoxType::MP4A,
                audio_entry(*channels, *sample_rate, BoxType::ESDS, esds),
            )
        }
        MediaDescriptor::Opus {
            config,
            channels,
            sample_rate,
        } => (
            BoxType::OPUS,
            audio_entry(
                *channels,
                *sample_rate,
                BoxType::DOPS,
                BoxNode::Opaque(config.clone()),
            ),
        ),
    }
}

fn visual_entry(width: u16, height: u16, config_type: BoxType, config: Bytes) -> BoxNode {
    node(
        vec![
            ("data_reference_index", u(1)),
            ("width", u(width as u64)),
            ("height", u(height as u64)),
            // 72 dpi.
            ("horizresolution", fx(0x48, 0)),
            ("vertresolution", fx(0x48, 0)),
            ("frame_count", u(1)),
            ("compressor_name", bin(Bytes::from_static(&[0u8; 32]))),
            ("depth", u(0x18)),
        ],
        vec![
            (config_type, BoxNode::Opaque(config)),
            // Square pixels.
            (
                BoxType::PASP,
                node(
                    vec![("h_spacing", u(1)), ("v_spacing", u(1))],
                    Vec::new(),
                ),
            ),
        ],
    )
}

fn audio_entry(
    channels: u16,
    sample_rate: u32,
    config_type: BoxType,
    config: BoxNode,
) -> BoxNode {
    node(
        vec![
            ("data_reference_index", u(1)),
            ("channel_count", u(channels as u64)),
            ("sample_size", u(16)),
            ("sample_rate", fx(sample_rate as u64, 0)),
        ],
        vec![(config_type, config)],
    )
}

fn trex(track_id: u32) -> BoxNode {
    node(
        full(
            0,
            0,
            vec![
                ("track_id", u(track_id as u64)),
                ("default_sample_description_index", u(1)),
                ("default_sample_duration", u(0)),
                ("default_sample_size", u(0)),
                ("default_sample_flags", u(0)),
            ],
        ),
        Vec::new(),
    )
}

/// Per-sample trun flags: data-offset, duration, size, flags and
/// composition offset all present.
const TRUN_FLAGS: u64 = 0x000001 | 0x000100 | 0x000200 | 0x000400 | 0x000800;
/// Default-base-is-moof.
const TFHD_FLAGS: u64 = 0x020000;
const SAMPLE_FLAGS_SYNC: u64 = 0x0200_0000;
const SAMPLE_FLAGS_NON_SYNC: u64 = 0x0101_0000;

/// One track's slice of a fragment.
pub struct FragmentTrack<'a> {
    pub track_id: u32,
    /// First sample's dts in the track timescale (tfdt).
    pub base_decode_time: u64,
    pub samples: &'a [InputSample],
}

/// `moof` for one fragment. `data_offsets[i]` is the signed distance
/// from the start of the `moof` box to track `i`'s first payload byte
/// inside the following `mdat`; callers compute it after measuring the
/// serialized `moof` (its size does not depend on the offset values).
pub fn moof(sequence_number: u32, tracks: &[FragmentTrack<'_>], data_offsets: &[i64]) -> BoxTree {
    let mfhd = node(
        full(0, 0, vec![("sequence_number", u(sequence_number as u64))]),
        Vec::new(),
    );

    let mut children = vec![(BoxType::MFHD, mfhd)];
    for (track, data_offset) in tracks.iter().zip(data_offsets) {
        let tfhd = node(
            full(0, TFHD_FLAGS, vec![("track_id", u(track.track_id as u64))]),
            Vec::new(),
        );
        let tfdt = node(
            full(
                1,
                0,
                vec![("base_media_decode_time", u(track.base_decode_time))],
            ),
            Vec::new(),
        );

        let samples = track
            .samples
            .iter()
            .map(|s| {
                let flags = if s.keyframe {
                    SAMPLE_FLAGS_SYNC
                } else {
                    SAMPLE_FLAGS_NON_SYNC
                };
                FieldValue::Group(vec![
                    ("sample_duration", u(s.duration)),
                    ("sample_size", u(s.payload.len() as u64)),
                    ("sample_flags", u(flags)),
                    (
                        "sample_composition_offset",
                        int(s.pts - s.dts as i64),
                    ),
                ])
            })
            .collect();
        let trun = node(
            full(
                1,
                TRUN_FLAGS,
                vec![
                    ("sample_count", u(track.samples.len() as u64)),
                    ("data_offset", int(*data_offset)),
                    ("samples", FieldValue::List(samples)),
                ],
            ),
            Vec::new(),
        );

        children.push((
            BoxType::TRAF,
            node(
                Vec::new(),
                vec![
                    (BoxType::TFHD, tfhd),
                    (BoxType::TFDT, tfdt),
                    (BoxType::TRUN, trun),
                ],
            ),
        ));
    }

    BoxTree::new(vec![(BoxType::MOOF, node(Vec::new(), children))])
}

/// `mdat` with the given content.
pub fn mdat(content: Bytes) -> BoxTree {
    BoxTree::new(vec![(BoxType::MDAT, BoxNode::Opaque(content))])
}

/// Single-reference `sidx` describing the `moof`+`mdat` that follows.
pub fn sidx(
    reference_id: u32,
    timescale: u32,
    earliest_presentation_time: u64,
    referenced_size: u32,
    subsegment_duration: u32,
    starts_with_sap: bool,
) -> BoxTree {
    let reference = FieldValue::Group(vec![
        ("reference_type", u(0)),
        ("referenced_size", u(referenced_size as u64)),
        ("subsegment_duration", u(subsegment_duration as u64)),
        ("starts_with_sap", u(starts_with_sap as u64)),
        ("sap_type", u(if starts_with_sap { 1 } else { 0 })),
        ("sap_delta_time", u(0)),
    ]);
    let node = node(
        full(
            1,
            0,
            vec![
                ("reference_id", u(reference_id as u64)),
                ("timescale", u(timescale as u64)),
                ("earliest_presentation_time", u(earliest_presentation_time)),
                ("first_offset", u(0)),
                ("reference_count", u(1)),
                ("references", FieldValue::List(vec![reference])),
            ],
        ),
        Vec::new(),
    );
    BoxTree::new(vec![(BoxType::SIDX, node)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::{parse_boxes, serialize_boxes};
    use crate::mux::Muxer;

    #[test]
    fn test_ftyp_round_trips() {
        let bytes = serialize_boxes(&ftyp()).unwrap();
        let (tree, rest) = parse_boxes(&bytes).unwrap();
        assert!(rest.is_empty());
        let node = tree.require(BoxType::FTYP).unwrap();
        assert_eq!(node.field("major_brand").unwrap().as_bin().unwrap().as_ref(), b"isom");
        assert_eq!(node.field_list("compatible_brands").unwrap().len(), 4);
    }

    #[test]
    fn test_fragmented_moov_shape() {
        let mut muxer = Muxer::new(1000, true);
        muxer.add_track(1, 90000).unwrap();
        muxer
            .set_media(
                1,
                MediaDescriptor::Avc {
                    config: Bytes::from_static(b"\x01\x64"),
                    width: 640,
                    height: 360,
                },
            )
            .unwrap();
        let tracks: Vec<&Track> = muxer.tracks.values().collect();

        let tree = moov(&tracks, 1000, true).unwrap();
        let bytes = serialize_boxes(&tree).unwrap();
        let (parsed, _) = parse_boxes(&bytes).unwrap();
        let moov_node = parsed.require(BoxType::MOOV).unwrap();

        let mvhd = moov_node.require_child(BoxType::MVHD).unwrap();
        assert_eq!(mvhd.field_u64("duration").unwrap(), 0);
        assert_eq!(mvhd.field_u64("next_track_id").unwrap(), 2);

        let mvex = moov_node.require_child(BoxType::MVEX).unwrap();
        let trex = mvex.require_child(BoxType::TREX).unwrap();
        assert_eq!(trex.field_u64("track_id").unwrap(), 1);

        let trak = moov_node.require_child(BoxType::TRAK).unwrap();
        let mdia = trak.require_child(BoxType::MDIA).unwrap();
        assert_eq!(
            mdia.require_child(BoxType::MDHD)
                .unwrap()
                .field_u64("language")
                .unwrap(),
            LANGUAGE_UND
        );
        let minf = mdia.require_child(BoxType::MINF).unwrap();
        assert!(minf.child(BoxType::VMHD).is_some());
        let stbl = minf.require_child(BoxType::STBL).unwrap();
        let avc1 = stbl
            .require_child(BoxType::STSD)
            .unwrap()
            .require_child(BoxType::AVC1)
            .unwrap();
        assert_eq!(avc1.field_u64("width").unwrap(), 640);
        assert_eq!(
            avc1.require_child(BoxType::AVCC)
                .unwrap()
                .content()
                .unwrap()
                .as_ref(),
            b"\x01\x64"
        );
    }

    #[test]
    fn test_audio_entries() {
        let mut muxer = Muxer::new(1000, true);
        muxer.add_track(1, 48000).unwrap();
        muxer
            .set_media(
                1,
                MediaDescriptor::Opus {
                    config: Bytes::from_static(b"\x00\x02"),
                    channels: 2,
                    sample_rate: 48000,
                },
            )
            .unwrap();
        let tracks: Vec<&Track> = muxer.tracks.values().collect();

        let bytes = serialize_boxes(&moov(&tracks, 1000, false).unwrap()).unwrap();
        let (parsed, _) = parse_boxes(&bytes).unwrap();
        let trak = parsed
            .require(BoxType::MOOV)
            .unwrap()
            .require_child(BoxType::TRAK)
            .unwrap();
        let minf = trak
            .require_child(BoxType::MDIA)
            .unwrap()
            .require_child(BoxType::MINF)
            .unwrap();
        assert!(minf.child(BoxType::SMHD).is_some());
        let opus = minf
            .require_child(BoxType::STBL)
            .unwrap()
            .require_child(BoxType::STSD)
            .unwrap()
            .require_child(BoxType::OPUS)
            .unwrap();
        assert_eq!(opus.field_u64("channel_count").unwrap(), 2);
        assert!(opus.child(BoxType::DOPS).is_some());
    }

    #[test]
    fn test_moof_size_independent_of_offsets() {
        let samples = vec![
            InputSample {
                payload: Bytes::from_static(b"abcd"),
                dts: 0,
                pts: 0,
                duration: 512,
                keyframe: true,
            },
            InputSample {
                payload: Bytes::from_static(b"efgh"),
                dts: 512,
                pts: 640,
                duration: 512,
                keyframe: false,
            },
        ];
        let track = FragmentTrack {
            track_id: 1,
            base_decode_time: 0,
            samples: &samples,
        };

        let a = serialize_boxes(&moof(1, std::slice::from_ref(&track), &[0])).unwrap();
        let b = serialize_boxes(&moof(1, std::slice::from_ref(&track), &[4096])).unwrap();
        assert_eq!(a.len(), b.len());

        let (parsed, _) = parse_boxes(&b).unwrap();
        let traf = parsed
            .require(BoxType::MOOF)
            .unwrap()
            .require_child(BoxType::TRAF)
            .unwrap();
        let trun = traf.require_child(BoxType::TRUN).unwrap();
        assert_eq!(trun.field_i64("data_offset").unwrap(), 4096);
        let entries = trun.field_list("samples").unwrap();
        assert_eq!(
            entries[0]
                .group_field("sample_flags")
                .and_then(FieldValue::as_u64),
            Some(SAMPLE_FLAGS_SYNC)
        );
        assert_eq!(
            entries[1]
                .group_field("sample_composition_offset")
                .and_then(FieldValue::as_i64),
            Some(128)
        );
    }

    #[test]
    fn test_sidx_round_trip() {
        let bytes = serialize_boxes(&sidx(1, 1000, 2000, 4096, 2000, true)).unwrap();
        let (parsed, _) = parse_boxes(&bytes).unwrap();
        let node = parsed.require(BoxType::SIDX).unwrap();
        assert_eq!(node.field_u64("timescale").unwrap(), 1000);
        let reference = &node.field_list("references").unwrap()[0];
        assert_eq!(
            reference
                .group_field("referenced_size")
                .and_then(FieldValue::as_u64),
            Some(4096)
        );
        assert_eq!(
            reference
                .group_field("starts_with_sap")
                .and_then(FieldValue::as_u64),
            Some(1)
        );
    }
}
