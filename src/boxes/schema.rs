//! Declarative box schema.
//!
//! Every supported box type is described as an ordered list of
//! [`FieldSpec`]s plus flags for opaque ("black box") content and child
//! boxes. The generic codec interprets this table in both directions;
//! nothing here reads or writes bytes itself.
//!
//! Box types absent from the table are passed through as opaque content
//! on parse (forward compatibility) and rejected on serialize.

use std::collections::HashMap;
use std::sync::OnceLock;

use super::BoxType;

/// Predicate over the box-scoped parse/serialize context.
///
/// The context is populated by [`FieldSpec::Stored`] fields earlier in
/// the same box (e.g. `version`, `flags`) and consulted by later
/// conditional fields. It does not cross box boundaries upward.
#[derive(Debug, Clone)]
pub enum Cond {
    /// Present when `context[key] & mask != 0`.
    FlagSet { key: &'static str, mask: u64 },
    /// Present when `context[key] == value`.
    Equals { key: &'static str, value: u64 },
    /// Present when both conditions hold.
    Both(Box<Cond>, Box<Cond>),
}

/// One field of a box's binary layout.
#[derive(Debug, Clone)]
pub enum FieldSpec {
    /// Literal bit pattern: must match on parse, re-emitted on serialize.
    /// Not represented in the parsed tree.
    Reserved { bits: u32, value: u64 },
    /// Unsigned integer of the given bit width (need not be byte aligned).
    UInt { name: &'static str, bits: u32 },
    /// Signed (two's complement) integer of the given bit width.
    Int { name: &'static str, bits: u32 },
    /// Fixed-point number with independent integer/fraction widths.
    Fixed {
        name: &'static str,
        int_bits: u32,
        frac_bits: u32,
    },
    /// Binary blob: fixed byte size, or `None` for rest-of-box.
    Bin {
        name: &'static str,
        bytes: Option<u32>,
    },
    /// Null-terminated UTF-8 string.
    Str { name: &'static str },
    /// Homogeneous list. `count_from` names a previously stored field
    /// holding the entry count; `None` consumes the rest of the box.
    /// Single-spec items parse as plain values, multi-spec items as groups.
    List {
        name: &'static str,
        item: Vec<FieldSpec>,
        count_from: Option<&'static str>,
    },
    /// Parse/serialize the inner field and also record its integer value
    /// in the box-scoped context under the field's name.
    Stored(Box<FieldSpec>),
    /// Field present only when the condition holds against the context.
    When { cond: Cond, spec: Box<FieldSpec> },
}

impl FieldSpec {
    /// The name this field appears under in the parsed tree, if any.
    pub fn name(&self) -> Option<&'static str> {
        match self {
            Self::Reserved { .. } => None,
            Self::UInt { name, .. }
            | Self::Int { name, .. }
            | Self::Fixed { name, .. }
            | Self::Bin { name, .. }
            | Self::Str { name }
            | Self::List { name, .. } => Some(*name),
            Self::Stored(inner) => inner.name(),
            Self::When { spec, .. } => spec.name(),
        }
    }
}

/// Schema entry for one box type.
#[derive(Debug, Clone)]
pub struct BoxDef {
    /// Content is raw bytes this engine does not interpret.
    pub opaque: bool,
    /// Allowed values of the `version` field, when version-gated.
    pub versions: Option<&'static [u64]>,
    /// Ordered field layout (empty for pure containers).
    pub fields: Vec<FieldSpec>,
    /// Child boxes follow the fields until the end of the box.
    pub has_children: bool,
}

impl BoxDef {
    fn container() -> Self {
        Self {
            opaque: false,
            versions: None,
            fields: Vec::new(),
            has_children: true,
        }
    }

    fn opaque() -> Self {
        Self {
            opaque: true,
            versions: None,
            fields: Vec::new(),
            has_children: false,
        }
    }

    fn fields(fields: Vec<FieldSpec>) -> Self {
        Self {
            opaque: false,
            versions: None,
            fields,
            has_children: false,
        }
    }

    fn versioned(versions: &'static [u64], fields: Vec<FieldSpec>) -> Self {
        Self {
            opaque: false,
            versions: Some(versions),
            fields,
            has_children: false,
        }
    }

    fn with_children(mut self) -> Self {
        self.has_children = true;
        self
    }
}

fn u(name: &'static str, bits: u32) -> FieldSpec {
    FieldSpec::UInt { name, bits }
}

fn i(name: &'static str, bits: u32) -> FieldSpec {
    FieldSpec::Int { name, bits }
}

fn fixed(name: &'static str, int_bits: u32, frac_bits: u32) -> FieldSpec {
    FieldSpec::Fixed {
        name,
        int_bits,
        frac_bits,
    }
}

fn bin(name: &'static str, bytes: u32) -> FieldSpec {
    FieldSpec::Bin {
        name,
        bytes: Some(bytes),
    }
}

fn bin_rest(name: &'static str) -> FieldSpec {
    FieldSpec::Bin { name, bytes: None }
}

fn res(bits: u32) -> FieldSpec {
    FieldSpec::Reserved { bits, value: 0 }
}

fn stored(spec: FieldSpec) -> FieldSpec {
    FieldSpec::Stored(Box::new(spec))
}

fn when(cond: Cond, spec: FieldSpec) -> FieldSpec {
    FieldSpec::When {
        cond,
        spec: Box::new(spec),
    }
}

fn flag_set(mask: u64) -> Cond {
    Cond::FlagSet { key: "flags", mask }
}

fn version_is(value: u64) -> Cond {
    Cond::Equals {
        key: "version",
        value,
    }
}

fn both(a: Cond, b: Cond) -> Cond {
    Cond::Both(Box::new(a), Box::new(b))
}

fn list(name: &'static str, item: Vec<FieldSpec>, count_from: &'static str) -> FieldSpec {
    FieldSpec::List {
        name,
        item,
        count_from: Some(count_from),
    }
}

fn list_rest(name: &'static str, item: Vec<FieldSpec>) -> FieldSpec {
    FieldSpec::List {
        name,
        item,
        count_from: None,
    }
}

/// `version` + `flags` prefix shared by all full boxes; both values are
/// stored into the box context for later conditional fields.
fn full_box() -> Vec<FieldSpec> {
    vec![stored(u("version", 8)), stored(u("flags", 24))]
}

fn file_type_fields() -> Vec<FieldSpec> {
    vec![
        bin("major_brand", 4),
        u("minor_version", 32),
        list_rest("compatible_brands", vec![bin("brand", 4)]),
    ]
}

fn mvhd() -> BoxDef {
    let mut f = full_box();
    f.extend([
        when(version_is(0), u("creation_time", 32)),
        when(version_is(1), u("creation_time", 64)),
        when(version_is(0), u("modification_time", 32)),
        when(version_is(1), u("modification_time", 64)),
        u("timescale", 32),
        when(version_is(0), u("duration", 32)),
        when(version_is(1), u("duration", 64)),
        fixed("rate", 16, 16),
        fixed("volume", 8, 8),
        res(16),
        res(64),
        bin("matrix", 36),
        res(64),
        res(64),
        res(64),
        u("next_track_id", 32),
    ]);
    BoxDef::versioned(&[0, 1], f)
}

fn tkhd() -> BoxDef {
    let mut f = full_box();
    f.extend([
        when(version_is(0), u("creation_time", 32)),
        when(version_is(1), u("creation_time", 64)),
        when(version_is(0), u("modification_time", 32)),
        when(version_is(1), u("modification_time", 64)),
        u("track_id", 32),
        res(32),
        when(version_is(0), u("duration", 32)),
        when(version_is(1), u("duration", 64)),
        res(64),
        i("layer", 16),
        i("alternate_group", 16),
        fixed("volume", 8, 8),
        res(16),
        bin("matrix", 36),
        fixed("width", 16, 16),
        fixed("height", 16, 16),
    ]);
    BoxDef::versioned(&[0, 1], f)
}

fn mdhd() -> BoxDef {
    let mut f = full_box();
    f.extend([
        when(version_is(0), u("creation_time", 32)),
        when(version_is(1), u("creation_time", 64)),
        when(version_is(0), u("modification_time", 32)),
        when(version_is(1), u("modification_time", 64)),
        u("timescale", 32),
        when(version_is(0), u("duration", 32)),
        when(version_is(1), u("duration", 64)),
        res(1),
        u("language", 15),
        res(16),
    ]);
    BoxDef::versioned(&[0, 1], f)
}

fn hdlr() -> BoxDef {
    let mut f = full_box();
    f.extend([
        res(32),
        bin("handler_type", 4),
        res(64),
        res(32),
        FieldSpec::Str { name: "name" },
    ]);
    BoxDef::versioned(&[0], f)
}

fn vmhd() -> BoxDef {
    let mut f = full_box();
    f.extend([u("graphics_mode", 16), res(48)]);
    BoxDef::versioned(&[0], f)
}

fn smhd() -> BoxDef {
    let mut f = full_box();
    f.extend([fixed("balance", 8, 8), res(16)]);
    BoxDef::versioned(&[0], f)
}

fn dref() -> BoxDef {
    let mut f = full_box();
    f.push(stored(u("entry_count", 32)));
    let mut def = BoxDef::versioned(&[0], f);
    def.has_children = true;
    def
}

fn stsd() -> BoxDef {
    let mut f = full_box();
    f.push(stored(u("entry_count", 32)));
    let mut def = BoxDef::versioned(&[0], f);
    def.has_children = true;
    def
}

/// VisualSampleEntry prefix shared by `avc1`/`hvc1`. The codec
/// configuration (`avcC`/`hvcC`) and optional `pasp` follow as children.
fn visual_sample_entry() -> BoxDef {
    BoxDef::fields(vec![
        res(48),
        u("data_reference_index", 16),
        res(16),
        res(16),
        res(64),
        res(32),
        u("width", 16),
        u("height", 16),
        fixed("horizresolution", 16, 16),
        fixed("vertresolution", 16, 16),
        res(32),
        u("frame_count", 16),
        bin("compressor_name", 32),
        u("depth", 16),
        FieldSpec::Reserved {
            bits: 16,
            value: 0xFFFF,
        },
    ])
    .with_children()
}

/// AudioSampleEntry prefix shared by `mp4a`/`Opus`. The codec
/// configuration (`esds`/`dOps`) follows as a child.
fn audio_sample_entry() -> BoxDef {
    BoxDef::fields(vec![
        res(48),
        u("data_reference_index", 16),
        res(64),
        u("channel_count", 16),
        u("sample_size", 16),
        res(16),
        res(16),
        fixed("sample_rate", 16, 16),
    ])
    .with_children()
}

fn esds() -> BoxDef {
    let mut f = full_box();
    f.push(bin_rest("es_descriptor"));
    BoxDef::versioned(&[0], f)
}

fn pasp() -> BoxDef {
    BoxDef::fields(vec![u("h_spacing", 32), u("v_spacing", 32)])
}

fn stts() -> BoxDef {
    let mut f = full_box();
    f.extend([
        stored(u("entry_count", 32)),
        list(
            "entries",
            vec![u("sample_count", 32), u("sample_delta", 32)],
            "entry_count",
        ),
    ]);
    BoxDef::versioned(&[0], f)
}

fn ctts() -> BoxDef {
    let mut f = full_box();
    f.extend([
        stored(u("entry_count", 32)),
        list(
            "entries",
            vec![
                u("sample_count", 32),
                when(version_is(0), u("sample_offset", 32)),
                when(version_is(1), i("sample_offset", 32)),
            ],
            "entry_count",
        ),
    ]);
    BoxDef::versioned(&[0, 1], f)
}

fn stss() -> BoxDef {
    let mut f = full_box();
    f.extend([
        stored(u("entry_count", 32)),
        list("entries", vec![u("sample_number", 32)], "entry_count"),
    ]);
    BoxDef::versioned(&[0], f)
}

fn stsc() -> BoxDef {
    let mut f = full_box();
    f.extend([
        stored(u("entry_count", 32)),
        list(
            "entries",
            vec![
                u("first_chunk", 32),
                u("samples_per_chunk", 32),
                u("sample_description_index", 32),
            ],
            "entry_count",
        ),
    ]);
    BoxDef::versioned(&[0], f)
}

fn stsz() -> BoxDef {
    let mut f = full_box();
    f.extend([
        stored(u("sample_size", 32)),
        stored(u("sample_count", 32)),
        when(
            Cond::Equals {
                key: "sample_size",
                value: 0,
            },
            list("entries", vec![u("entry_size", 32)], "sample_count"),
        ),
    ]);
    BoxDef::versioned(&[0], f)
}

fn stco() -> BoxDef {
    let mut f = full_box();
    f.extend([
        stored(u("entry_count", 32)),
        list("entries", vec![u("chunk_offset", 32)], "entry_count"),
    ]);
    BoxDef::versioned(&[0], f)
}

fn co64() -> BoxDef {
    let mut f = full_box();
    f.extend([
        stored(u("entry_count", 32)),
        list("entries", vec![u("chunk_offset", 64)], "entry_count"),
    ]);
    BoxDef::versioned(&[0], f)
}

fn trex() -> BoxDef {
    let mut f = full_box();
    f.extend([
        u("track_id", 32),
        u("default_sample_description_index", 32),
        u("default_sample_duration", 32),
        u("default_sample_size", 32),
        u("default_sample_flags", 32),
    ]);
    BoxDef::versioned(&[0], f)
}

fn mfhd() -> BoxDef {
    let mut f = full_box();
    f.push(u("sequence_number", 32));
    BoxDef::versioned(&[0], f)
}

fn tfhd() -> BoxDef {
    let mut f = full_box();
    f.extend([
        u("track_id", 32),
        when(flag_set(0x000001), u("base_data_offset", 64)),
        when(flag_set(0x000002), u("sample_description_index", 32)),
        when(flag_set(0x000008), u("default_sample_duration", 32)),
        when(flag_set(0x000010), u("default_sample_size", 32)),
        when(flag_set(0x000020), u("default_sample_flags", 32)),
    ]);
    BoxDef::versioned(&[0], f)
}

fn tfdt() -> BoxDef {
    let mut f = full_box();
    f.extend([
        when(version_is(0), u("base_media_decode_time", 32)),
        when(version_is(1), u("base_media_decode_time", 64)),
    ]);
    BoxDef::versioned(&[0, 1], f)
}

fn trun() -> BoxDef {
    let mut f = full_box();
    f.extend([
        stored(u("sample_count", 32)),
        when(flag_set(0x000001), i("data_offset", 32)),
        when(flag_set(0x000004), u("first_sample_flags", 32)),
        list(
            "samples",
            vec![
                when(flag_set(0x000100), u("sample_duration", 32)),
                when(flag_set(0x000200), u("sample_size", 32)),
                when(flag_set(0x000400), u("sample_flags", 32)),
                when(
                    both(flag_set(0x000800), version_is(0)),
                    u("sample_composition_offset", 32),
                ),
                when(
                    both(flag_set(0x000800), version_is(1)),
                    i("sample_composition_offset", 32),
                ),
            ],
            "sample_count",
        ),
    ]);
    BoxDef::versioned(&[0, 1], f)
}

fn sidx() -> BoxDef {
    let mut f = full_box();
    f.extend([
        u("reference_id", 32),
        u("timescale", 32),
        when(version_is(0), u("earliest_presentation_time", 32)),
        when(version_is(1), u("earliest_presentation_time", 64)),
        when(version_is(0), u("first_offset", 32)),
        when(version_is(1), u("first_offset", 64)),
        res(16),
        stored(u("reference_count", 16)),
        list(
            "references",
            vec![
                u("reference_type", 1),
                u("referenced_size", 31),
                u("subsegment_duration", 32),
                u("starts_with_sap", 1),
                u("sap_type", 3),
                u("sap_delta_time", 28),
            ],
            "reference_count",
        ),
    ]);
    BoxDef::versioned(&[0, 1], f)
}

fn url_box() -> BoxDef {
    // Self-contained data reference: flags = 1, no fields.
    BoxDef::versioned(&[0], full_box())
}

fn build_schema() -> HashMap<BoxType, BoxDef> {
    let mut map = HashMap::new();

    map.insert(BoxType::FTYP, BoxDef::fields(file_type_fields()));
    map.insert(BoxType::STYP, BoxDef::fields(file_type_fields()));

    map.insert(BoxType::MOOV, BoxDef::container());
    map.insert(BoxType::TRAK, BoxDef::container());
    map.insert(BoxType::MDIA, BoxDef::container());
    map.insert(BoxType::MINF, BoxDef::container());
    map.insert(BoxType::DINF, BoxDef::container());
    map.insert(BoxType::STBL, BoxDef::container());
    map.insert(BoxType::MVEX, BoxDef::container());
    map.insert(BoxType::MOOF, BoxDef::container());
    map.insert(BoxType::TRAF, BoxDef::container());

    map.insert(BoxType::MVHD, mvhd());
    map.insert(BoxType::TKHD, tkhd());
    map.insert(BoxType::MDHD, mdhd());
    map.insert(BoxType::HDLR, hdlr());
    map.insert(BoxType::VMHD, vmhd());
    map.insert(BoxType::SMHD, smhd());
    map.insert(BoxType::DREF, dref());
    map.insert(BoxType::URL, url_box());

    map.insert(BoxType::STSD, stsd());
    map.insert(BoxType::AVC1, visual_sample_entry());
    map.insert(BoxType::HVC1, visual_sample_entry());
    map.insert(BoxType::MP4A, audio_sample_entry());
    map.insert(BoxType::OPUS, audio_sample_entry());
    map.insert(BoxType::ESDS, esds());
    map.insert(BoxType::PASP, pasp());

    map.insert(BoxType::STTS, stts());
    map.insert(BoxType::CTTS, ctts());
    map.insert(BoxType::STSS, stss());
    map.insert(BoxType::STSC, stsc());
    map.insert(BoxType::STSZ, stsz());
    map.insert(BoxType::STCO, stco());
    map.insert(BoxType::CO64, co64());

    map.insert(BoxType::TREX, trex());
    map.insert(BoxType::MFHD, mfhd());
    map.insert(BoxType::TFHD, tfhd());
    map.insert(BoxType::TFDT, tfdt());
    map.insert(BoxType::TRUN, trun());
    map.insert(BoxType::SIDX, sidx());

    // Black boxes: carried verbatim, never interpreted.
    map.insert(BoxType::MDAT, BoxDef::opaque());
    map.insert(BoxType::AVCC, BoxDef::opaque());
    map.insert(BoxType::HVCC, BoxDef::opaque());
    map.insert(BoxType::DOPS, BoxDef::opaque());

    map
}

/// Look up the schema entry for a box type. `None` means the type is
/// unknown: tolerated as opaque on parse, rejected on serialize.
pub fn schema(box_type: BoxType) -> Option<&'static BoxDef> {
    static SCHEMA: OnceLock<HashMap<BoxType, BoxDef>> = OnceLock::new();
    SCHEMA.get_or_init(build_schema).get(&box_type)
}
