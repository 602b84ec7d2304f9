//! ISO-BMFF box model: headers, the declarative box schema, and the
//! generic schema-driven parser/serializer.

mod codec;
mod container;
mod schema;

pub use codec::{parse_boxes, serialize_boxes};
pub use container::{BoxNode, BoxTree, FieldValue};
pub use schema::{schema, BoxDef, Cond, FieldSpec};

use crate::{Error, Result};

/// Four-character box type code.
///
/// Short types are stored space-padded on the wire; trailing spaces are
/// trimmed for display and ignored for equality against trimmed constants.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoxType(pub [u8; 4]);

impl BoxType {
    pub const FTYP: Self = Self(*b"ftyp");
    pub const STYP: Self = Self(*b"styp");
    pub const MOOV: Self = Self(*b"moov");
    pub const MDAT: Self = Self(*b"mdat");
    pub const MVHD: Self = Self(*b"mvhd");
    pub const TRAK: Self = Self(*b"trak");
    pub const TKHD: Self = Self(*b"tkhd");
    pub const MDIA: Self = Self(*b"mdia");
    pub const MDHD: Self = Self(*b"mdhd");
    pub const HDLR: Self = Self(*b"hdlr");
    pub const MINF: Self = Self(*b"minf");
    pub const VMHD: Self = Self(*b"vmhd");
    pub const SMHD: Self = Self(*b"smhd");
    pub const DINF: Self = Self(*b"dinf");
    pub const DREF: Self = Self(*b"dref");
    pub const URL: Self = Self(*b"url ");
    pub const STBL: Self = Self(*b"stbl");
    pub const STSD: Self = Self(*b"stsd");
    pub const STTS: Self = Self(*b"stts");
    pub const STSS: Self = Self(*b"stss");
    pub const STSC: Self = Self(*b"stsc");
    pub const STSZ: Self = Self(*b"stsz");
    pub const STCO: Self = Self(*b"stco");
    pub const CO64: Self = Self(*b"co64");
    pub const CTTS: Self = Self(*b"ctts");
    pub const AVC1: Self = Self(*b"avc1");
    pub const HVC1: Self = Self(*b"hvc1");
    pub const AVCC: Self = Self(*b"avcC");
    pub const HVCC: Self = Self(*b"hvcC");
    pub const MP4A: Self = Self(*b"mp4a");
    pub const ESDS: Self = Self(*b"esds");
    pub const OPUS: Self = Self(*b"Opus");
    pub const DOPS: Self = Self(*b"dOps");
    pub const PASP: Self = Self(*b"pasp");
    pub const MVEX: Self = Self(*b"mvex");
    pub const TREX: Self = Self(*b"trex");
    pub const MOOF: Self = Self(*b"moof");
    pub const MFHD: Self = Self(*b"mfhd");
    pub const TRAF: Self = Self(*b"traf");
    pub const TFHD: Self = Self(*b"tfhd");
    pub const TFDT: Self = Self(*b"tfdt");
    pub const TRUN: Self = Self(*b"trun");
    pub const SIDX: Self = Self(*b"sidx");

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Get the 4-char code as a string, trailing spaces trimmed.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0)
            .unwrap_or("????")
            .trim_end_matches(' ')
    }
}

impl std::fmt::Display for BoxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::fmt::Debug for BoxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BoxType").field(&self.as_str()).finish()
    }
}

/// Parsed box header.
///
/// Constructed transiently while walking a byte stream; never stored in
/// the box tree (sizes are re-derived bottom-up on serialization).
#[derive(Debug, Clone, Copy)]
pub struct BoxHeader {
    /// Box type code.
    pub box_type: BoxType,
    /// Content size in bytes, excluding the header itself.
    pub content_size: u64,
    /// Size of the header (8 or 16 bytes).
    pub header_size: u8,
}

impl BoxHeader {
    /// Parse a box header from the front of `data`.
    ///
    /// Returns the header and the bytes following it. A 32-bit size of 0
    /// means the box extends to the end of the available data; a size of 1
    /// means a 64-bit extended size follows the type code.
    ///
    /// Fails with [`Error::InsufficientData`] when fewer than 8 (or, for
    /// the extended form, 16) bytes are available.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8])> {
        if data.len() < 8 {
            return Err(Error::InsufficientData);
        }
        let size32 = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
        let box_type = BoxType::from_bytes([data[4], data[5], data[6], data[7]]);

        let header = match size32 {
            0 => Self {
                box_type,
                content_size: (data.len() - 8) as u64,
                header_size: 8,
            },
            1 => {
                if data.len() < 16 {
                    return Err(Error::InsufficientData);
                }
                let size64 = u64::from_be_bytes([
                    data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
                ]);
                if size64 < 16 {
                    return Err(Error::malformed(
                        &[box_type],
                        "size",
                        format!("extended box size {size64} smaller than its header"),
                    ));
                }
                Self {
                    box_type,
                    content_size: size64 - 16,
                    header_size: 16,
                }
            }
            n if n < 8 => {
                return Err(Error::malformed(
                    &[box_type],
                    "size",
                    format!("box size {n} smaller than its header"),
                ));
            }
            n => Self {
                box_type,
                content_size: n - 8,
                header_size: 8,
            },
        };

        Ok((header, &data[header.header_size as usize..]))
    }

    /// Total box size including the header.
    pub fn total_size(&self) -> u64 {
        self.content_size + self.header_size as u64
    }

    /// Write an 8-byte header for a box with known content size.
    ///
    /// The write path always knows content sizes up front, so the 64-bit
    /// extended form is not needed here (the muxer handles oversized
    /// `mdat` explicitly).
    pub fn serialize(box_type: BoxType, content_size: u64, out: &mut bytes::BytesMut) -> Result<()> {
        use bytes::BufMut;
        let total = content_size + 8;
        if total > u32::MAX as u64 {
            return Err(Error::invalid_box(format!(
                "box `{box_type}` content too large for a 32-bit size"
            )));
        }
        out.put_u32(total as u32);
        out.put_slice(&box_type.0);
        Ok(())
    }
}
