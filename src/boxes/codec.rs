//! Generic schema-driven box parser and serializer.
//!
//! Parsing is progressive: [`parse_boxes`] consumes as many complete
//! top-level boxes as the input holds and hands back the unparsed tail,
//! to be re-submitted with more data appended. Truncation is never an
//! error at the top level; malformed field content always is, and aborts
//! the whole call with the offending box path and field name.
//!
//! Serialization is strict: every box must be fully described by the
//! schema, and sizes are derived bottom-up from serialized content.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use super::container::{BoxNode, BoxTree, FieldValue};
use super::schema::{schema, BoxDef, Cond, FieldSpec};
use super::{BoxHeader, BoxType};
use crate::{Error, Result};

type Context = HashMap<&'static str, u64>;

/// Parse top-level boxes from `data`.
///
/// Returns the parsed boxes and the leftover bytes that did not yet form
/// a complete box. Callers feed `leftover ++ new_bytes` on the next call.
pub fn parse_boxes(data: &[u8]) -> Result<(BoxTree, &[u8])> {
    let mut boxes = Vec::new();
    let mut rest = data;
    let mut path = Vec::new();

    while !rest.is_empty() {
        match parse_one(rest, &mut path)? {
            Some((box_type, node, consumed)) => {
                boxes.push((box_type, node));
                rest = &rest[consumed..];
            }
            None => break,
        }
    }

    Ok((BoxTree::new(boxes), rest))
}

/// Serialize a box tree. Unknown box types are a hard error.
pub fn serialize_boxes(tree: &BoxTree) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    let mut path = Vec::new();
    for (box_type, node) in tree.iter() {
        serialize_one(*box_type, node, &mut buf, &mut path)?;
    }
    Ok(buf.freeze())
}

/// Parse one box if fully available. `Ok(None)` means "wait for more data".
fn parse_one(
    data: &[u8],
    path: &mut Vec<BoxType>,
) -> Result<Option<(BoxType, BoxNode, usize)>> {
    let (header, body) = match BoxHeader::parse(data) {
        Ok(parsed) => parsed,
        Err(Error::InsufficientData) => return Ok(None),
        Err(e) => return Err(e),
    };
    let content_size = header.content_size as usize;
    if body.len() < content_size {
        return Ok(None);
    }
    let content = &body[..content_size];
    let node = parse_node(header.box_type, content, path)?;
    Ok(Some((
        header.box_type,
        node,
        header.header_size as usize + content_size,
    )))
}

fn parse_node(box_type: BoxType, content: &[u8], path: &mut Vec<BoxType>) -> Result<BoxNode> {
    let def = match schema(box_type) {
        // Unknown types pass through verbatim; never an error on parse.
        None => return Ok(BoxNode::Opaque(Bytes::copy_from_slice(content))),
        Some(def) if def.opaque => return Ok(BoxNode::Opaque(Bytes::copy_from_slice(content))),
        Some(def) => def,
    };

    path.push(box_type);
    let result = parse_structured(def, content, path);
    path.pop();
    result
}

fn parse_structured(def: &BoxDef, content: &[u8], path: &mut Vec<BoxType>) -> Result<BoxNode> {
    let mut reader = BitReader::new(content);
    let mut ctx = Context::new();
    let mut fields = Vec::new();

    for spec in &def.fields {
        parse_field(spec, &mut reader, &mut ctx, &mut fields, path)?;
    }

    if let Some(allowed) = def.versions {
        let version = ctx.get("version").copied().unwrap_or(0);
        if !allowed.contains(&version) {
            return Err(Error::malformed(
                path,
                "version",
                format!("unsupported version {version}"),
            ));
        }
    }

    let children = if def.has_children {
        let rest = reader
            .rest()
            .ok_or_else(|| Error::malformed(path, "children", "misaligned child data"))?;
        parse_children(rest, path)?
    } else {
        if reader.remaining_bits() != 0 {
            return Err(Error::malformed(
                path,
                "trailing",
                format!("{} unparsed bits at end of box", reader.remaining_bits()),
            ));
        }
        BoxTree::default()
    };

    Ok(BoxNode::Value { fields, children })
}

/// Nested boxes live inside a fully available parent, so truncation here
/// is corruption, not a progressive-parsing condition.
fn parse_children(data: &[u8], path: &mut Vec<BoxType>) -> Result<BoxTree> {
    let mut boxes = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        match parse_one(rest, path)? {
            Some((box_type, node, consumed)) => {
                boxes.push((box_type, node));
                rest = &rest[consumed..];
            }
            None => {
                return Err(Error::malformed(
                    path,
                    "children",
                    format!("truncated child box ({} bytes left)", rest.len()),
                ));
            }
        }
    }
    Ok(BoxTree::new(boxes))
}

fn parse_field(
    spec: &FieldSpec,
    reader: &mut BitReader<'_>,
    ctx: &mut Context,
    fields: &mut Vec<(&'static str, FieldValue)>,
    path: &mut Vec<BoxType>,
) -> Result<()> {
    match spec {
        FieldSpec::Reserved { bits, value } => {
            let got = reader
                .read_bits(*bits)
                .ok_or_else(|| Error::malformed(path, "reserved", "out of data"))?;
            if got != *value {
                return Err(Error::malformed(
                    path,
                    "reserved",
                    format!("expected literal {value:#x}, found {got:#x}"),
                ));
            }
        }
        FieldSpec::UInt { name, bits } => {
            let name = *name;
            let value = reader
                .read_bits(*bits)
                .ok_or_else(|| Error::malformed(path, name, "out of data"))?;
            fields.push((name, FieldValue::UInt(value)));
        }
        FieldSpec::Int { name, bits } => {
            let name = *name;
            let raw = reader
                .read_bits(*bits)
                .ok_or_else(|| Error::malformed(path, name, "out of data"))?;
            fields.push((name, FieldValue::Int(sign_extend(raw, *bits))));
        }
        FieldSpec::Fixed {
            name,
            int_bits,
            frac_bits,
        } => {
            let name = *name;
            let int = reader
                .read_bits(*int_bits)
                .ok_or_else(|| Error::malformed(path, name, "out of data"))?;
            let frac = reader
                .read_bits(*frac_bits)
                .ok_or_else(|| Error::malformed(path, name, "out of data"))?;
            fields.push((name, FieldValue::Fixed { int, frac }));
        }
        FieldSpec::Bin { name, bytes } => {
            let name = *name;
            let data = match bytes {
                Some(n) => reader
                    .read_bytes(*n as usize)
                    .ok_or_else(|| Error::malformed(path, name, "out of data"))?,
                None => reader
                    .rest()
                    .ok_or_else(|| Error::malformed(path, name, "misaligned binary field"))?,
            };
            fields.push((name, FieldValue::Bin(Bytes::copy_from_slice(data))));
        }
        FieldSpec::Str { name } => {
            let name = *name;
            let raw = reader
                .read_until_nul()
                .ok_or_else(|| Error::malformed(path, name, "unterminated string"))?;
            let s = std::str::from_utf8(raw)
                .map_err(|_| Error::malformed(path, name, "invalid UTF-8"))?;
            fields.push((name, FieldValue::Str(s.to_owned())));
        }
        FieldSpec::List {
            name,
            item,
            count_from,
        } => {
            let name = *name;
            let mut items = Vec::new();
            match count_from {
                Some(key) => {
                    let count = *ctx.get(key).ok_or_else(|| {
                        Error::malformed(path, name, format!("count field `{key}` not stored"))
                    })?;
                    for _ in 0..count {
                        items.push(parse_list_item(item, reader, ctx, path)?);
                    }
                }
                None => {
                    while reader.remaining_bits() > 0 {
                        items.push(parse_list_item(item, reader, ctx, path)?);
                    }
                }
            }
            fields.push((name, FieldValue::List(items)));
        }
        FieldSpec::Stored(inner) => {
            let before = fields.len();
            parse_field(inner, reader, ctx, fields, path)?;
            if let Some((name, value)) = fields.get(before) {
                let name = *name;
                let stored = match value {
                    FieldValue::UInt(v) => *v,
                    FieldValue::Int(v) => *v as u64,
                    _ => {
                        return Err(Error::malformed(
                            path,
                            name,
                            "only integer fields can be stored in the context",
                        ))
                    }
                };
                ctx.insert(name, stored);
            }
        }
        FieldSpec::When { cond, spec } => {
            if eval_cond(cond, ctx) {
                parse_field(spec, reader, ctx, fields, path)?;
            }
        }
    }
    Ok(())
}

fn parse_list_item(
    item: &[FieldSpec],
    reader: &mut BitReader<'_>,
    ctx: &mut Context,
    path: &mut Vec<BoxType>,
) -> Result<FieldValue> {
    let mut entry_fields = Vec::new();
    for spec in item {
        parse_field(spec, reader, ctx, &mut entry_fields, path)?;
    }
    if item.len() == 1 && entry_fields.len() == 1 {
        Ok(entry_fields.remove(0).1)
    } else {
        Ok(FieldValue::Group(entry_fields))
    }
}

fn eval_cond(cond: &Cond, ctx: &Context) -> bool {
    match cond {
        Cond::FlagSet { key, mask } => ctx.get(key).is_some_and(|v| v & mask != 0),
        Cond::Equals { key, value } => ctx.get(key) == Some(value),
        Cond::Both(a, b) => eval_cond(a, ctx) && eval_cond(b, ctx),
    }
}

fn sign_extend(raw: u64, bits: u32) -> i64 {
    if bits == 64 || raw & (1 << (bits - 1)) == 0 {
        raw as i64
    } else {
        (raw | !0u64 << bits) as i64
    }
}

fn serialize_one(
    box_type: BoxType,
    node: &BoxNode,
    buf: &mut BytesMut,
    path: &mut Vec<BoxType>,
) -> Result<()> {
    let Some(def) = schema(box_type) else {
        return Err(Error::UnknownOutputBox(box_type));
    };

    let start = buf.len();
    buf.put_u32(0); // patched below
    buf.put_slice(&box_type.0);

    path.push(box_type);
    let result = serialize_content(def, node, buf, path);
    path.pop();
    result?;

    let total = buf.len() - start;
    if total > u32::MAX as usize {
        return Err(Error::invalid_box(format!(
            "box `{box_type}` content too large for a 32-bit size"
        )));
    }
    buf[start..start + 4].copy_from_slice(&(total as u32).to_be_bytes());
    Ok(())
}

fn serialize_content(
    def: &BoxDef,
    node: &BoxNode,
    buf: &mut BytesMut,
    path: &mut Vec<BoxType>,
) -> Result<()> {
    if def.opaque {
        let content = node.content().ok_or_else(|| {
            Error::invalid_box(format!(
                "box `{}` is opaque but a structured node was supplied",
                path_str(path)
            ))
        })?;
        buf.put_slice(content);
        return Ok(());
    }

    let BoxNode::Value { fields, children } = node else {
        return Err(Error::invalid_box(format!(
            "box `{}` is structured but an opaque node was supplied",
            path_str(path)
        )));
    };

    let mut ctx = Context::new();
    let mut writer = BitWriter::new(buf);
    for spec in &def.fields {
        serialize_field(spec, fields, &mut writer, &mut ctx, path)?;
    }
    writer.finish(path)?;

    if def.has_children {
        for (child_type, child) in children.iter() {
            serialize_one(*child_type, child, buf, path)?;
        }
    } else if !children.is_empty() {
        return Err(Error::invalid_box(format!(
            "box `{}` does not take children",
            path_str(path)
        )));
    }

    Ok(())
}

fn serialize_field(
    spec: &FieldSpec,
    fields: &[(&'static str, FieldValue)],
    writer: &mut BitWriter<'_>,
    ctx: &mut Context,
    path: &mut Vec<BoxType>,
) -> Result<()> {
    match spec {
        FieldSpec::Reserved { bits, value } => writer.write_bits(*value, *bits),
        FieldSpec::UInt { name, bits } => {
            let name = *name;
            let value = lookup(fields, name, path)?
                .as_u64()
                .ok_or_else(|| type_err(path, name))?;
            check_width(value, *bits, name, path)?;
            writer.write_bits(value, *bits);
        }
        FieldSpec::Int { name, bits } => {
            let name = *name;
            let value = lookup(fields, name, path)?
                .as_i64()
                .ok_or_else(|| type_err(path, name))?;
            writer.write_bits(value as u64 & mask_bits(*bits), *bits);
        }
        FieldSpec::Fixed {
            name,
            int_bits,
            frac_bits,
        } => {
            let name = *name;
            let FieldValue::Fixed { int, frac } = lookup(fields, name, path)? else {
                return Err(type_err(path, name));
            };
            writer.write_bits(*int, *int_bits);
            writer.write_bits(*frac, *frac_bits);
        }
        FieldSpec::Bin { name, bytes } => {
            let name = *name;
            let data = lookup(fields, name, path)?
                .as_bin()
                .ok_or_else(|| type_err(path, name))?;
            if let Some(n) = bytes {
                if data.len() != *n as usize {
                    return Err(Error::malformed(
                        path,
                        name,
                        format!("expected {n} bytes, found {}", data.len()),
                    ));
                }
            }
            writer.write_bytes(data, path)?;
        }
        FieldSpec::Str { name } => {
            let name = *name;
            let FieldValue::Str(s) = lookup(fields, name, path)? else {
                return Err(type_err(path, name));
            };
            writer.write_bytes(s.as_bytes(), path)?;
            writer.write_bits(0, 8);
        }
        FieldSpec::List {
            name,
            item,
            count_from,
        } => {
            let name = *name;
            let items = lookup(fields, name, path)?
                .as_list()
                .ok_or_else(|| type_err(path, name))?;
            if let Some(key) = count_from {
                let declared = ctx.get(key).copied().unwrap_or_default();
                if declared != items.len() as u64 {
                    return Err(Error::malformed(
                        path,
                        name,
                        format!(
                            "count field `{key}` is {declared} but the list has {} entries",
                            items.len()
                        ),
                    ));
                }
            }
            for entry in items {
                serialize_list_item(item, entry, writer, ctx, path)?;
            }
        }
        FieldSpec::Stored(inner) => {
            serialize_field(inner, fields, writer, ctx, path)?;
            if let Some(name) = inner.name() {
                let value = match lookup(fields, name, path)? {
                    FieldValue::UInt(v) => *v,
                    FieldValue::Int(v) => *v as u64,
                    _ => return Err(type_err(path, name)),
                };
                ctx.insert(name, value);
            }
        }
        FieldSpec::When { cond, spec } => {
            if eval_cond(cond, ctx) {
                serialize_field(spec, fields, writer, ctx, path)?;
            }
        }
    }
    Ok(())
}

fn serialize_list_item(
    item: &[FieldSpec],
    entry: &FieldValue,
    writer: &mut BitWriter<'_>,
    ctx: &mut Context,
    path: &mut Vec<BoxType>,
) -> Result<()> {
    if item.len() == 1 {
        let name = item[0].name().unwrap_or("entry");
        let entry_fields = vec![(name, entry.clone())];
        for spec in item {
            serialize_field(spec, &entry_fields, writer, ctx, path)?;
        }
        return Ok(());
    }
    let FieldValue::Group(entry_fields) = entry else {
        return Err(Error::invalid_box(format!(
            "list entry in `{}` must be a group",
            path_str(path)
        )));
    };
    for spec in item {
        serialize_field(spec, entry_fields, writer, ctx, path)?;
    }
    Ok(())
}

fn lookup<'a>(
    fields: &'a [(&'static str, FieldValue)],
    name: &'static str,
    path: &[BoxType],
) -> Result<&'a FieldValue> {
    fields
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, v)| v)
        .ok_or_else(|| {
            Error::invalid_box(format!("missing field `{name}` in `{}`", path_str(path)))
        })
}

fn type_err(path: &[BoxType], name: &'static str) -> Error {
    Error::invalid_box(format!(
        "field `{name}` in `{}` has the wrong value type",
        path_str(path)
    ))
}

fn check_width(value: u64, bits: u32, name: &'static str, path: &[BoxType]) -> Result<()> {
    if bits < 64 && value > mask_bits(bits) {
        return Err(Error::malformed(
            path,
            name,
            format!("value {value} does not fit in {bits} bits"),
        ));
    }
    Ok(())
}

fn mask_bits(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn path_str(path: &[BoxType]) -> String {
    path.iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// MSB-first bit reader over a byte slice.
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize, // in bits
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining_bits(&self) -> usize {
        self.data.len() * 8 - self.pos
    }

    fn read_bits(&mut self, n: u32) -> Option<u64> {
        debug_assert!(n <= 64);
        if self.remaining_bits() < n as usize {
            return None;
        }
        let mut value = 0u64;
        for _ in 0..n {
            let byte = self.data[self.pos / 8];
            let bit = (byte >> (7 - self.pos % 8)) & 1;
            value = (value << 1) | bit as u64;
            self.pos += 1;
        }
        Some(value)
    }

    fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.pos % 8 != 0 || self.remaining_bits() < n * 8 {
            return None;
        }
        let start = self.pos / 8;
        self.pos += n * 8;
        Some(&self.data[start..start + n])
    }

    fn read_until_nul(&mut self) -> Option<&'a [u8]> {
        if self.pos % 8 != 0 {
            return None;
        }
        let start = self.pos / 8;
        let nul = self.data[start..].iter().position(|&b| b == 0)?;
        self.pos += (nul + 1) * 8;
        Some(&self.data[start..start + nul])
    }

    fn rest(&mut self) -> Option<&'a [u8]> {
        if self.pos % 8 != 0 {
            return None;
        }
        let start = self.pos / 8;
        self.pos = self.data.len() * 8;
        Some(&self.data[start..])
    }
}

/// MSB-first bit writer appending to a `BytesMut`.
struct BitWriter<'a> {
    out: &'a mut BytesMut,
    cur: u8,
    used: u32,
}

impl<'a> BitWriter<'a> {
    fn new(out: &'a mut BytesMut) -> Self {
        Self { out, cur: 0, used: 0 }
    }

    fn write_bits(&mut self, value: u64, n: u32) {
        debug_assert!(n <= 64);
        for i in (0..n).rev() {
            let bit = ((value >> i) & 1) as u8;
            self.cur = (self.cur << 1) | bit;
            self.used += 1;
            if self.used == 8 {
                self.out.put_u8(self.cur);
                self.cur = 0;
                self.used = 0;
            }
        }
    }

    fn write_bytes(&mut self, data: &[u8], path: &[BoxType]) -> Result<()> {
        if self.used != 0 {
            return Err(Error::invalid_box(format!(
                "misaligned binary field in `{}`",
                path_str(path)
            )));
        }
        self.out.put_slice(data);
        Ok(())
    }

    fn finish(self, path: &[BoxType]) -> Result<()> {
        if self.used != 0 {
            return Err(Error::invalid_box(format!(
                "box `{}` fields do not end on a byte boundary",
                path_str(path)
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ftyp_bytes() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&24u32.to_be_bytes());
        data.extend_from_slice(b"ftyp");
        data.extend_from_slice(b"isom");
        data.extend_from_slice(&512u32.to_be_bytes());
        data.extend_from_slice(b"isom");
        data.extend_from_slice(b"mp42");
        data
    }

    #[test]
    fn test_parse_ftyp() {
        let data = ftyp_bytes();
        let (tree, rest) = parse_boxes(&data).unwrap();
        assert!(rest.is_empty());
        let ftyp = tree.require(BoxType::FTYP).unwrap();
        assert_eq!(
            ftyp.field("major_brand").unwrap().as_bin().unwrap().as_ref(),
            b"isom"
        );
        assert_eq!(ftyp.field_u64("minor_version").unwrap(), 512);
        assert_eq!(ftyp.field_list("compatible_brands").unwrap().len(), 2);
    }

    #[test]
    fn test_roundtrip_ftyp() {
        let data = ftyp_bytes();
        let (tree, _) = parse_boxes(&data).unwrap();
        let out = serialize_boxes(&tree).unwrap();
        assert_eq!(out.as_ref(), data.as_slice());
    }

    #[test]
    fn test_progressive_split_equivalence() {
        let data = ftyp_bytes();
        for split in 0..data.len() {
            let (tree1, rest) = parse_boxes(&data[..split]).unwrap();
            assert!(tree1.is_empty());
            assert_eq!(rest.len(), split);

            let mut resumed = rest.to_vec();
            resumed.extend_from_slice(&data[split..]);
            let (tree2, rest2) = parse_boxes(&resumed).unwrap();
            assert!(rest2.is_empty());

            let (full, _) = parse_boxes(&data).unwrap();
            assert_eq!(tree2, full);
        }
    }

    #[test]
    fn test_unknown_box_is_opaque() {
        let mut data = Vec::new();
        data.extend_from_slice(&12u32.to_be_bytes());
        data.extend_from_slice(b"elst");
        data.extend_from_slice(&[1, 2, 3, 4]);

        let (tree, _) = parse_boxes(&data).unwrap();
        let node = tree.get(BoxType::from_bytes(*b"elst")).unwrap();
        assert_eq!(node.content().unwrap().as_ref(), &[1, 2, 3, 4]);

        // But serializing an unknown type is a hard error.
        assert!(matches!(
            serialize_boxes(&tree),
            Err(Error::UnknownOutputBox(_))
        ));
    }

    #[test]
    fn test_malformed_reports_path_and_field() {
        // stts claiming one entry but providing none.
        let mut data = Vec::new();
        data.extend_from_slice(&16u32.to_be_bytes());
        data.extend_from_slice(b"stts");
        data.extend_from_slice(&[0, 0, 0, 0]); // version/flags
        data.extend_from_slice(&1u32.to_be_bytes()); // entry_count = 1, no entries

        let err = parse_boxes(&data).unwrap_err();
        match err {
            Error::MalformedField { path, field, .. } => {
                assert_eq!(path, "stts");
                assert_eq!(field, "sample_count");
            }
            other => panic!("expected MalformedField, got {other:?}"),
        }
    }

    #[test]
    fn test_stsz_uniform_size_skips_entry_list() {
        let mut data = Vec::new();
        data.extend_from_slice(&20u32.to_be_bytes());
        data.extend_from_slice(b"stsz");
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(&100u32.to_be_bytes()); // uniform sample_size
        data.extend_from_slice(&7u32.to_be_bytes()); // sample_count

        let (tree, _) = parse_boxes(&data).unwrap();
        let stsz = tree.require(BoxType::STSZ).unwrap();
        assert_eq!(stsz.field_u64("sample_size").unwrap(), 100);
        assert_eq!(stsz.field_u64("sample_count").unwrap(), 7);
        assert!(stsz.field("entries").is_none());
    }

    #[test]
    fn test_trun_flag_gated_fields() {
        // trun v0, flags = data-offset + sample-size + sample-flags.
        let flags = 0x000001u32 | 0x000200 | 0x000400;
        let mut data = Vec::new();
        let content_len = 4 + 4 + 4 + 2 * 8;
        data.extend_from_slice(&((8 + content_len) as u32).to_be_bytes());
        data.extend_from_slice(b"trun");
        data.extend_from_slice(&flags.to_be_bytes()); // version 0 + flags
        data.extend_from_slice(&2u32.to_be_bytes()); // sample_count
        data.extend_from_slice(&64i32.to_be_bytes()); // data_offset
        data.extend_from_slice(&10u32.to_be_bytes()); // size 0
        data.extend_from_slice(&0x02000000u32.to_be_bytes());
        data.extend_from_slice(&20u32.to_be_bytes()); // size 1
        data.extend_from_slice(&0x01010000u32.to_be_bytes());

        let (tree, rest) = parse_boxes(&data).unwrap();
        assert!(rest.is_empty());
        let trun = tree.require(BoxType::TRUN).unwrap();
        assert_eq!(trun.field_i64("data_offset").unwrap(), 64);
        assert!(trun.field("first_sample_flags").is_none());

        let samples = trun.field_list("samples").unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(
            samples[0].group_field("sample_size").and_then(FieldValue::as_u64),
            Some(10)
        );
        assert!(samples[0].group_field("sample_duration").is_none());

        let out = serialize_boxes(&tree).unwrap();
        assert_eq!(out.as_ref(), data.as_slice());
    }

    #[test]
    fn test_sidx_bit_fields_roundtrip() {
        let mut data = Vec::new();
        let content: Vec<u8> = {
            let mut c = Vec::new();
            c.extend_from_slice(&[0, 0, 0, 0]); // version 0
            c.extend_from_slice(&1u32.to_be_bytes()); // reference_id
            c.extend_from_slice(&90000u32.to_be_bytes()); // timescale
            c.extend_from_slice(&0u32.to_be_bytes()); // earliest_presentation_time
            c.extend_from_slice(&0u32.to_be_bytes()); // first_offset
            c.extend_from_slice(&0u16.to_be_bytes()); // reserved
            c.extend_from_slice(&1u16.to_be_bytes()); // reference_count
            c.extend_from_slice(&0x0000_1000u32.to_be_bytes()); // type 0 + size
            c.extend_from_slice(&180000u32.to_be_bytes()); // duration
            c.extend_from_slice(&0x9000_0000u32.to_be_bytes()); // sap bits
            c
        };
        data.extend_from_slice(&((8 + content.len()) as u32).to_be_bytes());
        data.extend_from_slice(b"sidx");
        data.extend_from_slice(&content);

        let (tree, _) = parse_boxes(&data).unwrap();
        let sidx = tree.require(BoxType::SIDX).unwrap();
        let refs = sidx.field_list("references").unwrap();
        let entry = &refs[0];
        assert_eq!(
            entry.group_field("referenced_size").and_then(FieldValue::as_u64),
            Some(0x1000)
        );
        assert_eq!(
            entry.group_field("starts_with_sap").and_then(FieldValue::as_u64),
            Some(1)
        );
        assert_eq!(
            entry.group_field("sap_type").and_then(FieldValue::as_u64),
            Some(1)
        );

        let out = serialize_boxes(&tree).unwrap();
        assert_eq!(out.as_ref(), data.as_slice());
    }

    #[test]
    fn test_container_nesting() {
        // moov { mvex { trex } }
        let mut trex = Vec::new();
        trex.extend_from_slice(&[0, 0, 0, 0]);
        trex.extend_from_slice(&1u32.to_be_bytes());
        trex.extend_from_slice(&1u32.to_be_bytes());
        trex.extend_from_slice(&0u32.to_be_bytes());
        trex.extend_from_slice(&0u32.to_be_bytes());
        trex.extend_from_slice(&0u32.to_be_bytes());

        let mut mvex = Vec::new();
        mvex.extend_from_slice(&((8 + trex.len()) as u32).to_be_bytes());
        mvex.extend_from_slice(b"trex");
        mvex.extend_from_slice(&trex);

        let mut data = Vec::new();
        data.extend_from_slice(&((16 + mvex.len()) as u32).to_be_bytes());
        data.extend_from_slice(b"moov");
        data.extend_from_slice(&((8 + mvex.len()) as u32).to_be_bytes());
        data.extend_from_slice(b"mvex");
        data.extend_from_slice(&mvex);

        let (tree, _) = parse_boxes(&data).unwrap();
        let moov = tree.require(BoxType::MOOV).unwrap();
        let mvex = moov.require_child(BoxType::MVEX).unwrap();
        let trex = mvex.require_child(BoxType::TREX).unwrap();
        assert_eq!(trex.field_u64("track_id").unwrap(), 1);

        let out = serialize_boxes(&tree).unwrap();
        assert_eq!(out.as_ref(), data.as_slice());
    }
}
