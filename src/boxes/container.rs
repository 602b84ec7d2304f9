//! Parsed box tree value model and navigation helpers.

use bytes::Bytes;

use super::BoxType;
use crate::{Error, Result};

/// A parsed field value.
///
/// Primitive widths are not stored here; serialization is driven by the
/// schema, which knows the binary layout for each named field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Unsigned integer of any declared bit width.
    UInt(u64),
    /// Signed integer of any declared bit width.
    Int(i64),
    /// Fixed-point number as independent integer and fraction parts.
    Fixed { int: u64, frac: u64 },
    /// Fixed-size or rest-of-box binary.
    Bin(Bytes),
    /// Null-terminated string.
    Str(String),
    /// Homogeneous list of values (or of groups).
    List(Vec<FieldValue>),
    /// Ordered named sub-fields (one list item of a multi-field entry).
    Group(Vec<(&'static str, FieldValue)>),
}

impl FieldValue {
    /// The value as an unsigned integer, if it is one.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a signed integer (also accepts `UInt`).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// The value as binary content, if it is one.
    pub fn as_bin(&self) -> Option<&Bytes> {
        match self {
            Self::Bin(b) => Some(b),
            _ => None,
        }
    }

    /// The value as a list, if it is one.
    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Look up a named field inside a `Group` value.
    pub fn group_field(&self, name: &str) -> Option<&FieldValue> {
        match self {
            Self::Group(fields) => fields.iter().find(|(n, _)| *n == name).map(|(_, v)| v),
            _ => None,
        }
    }
}

/// One parsed box: either schema-structured fields plus children, or
/// opaque raw content for "black box" and unknown types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoxNode {
    Value {
        fields: Vec<(&'static str, FieldValue)>,
        children: BoxTree,
    },
    Opaque(Bytes),
}

impl BoxNode {
    /// An empty structured node.
    pub fn empty() -> Self {
        Self::Value {
            fields: Vec::new(),
            children: BoxTree::default(),
        }
    }

    /// A structured node with fields only.
    pub fn with_fields(fields: Vec<(&'static str, FieldValue)>) -> Self {
        Self::Value {
            fields,
            children: BoxTree::default(),
        }
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        match self {
            Self::Value { fields, .. } => {
                fields.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
            }
            Self::Opaque(_) => None,
        }
    }

    /// Required unsigned integer field.
    pub fn field_u64(&self, name: &str) -> Result<u64> {
        self.field(name)
            .and_then(FieldValue::as_u64)
            .ok_or_else(|| Error::invalid_box(format!("missing integer field `{name}`")))
    }

    /// Required signed integer field.
    pub fn field_i64(&self, name: &str) -> Result<i64> {
        self.field(name)
            .and_then(FieldValue::as_i64)
            .ok_or_else(|| Error::invalid_box(format!("missing integer field `{name}`")))
    }

    /// Required list field.
    pub fn field_list(&self, name: &str) -> Result<&[FieldValue]> {
        self.field(name)
            .and_then(FieldValue::as_list)
            .ok_or_else(|| Error::invalid_box(format!("missing list field `{name}`")))
    }

    /// The node's children (empty for opaque nodes).
    pub fn children(&self) -> &BoxTree {
        match self {
            Self::Value { children, .. } => children,
            Self::Opaque(_) => {
                static EMPTY: BoxTree = BoxTree(Vec::new());
                &EMPTY
            }
        }
    }

    /// First child of the given type.
    pub fn child(&self, box_type: BoxType) -> Option<&BoxNode> {
        self.children().get(box_type)
    }

    /// Required first child of the given type.
    pub fn require_child(&self, box_type: BoxType) -> Result<&BoxNode> {
        self.child(box_type)
            .ok_or_else(|| Error::invalid_box(format!("missing required `{box_type}` box")))
    }

    /// Raw content for opaque nodes.
    pub fn content(&self) -> Option<&Bytes> {
        match self {
            Self::Opaque(content) => Some(content),
            Self::Value { .. } => None,
        }
    }
}

/// An ordered sequence of `(type, node)` pairs. A type may repeat (e.g.
/// multiple `trak` boxes under `moov`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoxTree(pub Vec<(BoxType, BoxNode)>);

impl BoxTree {
    /// Tree with the given boxes.
    pub fn new(boxes: Vec<(BoxType, BoxNode)>) -> Self {
        Self(boxes)
    }

    /// Number of top-level boxes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the tree holds no boxes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First box of the given type.
    pub fn get(&self, box_type: BoxType) -> Option<&BoxNode> {
        self.0
            .iter()
            .find(|(t, _)| *t == box_type)
            .map(|(_, node)| node)
    }

    /// Required first box of the given type.
    pub fn require(&self, box_type: BoxType) -> Result<&BoxNode> {
        self.get(box_type)
            .ok_or_else(|| Error::invalid_box(format!("missing required `{box_type}` box")))
    }

    /// All boxes of the given type, in order.
    pub fn all(&self, box_type: BoxType) -> impl Iterator<Item = &BoxNode> {
        self.0
            .iter()
            .filter(move |(t, _)| *t == box_type)
            .map(|(_, node)| node)
    }

    /// Iterate over all `(type, node)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = &(BoxType, BoxNode)> {
        self.0.iter()
    }

    /// Append a box.
    pub fn push(&mut self, box_type: BoxType, node: BoxNode) {
        self.0.push((box_type, node));
    }
}
