//! Error types for cmafbox.

use thiserror::Error;

use crate::boxes::BoxType;

/// Result type for cmafbox operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for cmafbox operations.
#[derive(Debug, Error)]
pub enum Error {
    /// More input bytes (or samples) are needed before the operation can
    /// complete. Recoverable: callers retry with extended input. Never a
    /// sign of malformed data.
    #[error("Insufficient data")]
    InsufficientData,

    /// A field's bytes did not match its declared width or literal pattern.
    /// Fatal for the whole parse call; `path` identifies the box nesting
    /// (e.g. `moov.trak.mdia`) and `field` the offending field.
    #[error("Malformed field `{field}` in `{path}`: {reason}")]
    MalformedField {
        path: String,
        field: &'static str,
        reason: String,
    },

    /// Attempted to serialize a box type absent from the schema.
    #[error("Cannot serialize unknown box type `{0}`")]
    UnknownOutputBox(BoxType),

    /// A box type arrived that the current demuxer state does not expect.
    /// Contract violation by the upstream source; not recoverable.
    #[error("Unexpected box `{box_type}` while {state}")]
    UnexpectedBox {
        state: &'static str,
        box_type: BoxType,
    },

    /// A parsed box tree is structurally unusable (missing required child
    /// or field, inconsistent counts).
    #[error("Invalid box structure: {0}")]
    InvalidBox(String),

    /// Configured minimum duration exceeds the target duration.
    #[error("Invalid duration range: min {min} exceeds target {target}")]
    InvalidDurationRange { min: u64, target: u64 },

    /// A track's codec descriptor changed after the first one was
    /// established. Sample-table assembly assumes one fixed description
    /// per track.
    #[error("Track {track_id} changed its media format mid-stream")]
    VariableFormat { track_id: u32 },
}

impl Error {
    /// Create an invalid box structure error.
    pub fn invalid_box(msg: impl Into<String>) -> Self {
        Self::InvalidBox(msg.into())
    }

    /// Create a malformed field error for the given box path.
    pub fn malformed(path: &[BoxType], field: &'static str, reason: impl Into<String>) -> Self {
        let path = path
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(".");
        Self::MalformedField {
            path,
            field,
            reason: reason.into(),
        }
    }
}
