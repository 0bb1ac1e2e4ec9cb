//! Core domain errors.

use thiserror::Error;

/// Maximum number of characters of an offending line kept for diagnostics.
const PREVIEW_CHARS: usize = 200;

/// A frame read from the worker could not be turned into a message.
///
/// Framing errors are never fatal: the offending line is skipped and the
/// stream continues with the next one.
#[derive(Debug, Error)]
pub enum FramingError {
    /// The line is not valid JSON, or is not a `{"type": ...}` envelope.
    #[error("Malformed frame: {source}")]
    Malformed {
        preview: String,
        #[source]
        source: serde_json::Error,
    },

    /// The envelope names a known message type but its `data` has the wrong shape.
    #[error("Invalid '{kind}' payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FramingError {
    /// Build a `Malformed` error, keeping a bounded preview of the raw line.
    pub fn malformed(line: &[u8], source: serde_json::Error) -> Self {
        let preview: String = String::from_utf8_lossy(line)
            .chars()
            .take(PREVIEW_CHARS)
            .collect();
        Self::Malformed { preview, source }
    }

    /// The raw line preview, if one was captured.
    pub fn preview(&self) -> Option<&str> {
        match self {
            Self::Malformed { preview, .. } => Some(preview),
            Self::InvalidPayload { .. } => None,
        }
    }
}
