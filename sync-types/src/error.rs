//! Error types for storesync payloads.

use thiserror::Error;

/// Errors that can occur while encoding or decoding a persisted payload.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Text was not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON was valid but not a content-or-changes array.
    #[error("malformed content: {reason}")]
    Malformed {
        /// What was wrong with the payload.
        reason: String,
    },
}

impl CodecError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}
