//! Error types for storesync-client.

use std::sync::Arc;

use storesync_core::ModeError;
use storesync_types::CodecError;
use thiserror::Error;

use crate::store::StoreError;

/// Errors raised while persisting.
///
/// Only [`PersistError::Configuration`] ever reaches a caller directly (from
/// `Persister::new`). Everything else is caught where it happens and handed
/// to the persister's [`ErrorHandler`].
#[derive(Debug, Error)]
pub enum PersistError {
    /// Store and persist mode do not fit together.
    #[error("configuration error: {0}")]
    Configuration(#[from] ModeError),

    /// The medium returned something that is not content or changes.
    #[error("malformed content: {reason}")]
    MalformedContent {
        /// What was wrong with the payload.
        reason: String,
    },

    /// Reading from or writing to the medium failed.
    #[error("medium I/O error: {0}")]
    MediumIo(String),

    /// Registering or removing a listener failed.
    #[error("subscription error: {0}")]
    Subscription(String),

    /// A queue drain could not be started.
    #[error("scheduling error: {0}")]
    Scheduling(String),

    /// A scheduled action panicked.
    #[error("scheduled action panicked: {0}")]
    ActionPanicked(String),
}

impl PersistError {
    /// Build a [`PersistError::MalformedContent`].
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedContent {
            reason: reason.into(),
        }
    }
}

impl From<CodecError> for PersistError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Malformed { reason } => Self::MalformedContent { reason },
            CodecError::Json(e) => Self::MalformedContent {
                reason: e.to_string(),
            },
        }
    }
}

impl From<StoreError> for PersistError {
    fn from(err: StoreError) -> Self {
        Self::Subscription(err.to_string())
    }
}

/// Callback receiving errors that were caught rather than returned.
pub type ErrorHandler = Arc<dyn Fn(&PersistError) + Send + Sync>;

/// Log an ignored error and forward it to the handler, if any.
pub(crate) fn report(handler: Option<&ErrorHandler>, error: &PersistError) {
    tracing::warn!("Ignored persistence error: {}", error);
    if let Some(handler) = handler {
        handler(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn codec_errors_become_malformed_content() {
        let err: PersistError = serde_json::from_str::<serde_json::Value>("{")
            .map_err(CodecError::from)
            .unwrap_err()
            .into();
        assert!(matches!(err, PersistError::MalformedContent { .. }));
    }

    #[test]
    fn mode_error_is_configuration() {
        let err = PersistError::from(ModeError::MergeableStoreRequired);
        assert!(err.to_string().starts_with("configuration error"));
    }

    #[test]
    fn report_reaches_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: ErrorHandler = Arc::new(move |e| sink.lock().unwrap().push(e.to_string()));

        report(Some(&handler), &PersistError::MediumIo("disk full".into()));
        report(None, &PersistError::MediumIo("ignored".into()));

        assert_eq!(*seen.lock().unwrap(), vec!["medium I/O error: disk full"]);
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PersistError>();
    }
}
