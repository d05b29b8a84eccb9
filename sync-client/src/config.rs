//! Persister configuration.
//!
//! [`PersisterConfig`] is built in code. [`StorageSettings`] is the TOML
//! form for storage-backed persisters:
//!
//! ```toml
//! storage_name = "pets"
//! mode = "mergeable-store-only"
//! queue = ["storage", "local"]
//! ```

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use storesync_core::{PersistMode, QueueKey};

use crate::error::ErrorHandler;

/// Configuration for [`Persister::new`](crate::Persister::new).
#[derive(Clone, Default)]
pub struct PersisterConfig {
    /// Which kinds of store are accepted.
    pub mode: PersistMode,
    /// Queue to serialize on. `None` mints a private queue.
    pub queue: Option<QueueKey>,
    /// Receives errors caught inside scheduled actions and listeners.
    pub on_ignored_error: Option<ErrorHandler>,
}

impl PersisterConfig {
    /// Default configuration: either store kind, private queue, no handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persist mode.
    pub fn with_mode(mut self, mode: PersistMode) -> Self {
        self.mode = mode;
        self
    }

    /// Share a queue with other persisters.
    pub fn with_queue(mut self, queue: QueueKey) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the ignored-error handler.
    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.on_ignored_error = Some(handler);
        self
    }
}

impl fmt::Debug for PersisterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersisterConfig")
            .field("mode", &self.mode)
            .field("queue", &self.queue)
            .field("on_ignored_error", &self.on_ignored_error.is_some())
            .finish()
    }
}

/// Settings for a storage-backed persister.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageSettings {
    /// Item name the store is persisted under.
    pub storage_name: String,
    /// Which kinds of store are accepted (default: either).
    #[serde(default)]
    pub mode: PersistMode,
    /// Parts of a shared queue key. Absent means a private queue.
    #[serde(default)]
    pub queue: Option<Vec<String>>,
}

impl StorageSettings {
    /// Parse settings from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseError {
            origin: "<string>".to_string(),
            source: e,
        })
    }

    /// Load settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&text).map_err(|e| ConfigError::ParseError {
            origin: path.display().to_string(),
            source: e,
        })
    }

    /// Build a persister configuration without an error handler.
    pub fn into_config(self) -> PersisterConfig {
        let config = PersisterConfig::new().with_mode(self.mode);
        match self.queue {
            Some(parts) => config.with_queue(QueueKey::shared(parts)),
            None => config,
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration.
    #[error("failed to parse config {origin}: {source}")]
    ParseError {
        /// File path, or `<string>` for inline text.
        origin: String,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    #[test]
    fn default_config_accepts_either_store() {
        let config = PersisterConfig::new();
        assert_eq!(config.mode, PersistMode::StoreOrMergeableStore);
        assert!(config.queue.is_none());
        assert!(config.on_ignored_error.is_none());
    }

    #[test]
    fn builder_sets_fields() {
        let config = PersisterConfig::new()
            .with_mode(PersistMode::StoreOnly)
            .with_queue(QueueKey::shared(["a"]))
            .with_error_handler(Arc::new(|_| {}));

        assert_eq!(config.mode, PersistMode::StoreOnly);
        assert_eq!(config.queue, Some(QueueKey::shared(["a"])));
        assert!(format!("{:?}", config).contains("on_ignored_error: true"));
    }

    #[test]
    fn settings_from_toml_string() {
        let settings = StorageSettings::from_toml_str(
            r#"
            storage_name = "pets"
            mode = "mergeable-store-only"
            queue = ["storage", "local"]
            "#,
        )
        .unwrap();

        assert_eq!(settings.storage_name, "pets");
        assert_eq!(settings.mode, PersistMode::MergeableStoreOnly);

        let config = settings.into_config();
        assert_eq!(config.queue, Some(QueueKey::shared(["storage", "local"])));
    }

    #[test]
    fn settings_missing_fields_use_defaults() {
        let settings = StorageSettings::from_toml_str(r#"storage_name = "pets""#).unwrap();
        assert_eq!(settings.mode, PersistMode::StoreOrMergeableStore);
        assert!(settings.into_config().queue.is_none());
    }

    #[test]
    fn unknown_mode_is_parse_error() {
        let err = StorageSettings::from_toml_str(
            r#"
            storage_name = "pets"
            mode = "sometimes"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn settings_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"storage_name = "people""#).unwrap();

        let settings = StorageSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.storage_name, "people");
    }

    #[test]
    fn missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = StorageSettings::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }
}
