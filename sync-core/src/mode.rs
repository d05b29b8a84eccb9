//! Persistence mode resolution.
//!
//! A persister is asked to handle plain stores, mergeable stores, or
//! either. The store's own capability and the requested mode together pick
//! which accessor set gets bound, once, at construction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which kinds of store a persister accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersistMode {
    /// Persist plain content only, even for a mergeable store.
    StoreOnly,
    /// Require a mergeable store and persist its merge metadata.
    MergeableStoreOnly,
    /// Persist merge metadata when the store has it, plain content otherwise.
    #[default]
    StoreOrMergeableStore,
}

/// The accessor set bound for a persister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Plain content and change-sets.
    Plain,
    /// Merge-aware content and change-sets.
    Mergeable,
}

/// A store/mode pairing that cannot be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ModeError {
    /// The mode requires a mergeable store but the store is plain.
    #[error("store type not supported by this persister: a mergeable store is required")]
    MergeableStoreRequired,
}

impl PersistMode {
    /// Check if this mode can bind the mergeable accessor set.
    pub fn allows_mergeable(self) -> bool {
        !matches!(self, Self::StoreOnly)
    }

    /// Check if this mode can bind the plain accessor set.
    pub fn allows_plain(self) -> bool {
        !matches!(self, Self::MergeableStoreOnly)
    }

    /// Pick the accessor set for a store.
    ///
    /// Mergeable wins whenever both the store and the mode allow it.
    pub fn resolve(self, supports_merge: bool) -> Result<StoreMode, ModeError> {
        if supports_merge && self.allows_mergeable() {
            Ok(StoreMode::Mergeable)
        } else if self.allows_plain() {
            Ok(StoreMode::Plain)
        } else {
            Err(ModeError::MergeableStoreRequired)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mode_accepts_either() {
        assert_eq!(PersistMode::default(), PersistMode::StoreOrMergeableStore);
    }

    #[test]
    fn mergeable_store_binds_mergeable_when_allowed() {
        assert_eq!(
            PersistMode::StoreOrMergeableStore.resolve(true),
            Ok(StoreMode::Mergeable)
        );
        assert_eq!(
            PersistMode::MergeableStoreOnly.resolve(true),
            Ok(StoreMode::Mergeable)
        );
    }

    #[test]
    fn plain_store_binds_plain() {
        assert_eq!(PersistMode::StoreOnly.resolve(false), Ok(StoreMode::Plain));
        assert_eq!(
            PersistMode::StoreOrMergeableStore.resolve(false),
            Ok(StoreMode::Plain)
        );
    }

    #[test]
    fn mergeable_store_under_store_only_binds_plain() {
        assert_eq!(PersistMode::StoreOnly.resolve(true), Ok(StoreMode::Plain));
    }

    #[test]
    fn plain_store_under_mergeable_only_fails() {
        assert_eq!(
            PersistMode::MergeableStoreOnly.resolve(false),
            Err(ModeError::MergeableStoreRequired)
        );
    }

    #[test]
    fn mode_deserializes_from_kebab_case() {
        let mode: PersistMode = serde_json::from_str(r#""mergeable-store-only""#).unwrap();
        assert_eq!(mode, PersistMode::MergeableStoreOnly);
    }
}
