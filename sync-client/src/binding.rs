//! Accessor set bound to a store at persister construction.

use std::sync::Arc;

use storesync_core::{PersistMode, StoreMode};
use storesync_types::{Content, Persisted, StoreChanges, StoreContent};

use crate::error::PersistError;
use crate::store::{MergeableStore, Store};

/// A store together with the surface the persister reads and writes.
#[derive(Clone)]
pub enum StoreBinding {
    /// Plain content and change-sets.
    Plain(Arc<dyn Store>),
    /// Stamped content and change-sets.
    Mergeable(Arc<dyn Store>),
}

impl StoreBinding {
    /// Bind a store under a persist mode.
    pub fn resolve(store: Arc<dyn Store>, mode: PersistMode) -> Result<Self, PersistError> {
        Ok(match mode.resolve(store.supports_merge())? {
            StoreMode::Plain => Self::Plain(store),
            StoreMode::Mergeable => Self::Mergeable(store),
        })
    }

    /// The bound store.
    pub fn store(&self) -> &Arc<dyn Store> {
        match self {
            Self::Plain(store) | Self::Mergeable(store) => store,
        }
    }

    /// Which surface is bound.
    pub fn mode(&self) -> StoreMode {
        match self {
            Self::Plain(_) => StoreMode::Plain,
            Self::Mergeable(_) => StoreMode::Mergeable,
        }
    }

    /// Current content in the bound shape.
    pub fn content(&self) -> StoreContent {
        match self {
            Self::Plain(store) => StoreContent::Plain(store.content()),
            Self::Mergeable(store) => match store.as_mergeable() {
                Some(mergeable) => StoreContent::Mergeable(mergeable.mergeable_content()),
                None => StoreContent::Plain(store.content()),
            },
        }
    }

    /// Changes of the last finished transaction, in the bound shape.
    pub fn transaction_changes(&self) -> StoreChanges {
        match self {
            Self::Plain(store) => StoreChanges::Plain(store.transaction_changes()),
            Self::Mergeable(store) => match store.as_mergeable() {
                Some(mergeable) => StoreChanges::Mergeable(mergeable.transaction_mergeable_changes()),
                None => StoreChanges::Plain(store.transaction_changes()),
            },
        }
    }

    /// Check if a change-set is worth saving under this binding.
    ///
    /// A plain binding only saves plain change-sets. A mergeable binding
    /// tests the stamped shape it reads, or the plain one if handed that.
    pub fn has_changes(&self, changes: &StoreChanges) -> bool {
        match (self, changes) {
            (Self::Plain(_), StoreChanges::Plain(changes)) => !changes.is_empty(),
            (Self::Plain(_), StoreChanges::Mergeable(_)) => false,
            (Self::Mergeable(_), StoreChanges::Mergeable(changes)) => !changes.is_empty(),
            (Self::Mergeable(_), StoreChanges::Plain(changes)) => !changes.is_empty(),
        }
    }

    /// Write a payload read from the medium into the store.
    pub fn apply(&self, payload: Persisted) -> Result<(), PersistError> {
        match payload {
            Persisted::Content(StoreContent::Plain(content)) => {
                self.store().set_content(content);
            }
            Persisted::Changes(StoreChanges::Plain(changes)) => {
                self.store().apply_changes(changes);
            }
            Persisted::Content(StoreContent::Mergeable(content)) => {
                self.mergeable()?.set_mergeable_content(content);
            }
            Persisted::Changes(StoreChanges::Mergeable(changes)) => {
                self.mergeable()?.apply_mergeable_changes(changes);
            }
        }
        Ok(())
    }

    /// Fall back to default content after a failed load.
    ///
    /// A mergeable binding writes it unstamped so any real write wins.
    pub fn set_default_content(&self, content: Content) {
        match self {
            Self::Plain(store) => store.set_content(content),
            Self::Mergeable(store) => match store.as_mergeable() {
                Some(mergeable) => mergeable.set_default_content(content),
                None => store.set_content(content),
            },
        }
    }

    fn mergeable(&self) -> Result<&dyn MergeableStore, PersistError> {
        match self {
            Self::Plain(_) => Err(PersistError::malformed(
                "stamped payload cannot be applied to a plain store",
            )),
            Self::Mergeable(store) => store
                .as_mergeable()
                .ok_or(PersistError::Configuration(
                    storesync_core::ModeError::MergeableStoreRequired,
                )),
        }
    }
}

impl std::fmt::Debug for StoreBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StoreBinding").field(&self.mode()).finish()
    }
}
