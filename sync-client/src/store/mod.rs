//! Store abstraction for storesync.
//!
//! The persister does not own the in-memory store's content model or its
//! transaction semantics; it only needs this capability surface:
//! - read full content and the last transaction's changes
//! - replace content or apply changes
//! - be told when a transaction has finished
//!
//! A store that also carries merge metadata exposes it through
//! [`Store::as_mergeable`].
//!
//! [`MemoryStore`] is a small in-process implementation, used by tests and
//! as a reference for adapters.

mod memory;

pub use memory::{MemoryStore, Transaction};

use std::fmt;
use std::sync::Arc;

use storesync_types::{Changes, Content, MergeableChanges, MergeableContent};
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store refused a listener.
    #[error("listener registration failed: {0}")]
    ListenerRegistration(String),
}

/// Callback fired after every committed transaction.
pub type TransactionListener = Arc<dyn Fn() + Send + Sync>;

/// Handle for removing a store listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Wrap a raw listener number.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw listener number.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// The plain surface of an in-memory transactional store.
///
/// Mutating methods are themselves transactions: they fire
/// did-finish-transaction listeners like any other commit.
pub trait Store: Send + Sync {
    /// Full current content.
    fn content(&self) -> Content;

    /// Changes made by the most recently finished transaction.
    fn transaction_changes(&self) -> Changes;

    /// Replace all content.
    fn set_content(&self, content: Content);

    /// Apply a change-set on top of the current content.
    fn apply_changes(&self, changes: Changes);

    /// Register a callback fired after each committed transaction.
    fn add_did_finish_transaction_listener(
        &self,
        listener: TransactionListener,
    ) -> Result<ListenerId, StoreError>;

    /// Remove a listener. Unknown ids are ignored.
    fn del_listener(&self, id: ListenerId);

    /// The merge-aware surface, if this store has one.
    fn as_mergeable(&self) -> Option<&dyn MergeableStore> {
        None
    }

    /// Check if the store carries merge metadata.
    fn supports_merge(&self) -> bool {
        self.as_mergeable().is_some()
    }
}

/// The merge-aware surface of a store.
pub trait MergeableStore: Send + Sync {
    /// Full current content with merge stamps.
    fn mergeable_content(&self) -> MergeableContent;

    /// Stamped changes made by the most recently finished transaction.
    fn transaction_mergeable_changes(&self) -> MergeableChanges;

    /// Replace all content, stamps included.
    fn set_mergeable_content(&self, content: MergeableContent);

    /// Merge a stamped change-set into the current content.
    fn apply_mergeable_changes(&self, changes: MergeableChanges);

    /// Set content that any stamped write will override.
    fn set_default_content(&self, content: Content);
}
