//! Persistence medium abstraction for storesync.
//!
//! A medium is wherever persisted content lives: browser-style key-value
//! storage, a file, a remote peer. The persister only needs to:
//! - read the current payload
//! - write content (optionally with the change-set that produced it)
//! - hear about changes made by someone else
//!
//! # Example
//!
//! ```ignore
//! let medium = MockMedium::new();
//! medium.set_stored(Content::new().with_value("open", json!(true)));
//! let payload = medium.get_persisted().await?;
//! ```

mod mock;
mod storage;

pub use mock::{ConcurrencyProbe, MockMedium, ProbeGuard};
pub use storage::{
    create_storage_persister, KeyValueStorage, MemoryStorage, StorageError, StorageEvent,
    StorageEventBus, StorageListener, StorageListenerId, StorageMedium,
};

use std::sync::Arc;

use async_trait::async_trait;
use storesync_types::{Persisted, StoreChanges, StoreContent};

use crate::error::PersistError;

/// Callback for changes made to the medium by someone else.
///
/// `Some` carries the new content or changes; `None` means "something
/// changed, read it yourself".
pub type ExternalListener = Arc<dyn Fn(Option<Persisted>) + Send + Sync>;

/// Getter for the store's current content, evaluated at write time.
pub type ContentGetter<'a> = &'a (dyn Fn() -> StoreContent + Send + Sync);

/// Durable home of a store's content.
#[async_trait]
pub trait Medium: Send + Sync + 'static {
    /// Token returned by [`Medium::add_listener`].
    type Subscription: Send + 'static;

    /// Read the persisted payload. `Ok(None)` means nothing is stored.
    async fn get_persisted(&self) -> Result<Option<Persisted>, PersistError>;

    /// Write the store's content.
    ///
    /// `changes`, when given, is the change-set that led to `content()`;
    /// a medium may write just that instead of the full content.
    async fn set_persisted(
        &self,
        content: ContentGetter<'_>,
        changes: Option<&StoreChanges>,
    ) -> Result<(), PersistError>;

    /// Start listening for external changes.
    fn add_listener(&self, listener: ExternalListener) -> Result<Self::Subscription, PersistError>;

    /// Stop listening.
    fn del_listener(&self, subscription: Self::Subscription);
}
