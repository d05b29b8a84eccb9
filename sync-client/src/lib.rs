//! # sync-client
//!
//! Keeps an in-memory transactional store in sync with a durable medium,
//! in both directions.
//!
//! ## Features
//!
//! - **Serialized I/O**: actions on one queue key run one at a time, in order
//! - **Load/save exclusion**: a load and a save never interleave on one persister
//! - **Auto modes**: follow external changes and save every transaction
//! - **Pluggable media**: mock and key-value storage media included
//! - **Pure State Machine**: uses sync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use storesync_client::{create_storage_persister, MemoryStorage, MemoryStore, SchedulerRegistry};
//!
//! let scheduler = Arc::new(SchedulerRegistry::new());
//! let store = Arc::new(MemoryStore::new_mergeable());
//! let storage = Arc::new(MemoryStorage::new());
//!
//! let persister = create_storage_persister(store, "pets", storage, scheduler, None)?;
//! persister.start_auto_load(Some(Content::new())).await;
//! persister.start_auto_save().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod binding;
pub mod config;
pub mod error;
pub mod medium;
pub mod persister;
pub mod scheduler;
pub mod store;

pub use binding::StoreBinding;
pub use config::{ConfigError, PersisterConfig, StorageSettings};
pub use error::{ErrorHandler, PersistError};
pub use medium::{
    create_storage_persister, ConcurrencyProbe, ContentGetter, ExternalListener, KeyValueStorage,
    Medium, MemoryStorage, MockMedium, ProbeGuard, StorageError, StorageEvent, StorageEventBus,
    StorageListener, StorageListenerId, StorageMedium,
};
pub use persister::Persister;
pub use scheduler::{Action, Scheduled, SchedulerRegistry};
pub use store::{
    ListenerId, MemoryStore, MergeableStore, Store, StoreError, Transaction, TransactionListener,
};

pub use storesync_core::{LoadSaveState, PersistMode, PersisterStats, QueueKey, StoreMode};
pub use storesync_types::{
    Changes, Codec, Content, JsonCodec, MergeableChanges, MergeableContent, Persisted, Stamped,
    StoreChanges, StoreContent,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
