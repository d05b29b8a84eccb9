//! Key-value storage medium.
//!
//! Persists a store as one encoded string under a caller-chosen name in a
//! synchronous key-value storage, the way a browser page uses local or
//! session storage. Writes made by other contexts arrive as
//! [`StorageEvent`]s; writes made through the storage itself do not.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use storesync_core::PersistMode;
use storesync_types::{Codec, JsonCodec, Persisted, StoreChanges};
use thiserror::Error;

use super::{ContentGetter, ExternalListener, Medium};
use crate::config::PersisterConfig;
use crate::error::{ErrorHandler, PersistError};
use crate::lock;
use crate::persister::Persister;
use crate::scheduler::SchedulerRegistry;
use crate::store::Store;

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The write was refused, typically for quota.
    #[error("storage write failed: {0}")]
    Write(String),

    /// The event source refused a listener.
    #[error("storage event subscription failed: {0}")]
    Subscribe(String),
}

/// A change made to a storage by another context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// Identity of the storage that changed.
    pub storage_id: u64,
    /// Changed key, `None` when the whole storage was cleared.
    pub key: Option<String>,
    /// New value, `None` when the key was removed.
    pub new_value: Option<String>,
}

/// Callback for storage events.
pub type StorageListener = Arc<dyn Fn(&StorageEvent) + Send + Sync>;

/// Handle for removing a storage listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageListenerId(u64);

/// A synchronous string key-value storage with a change-event source.
pub trait KeyValueStorage: Send + Sync + 'static {
    /// Identity used to tell storages apart in events.
    fn storage_id(&self) -> u64;

    /// Read an item.
    fn get_item(&self, key: &str) -> Option<String>;

    /// Write an item.
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove an item.
    fn remove_item(&self, key: &str);

    /// Listen for changes made by other contexts.
    fn subscribe(&self, listener: StorageListener) -> Result<StorageListenerId, StorageError>;

    /// Stop listening.
    fn unsubscribe(&self, id: StorageListenerId);
}

/// Event source shared by every storage of one context.
///
/// Like the browser's `storage` event, every listener hears about every
/// storage and filters by identity.
#[derive(Clone, Default)]
pub struct StorageEventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    listeners: Mutex<BTreeMap<u64, StorageListener>>,
    next_id: AtomicU64,
}

impl StorageEventBus {
    /// Create a bus with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener.
    pub fn subscribe(&self, listener: StorageListener) -> StorageListenerId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners).insert(id, listener);
        StorageListenerId(id)
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: StorageListenerId) {
        lock(&self.inner.listeners).remove(&id.0);
    }

    /// Deliver an event to every listener.
    pub fn emit(&self, event: &StorageEvent) {
        let listeners: Vec<StorageListener> =
            lock(&self.inner.listeners).values().cloned().collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Number of listeners.
    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }
}

/// In-process [`KeyValueStorage`].
///
/// `set_item`/`remove_item` behave like this context's own writes and emit
/// nothing. The `*_external` methods simulate another context writing.
pub struct MemoryStorage {
    id: u64,
    items: Mutex<BTreeMap<String, String>>,
    bus: StorageEventBus,
    fail_next_set: Mutex<Option<String>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::with_bus(StorageEventBus::new())
    }
}

impl MemoryStorage {
    /// Create an empty storage with its own event bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty storage emitting on a shared bus.
    pub fn with_bus(bus: StorageEventBus) -> Self {
        Self {
            id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            items: Mutex::new(BTreeMap::new()),
            bus,
            fail_next_set: Mutex::new(None),
        }
    }

    /// The event bus this storage emits on.
    pub fn bus(&self) -> &StorageEventBus {
        &self.bus
    }

    /// Write an item as another context would.
    pub fn set_item_external(&self, key: &str, value: &str) {
        lock(&self.items).insert(key.to_string(), value.to_string());
        self.bus.emit(&StorageEvent {
            storage_id: self.id,
            key: Some(key.to_string()),
            new_value: Some(value.to_string()),
        });
    }

    /// Remove an item as another context would.
    pub fn remove_item_external(&self, key: &str) {
        lock(&self.items).remove(key);
        self.bus.emit(&StorageEvent {
            storage_id: self.id,
            key: Some(key.to_string()),
            new_value: None,
        });
    }

    /// Cause the next `set_item()` to fail.
    pub fn fail_next_set(&self, reason: &str) {
        *lock(&self.fail_next_set) = Some(reason.to_string());
    }
}

impl KeyValueStorage for MemoryStorage {
    fn storage_id(&self) -> u64 {
        self.id
    }

    fn get_item(&self, key: &str) -> Option<String> {
        lock(&self.items).get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if let Some(reason) = lock(&self.fail_next_set).take() {
            return Err(StorageError::Write(reason));
        }
        lock(&self.items).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        lock(&self.items).remove(key);
    }

    fn subscribe(&self, listener: StorageListener) -> Result<StorageListenerId, StorageError> {
        Ok(self.bus.subscribe(listener))
    }

    fn unsubscribe(&self, id: StorageListenerId) {
        self.bus.unsubscribe(id);
    }
}

/// Medium persisting to one named item of a [`KeyValueStorage`].
pub struct StorageMedium<S: KeyValueStorage> {
    storage: Arc<S>,
    storage_name: String,
    codec: Arc<dyn Codec>,
}

impl<S: KeyValueStorage> StorageMedium<S> {
    /// Persist under `storage_name` using the JSON codec.
    pub fn new(storage: Arc<S>, storage_name: impl Into<String>) -> Self {
        Self {
            storage,
            storage_name: storage_name.into(),
            codec: Arc::new(JsonCodec::new()),
        }
    }

    /// Use a different codec.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// The item name content is stored under.
    pub fn storage_name(&self) -> &str {
        &self.storage_name
    }

    /// The underlying storage.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }
}

#[async_trait]
impl<S: KeyValueStorage> Medium for StorageMedium<S> {
    type Subscription = StorageListenerId;

    async fn get_persisted(&self) -> Result<Option<Persisted>, PersistError> {
        match self.storage.get_item(&self.storage_name) {
            Some(text) => Ok(Some(self.codec.decode(&text)?)),
            None => Ok(None),
        }
    }

    /// Always writes full content; the change-set is not used.
    async fn set_persisted(
        &self,
        content: ContentGetter<'_>,
        _changes: Option<&StoreChanges>,
    ) -> Result<(), PersistError> {
        let text = self.codec.encode(&Persisted::Content(content()))?;
        self.storage
            .set_item(&self.storage_name, &text)
            .map_err(|e| PersistError::MediumIo(e.to_string()))
    }

    fn add_listener(
        &self,
        listener: ExternalListener,
    ) -> Result<StorageListenerId, PersistError> {
        let storage_id = self.storage.storage_id();
        let storage_name = self.storage_name.clone();
        let codec = Arc::clone(&self.codec);

        self.storage
            .subscribe(Arc::new(move |event: &StorageEvent| {
                if event.storage_id != storage_id || event.key.as_deref() != Some(storage_name.as_str()) {
                    return;
                }
                let payload = event.new_value.as_deref().and_then(|text| {
                    codec
                        .decode(text)
                        .map_err(|e| tracing::debug!("Undecodable storage event: {}", e))
                        .ok()
                });
                listener(payload);
            }))
            .map_err(|e| PersistError::Subscription(e.to_string()))
    }

    fn del_listener(&self, subscription: StorageListenerId) {
        self.storage.unsubscribe(subscription);
    }
}

/// Create a persister for a store kept in a named storage item.
///
/// Accepts plain and mergeable stores and uses a private queue.
pub fn create_storage_persister<S: KeyValueStorage>(
    store: Arc<dyn Store>,
    storage_name: &str,
    storage: Arc<S>,
    scheduler: Arc<SchedulerRegistry>,
    on_ignored_error: Option<ErrorHandler>,
) -> Result<Persister<StorageMedium<S>>, PersistError> {
    let mut config = PersisterConfig::new().with_mode(PersistMode::StoreOrMergeableStore);
    if let Some(handler) = on_ignored_error {
        config = config.with_error_handler(handler);
    }
    Persister::new(
        store,
        StorageMedium::new(storage, storage_name),
        scheduler,
        config,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storesync_types::{Content, StoreContent};

    fn plain_getter(content: Content) -> impl Fn() -> StoreContent + Send + Sync {
        move || StoreContent::Plain(content.clone())
    }

    fn recorder() -> (ExternalListener, Arc<Mutex<Vec<Option<Persisted>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: ExternalListener = Arc::new(move |payload| sink.lock().unwrap().push(payload));
        (listener, seen)
    }

    // ===========================================
    // Read / Write Tests
    // ===========================================

    #[tokio::test]
    async fn writes_encoded_full_content() {
        let storage = Arc::new(MemoryStorage::new());
        let medium = StorageMedium::new(Arc::clone(&storage), "pets");
        let content = Content::new().with_value("open", json!(true));

        medium
            .set_persisted(&plain_getter(content.clone()), None)
            .await
            .unwrap();

        assert_eq!(storage.get_item("pets").unwrap(), r#"[{},{"open":true}]"#);
        assert_eq!(medium.get_persisted().await.unwrap(), Some(content.into()));
    }

    #[tokio::test]
    async fn missing_item_reads_as_nothing() {
        let medium = StorageMedium::new(Arc::new(MemoryStorage::new()), "pets");
        assert_eq!(medium.get_persisted().await.unwrap(), None);
    }

    #[tokio::test]
    async fn garbage_item_is_malformed() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_item("pets", "{not json").unwrap();
        let medium = StorageMedium::new(storage, "pets");

        assert!(matches!(
            medium.get_persisted().await,
            Err(PersistError::MalformedContent { .. })
        ));
    }

    #[tokio::test]
    async fn refused_write_is_medium_io() {
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_next_set("quota exceeded");
        let medium = StorageMedium::new(storage, "pets");

        let err = medium
            .set_persisted(&plain_getter(Content::new()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::MediumIo(e) if e.contains("quota")));
    }

    // ===========================================
    // Event Tests
    // ===========================================

    #[test]
    fn own_writes_emit_no_events() {
        let storage = Arc::new(MemoryStorage::new());
        let medium = StorageMedium::new(Arc::clone(&storage), "pets");
        let (listener, seen) = recorder();
        medium.add_listener(listener).unwrap();

        storage.set_item("pets", "[{},{}]").unwrap();

        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn external_write_delivers_decoded_payload() {
        let storage = Arc::new(MemoryStorage::new());
        let medium = StorageMedium::new(Arc::clone(&storage), "pets");
        let (listener, seen) = recorder();
        medium.add_listener(listener).unwrap();

        storage.set_item_external("pets", r#"[{},{"x":1}]"#);
        storage.set_item_external("pets", "garbage");
        storage.remove_item_external("pets");

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen[0],
            Some(Content::new().with_value("x", json!(1)).into())
        );
        assert_eq!(seen[1], None);
        assert_eq!(seen[2], None);
    }

    #[test]
    fn events_are_filtered_by_storage_and_key() {
        let bus = StorageEventBus::new();
        let local = Arc::new(MemoryStorage::with_bus(bus.clone()));
        let session = Arc::new(MemoryStorage::with_bus(bus.clone()));
        let medium = StorageMedium::new(Arc::clone(&local), "pets");
        let (listener, seen) = recorder();
        medium.add_listener(listener).unwrap();

        session.set_item_external("pets", "[{},{}]");
        local.set_item_external("people", "[{},{}]");
        assert!(seen.lock().unwrap().is_empty());

        local.set_item_external("pets", "[{},{}]");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn del_listener_unsubscribes() {
        let storage = Arc::new(MemoryStorage::new());
        let medium = StorageMedium::new(Arc::clone(&storage), "pets");
        let (listener, _) = recorder();

        let id = medium.add_listener(listener).unwrap();
        assert_eq!(storage.bus().listener_count(), 1);
        medium.del_listener(id);
        assert_eq!(storage.bus().listener_count(), 0);
    }
}
