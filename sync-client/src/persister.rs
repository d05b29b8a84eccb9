//! The persister: keeps one store and one medium in sync.
//!
//! # Design
//!
//! Every load and save goes through the [`SchedulerRegistry`] under the
//! persister's queue key, so I/O against one medium never overlaps. On top
//! of that a per-persister [`LoadSaveState`] keeps loads and saves apart
//! even on different queues: a save requested while a load is in flight
//! (or the reverse) is dropped, not deferred.
//!
//! The guard check, the counter increment and the enqueue all happen when
//! `load()`/`save()` is called, before the returned future is polled. The
//! future only waits for the drain that call started.
//!
//! Listeners registered with the store and the medium hold weak references,
//! so neither keeps a persister alive. Dropping the last handle removes any
//! listener still registered.
//!
//! # Example
//!
//! ```ignore
//! let scheduler = Arc::new(SchedulerRegistry::new());
//! let persister = Persister::new(store, MockMedium::new(), scheduler, PersisterConfig::new())?;
//!
//! persister.start_auto_load(Some(Content::new())).await;
//! persister.start_auto_save().await;
//! // ...
//! persister.destroy();
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use storesync_core::{Direction, LoadSaveState, PersisterStats, QueueKey, StoreMode};
use storesync_types::{Content, Persisted, StoreChanges};

use crate::binding::StoreBinding;
use crate::config::PersisterConfig;
use crate::error::{report, ErrorHandler, PersistError};
use crate::lock;
use crate::medium::{ExternalListener, Medium};
use crate::scheduler::{Action, Scheduled, SchedulerRegistry};
use crate::store::{ListenerId, Store, TransactionListener};

/// Load/save state plus the number of operations holding it.
#[derive(Debug, Default)]
struct Exclusion {
    state: LoadSaveState,
    holders: usize,
}

/// Holds the load/save guard for one operation.
///
/// The state returns to idle when the last holder drops, including when a
/// pending action is cancelled before it runs.
struct InFlight {
    exclusion: Arc<Mutex<Exclusion>>,
}

impl InFlight {
    fn begin(exclusion: &Arc<Mutex<Exclusion>>, direction: Direction) -> Option<Self> {
        let mut current = lock(exclusion);
        current.state = current.state.begin(direction)?;
        current.holders += 1;
        drop(current);
        Some(Self {
            exclusion: Arc::clone(exclusion),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut current = lock(&self.exclusion);
        current.holders = current.holders.saturating_sub(1);
        if current.holders == 0 {
            current.state = current.state.finish();
        }
    }
}

struct Inner<M: Medium> {
    binding: StoreBinding,
    medium: M,
    scheduler: Arc<SchedulerRegistry>,
    queue: QueueKey,
    exclusion: Arc<Mutex<Exclusion>>,
    loads: AtomicU64,
    saves: AtomicU64,
    auto_load: Mutex<Option<M::Subscription>>,
    auto_save: Mutex<Option<ListenerId>>,
    on_ignored_error: Option<ErrorHandler>,
    destroyed: AtomicBool,
}

impl<M: Medium> Inner<M> {
    fn report(&self, error: &PersistError) {
        report(self.on_ignored_error.as_ref(), error);
    }

    fn schedule(self: &Arc<Self>, actions: Vec<Action>) -> Scheduled {
        self.scheduler
            .schedule(&self.queue, actions, self.on_ignored_error.clone())
    }

    fn begin_load(self: &Arc<Self>, default: Option<Content>) -> Option<Scheduled> {
        let Some(guard) = InFlight::begin(&self.exclusion, Direction::Load) else {
            tracing::debug!("Skipping load on queue {}: save in flight", self.queue);
            return None;
        };
        self.loads.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(self);
        let action: Action = Box::pin(async move {
            let _guard = guard;
            if let Err(e) = inner.fetch_and_apply().await {
                inner.report(&e);
                if let Some(default) = default {
                    if !inner.is_destroyed() {
                        inner.binding.set_default_content(default);
                    }
                }
            }
            Ok(())
        });
        Some(self.schedule(vec![action]))
    }

    async fn fetch_and_apply(&self) -> Result<(), PersistError> {
        let payload = self
            .medium
            .get_persisted()
            .await?
            .ok_or_else(|| PersistError::malformed("medium holds no content"))?;

        if self.is_destroyed() {
            tracing::debug!("Discarding load on queue {}: persister destroyed", self.queue);
            return Ok(());
        }
        self.binding.apply(payload)
    }

    fn begin_save(self: &Arc<Self>, changes: Option<StoreChanges>) -> Option<Scheduled> {
        let Some(guard) = InFlight::begin(&self.exclusion, Direction::Save) else {
            tracing::debug!("Skipping save on queue {}: load in flight", self.queue);
            return None;
        };
        self.saves.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(self);
        let action: Action = Box::pin(async move {
            let _guard = guard;
            let binding = inner.binding.clone();
            let content = move || binding.content();
            inner.medium.set_persisted(&content, changes.as_ref()).await
        });
        Some(self.schedule(vec![action]))
    }

    /// Apply a payload pushed by the medium, or re-read on a bare signal.
    fn on_external_change(self: &Arc<Self>, payload: Option<Persisted>) {
        if self.is_destroyed() {
            return;
        }
        let Some(payload) = payload else {
            self.begin_load(None);
            return;
        };
        let Some(_guard) = InFlight::begin(&self.exclusion, Direction::Load) else {
            tracing::debug!("Skipping external change on queue {}: save in flight", self.queue);
            return;
        };
        self.loads.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.binding.apply(payload) {
            self.report(&e);
        }
    }

    fn on_transaction(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        let changes = self.binding.transaction_changes();
        if self.binding.has_changes(&changes) {
            self.begin_save(Some(changes));
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn listen_external(self: &Arc<Self>) {
        if self.is_destroyed() {
            tracing::debug!("Not starting auto-load on queue {}: persister destroyed", self.queue);
            return;
        }
        let weak = Arc::downgrade(self);
        let listener: ExternalListener = Arc::new(move |payload| {
            if let Some(inner) = weak.upgrade() {
                inner.on_external_change(payload);
            }
        });

        match self.medium.add_listener(listener) {
            Ok(subscription) => {
                let previous = lock(&self.auto_load).replace(subscription);
                if let Some(previous) = previous {
                    self.medium.del_listener(previous);
                }
                tracing::info!("Auto-load started on queue {}", self.queue);
                if self.is_destroyed() {
                    self.unlisten_external();
                }
            }
            Err(e) => self.report(&e),
        }
    }

    fn listen_transactions(self: &Arc<Self>) {
        if self.is_destroyed() {
            tracing::debug!("Not starting auto-save on queue {}: persister destroyed", self.queue);
            return;
        }
        let weak = Arc::downgrade(self);
        let listener: TransactionListener = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_transaction();
            }
        });

        let store = self.binding.store();
        match store.add_did_finish_transaction_listener(listener) {
            Ok(id) => {
                let previous = lock(&self.auto_save).replace(id);
                if let Some(previous) = previous {
                    store.del_listener(previous);
                }
                tracing::info!("Auto-save started on queue {}", self.queue);
                if self.is_destroyed() {
                    self.unlisten_transactions();
                }
            }
            Err(e) => self.report(&e.into()),
        }
    }

    fn unlisten_external(&self) {
        let subscription = lock(&self.auto_load).take();
        if let Some(subscription) = subscription {
            self.medium.del_listener(subscription);
            tracing::info!("Auto-load stopped on queue {}", self.queue);
        }
    }

    fn unlisten_transactions(&self) {
        let id = lock(&self.auto_save).take();
        if let Some(id) = id {
            self.binding.store().del_listener(id);
            tracing::info!("Auto-save stopped on queue {}", self.queue);
        }
    }
}

impl<M: Medium> Drop for Inner<M> {
    fn drop(&mut self) {
        let subscription = self
            .auto_load
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = subscription {
            self.medium.del_listener(subscription);
        }
        let id = self
            .auto_save
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = id {
            self.binding.store().del_listener(id);
        }
    }
}

/// Keeps a store and a medium in sync.
///
/// Cheap to clone; clones share all state.
pub struct Persister<M: Medium> {
    inner: Arc<Inner<M>>,
}

impl<M: Medium> Clone for Persister<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Medium> Persister<M> {
    /// Create a persister for a store and a medium.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Configuration`] if the store cannot be
    /// persisted under the configured mode. This is the only error ever
    /// returned to a caller; all others go to the configured handler.
    pub fn new(
        store: Arc<dyn Store>,
        medium: M,
        scheduler: Arc<SchedulerRegistry>,
        config: PersisterConfig,
    ) -> Result<Self, PersistError> {
        let binding = StoreBinding::resolve(store, config.mode)?;
        let queue = config.queue.unwrap_or_else(QueueKey::private);
        tracing::debug!("Persister bound as {:?} on queue {}", binding.mode(), queue);

        Ok(Self {
            inner: Arc::new(Inner {
                binding,
                medium,
                scheduler,
                queue,
                exclusion: Arc::new(Mutex::new(Exclusion::default())),
                loads: AtomicU64::new(0),
                saves: AtomicU64::new(0),
                auto_load: Mutex::new(None),
                auto_save: Mutex::new(None),
                on_ignored_error: config.on_ignored_error,
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    /// Load content from the medium into the store.
    ///
    /// Skipped while a save is in flight. If the read fails or returns
    /// nothing usable, the error is reported and `default`, when given,
    /// becomes the store's content.
    pub fn load(&self, default: Option<Content>) -> impl Future<Output = &Self> + '_ {
        let scheduled = self.inner.begin_load(default);
        async move {
            if let Some(scheduled) = scheduled {
                scheduled.finished().await;
            }
            self
        }
    }

    /// Save the store's content to the medium.
    ///
    /// Skipped while a load is in flight. `changes`, when given, is handed
    /// to the medium with the content getter.
    pub fn save(&self, changes: Option<StoreChanges>) -> impl Future<Output = &Self> + '_ {
        let scheduled = self.inner.begin_save(changes);
        async move {
            if let Some(scheduled) = scheduled {
                scheduled.finished().await;
            }
            self
        }
    }

    /// Load once, then apply every external change the medium announces.
    ///
    /// Replaces any auto-load already running. The subscription is made
    /// when the returned future completes.
    pub fn start_auto_load(&self, default: Option<Content>) -> impl Future<Output = &Self> + '_ {
        let loaded = self.stop_auto_load().load(default);
        async move {
            loaded.await;
            self.inner.listen_external();
            self
        }
    }

    /// Stop applying external changes. Does nothing if not auto-loading.
    pub fn stop_auto_load(&self) -> &Self {
        self.inner.unlisten_external();
        self
    }

    /// Check if an external-change subscription is live.
    pub fn is_auto_loading(&self) -> bool {
        lock(&self.inner.auto_load).is_some()
    }

    /// Save once, then save the changes of every store transaction.
    ///
    /// Replaces any auto-save already running. The listener is registered
    /// when the returned future completes.
    pub fn start_auto_save(&self) -> impl Future<Output = &Self> + '_ {
        let saved = self.stop_auto_save().save(None);
        async move {
            saved.await;
            self.inner.listen_transactions();
            self
        }
    }

    /// Stop saving on transactions. Does nothing if not auto-saving.
    pub fn stop_auto_save(&self) -> &Self {
        self.inner.unlisten_transactions();
        self
    }

    /// Check if a transaction listener is live.
    pub fn is_auto_saving(&self) -> bool {
        lock(&self.inner.auto_save).is_some()
    }

    /// Run arbitrary actions on this persister's queue.
    ///
    /// Their errors go to the configured handler.
    pub fn schedule(&self, actions: Vec<Action>) -> impl Future<Output = &Self> + '_ {
        let scheduled = self.inner.schedule(actions);
        async move {
            scheduled.finished().await;
            self
        }
    }

    /// Cancel pending work and stop both auto modes.
    ///
    /// An action already running finishes, but a load that has not yet
    /// applied its content will not. An auto mode still starting when this
    /// is called never subscribes, and external changes or transactions
    /// arriving afterwards are ignored. With a shared queue key, actions other
    /// persisters queued are cancelled as well.
    pub fn destroy(&self) -> &Self {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        let cancelled = self.inner.scheduler.clear(&self.inner.queue);
        tracing::info!(
            "Destroying persister on queue {} ({} pending actions cancelled)",
            self.inner.queue,
            cancelled
        );
        self.stop_auto_load().stop_auto_save()
    }

    /// Load and save counters.
    pub fn stats(&self) -> PersisterStats {
        PersisterStats {
            loads: self.inner.loads.load(Ordering::Relaxed),
            saves: self.inner.saves.load(Ordering::Relaxed),
        }
    }

    /// The persisted store.
    pub fn store(&self) -> &Arc<dyn Store> {
        self.inner.binding.store()
    }

    /// The medium.
    pub fn medium(&self) -> &M {
        &self.inner.medium
    }

    /// The queue this persister schedules on.
    pub fn queue_key(&self) -> &QueueKey {
        &self.inner.queue
    }

    /// Which store surface is persisted.
    pub fn store_mode(&self) -> StoreMode {
        self.inner.binding.mode()
    }

    /// Current load/save guard state.
    pub fn load_save_state(&self) -> LoadSaveState {
        lock(&self.inner.exclusion).state
    }
}

impl<M: Medium> fmt::Debug for Persister<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persister")
            .field("queue", &self.inner.queue)
            .field("mode", &self.inner.binding.mode())
            .field("state", &self.load_save_state())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::MockMedium;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;
    use storesync_core::{ModeError, PersistMode};
    use storesync_types::Changes;

    fn setup() -> (Arc<MemoryStore>, MockMedium, Persister<MockMedium>) {
        let store = Arc::new(MemoryStore::new_plain());
        let medium = MockMedium::new();
        let persister = Persister::new(
            store.clone(),
            medium.clone(),
            Arc::new(SchedulerRegistry::new()),
            PersisterConfig::new(),
        )
        .unwrap();
        (store, medium, persister)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // ===========================================
    // Construction Tests
    // ===========================================

    #[test]
    fn plain_store_under_mergeable_only_is_rejected() {
        let err = Persister::new(
            Arc::new(MemoryStore::new_plain()),
            MockMedium::new(),
            Arc::new(SchedulerRegistry::new()),
            PersisterConfig::new().with_mode(PersistMode::MergeableStoreOnly),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            PersistError::Configuration(ModeError::MergeableStoreRequired)
        ));
    }

    #[test]
    fn new_persister_is_idle() {
        let (_, _, persister) = setup();
        assert!(persister.load_save_state().is_idle());
        assert_eq!(persister.stats(), PersisterStats::default());
        assert!(!persister.is_auto_loading());
        assert!(!persister.is_auto_saving());
        assert!(!persister.queue_key().is_shared());
    }

    // ===========================================
    // Load / Save Tests
    // ===========================================

    #[tokio::test]
    async fn load_applies_stored_content() {
        let (store, medium, persister) = setup();
        medium.set_stored(Content::new().with_value("x", json!(1)));

        persister.load(None).await;

        assert_eq!(store.value("x"), Some(json!(1)));
        assert_eq!(persister.stats().loads, 1);
        assert!(persister.load_save_state().is_idle());
    }

    #[tokio::test]
    async fn load_applies_stored_changes() {
        let (store, medium, persister) = setup();
        store.set_content(Content::new().with_value("x", json!(1)).with_value("y", json!(2)));
        let mut changes = Changes::new();
        changes.values.insert("y".into(), None);
        medium.set_stored(changes);

        persister.load(None).await;

        assert_eq!(store.content(), Content::new().with_value("x", json!(1)));
    }

    #[tokio::test]
    async fn save_writes_full_content() {
        let (store, medium, persister) = setup();
        store.set_content(Content::new().with_value("x", json!(1)));

        persister.save(None).await;

        assert_eq!(
            medium.stored(),
            Some(Content::new().with_value("x", json!(1)).into())
        );
        assert_eq!(persister.stats().saves, 1);
    }

    #[tokio::test]
    async fn calls_chain() {
        let (store, medium, persister) = setup();
        store.set_content(Content::new().with_value("x", json!(1)));

        persister.save(None).await.load(None).await;

        assert_eq!(medium.writes().len(), 1);
        assert_eq!(medium.read_count(), 1);
        assert_eq!(persister.stats(), PersisterStats { loads: 1, saves: 1 });
    }

    #[tokio::test]
    async fn save_right_after_load_is_dropped() {
        let (_, medium, persister) = setup();
        medium.set_stored(Content::new());

        let loading = persister.load(None);
        assert!(persister.load_save_state().is_loading());
        persister.save(None).await;
        loading.await;

        assert_eq!(persister.stats(), PersisterStats { loads: 1, saves: 0 });
        assert!(medium.writes().is_empty());
    }

    #[tokio::test]
    async fn load_right_after_save_is_dropped() {
        let (_, medium, persister) = setup();

        let saving = persister.save(None);
        assert!(persister.load_save_state().is_saving());
        persister.load(None).await;
        saving.await;

        assert_eq!(persister.stats(), PersisterStats { loads: 0, saves: 1 });
        assert_eq!(medium.read_count(), 0);
    }

    #[tokio::test]
    async fn missing_content_falls_back_to_default() {
        let (store, _, persister) = setup();

        persister
            .load(Some(Content::new().with_value("x", json!(0))))
            .await;

        assert_eq!(store.value("x"), Some(json!(0)));
    }

    #[tokio::test]
    async fn failed_save_is_reported_not_returned() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let medium = MockMedium::new();
        let persister = Persister::new(
            Arc::new(MemoryStore::new_plain()),
            medium.clone(),
            Arc::new(SchedulerRegistry::new()),
            PersisterConfig::new()
                .with_error_handler(Arc::new(move |e| sink.lock().unwrap().push(e.to_string()))),
        )
        .unwrap();
        medium.fail_next_write("read-only");

        persister.save(None).await;

        assert_eq!(*seen.lock().unwrap(), vec!["medium I/O error: read-only"]);
        assert!(persister.load_save_state().is_idle());
    }

    #[test]
    fn save_without_runtime_is_reported_and_releases_guard() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let medium = MockMedium::new();
        let persister = Persister::new(
            Arc::new(MemoryStore::new_plain()),
            medium.clone(),
            Arc::new(SchedulerRegistry::default()),
            PersisterConfig::new()
                .with_error_handler(Arc::new(move |e| sink.lock().unwrap().push(e.to_string()))),
        )
        .unwrap();

        drop(persister.save(None));

        assert!(persister.load_save_state().is_idle());
        assert_eq!(persister.stats().saves, 1);
        assert!(medium.writes().is_empty());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with("scheduling error"));
    }

    // ===========================================
    // Lifecycle Tests
    // ===========================================

    #[tokio::test]
    async fn cancelled_actions_release_guard() {
        let (_, medium, persister) = setup();
        medium.set_delay(Duration::from_millis(10));

        let first = persister.save(None);
        let second = persister.save(None);
        tokio::time::sleep(Duration::from_millis(2)).await;
        persister.destroy();
        first.await;
        second.await;

        assert!(persister.load_save_state().is_idle());
        assert_eq!(medium.writes().len(), 1);
    }

    #[tokio::test]
    async fn dropping_last_handle_unsubscribes() {
        let (store, medium, persister) = setup();
        medium.set_stored(Content::new());

        persister.start_auto_load(None).await;
        persister.start_auto_save().await;
        settle().await;
        assert_eq!(medium.listener_count(), 1);
        assert_eq!(store.listener_count(), 1);

        drop(persister);

        assert_eq!(medium.listener_count(), 0);
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let (_, medium, persister) = setup();
        medium.set_stored(Content::new());
        let clone = persister.clone();

        clone.start_auto_load(None).await;

        assert!(persister.is_auto_loading());
        assert_eq!(persister.stats().loads, 1);
    }

    #[test]
    fn debug_shows_queue_and_mode() {
        let (_, _, persister) = setup();
        let shown = format!("{:?}", persister);
        assert!(shown.contains("private#"));
        assert!(shown.contains("Plain"));
    }
}
