//! Mock medium for testing.
//!
//! Holds one stored payload, captures every write, and can be told to
//! fail, to slow down, or to announce an external change.

use super::{ContentGetter, ExternalListener, Medium};
use crate::error::PersistError;
use crate::lock;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storesync_types::{Persisted, StoreChanges};

/// Counts how many guarded sections are active at once.
///
/// Share one probe between the medium and anything else whose work must
/// never overlap with a write; `max_active()` above 1 means it did.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyProbe {
    active: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
}

/// Marks a guarded section as active until dropped.
#[derive(Debug)]
pub struct ProbeGuard {
    active: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    /// Create a probe with no recorded activity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a guarded section.
    pub fn enter(&self) -> ProbeGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        ProbeGuard {
            active: Arc::clone(&self.active),
        }
    }

    /// Highest number of sections ever active at once.
    pub fn max_active(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock medium for testing.
///
/// Clones share state, so a test can keep one clone while the persister
/// owns another.
#[derive(Default)]
pub struct MockMedium {
    inner: Arc<Mutex<MockMediumInner>>,
    probe: ConcurrencyProbe,
}

#[derive(Default)]
struct MockMediumInner {
    stored: Option<Persisted>,
    writes: Vec<Persisted>,
    reads: usize,
    delay: Option<Duration>,
    fail_next_read: Option<String>,
    fail_next_write: Option<String>,
    fail_next_subscribe: Option<String>,
    listeners: BTreeMap<u64, ExternalListener>,
    next_listener: u64,
    unsubscribes: usize,
}

impl MockMedium {
    /// Create an empty mock medium.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored payload.
    pub fn set_stored(&self, payload: impl Into<Persisted>) {
        lock(&self.inner).stored = Some(payload.into());
    }

    /// Get the stored payload.
    pub fn stored(&self) -> Option<Persisted> {
        lock(&self.inner).stored.clone()
    }

    /// Get every write, in order.
    ///
    /// A write made with a change-set is recorded as that change-set, any
    /// other write as the full content.
    pub fn writes(&self) -> Vec<Persisted> {
        lock(&self.inner).writes.clone()
    }

    /// Number of successful reads.
    pub fn read_count(&self) -> usize {
        lock(&self.inner).reads
    }

    /// Make every read and write take this long.
    pub fn set_delay(&self, delay: Duration) {
        lock(&self.inner).delay = Some(delay);
    }

    /// Cause the next read to fail with the given error.
    pub fn fail_next_read(&self, error: &str) {
        lock(&self.inner).fail_next_read = Some(error.to_string());
    }

    /// Cause the next write to fail with the given error.
    pub fn fail_next_write(&self, error: &str) {
        lock(&self.inner).fail_next_write = Some(error.to_string());
    }

    /// Cause the next `add_listener()` to fail with the given error.
    pub fn fail_next_subscribe(&self, error: &str) {
        lock(&self.inner).fail_next_subscribe = Some(error.to_string());
    }

    /// Announce an external change to every listener.
    pub fn trigger_external(&self, payload: Option<Persisted>) {
        let listeners: Vec<ExternalListener> = lock(&self.inner).listeners.values().cloned().collect();
        for listener in listeners {
            listener(payload.clone());
        }
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    /// Number of `del_listener()` calls for a live subscription.
    pub fn unsubscribe_count(&self) -> usize {
        lock(&self.inner).unsubscribes
    }

    /// Probe entered for the duration of every write.
    pub fn probe(&self) -> ConcurrencyProbe {
        self.probe.clone()
    }
}

impl Clone for MockMedium {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            probe: self.probe.clone(),
        }
    }
}

#[async_trait]
impl Medium for MockMedium {
    type Subscription = u64;

    async fn get_persisted(&self) -> Result<Option<Persisted>, PersistError> {
        let delay = {
            let mut inner = lock(&self.inner);
            if let Some(error) = inner.fail_next_read.take() {
                return Err(PersistError::MediumIo(error));
            }
            inner.delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = lock(&self.inner);
        inner.reads += 1;
        Ok(inner.stored.clone())
    }

    async fn set_persisted(
        &self,
        content: ContentGetter<'_>,
        changes: Option<&StoreChanges>,
    ) -> Result<(), PersistError> {
        let delay = {
            let mut inner = lock(&self.inner);
            if let Some(error) = inner.fail_next_write.take() {
                return Err(PersistError::MediumIo(error));
            }
            inner.delay
        };

        let _writing = self.probe.enter();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let content = Persisted::Content(content());
        let mut inner = lock(&self.inner);
        inner.writes.push(match changes {
            Some(changes) => Persisted::Changes(changes.clone()),
            None => content.clone(),
        });
        inner.stored = Some(content);
        Ok(())
    }

    fn add_listener(&self, listener: ExternalListener) -> Result<u64, PersistError> {
        let mut inner = lock(&self.inner);
        if let Some(error) = inner.fail_next_subscribe.take() {
            return Err(PersistError::Subscription(error));
        }
        inner.next_listener += 1;
        let id = inner.next_listener;
        inner.listeners.insert(id, listener);
        Ok(id)
    }

    fn del_listener(&self, subscription: u64) {
        let mut inner = lock(&self.inner);
        if inner.listeners.remove(&subscription).is_some() {
            inner.unsubscribes += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storesync_types::{Changes, Content, StoreContent};

    fn content_getter(content: Content) -> impl Fn() -> StoreContent + Send + Sync {
        move || StoreContent::Plain(content.clone())
    }

    // ===========================================
    // MockMedium Basic Tests
    // ===========================================

    #[tokio::test]
    async fn empty_medium_reads_nothing() {
        let medium = MockMedium::new();
        assert_eq!(medium.get_persisted().await.unwrap(), None);
        assert_eq!(medium.read_count(), 1);
    }

    #[tokio::test]
    async fn write_stores_full_content() {
        let medium = MockMedium::new();
        let content = Content::new().with_value("x", json!(1));

        medium
            .set_persisted(&content_getter(content.clone()), None)
            .await
            .unwrap();

        assert_eq!(medium.stored(), Some(content.clone().into()));
        assert_eq!(medium.writes(), vec![Persisted::from(content)]);
    }

    #[tokio::test]
    async fn write_with_changes_records_changes() {
        let medium = MockMedium::new();
        let content = Content::new().with_value("x", json!(2));
        let mut changes = Changes::new();
        changes.values.insert("x".into(), Some(json!(2)));

        medium
            .set_persisted(
                &content_getter(content.clone()),
                Some(&StoreChanges::Plain(changes.clone())),
            )
            .await
            .unwrap();

        assert_eq!(medium.writes(), vec![Persisted::from(changes)]);
        assert_eq!(medium.stored(), Some(content.into()));
    }

    #[tokio::test]
    async fn clones_share_state() {
        let medium = MockMedium::new();
        let clone = medium.clone();
        clone.set_stored(Content::new().with_value("x", json!(1)));
        assert!(medium.get_persisted().await.unwrap().is_some());
    }

    // ===========================================
    // MockMedium Failure Tests
    // ===========================================

    #[tokio::test]
    async fn forced_failures_are_one_shot() {
        let medium = MockMedium::new();
        medium.fail_next_read("disk gone");
        medium.fail_next_write("quota");

        assert!(matches!(
            medium.get_persisted().await,
            Err(PersistError::MediumIo(e)) if e == "disk gone"
        ));
        assert!(medium.get_persisted().await.is_ok());

        let getter = content_getter(Content::new());
        assert!(medium.set_persisted(&getter, None).await.is_err());
        assert!(medium.set_persisted(&getter, None).await.is_ok());
        assert_eq!(medium.writes().len(), 1);
    }

    // ===========================================
    // MockMedium Listener Tests
    // ===========================================

    #[test]
    fn listeners_receive_external_changes() {
        let medium = MockMedium::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = medium
            .add_listener(Arc::new(move |payload| sink.lock().unwrap().push(payload)))
            .unwrap();

        medium.trigger_external(None);
        medium.del_listener(id);
        medium.del_listener(id);
        medium.trigger_external(None);

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(medium.unsubscribe_count(), 1);
        assert_eq!(medium.listener_count(), 0);
    }

    #[test]
    fn subscribe_failure() {
        let medium = MockMedium::new();
        medium.fail_next_subscribe("closed");
        assert!(matches!(
            medium.add_listener(Arc::new(|_| {})),
            Err(PersistError::Subscription(_))
        ));
    }

    #[test]
    fn probe_tracks_overlap() {
        let probe = ConcurrencyProbe::new();
        {
            let _a = probe.enter();
            let _b = probe.enter();
        }
        let _c = probe.enter();
        assert_eq!(probe.max_active(), 2);
    }
}
