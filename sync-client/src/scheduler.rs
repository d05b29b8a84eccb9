//! Serialized execution of persistence actions.
//!
//! A [`SchedulerRegistry`] owns one [`ScheduleQueue`] per [`QueueKey`].
//! Actions scheduled on the same key run one at a time, in submission
//! order. The first `schedule()` on an idle queue spawns a Tokio task that
//! drains it; later calls only append.
//!
//! Drains are spawned on the runtime current at the call, or else on the one
//! the registry was built in, so actions may be scheduled from threads
//! outside Tokio (store listeners fire on the committing thread).
//!
//! The map only indexes queues. Each queue has its own lock, held just long
//! enough to push or pop, never across an action.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use futures_util::FutureExt;
use storesync_core::{QueueKey, ScheduleQueue};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{report, ErrorHandler, PersistError};
use crate::lock;

/// A unit of asynchronous work run by the scheduler.
pub type Action = Pin<Box<dyn Future<Output = Result<(), PersistError>> + Send + 'static>>;

struct ScheduledAction {
    action: Action,
    on_error: Option<ErrorHandler>,
}

/// Process-wide set of schedule queues.
///
/// Construct one and share it by `Arc` with every persister that may need
/// to serialize against another.
pub struct SchedulerRegistry {
    queues: DashMap<QueueKey, Mutex<ScheduleQueue<ScheduledAction>>>,
    runtime: Option<Handle>,
}

impl Default for SchedulerRegistry {
    fn default() -> Self {
        Self {
            queues: DashMap::new(),
            runtime: Handle::try_current().ok(),
        }
    }
}

/// Handle for one `schedule()` call.
///
/// Holds the drain task if this call started one.
#[derive(Debug)]
pub struct Scheduled {
    drain: Option<JoinHandle<()>>,
}

impl Scheduled {
    /// Check if this call started the queue's drain loop.
    pub fn started_drain(&self) -> bool {
        self.drain.is_some()
    }

    /// Wait for the drain loop this call started.
    ///
    /// Resolves immediately if the actions joined a drain already running.
    pub async fn finished(self) {
        if let Some(drain) = self.drain {
            if let Err(e) = drain.await {
                tracing::warn!("Queue drain task failed: {}", e);
            }
        }
    }
}

impl SchedulerRegistry {
    /// Create an empty registry, capturing the current Tokio runtime if any.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry that drains on `runtime`.
    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            queues: DashMap::new(),
            runtime: Some(runtime),
        }
    }

    /// Append actions to a queue, starting its drain if idle.
    ///
    /// Errors and panics from an action go to `on_error` and do not stop the
    /// queue. If no runtime is reachable the pending actions are dropped and
    /// a [`PersistError::Scheduling`] goes to `on_error`.
    pub fn schedule(
        self: &Arc<Self>,
        key: &QueueKey,
        actions: Vec<Action>,
        on_error: Option<ErrorHandler>,
    ) -> Scheduled {
        let start = {
            let queue = self.queues.entry(key.clone()).or_default();
            let mut pending = lock(queue.value());
            pending.push(actions.into_iter().map(|action| ScheduledAction {
                action,
                on_error: on_error.clone(),
            }))
        };

        if !start {
            return Scheduled { drain: None };
        }

        let Some(runtime) = Handle::try_current().ok().or_else(|| self.runtime.clone()) else {
            self.abandon(key, on_error.as_ref());
            return Scheduled { drain: None };
        };

        let registry = Arc::clone(self);
        let key = key.clone();
        Scheduled {
            drain: Some(runtime.spawn(async move { registry.drain(key).await })),
        }
    }

    /// Drop every pending action on a queue.
    ///
    /// An action already running is not interrupted. Returns the number of
    /// actions cancelled.
    pub fn clear(&self, key: &QueueKey) -> usize {
        let cancelled = match self.queues.get(key) {
            Some(queue) => {
                let mut pending = lock(queue.value());
                pending.clear()
            }
            None => Vec::new(),
        };
        let count = cancelled.len();
        drop(cancelled);
        if count > 0 {
            tracing::debug!("Cancelled {} pending actions on queue {}", count, key);
        }
        count
    }

    /// Number of actions waiting on a queue.
    pub fn pending(&self, key: &QueueKey) -> usize {
        match self.queues.get(key) {
            Some(queue) => {
                let pending = lock(queue.value());
                pending.len()
            }
            None => 0,
        }
    }

    /// Check if a queue is being drained.
    pub fn is_running(&self, key: &QueueKey) -> bool {
        match self.queues.get(key) {
            Some(queue) => {
                let pending = lock(queue.value());
                pending.is_running()
            }
            None => false,
        }
    }

    fn abandon(&self, key: &QueueKey, on_error: Option<&ErrorHandler>) {
        let dropped = match self.queues.get(key) {
            Some(queue) => {
                let mut pending = lock(queue.value());
                pending.abandon()
            }
            None => Vec::new(),
        };
        let count = dropped.len();
        drop(dropped);
        report(
            on_error,
            &PersistError::Scheduling(format!(
                "no Tokio runtime to drain queue {} ({} actions dropped)",
                key, count
            )),
        );
    }

    async fn drain(self: Arc<Self>, key: QueueKey) {
        tracing::debug!("Draining queue {}", key);
        loop {
            let next = match self.queues.get(&key) {
                Some(queue) => {
                    let mut pending = lock(queue.value());
                    pending.next()
                }
                None => None,
            };
            let Some(ScheduledAction { action, on_error }) = next else {
                break;
            };

            let error = match AssertUnwindSafe(action).catch_unwind().await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(panic) => PersistError::ActionPanicked(panic_message(panic.as_ref())),
            };
            report(on_error.as_ref(), &error);
        }
        tracing::debug!("Queue {} drained", key);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
