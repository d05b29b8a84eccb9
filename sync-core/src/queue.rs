//! Schedule queues for storesync.
//!
//! This module provides the bookkeeping behind serialized I/O:
//! - [`QueueKey`] names a queue; persisters sharing a key share a queue
//! - [`ScheduleQueue`] holds a running flag and FIFO pending items
//!
//! The queue never executes anything itself. sync-client drains it: the
//! caller whose `push()` returns `true` owns the drain loop and calls
//! `next()` until it returns `None`, at which point the queue has already
//! been marked idle. Doing both under one lock means an item pushed while a
//! drain is finishing is either picked up by that drain or starts a new one,
//! never lost and never run twice.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PRIVATE_KEY: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyKind {
    Private(u64),
    Shared(Vec<String>),
}

/// Identity of a schedule queue.
///
/// Compared structurally: two `shared` keys built from the same parts name
/// the same queue. Private keys are unique per process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey(KeyKind);

impl QueueKey {
    /// Mint a key no other caller can produce.
    pub fn private() -> Self {
        Self(KeyKind::Private(
            NEXT_PRIVATE_KEY.fetch_add(1, Ordering::Relaxed),
        ))
    }

    /// Build a key from a sequence of parts, for queues shared on purpose.
    pub fn shared<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(KeyKind::Shared(parts.into_iter().map(Into::into).collect()))
    }

    /// Check if this key was built from parts.
    pub fn is_shared(&self) -> bool {
        matches!(self.0, KeyKind::Shared(_))
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            KeyKind::Private(id) => write!(f, "private#{}", id),
            KeyKind::Shared(parts) => write!(f, "[{}]", parts.join(", ")),
        }
    }
}

/// A FIFO of pending items plus a running flag.
#[derive(Debug)]
pub struct ScheduleQueue<T> {
    running: bool,
    pending: VecDeque<T>,
}

impl<T> Default for ScheduleQueue<T> {
    fn default() -> Self {
        Self {
            running: false,
            pending: VecDeque::new(),
        }
    }
}

impl<T> ScheduleQueue<T> {
    /// Create an idle, empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append items in order.
    ///
    /// Returns `true` if the queue was idle and now has work: the caller
    /// must start draining. Returns `false` if a drain is already running
    /// (it will pick the items up) or there is nothing to do.
    pub fn push(&mut self, items: impl IntoIterator<Item = T>) -> bool {
        self.pending.extend(items);
        if self.running || self.pending.is_empty() {
            return false;
        }
        self.running = true;
        true
    }

    /// Take the next item for the drain loop.
    ///
    /// When nothing is left the queue is marked idle and `None` returned.
    pub fn next(&mut self) -> Option<T> {
        let item = self.pending.pop_front();
        if item.is_none() {
            self.running = false;
        }
        item
    }

    /// Remove every pending item without running it.
    ///
    /// The running flag is untouched: an item already taken by the drain
    /// loop finishes normally. The removed items are returned so the caller
    /// can drop them outside any lock.
    pub fn clear(&mut self) -> Vec<T> {
        self.pending.drain(..).collect()
    }

    /// Give up a drain that could not be started.
    ///
    /// Marks the queue idle and returns everything pending, so a failed
    /// start never leaves the queue claimed by a loop that does not exist.
    pub fn abandon(&mut self) -> Vec<T> {
        self.running = false;
        self.pending.drain(..).collect()
    }

    /// Check if a drain loop owns this queue.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Number of items waiting (not including one being executed).
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===========================================
    // QueueKey Tests
    // ===========================================

    #[test]
    fn private_keys_are_unique() {
        let a = QueueKey::private();
        let b = QueueKey::private();
        assert_ne!(a, b);
        assert!(!a.is_shared());
    }

    #[test]
    fn shared_keys_compare_structurally() {
        let a = QueueKey::shared(["storage", "local", "pets"]);
        let b = QueueKey::shared(vec!["storage".to_string(), "local".into(), "pets".into()]);
        let c = QueueKey::shared(["storage", "session", "pets"]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.is_shared());
    }

    #[test]
    fn empty_shared_key_is_a_valid_key() {
        let parts: [&str; 0] = [];
        assert_eq!(QueueKey::shared(parts), QueueKey::shared(Vec::<String>::new()));
    }

    #[test]
    fn key_display() {
        let key = QueueKey::shared(["a", "b"]);
        assert_eq!(key.to_string(), "[a, b]");
        assert!(QueueKey::private().to_string().starts_with("private#"));
    }

    // ===========================================
    // ScheduleQueue Tests
    // ===========================================

    #[test]
    fn first_push_starts_drain() {
        let mut queue = ScheduleQueue::new();
        assert!(queue.push([1]));
        assert!(queue.is_running());
    }

    #[test]
    fn push_while_running_does_not_start_second_drain() {
        let mut queue = ScheduleQueue::new();
        assert!(queue.push([1]));
        assert!(!queue.push([2]));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn abandon_returns_pending_and_goes_idle() {
        let mut queue = ScheduleQueue::new();
        assert!(queue.push([1, 2]));

        assert_eq!(queue.abandon(), vec![1, 2]);
        assert!(!queue.is_running());
        assert!(queue.push([3]));
    }

    #[test]
    fn empty_push_on_idle_queue_does_nothing() {
        let mut queue: ScheduleQueue<u32> = ScheduleQueue::new();
        assert!(!queue.push([]));
        assert!(!queue.is_running());
    }

    #[test]
    fn drains_in_fifo_order() {
        let mut queue = ScheduleQueue::new();
        queue.push([0, 1, 2]);
        queue.push([3]);

        let mut seen = Vec::new();
        while let Some(item) = queue.next() {
            seen.push(item);
        }

        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert!(!queue.is_running());
    }

    #[test]
    fn item_pushed_mid_drain_is_picked_up() {
        let mut queue = ScheduleQueue::new();
        queue.push([0]);

        assert_eq!(queue.next(), Some(0));
        assert!(!queue.push([1]));
        assert_eq!(queue.next(), Some(1));
        assert_eq!(queue.next(), None);
    }

    #[test]
    fn push_after_drain_finished_starts_new_drain() {
        let mut queue = ScheduleQueue::new();
        queue.push([0]);
        queue.next();
        assert_eq!(queue.next(), None);

        assert!(queue.push([1]));
    }

    #[test]
    fn clear_returns_pending_and_keeps_running_flag() {
        let mut queue = ScheduleQueue::new();
        queue.push([0, 1, 2]);
        assert_eq!(queue.next(), Some(0));

        let cleared = queue.clear();

        assert_eq!(cleared, vec![1, 2]);
        assert!(queue.is_empty());
        assert!(queue.is_running());
        assert_eq!(queue.next(), None);
        assert!(!queue.is_running());
    }
}
