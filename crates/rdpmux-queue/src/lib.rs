//! A mutex+condvar FIFO queue of owned records.
//!
//! This is the "outgoing message queue" the display pipeline hands
//! serialized updates through on their way to the transport. Enqueue never
//! blocks and never fails: the queue is unbounded. Dequeue blocks until an
//! item is available.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// FIFO queue of `T`, guarded by a mutex with a condvar signalling non-empty.
pub struct MessageQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    /// Push `item` onto the tail of the queue and wake one waiting dequeuer.
    pub fn enqueue(&self, item: T) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Block until the queue is non-empty, then pop and return the head.
    pub fn dequeue(&self) -> T {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            items = self
                .not_empty
                .wait(items)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block until the queue is non-empty or `timeout` elapses, then pop the
    /// head if one became available. Used by threads that must also observe
    /// a stop flag between waits.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(item) = items.pop_front() {
            return Some(item);
        }
        let (mut items, _timed_out) = self
            .not_empty
            .wait_timeout(items, timeout)
            .unwrap_or_else(|e| e.into_inner());
        items.pop_front()
    }

    /// Pop the head without blocking; `None` if the queue is empty.
    pub fn try_dequeue(&self) -> Option<T> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Whether the queue currently holds no items.
    #[must_use]
    pub fn try_is_empty(&self) -> bool {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    /// Number of items currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every queued item. Used on display-switch and on teardown, so
    /// that no update referring to a stale geometry (or a dead session)
    /// reaches the transport.
    pub fn clear(&self) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let dropped = items.len();
        items.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "Cleared outgoing message queue");
        }
    }
}
