//! Blocking concurrent queue.
//!
//! Many producers append, one consumer blocks in [`SyncQueue::wait_pop`].
//! Items come out oldest first. The mutex guards the sequence and the
//! condition variable carries the "an item is available" signal, so an
//! appended item is never lost or handed out twice.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub struct SyncQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> SyncQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item and wake one waiter.
    pub fn append(&self, item: T) {
        self.lock().push_back(item);
        self.available.notify_one();
    }

    /// Block until an item is available, then remove and return the oldest one.
    pub fn wait_pop(&self) -> T {
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            items = self
                .available
                .wait(items)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait_pop`](Self::wait_pop), giving up after `timeout`.
    pub fn wait_pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, _) = self
                .available
                .wait_timeout(items, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            items = guard;
        }
    }

    /// Remove the oldest item without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Remove every queued item.
    pub fn drain(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }

    /// Keep only the items for which `keep` returns `true`. Returns how many
    /// were removed.
    pub fn retain(&self, mut keep: impl FnMut(&T) -> bool) -> usize {
        let mut items = self.lock();
        let before = items.len();
        items.retain(|item| keep(item));
        before - items.len()
    }

    /// Current number of queued items. Never blocks on the consumer.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<T: PartialEq> SyncQueue<T> {
    /// Membership check under the queue's lock.
    pub fn contains(&self, item: &T) -> bool {
        self.lock().contains(item)
    }
}

impl<T> Default for SyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
