//! One-shot completion signal.
//!
//! The first [`Completion::complete`] wins and stores the value; every waiter,
//! current or future, gets a clone of that same value.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub struct Completion<T> {
    value: Mutex<Option<T>>,
    fired: Condvar,
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            fired: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fire the signal. Returns `false` (and drops `value`) if it already fired.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.fired.notify_all();
        true
    }

    pub fn is_complete(&self) -> bool {
        self.lock().is_some()
    }

    /// The stored value, if the signal has fired. Never blocks on the signal.
    pub fn try_get(&self) -> Option<T> {
        self.lock().clone()
    }

    /// Block until the signal fires.
    pub fn wait(&self) -> T {
        let mut slot = self.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            slot = self.fired.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the signal fires or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return Some(value.clone());
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, _) = self
                .fired
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn first_completion_wins() {
        let done = Completion::new();
        assert!(!done.is_complete());
        assert!(done.complete(Ok::<u32, String>(1)));
        assert!(!done.complete(Err("late".to_string())));
        assert_eq!(done.try_get(), Some(Ok(1)));
        assert_eq!(done.wait(), Ok(1));
    }

    #[test]
    fn every_waiter_sees_the_same_value() {
        let done = Arc::new(Completion::new());
        let waiters: Vec<_> = (0..6)
            .map(|_| {
                let done = Arc::clone(&done);
                thread::spawn(move || done.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        done.complete(Err::<u32, String>("boom".to_string()));

        for w in waiters {
            assert_eq!(w.join().unwrap(), Err("boom".to_string()));
        }
        // Later waiters observe it too.
        assert_eq!(done.wait(), Err("boom".to_string()));
    }

    #[test]
    fn wait_timeout_returns_none_when_unfired() {
        let done: Completion<u8> = Completion::new();
        assert_eq!(done.wait_timeout(Duration::from_millis(15)), None);
        assert_eq!(done.try_get(), None);
    }
}
