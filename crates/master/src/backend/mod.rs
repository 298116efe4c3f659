//! Execution backends.
//!
//! A [`Backend`] receives tasks from the scheduler and runs them somewhere
//! else: a thread pool, child processes, or an external batch system. The
//! master picks one backend at construction time and talks to it only
//! through this trait.

pub mod batch;
pub mod local;
pub mod process;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use taskfarm_core::codec::{read_artifact, write_artifact};
use taskfarm_core::{FarmError, FarmResult, Payload};

use crate::task::TaskHandle;

pub use batch::BatchBackend;
pub use local::LocalBackend;
pub use process::ProcessBackend;

/// Opaque execution-slot identifier handed from [`Backend::reserve_worker`]
/// to [`Backend::execute_task`]. Only the issuing backend interprets it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerToken(Option<usize>);

impl WorkerToken {
    /// Token for backends without persistent worker identity.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn slot(index: usize) -> Self {
        Self(Some(index))
    }

    pub fn slot_index(&self) -> Option<usize> {
        self.0
    }
}

/// Backend-specific health and usage snapshot.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackendStatus {
    pub backend: String,
    pub details: BTreeMap<String, serde_json::Value>,
}

impl BackendStatus {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Contract every execution variant satisfies.
pub trait Backend: Send + Sync {
    /// Human-readable name for logging and status.
    fn name(&self) -> &str;

    /// Reserve an execution slot. May block while the backend is at its
    /// concurrency limit.
    fn reserve_worker(&self) -> FarmResult<WorkerToken>;

    /// Give back a reservation that will not be used.
    fn release_worker(&self, _worker: WorkerToken) {}

    /// Start executing `task` on `worker`.
    ///
    /// Must return without waiting for the task to run to completion, and
    /// must eventually call [`Task::finish`](crate::task::Task::finish)
    /// exactly once, with `Ok(())` after the output artifact is written or
    /// with the error that prevented it.
    fn execute_task(&self, task: TaskHandle, worker: WorkerToken);

    /// Write a serialized blob to a backend-addressable location.
    fn write_blob(&self, payload: &Payload, location: &Path) -> FarmResult<()> {
        write_artifact(payload, location)
    }

    /// Read a serialized blob back from a backend-addressable location.
    fn read_blob(&self, location: &Path) -> FarmResult<Payload> {
        read_artifact(location)
    }

    fn status(&self) -> BackendStatus;

    /// Release backend resources and outstanding jobs. Best effort; never fails.
    fn cleanup(&self);
}

// ── Slot pool ────────────────────────────────────────────────────────

struct Slots {
    free: Vec<usize>,
    closed: bool,
}

/// Fixed number of execution slots shared by reservations and completions.
pub struct SlotPool {
    slots: Mutex<Slots>,
    changed: Condvar,
    capacity: usize,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            slots: Mutex::new(Slots {
                free: (0..capacity).rev().collect(),
                closed: false,
            }),
            changed: Condvar::new(),
            capacity,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a slot is free and take it.
    pub fn acquire(&self) -> FarmResult<usize> {
        let mut slots = self.lock();
        loop {
            if slots.closed {
                return Err(FarmError::interface("backend is shut down"));
            }
            if let Some(slot) = slots.free.pop() {
                return Ok(slot);
            }
            slots = self
                .changed
                .wait(slots)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn release(&self, slot: usize) {
        let mut slots = self.lock();
        if slot < self.capacity && !slots.free.contains(&slot) {
            slots.free.push(slot);
            self.changed.notify_one();
        }
    }

    /// Refuse further reservations and wake anyone blocked in [`acquire`](Self::acquire).
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_all();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.lock().free.len()
    }
}

/// Returns a reserved slot to its pool when dropped, including on unwind.
pub(crate) struct SlotLease {
    pool: Arc<SlotPool>,
    slot: Option<usize>,
}

impl SlotLease {
    pub(crate) fn new(pool: &Arc<SlotPool>, worker: WorkerToken) -> Self {
        Self {
            pool: Arc::clone(pool),
            slot: worker.slot_index(),
        }
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
    }
}
