use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use taskfarm_core::{FarmError, FarmResult};

use crate::backend::Backend;
use crate::queue::SyncQueue;
use crate::task::TaskHandle;

use super::execution;

/// An entry in the dispatch queue.
#[derive(Debug)]
pub enum Dispatch {
    /// Reserve a worker for this task and hand it to the backend.
    Run(TaskHandle),
    /// Sentinel: the loop exits when it pops this.
    Stop,
}

/// Pulls queued tasks in FIFO order and hands each one to the backend.
///
/// Runs on one dedicated thread. Tasks still queued when the loop exits are
/// finished with an error so no waiter is left hanging.
pub struct Scheduler {
    pub(super) queue: Arc<SyncQueue<Dispatch>>,
    /// Cleared by the loop thread right before it drains the queue.
    pub(super) running: Arc<AtomicBool>,
    pub(super) stop_requested: Arc<AtomicBool>,
    /// Tasks handed to the backend so far.
    pub(super) dispatched: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the dispatch loop for `backend`.
    pub fn start(backend: Arc<dyn Backend>) -> FarmResult<Self> {
        let queue = Arc::new(SyncQueue::new());
        let running = Arc::new(AtomicBool::new(true));
        let stop_requested = Arc::new(AtomicBool::new(false));
        let dispatched = Arc::new(AtomicU64::new(0));

        let handle = {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            let stop_requested = Arc::clone(&stop_requested);
            let dispatched = Arc::clone(&dispatched);
            thread::Builder::new()
                .name("taskfarm-scheduler".into())
                .spawn(move || {
                    execution::run_loop(&queue, &backend, &running, &stop_requested, &dispatched)
                })
                .map_err(|e| {
                    FarmError::interface_with_detail("failed to start scheduler thread", e.to_string())
                })?
        };

        Ok(Self {
            queue,
            running,
            stop_requested,
            dispatched,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue `task` for dispatch. The task moves to `Queued`.
    ///
    /// A task enqueued after a stop request is failed right away.
    pub fn enqueue(&self, task: TaskHandle) {
        task.mark_queued();
        debug!(task = %task, "task queued");
        self.queue.append(Dispatch::Run(task));

        if self.is_stop_requested() || !self.running.load(Ordering::SeqCst) {
            execution::fail_pending(&self.queue);
        }
    }

    /// Stop dispatching. Tasks still waiting in the queue are failed now;
    /// a task already handed to the backend keeps running.
    pub fn stop(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let failed = execution::fail_pending(&self.queue);
        info!(failed = failed, "scheduler stop requested");
        self.queue.append(Dispatch::Stop);
    }

    /// Wait for the loop thread to exit. A no-op after the first call.
    pub fn join(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("scheduler thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Entries waiting in the dispatch queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}
