use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info, warn};

use taskfarm_core::worker::panic_message;
use taskfarm_core::FarmError;

use crate::backend::Backend;
use crate::queue::SyncQueue;
use crate::task::TaskHandle;

use super::Dispatch;

/// Run the dispatch loop until the stop sentinel is popped.
pub(super) fn run_loop(
    queue: &SyncQueue<Dispatch>,
    backend: &Arc<dyn Backend>,
    running: &AtomicBool,
    stop_requested: &AtomicBool,
    dispatched: &AtomicU64,
) {
    info!(backend = backend.name(), "scheduler started");

    loop {
        match queue.wait_pop() {
            Dispatch::Run(task) if stop_requested.load(Ordering::SeqCst) => {
                abandon(&task);
            }
            Dispatch::Run(task) => dispatch(backend, task, stop_requested, dispatched),
            Dispatch::Stop => break,
        }
    }

    running.store(false, Ordering::SeqCst);
    let failed = fail_pending(queue);
    info!(
        dispatched = dispatched.load(Ordering::Relaxed),
        abandoned = failed,
        "scheduler stopped"
    );
}

/// Reserve a worker for `task` and hand it to the backend on its own thread.
fn dispatch(
    backend: &Arc<dyn Backend>,
    task: TaskHandle,
    stop_requested: &AtomicBool,
    dispatched: &AtomicU64,
) {
    if task.is_finished() {
        debug!(task = %task, "skipping task that already finished");
        return;
    }

    let worker = match backend.reserve_worker() {
        Ok(worker) => worker,
        Err(e) => {
            warn!(task = %task, error = %e, "worker reservation failed");
            task.finish(Err(e));
            return;
        }
    };
    // Reservation may block; a stop can arrive while it does.
    if stop_requested.load(Ordering::SeqCst) {
        backend.release_worker(worker);
        abandon(&task);
        return;
    }
    task.mark_executing();
    dispatched.fetch_add(1, Ordering::Relaxed);
    debug!(task = %task, slot = ?worker.slot_index(), "dispatching task");

    let backend = Arc::clone(backend);
    let handoff = Arc::clone(&task);
    let spawned = thread::Builder::new()
        .name(format!("taskfarm-dispatch-{}", task.name()))
        .spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                backend.execute_task(Arc::clone(&handoff), worker)
            }));
            if let Err(panic) = outcome {
                let message = panic_message(panic.as_ref());
                error!(task = %handoff, panic = %message, "backend panicked in execute_task");
                handoff.finish(Err(FarmError::interface(format!(
                    "backend panicked while executing task: {message}"
                ))));
            }
        });

    if let Err(e) = spawned {
        task.finish(Err(FarmError::interface_with_detail(
            "failed to start dispatch thread",
            e.to_string(),
        )));
    }
}

fn abandon(task: &TaskHandle) -> bool {
    task.finish(Err(FarmError::interface("scheduler stopped before dispatch")))
}

/// Fail every task still waiting in `queue`. Returns how many were failed.
///
/// A `Stop` sentinel already in the queue is kept so the loop still exits.
pub(super) fn fail_pending(queue: &SyncQueue<Dispatch>) -> usize {
    let mut failed = 0;
    let mut stop_seen = false;
    for entry in queue.drain() {
        match entry {
            Dispatch::Run(task) => {
                if abandon(&task) {
                    failed += 1;
                }
            }
            Dispatch::Stop => stop_seen = true,
        }
    }
    if stop_seen {
        queue.append(Dispatch::Stop);
    }
    failed
}
