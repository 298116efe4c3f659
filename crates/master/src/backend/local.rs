//! In-process backend running registered functions on a rayon thread pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use taskfarm_core::codec::{read_artifact, write_artifact};
use taskfarm_core::config::LocalConfig;
use taskfarm_core::worker::execute;
use taskfarm_core::{FarmError, FarmResult, FunctionRegistry};

use super::{Backend, BackendStatus, SlotLease, SlotPool, WorkerToken};
use crate::task::{Executable, Task, TaskHandle};

pub struct LocalBackend {
    registry: Arc<FunctionRegistry>,
    pool: rayon::ThreadPool,
    slots: Arc<SlotPool>,
    succeeded: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl LocalBackend {
    /// Create a backend with `slots` concurrent tasks.
    pub fn new(registry: Arc<FunctionRegistry>, slots: usize) -> FarmResult<Self> {
        let slots = SlotPool::new(slots);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(slots.capacity())
            .thread_name(|i| format!("taskfarm-local-{i}"))
            .build()
            .map_err(|e| {
                FarmError::interface_with_detail("failed to build local thread pool", e.to_string())
            })?;

        info!(slots = slots.capacity(), "local backend ready");
        Ok(Self {
            registry,
            pool,
            slots,
            succeeded: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn from_config(config: &LocalConfig, registry: Arc<FunctionRegistry>) -> FarmResult<Self> {
        Self::new(registry, config.resolved_slots())
    }
}

impl Backend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn reserve_worker(&self) -> FarmResult<WorkerToken> {
        self.slots.acquire().map(WorkerToken::slot)
    }

    fn release_worker(&self, worker: WorkerToken) {
        if let Some(slot) = worker.slot_index() {
            self.slots.release(slot);
        }
    }

    fn execute_task(&self, task: TaskHandle, worker: WorkerToken) {
        let lease = SlotLease::new(&self.slots, worker);
        let registry = Arc::clone(&self.registry);
        let succeeded = Arc::clone(&self.succeeded);
        let failed = Arc::clone(&self.failed);

        self.pool.spawn(move || {
            debug!(task = %task, slot = ?worker.slot_index(), "running task locally");
            let result = run_in_process(&registry, &task);
            drop(lease);

            if result.is_ok() {
                succeeded.fetch_add(1, Ordering::Relaxed);
            } else {
                failed.fetch_add(1, Ordering::Relaxed);
            }
            task.finish(result);
        });
    }

    fn status(&self) -> BackendStatus {
        BackendStatus::new(self.name())
            .with("slots", self.slots.capacity())
            .with("busy", self.slots.in_use())
            .with("succeeded", self.succeeded.load(Ordering::Relaxed))
            .with("failed", self.failed.load(Ordering::Relaxed))
            .with("functions", self.registry.names())
    }

    fn cleanup(&self) {
        self.slots.close();
    }
}

fn run_in_process(registry: &FunctionRegistry, task: &Task) -> FarmResult<()> {
    let function = match task.executable() {
        Executable::Function(name) => name,
        Executable::Script(path) => {
            return Err(FarmError::interface(format!(
                "local backend cannot run script {}",
                path.display()
            )))
        }
    };

    let input = read_artifact(task.input_path())
        .map_err(|e| FarmError::interface_with_detail("failed to read task input", e.to_string()))?;
    let bundle = execute(registry, function, &input)?;
    write_artifact(&bundle.to_payload()?, task.output_path())
        .map_err(|e| FarmError::interface_with_detail("failed to write task output", e.to_string()))
}
