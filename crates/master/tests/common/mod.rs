//! Shared fixtures for master integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use taskfarm_core::{builtin_registry, FarmConfig, FarmError, FarmResult, LocalConfig};
use taskfarm_master::{Backend, BackendStatus, LocalBackend, TaskHandle, WorkerToken};

pub fn config(dir: &Path, slots: usize) -> FarmConfig {
    FarmConfig {
        task_dir: dir.join("tasks"),
        state_path: dir.join("taskfarm_state.json"),
        local: LocalConfig { slots },
        ..FarmConfig::default()
    }
}

/// Backend whose reservations always fail.
pub struct RefusingBackend;

impl Backend for RefusingBackend {
    fn name(&self) -> &str {
        "refusing"
    }

    fn reserve_worker(&self) -> FarmResult<WorkerToken> {
        Err(FarmError::interface("no worker can be reserved"))
    }

    fn execute_task(&self, task: TaskHandle, _worker: WorkerToken) {
        task.finish(Err(FarmError::interface("execute_task must not be reached")));
    }

    fn status(&self) -> BackendStatus {
        BackendStatus::new(self.name())
    }

    fn cleanup(&self) {}
}

/// Local backend that counts the tasks it is asked to execute.
pub struct CountingBackend {
    inner: LocalBackend,
    executed: AtomicUsize,
}

impl CountingBackend {
    pub fn new(slots: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalBackend::new(builtin_registry(), slots).unwrap(),
            executed: AtomicUsize::new(0),
        })
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }
}

impl Backend for CountingBackend {
    fn name(&self) -> &str {
        "counting"
    }

    fn reserve_worker(&self) -> FarmResult<WorkerToken> {
        self.inner.reserve_worker()
    }

    fn release_worker(&self, worker: WorkerToken) {
        self.inner.release_worker(worker);
    }

    fn execute_task(&self, task: TaskHandle, worker: WorkerToken) {
        self.executed.fetch_add(1, Ordering::SeqCst);
        self.inner.execute_task(task, worker);
    }

    fn status(&self) -> BackendStatus {
        self.inner.status()
    }

    fn cleanup(&self) {
        self.inner.cleanup();
    }
}

#[cfg(unix)]
pub fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}
