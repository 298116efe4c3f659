//! Backend running each task in its own worker child process.
//!
//! The child reads the task's input artifact on stdin and writes its result
//! bundle to stdout, which is redirected straight into the output artifact.
//! Functions run through the `taskfarm-worker` binary; scripts run through
//! the configured interpreter and must honour the same stdin/stdout contract.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use taskfarm_core::codec::remove_artifact;
use taskfarm_core::config::ProcessConfig;
use taskfarm_core::{FarmError, FarmResult};

use super::{Backend, BackendStatus, SlotLease, SlotPool, WorkerToken};
use crate::task::{Executable, Task, TaskHandle};

/// Task name -> pid of the child currently running it.
type RunningChildren = Arc<Mutex<HashMap<String, u32>>>;

/// How long `cleanup` waits after SIGTERM before force killing.
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

pub struct ProcessBackend {
    worker_binary: PathBuf,
    interpreter: PathBuf,
    slots: Arc<SlotPool>,
    running: RunningChildren,
    kill_grace: Duration,
    succeeded: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl ProcessBackend {
    pub fn new(worker_binary: impl Into<PathBuf>, interpreter: impl Into<PathBuf>, slots: usize) -> Self {
        let slots = SlotPool::new(slots);
        let worker_binary = worker_binary.into();
        info!(
            slots = slots.capacity(),
            worker = %worker_binary.display(),
            "process backend ready"
        );
        Self {
            worker_binary,
            interpreter: interpreter.into(),
            slots,
            running: Arc::new(Mutex::new(HashMap::new())),
            kill_grace: DEFAULT_KILL_GRACE,
            succeeded: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn from_config(config: &ProcessConfig) -> Self {
        Self::new(
            config.worker_binary.clone(),
            config.interpreter.clone(),
            config.resolved_slots(),
        )
    }

    /// Override how long running workers get to exit after SIGTERM.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    fn running_pids(&self) -> Vec<(String, u32)> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, pid)| (name.clone(), *pid))
            .collect()
    }

    fn command_for(&self, executable: &Executable) -> Command {
        match executable {
            Executable::Function(name) => {
                let mut cmd = Command::new(&self.worker_binary);
                cmd.arg(name);
                cmd
            }
            Executable::Script(path) => {
                let mut cmd = Command::new(&self.interpreter);
                cmd.arg(path);
                cmd
            }
        }
    }
}

impl Backend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
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
        let command = self.command_for(task.executable());
        let running = Arc::clone(&self.running);
        let succeeded = Arc::clone(&self.succeeded);
        let failed = Arc::clone(&self.failed);
        let thread_task = Arc::clone(&task);

        let spawned = thread::Builder::new()
            .name(format!("taskfarm-proc-{}", task.name()))
            .spawn(move || {
                let task = thread_task;
                let result = run_child(command, &task, &running);
                drop(lease);

                if result.is_ok() {
                    succeeded.fetch_add(1, Ordering::Relaxed);
                } else {
                    failed.fetch_add(1, Ordering::Relaxed);
                }
                task.finish(result);
            });

        if let Err(e) = spawned {
            task.finish(Err(FarmError::interface_with_detail(
                "failed to spawn process supervisor thread",
                e.to_string(),
            )));
        }
    }

    fn status(&self) -> BackendStatus {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner).len();
        BackendStatus::new(self.name())
            .with("slots", self.slots.capacity())
            .with("busy", self.slots.in_use())
            .with("running_processes", running)
            .with("succeeded", self.succeeded.load(Ordering::Relaxed))
            .with("failed", self.failed.load(Ordering::Relaxed))
            .with("worker_binary", self.worker_binary.display().to_string())
    }

    /// SIGTERM every running worker, wait out the grace period, then SIGKILL
    /// whatever is left. Supervisor threads drop a pid once its child is reaped.
    fn cleanup(&self) {
        self.slots.close();

        let pids = self.running_pids();
        if pids.is_empty() {
            return;
        }
        for (name, pid) in &pids {
            signal(name, *pid, "-TERM");
        }

        let deadline = Instant::now() + self.kill_grace;
        loop {
            let remaining = self.running_pids();
            if remaining.is_empty() {
                info!("all worker processes exited");
                return;
            }
            if Instant::now() >= deadline {
                warn!(count = remaining.len(), "worker processes ignored SIGTERM, force killing");
                for (name, pid) in &remaining {
                    signal(name, *pid, "-KILL");
                }
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}

fn signal(task: &str, pid: u32, sig: &str) {
    #[cfg(unix)]
    {
        let _ = Command::new("kill").args([sig, &pid.to_string()]).output();
        info!(task = %task, pid = pid, signal = sig, "signalled worker process");
    }
    #[cfg(not(unix))]
    {
        warn!(task = %task, pid = pid, signal = sig, "cannot signal worker process on this platform");
    }
}

fn run_child(mut command: Command, task: &Task, running: &RunningChildren) -> FarmResult<()> {
    let stdin = File::open(task.input_path())
        .map_err(|e| FarmError::interface_with_detail("failed to open task input", e.to_string()))?;
    let stdout = File::create(task.output_path())
        .map_err(|e| FarmError::interface_with_detail("failed to create task output", e.to_string()))?;

    let program = command.get_program().to_string_lossy().into_owned();
    let child = command
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            remove_artifact(task.output_path());
            if e.kind() == io::ErrorKind::NotFound {
                FarmError::interface(format!("could not find worker program {program}"))
            } else {
                FarmError::interface_with_detail(format!("failed to start {program}"), e.to_string())
            }
        })?;

    let pid = child.id();
    running
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(task.name().to_string(), pid);
    debug!(task = %task, pid = pid, "worker process started");

    let waited = child.wait_with_output();
    running
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(task.name());

    let output = waited.map_err(|e| {
        FarmError::interface_with_detail("failed to wait for worker process", e.to_string())
    })?;

    if output.status.success() {
        return Ok(());
    }

    remove_artifact(task.output_path());
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    warn!(task = %task, status = %output.status, "worker process failed");
    Err(FarmError::task(format!(
        "worker exited with {}: {stderr}",
        output.status
    )))
}
