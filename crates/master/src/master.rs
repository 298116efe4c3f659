//! The user-facing master.
//!
//! A [`Master`] owns one backend, one scheduler thread and the registry of
//! every task submitted through it. Callers submit work from any number of
//! threads and collect results either per task or as "whichever finishes
//! next".

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use taskfarm_core::config::{BackendKind, FarmConfig};
use taskfarm_core::{FarmError, FarmResult, FunctionRegistry, Payload, TaskOutput};

use crate::backend::{Backend, BatchBackend, LocalBackend, ProcessBackend};
use crate::queue::SyncQueue;
use crate::scheduler::Scheduler;
use crate::state::StateStore;
use crate::status::{DurationStats, MasterStatus, TaskCounts};
use crate::task::{Executable, FinishObserver, Task, TaskHandle, Wait};

/// How often a blocked "next finished" retrieval re-checks whether anything
/// is still left to collect.
const NEXT_FINISHED_RECHECK: Duration = Duration::from_millis(100);

/// A task handed back by [`Master::get_result`] with its output.
pub type Collected = (TaskHandle, TaskOutput);

// ── Ledger ───────────────────────────────────────────────────────────

/// Per-master bookkeeping shared with every task's completion path.
struct Ledger {
    /// Submitted tasks by name, in submission order.
    tasks: RwLock<IndexMap<String, TaskHandle>>,
    /// Tasks in the order they finished; fed by [`FinishObserver`].
    finished: SyncQueue<TaskHandle>,
    store: Option<StateStore>,
}

impl Ledger {
    fn read(&self) -> RwLockReadGuard<'_, IndexMap<String, TaskHandle>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexMap<String, TaskHandle>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `task` is this exact handle in the registry.
    fn owns(&self, task: &TaskHandle) -> bool {
        self.read()
            .get(task.name())
            .is_some_and(|known| Arc::ptr_eq(known, task))
    }

    fn all_collected(&self) -> bool {
        self.read().values().all(|task| task.is_collected())
    }

    /// Drop every trace of `task`: registry entry, finished-queue entry,
    /// artifacts and stored record. `false` if `task` is not registered.
    fn forget(&self, task: &TaskHandle) -> bool {
        {
            let mut tasks = self.write();
            match tasks.get(task.name()) {
                Some(known) if Arc::ptr_eq(known, task) => {
                    tasks.shift_remove(task.name());
                }
                _ => return false,
            }
        }

        self.finished.retain(|queued| !Arc::ptr_eq(queued, task));
        task.cleanup();
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(task.name()) {
                warn!(task = %task, error = %e, "failed to drop task record");
            }
        }
        true
    }

    fn persist(&self, task: &Task) {
        if let Some(store) = &self.store {
            if let Err(e) = store.put(task.record()) {
                warn!(task = %task, error = %e, "failed to persist task record");
            }
        }
    }
}

impl FinishObserver for Ledger {
    fn task_finished(&self, task: &TaskHandle) {
        self.persist(task);
        self.finished.append(Arc::clone(task));
    }
}

// ── Master ───────────────────────────────────────────────────────────

pub struct Master {
    config: FarmConfig,
    backend: Arc<dyn Backend>,
    scheduler: Scheduler,
    ledger: Arc<Ledger>,
    /// Next suffix for auto-generated task names.
    counter: AtomicU64,
    /// Tasks ever accepted, including released ones.
    submitted: AtomicU64,
    shut_down: AtomicBool,
}

impl Master {
    /// Start a master driving `backend`.
    pub fn new(config: FarmConfig, backend: Arc<dyn Backend>) -> FarmResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.task_dir).map_err(|e| {
            FarmError::Io(format!(
                "failed to create task directory {}: {e}",
                config.task_dir.display()
            ))
        })?;

        let store = config
            .use_state_records
            .then(|| StateStore::open(&config.state_path));
        let scheduler = Scheduler::start(Arc::clone(&backend))?;

        config.log_summary();
        info!(
            backend = backend.name(),
            task_dir = %config.task_dir.display(),
            state_records = config.use_state_records,
            fail_fast = config.fail_fast,
            "master started"
        );

        Ok(Self {
            backend,
            scheduler,
            ledger: Arc::new(Ledger {
                tasks: RwLock::new(IndexMap::new()),
                finished: SyncQueue::new(),
                store,
            }),
            counter: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            config,
        })
    }

    /// Start a master with the backend `config.backend` names.
    ///
    /// `registry` serves the local backend; out-of-process backends resolve
    /// functions inside their worker executable instead.
    pub fn from_config(config: FarmConfig, registry: Arc<FunctionRegistry>) -> FarmResult<Self> {
        let backend: Arc<dyn Backend> = match config.backend {
            BackendKind::Local => Arc::new(LocalBackend::from_config(&config.local, registry)?),
            BackendKind::Process => Arc::new(ProcessBackend::from_config(&config.process)),
            BackendKind::Batch => Arc::new(BatchBackend::new(&config.batch)?),
        };
        Self::new(config, backend)
    }

    pub fn config(&self) -> &FarmConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Look a submitted task up by name.
    pub fn task(&self, name: &str) -> Option<TaskHandle> {
        self.ledger.read().get(name).cloned()
    }

    /// Every task in the registry, in submission order.
    pub fn tasks(&self) -> Vec<TaskHandle> {
        self.ledger.read().values().cloned().collect()
    }

    // ── Submission ───────────────────────────────────────────────────

    /// Submit `executable` with `input`.
    ///
    /// Without a `name` one is derived as `<executable>_<counter>`. With
    /// state records enabled, a name already known to this master returns
    /// the existing task, and a name that finished successfully in an
    /// earlier run is restored from its record instead of running again.
    pub fn submit_task<T>(
        &self,
        executable: Executable,
        input: &T,
        name: Option<&str>,
    ) -> FarmResult<TaskHandle>
    where
        T: Serialize + ?Sized,
    {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(FarmError::validation("master is shut down"));
        }
        let payload = Payload::encode(input)?;

        let mut tasks = self.ledger.write();
        let name = match name {
            Some(name) => {
                validate_name(name)?;
                name.to_string()
            }
            None => self.next_name(&executable, &tasks),
        };

        if let Some(existing) = tasks.get(&name) {
            if self.config.use_state_records {
                debug!(task = %name, "returning already submitted task");
                return Ok(Arc::clone(existing));
            }
            return Err(FarmError::validation(format!(
                "a task named '{name}' has already been submitted"
            )));
        }

        if let Some(restored) = self.restore(&name, &executable) {
            tasks.insert(name, Arc::clone(&restored));
            drop(tasks);
            self.submitted.fetch_add(1, Ordering::Relaxed);
            self.ledger.finished.append(Arc::clone(&restored));
            info!(task = %restored, "reusing result from an earlier run");
            return Ok(restored);
        }

        let ledger: Weak<Ledger> = Arc::downgrade(&self.ledger);
        let observer: Weak<dyn FinishObserver> = ledger;
        let task = Task::new(name.clone(), executable, &self.config.task_dir, Some(observer));
        tasks.insert(name, Arc::clone(&task));
        drop(tasks);

        // The name is claimed; the input is written without holding the registry.
        if let Err(e) = self.backend.write_blob(&payload, task.input_path()) {
            warn!(task = %task, error = %e, "failed to write task input");
            task.finish(Err(e.clone()));
            self.ledger.forget(&task);
            return Err(e);
        }

        self.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(task = %task, executable = %task.executable(), bytes = payload.len(), "task submitted");
        self.scheduler.enqueue(Arc::clone(&task));
        Ok(task)
    }

    fn next_name(&self, executable: &Executable, tasks: &IndexMap<String, TaskHandle>) -> String {
        let identity = executable.identity();
        loop {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            let name = format!("{identity}_{n}");
            if !tasks.contains_key(&name) {
                return name;
            }
        }
    }

    fn restore(&self, name: &str, executable: &Executable) -> Option<TaskHandle> {
        let store = self.ledger.store.as_ref()?;
        let record = store.get(name)?;
        if &record.executable != executable {
            debug!(task = %name, "stored record is for a different executable");
            return None;
        }
        Task::restore(&record)
    }

    // ── Retrieval ────────────────────────────────────────────────────

    /// Collect a finished task's output.
    ///
    /// With `Some(task)`, that task is checked (waiting as `wait` allows).
    /// With `None`, the next finished task not yet collected is returned;
    /// each task is handed out that way at most once. `Ok(None)` means
    /// nothing finished within the waiting policy.
    ///
    /// A task that failed returns its error. With `fail_fast` on, the
    /// scheduler then stops dispatching.
    pub fn get_result(
        &self,
        task: Option<&TaskHandle>,
        wait: impl Into<Wait>,
    ) -> FarmResult<Option<Collected>> {
        if self.submitted.load(Ordering::Relaxed) == 0 {
            return Err(FarmError::validation("no tasks have been submitted"));
        }
        let wait = wait.into();

        match task {
            Some(task) => {
                if !self.ledger.owns(task) {
                    return Err(FarmError::validation(format!(
                        "task '{}' was not submitted to this master",
                        task.name()
                    )));
                }
                match task.wait(wait) {
                    Some(outcome) => {
                        task.mark_collected();
                        self.ledger.finished.retain(|queued| !Arc::ptr_eq(queued, task));
                        self.deliver(task, outcome).map(Some)
                    }
                    None => Ok(None),
                }
            }
            None => self.next_finished(wait),
        }
    }

    fn next_finished(&self, wait: Wait) -> FarmResult<Option<Collected>> {
        let deadline = match wait {
            Wait::Timeout(limit) => Some(Instant::now() + limit),
            _ => None,
        };

        loop {
            if self.ledger.all_collected() {
                return Err(FarmError::validation(
                    "every submitted task has already been collected",
                ));
            }

            let next = match wait {
                Wait::Poll => self.ledger.finished.try_pop(),
                Wait::Block => self.ledger.finished.wait_pop_timeout(NEXT_FINISHED_RECHECK),
                Wait::Timeout(_) => {
                    let remaining = deadline
                        .and_then(|d| d.checked_duration_since(Instant::now()))
                        .unwrap_or_default();
                    self.ledger
                        .finished
                        .wait_pop_timeout(remaining.min(NEXT_FINISHED_RECHECK))
                }
            };

            let Some(task) = next else {
                let expired = match wait {
                    Wait::Poll => true,
                    Wait::Block => false,
                    Wait::Timeout(_) => deadline.is_some_and(|d| Instant::now() >= d),
                };
                if expired {
                    return Ok(None);
                }
                continue;
            };

            // Released or already collected by name.
            if !self.ledger.owns(&task) || !task.mark_collected() {
                continue;
            }
            // Queued by the observer just before the completion fires.
            let outcome = task.completion_outcome();
            return self.deliver(&task, outcome).map(Some);
        }
    }

    fn deliver(
        &self,
        task: &TaskHandle,
        outcome: Result<TaskOutput, FarmError>,
    ) -> FarmResult<Collected> {
        match outcome {
            Ok(output) => Ok((Arc::clone(task), output)),
            Err(e) => {
                if self.config.fail_fast && !self.scheduler.is_stop_requested() {
                    warn!(task = %task, error = %e, "task failed, stopping scheduler");
                    self.scheduler.stop();
                }
                Err(e)
            }
        }
    }

    /// Forget a finished task and delete its artifacts and record.
    pub fn release_task(&self, task: &TaskHandle) -> FarmResult<()> {
        if !task.is_finished() {
            return Err(FarmError::validation(format!(
                "task '{}' has not finished",
                task.name()
            )));
        }
        if !self.ledger.forget(task) {
            return Err(FarmError::validation(format!(
                "task '{}' was not submitted to this master",
                task.name()
            )));
        }
        debug!(task = %task, "task released");
        Ok(())
    }

    // ── Status ───────────────────────────────────────────────────────

    pub fn status(&self) -> MasterStatus {
        let mut tasks = TaskCounts::default();
        let mut total_time = DurationStats::default();
        let mut execution_time = DurationStats::default();

        for task in self.ledger.read().values() {
            tasks.record(task.state());
            if let Some(d) = task.total_time() {
                total_time.record(d);
            }
            if let Some(d) = task.execution_time() {
                execution_time.record(d);
            }
        }

        MasterStatus {
            backend: self.backend.status(),
            tasks,
            total_time,
            execution_time,
            scheduler_running: self.scheduler.is_running(),
            dispatched: self.scheduler.dispatched(),
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Stop the master. Safe to call more than once; also run on drop.
    ///
    /// Task artifacts are removed unless state records are kept, in which
    /// case a later run may reuse them.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(backend = self.backend.name(), "master shutting down");

        self.backend.cleanup();
        self.scheduler.stop();
        self.scheduler.join();

        if self.config.use_state_records {
            debug!("keeping task artifacts for state records");
        } else {
            for task in self.ledger.read().values() {
                task.cleanup();
            }
        }

        remove_dir_if_empty(&self.config.task_dir);
        info!("master shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn validate_name(name: &str) -> FarmResult<()> {
    if name.is_empty() {
        return Err(FarmError::validation("task name must not be empty"));
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(FarmError::validation(format!(
            "task name '{name}' must not contain path separators"
        )));
    }
    Ok(())
}

fn remove_dir_if_empty(dir: &Path) {
    match fs::remove_dir(dir) {
        Ok(()) => debug!(dir = %dir.display(), "removed task directory"),
        Err(e) => debug!(dir = %dir.display(), error = %e, "task directory kept"),
    }
}

#[cfg(test)]
mod tests {
    use taskfarm_core::builtins::{self, builtin_registry};

    use super::*;
    use crate::task::TaskState;

    fn config(dir: &Path) -> FarmConfig {
        FarmConfig {
            task_dir: dir.join("tasks"),
            state_path: dir.join("state.json"),
            local: taskfarm_core::LocalConfig { slots: 2 },
            ..FarmConfig::default()
        }
    }

    fn master(dir: &Path) -> Master {
        Master::from_config(config(dir), builtin_registry()).unwrap()
    }

    #[test]
    fn auto_names_use_executable_and_counter() {
        let dir = tempfile::tempdir().unwrap();
        let master = master(dir.path());
        let sum = Executable::function(builtins::SUM);

        let a = master.submit_task(sum.clone(), &vec![1i64], None).unwrap();
        let b = master.submit_task(sum, &vec![2i64], None).unwrap();
        assert_eq!(a.name(), "sum_0");
        assert_eq!(b.name(), "sum_1");
        assert!(a.input_path().starts_with(dir.path().join("tasks")));
    }

    #[test]
    fn duplicate_explicit_name_is_rejected_without_state_records() {
        let dir = tempfile::tempdir().unwrap();
        let master = master(dir.path());
        let sum = Executable::function(builtins::SUM);

        master.submit_task(sum.clone(), &vec![1i64], Some("job")).unwrap();
        let err = master.submit_task(sum.clone(), &vec![1i64], Some("job")).unwrap_err();
        assert!(err.is_validation_error());

        let bad = master.submit_task(sum, &vec![1i64], Some("../escape")).unwrap_err();
        assert!(bad.is_validation_error());
    }

    #[test]
    fn get_result_before_any_submission_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let master = master(dir.path());
        assert!(master.get_result(None, true).unwrap_err().is_validation_error());
    }

    #[test]
    fn foreign_task_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let master = master(dir.path());
        master
            .submit_task(Executable::function(builtins::SUM), &vec![1i64], None)
            .unwrap();

        let stranger = Task::new("sum_0", Executable::function("sum"), dir.path(), None);
        let err = master.get_result(Some(&stranger), false).unwrap_err();
        assert!(err.is_validation_error());
    }

    #[test]
    fn task_error_stops_scheduler_when_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let master = master(dir.path());
        let task = master
            .submit_task(Executable::function(builtins::FAIL), "broken", None)
            .unwrap();

        let err = master.get_result(Some(&task), Wait::Block).unwrap_err();
        assert!(err.is_task_error());
        assert!(err.to_string().contains("broken"));
        assert!(master.scheduler.is_stop_requested());

        // Nothing else gets dispatched.
        let later = master
            .submit_task(Executable::function(builtins::SUM), &vec![1i64], None)
            .unwrap();
        let err = master.get_result(Some(&later), Wait::Block).unwrap_err();
        assert_eq!(err, FarmError::interface("scheduler stopped before dispatch"));
    }

    #[test]
    fn task_error_keeps_scheduler_running_without_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let config = FarmConfig {
            fail_fast: false,
            ..config(dir.path())
        };
        let master = Master::from_config(config, builtin_registry()).unwrap();

        let failing = master
            .submit_task(Executable::function(builtins::FAIL), "once", None)
            .unwrap();
        assert!(master.get_result(Some(&failing), true).is_err());

        let ok = master
            .submit_task(Executable::function(builtins::SUM), &vec![4i64, 5], None)
            .unwrap();
        let (_, output) = master.get_result(Some(&ok), true).unwrap().unwrap();
        assert_eq!(output.decode::<i64>().unwrap(), 9);
    }

    #[test]
    fn release_removes_task_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let master = master(dir.path());
        let task = master
            .submit_task(Executable::function(builtins::SUM), &vec![1i64, 1], None)
            .unwrap();

        let running_release = master.release_task(&task);
        if task.is_finished() {
            assert!(running_release.is_ok());
        } else {
            assert!(running_release.unwrap_err().is_validation_error());
            master.get_result(Some(&task), true).unwrap();
            master.release_task(&task).unwrap();
        }

        assert!(master.task(task.name()).is_none());
        assert!(!task.input_path().exists());
        assert!(!task.output_path().exists());
        assert!(master.release_task(&task).unwrap_err().is_validation_error());
    }

    #[test]
    fn collected_and_released_tasks_leave_finished_queue() {
        let dir = tempfile::tempdir().unwrap();
        let master = master(dir.path());
        let sum = Executable::function(builtins::SUM);

        for i in 0..20i64 {
            let task = master.submit_task(sum.clone(), &vec![i], None).unwrap();
            master.get_result(Some(&task), true).unwrap();
            assert!(master.ledger.finished.is_empty());
            master.release_task(&task).unwrap();
        }

        assert!(master.tasks().is_empty());
        assert!(master.ledger.finished.is_empty());
    }

    #[test]
    fn failed_input_write_releases_the_name() {
        let dir = tempfile::tempdir().unwrap();
        let master = master(dir.path());
        fs::remove_dir_all(dir.path().join("tasks")).unwrap();

        let err = master
            .submit_task(Executable::function(builtins::SUM), &vec![1i64], Some("job"))
            .unwrap_err();
        assert!(matches!(err, FarmError::Io(_)));
        assert!(master.task("job").is_none());
        assert!(master.ledger.finished.is_empty());

        fs::create_dir_all(dir.path().join("tasks")).unwrap();
        let task = master
            .submit_task(Executable::function(builtins::SUM), &vec![1i64, 2], Some("job"))
            .unwrap();
        let (_, output) = master.get_result(Some(&task), true).unwrap().unwrap();
        assert_eq!(output.decode::<i64>().unwrap(), 3);
    }

    #[test]
    fn status_counts_tasks_by_state() {
        let dir = tempfile::tempdir().unwrap();
        let master = master(dir.path());
        for values in [vec![1i64], vec![2, 3]] {
            let task = master
                .submit_task(Executable::function(builtins::SUM), &values, None)
                .unwrap();
            master.get_result(Some(&task), true).unwrap();
        }

        let status = master.status();
        assert_eq!(status.tasks.succeeded, 2);
        assert_eq!(status.tasks.total(), 2);
        assert_eq!(status.total_time.count, 2);
        assert_eq!(status.backend.backend, "local");
        assert!(status.scheduler_running);
        assert_eq!(status.dispatched, 2);
    }

    #[test]
    fn shutdown_cleans_artifacts_and_rejects_submissions() {
        let dir = tempfile::tempdir().unwrap();
        let master = master(dir.path());
        let task = master
            .submit_task(Executable::function(builtins::SUM), &vec![1i64], None)
            .unwrap();
        master.get_result(Some(&task), true).unwrap();
        assert_eq!(task.state(), TaskState::Succeeded);

        master.shutdown();
        master.shutdown();

        assert!(!task.input_path().exists());
        assert!(!dir.path().join("tasks").exists());
        assert!(!master.scheduler.is_running());
        let err = master
            .submit_task(Executable::function(builtins::SUM), &vec![1i64], None)
            .unwrap_err();
        assert!(err.is_validation_error());
    }
}
