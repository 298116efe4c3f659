//! Task lifecycle.
//!
//! ```text
//! Created ──▶ Queued ──▶ Executing ──▶ Succeeded | Failed
//!               └────────────────────────────▲  (reservation / dispatch failure)
//! ```
//!
//! A task leaves `Executing` only through [`Task::finish`], the completion
//! callback every backend must invoke exactly once. Finishing is one-shot:
//! the first call stores the outcome and every later waiter observes it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use taskfarm_core::codec::{read_artifact, remove_artifact};
use taskfarm_core::{FarmError, TaskOutput};

use crate::completion::Completion;

/// Shared handle to a submitted task.
pub type TaskHandle = Arc<Task>;

/// What a finished task resolved to.
pub type Outcome = Result<TaskOutput, FarmError>;

// ── Executable ───────────────────────────────────────────────────────

/// What a task runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "lowercase")]
pub enum Executable {
    /// A function registered under this name in the worker's registry.
    Function(String),
    /// A script handed to the backend's interpreter.
    Script(PathBuf),
}

impl Executable {
    pub fn function(name: impl Into<String>) -> Self {
        Self::Function(name.into())
    }

    pub fn script(path: impl Into<PathBuf>) -> Self {
        Self::Script(path.into())
    }

    /// Short identity used to derive task names: the function name or the
    /// script's file name.
    pub fn identity(&self) -> String {
        match self {
            Self::Function(name) => name.clone(),
            Self::Script(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        }
    }
}

impl fmt::Display for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity())
    }
}

// ── State and bookkeeping ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Created,
    Queued,
    Executing,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTimes {
    pub submitted: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

/// Durable snapshot of a task, as kept by the state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub name: String,
    pub executable: Executable,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub times: TaskTimes,
    pub state: TaskState,
    pub error: Option<String>,
}

/// How long a caller is prepared to wait for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Block until the task finishes.
    Block,
    /// Check once and return immediately.
    Poll,
    /// Block for at most this long.
    Timeout(Duration),
}

impl From<bool> for Wait {
    fn from(wait: bool) -> Self {
        if wait {
            Self::Block
        } else {
            Self::Poll
        }
    }
}

/// Notified once when a task's outcome is decided, before its waiters wake.
pub trait FinishObserver: Send + Sync {
    fn task_finished(&self, task: &TaskHandle);
}

struct Progress {
    state: TaskState,
    times: TaskTimes,
    error: Option<String>,
}

// ── Task ─────────────────────────────────────────────────────────────

pub struct Task {
    name: String,
    executable: Executable,
    input_path: PathBuf,
    output_path: PathBuf,
    progress: Mutex<Progress>,
    completion: Completion<Outcome>,
    observer: Option<Weak<dyn FinishObserver>>,
    collected: AtomicBool,
}

impl Task {
    /// Create a task whose artifacts live in `task_dir` as
    /// `in_<name>.dat` and `out_<name>.dat`.
    pub fn new(
        name: impl Into<String>,
        executable: Executable,
        task_dir: &Path,
        observer: Option<Weak<dyn FinishObserver>>,
    ) -> TaskHandle {
        let name = name.into();
        Arc::new(Self {
            input_path: task_dir.join(format!("in_{name}.dat")),
            output_path: task_dir.join(format!("out_{name}.dat")),
            name,
            executable,
            progress: Mutex::new(Progress {
                state: TaskState::Created,
                times: TaskTimes {
                    submitted: Utc::now(),
                    started: None,
                    finished: None,
                },
                error: None,
            }),
            completion: Completion::new(),
            observer,
            collected: AtomicBool::new(false),
        })
    }

    /// Rebuild an already-finished task from a stored record.
    ///
    /// Only successful records whose output artifact is still readable can
    /// be restored; anything else has to run again.
    pub fn restore(record: &TaskRecord) -> Option<TaskHandle> {
        if record.state != TaskState::Succeeded {
            return None;
        }
        let output = read_output(&record.output_path).ok()?;

        let task = Arc::new(Self {
            name: record.name.clone(),
            executable: record.executable.clone(),
            input_path: record.input_path.clone(),
            output_path: record.output_path.clone(),
            progress: Mutex::new(Progress {
                state: TaskState::Succeeded,
                times: record.times.clone(),
                error: None,
            }),
            completion: Completion::new(),
            observer: None,
            collected: AtomicBool::new(false),
        });
        task.completion.complete(Ok(output));
        debug!(task = %task.name, "restored finished task from state record");
        Some(task)
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn executable(&self) -> &Executable {
        &self.executable
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn state(&self) -> TaskState {
        self.progress().state
    }

    pub fn times(&self) -> TaskTimes {
        self.progress().times.clone()
    }

    /// `Created → Queued`, once the input artifact has been written.
    pub(crate) fn mark_queued(&self) -> bool {
        let mut progress = self.progress();
        if progress.state != TaskState::Created {
            return false;
        }
        progress.state = TaskState::Queued;
        true
    }

    /// `Queued → Executing`, recording the start time.
    pub fn mark_executing(&self) -> bool {
        let mut progress = self.progress();
        if progress.state != TaskState::Queued {
            return false;
        }
        progress.state = TaskState::Executing;
        progress.times.started = Some(Utc::now());
        true
    }

    /// Completion callback.
    ///
    /// `Ok(())` means the backend has written the output artifact; it is read
    /// here, and a missing or unreadable artifact turns into an interface
    /// error. The observer runs before waiters are released, so anything it
    /// records is in place by the time a waiter sees the outcome. Returns
    /// `false` if the task had already finished.
    pub fn finish(self: &Arc<Self>, result: Result<(), FarmError>) -> bool {
        if self.completion.is_complete() {
            return false;
        }

        let outcome = result.and_then(|()| read_output(&self.output_path));

        {
            let mut progress = self.progress();
            if progress.state.is_finished() {
                return false;
            }
            progress.state = if outcome.is_ok() {
                TaskState::Succeeded
            } else {
                TaskState::Failed
            };
            progress.times.finished = Some(Utc::now());
            progress.error = outcome.as_ref().err().map(ToString::to_string);
        }

        match &outcome {
            Ok(_) => info!(task = %self.name, "task finished"),
            Err(e) => warn!(task = %self.name, error = %e, "task failed"),
        }

        if let Some(observer) = self.observer.as_ref().and_then(Weak::upgrade) {
            observer.task_finished(self);
        }
        self.completion.complete(outcome);
        true
    }

    pub fn is_finished(&self) -> bool {
        self.completion.is_complete()
    }

    /// Check whether the task has finished, optionally waiting for it.
    pub fn is_task_finished(&self, wait: impl Into<Wait>) -> bool {
        self.wait(wait).is_some()
    }

    /// The outcome, once available within the given waiting policy.
    pub fn wait(&self, wait: impl Into<Wait>) -> Option<Outcome> {
        match wait.into() {
            Wait::Block => Some(self.completion.wait()),
            Wait::Poll => self.completion.try_get(),
            Wait::Timeout(limit) => self.completion.wait_timeout(limit),
        }
    }

    /// Block for the outcome. For callers that know the task is finishing.
    pub(crate) fn completion_outcome(&self) -> Outcome {
        self.completion.wait()
    }

    /// The outcome if finished, without waiting.
    pub fn outcome(&self) -> Option<Outcome> {
        self.completion.try_get()
    }

    /// The error a failed task finished with.
    pub fn error(&self) -> Option<FarmError> {
        self.outcome().and_then(Result::err)
    }

    /// Time from submission to completion. `None` until finished.
    pub fn total_time(&self) -> Option<Duration> {
        let times = self.times();
        times
            .finished
            .and_then(|finished| (finished - times.submitted).to_std().ok())
    }

    /// Time from start of execution to completion. `None` until finished,
    /// or if the task failed before it was ever dispatched.
    pub fn execution_time(&self) -> Option<Duration> {
        let times = self.times();
        match (times.started, times.finished) {
            (Some(started), Some(finished)) => (finished - started).to_std().ok(),
            _ => None,
        }
    }

    /// Mark the task as handed out to a caller. Returns `true` the first time.
    pub(crate) fn mark_collected(&self) -> bool {
        !self.collected.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_collected(&self) -> bool {
        self.collected.load(Ordering::Acquire)
    }

    /// Remove the task's input and output artifacts. Errors are swallowed.
    pub fn cleanup(&self) {
        remove_artifact(&self.input_path);
        remove_artifact(&self.output_path);
    }

    pub fn record(&self) -> TaskRecord {
        let progress = self.progress();
        TaskRecord {
            name: self.name.clone(),
            executable: self.executable.clone(),
            input_path: self.input_path.clone(),
            output_path: self.output_path.clone(),
            times: progress.times.clone(),
            state: progress.state,
            error: progress.error.clone(),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("executable", &self.executable)
            .field("state", &self.state())
            .finish()
    }
}

fn read_output(path: &Path) -> Outcome {
    let payload = read_artifact(path).map_err(|e| {
        FarmError::interface_with_detail("task output artifact is missing", e.to_string())
    })?;
    TaskOutput::from_payload(&payload).map_err(|e| {
        FarmError::interface_with_detail("task output artifact is unreadable", e.to_string())
    })
}
