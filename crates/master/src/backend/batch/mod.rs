//! Backend that hands tasks to an external batch scheduler.
//!
//! Each task becomes a job description file submitted through a command
//! line tool (`condor_submit` by default). The job runs the worker binary
//! for a function task, or the interpreter for a script, with the task input
//! on stdin and its stdout captured into the
//! output artifact. Completion is detected by polling the job log for a
//! terminal marker; see [`poller`].

mod poller;
pub mod template;

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use taskfarm_core::codec::remove_artifact;
use taskfarm_core::config::BatchConfig;
use taskfarm_core::{FarmError, FarmResult};

use super::{Backend, BackendStatus, WorkerToken};
use crate::task::{Executable, TaskHandle};
use poller::{LogPoller, TrackedJob};
pub use template::{JobContext, JobTemplate};

pub struct BatchBackend {
    submit_command: String,
    worker_binary: PathBuf,
    interpreter: PathBuf,
    template: JobTemplate,
    poll_interval: Duration,
    poller: LogPoller,
    submitted: AtomicU64,
    rejected: AtomicU64,
}

impl BatchBackend {
    pub fn new(config: &BatchConfig) -> FarmResult<Self> {
        let template = match &config.template_path {
            Some(path) => JobTemplate::from_file(path)?,
            None => JobTemplate::builtin(),
        };
        let poll_interval = Duration::from_millis(config.poll_interval_ms.max(1));

        info!(
            submit = %config.submit_command,
            worker = %config.worker_binary.display(),
            interpreter = %config.interpreter.display(),
            poll_ms = poll_interval.as_millis() as u64,
            "batch backend ready"
        );
        Ok(Self {
            submit_command: config.submit_command.clone(),
            worker_binary: config.worker_binary.clone(),
            interpreter: config.interpreter.clone(),
            template,
            poll_interval,
            poller: LogPoller::new(poll_interval, config.terminal_marker.clone()),
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Render, write and submit the job description for `task`.
    fn submit(&self, task: &TaskHandle) -> FarmResult<TrackedJob> {
        let task_dir = task.input_path().parent().unwrap_or_else(|| Path::new("."));
        let error_file = task_dir.join(format!("{}.err", task.name()));
        let log_file = task_dir.join(format!("{}.log", task.name()));
        let submit_file = task_dir.join(format!("{}_submit", task.name()));

        // Stale logs from an earlier run would look like instant completion.
        remove_artifact(&error_file);
        remove_artifact(&log_file);

        let (program, exec_file) = match task.executable() {
            Executable::Function(_) => (&self.worker_binary, String::new()),
            Executable::Script(path) => (&self.interpreter, absolute(path)?.display().to_string()),
        };
        let ctx = JobContext {
            initial_dir: current_dir()?.display().to_string(),
            interpreter: program.display().to_string(),
            error_file: absolute(&error_file)?.display().to_string(),
            log_file: absolute(&log_file)?.display().to_string(),
            input_file: absolute(task.input_path())?.display().to_string(),
            output_file: absolute(task.output_path())?.display().to_string(),
            exec_name: task.executable().identity(),
            exec_file,
        };
        let description = self.template.render(&ctx)?;
        fs::write(&submit_file, description).map_err(|e| {
            FarmError::interface_with_detail("failed to write job description", e.to_string())
        })?;

        let output = match Command::new(&self.submit_command).arg(&submit_file).output() {
            Ok(output) => output,
            Err(e) => {
                remove_artifact(&submit_file);
                return Err(if e.kind() == io::ErrorKind::NotFound {
                    FarmError::interface(format!(
                        "could not find task submission program {}",
                        self.submit_command
                    ))
                } else {
                    FarmError::interface_with_detail(
                        format!("failed to run {}", self.submit_command),
                        e.to_string(),
                    )
                });
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() || !stderr.trim().is_empty() {
            remove_artifact(&submit_file);
            return Err(FarmError::interface_with_detail(
                format!("{} failed ({})", self.submit_command, output.status),
                stderr.trim_end(),
            ));
        }

        debug!(
            task = %task,
            stdout = %String::from_utf8_lossy(&output.stdout).trim_end(),
            "job submitted"
        );
        Ok(TrackedJob {
            task: Arc::clone(task),
            submit_file,
            log_file,
            error_file,
        })
    }
}

impl Backend for BatchBackend {
    fn name(&self) -> &str {
        "batch"
    }

    /// The batch system does its own queueing; there is no slot to hold.
    fn reserve_worker(&self) -> FarmResult<WorkerToken> {
        if self.poller.is_shut_down() {
            return Err(FarmError::interface("backend is shut down"));
        }
        Ok(WorkerToken::none())
    }

    fn execute_task(&self, task: TaskHandle, _worker: WorkerToken) {
        match self.submit(&task) {
            Ok(job) => {
                self.submitted.fetch_add(1, Ordering::Relaxed);
                self.poller.track(job);
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(task = %task, error = %e, "job submission failed");
                task.finish(Err(e));
            }
        }
    }

    fn status(&self) -> BackendStatus {
        BackendStatus::new(self.name())
            .with("submit_command", self.submit_command.clone())
            .with("poll_interval_ms", self.poll_interval.as_millis() as u64)
            .with("tracked", self.poller.tracked())
            .with("polling", self.poller.is_polling())
            .with("submitted", self.submitted.load(Ordering::Relaxed))
            .with("rejected", self.rejected.load(Ordering::Relaxed))
    }

    fn cleanup(&self) {
        self.poller.shutdown();
    }
}

fn current_dir() -> FarmResult<PathBuf> {
    env::current_dir().map_err(|e| {
        FarmError::interface_with_detail("failed to resolve working directory", e.to_string())
    })
}

fn absolute(path: &Path) -> FarmResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(current_dir()?.join(path))
    }
}
