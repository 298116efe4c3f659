//! Completion detection for submitted batch jobs.
//!
//! Jobs are tracked in one list behind its own mutex. A single poller thread
//! is started when the first job is tracked and exits as soon as the list is
//! empty; the next tracked job starts a new one.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use taskfarm_core::codec::remove_artifact;
use taskfarm_core::FarmError;

use crate::task::TaskHandle;

/// A submitted job and the artifacts the batch system writes for it.
pub(crate) struct TrackedJob {
    pub task: TaskHandle,
    pub submit_file: PathBuf,
    pub log_file: PathBuf,
    pub error_file: PathBuf,
}

impl TrackedJob {
    fn remove_artifacts(&self) {
        remove_artifact(&self.submit_file);
        remove_artifact(&self.log_file);
        remove_artifact(&self.error_file);
    }
}

struct Tracked {
    jobs: Vec<TrackedJob>,
    polling: bool,
    shut_down: bool,
}

struct Shared {
    tracked: Mutex<Tracked>,
    wake: Condvar,
    interval: Duration,
    marker: String,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) struct LogPoller {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LogPoller {
    pub fn new(interval: Duration, marker: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                tracked: Mutex::new(Tracked {
                    jobs: Vec::new(),
                    polling: false,
                    shut_down: false,
                }),
                wake: Condvar::new(),
                interval,
                marker: marker.into(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Start watching `job`. Fails the task right away if the poller has
    /// been shut down.
    pub fn track(&self, job: TrackedJob) {
        let mut tracked = self.shared.lock();
        if tracked.shut_down {
            drop(tracked);
            job.remove_artifacts();
            job.task.finish(Err(FarmError::interface("backend shut down")));
            return;
        }

        debug!(task = %job.task, log = %job.log_file.display(), "tracking batch job");
        tracked.jobs.push(job);
        if tracked.polling {
            return;
        }
        tracked.polling = true;
        drop(tracked);

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("taskfarm-batch-poller".into())
            .spawn(move || poll_loop(&shared));
        match spawned {
            Ok(handle) => {
                let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
                *slot = Some(handle);
            }
            Err(e) => {
                warn!(error = %e, "failed to start batch poller");
                let jobs = {
                    let mut tracked = self.shared.lock();
                    tracked.polling = false;
                    std::mem::take(&mut tracked.jobs)
                };
                for job in jobs {
                    job.remove_artifacts();
                    job.task.finish(Err(FarmError::interface_with_detail(
                        "failed to start batch poller",
                        e.to_string(),
                    )));
                }
            }
        }
    }

    pub fn tracked(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    pub fn is_polling(&self) -> bool {
        self.shared.lock().polling
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.lock().shut_down
    }

    /// Stop polling and fail every job still being tracked.
    pub fn shutdown(&self) {
        let jobs = {
            let mut tracked = self.shared.lock();
            if tracked.shut_down {
                return;
            }
            tracked.shut_down = true;
            std::mem::take(&mut tracked.jobs)
        };
        self.shared.wake.notify_all();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("batch poller thread panicked");
            }
        }

        if !jobs.is_empty() {
            info!(count = jobs.len(), "failing batch jobs still tracked at shutdown");
        }
        for job in jobs {
            job.remove_artifacts();
            job.task.finish(Err(FarmError::interface("backend shut down")));
        }
    }
}

fn poll_loop(shared: &Shared) {
    debug!("batch poller started");
    loop {
        let done = {
            let mut tracked = shared.lock();
            if tracked.shut_down {
                tracked.polling = false;
                return;
            }
            let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut tracked.jobs)
                .into_iter()
                .partition(|job| log_shows_marker(job, &shared.marker));
            tracked.jobs = pending;
            done
        };

        for job in done {
            complete(job);
        }

        let mut tracked = shared.lock();
        if tracked.jobs.is_empty() || tracked.shut_down {
            tracked.polling = false;
            debug!("batch poller idle, exiting");
            return;
        }
        let (guard, _) = shared
            .wake
            .wait_timeout(tracked, shared.interval)
            .unwrap_or_else(PoisonError::into_inner);
        drop(guard);
    }
}

/// A missing or unreadable log means the job has not written it yet.
fn log_shows_marker(job: &TrackedJob, marker: &str) -> bool {
    fs::read_to_string(&job.log_file)
        .map(|log| log.contains(marker))
        .unwrap_or(false)
}

fn complete(job: TrackedJob) {
    let errors = fs::read_to_string(&job.error_file).unwrap_or_default();
    job.remove_artifacts();

    let result = if errors.trim().is_empty() {
        Ok(())
    } else {
        remove_artifact(job.task.output_path());
        Err(FarmError::task(format!(
            "job failed with error:\n{}",
            errors.trim_end()
        )))
    };
    job.task.finish(result);
}
