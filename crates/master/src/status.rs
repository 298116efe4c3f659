use std::time::Duration;

use serde::Serialize;

use crate::backend::BackendStatus;
use crate::task::TaskState;

/// Snapshot of a master: per-state task counts, mean durations and the
/// backend's own report.
#[derive(Debug, Clone, Serialize)]
pub struct MasterStatus {
    pub backend: BackendStatus,
    pub tasks: TaskCounts,
    /// Submission to completion, over finished tasks.
    pub total_time: DurationStats,
    /// Start of execution to completion, over tasks that started.
    pub execution_time: DurationStats,
    pub scheduler_running: bool,
    /// Tasks handed to the backend by the scheduler.
    pub dispatched: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub created: usize,
    pub queued: usize,
    pub executing: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn record(&mut self, state: TaskState) {
        match state {
            TaskState::Created => self.created += 1,
            TaskState::Queued => self.queued += 1,
            TaskState::Executing => self.executing += 1,
            TaskState::Succeeded => self.succeeded += 1,
            TaskState::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.created + self.queued + self.executing + self.succeeded + self.failed
    }

    pub fn finished(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Running mean of a set of durations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DurationStats {
    pub count: u64,
    pub mean: Duration,
}

impl DurationStats {
    pub fn record(&mut self, duration: Duration) {
        self.count += 1;

        // Incremental mean: new = prev + (cur - prev) / count
        self.mean = if self.count == 1 {
            duration
        } else {
            let prev = self.mean.as_nanos() as f64;
            let cur = duration.as_nanos() as f64;
            Duration::from_nanos((prev + (cur - prev) / self.count as f64) as u64)
        };
    }

    /// The mean, or `None` if nothing was recorded.
    pub fn mean(&self) -> Option<Duration> {
        (self.count > 0).then_some(self.mean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_state() {
        let mut counts = TaskCounts::default();
        for state in [
            TaskState::Queued,
            TaskState::Succeeded,
            TaskState::Succeeded,
            TaskState::Failed,
        ] {
            counts.record(state);
        }
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.succeeded, 2);
        assert_eq!(counts.finished(), 3);
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn incremental_mean() {
        let mut stats = DurationStats::default();
        assert_eq!(stats.mean(), None);

        stats.record(Duration::from_millis(100));
        assert_eq!(stats.mean(), Some(Duration::from_millis(100)));

        stats.record(Duration::from_millis(200));
        stats.record(Duration::from_millis(300));
        let mean = stats.mean().unwrap().as_millis();
        assert!((199..=201).contains(&mean), "mean was {mean}ms");
        assert_eq!(stats.count, 3);
    }
}
