use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskfarm_core::codec::write_artifact;
use taskfarm_core::{FarmError, FarmResult, Payload, TaskOutput};

use crate::backend::{Backend, BackendStatus, WorkerToken};
use crate::scheduler::Scheduler;
use crate::task::{Executable, Task, TaskHandle, TaskState, Wait};

/// What the mock backend does with each task.
#[derive(Clone, Copy)]
enum Behaviour {
    Succeed,
    RefuseReservation,
    SlowReservation,
    Panic,
}

struct MockBackend {
    behaviour: Behaviour,
    order: Mutex<Vec<String>>,
    reservations: AtomicUsize,
}

impl MockBackend {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            order: Mutex::new(Vec::new()),
            reservations: AtomicUsize::new(0),
        })
    }

    fn executed(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn reserve_worker(&self) -> FarmResult<WorkerToken> {
        self.reservations.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            Behaviour::RefuseReservation => Err(FarmError::interface("no workers available")),
            Behaviour::SlowReservation => {
                std::thread::sleep(Duration::from_millis(100));
                Ok(WorkerToken::none())
            }
            _ => Ok(WorkerToken::none()),
        }
    }

    fn execute_task(&self, task: TaskHandle, _worker: WorkerToken) {
        self.order.lock().unwrap().push(task.name().to_string());
        if let Behaviour::Panic = self.behaviour {
            panic!("backend exploded");
        }
        let bundle = TaskOutput {
            result: Payload::encode(&task.name()).unwrap(),
            stdout: String::new(),
            stderr: String::new(),
        };
        write_artifact(&bundle.to_payload().unwrap(), task.output_path()).unwrap();
        task.finish(Ok(()));
    }

    fn status(&self) -> BackendStatus {
        BackendStatus::new(self.name())
    }

    fn cleanup(&self) {}
}

fn new_task(dir: &Path, name: &str) -> TaskHandle {
    Task::new(name, Executable::function("echo"), dir, None)
}

#[test]
fn dispatches_in_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(Behaviour::Succeed);
    let scheduler = Scheduler::start(backend.clone()).unwrap();
    assert!(scheduler.is_running());

    let tasks: Vec<_> = (0..5).map(|i| new_task(dir.path(), &format!("t{i}"))).collect();
    for task in &tasks {
        scheduler.enqueue(Arc::clone(task));
    }
    for task in &tasks {
        let output = task.wait(Wait::Timeout(Duration::from_secs(5))).unwrap().unwrap();
        assert_eq!(output.decode::<String>().unwrap(), task.name());
    }

    assert_eq!(backend.executed(), vec!["t0", "t1", "t2", "t3", "t4"]);
    assert_eq!(scheduler.dispatched(), 5);

    scheduler.stop();
    scheduler.join();
    assert!(!scheduler.is_running());
}

#[test]
fn reservation_failure_fails_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(Behaviour::RefuseReservation);
    let scheduler = Scheduler::start(backend.clone()).unwrap();

    let task = new_task(dir.path(), "refused");
    scheduler.enqueue(Arc::clone(&task));

    let err = task.wait(Wait::Timeout(Duration::from_secs(5))).unwrap().unwrap_err();
    assert_eq!(err, FarmError::interface("no workers available"));
    assert_eq!(task.state(), TaskState::Failed);
    assert!(task.execution_time().is_none());
    assert!(backend.executed().is_empty());
}

#[test]
fn backend_panic_becomes_interface_error() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Scheduler::start(MockBackend::new(Behaviour::Panic)).unwrap();

    let task = new_task(dir.path(), "boom");
    scheduler.enqueue(Arc::clone(&task));

    let err = task.wait(Wait::Timeout(Duration::from_secs(5))).unwrap().unwrap_err();
    assert!(err.is_interface_error());
    assert!(err.to_string().contains("backend exploded"));

    // The loop keeps running after a backend panic.
    assert!(scheduler.is_running());
}

#[test]
fn tasks_behind_the_sentinel_are_failed() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(Behaviour::Succeed);
    let scheduler = Scheduler::start(backend.clone()).unwrap();

    scheduler.stop();
    let late: Vec<_> = (0..3).map(|i| new_task(dir.path(), &format!("late{i}"))).collect();
    for task in &late {
        scheduler.enqueue(Arc::clone(task));
    }
    scheduler.join();

    for task in &late {
        let err = task.wait(Wait::Timeout(Duration::from_secs(5))).unwrap().unwrap_err();
        assert_eq!(err, FarmError::interface("scheduler stopped before dispatch"));
    }
    assert!(backend.executed().is_empty());
    assert_eq!(scheduler.queued(), 0);
}

#[test]
fn stop_fails_queued_tasks_without_dispatching_them() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(Behaviour::SlowReservation);
    let scheduler = Scheduler::start(backend.clone()).unwrap();

    let tasks: Vec<_> = (0..4).map(|i| new_task(dir.path(), &format!("q{i}"))).collect();
    for task in &tasks {
        scheduler.enqueue(Arc::clone(task));
    }
    // q0 is now blocked in reservation; the rest are still queued.
    std::thread::sleep(Duration::from_millis(20));
    scheduler.stop();

    for task in &tasks[1..] {
        let err = task.wait(Wait::Poll).unwrap().unwrap_err();
        assert_eq!(err, FarmError::interface("scheduler stopped before dispatch"));
    }

    scheduler.join();
    let err = tasks[0].wait(Wait::Poll).unwrap().unwrap_err();
    assert_eq!(err, FarmError::interface("scheduler stopped before dispatch"));
    assert!(backend.executed().is_empty());
    assert_eq!(scheduler.dispatched(), 0);
}

#[test]
fn stop_and_join_are_idempotent() {
    let scheduler = Scheduler::start(MockBackend::new(Behaviour::Succeed)).unwrap();
    scheduler.stop();
    scheduler.stop();
    scheduler.join();
    scheduler.join();
    assert!(scheduler.is_stop_requested());
    assert!(!scheduler.is_running());
}
