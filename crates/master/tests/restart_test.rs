//! Resubmission and restart behaviour with state records enabled.

mod common;

use std::fs;
use std::sync::Arc;
use std::thread;

use taskfarm_core::builtins::{PRODUCT, SUM};
use taskfarm_core::FarmConfig;
use taskfarm_master::{Executable, Master, TaskState, Wait};

use common::{config, CountingBackend};

fn stateful(dir: &std::path::Path) -> FarmConfig {
    FarmConfig {
        use_state_records: true,
        ..config(dir, 2)
    }
}

#[test]
fn explicit_name_resubmission_returns_original_task() {
    let dir = tempfile::tempdir().unwrap();
    let backend = CountingBackend::new(2);
    let master = Master::new(stateful(dir.path()), backend.clone()).unwrap();
    let sum = Executable::function(SUM);

    let first = master.submit_task(sum.clone(), &vec![1i64, 2], Some("job")).unwrap();
    let again = master.submit_task(sum, &vec![100i64], Some("job")).unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    let (_, output) = master.get_result(Some(&again), true).unwrap().unwrap();
    assert_eq!(output.decode::<i64>().unwrap(), 3);
    assert_eq!(backend.executed(), 1);
}

#[test]
fn restarted_master_reuses_finished_results() {
    let dir = tempfile::tempdir().unwrap();

    {
        let master = Master::from_config(stateful(dir.path()), taskfarm_core::builtin_registry()).unwrap();
        let task = master
            .submit_task(Executable::function(SUM), &vec![1i64, 2, 3], None)
            .unwrap();
        assert_eq!(task.name(), "sum_0");
        master.get_result(Some(&task), true).unwrap();
        master.shutdown();

        // Artifacts are kept for the next run.
        assert!(task.output_path().exists());
    }
    assert!(dir.path().join("taskfarm_state.json").exists());

    let backend = CountingBackend::new(1);
    let master = Master::new(stateful(dir.path()), backend.clone()).unwrap();
    let task = master
        .submit_task(Executable::function(SUM), &vec![1i64, 2, 3], None)
        .unwrap();

    assert_eq!(task.name(), "sum_0");
    assert_eq!(task.state(), TaskState::Succeeded);
    let (_, output) = master.get_result(Some(&task), Wait::Poll).unwrap().unwrap();
    assert_eq!(output.decode::<i64>().unwrap(), 6);
    assert_eq!(backend.executed(), 0);

    // Restored tasks are also served as "next finished".
    let fresh = master
        .submit_task(Executable::function(SUM), &vec![10i64], None)
        .unwrap();
    let (next, _) = master.get_result(None, true).unwrap().unwrap();
    assert!(Arc::ptr_eq(&next, &fresh));
    assert_eq!(backend.executed(), 1);
}

#[test]
fn stale_records_are_executed_again() {
    let dir = tempfile::tempdir().unwrap();

    {
        let master = Master::from_config(stateful(dir.path()), taskfarm_core::builtin_registry()).unwrap();
        let task = master
            .submit_task(Executable::function(SUM), &vec![2i64, 2], Some("missing_output"))
            .unwrap();
        master.get_result(Some(&task), true).unwrap();
        let other = master
            .submit_task(Executable::function(SUM), &vec![2i64, 2], Some("changed_exe"))
            .unwrap();
        master.get_result(Some(&other), true).unwrap();
        fs::remove_file(task.output_path()).unwrap();
    }

    let backend = CountingBackend::new(1);
    let master = Master::new(stateful(dir.path()), backend.clone()).unwrap();

    let rerun = master
        .submit_task(Executable::function(SUM), &vec![2i64, 2], Some("missing_output"))
        .unwrap();
    let (_, output) = master.get_result(Some(&rerun), true).unwrap().unwrap();
    assert_eq!(output.decode::<i64>().unwrap(), 4);

    let changed = master
        .submit_task(Executable::function(PRODUCT), &vec![2i64, 3], Some("changed_exe"))
        .unwrap();
    let (_, output) = master.get_result(Some(&changed), true).unwrap().unwrap();
    assert_eq!(output.decode::<i64>().unwrap(), 6);

    assert_eq!(backend.executed(), 2);
}

#[test]
fn concurrent_submitters_share_one_named_task() {
    let dir = tempfile::tempdir().unwrap();
    let backend = CountingBackend::new(2);
    let master = Master::new(stateful(dir.path()), backend.clone()).unwrap();

    let handles: Vec<_> = thread::scope(|s| {
        let spawned: Vec<_> = (0..8i64)
            .map(|i| {
                let master = &master;
                s.spawn(move || {
                    master
                        .submit_task(Executable::function(SUM), &vec![i, 1], Some("job"))
                        .unwrap()
                })
            })
            .collect();
        spawned.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(handles.iter().all(|task| Arc::ptr_eq(task, &handles[0])));
    assert_eq!(master.tasks().len(), 1);

    master.get_result(Some(&handles[0]), true).unwrap();
    assert_eq!(backend.executed(), 1);
}
