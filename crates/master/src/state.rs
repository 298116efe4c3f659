//! Durable task records.
//!
//! A JSON file mapping task name to its last [`TaskRecord`]. Every change
//! rewrites the whole file through a temporary sibling and a rename, so a
//! crash leaves either the old or the new file, never a partial one.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use taskfarm_core::{FarmError, FarmResult};

use crate::task::TaskRecord;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    tasks: BTreeMap<String, TaskRecord>,
}

pub struct StateStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, TaskRecord>>,
}

impl StateStore {
    /// Open the store at `path`, loading existing records.
    ///
    /// A missing file is an empty store. An unreadable one is logged and
    /// replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match load(&path) {
            Ok(records) => records,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable state file");
                BTreeMap::new()
            }
        };
        info!(path = %path.display(), records = records.len(), "state store opened");
        Self {
            path,
            records: Mutex::new(records),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, TaskRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, name: &str) -> Option<TaskRecord> {
        self.lock().get(name).cloned()
    }

    /// Insert or replace a record and persist the store.
    pub fn put(&self, record: TaskRecord) -> FarmResult<()> {
        let mut records = self.lock();
        debug!(task = %record.name, state = %record.state, "storing task record");
        records.insert(record.name.clone(), record);
        self.persist(&records)
    }

    /// Drop a record and persist the store. Unknown names are ignored.
    pub fn remove(&self, name: &str) -> FarmResult<()> {
        let mut records = self.lock();
        if records.remove(name).is_none() {
            return Ok(());
        }
        self.persist(&records)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn persist(&self, records: &BTreeMap<String, TaskRecord>) -> FarmResult<()> {
        let file = StateFile {
            tasks: records.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| FarmError::Codec(format!("failed to encode state: {e}")))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string());
        let tmp_path = self.path.with_file_name(format!(".{file_name}.tmp"));
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn load(path: &Path) -> FarmResult<BTreeMap<String, TaskRecord>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let json = fs::read_to_string(path)?;
    let file: StateFile = serde_json::from_str(&json)
        .map_err(|e| FarmError::Codec(format!("failed to decode state: {e}")))?;
    Ok(file.tasks)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::task::{Executable, TaskState, TaskTimes};

    fn record(name: &str, state: TaskState) -> TaskRecord {
        TaskRecord {
            name: name.to_string(),
            executable: Executable::function("sum"),
            input_path: PathBuf::from(format!("tasks/in_{name}.dat")),
            output_path: PathBuf::from(format!("tasks/out_{name}.dat")),
            times: TaskTimes {
                submitted: Utc::now(),
                started: Some(Utc::now()),
                finished: Some(Utc::now()),
            },
            state,
            error: None,
        }
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::open(&path);
        assert!(store.is_empty());
        store.put(record("sum_0", TaskState::Succeeded)).unwrap();
        store.put(record("sum_1", TaskState::Failed)).unwrap();
        drop(store);

        let reopened = StateStore::open(&path);
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get("sum_0").unwrap().state, TaskState::Succeeded);
        assert_eq!(reopened.get("sum_1").unwrap().state, TaskState::Failed);
        assert!(reopened.get("sum_2").is_none());
        assert!(!dir.path().join(".state.json.tmp").exists());
    }

    #[test]
    fn put_replaces_and_remove_forgets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let store = StateStore::open(&path);

        store.put(record("t", TaskState::Executing)).unwrap();
        store.put(record("t", TaskState::Succeeded)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(StateStore::open(&path).get("t").unwrap().state, TaskState::Succeeded);

        store.remove("t").unwrap();
        store.remove("missing").unwrap();
        assert!(StateStore::open(&path).is_empty());
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();

        let store = StateStore::open(&path);
        assert!(store.is_empty());
        store.put(record("fresh", TaskState::Succeeded)).unwrap();
        assert_eq!(StateStore::open(&path).len(), 1);
    }
}
