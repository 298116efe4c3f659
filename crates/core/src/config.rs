use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FarmError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

// ── Top-level config ──────────────────────────────────────────

/// Configuration for a master and the backend it drives.
///
/// Parsed from `taskfarm.toml` or built from the environment, with
/// `TASKFARM_*` variables overriding either source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmConfig {
    /// Which backend executes tasks.
    #[serde(default)]
    pub backend: BackendKind,

    /// Shared directory holding per-task input/output artifacts.
    #[serde(default = "default_task_dir")]
    pub task_dir: PathBuf,

    /// Persist task records so a restarted master can reuse finished tasks.
    #[serde(default)]
    pub use_state_records: bool,

    /// Where task records are persisted when `use_state_records` is on.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Stop dispatching once any task result is retrieved as an error.
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,

    #[serde(default)]
    pub local: LocalConfig,

    #[serde(default)]
    pub process: ProcessConfig,

    #[serde(default)]
    pub batch: BatchConfig,
}

fn default_task_dir() -> PathBuf {
    PathBuf::from("tasks")
}

fn default_state_path() -> PathBuf {
    PathBuf::from("taskfarm_state.json")
}

fn default_fail_fast() -> bool {
    true
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            task_dir: default_task_dir(),
            use_state_records: false,
            state_path: default_state_path(),
            fail_fast: default_fail_fast(),
            local: LocalConfig::default(),
            process: ProcessConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

/// Backend variants selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process rayon thread pool.
    #[default]
    Local,
    /// One worker child process per task.
    Process,
    /// External batch scheduler, completion detected by log polling.
    Batch,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Process => write!(f, "process"),
            Self::Batch => write!(f, "batch"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = FarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "multicore" => Ok(Self::Local),
            "process" => Ok(Self::Process),
            "batch" | "condor" => Ok(Self::Batch),
            other => Err(FarmError::Config(format!(
                "invalid backend '{other}', expected 'local', 'process' or 'batch'"
            ))),
        }
    }
}

// ── Backend sections ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Concurrent task slots. 0 = available parallelism.
    #[serde(default)]
    pub slots: usize,
}

impl LocalConfig {
    pub fn resolved_slots(&self) -> usize {
        resolve_slots(self.slots)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Concurrent worker processes. 0 = available parallelism.
    #[serde(default)]
    pub slots: usize,

    /// Worker executable that serves registered functions.
    #[serde(default = "default_worker_binary")]
    pub worker_binary: PathBuf,

    /// Interpreter used for script executables.
    #[serde(default = "default_interpreter")]
    pub interpreter: PathBuf,
}

fn default_worker_binary() -> PathBuf {
    PathBuf::from("taskfarm-worker")
}

fn default_interpreter() -> PathBuf {
    PathBuf::from("/bin/sh")
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            slots: 0,
            worker_binary: default_worker_binary(),
            interpreter: default_interpreter(),
        }
    }
}

impl ProcessConfig {
    pub fn resolved_slots(&self) -> usize {
        resolve_slots(self.slots)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Command that accepts a job description file as its only argument.
    #[serde(default = "default_submit_command")]
    pub submit_command: String,

    /// Worker executable a job runs for function tasks. Must be reachable
    /// from the execution hosts.
    #[serde(default = "default_batch_worker_binary")]
    pub worker_binary: PathBuf,

    /// Interpreter a job runs for script tasks.
    #[serde(default = "default_interpreter")]
    pub interpreter: PathBuf,

    /// Interval between scans of tracked job logs.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Text whose presence in a job log means the job is over.
    #[serde(default = "default_terminal_marker")]
    pub terminal_marker: String,

    /// Custom job description template; the built-in one is used when unset.
    #[serde(default)]
    pub template_path: Option<PathBuf>,
}

fn default_submit_command() -> String {
    "condor_submit".into()
}

fn default_batch_worker_binary() -> PathBuf {
    PathBuf::from("/usr/local/bin/taskfarm-worker")
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_terminal_marker() -> String {
    "Job terminated".into()
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            submit_command: default_submit_command(),
            worker_binary: default_batch_worker_binary(),
            interpreter: default_interpreter(),
            poll_interval_ms: default_poll_interval_ms(),
            terminal_marker: default_terminal_marker(),
            template_path: None,
        }
    }
}

fn resolve_slots(slots: usize) -> usize {
    if slots == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    } else {
        slots
    }
}

// ── Loading ───────────────────────────────────────────────────

impl FarmConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, FarmError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FarmError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| FarmError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Build config from defaults plus environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, FarmError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `TASKFARM_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| env::var(key).ok().filter(|v| !v.is_empty()));
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Convention: `TASKFARM_SECTION_KEY` overrides `section.key`.
    /// Unparseable values are ignored with a warning.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TASKFARM_BACKEND") {
            match v.parse() {
                Ok(kind) => self.backend = kind,
                Err(e) => tracing::warn!(error = %e, "ignoring TASKFARM_BACKEND"),
            }
        }
        if let Some(v) = lookup("TASKFARM_TASK_DIR") {
            self.task_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TASKFARM_STATE_RECORDS") {
            self.use_state_records = parse_flag(&v, self.use_state_records);
        }
        if let Some(v) = lookup("TASKFARM_STATE_PATH") {
            self.state_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("TASKFARM_FAIL_FAST") {
            self.fail_fast = parse_flag(&v, self.fail_fast);
        }
        if let Some(v) = lookup("TASKFARM_LOCAL_SLOTS") {
            if let Ok(n) = v.parse() {
                self.local.slots = n;
            }
        }
        if let Some(v) = lookup("TASKFARM_PROCESS_SLOTS") {
            if let Ok(n) = v.parse() {
                self.process.slots = n;
            }
        }
        if let Some(v) = lookup("TASKFARM_WORKER_BINARY") {
            self.process.worker_binary = PathBuf::from(v);
        }
        if let Some(v) = lookup("TASKFARM_BATCH_SUBMIT") {
            self.batch.submit_command = v;
        }
        if let Some(v) = lookup("TASKFARM_BATCH_WORKER_BINARY") {
            self.batch.worker_binary = PathBuf::from(v);
        }
        if let Some(v) = lookup("TASKFARM_BATCH_INTERPRETER") {
            self.batch.interpreter = PathBuf::from(v);
        }
        if let Some(v) = lookup("TASKFARM_BATCH_POLL_MS") {
            if let Ok(ms) = v.parse() {
                self.batch.poll_interval_ms = ms;
            }
        }
        if let Some(v) = lookup("TASKFARM_BATCH_MARKER") {
            self.batch.terminal_marker = v;
        }
    }

    /// Validate field combinations that serde cannot express.
    pub fn validate(&self) -> Result<(), FarmError> {
        if self.task_dir.as_os_str().is_empty() {
            return Err(FarmError::Config("task_dir must not be empty".into()));
        }
        if self.use_state_records && self.state_path.as_os_str().is_empty() {
            return Err(FarmError::Config(
                "state_path must be set when use_state_records is on".into(),
            ));
        }
        if self.batch.poll_interval_ms == 0 {
            return Err(FarmError::Config("batch.poll_interval_ms must be > 0".into()));
        }
        if self.batch.terminal_marker.is_empty() {
            return Err(FarmError::Config("batch.terminal_marker must not be empty".into()));
        }
        if self.batch.submit_command.trim().is_empty() {
            return Err(FarmError::Config("batch.submit_command must not be empty".into()));
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  backend:     {}", self.backend);
        tracing::info!("  task_dir:    {}", self.task_dir.display());
        tracing::info!(
            "  state:       records={}, path={}",
            self.use_state_records,
            self.state_path.display()
        );
        tracing::info!("  fail_fast:   {}", self.fail_fast);
        match self.backend {
            BackendKind::Local => tracing::info!("  local:       slots={}", self.local.resolved_slots()),
            BackendKind::Process => tracing::info!(
                "  process:     slots={}, worker={}",
                self.process.resolved_slots(),
                self.process.worker_binary.display()
            ),
            BackendKind::Batch => tracing::info!(
                "  batch:       submit={}, poll={}ms",
                self.batch.submit_command,
                self.batch.poll_interval_ms
            ),
        }
    }
}

fn parse_flag(value: &str, fallback: bool) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => fallback,
    }
}
