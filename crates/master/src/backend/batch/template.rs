//! Job description rendering.
//!
//! The built-in template produces a Condor-style vanilla-universe submit
//! description. A custom template may replace it; it is rendered with the
//! same variables:
//!
//! | Variable       | Value                                                   |
//! |----------------|---------------------------------------------------------|
//! | `initial_dir`  | working directory of the master                         |
//! | `interpreter`  | program the job runs: worker binary or interpreter      |
//! | `error_file`   | absolute path of the job's stderr capture               |
//! | `log_file`     | absolute path of the batch system's job log             |
//! | `input_file`   | absolute path of the task input artifact (job stdin)    |
//! | `output_file`  | absolute path of the task output artifact (job stdout)  |
//! | `exec_name`    | function name, or the script's file name                |
//! | `exec_file`    | absolute script path; empty for functions               |

use std::fs;
use std::path::Path;

use serde::Serialize;

use taskfarm_core::{FarmError, FarmResult};

const BUILTIN_TEMPLATE: &str = "\
Universe = vanilla
InitialDir = {{ initial_dir }}
Executable = {{ interpreter }}
Error = {{ error_file }}
Log = {{ log_file }}
Input = {{ input_file }}
Output = {{ output_file }}
Arguments = {{ exec_name }}
ShouldTransferFiles = YES
WhenToTransferOutput = ON_EXIT
{% if exec_file %}TransferInputFiles = {{ exec_file }}
{% endif %}Queue
";

/// Values substituted into a job description.
#[derive(Debug, Clone, Serialize)]
pub struct JobContext {
    pub initial_dir: String,
    pub interpreter: String,
    pub error_file: String,
    pub log_file: String,
    pub input_file: String,
    pub output_file: String,
    pub exec_name: String,
    pub exec_file: String,
}

#[derive(Debug, Clone)]
pub struct JobTemplate {
    source: String,
}

impl JobTemplate {
    pub fn builtin() -> Self {
        Self {
            source: BUILTIN_TEMPLATE.to_string(),
        }
    }

    /// Load and syntax-check a template file.
    pub fn from_file(path: &Path) -> FarmResult<Self> {
        let source = fs::read_to_string(path).map_err(|e| {
            FarmError::Config(format!(
                "failed to read job template {}: {e}",
                path.display()
            ))
        })?;
        Self::from_source(source)
    }

    pub fn from_source(source: impl Into<String>) -> FarmResult<Self> {
        let source = source.into();
        minijinja::Environment::new()
            .template_from_str(&source)
            .map_err(|e| FarmError::Config(format!("invalid job template: {e}")))?;
        Ok(Self { source })
    }

    pub fn render(&self, ctx: &JobContext) -> FarmResult<String> {
        let mut env = minijinja::Environment::new();
        env.set_keep_trailing_newline(true);
        env.render_str(&self.source, ctx).map_err(|e| {
            FarmError::interface_with_detail("failed to render job description", e.to_string())
        })
    }
}

impl Default for JobTemplate {
    fn default() -> Self {
        Self::builtin()
    }
}
