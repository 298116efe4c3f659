use thiserror::Error;

/// Errors surfaced by the task farm.
///
/// Every variant is `Clone`: a finished task stores its error once and every
/// caller waiting on that task receives an identical copy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FarmError {
    /// The submitted work itself failed.
    #[error("task failed: {0}")]
    Task(String),

    /// The backend or its tooling failed (missing binary, bad exit, missing artifact).
    #[error("interface error: {message}{}", detail_suffix(.detail))]
    Interface { message: String, detail: String },

    /// The caller asked for something the master cannot answer.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("config error: {0}")]
    Config(String),
}

fn detail_suffix(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!("\n{detail}")
    }
}

impl FarmError {
    pub fn task(msg: impl Into<String>) -> Self {
        Self::Task(msg.into())
    }

    pub fn interface(msg: impl Into<String>) -> Self {
        Self::Interface {
            message: msg.into(),
            detail: String::new(),
        }
    }

    pub fn interface_with_detail(msg: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Interface {
            message: msg.into(),
            detail: detail.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_task_error(&self) -> bool {
        matches!(self, Self::Task(_))
    }

    pub fn is_interface_error(&self) -> bool {
        matches!(self, Self::Interface { .. })
    }

    pub fn is_validation_error(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl From<std::io::Error> for FarmError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for FarmError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FarmError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<toml::de::Error> for FarmError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub type FarmResult<T> = Result<T, FarmError>;
