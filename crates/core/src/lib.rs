pub mod builtins;
pub mod codec;
pub mod config;
pub mod error;
pub mod redirect;
pub mod registry;
pub mod worker;

pub use builtins::{builtin_registry, register_builtins};
pub use codec::Payload;
pub use config::{BackendKind, BatchConfig, FarmConfig, LocalConfig, ProcessConfig};
pub use error::{FarmError, FarmResult};
pub use registry::{FunctionRegistry, RegisteredFunction, TaskFn};
pub use worker::{Capture, TaskOutput};
