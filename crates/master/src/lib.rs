pub mod backend;
pub mod completion;
pub mod master;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod status;
pub mod task;

pub use backend::{Backend, BackendStatus, BatchBackend, LocalBackend, ProcessBackend, WorkerToken};
pub use master::{Collected, Master};
pub use queue::SyncQueue;
pub use scheduler::Scheduler;
pub use state::StateStore;
pub use status::{DurationStats, MasterStatus, TaskCounts};
pub use task::{Executable, Outcome, Task, TaskHandle, TaskRecord, TaskState, Wait};
