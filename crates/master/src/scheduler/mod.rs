//! Task scheduler -- the single dispatcher between a master and its backend.
//!
//! Split into focused submodules:
//! - `core`: Scheduler struct, start/stop/join and enqueueing
//! - `execution`: the dispatch loop and per-task hand-off to the backend

mod core;
mod execution;
#[cfg(test)]
mod tests;

pub use self::core::{Dispatch, Scheduler};
