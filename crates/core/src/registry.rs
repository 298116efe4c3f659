//! Function Registry
//!
//! Maps string identifiers (e.g. "sum") to statically resolvable Rust
//! functions. Tasks name the function they want to run; the master, the
//! local thread backend and the `taskfarm-worker` binary all resolve that
//! name through a registry built the same way, so nothing has to be captured
//! or shipped across a process boundary except the name and the payload.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Payload;
use crate::error::{FarmError, FarmResult};
use crate::worker::Capture;

/// Type-erased registered function: payload in, payload out.
pub type TaskFn = Arc<dyn Fn(&Payload, &mut Capture) -> FarmResult<Payload> + Send + Sync>;

/// A function entry together with the modules or files it declares it needs.
#[derive(Clone)]
pub struct RegisteredFunction {
    pub name: String,
    /// Declared dependencies (extra files a batch job must transfer, crates a worker must link).
    pub dependencies: Vec<String>,
    func: TaskFn,
}

impl std::fmt::Debug for RegisteredFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredFunction")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// Registry holding the mapping between function names and their implementation.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, RegisteredFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed function under `name`.
    ///
    /// The input is decoded from the task payload and the output encoded
    /// back; an `Err(String)` from the function becomes a task error.
    pub fn register<I, O, F>(&self, name: &str, dependencies: &[&str], func: F)
    where
        I: DeserializeOwned,
        O: Serialize,
        F: Fn(I, &mut Capture) -> Result<O, String> + Send + Sync + 'static,
    {
        let fn_name = name.to_string();
        let erased: TaskFn = Arc::new(move |input: &Payload, capture: &mut Capture| {
            let args: I = input.decode().map_err(|e| {
                FarmError::task(format!("invalid input for '{fn_name}': {e}"))
            })?;
            let output = func(args, capture).map_err(FarmError::Task)?;
            Payload::encode(&output)
        });
        self.register_raw(name, dependencies, erased);
    }

    /// Register an already type-erased function.
    pub fn register_raw(&self, name: &str, dependencies: &[&str], func: TaskFn) {
        let entry = RegisteredFunction {
            name: name.to_string(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            func,
        };
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), entry);

        tracing::debug!(function = %name, "registered task function");
    }

    /// Look up a function by name and run it against `input`.
    ///
    /// An unknown name is an interface error: the task was routed to a
    /// worker that was never taught that function.
    pub fn call(&self, name: &str, input: &Payload, capture: &mut Capture) -> FarmResult<Payload> {
        let func = self
            .get(name)
            .map(|entry| entry.func)
            .ok_or_else(|| FarmError::interface(format!("unknown task function: {name}")))?;
        func(input, capture)
    }

    pub fn get(&self, name: &str) -> Option<RegisteredFunction> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Declared dependencies for a function, if registered.
    pub fn dependencies(&self, name: &str) -> Option<Vec<String>> {
        self.get(name).map(|entry| entry.dependencies)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
