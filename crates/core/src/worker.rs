//! Worker-side execution contract.
//!
//! An out-of-process worker reads exactly one serialized input from its input
//! channel, runs the named registered function, and writes a [`TaskOutput`]
//! bundle (result plus any text the function produced) to its output channel.
//! On failure nothing is written to the output channel; the caller reports
//! the error on stderr and exits with a non-zero status.

use std::fmt::Write as _;
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::Payload;
use crate::error::{FarmError, FarmResult};
use crate::redirect::StdioCapture;
use crate::registry::FunctionRegistry;

/// Text a function writes while it runs.
///
/// Functions receive a `&mut Capture` instead of printing, so the output
/// channel stays reserved for the result bundle.
#[derive(Debug, Default, Clone)]
pub struct Capture {
    stdout: String,
    stderr: String,
}

impl Capture {
    /// Buffer standing in for standard output (`writeln!(capture.out(), ..)`).
    pub fn out(&mut self) -> &mut String {
        &mut self.stdout
    }

    /// Buffer standing in for standard error.
    pub fn err(&mut self) -> &mut String {
        &mut self.stderr
    }

    pub fn println(&mut self, line: &str) {
        let _ = writeln!(self.stdout, "{line}");
    }

    pub fn eprintln(&mut self, line: &str) {
        let _ = writeln!(self.stderr, "{line}");
    }

    pub fn into_parts(self) -> (String, String) {
        (self.stdout, self.stderr)
    }
}

/// The bundle a worker writes to its output channel, and the output a
/// finished task hands back to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub result: Payload,
    pub stdout: String,
    pub stderr: String,
}

impl TaskOutput {
    /// Decode the function's return value.
    pub fn decode<T: DeserializeOwned>(&self) -> FarmResult<T> {
        self.result.decode()
    }

    pub fn to_payload(&self) -> FarmResult<Payload> {
        Payload::encode(self)
    }

    pub fn from_payload(payload: &Payload) -> FarmResult<Self> {
        payload.decode()
    }
}

/// Run a registered function in-process, capturing its text and turning a
/// panic into a task error.
pub fn execute(registry: &FunctionRegistry, function: &str, input: &Payload) -> FarmResult<TaskOutput> {
    let mut capture = Capture::default();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        registry.call(function, input, &mut capture)
    }));

    let result = match outcome {
        Ok(result) => result?,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            return Err(FarmError::task(format!("function '{function}' panicked: {message}")));
        }
    };

    let (stdout, stderr) = capture.into_parts();
    Ok(TaskOutput {
        result,
        stdout,
        stderr,
    })
}

/// Serve one task over the given channels.
pub fn serve<R: Read, W: Write>(
    registry: &FunctionRegistry,
    function: &str,
    mut input: R,
    mut output: W,
) -> FarmResult<()> {
    let mut bytes = Vec::new();
    input.read_to_end(&mut bytes)?;
    let payload = Payload::from_bytes(bytes);

    let bundle = execute(registry, function, &payload)?;
    write_bundle(&bundle, &mut output)
}

/// Serve one task over this process's own stdin and stdout.
///
/// Text the function writes directly to fd 1 or fd 2 is captured and
/// appended to the bundle's `stdout`/`stderr`, so it can neither corrupt the
/// output channel nor show up as job error output. On failure the captured
/// stderr is passed through to the real stderr ahead of the error.
pub fn serve_stdio(registry: &FunctionRegistry, function: &str) -> FarmResult<()> {
    let mut bytes = Vec::new();
    io::stdin().lock().read_to_end(&mut bytes)?;
    let payload = Payload::from_bytes(bytes);

    let stdio = StdioCapture::start()?;
    let outcome = execute(registry, function, &payload);
    let (stray_out, stray_err) = stdio.finish()?;

    let mut bundle = match outcome {
        Ok(bundle) => bundle,
        Err(e) => {
            let _ = io::stderr().write_all(stray_err.as_bytes());
            return Err(e);
        }
    };
    bundle.stdout.push_str(&stray_out);
    bundle.stderr.push_str(&stray_err);
    write_bundle(&bundle, &mut io::stdout().lock())
}

fn write_bundle<W: Write>(bundle: &TaskOutput, output: &mut W) -> FarmResult<()> {
    output.write_all(bundle.to_payload()?.as_bytes())?;
    output.flush()?;
    Ok(())
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> FunctionRegistry {
        let registry = FunctionRegistry::new();
        registry.register("chatty_len", &[], |items: Vec<i64>, c: &mut Capture| {
            c.println(&format!("got {} items", items.len()));
            c.eprintln("warning: nothing to see");
            Ok(items.len() as u64)
        });
        registry.register("explode", &[], |_x: i64, _c: &mut Capture| -> Result<i64, String> {
            panic!("kaboom")
        });
        registry
    }

    #[test]
    fn serve_writes_bundle_with_captured_text() {
        let registry = registry();
        let input = Payload::encode(&vec![4i64, 5, 6]).unwrap();
        let mut out = Vec::new();

        serve(&registry, "chatty_len", input.as_bytes(), &mut out).unwrap();

        let bundle = TaskOutput::from_payload(&Payload::from_bytes(out)).unwrap();
        assert_eq!(bundle.decode::<u64>().unwrap(), 3);
        assert_eq!(bundle.stdout, "got 3 items\n");
        assert_eq!(bundle.stderr, "warning: nothing to see\n");
    }

    #[test]
    fn serve_failure_writes_nothing() {
        let registry = registry();
        let input = Payload::encode(&1i64).unwrap();
        let mut out = Vec::new();

        let err = serve(&registry, "missing", input.as_bytes(), &mut out).unwrap_err();
        assert!(err.is_interface_error());
        assert!(out.is_empty());
    }

    #[test]
    fn panic_becomes_task_error() {
        let registry = registry();
        let err = execute(&registry, "explode", &Payload::encode(&1i64).unwrap()).unwrap_err();
        assert!(err.is_task_error());
        assert!(err.to_string().contains("kaboom"));
    }
}
