//! taskfarm-worker: runs one registered function for an out-of-process backend.
//!
//! Reads the task input from stdin and writes the result bundle
//! (`result`, captured stdout, captured stderr) to stdout. Anything the
//! function prints directly is captured into the bundle too. On failure the
//! error goes to stderr, nothing is written to stdout, and the exit status
//! is non-zero. Logs always go to stderr so stdout stays a data channel; the
//! default filter is `warn` because the batch backend treats any stderr
//! output from a job as a task failure.

use std::io::{self, Write};

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};

use taskfarm_core::builtin_registry;
use taskfarm_core::worker::serve_stdio;

// ── CLI ─────────────────────────────────────────────────────────────

/// Task farm worker. Executes a registered function over stdin/stdout.
#[derive(Parser, Debug)]
#[command(name = "taskfarm-worker", version, about)]
struct Cli {
    /// Registered function to run.
    #[arg(required_unless_present = "list")]
    function: Option<String>,

    /// Print the registered functions and exit.
    #[arg(long)]
    list: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let registry = builtin_registry();

    if cli.list {
        let mut out = io::stdout().lock();
        for name in registry.names() {
            let deps = registry.dependencies(&name).unwrap_or_default();
            if deps.is_empty() {
                writeln!(out, "{name}")?;
            } else {
                writeln!(out, "{name} (depends on: {})", deps.join(", "))?;
            }
        }
        return Ok(());
    }

    let function = cli.function.context("no function given")?;
    debug!(function = %function, "worker starting");

    serve_stdio(&registry, &function)
        .with_context(|| format!("function '{function}' failed"))?;

    info!(function = %function, "worker finished");
    Ok(())
}
