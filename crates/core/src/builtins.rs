//! Functions every worker knows out of the box.
//!
//! The worker binary and the local backend both start from
//! [`builtin_registry`], so a task naming one of these runs identically on
//! every backend.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::registry::FunctionRegistry;
use crate::worker::Capture;

pub const SUM: &str = "sum";
pub const PRODUCT: &str = "product";
pub const ECHO: &str = "echo";
pub const SLEEP_SUM: &str = "sleep_sum";
pub const DESCRIBE: &str = "describe";
pub const FAIL: &str = "fail";
pub const NOISY: &str = "noisy";

/// Register the built-in functions into an existing registry.
pub fn register_builtins(registry: &FunctionRegistry) {
    registry.register(SUM, &[], |values: Vec<i64>, _c: &mut Capture| {
        Ok(values.iter().sum::<i64>())
    });

    registry.register(PRODUCT, &[], |values: Vec<i64>, _c: &mut Capture| {
        Ok(values.iter().product::<i64>())
    });

    registry.register(ECHO, &[], |text: String, _c: &mut Capture| Ok(text));

    // (delay in milliseconds, values): sleeps, then sums.
    registry.register(SLEEP_SUM, &[], |(delay_ms, values): (u64, Vec<i64>), _c: &mut Capture| {
        thread::sleep(Duration::from_millis(delay_ms));
        Ok(values.iter().sum::<i64>())
    });

    registry.register(DESCRIBE, &[], |values: Vec<i64>, c: &mut Capture| {
        match (values.iter().min(), values.iter().max()) {
            (Some(min), Some(max)) => {
                c.println(&format!("count={} min={min} max={max}", values.len()))
            }
            _ => {
                c.println("count=0");
                c.eprintln("empty input");
            }
        }
        Ok(values.len() as u64)
    });

    // Writes past `Capture` straight to the process's stdout and stderr.
    registry.register(NOISY, &[], |text: String, c: &mut Capture| {
        print!("stdout: {text}");
        eprint!("stderr: {text}");
        c.println("via capture");
        Ok(text.len() as u64)
    });

    registry.register(FAIL, &[], |reason: String, _c: &mut Capture| -> Result<(), String> {
        Err(reason)
    });
}

/// A fresh registry holding only the built-ins.
pub fn builtin_registry() -> Arc<FunctionRegistry> {
    let registry = FunctionRegistry::new();
    register_builtins(&registry);
    Arc::new(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Payload;
    use crate::worker::execute;

    #[test]
    fn sum_of_small_list() {
        let registry = builtin_registry();
        let out = execute(&registry, SUM, &Payload::encode(&vec![1i64, 2, 3]).unwrap()).unwrap();
        assert_eq!(out.decode::<i64>().unwrap(), 6);
    }

    #[test]
    fn describe_captures_text() {
        let registry = builtin_registry();
        let out = execute(&registry, DESCRIBE, &Payload::encode(&Vec::<i64>::new()).unwrap()).unwrap();
        assert_eq!(out.decode::<u64>().unwrap(), 0);
        assert!(out.stdout.starts_with("count=0"));
        assert_eq!(out.stderr, "empty input\n");
    }

    #[test]
    fn fail_reports_reason() {
        let registry = builtin_registry();
        let err = execute(&registry, FAIL, &Payload::encode(&"bad seed").unwrap()).unwrap_err();
        assert_eq!(err.to_string(), "task failed: bad seed");
    }
}
