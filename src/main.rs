//! `taskpipe-worker`: serves the taskpipe protocol on stdin/stdout with a set
//! of built-in named scripts. Diagnostics go to stderr; `RUST_LOG` sets the
//! level (default `warn`).

use std::io;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use taskpipe::worker::executor::{input_i64, input_str};
use taskpipe::{Args, ScriptError, ScriptRegistry, TaskHandle, Worker};

fn main() -> ExitCode {
    init_logging();

    let stdin = io::stdin();
    match Worker::new(scripts()).run(stdin.lock(), io::stdout()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Worker stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // stdout carries the protocol, so logs must stay on stderr. The fmt
    // subscriber also captures `log` records.
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .try_init();
    if let Err(e) = installed {
        eprintln!("taskpipe-worker: logging unavailable: {e}");
    }
}

fn scripts() -> ScriptRegistry {
    ScriptRegistry::new()
        .register("collatz", collatz)
        .register("echo", |inputs, _task| Ok(Value::Object(inputs.clone())))
        .register("sleep", |inputs, _task| {
            let millis = input_i64(inputs, "millis", Some(100))?;
            thread::sleep(Duration::from_millis(millis.max(0) as u64));
            Ok(json!(millis))
        })
        .register("wait_for_cancel", wait_for_cancel)
        .register("fail", |_inputs, task| {
            task.update(Some("about to fail"), None, None);
            Err(ScriptError::Failed("deliberate failure".to_string()))
        })
        .register("panic", |_inputs, _task| panic!("script panicked on purpose"))
        .register("chatter", |_inputs, _task| {
            eprintln!("one");
            println!("two");
            eprintln!("three");
            Ok(Value::Null)
        })
        .register("cwd", |_inputs, _task| {
            let cwd = std::env::current_dir()
                .map_err(|e| ScriptError::Failed(format!("current_dir: {e}")))?;
            Ok(json!(cwd.to_string_lossy()))
        })
        .register("env", |inputs, _task| {
            let name = input_str(inputs, "name")?;
            Ok(std::env::var(name).map(Value::String).unwrap_or(Value::Null))
        })
}

/// Stopping time of the Collatz sequence from `start` (default 9999),
/// reporting every step.
fn collatz(inputs: &Args, task: &TaskHandle) -> Result<Value, ScriptError> {
    let mut v = input_i64(inputs, "start", Some(9999))?;
    if v < 1 {
        return Err(ScriptError::InvalidInput {
            name: "start".to_string(),
            message: format!("must be positive, got {v}"),
        });
    }
    let mut time = 0;
    while v != 1 {
        v = if v % 2 == 0 { v / 2 } else { 3 * v + 1 };
        task.update(Some(&format!("[{time}] -> {v}")), Some(time), None);
        time += 1;
    }
    Ok(json!(time))
}

/// Reports progress until the caller cancels, then acknowledges. Fails if no
/// cancel arrives within `timeout_ms` (default 30s).
fn wait_for_cancel(inputs: &Args, task: &TaskHandle) -> Result<Value, ScriptError> {
    let timeout = input_i64(inputs, "timeout_ms", Some(30_000))?;
    let deadline = Instant::now() + Duration::from_millis(timeout.max(0) as u64);
    task.update(Some("waiting for cancel"), Some(0), Some(1));
    while Instant::now() < deadline {
        if task.cancel_requested() {
            task.cancel();
            return Ok(Value::Null);
        }
        thread::sleep(Duration::from_millis(5));
    }
    Err(ScriptError::Failed("timed out waiting for cancel".to_string()))
}
