use std::collections::HashMap;
use std::error::Error as StdError;
use std::io::{BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver};
use log::{error, info, warn};
use serde_json::Value;

use crate::codec;
use crate::error::{panic_message, Result};
use crate::models::message::{Args, Request, RequestBody, Response};
use crate::worker::executor::ScriptExecutor;
use crate::worker::handle::TaskHandle;

/// Worker side of the protocol: reads requests, runs each script on its own
/// thread, and writes responses.
pub struct Worker<E> {
    executor: Arc<E>,
}

impl<E: ScriptExecutor + 'static> Worker<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor: Arc::new(executor),
        }
    }

    /// Serves requests from `input` until end of input or a blank line, then
    /// waits for every running task to finish before returning.
    pub fn run<R, W>(&self, mut input: R, output: W) -> Result<()>
    where
        R: BufRead,
        W: Write + Send + 'static,
    {
        let (responses, outbox) = unbounded::<Response>();
        let writer = thread::Builder::new()
            .name("taskpipe-worker-writer".to_string())
            .spawn(move || write_loop(outbox, output))?;

        let mut tasks: HashMap<String, Arc<TaskHandle>> = HashMap::new();
        let mut units: Vec<JoinHandle<()>> = Vec::new();

        let mut read_error = None;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match input.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    error!("Failed to read request: {}", e);
                    read_error = Some(e);
                    break;
                }
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            if line.trim().is_empty() {
                break;
            }
            tasks.retain(|_, task| !task.is_finished());
            units.retain(|unit| !unit.is_finished());

            let request = match codec::decode(line).and_then(|args| Request::from_args(&args)) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Invalid request ({}): {}", e, line);
                    continue;
                }
            };

            info!(
                "Received {:?} for task '{}'.",
                request.body.request_type(),
                request.task
            );
            match request.body {
                RequestBody::Execute { script, inputs } => {
                    let task = Arc::new(TaskHandle::new(request.task.clone(), responses.clone()));
                    tasks.insert(request.task.clone(), Arc::clone(&task));
                    info!("Starting task '{}'.", request.task);

                    let executor = Arc::clone(&self.executor);
                    let unit = Arc::clone(&task);
                    let spawned = thread::Builder::new()
                        .name(format!("taskpipe-{}", request.task))
                        .spawn(move || {
                            execute_task(executor.as_ref(), &script, &inputs.unwrap_or_default(), &unit)
                        });
                    match spawned {
                        Ok(handle) => units.push(handle),
                        Err(e) => {
                            error!("Failed to spawn task '{}': {}", request.task, e);
                            task.fail(format!("failed to spawn execution thread: {e}"));
                        }
                    }
                }
                RequestBody::Cancel => match tasks.get(&request.task) {
                    Some(task) => {
                        info!("Cancel requested for task '{}'.", request.task);
                        task.request_cancel();
                    }
                    None => warn!("No such task: {}", request.task),
                },
            }
        }

        for unit in units {
            if unit.join().is_err() {
                error!("Execution thread panicked outside its script");
            }
        }
        drop(tasks);
        drop(responses);
        if writer.join().is_err() {
            error!("Response writer panicked");
        }
        match read_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

fn write_loop<W: Write>(outbox: Receiver<Response>, mut output: W) {
    for response in outbox {
        if let Err(e) = codec::write_record(&mut output, &response) {
            error!("Failed to write response for task '{}': {}", response.task, e);
            break;
        }
    }
}

/// Runs one script and reports its outcome: LAUNCH first, then exactly one
/// terminal response unless the script already sent one itself.
fn execute_task<E: ScriptExecutor + ?Sized>(executor: &E, script: &str, inputs: &Args, task: &TaskHandle) {
    task.report_launch();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(script, inputs, task)));
    match outcome {
        Ok(Ok(result)) => {
            match result {
                Value::Object(outputs) => task.extend_outputs(outputs),
                Value::Null => {}
                other => task.set_output("result", other),
            }
            task.report_completion();
        }
        Ok(Err(e)) => task.fail(describe_error(&e)),
        Err(payload) => task.fail(format!("script panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn describe_error(e: &dyn StdError) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        text.push_str("\ncaused by: ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
