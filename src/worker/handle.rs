use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Sender;
use log::{debug, error};
use parking_lot::Mutex;
use serde_json::Value;

use crate::models::message::{Args, Response, ResponseBody};

/// The script's view of its own task.
///
/// Every response it emits goes through the worker's single writer, so
/// lines from concurrent tasks never interleave. Once a terminal response
/// has been sent, further responses are dropped.
pub struct TaskHandle {
    id: String,
    outputs: Mutex<Args>,
    cancel_requested: AtomicBool,
    finished: AtomicBool,
    responses: Sender<Response>,
}

impl TaskHandle {
    pub(crate) fn new(id: impl Into<String>, responses: Sender<Response>) -> Self {
        Self {
            id: id.into(),
            outputs: Mutex::new(Args::new()),
            cancel_requested: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            responses,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the caller asked for this task to be canceled.
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Whether a terminal response has already been sent.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Reports progress. Absent fields leave the caller's values unchanged.
    pub fn update(&self, message: Option<&str>, current: Option<i64>, maximum: Option<i64>) {
        self.respond(ResponseBody::Update {
            message: message.map(str::to_string),
            current,
            maximum,
        });
    }

    /// Acknowledges cancellation; the task ends as CANCELED.
    pub fn cancel(&self) {
        self.respond(ResponseBody::Cancelation);
    }

    /// Ends the task as FAILED.
    pub fn fail(&self, error: impl Into<String>) {
        self.respond(ResponseBody::Failure {
            error: Some(error.into()),
        });
    }

    pub fn set_output(&self, key: impl Into<String>, value: Value) {
        self.outputs.lock().insert(key.into(), value);
    }

    pub fn outputs(&self) -> Args {
        self.outputs.lock().clone()
    }

    pub(crate) fn extend_outputs(&self, outputs: Args) {
        self.outputs.lock().extend(outputs);
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    pub(crate) fn report_launch(&self) {
        self.respond(ResponseBody::Launch);
    }

    pub(crate) fn report_completion(&self) {
        let outputs = self.outputs();
        self.respond(ResponseBody::Completion {
            outputs: Some(outputs),
        });
    }

    fn respond(&self, body: ResponseBody) {
        let terminal = body.response_type().is_terminal();
        if terminal {
            if self.finished.swap(true, Ordering::AcqRel) {
                debug!("Task '{}' already finished; dropping {:?}", self.id, body);
                return;
            }
        } else if self.is_finished() {
            debug!("Task '{}' already finished; dropping {:?}", self.id, body);
            return;
        }
        if self.responses.send(Response::new(self.id.clone(), body)).is_err() {
            error!("Task '{}': response writer is gone", self.id);
        }
    }
}
