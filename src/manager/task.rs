use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use log::{error, info, warn};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;

use crate::error::{panic_message, Error, Result, TaskError};
use crate::manager::service::ServiceShared;
use crate::models::message::{Args, Request, ResponseBody, ResponseType};
use crate::models::task::{Progress, TaskStatus};

pub type Listener = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

/// Delivered to listeners after a response has been applied to its task.
#[derive(Clone)]
pub struct TaskEvent {
    pub task: Task,
    pub response_type: ResponseType,
}

impl fmt::Debug for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEvent")
            .field("task", &self.task.id())
            .field("response_type", &self.response_type)
            .finish()
    }
}

/// Caller-side future for one remote script execution.
///
/// Cheap to clone; all clones observe the same state.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    id: String,
    service: Weak<ServiceShared>,
    script: String,
    inputs: Args,
    state: Mutex<TaskState>,
    settled: Condvar,
    listeners: Mutex<Vec<Listener>>,
}

struct TaskState {
    status: TaskStatus,
    outputs: Args,
    progress: Progress,
    error: Option<String>,
    // Set once listeners have seen the terminal event.
    done: bool,
}

impl Task {
    /// Creates a task and registers it with `service`.
    pub(crate) fn new(service: Arc<ServiceShared>, script: String, inputs: Args) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let task = Task {
            inner: Arc::new(TaskInner {
                id: id.clone(),
                service: Arc::downgrade(&service),
                script,
                inputs,
                state: Mutex::new(TaskState {
                    status: TaskStatus::Initial,
                    outputs: Args::new(),
                    progress: Progress::default(),
                    error: None,
                    done: false,
                }),
                settled: Condvar::new(),
                listeners: Mutex::new(Vec::new()),
            }),
        };
        service.register(task.clone());
        info!("Task '{}' created.", id);
        task
    }

    /// Sends the script to the worker. Only valid from `Initial`.
    pub fn start(&self) -> Result<&Self> {
        let service = self.service()?;
        {
            let mut state = self.inner.state.lock();
            if state.status != TaskStatus::Initial {
                return Err(Error::InvalidState {
                    status: state.status,
                });
            }
            state.status = TaskStatus::Queued;
        }

        let request = Request::execute(
            self.inner.id.clone(),
            self.inner.script.clone(),
            self.inner.inputs.clone(),
        );
        service.send(&request)?;
        Ok(self)
    }

    /// Registers a listener. Only valid from `Initial`, so no event can be
    /// missed.
    pub fn listen<F>(&self, listener: F) -> Result<&Self>
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        let state = self.inner.state.lock();
        if state.status != TaskStatus::Initial {
            return Err(Error::InvalidState {
                status: state.status,
            });
        }
        self.inner.listeners.lock().push(Arc::new(listener));
        Ok(self)
    }

    /// Asks the worker to cancel. Advisory: the script decides whether to
    /// honor it.
    pub fn cancel(&self) -> Result<()> {
        self.service()?
            .send(&Request::cancel(self.inner.id.clone()))
    }

    /// Blocks until the task reaches a terminal status, starting it first if
    /// needed. Returns the terminal status.
    pub fn wait_for(&self) -> Result<TaskStatus> {
        if self.status() == TaskStatus::Initial {
            match self.start() {
                Ok(_) | Err(Error::InvalidState { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let mut state = self.inner.state.lock();
        while !state.done {
            self.inner.settled.wait(&mut state);
        }
        Ok(state.status)
    }

    /// Turns a terminal non-complete status into an error.
    pub fn check(&self) -> std::result::Result<&Self, TaskError> {
        let state = self.inner.state.lock();
        if state.status.is_error() {
            return Err(TaskError {
                task: self.inner.id.clone(),
                status: state.status,
                message: state
                    .error
                    .clone()
                    .unwrap_or_else(|| "No error message available".to_string()),
            });
        }
        Ok(self)
    }

    fn service(&self) -> Result<Arc<ServiceShared>> {
        self.inner.service.upgrade().ok_or(Error::ServiceDropped)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn script(&self) -> &str {
        &self.inner.script
    }

    pub fn inputs(&self) -> &Args {
        &self.inner.inputs
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.state.lock().status
    }

    /// Snapshot of the outputs; populated only on completion.
    pub fn outputs(&self) -> Args {
        self.inner.state.lock().outputs.clone()
    }

    /// Shorthand for the `result` output.
    pub fn result(&self) -> Option<Value> {
        self.inner.state.lock().outputs.get("result").cloned()
    }

    pub fn progress(&self) -> Progress {
        self.inner.state.lock().progress.clone()
    }

    pub fn message(&self) -> Option<String> {
        self.inner.state.lock().progress.message.clone()
    }

    pub fn current(&self) -> i64 {
        self.inner.state.lock().progress.current
    }

    pub fn maximum(&self) -> i64 {
        self.inner.state.lock().progress.maximum
    }

    pub fn error(&self) -> Option<String> {
        self.inner.state.lock().error.clone()
    }

    /// Applies one response from the worker. Runs on the stdout reader
    /// thread.
    pub(crate) fn handle(&self, body: ResponseBody) {
        let response_type = body.response_type();
        let service = self.inner.service.upgrade();
        if response_type.is_terminal() {
            if let Some(service) = &service {
                service.unregister(&self.inner.id);
            }
        }

        {
            let mut state = self.inner.state.lock();
            if state.status.is_finished() {
                warn!(
                    "Task '{}' already {}; dropping {:?}",
                    self.inner.id, state.status, response_type
                );
                return;
            }
            match body {
                ResponseBody::Launch => state.status = TaskStatus::Running,
                ResponseBody::Update {
                    message,
                    current,
                    maximum,
                } => state.progress.apply(message, current, maximum),
                ResponseBody::Completion { outputs } => {
                    state.status = TaskStatus::Complete;
                    if let Some(outputs) = outputs {
                        state.outputs.extend(outputs);
                    }
                }
                ResponseBody::Cancelation => state.status = TaskStatus::Canceled,
                ResponseBody::Failure { error } => {
                    state.status = TaskStatus::Failed;
                    state.error = error;
                }
            }
            if response_type.is_terminal() {
                info!("Task '{}' finished: {}", self.inner.id, state.status);
            }
        }

        let event = TaskEvent {
            task: self.clone(),
            response_type,
        };
        let listeners = self.inner.listeners.lock().clone();
        for listener in &listeners {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                let message = panic_message(payload.as_ref());
                error!(
                    "Listener for task '{}' panicked on {:?}: {}",
                    self.inner.id, response_type, message
                );
                if let Some(service) = &service {
                    service.debug_service(&format!(
                        "Listener for task {} panicked: {message}",
                        self.inner.id
                    ));
                }
            }
        }

        if response_type.is_terminal() {
            let mut state = self.inner.state.lock();
            state.done = true;
            self.inner.settled.notify_all();
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("status", &state.status)
            .field("error", &state.error)
            .finish()
    }
}
