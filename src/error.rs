use std::any::Any;
use std::io;

use crate::models::task::TaskStatus;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("worker launch arguments are empty")]
    EmptyArgs,

    #[error("worker {0} pipe is unavailable")]
    Pipe(&'static str),

    #[error("service has not been started")]
    NotStarted,

    #[error("worker input stream is closed")]
    StdinClosed,

    #[error("service has been dropped")]
    ServiceDropped,

    #[error("task is not in the INITIAL state (status: {status})")]
    InvalidState { status: TaskStatus },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A task that finished without completing.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Task {}: {}", .status.as_str().to_lowercase(), .message)]
pub struct TaskError {
    pub task: String,
    pub status: TaskStatus,
    pub message: String,
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
