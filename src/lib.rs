//! Drive script execution inside a separate worker process over a
//! line-delimited JSON protocol on the worker's stdin/stdout.
//!
//! The caller side is [`Service`] and [`Task`]; the worker side is
//! [`Worker`], which runs scripts through a pluggable [`ScriptExecutor`].
//!
//! ```no_run
//! use taskpipe::{Service, TaskStatus};
//!
//! let service = Service::new(".", ["taskpipe-worker"]);
//! let task = service.task("collatz", None)?;
//! task.listen(|event| println!("{:?}", event.response_type))?;
//! assert_eq!(task.wait_for()?, TaskStatus::Complete);
//! # Ok::<(), taskpipe::Error>(())
//! ```

pub mod codec;
pub mod error;
pub mod manager;
pub mod models;
pub mod worker;

pub use error::{Error, Result, TaskError};
pub use manager::service::{Service, ServiceConfig};
pub use manager::task::{Task, TaskEvent};
pub use models::message::{Args, Request, RequestBody, RequestType, Response, ResponseBody, ResponseType};
pub use models::task::{Progress, TaskStatus};
pub use worker::executor::{ScriptError, ScriptExecutor, ScriptRegistry};
pub use worker::handle::TaskHandle;
pub use worker::worker::Worker;
