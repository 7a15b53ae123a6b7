use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// A string-keyed mapping of structured values, as carried on the wire.
pub type Args = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Execute,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseType {
    Launch,
    Update,
    Completion,
    Cancelation,
    Failure,
}

impl ResponseType {
    /// True for `Completion`, `Cancelation` and `Failure`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResponseType::Completion | ResponseType::Cancelation | ResponseType::Failure
        )
    }
}

/// Caller -> worker message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub task: String,
    #[serde(flatten)]
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "requestType", rename_all = "UPPERCASE")]
pub enum RequestBody {
    Execute {
        script: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inputs: Option<Args>,
    },
    Cancel,
}

impl RequestBody {
    pub fn request_type(&self) -> RequestType {
        match self {
            RequestBody::Execute { .. } => RequestType::Execute,
            RequestBody::Cancel => RequestType::Cancel,
        }
    }
}

/// Worker -> caller message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub task: String,
    #[serde(flatten)]
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "responseType", rename_all = "UPPERCASE")]
pub enum ResponseBody {
    Launch,
    Update {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maximum: Option<i64>,
    },
    Completion {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outputs: Option<Args>,
    },
    Cancelation,
    Failure {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ResponseBody {
    pub fn response_type(&self) -> ResponseType {
        match self {
            ResponseBody::Launch => ResponseType::Launch,
            ResponseBody::Update { .. } => ResponseType::Update,
            ResponseBody::Completion { .. } => ResponseType::Completion,
            ResponseBody::Cancelation => ResponseType::Cancelation,
            ResponseBody::Failure { .. } => ResponseType::Failure,
        }
    }
}

impl Request {
    pub fn execute(task: impl Into<String>, script: impl Into<String>, inputs: Args) -> Self {
        Self {
            task: task.into(),
            body: RequestBody::Execute {
                script: script.into(),
                inputs: Some(inputs),
            },
        }
    }

    pub fn cancel(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            body: RequestBody::Cancel,
        }
    }

    /// Interprets a decoded record. Extra keys are ignored.
    pub fn from_args(args: &Args) -> Result<Self> {
        from_args(args, "requestType")
    }
}

impl Response {
    pub fn new(task: impl Into<String>, body: ResponseBody) -> Self {
        Self {
            task: task.into(),
            body,
        }
    }

    /// Interprets a decoded record. Extra keys are ignored.
    pub fn from_args(args: &Args) -> Result<Self> {
        from_args(args, "responseType")
    }
}

fn from_args<T: for<'de> Deserialize<'de>>(args: &Args, kind_key: &str) -> Result<T> {
    match args.get("task") {
        Some(Value::String(_)) => {}
        Some(other) => return Err(Error::Protocol(format!("invalid task identifier: {other}"))),
        None => return Err(Error::Protocol("missing task identifier".to_string())),
    }
    if !args.contains_key(kind_key) {
        return Err(Error::Protocol(format!("missing {kind_key}")));
    }
    serde_json::from_value(Value::Object(args.clone()))
        .map_err(|e| Error::Protocol(format!("invalid {kind_key} message: {e}")))
}
