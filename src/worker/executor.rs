use std::collections::HashMap;

use serde_json::Value;

use crate::models::message::Args;
use crate::worker::handle::TaskHandle;

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("unknown script '{0}'")]
    UnknownScript(String),

    #[error("missing input '{0}'")]
    MissingInput(String),

    #[error("invalid input '{name}': {message}")]
    InvalidInput { name: String, message: String },

    #[error("{0}")]
    Failed(String),
}

/// Runs one script with its named inputs.
///
/// The returned value becomes the task's outputs: an object contributes all
/// of its entries, `null` contributes nothing, anything else is stored under
/// `result`.
pub trait ScriptExecutor: Send + Sync {
    fn execute(&self, script: &str, inputs: &Args, task: &TaskHandle) -> Result<Value, ScriptError>;
}

impl<F> ScriptExecutor for F
where
    F: Fn(&str, &Args, &TaskHandle) -> Result<Value, ScriptError> + Send + Sync,
{
    fn execute(&self, script: &str, inputs: &Args, task: &TaskHandle) -> Result<Value, ScriptError> {
        self(script, inputs, task)
    }
}

pub type Script = Box<dyn Fn(&Args, &TaskHandle) -> Result<Value, ScriptError> + Send + Sync>;

/// Executor that treats the script text as the name of a registered
/// function.
#[derive(Default)]
pub struct ScriptRegistry {
    scripts: HashMap<String, Script>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, script: F) -> Self
    where
        F: Fn(&Args, &TaskHandle) -> Result<Value, ScriptError> + Send + Sync + 'static,
    {
        self.scripts.insert(name.into(), Box::new(script));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.scripts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl ScriptExecutor for ScriptRegistry {
    fn execute(&self, script: &str, inputs: &Args, task: &TaskHandle) -> Result<Value, ScriptError> {
        let name = script.trim();
        let script = self
            .scripts
            .get(name)
            .ok_or_else(|| ScriptError::UnknownScript(name.to_string()))?;
        script(inputs, task)
    }
}

/// Integer input, or `default` when absent.
pub fn input_i64(inputs: &Args, name: &str, default: Option<i64>) -> Result<i64, ScriptError> {
    match inputs.get(name) {
        Some(value) => value.as_i64().ok_or_else(|| ScriptError::InvalidInput {
            name: name.to_string(),
            message: format!("expected an integer, got {value}"),
        }),
        None => default.ok_or_else(|| ScriptError::MissingInput(name.to_string())),
    }
}

pub fn input_str<'a>(inputs: &'a Args, name: &str) -> Result<&'a str, ScriptError> {
    match inputs.get(name) {
        Some(value) => value.as_str().ok_or_else(|| ScriptError::InvalidInput {
            name: name.to_string(),
            message: format!("expected a string, got {value}"),
        }),
        None => Err(ScriptError::MissingInput(name.to_string())),
    }
}
