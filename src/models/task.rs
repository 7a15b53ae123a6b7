use std::fmt;

/// Lifecycle of a caller-side task.
///
/// `Initial` and `Queued` only exist on the caller side; the worker reports
/// everything from `Running` onward. Terminal states are permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Initial,
    Queued,
    Running,
    Complete,
    Canceled,
    Failed,
}

impl TaskStatus {
    /// True for `Complete`, `Canceled` and `Failed`.
    pub fn is_finished(self) -> bool {
        self == TaskStatus::Complete || self.is_error()
    }

    /// True for `Canceled` and `Failed`.
    pub fn is_error(self) -> bool {
        matches!(self, TaskStatus::Canceled | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Initial => "INITIAL",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Canceled => "CANCELED",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest progress reported by a running task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub message: Option<String>,
    pub current: i64,
    pub maximum: i64,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            message: None,
            current: 0,
            maximum: 1,
        }
    }
}

impl Progress {
    /// Overwrites only the fields that are present.
    pub fn apply(&mut self, message: Option<String>, current: Option<i64>, maximum: Option<i64>) {
        if let Some(message) = message {
            self.message = Some(message);
        }
        if let Some(current) = current {
            self.current = current;
        }
        if let Some(maximum) = maximum {
            self.maximum = maximum;
        }
    }
}
