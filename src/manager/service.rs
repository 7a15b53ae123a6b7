use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::codec;
use crate::error::{Error, Result};
use crate::manager::task::Task;
use crate::models::message::{Args, Request, Response};

static SERVICE_COUNT: AtomicUsize = AtomicUsize::new(0);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub type DebugSink = Arc<dyn Fn(&str) + Send + Sync>;

/// How to launch the worker process.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub cwd: PathBuf,
    /// Program followed by its arguments.
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

impl ServiceConfig {
    pub fn new<P, I, S>(cwd: P, args: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            cwd: cwd.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Caller-side handle owning one worker process and its task registry.
///
/// Dropping the service closes the worker's input stream.
pub struct Service {
    shared: Arc<ServiceShared>,
}

pub(crate) struct ServiceShared {
    id: usize,
    config: ServiceConfig,
    tasks: Mutex<HashMap<String, Task>>,
    process: Mutex<Option<WorkerProcess>>,
    stdin: Mutex<Option<ChildStdin>>,
    debug: RwLock<Option<DebugSink>>,
    invalid_lines: Mutex<Vec<String>>,
    error_lines: Mutex<Vec<String>>,
}

struct WorkerProcess {
    child: Child,
    stdout_thread: Option<JoinHandle<()>>,
    stderr_thread: Option<JoinHandle<()>>,
}

impl Service {
    pub fn new<P, I, S>(cwd: P, args: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self::with_config(ServiceConfig::new(cwd, args))
    }

    pub fn with_config(config: ServiceConfig) -> Self {
        Service {
            shared: Arc::new(ServiceShared {
                id: SERVICE_COUNT.fetch_add(1, Ordering::Relaxed),
                config,
                tasks: Mutex::new(HashMap::new()),
                process: Mutex::new(None),
                stdin: Mutex::new(None),
                debug: RwLock::new(None),
                invalid_lines: Mutex::new(Vec::new()),
                error_lines: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn cwd(&self) -> &Path {
        &self.shared.config.cwd
    }

    /// Registers a sink for diagnostic messages. Safe to call before
    /// `start`, so early messages are not missed.
    pub fn debug<F>(&self, sink: F) -> &Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.shared.debug.write() = Some(Arc::new(sink));
        self
    }

    /// Spawns the worker and its reader loops. Idempotent.
    pub fn start(&self) -> Result<&Self> {
        let mut process = self.shared.process.lock();
        if process.is_some() {
            return Ok(self);
        }

        let config = &self.shared.config;
        let (program, args) = config.args.split_first().ok_or(Error::EmptyArgs)?;
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&config.cwd)
            .envs(config.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::Spawn {
                program: program.to_string_lossy().into_owned(),
                source,
            })?;

        info!("Service {} started worker pid {}.", self.shared.id, child.id());

        let (stdin, stdout_thread, stderr_thread) = match self.attach(&mut child) {
            Ok(attached) => attached,
            Err(e) => {
                error!("Service {} could not attach to its worker: {}", self.shared.id, e);
                discard(&mut child);
                return Err(e);
            }
        };

        *self.shared.stdin.lock() = Some(stdin);
        *process = Some(WorkerProcess {
            child,
            stdout_thread: Some(stdout_thread),
            stderr_thread: Some(stderr_thread),
        });
        Ok(self)
    }

    /// Takes the child's pipes and starts both reader loops.
    fn attach(&self, child: &mut Child) -> Result<(ChildStdin, JoinHandle<()>, JoinHandle<()>)> {
        let stdin = child.stdin.take().ok_or(Error::Pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(Error::Pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(Error::Pipe("stderr"))?;

        let prefix = format!("taskpipe-service-{}", self.shared.id);
        let shared = Arc::clone(&self.shared);
        let stdout_thread = thread::Builder::new()
            .name(format!("{prefix}-stdout"))
            .spawn(move || shared.stdout_loop(stdout))?;
        let shared = Arc::clone(&self.shared);
        let stderr_thread = thread::Builder::new()
            .name(format!("{prefix}-stderr"))
            .spawn(move || shared.stderr_loop(stderr))?;
        Ok((stdin, stdout_thread, stderr_thread))
    }

    /// Creates a task for `script`, starting the worker if needed. The task
    /// is not sent until it is started.
    pub fn task(&self, script: impl Into<String>, inputs: Option<Args>) -> Result<Task> {
        self.start()?;
        Ok(Task::new(
            Arc::clone(&self.shared),
            script.into(),
            inputs.unwrap_or_default(),
        ))
    }

    /// Closes the worker's input stream, which the worker treats as the
    /// shutdown signal. In-flight tasks still run to completion.
    pub fn close(&self) {
        if self.shared.stdin.lock().take().is_some() {
            self.shared.debug_service("<worker stdin closed>");
        }
    }

    /// Forcibly terminates the worker.
    pub fn kill(&self) -> Result<()> {
        let mut process = self.shared.process.lock();
        let process = process.as_mut().ok_or(Error::NotStarted)?;
        process.child.kill()?;
        Ok(())
    }

    /// Sends SIGTERM to the worker.
    #[cfg(unix)]
    pub fn terminate(&self) -> Result<()> {
        let process = self.shared.process.lock();
        let process = process.as_ref().ok_or(Error::NotStarted)?;
        let pid = process.child.id() as libc::pid_t;
        // SAFETY: plain syscall on a pid we spawned; no memory is shared.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Waits for the worker to exit and both reader loops to drain, then
    /// returns the exit code (`-1` when killed by a signal).
    pub fn wait_for(&self) -> Result<i32> {
        let (stdout_thread, stderr_thread) = {
            let mut process = self.shared.process.lock();
            let process = process.as_mut().ok_or(Error::NotStarted)?;
            (process.stdout_thread.take(), process.stderr_thread.take())
        };
        for handle in [stdout_thread, stderr_thread].into_iter().flatten() {
            if handle.join().is_err() {
                error!("Service {} reader loop panicked", self.shared.id);
            }
        }

        // `kill`, `send` and `is_alive` share this lock; never block on it.
        let status = loop {
            {
                let mut process = self.shared.process.lock();
                let process = process.as_mut().ok_or(Error::NotStarted)?;
                if let Some(status) = process.child.try_wait()? {
                    break status;
                }
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        };
        let code = status.code().unwrap_or(-1);
        self.shared
            .debug_service("<worker process termination detected>");
        if code != 0 {
            self.shared.debug_service(&format!(
                "<worker process terminated with exit code {code}>"
            ));
        }
        let pending = self.pending_tasks();
        if pending > 0 {
            warn!(
                "Service {} worker exited with {} pending task(s).",
                self.shared.id, pending
            );
            self.shared.debug_service(&format!(
                "<worker process terminated with {pending} pending task{}>",
                if pending == 1 { "" } else { "s" }
            ));
        }
        Ok(code)
    }

    /// True while the worker process is running.
    pub fn is_alive(&self) -> bool {
        let mut process = self.shared.process.lock();
        match process.as_mut() {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Number of tasks awaiting a terminal response.
    pub fn pending_tasks(&self) -> usize {
        self.shared.tasks.lock().len()
    }

    /// Stdout lines that could not be decoded.
    pub fn invalid_lines(&self) -> Vec<String> {
        self.shared.invalid_lines.lock().clone()
    }

    /// Every line the worker wrote to stderr.
    pub fn error_lines(&self) -> Vec<String> {
        self.shared.error_lines.lock().clone()
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> Arc<ServiceShared> {
        Arc::clone(&self.shared)
    }
}

/// Kills and reaps a worker that will not be tracked.
fn discard(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("Failed to kill worker pid {}: {}", child.id(), e);
    }
    if let Err(e) = child.wait() {
        warn!("Failed to reap worker pid {}: {}", child.id(), e);
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.close();
    }
}

impl ServiceShared {
    pub(crate) fn register(&self, task: Task) {
        self.tasks.lock().insert(task.id().to_string(), task);
    }

    pub(crate) fn unregister(&self, id: &str) {
        self.tasks.lock().remove(id);
    }

    /// Writes one request to the worker and flushes it.
    pub(crate) fn send(&self, request: &Request) -> Result<()> {
        let started = self.process.lock().is_some();
        let mut stdin = self.stdin.lock();
        let stdin = stdin.as_mut().ok_or(if started {
            Error::StdinClosed
        } else {
            Error::NotStarted
        })?;
        let line = codec::write_record(stdin, request).map_err(|e| {
            error!("Service {} failed to send request: {}", self.id, e);
            e
        })?;
        self.debug_service(line.trim_end());
        Ok(())
    }

    fn stdout_loop(&self, stdout: impl Read) {
        let mut reader = BufReader::new(stdout);
        while let Some(line) = self.read_line(&mut reader, "stdout") {
            self.handle_line(&line);
        }
        self.debug_service("<worker stdout closed>");
    }

    fn stderr_loop(&self, stderr: impl Read) {
        let mut reader = BufReader::new(stderr);
        while let Some(line) = self.read_line(&mut reader, "stderr") {
            self.debug_worker(&line);
            self.error_lines.lock().push(line);
        }
        self.debug_service("<worker stderr closed>");
    }

    /// Next line without its terminator; `None` at end of stream.
    fn read_line(&self, reader: &mut impl BufRead, stream: &str) -> Option<String> {
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => None,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                Some(line.trim_end_matches(['\n', '\r']).to_string())
            }
            Err(e) => {
                self.debug_service(&format!("<worker {stream} read failed: {e}>"));
                None
            }
        }
    }

    /// Decodes one stdout line and routes it to its task.
    pub(crate) fn handle_line(&self, line: &str) {
        let args = match codec::decode(line) {
            Ok(args) => args,
            Err(e) => {
                warn!("Service {}: undecodable worker output: {}", self.id, e);
                self.debug_service(&format!("<INVALID> {line}"));
                self.invalid_lines.lock().push(line.to_string());
                return;
            }
        };
        self.debug_service(line);

        let response = match Response::from_args(&args) {
            Ok(response) => response,
            Err(e) => {
                warn!("Service {}: {}", self.id, e);
                self.debug_service(&format!("Invalid service message ({e}): {line}"));
                return;
            }
        };

        let task = self.tasks.lock().get(&response.task).cloned();
        match task {
            Some(task) => task.handle(response.body),
            None => self.debug_service(&format!("No such task: {}", response.task)),
        }
    }

    pub(crate) fn debug_service(&self, message: &str) {
        self.debug("SERVICE", message);
    }

    fn debug_worker(&self, message: &str) {
        self.debug("WORKER", message);
    }

    fn debug(&self, prefix: &str, message: &str) {
        let sink = self.debug.read().clone();
        if let Some(sink) = sink {
            sink(&format!("[{prefix}-{}] {message}", self.id));
        }
    }
}
