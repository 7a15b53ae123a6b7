use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use taskpipe::{Args, Error, ResponseType, Service, ServiceConfig, Task, TaskEvent, TaskStatus};

const WORKER: &str = env!("CARGO_BIN_EXE_taskpipe-worker");

fn service() -> Service {
    Service::new(env!("CARGO_MANIFEST_DIR"), [WORKER])
}

fn inputs(value: Value) -> Option<Args> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct Seen {
    task: String,
    kind: ResponseType,
    status: TaskStatus,
    message: Option<String>,
    current: i64,
}

fn record(task: &Task) -> Arc<Mutex<Vec<Seen>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    task.listen(move |event: &TaskEvent| {
        sink.lock().unwrap().push(Seen {
            task: event.task.id().to_string(),
            kind: event.response_type,
            status: event.task.status(),
            message: event.task.message(),
            current: event.task.current(),
        });
    })
    .unwrap();
    seen
}

fn collect_debug(service: &Service) -> Arc<Mutex<Vec<String>>> {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&messages);
    service.debug(move |msg| sink.lock().unwrap().push(msg.to_string()));
    messages
}

fn kinds(seen: &[Seen]) -> Vec<ResponseType> {
    seen.iter().map(|s| s.kind).collect()
}

#[test]
fn collatz_reports_every_step() {
    let service = service();
    let task = service.task("collatz", None).unwrap();
    let seen = record(&task);

    assert_eq!(task.wait_for().unwrap(), TaskStatus::Complete);
    assert_eq!(task.result(), Some(json!(91)));
    assert_eq!(service.pending_tasks(), 0);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 93);

    assert_eq!(seen[0].kind, ResponseType::Launch);
    assert_eq!(seen[0].status, TaskStatus::Running);

    let mut v: i64 = 9999;
    for i in 0..91 {
        v = if v % 2 == 0 { v / 2 } else { 3 * v + 1 };
        let update = &seen[i + 1];
        assert_eq!(update.kind, ResponseType::Update);
        assert_eq!(update.status, TaskStatus::Running);
        assert_eq!(update.message.as_deref(), Some(format!("[{i}] -> {v}").as_str()));
        assert_eq!(update.current, i as i64);
    }
    assert_eq!(seen[91].current, 90);

    let completion = &seen[92];
    assert_eq!(completion.kind, ResponseType::Completion);
    assert_eq!(completion.status, TaskStatus::Complete);
    assert_eq!(completion.message, seen[91].message);
    assert_eq!(task.error(), None);
}

#[test]
fn cooperative_cancellation() {
    let service = service();
    let task = service.task("wait_for_cancel", None).unwrap();
    let seen = record(&task);

    task.start().unwrap();
    task.cancel().unwrap();

    assert_eq!(task.wait_for().unwrap(), TaskStatus::Canceled);
    assert!(task.outputs().is_empty());
    assert_eq!(service.pending_tasks(), 0);

    let kinds = kinds(&seen.lock().unwrap());
    assert_eq!(kinds.first(), Some(&ResponseType::Launch));
    assert_eq!(kinds.last(), Some(&ResponseType::Cancelation));
    assert_eq!(kinds.iter().filter(|k| k.is_terminal()).count(), 1);
    assert!(!kinds.contains(&ResponseType::Completion));

    let err = task.check().unwrap_err();
    assert_eq!(err.status, TaskStatus::Canceled);
    assert!(err.to_string().starts_with("Task canceled: "));
}

#[test]
fn script_failure_is_reported() {
    let service = service();
    let task = service.task("fail", None).unwrap();
    let seen = record(&task);

    assert_eq!(task.wait_for().unwrap(), TaskStatus::Failed);
    assert_eq!(
        kinds(&seen.lock().unwrap()),
        vec![ResponseType::Launch, ResponseType::Update, ResponseType::Failure]
    );
    let error = task.error().unwrap_or_default();
    assert!(error.contains("deliberate failure"));
    assert!(task.outputs().is_empty());
    assert_eq!(service.pending_tasks(), 0);

    // The worker survives and keeps serving.
    let next = service.task("collatz", inputs(json!({"start": 6}))).unwrap();
    assert_eq!(next.wait_for().unwrap(), TaskStatus::Complete);
    assert_eq!(next.result(), Some(json!(8)));
}

#[test]
fn script_panic_is_a_failure() {
    let service = service();
    let task = service.task("panic", None).unwrap();
    assert_eq!(task.wait_for().unwrap(), TaskStatus::Failed);
    assert!(task
        .error()
        .unwrap_or_default()
        .contains("script panicked on purpose"));
}

#[test]
fn unknown_script_is_a_failure() {
    let service = service();
    let task = service.task("no such script", None).unwrap();
    assert_eq!(task.wait_for().unwrap(), TaskStatus::Failed);
    assert!(task.check().is_err());
}

#[test]
fn concurrent_tasks_are_routed_by_identifier() {
    let service = service();
    let a = service.task("collatz", inputs(json!({"start": 9999}))).unwrap();
    let b = service.task("collatz", inputs(json!({"start": 27}))).unwrap();
    let seen_a = record(&a);
    let seen_b = record(&b);

    a.start().unwrap();
    b.start().unwrap();
    assert_eq!(b.wait_for().unwrap(), TaskStatus::Complete);
    assert_eq!(a.wait_for().unwrap(), TaskStatus::Complete);

    assert_eq!(a.result(), Some(json!(91)));
    assert_eq!(b.result(), Some(json!(111)));

    for (task, seen, updates) in [(&a, &seen_a, 91), (&b, &seen_b, 111)] {
        let seen = seen.lock().unwrap();
        assert!(seen.iter().all(|s| s.task == task.id()));
        assert_eq!(seen.len(), updates + 2);
        assert_eq!(seen[0].kind, ResponseType::Launch);
        assert_eq!(seen.last().map(|s| s.kind), Some(ResponseType::Completion));
        assert_eq!(
            seen.iter().filter(|s| s.kind == ResponseType::Update).count(),
            updates
        );
    }
    assert_eq!(service.pending_tasks(), 0);
}

#[test]
fn panicking_listener_does_not_stall_other_tasks() {
    let service = service();
    let messages = collect_debug(&service);

    let a = service.task("echo", inputs(json!({"x": 1}))).unwrap();
    a.listen(|event: &TaskEvent| {
        if event.response_type == ResponseType::Launch {
            panic!("listener failed on launch");
        }
    })
    .unwrap();
    assert_eq!(a.wait_for().unwrap(), TaskStatus::Complete);

    let b = service.task("sleep", inputs(json!({"millis": 300}))).unwrap();
    assert_eq!(b.wait_for().unwrap(), TaskStatus::Complete);
    assert_eq!(service.pending_tasks(), 0);

    service.close();
    service.wait_for().unwrap();
    let id = service.id();
    let messages = messages.lock().unwrap();
    assert!(messages
        .iter()
        .any(|m| m.contains("panicked: listener failed on launch")));
    assert!(messages.contains(&format!("[SERVICE-{id}] <worker stdout closed>")));
}

#[test]
fn mapping_results_become_outputs() {
    let service = service();
    let task = service
        .task("echo", inputs(json!({"name": "ada", "tags": [1, {"k": null}]})))
        .unwrap();
    task.wait_for().unwrap();
    let outputs = task.outputs();
    assert_eq!(outputs.get("name"), Some(&json!("ada")));
    assert_eq!(outputs.get("tags"), Some(&json!([1, {"k": null}])));
    assert_eq!(task.result(), None);
}

#[test]
fn usage_errors_are_synchronous() {
    let service = service();
    let task = service.task("collatz", inputs(json!({"start": 1}))).unwrap();
    task.start().unwrap();

    assert!(matches!(task.start(), Err(Error::InvalidState { .. })));
    assert!(matches!(task.listen(|_| {}), Err(Error::InvalidState { .. })));
    assert_eq!(task.wait_for().unwrap(), TaskStatus::Complete);
    assert_eq!(task.result(), Some(json!(0)));
}

#[test]
fn cancel_before_start_is_ignored_by_the_worker() {
    let config = ServiceConfig::new(env!("CARGO_MANIFEST_DIR"), [WORKER]).env("RUST_LOG", "warn");
    let service = Service::with_config(config);
    let messages = collect_debug(&service);
    let task = service.task("collatz", inputs(json!({"start": 3}))).unwrap();

    task.cancel().unwrap();
    assert_eq!(task.status(), TaskStatus::Initial);

    // The task can still be started and runs to completion.
    assert_eq!(task.wait_for().unwrap(), TaskStatus::Complete);
    assert_eq!(task.result(), Some(json!(7)));

    service.close();
    assert_eq!(service.wait_for().unwrap(), 0);

    let expected = format!("No such task: {}", task.id());
    let worker_prefix = format!("[WORKER-{}] ", service.id());
    assert!(messages
        .lock()
        .unwrap()
        .iter()
        .any(|m| m.starts_with(&worker_prefix) && m.contains(&expected)));
}

#[test]
fn stderr_and_stray_stdout_are_captured() {
    let service = service();
    let messages = collect_debug(&service);
    let task = service.task("chatter", None).unwrap();
    assert_eq!(task.wait_for().unwrap(), TaskStatus::Complete);

    service.close();
    service.wait_for().unwrap();

    assert_eq!(service.invalid_lines(), vec!["two".to_string()]);
    let errors = service.error_lines();
    let one = errors.iter().position(|l| l == "one");
    let three = errors.iter().position(|l| l == "three");
    assert!(one.is_some() && three.is_some() && one < three);

    let id = service.id();
    let messages = messages.lock().unwrap();
    assert!(messages.contains(&format!("[WORKER-{id}] one")));
    assert!(messages.contains(&format!("[SERVICE-{id}] <INVALID> two")));
    assert!(messages.contains(&format!("[SERVICE-{id}] <worker stdout closed>")));
    assert!(messages.contains(&format!("[SERVICE-{id}] <worker stderr closed>")));
}

#[test]
fn worker_runs_in_configured_directory_and_environment() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServiceConfig::new(dir.path(), [WORKER]).env("TASKPIPE_PROBE", "hello");
    let service = Service::with_config(config);

    let cwd = service.task("cwd", None).unwrap();
    assert_eq!(cwd.wait_for().unwrap(), TaskStatus::Complete);
    let reported = cwd.result().and_then(|v| v.as_str().map(str::to_string)).unwrap();
    assert_eq!(
        std::fs::canonicalize(reported).unwrap(),
        std::fs::canonicalize(dir.path()).unwrap()
    );

    let env = service
        .task("env", inputs(json!({"name": "TASKPIPE_PROBE"})))
        .unwrap();
    env.wait_for().unwrap();
    assert_eq!(env.result(), Some(json!("hello")));
}

#[test]
fn close_lets_pending_tasks_finish() {
    let service = service();
    let task = service.task("sleep", inputs(json!({"millis": 200}))).unwrap();
    task.start().unwrap();
    service.close();

    assert_eq!(task.wait_for().unwrap(), TaskStatus::Complete);
    assert_eq!(service.wait_for().unwrap(), 0);
    assert!(!service.is_alive());

    let late = service.task("collatz", None).unwrap();
    assert!(matches!(late.start(), Err(Error::StdinClosed)));
}

#[test]
fn killed_worker_leaves_tasks_pending() {
    let service = service();
    let messages = collect_debug(&service);
    let task = service.task("wait_for_cancel", None).unwrap();
    let (running_tx, running_rx) = mpsc::channel();
    let running_tx = Mutex::new(running_tx);
    task.listen(move |event: &TaskEvent| {
        if event.response_type == ResponseType::Update {
            let _ = running_tx.lock().unwrap().send(());
        }
    })
    .unwrap();
    task.start().unwrap();
    running_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(service.is_alive());

    service.kill().unwrap();
    assert_ne!(service.wait_for().unwrap(), 0);

    // No terminal response is synthesized on disconnect.
    assert_eq!(task.status(), TaskStatus::Running);
    assert_eq!(service.pending_tasks(), 1);
    assert!(messages
        .lock()
        .unwrap()
        .iter()
        .any(|m| m.contains("terminated with 1 pending task>")));
}

#[test]
fn spawn_failure_is_reported() {
    let service = Service::new(env!("CARGO_MANIFEST_DIR"), ["/nonexistent/taskpipe-worker"]);
    assert!(matches!(service.start(), Err(Error::Spawn { .. })));
    assert!(!service.is_alive());
}
