//! End-to-end tests for the execution server and client over TCP.
//!
//! Each test gets its own fixed localhost port pair so tests can run in
//! parallel threads without colliding.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde_json::json;

use zmqruntime::client::execution::TaskSerializer;
use zmqruntime::client::ServerSpawner;
use zmqruntime::server::execution::{ExecutionContext, ExecutionServer, TaskExecutor, TaskOutput};
use zmqruntime::{
    run_server, ControlRequest, ControlResponse, ExecuteRequest, ExecutionClient,
    ExecutionOutcome, ServerOptions, TaskError, TransportMode,
};

/// Test executor: records invocation order, tracks concurrency, sleeps.
struct TestExecutor {
    delay: Duration,
    invoked: Arc<Mutex<Vec<String>>>,
    concurrent: Arc<AtomicUsize>,
    max_concurrent: Arc<AtomicUsize>,
}

impl TestExecutor {
    fn new(delay: Duration) -> (Self, Arc<Mutex<Vec<String>>>, Arc<AtomicUsize>) {
        let invoked = Arc::new(Mutex::new(Vec::new()));
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        (
            Self {
                delay,
                invoked: invoked.clone(),
                concurrent: Arc::new(AtomicUsize::new(0)),
                max_concurrent: max_concurrent.clone(),
            },
            invoked,
            max_concurrent,
        )
    }
}

impl TaskExecutor for TestExecutor {
    fn execute_task(
        &self,
        _execution_id: &str,
        request: &ExecuteRequest,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput, TaskError> {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        self.invoked.lock().unwrap().push(request.plate_id.clone());

        ctx.send_progress_update(&request.plate_id, "process", "running");
        std::thread::sleep(self.delay);
        ctx.send_progress_update(&request.plate_id, "process", "complete");

        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        let mut out: TaskOutput = BTreeMap::new();
        out.insert("A1".to_string(), json!(1));
        out.insert("A2".to_string(), json!(2));
        Ok(out)
    }
}

/// Client hooks for tests that attach to a pre-started in-process server.
struct AttachOnlyHooks;

impl ServerSpawner for AttachOnlyHooks {
    fn spawn_server(&self, port: u16, _control_port: u16) -> Result<std::process::Child> {
        Err(anyhow!("test expected a running server on port {port}"))
    }
}

impl TaskSerializer for AttachOnlyHooks {
    type Task = ExecuteRequest;
    type Config = ();

    fn serialize_task(&self, task: &ExecuteRequest, _config: Option<&()>) -> Result<ExecuteRequest> {
        Ok(task.clone())
    }
}

fn start_server(port: u16, executor: impl TaskExecutor + 'static) -> std::thread::JoinHandle<()> {
    let options = ServerOptions {
        port: Some(port),
        host: "127.0.0.1".to_string(),
        transport_mode: Some(TransportMode::Tcp),
        ..Default::default()
    };
    let mut server = ExecutionServer::new(&options, Arc::new(executor));
    std::thread::spawn(move || {
        run_server(&mut server, Duration::from_millis(5)).expect("server event loop");
    })
}

fn wait_ready(port: u16) {
    assert!(
        zmqruntime::transport::wait_for_server_ready(
            port,
            "127.0.0.1",
            TransportMode::Tcp,
            &zmqruntime::RuntimeConfig::default(),
            Duration::from_secs(10),
        ),
        "test server on port {port} did not become ready"
    );
}

fn attach_client(port: u16) -> ExecutionClient<AttachOnlyHooks> {
    wait_ready(port);
    let mut client = ExecutionClient::new(
        port,
        "127.0.0.1",
        true,
        AttachOnlyHooks,
        Some(TransportMode::Tcp),
        None,
    );
    assert!(client.connect(Duration::from_secs(5)), "connect to test server");
    assert!(client.connected_to_existing());
    client
}

fn request(plate_id: &str) -> ExecuteRequest {
    let mut params = serde_json::Map::new();
    params.insert("x".to_string(), json!(1));
    ExecuteRequest {
        plate_id: plate_id.to_string(),
        pipeline_code: "noop".to_string(),
        config_params: Some(params),
        ..Default::default()
    }
}

/// ForceShutdown stops the event loop; the server thread then joins.
fn shut_down(port: u16, handle: std::thread::JoinHandle<()>) {
    let core = zmqruntime::ClientCore::new(port, "127.0.0.1", true, Some(TransportMode::Tcp), None);
    let response = core.send_control_request(&ControlRequest::ForceShutdown, 3000);
    assert!(matches!(response, Ok(ControlResponse::ShutdownAck { .. })));
    handle.join().expect("server thread");
}

#[test]
fn test_submit_and_complete() {
    // The task sleeps long enough that its final progress update lands
    // after the listener's subscription is established.
    let port = 7811;
    let handle = start_server(port, TestExecutor::new(Duration::from_millis(500)).0);
    wait_ready(port);

    let progress_seen = Arc::new(Mutex::new(Vec::new()));
    let progress_sink = progress_seen.clone();
    let mut client = ExecutionClient::new(
        port,
        "127.0.0.1",
        true,
        AttachOnlyHooks,
        Some(TransportMode::Tcp),
        None,
    )
    .with_progress_callback(move |update| {
        progress_sink.lock().unwrap().push(update.clone());
    });
    assert!(client.connect(Duration::from_secs(5)));

    let response = client.submit_execution(&request("P1"), None).unwrap();
    let execution_id = match response {
        ControlResponse::Accepted {
            execution_id,
            message,
        } => {
            assert!(message.contains("queued"));
            execution_id
        }
        other => panic!("expected accepted, got {other:?}"),
    };

    let outcome = client.wait_for_completion(&execution_id, Duration::from_millis(100), 5);
    match outcome {
        ExecutionOutcome::Complete {
            execution_id: id,
            results,
        } => {
            assert_eq!(id, execution_id);
            assert_eq!(results.well_count, 2);
            assert_eq!(results.wells, vec!["A1".to_string(), "A2".to_string()]);
        }
        other => panic!("expected complete, got {other:?}"),
    }

    // Progress published on the data channel reached the listener thread.
    let deadline = Instant::now() + Duration::from_secs(2);
    while progress_seen.lock().unwrap().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    let seen = progress_seen.lock().unwrap();
    assert!(!seen.is_empty(), "expected progress updates");
    assert!(seen.iter().all(|u| u.well_id == "P1" && u.step == "process"));
    drop(seen);

    // Pong augmentation reflects the finished state.
    let pong = client.get_server_info().unwrap();
    assert_eq!(pong.active_executions, Some(0));
    assert!(pong.uptime.unwrap() >= 0.0);

    shut_down(port, handle);
    client.disconnect();
}

#[test]
fn test_validation_error_reply() {
    let port = 7812;
    let handle = start_server(port, TestExecutor::new(Duration::from_millis(1)).0);
    let mut client = attach_client(port);

    let invalid = ExecuteRequest {
        plate_id: String::new(),
        ..Default::default()
    };
    match client.submit_execution(&invalid, None).unwrap() {
        ControlResponse::Error { error } => {
            assert_eq!(error, "Missing required field: plate_id")
        }
        other => panic!("expected error, got {other:?}"),
    }

    shut_down(port, handle);
    client.disconnect();
}

#[test]
fn test_cancel_while_queued_skips_execution() {
    let port = 7813;
    let (executor, invoked, _) = TestExecutor::new(Duration::from_millis(1500));
    let handle = start_server(port, executor);
    let mut client = attach_client(port);

    // A occupies the worker; B waits in the queue.
    let id_a = match client.submit_execution(&request("A"), None).unwrap() {
        ControlResponse::Accepted { execution_id, .. } => execution_id,
        other => panic!("expected accepted, got {other:?}"),
    };
    // Give the worker a moment to dequeue A before B is cancelled.
    std::thread::sleep(Duration::from_millis(300));
    let id_b = match client.submit_execution(&request("B"), None).unwrap() {
        ControlResponse::Accepted { execution_id, .. } => execution_id,
        other => panic!("expected accepted, got {other:?}"),
    };

    match client.cancel_execution(&id_b).unwrap() {
        ControlResponse::Ok(zmqruntime::messages::OkReply::Cancelled { .. }) => {}
        other => panic!("expected cancelled ok, got {other:?}"),
    }

    // A runs to completion; B never reaches the executor.
    match client.wait_for_completion(&id_a, Duration::from_millis(100), 5) {
        ExecutionOutcome::Complete { .. } => {}
        other => panic!("expected A complete, got {other:?}"),
    }
    match client.wait_for_completion(&id_b, Duration::from_millis(50), 5) {
        ExecutionOutcome::Cancelled { message, .. } => {
            assert_eq!(message, "Execution was cancelled")
        }
        other => panic!("expected B cancelled, got {other:?}"),
    }
    assert_eq!(invoked.lock().unwrap().as_slice(), ["A".to_string()]);

    shut_down(port, handle);
    client.disconnect();
}

#[test]
fn test_fifo_order_and_single_worker() {
    let port = 7814;
    let (executor, invoked, max_concurrent) = TestExecutor::new(Duration::from_millis(150));
    let handle = start_server(port, executor);
    let mut client = attach_client(port);

    let mut ids = Vec::new();
    for plate in ["s1", "s2", "s3"] {
        match client.submit_execution(&request(plate), None).unwrap() {
            ControlResponse::Accepted { execution_id, .. } => ids.push(execution_id),
            other => panic!("expected accepted, got {other:?}"),
        }
    }

    for id in &ids {
        match client.wait_for_completion(id, Duration::from_millis(50), 5) {
            ExecutionOutcome::Complete { .. } => {}
            other => panic!("expected complete, got {other:?}"),
        }
    }

    // Submission order is execution order, one at a time.
    assert_eq!(
        invoked.lock().unwrap().as_slice(),
        ["s1".to_string(), "s2".to_string(), "s3".to_string()]
    );
    assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);

    // Summary lists all three, in submission order.
    match client.poll_status(None).unwrap() {
        ControlResponse::Ok(zmqruntime::messages::OkReply::Summary {
            active_executions,
            executions,
            ..
        }) => {
            assert_eq!(active_executions, 3);
            assert_eq!(executions, ids);
        }
        other => panic!("expected summary, got {other:?}"),
    }

    shut_down(port, handle);
    client.disconnect();
}

#[test]
fn test_failed_task_reported() {
    struct ExplodingExecutor;

    impl TaskExecutor for ExplodingExecutor {
        fn execute_task(
            &self,
            _execution_id: &str,
            _request: &ExecuteRequest,
            _ctx: &ExecutionContext,
        ) -> Result<TaskOutput, TaskError> {
            Err(TaskError::Failed(anyhow!("segmentation step blew up")))
        }
    }

    let port = 7815;
    let handle = start_server(port, ExplodingExecutor);
    let mut client = attach_client(port);

    let id = match client.submit_execution(&request("P1"), None).unwrap() {
        ControlResponse::Accepted { execution_id, .. } => execution_id,
        other => panic!("expected accepted, got {other:?}"),
    };
    match client.wait_for_completion(&id, Duration::from_millis(50), 5) {
        ExecutionOutcome::Failed { message, .. } => {
            assert_eq!(message.as_deref(), Some("segmentation step blew up"))
        }
        other => panic!("expected failed, got {other:?}"),
    }

    shut_down(port, handle);
    client.disconnect();
}

#[test]
fn test_lost_connection_synthesizes_cancelled() {
    // No server at all: every poll times out, and after enough
    // consecutive failures the client reports a synthetic cancelled
    // outcome.
    let client = ExecutionClient::new(
        7816,
        "127.0.0.1",
        true,
        AttachOnlyHooks,
        Some(TransportMode::Tcp),
        None,
    );
    let started = Instant::now();
    match client.wait_for_completion("e-ghost", Duration::from_millis(10), 2) {
        ExecutionOutcome::Cancelled { message, .. } => {
            assert_eq!(message, "Lost connection to server")
        }
        other => panic!("expected cancelled, got {other:?}"),
    }
    // Two polls at the 5 s control timeout plus backoff, well under a minute.
    assert!(started.elapsed() < Duration::from_secs(30));
}
