//! Execution client: submit, poll, wait, cancel, and stream progress.
//!
//! Built on [`ClientCore`]'s connect-or-spawn protocol. The hooks type
//! supplies what the base cannot know: how to spawn the right server
//! binary and how to serialize the caller's task type into an
//! [`ExecuteRequest`]. Progress streaming runs on a background thread
//! owning its own SUB socket, since zmq sockets must not be shared
//! across threads.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::{error, info, warn};

use crate::client::{ClientCore, CommandSpawner, ServerSpawner, CONTROL_REQUEST_TIMEOUT_MS};
use crate::config::{RuntimeConfig, TransportMode};
use crate::messages::{
    ControlRequest, ControlResponse, DataMessage, ExecuteRequest, ExecutionStatus, OkReply,
    PongResponse, ProgressUpdate, ResultsSummary, StatusRequest,
};
use crate::transport::{ping_control_full, transport_url};

/// Turns a caller-side task into a wire execute request.
pub trait TaskSerializer: Send {
    type Task;
    type Config;

    fn serialize_task(
        &self,
        task: &Self::Task,
        config: Option<&Self::Config>,
    ) -> Result<ExecuteRequest>;
}

/// Hooks for callers whose tasks already are execute requests: spawns a
/// server binary via [`CommandSpawner`] and passes requests through.
pub struct CommandHooks {
    pub spawner: CommandSpawner,
}

impl ServerSpawner for CommandHooks {
    fn spawn_server(&self, port: u16, control_port: u16) -> Result<std::process::Child> {
        self.spawner.spawn_server(port, control_port)
    }
}

impl TaskSerializer for CommandHooks {
    type Task = ExecuteRequest;
    type Config = ();

    fn serialize_task(
        &self,
        task: &ExecuteRequest,
        _config: Option<&()>,
    ) -> Result<ExecuteRequest> {
        Ok(task.clone())
    }
}

/// Terminal outcome of waiting on an execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Complete {
        execution_id: String,
        results: ResultsSummary,
    },
    Failed {
        execution_id: String,
        message: Option<String>,
    },
    Cancelled {
        execution_id: String,
        message: String,
    },
    /// The server answered the poll with an error reply.
    Error {
        execution_id: String,
        message: String,
    },
}

type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Client for execution servers.
///
/// Wraps [`ClientCore`]'s connect-or-spawn protocol with the execution
/// workflow: submit a task, poll its record, wait for a terminal state,
/// cancel, and stream progress.
///
/// ## Hooks
///
/// The type parameter supplies what the base client cannot know:
///
/// - [`ServerSpawner`]: how to launch the matching server binary when no
///   server is running on the target port
/// - [`TaskSerializer`]: how to turn the caller's task type into a wire
///   [`ExecuteRequest`]
///
/// [`CommandHooks`] covers the common case of spawning a binary and
/// submitting ready-made requests.
///
/// ## Progress Streaming
///
/// When a callback is installed via
/// [`with_progress_callback`](Self::with_progress_callback), the first
/// submission starts a background listener thread. The thread owns its
/// own SUB socket (zmq sockets must not be shared across threads),
/// subscribes with an empty filter, and invokes the callback for each
/// `progress` message. It is stopped and joined on disconnect.
///
/// ## Connection Handling
///
/// Submissions connect on demand with a 10 s readiness bound. Connection
/// loss during a wait is detected by consecutive-error counting, not by
/// exceptions crossing the I/O boundary; see
/// [`wait_for_completion`](Self::wait_for_completion).
pub struct ExecutionClient<H: ServerSpawner + TaskSerializer> {
    core: ClientCore,
    hooks: H,
    progress_callback: Option<ProgressCallback>,
    progress_stop: Arc<AtomicBool>,
    progress_thread: Option<JoinHandle<()>>,
}

impl<H: ServerSpawner + TaskSerializer> ExecutionClient<H> {
    pub fn new(
        port: u16,
        host: impl Into<String>,
        persistent: bool,
        hooks: H,
        transport_mode: Option<TransportMode>,
        config: Option<RuntimeConfig>,
    ) -> Self {
        Self {
            core: ClientCore::new(port, host, persistent, transport_mode, config),
            hooks,
            progress_callback: None,
            progress_stop: Arc::new(AtomicBool::new(false)),
            progress_thread: None,
        }
    }

    /// Install a callback invoked for every progress message; the
    /// listener thread starts on the first submission.
    pub fn with_progress_callback(
        mut self,
        callback: impl Fn(&ProgressUpdate) + Send + Sync + 'static,
    ) -> Self {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn connected_to_existing(&self) -> bool {
        self.core.connected_to_existing()
    }

    pub fn connect(&mut self, timeout: Duration) -> bool {
        self.core.connect(&self.hooks, timeout)
    }

    pub fn disconnect(&mut self) {
        self.stop_progress_listener();
        self.core.disconnect();
    }

    /// Serialize and submit a task, connecting first if needed.
    ///
    /// Starts the progress listener when a callback is installed, then
    /// serializes the task through the hooks and sends it as an
    /// `execute` request.
    ///
    /// ## Parameters
    /// - `task`: the caller-side task to submit
    /// - `config`: optional serializer configuration passed to the hooks
    ///
    /// ## Returns
    /// - `Ok(ControlResponse)`: the server's reply, normally `accepted`
    ///   with the new execution id, or an `error` reply for invalid
    ///   requests
    /// - `Err(anyhow::Error)`: connection could not be established, task
    ///   serialization failed, or the control RPC itself failed (timeout
    ///   included)
    pub fn submit_execution(
        &mut self,
        task: &H::Task,
        config: Option<&H::Config>,
    ) -> Result<ControlResponse> {
        if !self.core.is_connected() && !self.core.connect(&self.hooks, Duration::from_secs(10)) {
            bail!("Failed to connect to execution server");
        }
        if self.progress_callback.is_some() {
            self.start_progress_listener();
        }
        let request = self.hooks.serialize_task(task, config)?;
        self.core
            .send_control_request(&ControlRequest::Execute(request), CONTROL_REQUEST_TIMEOUT_MS)
    }

    pub fn poll_status(&self, execution_id: Option<&str>) -> Result<ControlResponse> {
        self.core.send_control_request(
            &ControlRequest::Status(StatusRequest {
                execution_id: execution_id.map(str::to_string),
            }),
            CONTROL_REQUEST_TIMEOUT_MS,
        )
    }

    /// Poll until the execution reaches a terminal state.
    ///
    /// ## Parameters
    /// - `execution_id`: id returned by the accepted submission
    /// - `poll_interval`: sleep between status polls
    /// - `max_consecutive_errors`: failed polls in a row before the
    ///   connection is declared lost (5 by convention)
    ///
    /// ## Returns
    ///
    /// A terminal [`ExecutionOutcome`]:
    /// - `Complete` with the results summary
    /// - `Failed` with the record's error text
    /// - `Cancelled` with a reason
    /// - `Error` when the server answered the poll with an `error` reply
    ///
    /// ## Connection-Loss Semantics
    ///
    /// Transport errors are counted, not raised: after
    /// `max_consecutive_errors` failed polls in a row the connection is
    /// considered lost and a synthetic `Cancelled` outcome with message
    /// "Lost connection to server" is returned. Any successful poll
    /// resets the counter, and each failed poll backs off one second.
    pub fn wait_for_completion(
        &self,
        execution_id: &str,
        poll_interval: Duration,
        max_consecutive_errors: u32,
    ) -> ExecutionOutcome {
        info!("Waiting for execution {} to complete", execution_id);
        let mut consecutive_errors = 0u32;

        loop {
            std::thread::sleep(poll_interval);
            match self.poll_status(Some(execution_id)) {
                Ok(response) => {
                    consecutive_errors = 0;
                    match response {
                        ControlResponse::Ok(OkReply::Execution { execution }) => {
                            match execution.status {
                                ExecutionStatus::Complete => {
                                    return ExecutionOutcome::Complete {
                                        execution_id: execution_id.to_string(),
                                        results: execution.results_summary.unwrap_or_default(),
                                    }
                                }
                                ExecutionStatus::Failed => {
                                    return ExecutionOutcome::Failed {
                                        execution_id: execution_id.to_string(),
                                        message: execution.error,
                                    }
                                }
                                ExecutionStatus::Cancelled => {
                                    return ExecutionOutcome::Cancelled {
                                        execution_id: execution_id.to_string(),
                                        message: "Execution was cancelled".to_string(),
                                    }
                                }
                                ExecutionStatus::Queued | ExecutionStatus::Running => {}
                            }
                        }
                        ControlResponse::Error { error } => {
                            return ExecutionOutcome::Error {
                                execution_id: execution_id.to_string(),
                                message: error,
                            }
                        }
                        other => {
                            warn!("Unexpected status reply: {:?}", other);
                        }
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(
                        "Error checking execution status (attempt {}/{}): {}",
                        consecutive_errors, max_consecutive_errors, e
                    );
                    if consecutive_errors >= max_consecutive_errors {
                        return ExecutionOutcome::Cancelled {
                            execution_id: execution_id.to_string(),
                            message: "Lost connection to server".to_string(),
                        };
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
    }

    /// Submit and wait in one call.
    pub fn execute(
        &mut self,
        task: &H::Task,
        config: Option<&H::Config>,
    ) -> Result<ExecutionOutcome> {
        match self.submit_execution(task, config)? {
            ControlResponse::Accepted { execution_id, .. } => {
                Ok(self.wait_for_completion(&execution_id, Duration::from_millis(500), 5))
            }
            ControlResponse::Error { error } => Ok(ExecutionOutcome::Error {
                execution_id: String::new(),
                message: error,
            }),
            other => bail!("Unexpected response to execute request: {other:?}"),
        }
    }

    pub fn cancel_execution(&self, execution_id: &str) -> Result<ControlResponse> {
        self.core.send_control_request(
            &ControlRequest::Cancel(crate::messages::CancelRequest {
                execution_id: execution_id.to_string(),
            }),
            CONTROL_REQUEST_TIMEOUT_MS,
        )
    }

    /// Whether the server answers pings and reports ready.
    pub fn ping(&self) -> bool {
        self.get_server_info().map(|pong| pong.ready).unwrap_or(false)
    }

    /// Full pong from the server, including execution and worker stats.
    pub fn get_server_info(&self) -> Option<PongResponse> {
        ping_control_full(
            self.core.port(),
            self.core.host(),
            self.core.transport_mode(),
            self.core.config(),
            1000,
        )
    }

    fn start_progress_listener(&mut self) {
        if self
            .progress_thread
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }
        let Some(callback) = self.progress_callback.clone() else {
            return;
        };
        let url = match transport_url(
            self.core.port(),
            self.core.host(),
            self.core.transport_mode(),
            self.core.config(),
        ) {
            Ok(url) => url,
            Err(e) => {
                warn!("Cannot resolve progress endpoint: {}", e);
                return;
            }
        };

        info!("Starting progress listener thread");
        self.progress_stop.store(false, Ordering::SeqCst);
        let stop = self.progress_stop.clone();
        let spawned = std::thread::Builder::new()
            .name("progress-listener".to_string())
            .spawn(move || progress_listener_loop(&url, &stop, &callback));
        match spawned {
            Ok(handle) => self.progress_thread = Some(handle),
            Err(e) => warn!("Failed to spawn progress listener: {}", e),
        }
    }

    fn stop_progress_listener(&mut self) {
        self.progress_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.progress_thread.take() {
            if handle.join().is_err() {
                error!("Progress listener thread panicked");
            }
        }
    }
}

fn progress_listener_loop(url: &str, stop: &AtomicBool, callback: &ProgressCallback) {
    info!("Progress listener loop started");
    let ctx = zmq::Context::new();
    let socket = match ctx.socket(zmq::SUB).and_then(|socket| {
        socket.set_linger(0)?;
        socket.connect(url)?;
        socket.set_subscribe(b"")?;
        Ok(socket)
    }) {
        Ok(socket) => socket,
        Err(e) => {
            error!("Progress listener setup failed: {}", e);
            return;
        }
    };

    while !stop.load(Ordering::SeqCst) {
        match socket.recv_string(zmq::DONTWAIT) {
            Ok(Ok(raw)) => {
                if let Ok(DataMessage::Progress(update)) = DataMessage::from_json(&raw) {
                    if catch_unwind(AssertUnwindSafe(|| callback(&update))).is_err() {
                        warn!("Progress callback panicked for {}", update.well_id);
                    }
                }
            }
            Ok(Err(_)) => {}
            Err(zmq::Error::EAGAIN) => std::thread::sleep(Duration::from_millis(50)),
            Err(e) => {
                warn!("Progress listener error: {}", e);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    info!("Progress listener loop exited");
}
