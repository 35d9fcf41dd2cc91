//! Queue-based execution server.
//!
//! Submissions arrive on the control channel, are recorded and enqueued,
//! and run one at a time on a single background worker thread. Progress
//! flows out through a bounded queue that the event loop drains onto the
//! data socket. Cancellation is cooperative-via-termination: records are
//! marked cancelled and every supervised worker process is killed; a task
//! that dies of worker loss after its record was cancelled counts as a
//! normal cancellation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::TaskError;
use crate::messages::{
    CancelRequest, ControlRequest, ControlResponse, DataMessage, ExecuteRequest, ExecutionRecord,
    ExecutionStatus, OkReply, PongResponse, ProgressUpdate, ResultsSummary, RunningExecution,
    StatusRequest,
};
use crate::process::WorkerSupervisor;
use crate::server::{
    register_server_type, ControlHandler, DataSocketKind, RuntimeServer, ServerCore, ServerFlags,
    ServerOptions,
};
use crate::utils::epoch_secs;

/// Progress updates buffered between worker and event loop.
const PROGRESS_QUEUE_CAPACITY: usize = 1000;

/// Result of a task: a well id to result-value mapping.
pub type TaskOutput = BTreeMap<String, serde_json::Value>;

/// The work a concrete execution server actually performs.
///
/// Invoked on the queue worker thread, one task at a time; the trait is
/// the seam between the generic queueing machinery and the actual
/// pipeline logic.
///
/// ## Contract
///
/// - Spawn helper processes only through the context's supervisor, so
///   cancellation can reach them.
/// - Report progress through the context; updates fan out on the data
///   channel.
/// - Return the per-well result mapping on success; the server digests
///   it into the record's results summary.
///
/// ## Error Conditions
///
/// - `TaskError::WorkerInterrupted`: the task's worker processes died
///   underneath it. When a cancellation was pending, the server resolves
///   the record to `cancelled` instead of `failed`.
/// - `TaskError::Failed`: any other failure; the text lands verbatim in
///   the record's `error` field.
pub trait TaskExecutor: Send + Sync {
    fn execute_task(
        &self,
        execution_id: &str,
        request: &ExecuteRequest,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput, TaskError>;
}

/// Capabilities handed to a running task.
pub struct ExecutionContext {
    workers: Arc<WorkerSupervisor>,
    progress: Sender<ProgressUpdate>,
}

impl ExecutionContext {
    /// Supervisor owning this server's worker processes.
    pub fn workers(&self) -> &WorkerSupervisor {
        &self.workers
    }

    /// Queue a progress update for publication on the data channel.
    pub fn send_progress_update(&self, well_id: &str, step: &str, status: &str) {
        send_progress(&self.progress, well_id, step, status);
    }
}

fn send_progress(progress: &Sender<ProgressUpdate>, well_id: &str, step: &str, status: &str) {
    let update = ProgressUpdate {
        well_id: well_id.to_string(),
        step: step.to_string(),
        status: status.to_string(),
        timestamp: epoch_secs(),
    };
    match progress.try_send(update) {
        Ok(()) => {}
        Err(TrySendError::Full(update)) => {
            warn!("Progress queue full, dropping update for {}", update.well_id);
        }
        Err(TrySendError::Disconnected(_)) => {
            debug!("Progress queue disconnected");
        }
    }
}

#[derive(Default)]
struct Ledger {
    records: HashMap<String, ExecutionRecord>,
    order: Vec<String>,
    cancel_requested: HashSet<String>,
}

/// Record store shared between the control handler and the queue worker.
///
/// Every status change goes through [`ExecutionRecord::transition`] under
/// the ledger lock, which serializes cancellation against the worker and
/// makes terminal states absorbing.
struct ExecutionState {
    ledger: Mutex<Ledger>,
    started_at: Mutex<Option<f64>>,
}

impl ExecutionState {
    fn new() -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            started_at: Mutex::new(None),
        }
    }

    fn mark_started(&self) {
        let mut started_at = self.started_at.lock();
        if started_at.is_none() {
            *started_at = Some(epoch_secs());
        }
    }

    fn uptime(&self) -> f64 {
        match *self.started_at.lock() {
            Some(started) => epoch_secs() - started,
            None => 0.0,
        }
    }

    fn insert(&self, record: ExecutionRecord) {
        let mut ledger = self.ledger.lock();
        ledger.order.push(record.execution_id.clone());
        ledger.records.insert(record.execution_id.clone(), record);
    }

    fn snapshot(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.ledger.lock().records.get(execution_id).cloned()
    }

    fn status_of(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.ledger
            .lock()
            .records
            .get(execution_id)
            .map(|r| r.status)
    }

    fn transition(&self, execution_id: &str, next: ExecutionStatus) -> bool {
        let mut ledger = self.ledger.lock();
        ledger
            .records
            .get_mut(execution_id)
            .map(|r| r.transition(next))
            .unwrap_or(false)
    }

    fn complete(&self, execution_id: &str, summary: ResultsSummary) -> bool {
        let mut ledger = self.ledger.lock();
        ledger.cancel_requested.remove(execution_id);
        let Some(record) = ledger.records.get_mut(execution_id) else {
            return false;
        };
        if record.transition(ExecutionStatus::Complete) {
            record.results_summary = Some(summary);
            true
        } else {
            false
        }
    }

    fn fail(&self, execution_id: &str, error: String) -> bool {
        let mut ledger = self.ledger.lock();
        ledger.cancel_requested.remove(execution_id);
        let Some(record) = ledger.records.get_mut(execution_id) else {
            return false;
        };
        if record.transition(ExecutionStatus::Failed) {
            record.error = Some(error);
            true
        } else {
            false
        }
    }

    /// Cancel everything active; returns how many records were affected.
    ///
    /// Queued records become cancelled immediately. A running record only
    /// gets a pending-cancel mark: killing its workers is the actual
    /// cancellation mechanism, and the worker wrapper resolves the record
    /// to cancelled when the task dies of worker loss. A task with no
    /// workers to lose runs to completion.
    fn cancel_active(&self) -> usize {
        let mut ledger = self.ledger.lock();
        let mut affected = 0;
        let mut running = Vec::new();
        for record in ledger.records.values_mut() {
            match record.status {
                ExecutionStatus::Queued => {
                    record.transition(ExecutionStatus::Cancelled);
                    info!("[{}] Cancelled", record.execution_id);
                    affected += 1;
                }
                ExecutionStatus::Running => {
                    running.push(record.execution_id.clone());
                    affected += 1;
                }
                _ => {}
            }
        }
        for execution_id in running {
            info!("[{}] Cancellation requested while running", execution_id);
            ledger.cancel_requested.insert(execution_id);
        }
        affected
    }

    fn cancel_requested(&self, execution_id: &str) -> bool {
        self.ledger.lock().cancel_requested.contains(execution_id)
    }

    fn resolve_cancelled(&self, execution_id: &str) -> bool {
        let mut ledger = self.ledger.lock();
        ledger.cancel_requested.remove(execution_id);
        ledger
            .records
            .get_mut(execution_id)
            .map(|r| r.transition(ExecutionStatus::Cancelled))
            .unwrap_or(false)
    }

    fn total(&self) -> usize {
        self.ledger.lock().records.len()
    }

    fn ids(&self) -> Vec<String> {
        self.ledger.lock().order.clone()
    }

    fn count_queued(&self) -> usize {
        self.ledger
            .lock()
            .records
            .values()
            .filter(|r| r.status == ExecutionStatus::Queued)
            .count()
    }

    fn running_summaries(&self) -> Vec<RunningExecution> {
        let now = epoch_secs();
        self.ledger
            .lock()
            .records
            .values()
            .filter(|r| r.status == ExecutionStatus::Running)
            .map(|r| {
                let start_time = r.start_time.unwrap_or(0.0);
                RunningExecution {
                    execution_id: r.execution_id.clone(),
                    plate_id: r.plate_id.clone(),
                    start_time,
                    elapsed: if start_time > 0.0 { now - start_time } else { 0.0 },
                }
            })
            .collect()
    }
}

struct QueuedExecution {
    execution_id: String,
    request: ExecuteRequest,
}

struct ExecutionHandler {
    state: Arc<ExecutionState>,
    executor: Arc<dyn TaskExecutor>,
    workers: Arc<WorkerSupervisor>,
    flags: Arc<ServerFlags>,
    queue_tx: Sender<QueuedExecution>,
    progress_tx: Sender<ProgressUpdate>,
}

impl ExecutionHandler {
    fn handle_execute(&mut self, request: ExecuteRequest) -> ControlResponse {
        if let Some(reason) = request.validate() {
            return ControlResponse::error(reason);
        }

        let execution_id = Uuid::new_v4().to_string();
        self.state.insert(ExecutionRecord::new(
            execution_id.clone(),
            request.plate_id.clone(),
            request.client_address.clone(),
        ));

        if self
            .queue_tx
            .send(QueuedExecution {
                execution_id: execution_id.clone(),
                request,
            })
            .is_err()
        {
            return ControlResponse::error("Execution queue unavailable");
        }
        let position = self.queue_tx.len();
        info!("[{}] Queued for execution (position: {})", execution_id, position);

        ControlResponse::Accepted {
            execution_id,
            message: format!("Execution queued (position: {position})"),
        }
    }

    fn handle_status(&self, request: StatusRequest) -> ControlResponse {
        match request.execution_id {
            Some(execution_id) => match self.state.snapshot(&execution_id) {
                Some(execution) => ControlResponse::Ok(OkReply::Execution { execution }),
                None => ControlResponse::error(format!("Execution {execution_id} not found")),
            },
            None => ControlResponse::Ok(OkReply::Summary {
                active_executions: self.state.total(),
                uptime: self.state.uptime(),
                executions: self.state.ids(),
            }),
        }
    }

    fn handle_cancel(&mut self, request: CancelRequest) -> ControlResponse {
        if let Some(reason) = request.validate() {
            return ControlResponse::error(reason);
        }
        if self.state.snapshot(&request.execution_id).is_none() {
            return ControlResponse::error(format!(
                "Execution {} not found",
                request.execution_id
            ));
        }

        // One running job at a time means cancellation is fleet-wide: mark
        // everything active cancelled, then kill all spawned workers.
        self.state.cancel_active();
        let killed = self.workers.kill_all();
        info!(
            "[{}] Cancelled - killed {} workers",
            request.execution_id, killed
        );
        ControlResponse::Ok(OkReply::Cancelled {
            workers_killed: killed,
            message: format!("Cancelled - killed {killed} workers"),
        })
    }

    fn shutdown_workers(&mut self, force: bool) -> ControlResponse {
        self.state.cancel_active();
        let killed = self.workers.kill_all();
        if force {
            self.flags.running.store(false, Ordering::SeqCst);
        }
        let message = format!(
            "Workers killed ({}), server {}",
            killed,
            if force { "shutting down" } else { "alive" }
        );
        info!("{}", message);
        ControlResponse::ShutdownAck {
            status: "success".to_string(),
            message,
        }
    }
}

impl ControlHandler for ExecutionHandler {
    fn handle(&mut self, request: ControlRequest) -> ControlResponse {
        match request {
            // Pings are resolved by the server core before dispatch.
            ControlRequest::Ping => ControlResponse::error("ping is handled before dispatch"),
            ControlRequest::Execute(request) => self.handle_execute(request),
            ControlRequest::Status(request) => self.handle_status(request),
            ControlRequest::Cancel(request) => self.handle_cancel(request),
            ControlRequest::Shutdown => self.shutdown_workers(false),
            ControlRequest::ForceShutdown => self.shutdown_workers(true),
        }
    }

    fn augment_pong(&self, pong: PongResponse) -> PongResponse {
        let running = self.state.running_summaries();
        let queued = self.state.count_queued();
        PongResponse {
            active_executions: Some(running.len() + queued),
            running_executions: Some(running),
            workers: Some(self.workers.worker_info()),
            uptime: Some(self.state.uptime()),
            ..pong
        }
    }
}

/// Dual-channel server with a FIFO queue and one sequential worker.
///
/// ## Architecture
///
/// - **Event-loop thread** (the host driving
///   [`process_messages`](Self::process_messages)): owns the sockets,
///   answers control turns, drains the progress queue onto the PUB
///   socket.
/// - **Queue worker thread** (one per server): dequeues submissions with
///   a 1 s timeout and runs them through the [`TaskExecutor`], one at a
///   time.
/// - **Worker supervisor**: owns every helper process a task spawns, so
///   cancellation and cleanup can reap them.
///
/// ## Queue Semantics
///
/// The submission queue is unbounded FIFO; load never rejects a valid
/// request, and jobs start in submission order. A record cancelled while
/// queued is skipped by the worker without invoking the executor.
/// Anything still queued when the server shuts down is drained and
/// marked cancelled.
///
/// ## Progress Fan-Out
///
/// Tasks push updates into a bounded queue (capacity 1000, drop-on-full
/// with a warning); each event-loop tick publishes the backlog as JSON
/// on the data socket.
pub struct ExecutionServer {
    core: ServerCore,
    handler: ExecutionHandler,
    progress_rx: Receiver<ProgressUpdate>,
    queue_rx: Receiver<QueuedExecution>,
    worker_thread: Option<JoinHandle<()>>,
}

impl ExecutionServer {
    pub fn new(options: &ServerOptions, executor: Arc<dyn TaskExecutor>) -> Self {
        let core = ServerCore::new("ExecutionServer", DataSocketKind::Publish, options);
        let (queue_tx, queue_rx) = unbounded();
        let (progress_tx, progress_rx) = bounded(PROGRESS_QUEUE_CAPACITY);
        let handler = ExecutionHandler {
            state: Arc::new(ExecutionState::new()),
            executor,
            workers: Arc::new(WorkerSupervisor::new()),
            flags: core.flags(),
            queue_tx,
            progress_tx,
        };
        Self {
            core,
            handler,
            progress_rx,
            queue_rx,
            worker_thread: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.core.port()
    }

    pub fn control_port(&self) -> u16 {
        self.core.control_port()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    /// Bind sockets and start the queue worker thread.
    ///
    /// ## Returns
    /// - `Ok(())`: the server accepts submissions and the worker is live
    /// - `Err(anyhow::Error)`: a socket bind failed or the worker thread
    ///   could not be spawned
    pub fn start(&mut self) -> Result<()> {
        self.core.start()?;
        self.handler.state.mark_started();
        self.start_queue_worker()
    }

    fn start_queue_worker(&mut self) -> Result<()> {
        if self.worker_thread.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        let flags = self.core.flags();
        let state = self.handler.state.clone();
        let queue_rx = self.queue_rx.clone();
        let executor = self.handler.executor.clone();
        let workers = self.handler.workers.clone();
        let progress_tx = self.handler.progress_tx.clone();
        let handle = std::thread::Builder::new()
            .name("exec-queue-worker".to_string())
            .spawn(move || queue_worker(flags, state, queue_rx, executor, workers, progress_tx))
            .context("failed to spawn queue worker thread")?;
        self.worker_thread = Some(handle);
        info!("Started execution queue worker thread");
        Ok(())
    }

    /// Close sockets; the worker thread drains and exits on its own.
    pub fn stop(&mut self) {
        self.core.stop();
        // The worker observes the cleared running flag within its 1 s
        // dequeue timeout; a task in flight finishes its cleanup first, so
        // the handle is dropped rather than joined.
        self.worker_thread = None;
    }

    /// One event-loop tick: a control turn, then publish queued progress.
    pub fn process_messages(&mut self) {
        self.core.process_control(&mut self.handler);
        self.drain_progress();
    }

    /// Queue a progress update for publication on the data channel.
    pub fn send_progress_update(&self, well_id: &str, step: &str, status: &str) {
        send_progress(&self.handler.progress_tx, well_id, step, status);
    }

    fn drain_progress(&self) {
        while let Ok(update) = self.progress_rx.try_recv() {
            let message = DataMessage::Progress(update);
            match message.to_json() {
                Ok(json) => {
                    if let Err(e) = self.core.publish_json(&json) {
                        warn!("Failed to send progress: {}", e);
                        break;
                    }
                }
                Err(e) => warn!("Failed to encode progress: {}", e),
            }
        }
    }
}

impl RuntimeServer for ExecutionServer {
    fn server_type(&self) -> &'static str {
        "execution"
    }

    fn start(&mut self) -> Result<()> {
        ExecutionServer::start(self)
    }

    fn stop(&mut self) {
        ExecutionServer::stop(self)
    }

    fn process_messages(&mut self) {
        ExecutionServer::process_messages(self)
    }

    fn is_running(&self) -> bool {
        ExecutionServer::is_running(self)
    }
}

/// Register the execution server kind under the `"execution"` tag.
pub fn register_execution_server<F>(executor_factory: F)
where
    F: Fn() -> Arc<dyn TaskExecutor> + Send + Sync + 'static,
{
    register_server_type("execution", move |options| {
        Ok(Box::new(ExecutionServer::new(options, executor_factory())))
    });
}

fn queue_worker(
    flags: Arc<ServerFlags>,
    state: Arc<ExecutionState>,
    queue_rx: Receiver<QueuedExecution>,
    executor: Arc<dyn TaskExecutor>,
    workers: Arc<WorkerSupervisor>,
    progress_tx: Sender<ProgressUpdate>,
) {
    info!("Queue worker thread started - executions run sequentially");
    while flags.running.load(Ordering::SeqCst) {
        let item = match queue_rx.recv_timeout(Duration::from_secs(1)) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        debug!(
            "[{}] Dequeued for execution (queue size: {})",
            item.execution_id,
            queue_rx.len()
        );

        if !flags.running.load(Ordering::SeqCst) {
            state.transition(&item.execution_id, ExecutionStatus::Cancelled);
            info!("[{}] Server shutting down, skipping execution", item.execution_id);
            break;
        }
        if state.status_of(&item.execution_id) == Some(ExecutionStatus::Cancelled) {
            info!("[{}] Cancelled while queued, skipping", item.execution_id);
            continue;
        }

        run_execution(&state, executor.as_ref(), &workers, &progress_tx, item);
    }

    // Anything still queued at shutdown is cancelled, not lost silently.
    let mut remaining = 0;
    while let Ok(item) = queue_rx.try_recv() {
        state.transition(&item.execution_id, ExecutionStatus::Cancelled);
        info!("[{}] Cancelled (was queued at shutdown)", item.execution_id);
        remaining += 1;
    }
    if remaining > 0 {
        info!("Cancelled {} queued executions during shutdown", remaining);
    }
    info!("Queue worker thread exiting");
}

fn run_execution(
    state: &ExecutionState,
    executor: &dyn TaskExecutor,
    workers: &Arc<WorkerSupervisor>,
    progress_tx: &Sender<ProgressUpdate>,
    item: QueuedExecution,
) {
    let QueuedExecution {
        execution_id,
        request,
    } = item;

    if !state.transition(&execution_id, ExecutionStatus::Running) {
        // Cancelled between the queue check and here.
        return;
    }
    info!("[{}] Starting execution", execution_id);
    let started = Instant::now();

    let ctx = ExecutionContext {
        workers: workers.clone(),
        progress: progress_tx.clone(),
    };
    match executor.execute_task(&execution_id, &request, &ctx) {
        Ok(results) => {
            let summary = ResultsSummary {
                well_count: results.len(),
                wells: results.keys().cloned().collect(),
            };
            if state.complete(&execution_id, summary) {
                info!(
                    "[{}] Completed in {:.1}s",
                    execution_id,
                    started.elapsed().as_secs_f64()
                );
            }
        }
        Err(TaskError::WorkerInterrupted)
            if state.cancel_requested(&execution_id)
                || state.status_of(&execution_id) == Some(ExecutionStatus::Cancelled) =>
        {
            // Cancellation reached the workers first; not a failure.
            state.resolve_cancelled(&execution_id);
            info!("[{}] Cancelled", execution_id);
        }
        Err(e) => {
            if state.fail(&execution_id, e.to_string()) {
                error!("[{}] Failed: {}", execution_id, e);
            }
        }
    }

    let killed = workers.kill_all();
    if killed > 0 {
        info!(
            "[{}] Killed {} worker processes during cleanup",
            execution_id, killed
        );
    }
    debug!("[{}] Execution cleanup complete", execution_id);
}
