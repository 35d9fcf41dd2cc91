//! Typed errors surfaced across the runtime's seams.
//!
//! Most fallible paths use `anyhow::Result`; the types here exist where a
//! caller needs to distinguish the kind at a match site: control-request
//! timeouts in the client, and the worker-interrupted condition that
//! cancellation reclassifies.

use thiserror::Error;

/// The server did not reply to a control request within the deadline.
///
/// Raised only by the client's control RPC path; the server side never
/// propagates transport errors as exceptions.
#[derive(Debug, Error)]
#[error("server did not respond to '{request}' request within {timeout_ms}ms")]
pub struct RequestTimeout {
    /// Message type of the unanswered request.
    pub request: String,
    /// Receive timeout that elapsed.
    pub timeout_ms: i32,
}

/// Failure modes of a task executor.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task's worker processes were torn down underneath it.
    ///
    /// When the owning record was already cancelled, the execution server
    /// treats this as a normal cancellation rather than a failure.
    #[error("worker processes terminated while task was running")]
    WorkerInterrupted,

    /// Any other task failure; recorded verbatim on the execution record.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}
