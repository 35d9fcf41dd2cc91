//! Structured messages for the control, data and ack channels.
//!
//! Every message is a tagged mapping with a `type` field plus typed payload
//! fields. The message set is closed and enumerated: control requests and
//! responses are dispatched by matching on these enums, never by
//! reflection. Control frames travel as serialized byte blobs on the
//! REQ/REP channel; data and ack messages travel as UTF-8 JSON strings.
//!
//! ## Message lifecycle
//!
//! 1. Construction from typed fields
//! 2. Serialization at the sending socket
//! 3. Deserialization at the receiving socket
//! 4. Dispatch by `type` tag
//!
//! Deserialization failures (missing field, unknown type) surface as
//! errors that the server converts into an `error` reply on the same
//! control turn, preserving strict REQ/REP alternation.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::epoch_secs;

/// Requests accepted on the control channel.
///
/// The request set is closed and enumerated: servers dispatch by matching
/// on this enum, never by reflection, so an unknown `type` tag fails at
/// decode time and is answered with an `error` reply on the same control
/// turn.
///
/// ## Wire Format
///
/// Each variant serializes to a mapping carrying a `type` tag plus the
/// variant's payload fields:
///
/// - `{"type": "ping"}`
/// - `{"type": "execute", "plate_id": ..., "pipeline_code": ..., ...}`
/// - `{"type": "status", "execution_id"?: ...}`
/// - `{"type": "cancel", "execution_id": ...}`
/// - `{"type": "shutdown"}` / `{"type": "force_shutdown"}`
///
/// ## Dispatch Semantics
///
/// `ping` is resolved by the server core itself because it participates
/// in the readiness handshake; every other variant reaches the concrete
/// server's handler. `shutdown` kills workers but leaves the event loop
/// running, while `force_shutdown` additionally terminates the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Liveness/readiness handshake; answered with a pong.
    ///
    /// The first ping a server processes flips it to ready, so the
    /// handshake doubles as the end of the startup protocol.
    Ping,

    /// Submit a job to the execution queue.
    ///
    /// Accepted submissions are answered with `accepted` and a fresh
    /// execution id; the queue is unbounded, so load never rejects a
    /// valid request.
    Execute(ExecuteRequest),

    /// Query one execution or the server summary.
    ///
    /// With an execution id, the reply projects that record; without
    /// one, it summarizes the server (counts, uptime, known ids).
    Status(StatusRequest),

    /// Cancel an execution.
    ///
    /// Cancellation is fleet-wide: every queued record is cancelled and
    /// all spawned worker processes are killed, which is sound because
    /// the execution model runs one job at a time.
    Cancel(CancelRequest),

    /// Kill workers but leave the server loop running.
    Shutdown,

    /// Kill workers and terminate the server loop.
    ForceShutdown,
}

impl ControlRequest {
    /// Wire name of the request type, as it appears in the `type` field.
    pub fn type_name(&self) -> &'static str {
        match self {
            ControlRequest::Ping => "ping",
            ControlRequest::Execute(_) => "execute",
            ControlRequest::Status(_) => "status",
            ControlRequest::Cancel(_) => "cancel",
            ControlRequest::Shutdown => "shutdown",
            ControlRequest::ForceShutdown => "force_shutdown",
        }
    }
}

/// Payload of an `execute` request.
///
/// Carries everything a server needs to queue one job: the plate being
/// processed, the pipeline to run, and the pipeline's configuration in
/// one of two forms.
///
/// ## Required Fields
///
/// - `plate_id`: non-empty tag for the plate the job operates on
/// - `pipeline_code`: non-empty pipeline definition to execute
/// - at least one of `config_params` (an inline parameter mapping) or
///   `config_code` (an opaque configuration blob)
///
/// ## Validation
///
/// Requests decode leniently (absent required fields become empty) and
/// are then checked by [`validate`](Self::validate), so a malformed
/// submission gets a descriptive `error` reply instead of an opaque
/// decode failure. `pipeline_config_code` and `client_address` are
/// optional pass-through for the executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Opaque tag for the plate this job operates on.
    ///
    /// Absent fields decode as empty so validation, not the codec, owns
    /// the "missing required field" replies.
    #[serde(default)]
    pub plate_id: String,

    /// Pipeline definition to execute; interpretation belongs to the
    /// concrete executor.
    #[serde(default)]
    pub pipeline_code: String,

    /// Inline configuration parameters, arbitrary JSON values per key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_params: Option<Map<String, Value>>,

    /// Opaque configuration blob, the alternative to `config_params`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_code: Option<String>,

    /// Optional extra configuration handed through to the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_config_code: Option<String>,

    /// Address of the submitting client, recorded on the execution record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_address: Option<String>,
}

impl ExecuteRequest {
    /// Check required fields.
    ///
    /// ## Returns
    /// - `None`: the request is well-formed and may be queued
    /// - `Some(reason)`: rejection text for the `error` reply; checks run
    ///   in order (`plate_id`, then `pipeline_code`, then the config
    ///   pair), so the first missing field names the reply
    pub fn validate(&self) -> Option<String> {
        if self.plate_id.is_empty() {
            return Some("Missing required field: plate_id".to_string());
        }
        if self.pipeline_code.is_empty() {
            return Some("Missing required field: pipeline_code".to_string());
        }
        if self.config_params.is_none() && self.config_code.is_none() {
            return Some("Missing config: provide either config_params or config_code".to_string());
        }
        None
    }
}

/// Payload of a `status` request; no id means "summarize the server".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

/// Payload of a `cancel` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub execution_id: String,
}

impl CancelRequest {
    pub fn validate(&self) -> Option<String> {
        if self.execution_id.is_empty() {
            Some("Missing execution_id".to_string())
        } else {
            None
        }
    }
}

/// Replies produced on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Pong(PongResponse),
    /// An execute request was accepted and queued.
    Accepted { execution_id: String, message: String },
    Ok(OkReply),
    Error { error: String },
    ShutdownAck { status: String, message: String },
}

impl ControlResponse {
    /// Convenience constructor for error replies.
    pub fn error(message: impl Into<String>) -> Self {
        ControlResponse::Error {
            error: message.into(),
        }
    }
}

/// The payload shapes an `ok` reply can take.
///
/// Untagged on the wire: each shape is distinguished by its unique field
/// set (`execution` / `workers_killed` / `active_executions`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OkReply {
    /// Projection of a single execution record.
    Execution { execution: ExecutionRecord },
    /// Outcome of a cancel request.
    Cancelled {
        workers_killed: usize,
        message: String,
    },
    /// Server-wide summary when no execution id was given.
    Summary {
        active_executions: usize,
        uptime: f64,
        executions: Vec<String>,
    },
}

/// Reply to a `ping`, carrying endpoint identity and readiness.
///
/// The execution server augments the base fields with queue counts,
/// running-job summaries, worker metadata and uptime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongResponse {
    pub port: u16,
    pub control_port: u16,
    pub ready: bool,
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_executions: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_executions: Option<Vec<RunningExecution>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<Vec<WorkerInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<f64>,
}

/// Abbreviated view of a running execution, embedded in pongs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningExecution {
    pub execution_id: String,
    pub plate_id: String,
    pub start_time: f64,
    pub elapsed: f64,
}

/// Metadata about one supervised worker process, embedded in pongs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub pid: u32,
    pub status: String,
    pub uptime: f64,
}

/// Lifecycle states of a submitted execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states are absorbing; no transition may leave them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Complete | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Summary of a completed task's results, kept on the record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultsSummary {
    pub well_count: usize,
    pub wells: Vec<String>,
}

/// Authoritative state of one submitted job within its server.
///
/// Records are created `queued` on execute acceptance and are never
/// deleted during the server's lifetime; history and status queries read
/// them long after the job finishes.
///
/// ## Lifecycle
///
/// ```text
/// queued -> running -> {complete | failed | cancelled}
/// ```
///
/// Cancellation and failure may also strike a queued record directly,
/// skipping `running` entirely.
///
/// ## Invariants
///
/// - Status never regresses, and terminal states are absorbing; every
///   change goes through [`transition`](Self::transition).
/// - `start_time` is set exactly when the record enters `running`.
/// - `end_time` is set if and only if the status is terminal.
/// - At most one record per server is `running` at any instant, because
///   the queue worker runs jobs one at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// UUID assigned at acceptance; the record's primary key.
    pub execution_id: String,

    /// Plate tag copied from the originating request.
    pub plate_id: String,

    /// Submitting client's address, when the request carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_address: Option<String>,

    /// Current lifecycle state; see the type-level invariants.
    pub status: ExecutionStatus,

    /// Epoch seconds when the job started running, null while queued.
    pub start_time: Option<f64>,

    /// Epoch seconds when the job reached a terminal state.
    pub end_time: Option<f64>,

    /// Failure text, populated only when the status is `failed`.
    pub error: Option<String>,

    /// Result digest, populated only when the status is `complete`.
    pub results_summary: Option<ResultsSummary>,
}

impl ExecutionRecord {
    /// Fresh record in the `queued` state.
    pub fn new(execution_id: String, plate_id: String, client_address: Option<String>) -> Self {
        Self {
            execution_id,
            plate_id,
            client_address,
            status: ExecutionStatus::Queued,
            start_time: None,
            end_time: None,
            error: None,
            results_summary: None,
        }
    }

    /// Attempt a status transition, enforcing monotonic ordering.
    ///
    /// `queued -> running -> {complete | failed | cancelled}` is the only
    /// legal order; cancellation and failure may also strike a queued
    /// record directly. Terminal states are absorbing: once a record is
    /// complete, failed or cancelled, every further transition is
    /// refused. Concurrent writers (the queue worker and the control
    /// handler's cancellation path) are expected to call this under one
    /// lock and treat a `false` return as "the other side won".
    ///
    /// ## Parameters
    /// - `next`: the state to move to
    ///
    /// ## Returns
    /// - `true`: the transition was applied; `start_time` was stamped if
    ///   `next` is `running`, `end_time` if `next` is terminal
    /// - `false`: the transition was refused (regression, repeat of the
    ///   current state, or the record is already terminal); the record is
    ///   unchanged
    pub fn transition(&mut self, next: ExecutionStatus) -> bool {
        if self.status.is_terminal() || self.status == next {
            return false;
        }
        let allowed = match self.status {
            ExecutionStatus::Queued => true,
            ExecutionStatus::Running => next != ExecutionStatus::Queued,
            _ => false,
        };
        if !allowed {
            return false;
        }
        if next == ExecutionStatus::Running {
            self.start_time = Some(epoch_secs());
        }
        if next.is_terminal() {
            self.end_time = Some(epoch_secs());
        }
        self.status = next;
        true
    }
}

/// Messages published on the data channel or pushed to the ack channel.
///
/// All of these travel as UTF-8 JSON with a `type` tag, unlike control
/// frames which are opaque serialized blobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataMessage {
    Progress(ProgressUpdate),
    ImageAck(ImageAck),
    Rois(RoiMessage),
    Shapes(ShapesMessage),
}

impl DataMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Per-step progress for one well of a running execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub well_id: String,
    pub step: String,
    pub status: String,
    pub timestamp: f64,
}

/// Acknowledgement pushed by a viewer after processing one image.
///
/// Routed by `viewer_port` to the matching queue tracker; decouples image
/// delivery from consumption accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAck {
    pub image_id: String,
    pub viewer_port: u16,
    pub viewer_type: String,
    #[serde(default = "ImageAck::default_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImageAck {
    fn default_status() -> String {
        "success".to_string()
    }
}

/// Region-of-interest overlay payload for viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiMessage {
    pub rois: Vec<Value>,
    #[serde(default = "default_layer_name")]
    pub layer_name: String,
}

/// Shape-layer payload for viewers that render polygons directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapesMessage {
    pub shapes: Vec<Value>,
    #[serde(default = "default_layer_name")]
    pub layer_name: String,
}

fn default_layer_name() -> String {
    "ROIs".to_string()
}

/// Serialize a control request for the REQ/REP channel.
pub fn encode_control_request(request: &ControlRequest) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(request)?)
}

/// Decode a control request; failures become `error` replies upstream.
pub fn decode_control_request(raw: &[u8]) -> Result<ControlRequest> {
    Ok(serde_json::from_slice(raw)?)
}

/// Serialize a control response for the REQ/REP channel.
pub fn encode_control_response(response: &ControlResponse) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(response)?)
}

/// Decode a control response on the client side.
pub fn decode_control_response(raw: &[u8]) -> Result<ControlResponse> {
    Ok(serde_json::from_slice(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_request_roundtrip() {
        let mut params = Map::new();
        params.insert("a".to_string(), Value::from(1));
        let request = ControlRequest::Execute(ExecuteRequest {
            plate_id: "plate-1".to_string(),
            pipeline_code: "noop".to_string(),
            config_params: Some(params),
            client_address: Some("127.0.0.1".to_string()),
            ..Default::default()
        });

        let raw = encode_control_request(&request).unwrap();
        let value: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["type"], "execute");
        assert_eq!(value["plate_id"], "plate-1");

        assert_eq!(decode_control_request(&raw).unwrap(), request);
    }

    #[test]
    fn test_all_request_types_roundtrip() {
        let requests = vec![
            ControlRequest::Ping,
            ControlRequest::Status(StatusRequest {
                execution_id: Some("e-1".to_string()),
            }),
            ControlRequest::Status(StatusRequest::default()),
            ControlRequest::Cancel(CancelRequest {
                execution_id: "e-2".to_string(),
            }),
            ControlRequest::Shutdown,
            ControlRequest::ForceShutdown,
        ];
        for request in requests {
            let raw = encode_control_request(&request).unwrap();
            let value: Value = serde_json::from_slice(&raw).unwrap();
            assert_eq!(value["type"], request.type_name());
            assert_eq!(decode_control_request(&raw).unwrap(), request);
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let responses = vec![
            ControlResponse::Pong(PongResponse {
                port: 5555,
                control_port: 6555,
                ready: true,
                server: "ExecutionServer".to_string(),
                log_file_path: None,
                active_executions: Some(2),
                running_executions: Some(vec![RunningExecution {
                    execution_id: "e-1".to_string(),
                    plate_id: "p-1".to_string(),
                    start_time: 100.0,
                    elapsed: 5.0,
                }]),
                workers: Some(vec![WorkerInfo {
                    pid: 42,
                    status: "running".to_string(),
                    uptime: 1.5,
                }]),
                uptime: Some(10.0),
            }),
            ControlResponse::Accepted {
                execution_id: "e-1".to_string(),
                message: "Execution queued (position: 1)".to_string(),
            },
            ControlResponse::Ok(OkReply::Cancelled {
                workers_killed: 3,
                message: "Cancelled - killed 3 workers".to_string(),
            }),
            ControlResponse::Ok(OkReply::Summary {
                active_executions: 1,
                uptime: 2.0,
                executions: vec!["e-1".to_string()],
            }),
            ControlResponse::error("Missing required field: plate_id"),
            ControlResponse::ShutdownAck {
                status: "success".to_string(),
                message: "Workers killed (0), server alive".to_string(),
            },
        ];
        for response in responses {
            let raw = encode_control_response(&response).unwrap();
            assert_eq!(decode_control_response(&raw).unwrap(), response);
        }
    }

    #[test]
    fn test_ok_execution_roundtrip() {
        let mut record = ExecutionRecord::new("e-9".to_string(), "p-9".to_string(), None);
        assert!(record.transition(ExecutionStatus::Running));
        let response = ControlResponse::Ok(OkReply::Execution { execution: record });
        let raw = encode_control_response(&response).unwrap();
        assert_eq!(decode_control_response(&raw).unwrap(), response);
    }

    #[test]
    fn test_unknown_request_type_fails() {
        assert!(decode_control_request(br#"{"type":"warp"}"#).is_err());
        assert!(decode_control_request(br#"{"no_type":1}"#).is_err());
    }

    #[test]
    fn test_partial_execute_frame_decodes_and_fails_validation() {
        // Missing fields are a validation concern, not a decode failure.
        let request = decode_control_request(br#"{"type":"execute","plate_id":""}"#).unwrap();
        match request {
            ControlRequest::Execute(request) => {
                assert_eq!(
                    request.validate().as_deref(),
                    Some("Missing required field: plate_id")
                );
            }
            other => panic!("expected execute, got {other:?}"),
        }

        let cancel = decode_control_request(br#"{"type":"cancel"}"#).unwrap();
        match cancel {
            ControlRequest::Cancel(request) => {
                assert_eq!(request.validate().as_deref(), Some("Missing execution_id"));
            }
            other => panic!("expected cancel, got {other:?}"),
        }
    }

    #[test]
    fn test_execute_validation_messages() {
        let empty_plate = ExecuteRequest {
            pipeline_code: "noop".to_string(),
            config_params: Some(Map::new()),
            ..Default::default()
        };
        assert_eq!(
            empty_plate.validate().as_deref(),
            Some("Missing required field: plate_id")
        );

        let no_code = ExecuteRequest {
            plate_id: "P1".to_string(),
            config_params: Some(Map::new()),
            ..Default::default()
        };
        assert_eq!(
            no_code.validate().as_deref(),
            Some("Missing required field: pipeline_code")
        );

        let no_config = ExecuteRequest {
            plate_id: "P1".to_string(),
            pipeline_code: "noop".to_string(),
            ..Default::default()
        };
        assert_eq!(
            no_config.validate().as_deref(),
            Some("Missing config: provide either config_params or config_code")
        );

        let valid = ExecuteRequest {
            plate_id: "P1".to_string(),
            pipeline_code: "noop".to_string(),
            config_code: Some("{}".to_string()),
            ..Default::default()
        };
        assert!(valid.validate().is_none());
    }

    #[test]
    fn test_record_transitions_are_monotonic() {
        let mut record = ExecutionRecord::new("e-1".to_string(), "p-1".to_string(), None);
        assert_eq!(record.status, ExecutionStatus::Queued);
        assert!(record.start_time.is_none() && record.end_time.is_none());

        assert!(record.transition(ExecutionStatus::Running));
        assert!(record.start_time.is_some());
        assert!(record.end_time.is_none());

        // No regression to queued.
        assert!(!record.transition(ExecutionStatus::Queued));

        assert!(record.transition(ExecutionStatus::Complete));
        assert!(record.end_time.is_some());

        // Terminal states are absorbing.
        for next in [
            ExecutionStatus::Queued,
            ExecutionStatus::Running,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            assert!(!record.transition(next));
        }
        assert_eq!(record.status, ExecutionStatus::Complete);
    }

    #[test]
    fn test_cancel_from_queued_sets_end_time_only() {
        let mut record = ExecutionRecord::new("e-2".to_string(), "p-1".to_string(), None);
        assert!(record.transition(ExecutionStatus::Cancelled));
        assert!(record.start_time.is_none());
        assert!(record.end_time.is_some());
    }

    #[test]
    fn test_progress_message_json_shape() {
        let message = DataMessage::Progress(ProgressUpdate {
            well_id: "A1".to_string(),
            step: "segment".to_string(),
            status: "running".to_string(),
            timestamp: 123.5,
        });
        let json = message.to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["well_id"], "A1");
        assert_eq!(DataMessage::from_json(&json).unwrap(), message);
    }

    #[test]
    fn test_image_ack_defaults_and_roundtrip() {
        let ack: ImageAck =
            serde_json::from_str(r#"{"image_id":"img-1","viewer_port":6000,"viewer_type":"v"}"#)
                .unwrap();
        assert_eq!(ack.status, "success");
        assert!(ack.timestamp.is_none());

        let message = DataMessage::ImageAck(ack);
        let json = message.to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "image_ack");
        assert_eq!(DataMessage::from_json(&json).unwrap(), message);
    }

    #[test]
    fn test_roi_and_shapes_default_layer() {
        let roi: RoiMessage = serde_json::from_str(r#"{"rois":[]}"#).unwrap();
        assert_eq!(roi.layer_name, "ROIs");
        let shapes: ShapesMessage = serde_json::from_str(r#"{"shapes":[{"kind":"ellipse"}]}"#).unwrap();
        assert_eq!(shapes.layer_name, "ROIs");
    }
}
