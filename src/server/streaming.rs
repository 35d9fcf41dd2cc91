//! Streaming visualizer server.
//!
//! Receives image payloads on a subscribe/pull data socket, hands each
//! frame to an [`ImageSink`] for display, and pushes a per-image
//! [`ImageAck`] to the shared ack port so queue trackers in the sending
//! process can account for consumption. Ack failures never block display.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::messages::{ControlRequest, ControlResponse, DataMessage, ImageAck, OkReply};
use crate::server::{ControlHandler, DataSocketKind, RuntimeServer, ServerCore, ServerFlags, ServerOptions};
use crate::transport::transport_url;
use crate::utils::epoch_secs;

/// Display hook implemented by concrete viewers.
pub trait ImageSink: Send {
    fn display_image(&mut self, image: &Value, metadata: &Map<String, Value>) -> Result<()>;
}

/// One frame of an incoming image payload.
#[derive(Debug, Deserialize)]
struct ImageFrame {
    #[serde(default)]
    image_id: Option<String>,
    data: Value,
    #[serde(default)]
    metadata: Map<String, Value>,
}

/// Payloads may carry a batch under `images` or a single frame inline.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ImagePayload {
    Batch { images: Vec<ImageFrame> },
    Single(ImageFrame),
}

impl ImagePayload {
    fn into_frames(self) -> Vec<ImageFrame> {
        match self {
            ImagePayload::Batch { images } => images,
            ImagePayload::Single(frame) => vec![frame],
        }
    }
}

struct StreamingHandler {
    flags: Arc<ServerFlags>,
    started: Instant,
}

impl ControlHandler for StreamingHandler {
    fn handle(&mut self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Ping => ControlResponse::error("ping is handled before dispatch"),
            ControlRequest::Status(_) => ControlResponse::Ok(OkReply::Summary {
                active_executions: 0,
                uptime: self.started.elapsed().as_secs_f64(),
                executions: Vec::new(),
            }),
            ControlRequest::Shutdown => ControlResponse::ShutdownAck {
                status: "success".to_string(),
                message: "Streaming server alive".to_string(),
            },
            ControlRequest::ForceShutdown => {
                self.flags.running.store(false, Ordering::SeqCst);
                ControlResponse::ShutdownAck {
                    status: "success".to_string(),
                    message: "Streaming server shutting down".to_string(),
                }
            }
            other => ControlResponse::error(format!(
                "Request '{}' not supported by streaming server",
                other.type_name()
            )),
        }
    }
}

/// Dual-channel server that displays streamed images and acks each one.
///
/// ## Data Path
///
/// Incoming payloads on the receive-mode data socket carry either a
/// single frame or a batch under `images`. Each frame goes to the
/// [`ImageSink`] hook; afterwards an [`ImageAck`] for the frame's
/// `image_id` is pushed to the shared ack port, with status `success`
/// or `error` depending on the display result.
///
/// ## Ack Socket
///
/// A PUSH socket pre-connected to the configured `shared_ack_port` on
/// the ack host, with a 1 s send timeout. Setup and send failures are
/// logged and swallowed; acknowledgement is accounting, and it must
/// never block or break display.
pub struct StreamingServer {
    core: ServerCore,
    handler: StreamingHandler,
    viewer_type: String,
    ack_host: String,
    sink: Box<dyn ImageSink>,
    ack_socket: Option<zmq::Socket>,
}

impl StreamingServer {
    pub fn new(
        options: &ServerOptions,
        viewer_type: impl Into<String>,
        data_socket_kind: DataSocketKind,
        sink: Box<dyn ImageSink>,
        ack_host: impl Into<String>,
    ) -> Self {
        let core = ServerCore::new("StreamingServer", data_socket_kind, options);
        let handler = StreamingHandler {
            flags: core.flags(),
            started: Instant::now(),
        };
        Self {
            core,
            handler,
            viewer_type: viewer_type.into(),
            ack_host: ack_host.into(),
            sink,
            ack_socket: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.core.port()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn start(&mut self) -> Result<()> {
        self.core.start()?;
        self.setup_ack_socket();
        Ok(())
    }

    pub fn stop(&mut self) {
        self.ack_socket = None;
        self.core.stop();
    }

    /// PUSH socket to the shared ack port; absence downgrades to no acks.
    fn setup_ack_socket(&mut self) {
        let config = self.core.config();
        let setup = || -> Result<zmq::Socket> {
            let url = transport_url(
                config.shared_ack_port,
                &self.ack_host,
                self.core.transport_mode(),
                config,
            )?;
            let ctx = zmq::Context::new();
            let socket = ctx.socket(zmq::PUSH)?;
            socket.set_linger(0)?;
            socket.set_sndtimeo(1000)?;
            socket.connect(&url)?;
            info!("Connected ack socket to {}", url);
            Ok(socket)
        };
        match setup() {
            Ok(socket) => self.ack_socket = Some(socket),
            Err(e) => {
                warn!("Failed to setup ack socket: {}", e);
                self.ack_socket = None;
            }
        }
    }

    /// Push an acknowledgement for one image.
    ///
    /// ## Parameters
    /// - `image_id`: id of the displayed (or rejected) image
    /// - `status`: `"success"` or `"error"`
    /// - `error`: failure text when the status is `"error"`
    ///
    /// ## Failure Semantics
    ///
    /// A missing ack socket makes this a no-op; send failures are logged
    /// and swallowed so display never blocks on accounting.
    pub fn send_ack(&self, image_id: &str, status: &str, error: Option<String>) {
        let Some(socket) = self.ack_socket.as_ref() else {
            return;
        };
        let ack = DataMessage::ImageAck(ImageAck {
            image_id: image_id.to_string(),
            viewer_port: self.core.port(),
            viewer_type: self.viewer_type.clone(),
            status: status.to_string(),
            timestamp: Some(epoch_secs()),
            error,
        });
        let sent = ack
            .to_json()
            .and_then(|json| Ok(socket.send(json.as_str(), 0)?));
        if let Err(e) = sent {
            warn!("Failed to send ack for {}: {}", image_id, e);
        }
    }

    /// One event-loop tick: a control turn, then drain the data socket.
    pub fn process_messages(&mut self) {
        self.core.process_control(&mut self.handler);
        while let Some(raw) = self.core.recv_data() {
            self.handle_data(&raw);
        }
    }

    fn handle_data(&mut self, raw: &[u8]) {
        let payload: ImagePayload = match serde_json::from_slice(raw) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Undecodable image payload ({} bytes): {}", raw.len(), e);
                return;
            }
        };

        for frame in payload.into_frames() {
            let image_id = frame.image_id.clone().or_else(|| {
                frame
                    .metadata
                    .get("image_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });

            match self.sink.display_image(&frame.data, &frame.metadata) {
                Ok(()) => {
                    if let Some(image_id) = image_id {
                        self.send_ack(&image_id, "success", None);
                    } else {
                        debug!("Displayed frame without image_id; no ack sent");
                    }
                }
                Err(e) => {
                    warn!("Failed to display image: {}", e);
                    if let Some(image_id) = image_id {
                        self.send_ack(&image_id, "error", Some(e.to_string()));
                    }
                }
            }
        }
    }
}

impl RuntimeServer for StreamingServer {
    fn server_type(&self) -> &'static str {
        "streaming"
    }

    fn start(&mut self) -> Result<()> {
        StreamingServer::start(self)
    }

    fn stop(&mut self) {
        StreamingServer::stop(self)
    }

    fn process_messages(&mut self) {
        StreamingServer::process_messages(self)
    }

    fn is_running(&self) -> bool {
        StreamingServer::is_running(self)
    }
}
