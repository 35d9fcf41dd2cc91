//! Dual-channel server base.
//!
//! Every runtime server binds two sockets: a data socket on the chosen
//! port (publish for producers, subscribe/pull for consumers) and a REP
//! control socket on `port + offset`. [`ServerCore`] owns both sockets
//! and implements the control turn; concrete servers plug in a
//! [`ControlHandler`] for everything beyond the ping handshake.
//!
//! Server kinds register themselves under a string key in an explicit
//! process-wide registry, letting hosts construct servers by tag.

pub mod execution;
pub mod streaming;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::{RuntimeConfig, TransportMode};
use crate::messages::{
    decode_control_request, encode_control_response, ControlRequest, ControlResponse, PongResponse,
};
use crate::transport::{default_transport_mode, remove_ipc_socket, transport_url};

/// Role of the data socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSocketKind {
    /// PUB socket; the server fans out progress or image payloads.
    Publish,
    /// SUB socket with an empty filter; the server consumes a stream.
    Subscribe,
    /// PULL socket; the server drains pushed payloads.
    Pull,
}

impl DataSocketKind {
    fn zmq_type(self) -> zmq::SocketType {
        match self {
            DataSocketKind::Publish => zmq::PUB,
            DataSocketKind::Subscribe => zmq::SUB,
            DataSocketKind::Pull => zmq::PULL,
        }
    }

    /// Receive-side kinds get a raised high-water mark.
    pub fn is_receiver(self) -> bool {
        matches!(self, DataSocketKind::Subscribe | DataSocketKind::Pull)
    }

    fn display_name(self) -> &'static str {
        match self {
            DataSocketKind::Publish => "PUB",
            DataSocketKind::Subscribe => "SUB",
            DataSocketKind::Pull => "PULL",
        }
    }
}

/// Shared lifecycle flags, observable from worker threads.
#[derive(Default)]
pub struct ServerFlags {
    pub running: AtomicBool,
    pub ready: AtomicBool,
}

/// Construction parameters common to every server kind.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Data port; `None` uses the config's default port.
    pub port: Option<u16>,
    pub host: String,
    pub log_file_path: Option<String>,
    /// Transport mode; `None` uses the platform default.
    pub transport_mode: Option<TransportMode>,
    pub config: RuntimeConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: None,
            host: "*".to_string(),
            log_file_path: None,
            transport_mode: None,
            config: RuntimeConfig::default(),
        }
    }
}

/// Handles control requests that are not the ping handshake.
pub trait ControlHandler {
    fn handle(&mut self, request: ControlRequest) -> ControlResponse;

    /// Add server-kind-specific fields to an outgoing pong.
    fn augment_pong(&self, pong: PongResponse) -> PongResponse {
        pong
    }
}

/// Dual-socket lifecycle: bind, control turn, publish, teardown.
///
/// Every runtime server is built around one `ServerCore`. It owns both
/// zmq sockets and the shared lifecycle flags; concrete servers
/// (execution, streaming) wrap it and supply a [`ControlHandler`] for
/// everything beyond the ping handshake.
///
/// ## Socket Layout
///
/// - **Data socket** on the chosen port: PUB for producers, SUB or PULL
///   for consumers. Receive-side kinds get `RCVHWM = 100_000` so a
///   blocked downstream consumer does not cause drops.
/// - **Control socket** on `port + offset`: a REP socket answering the
///   enumerated control requests in strict request/reply turns.
///
/// ## State Machine
///
/// ```text
/// stopped -> running(ready=false) -> running(ready=true) -> stopped
/// ```
///
/// The `ready` flag flips the first time a ping is processed, which is
/// the signal clients key their readiness wait on. `request_shutdown`
/// clears `running`; the owning event loop exits on its next iteration.
///
/// ## Threading
///
/// The core is single-threaded by design: only the event-loop thread may
/// touch the sockets (zmq sockets are not `Sync`). Background threads
/// observe lifecycle through the shared [`ServerFlags`] handle from
/// [`flags`](Self::flags) instead.
pub struct ServerCore {
    server_name: &'static str,
    config: RuntimeConfig,
    port: u16,
    control_port: u16,
    host: String,
    transport_mode: TransportMode,
    data_socket_kind: DataSocketKind,
    log_file_path: Option<String>,
    context: Option<zmq::Context>,
    data_socket: Option<zmq::Socket>,
    control_socket: Option<zmq::Socket>,
    flags: Arc<ServerFlags>,
}

impl ServerCore {
    pub fn new(
        server_name: &'static str,
        data_socket_kind: DataSocketKind,
        options: &ServerOptions,
    ) -> Self {
        let config = options.config.clone();
        let port = options.port.unwrap_or(config.default_port);
        let control_port = config.control_port(port);
        Self {
            server_name,
            port,
            control_port,
            host: options.host.clone(),
            transport_mode: options.transport_mode.unwrap_or_else(default_transport_mode),
            data_socket_kind,
            log_file_path: options.log_file_path.clone(),
            config,
            context: None,
            data_socket: None,
            control_socket: None,
            flags: Arc::new(ServerFlags::default()),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.transport_mode
    }

    pub fn log_file_path(&self) -> Option<&str> {
        self.log_file_path.as_deref()
    }

    /// Lifecycle flags shared with background threads.
    pub fn flags(&self) -> Arc<ServerFlags> {
        self.flags.clone()
    }

    pub fn is_running(&self) -> bool {
        self.flags.running.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.flags.ready.load(Ordering::SeqCst)
    }

    /// Ask the owning event loop to exit on its next iteration.
    pub fn request_shutdown(&self) {
        info!("Shutdown requested for server on port {}", self.port);
        self.flags.running.store(false, Ordering::SeqCst);
    }

    /// Bind both sockets and mark the server running.
    ///
    /// Idempotent: a running core returns immediately.
    ///
    /// ## Returns
    /// - `Ok(())`: both sockets bound; the server accepts control turns
    /// - `Err(anyhow::Error)`: endpoint resolution or a bind failed
    ///
    /// ## Error Conditions
    ///
    /// - IPC mode on Windows (unsupported)
    /// - either port already bound by another process
    /// - socket creation or option failures from the transport layer
    ///
    /// ## Resource Management
    ///
    /// In IPC mode, stale socket files for both ports are removed before
    /// binding; the socket-file namespace is shared, and a crashed
    /// predecessor must not block a restart.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        // IPC socket files are a shared namespace; clear leftovers from a
        // crashed predecessor before binding.
        if self.transport_mode == TransportMode::Ipc {
            remove_ipc_socket(self.port, &self.config);
            remove_ipc_socket(self.control_port, &self.config);
        }

        let context = zmq::Context::new();

        let data_url = transport_url(self.port, &self.host, self.transport_mode, &self.config)?;
        let data_socket = context.socket(self.data_socket_kind.zmq_type())?;
        data_socket.set_linger(0)?;
        if self.data_socket_kind.is_receiver() {
            data_socket.set_rcvhwm(100_000)?;
            info!(
                "{} data socket RCVHWM set to 100000 to survive blocking consumers",
                self.data_socket_kind.display_name()
            );
        }
        data_socket.bind(&data_url)?;
        if self.data_socket_kind == DataSocketKind::Subscribe {
            data_socket.set_subscribe(b"")?;
        }

        let control_url =
            transport_url(self.control_port, &self.host, self.transport_mode, &self.config)?;
        let control_socket = context.socket(zmq::REP)?;
        // A final reply (e.g. the force-shutdown ack) must still flush
        // when the socket closes right after the send.
        control_socket.set_linger(1000)?;
        control_socket.bind(&control_url)?;

        self.context = Some(context);
        self.data_socket = Some(data_socket);
        self.control_socket = Some(control_socket);
        self.flags.running.store(true, Ordering::SeqCst);
        info!(
            "Server started on {} ({}), control {}",
            data_url,
            self.data_socket_kind.display_name(),
            control_url
        );
        Ok(())
    }

    /// Close sockets and clear flags. Idempotent.
    pub fn stop(&mut self) {
        if self.context.is_none() {
            return;
        }
        self.flags.running.store(false, Ordering::SeqCst);
        self.flags.ready.store(false, Ordering::SeqCst);
        self.data_socket = None;
        self.control_socket = None;
        self.context = None;
        info!("Server on port {} stopped", self.port);
    }

    fn mark_ready(&self) {
        if !self.flags.ready.swap(true, Ordering::SeqCst) {
            info!("Server ready");
        }
    }

    /// Pong with endpoint identity; concrete servers augment it.
    pub fn base_pong(&self) -> PongResponse {
        PongResponse {
            port: self.port,
            control_port: self.control_port,
            ready: self.is_ready(),
            server: self.server_name.to_string(),
            log_file_path: self.log_file_path.clone(),
            active_executions: None,
            running_executions: None,
            workers: None,
            uptime: None,
        }
    }

    fn recv_control(&self) -> Option<Vec<u8>> {
        let socket = self.control_socket.as_ref()?;
        match socket.recv_bytes(zmq::DONTWAIT) {
            Ok(raw) => Some(raw),
            Err(zmq::Error::EAGAIN) => None,
            Err(e) => {
                error!("Error receiving control message: {}", e);
                None
            }
        }
    }

    fn send_control(&self, response: &ControlResponse) {
        let Some(socket) = self.control_socket.as_ref() else {
            return;
        };
        let raw = encode_control_response(response).unwrap_or_else(|e| {
            error!("Failed to encode control response: {}", e);
            br#"{"type":"error","error":"internal encoding failure"}"#.to_vec()
        });
        if let Err(e) = socket.send(raw, 0) {
            error!("Failed to send response on control socket: {}", e);
        }
    }

    /// One control turn, if a request is pending. Never blocks.
    ///
    /// ## Reply Discipline
    ///
    /// REP sockets require strict recv -> send alternation: every received
    /// frame produces exactly one reply. That holds on every path through
    /// this method, including malformed frames (answered with an `error`
    /// reply carrying the decode failure) and anything the handler
    /// returns.
    ///
    /// ## Ping Handling
    ///
    /// Pings are resolved here, before any dispatch to the handler: the
    /// first one flips the server to ready, and the reply is the base
    /// pong passed through [`ControlHandler::augment_pong`] so concrete
    /// servers can attach their own fields.
    ///
    /// ## Parameters
    /// - `handler`: dispatch target for every non-ping request
    pub fn process_control(&mut self, handler: &mut dyn ControlHandler) {
        if !self.is_running() {
            return;
        }
        let Some(raw) = self.recv_control() else {
            return;
        };

        let response = match decode_control_request(&raw) {
            Ok(ControlRequest::Ping) => {
                self.mark_ready();
                ControlResponse::Pong(handler.augment_pong(self.base_pong()))
            }
            Ok(request) => {
                debug!("Dispatching control request '{}'", request.type_name());
                handler.handle(request)
            }
            Err(e) => {
                error!("Error decoding control message: {}", e);
                ControlResponse::error(format!("Malformed control message: {e}"))
            }
        };
        self.send_control(&response);
    }

    /// Publish one UTF-8 JSON payload on the data socket.
    ///
    /// ## Parameters
    /// - `payload`: complete JSON document, sent as one frame
    ///
    /// ## Returns
    /// - `Ok(())`: frame handed to the socket (PUB drops it silently when
    ///   no subscriber is connected)
    /// - `Err(anyhow::Error)`: the data socket is not bound, or the send
    ///   itself failed
    pub fn publish_json(&self, payload: &str) -> Result<()> {
        let socket = self
            .data_socket
            .as_ref()
            .ok_or_else(|| anyhow!("data socket not bound"))?;
        socket.send(payload, 0)?;
        Ok(())
    }

    /// Non-blocking receive on a subscribe/pull data socket.
    pub fn recv_data(&self) -> Option<Vec<u8>> {
        let socket = self.data_socket.as_ref()?;
        match socket.recv_bytes(zmq::DONTWAIT) {
            Ok(raw) => Some(raw),
            Err(zmq::Error::EAGAIN) => None,
            Err(e) => {
                error!("Error receiving data message: {}", e);
                None
            }
        }
    }
}

/// A runnable server, constructible through the type registry.
pub trait RuntimeServer: Send {
    fn server_type(&self) -> &'static str;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self);
    /// One non-blocking tick of the event loop.
    fn process_messages(&mut self);
    fn is_running(&self) -> bool;
}

type ServerFactory = Box<dyn Fn(&ServerOptions) -> Result<Box<dyn RuntimeServer>> + Send + Sync>;

static SERVER_REGISTRY: Lazy<RwLock<HashMap<&'static str, ServerFactory>>> =
    Lazy::new(Default::default);

/// Register a server kind under its type tag.
///
/// Called once per kind at definition site; re-registration replaces the
/// factory (useful in tests) with a warning.
pub fn register_server_type(
    key: &'static str,
    factory: impl Fn(&ServerOptions) -> Result<Box<dyn RuntimeServer>> + Send + Sync + 'static,
) {
    let mut registry = SERVER_REGISTRY.write();
    if registry.insert(key, Box::new(factory)).is_some() {
        warn!("Replacing server factory for type '{}'", key);
    }
}

/// Construct a server by its registered type tag.
pub fn create_server(key: &str, options: &ServerOptions) -> Result<Box<dyn RuntimeServer>> {
    let registry = SERVER_REGISTRY.read();
    let factory = registry
        .get(key)
        .ok_or_else(|| anyhow!("Unknown server type: {key}"))?;
    factory(options)
}

/// Currently registered type tags, sorted.
pub fn registered_server_types() -> Vec<&'static str> {
    let mut keys: Vec<&'static str> = SERVER_REGISTRY.read().keys().copied().collect();
    keys.sort_unstable();
    keys
}

/// Drive a server's event loop until shutdown is requested.
pub fn run_server(server: &mut dyn RuntimeServer, tick: Duration) -> Result<()> {
    server.start()?;
    info!("{} server entering event loop", server.server_type());
    while server.is_running() {
        server.process_messages();
        std::thread::sleep(tick);
    }
    server.stop();
    info!("{} server event loop exited", server.server_type());
    Ok(())
}

/// Best-effort kill of whatever is listening on a TCP port.
///
/// Returns the number of processes signalled. Used to reap stale servers
/// whose handshake no longer answers.
pub fn kill_processes_on_port(port: u16) -> usize {
    #[cfg(unix)]
    {
        kill_processes_on_port_unix(port)
    }
    #[cfg(windows)]
    {
        kill_processes_on_port_windows(port)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = port;
        0
    }
}

#[cfg(unix)]
fn kill_processes_on_port_unix(port: u16) -> usize {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let output = match std::process::Command::new("lsof")
        .args(["-ti", &format!("TCP:{port}"), "-sTCP:LISTEN"])
        .output()
    {
        Ok(output) => output,
        Err(e) => {
            debug!("lsof unavailable while killing port {}: {}", port, e);
            return 0;
        }
    };
    if !output.status.success() {
        return 0;
    }

    let mut killed = 0;
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let Ok(pid) = line.trim().parse::<i32>() else {
            continue;
        };
        if pid == std::process::id() as i32 {
            continue;
        }
        if kill(Pid::from_raw(pid), Signal::SIGKILL).is_ok() {
            info!("Killed process {} listening on port {}", pid, port);
            killed += 1;
        }
    }
    killed
}

#[cfg(windows)]
fn kill_processes_on_port_windows(port: u16) -> usize {
    let output = match std::process::Command::new("netstat").arg("-ano").output() {
        Ok(output) => output,
        Err(e) => {
            debug!("netstat unavailable while killing port {}: {}", port, e);
            return 0;
        }
    };

    let needle = format!(":{port}");
    let mut killed = 0;
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if !(line.contains(&needle) && line.contains("LISTENING")) {
            continue;
        }
        let Some(pid) = line.split_whitespace().last() else {
            continue;
        };
        if std::process::Command::new("taskkill")
            .args(["/PID", pid, "/F"])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
        {
            info!("Killed process {} listening on port {}", pid, port);
            killed += 1;
        }
    }
    killed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::decode_control_response;
    use std::time::Duration;

    struct RejectAllHandler;

    impl ControlHandler for RejectAllHandler {
        fn handle(&mut self, request: ControlRequest) -> ControlResponse {
            ControlResponse::error(format!("unsupported: {}", request.type_name()))
        }
    }

    fn request_socket(ctx: &zmq::Context, port: u16) -> zmq::Socket {
        let socket = ctx.socket(zmq::REQ).unwrap();
        socket.set_linger(0).unwrap();
        socket.set_rcvtimeo(2000).unwrap();
        socket.connect(&format!("tcp://127.0.0.1:{port}")).unwrap();
        socket
    }

    #[test]
    fn test_ping_handshake_and_error_turns() {
        let options = ServerOptions {
            port: Some(7901),
            host: "127.0.0.1".to_string(),
            transport_mode: Some(TransportMode::Tcp),
            ..Default::default()
        };
        let mut core = ServerCore::new("TestServer", DataSocketKind::Publish, &options);
        core.start().unwrap();
        assert!(core.is_running());
        assert!(!core.is_ready());
        assert_eq!(core.control_port(), 8901);

        let ctx = zmq::Context::new();
        let socket = request_socket(&ctx, 8901);
        let mut handler = RejectAllHandler;

        // Ping: marks ready and reports it in the same pong.
        socket
            .send(
                crate::messages::encode_control_request(&ControlRequest::Ping).unwrap(),
                0,
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        core.process_control(&mut handler);
        let pong = decode_control_response(&socket.recv_bytes(0).unwrap()).unwrap();
        match pong {
            ControlResponse::Pong(pong) => {
                assert!(pong.ready);
                assert_eq!(pong.port, 7901);
                assert_eq!(pong.control_port, 8901);
                assert_eq!(pong.server, "TestServer");
            }
            other => panic!("expected pong, got {other:?}"),
        }
        assert!(core.is_ready());

        // Malformed frame: still exactly one reply, an error.
        socket.send(&br#"{"type":"bogus"}"#[..], 0).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        core.process_control(&mut handler);
        match decode_control_response(&socket.recv_bytes(0).unwrap()).unwrap() {
            ControlResponse::Error { error } => {
                assert!(error.contains("Malformed control message"))
            }
            other => panic!("expected error, got {other:?}"),
        }

        // Dispatched request: the handler's reply completes the turn.
        socket
            .send(
                crate::messages::encode_control_request(&ControlRequest::Shutdown).unwrap(),
                0,
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        core.process_control(&mut handler);
        match decode_control_response(&socket.recv_bytes(0).unwrap()).unwrap() {
            ControlResponse::Error { error } => assert_eq!(error, "unsupported: shutdown"),
            other => panic!("expected error, got {other:?}"),
        }

        core.stop();
        assert!(!core.is_running());
        // stop is idempotent
        core.stop();
    }

    struct NullServer {
        running: bool,
    }

    impl RuntimeServer for NullServer {
        fn server_type(&self) -> &'static str {
            "null"
        }
        fn start(&mut self) -> Result<()> {
            self.running = true;
            Ok(())
        }
        fn stop(&mut self) {
            self.running = false;
        }
        fn process_messages(&mut self) {
            self.running = false;
        }
        fn is_running(&self) -> bool {
            self.running
        }
    }

    #[test]
    fn test_server_registry() {
        register_server_type("null", |_options| Ok(Box::new(NullServer { running: false })));
        assert!(registered_server_types().contains(&"null"));

        let options = ServerOptions::default();
        let mut server = create_server("null", &options).unwrap();
        assert_eq!(server.server_type(), "null");
        assert!(create_server("nonexistent", &options).is_err());

        // run_server drives the loop until the server stops itself.
        run_server(server.as_mut(), Duration::from_millis(1)).unwrap();
        assert!(!server.is_running());
    }
}
