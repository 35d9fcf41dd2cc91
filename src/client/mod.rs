//! Client base: connect-or-spawn, control RPC, discovery and teardown.
//!
//! A client targets a data port and derives the control port from it. On
//! connect it probes the endpoint: an answering, ready server is adopted;
//! an occupied but unresponsive endpoint is treated as stale and cleared;
//! otherwise a server process is spawned through the [`ServerSpawner`]
//! hook and awaited until ready. A client never terminates a server it
//! adopted, and terminates one it spawned only when not persistent.

pub mod execution;

use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::config::{RuntimeConfig, TransportMode};
use crate::errors::RequestTimeout;
use crate::messages::{
    decode_control_response, encode_control_request, ControlRequest, ControlResponse, PongResponse,
};
use crate::process::terminate_child;
use crate::server::kill_processes_on_port;
use crate::transport::{
    default_transport_mode, is_endpoint_in_use, ping_control, ping_control_full,
    remove_ipc_socket, transport_url, wait_for_server_ready,
};

/// Default receive timeout for control RPC calls.
pub const CONTROL_REQUEST_TIMEOUT_MS: i32 = 5000;

/// Spawns the server process a client should attach to.
pub trait ServerSpawner: Send {
    fn spawn_server(&self, port: u16, control_port: u16) -> Result<Child>;
}

/// Spawner launching a server binary with `--port <port>` appended.
pub struct CommandSpawner {
    pub program: std::path::PathBuf,
    pub args: Vec<String>,
}

impl ServerSpawner for CommandSpawner {
    fn spawn_server(&self, port: u16, _control_port: u16) -> Result<Child> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        Ok(command.spawn()?)
    }
}

/// A pong found by [`ClientCore::scan_servers`], annotated with its ports.
#[derive(Debug, Clone)]
pub struct DiscoveredServer {
    pub port: u16,
    pub control_port: u16,
    pub pong: PongResponse,
}

/// Connection state and protocol for one server endpoint.
///
/// A `ClientCore` targets a data port and derives the control port from
/// it. Concrete clients wrap it and supply the [`ServerSpawner`] hook;
/// the core owns the connect-or-spawn protocol, the control RPC path,
/// and the teardown rules.
///
/// ## Connect-or-Spawn Protocol
///
/// 1. Probe whether the data endpoint is in use.
/// 2. If in use, attempt the adoption handshake (a 500 ms ping that must
///    report ready).
/// 3. If the handshake fails on an occupied endpoint, clear the stale
///    server (kill the port holders, or remove IPC socket files) and
///    pause briefly.
/// 4. Spawn a server through the hook and wait for readiness.
///
/// ## Ownership Rules
///
/// - A server reached through the handshake is *adopted*: the client
///   must leave it running on disconnect, persistent or not.
/// - A server this client spawned is terminated on disconnect only when
///   the client is not persistent (graceful terminate, 5 s grace, then
///   kill).
pub struct ClientCore {
    config: RuntimeConfig,
    port: u16,
    control_port: u16,
    host: String,
    persistent: bool,
    transport_mode: TransportMode,
    server_process: Option<Child>,
    connected: bool,
    connected_to_existing: bool,
}

impl ClientCore {
    pub fn new(
        port: u16,
        host: impl Into<String>,
        persistent: bool,
        transport_mode: Option<TransportMode>,
        config: Option<RuntimeConfig>,
    ) -> Self {
        let config = config.unwrap_or_default();
        Self {
            control_port: config.control_port(port),
            port,
            host: host.into(),
            persistent,
            transport_mode: transport_mode.unwrap_or_else(default_transport_mode),
            server_process: None,
            connected: false,
            connected_to_existing: false,
            config,
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

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether connect adopted a server some other party started.
    pub fn connected_to_existing(&self) -> bool {
        self.connected_to_existing
    }

    /// Connect to the endpoint, spawning a server if none answers.
    ///
    /// Adoption requires a ready pong within 500 ms. An occupied endpoint
    /// that fails the handshake is assumed stale: its processes (or IPC
    /// files) are cleared before spawning a replacement.
    ///
    /// ## Parameters
    /// - `spawner`: hook that launches the right server process when no
    ///   existing server can be adopted
    /// - `timeout`: overall bound on the readiness wait after spawning
    ///
    /// ## Returns
    /// - `true`: connected, either by adoption (see
    ///   [`connected_to_existing`](Self::connected_to_existing)) or by a
    ///   spawned server reaching readiness in time
    /// - `false`: the spawn failed or the server never became ready; the
    ///   client remains disconnected
    ///
    /// ## Failure Semantics
    ///
    /// Probe and handshake failures never raise; they route the protocol
    /// to the next step. Spawn and readiness failures are logged and
    /// collapse to `false`, mirroring the boolean probe discipline of the
    /// transport layer.
    pub fn connect(&mut self, spawner: &dyn ServerSpawner, timeout: Duration) -> bool {
        if self.connected {
            return true;
        }

        if is_endpoint_in_use(self.port, &self.host, self.transport_mode, &self.config) {
            if self.try_connect_to_existing() {
                info!("Adopted existing server on port {}", self.port);
                self.connected = true;
                self.connected_to_existing = true;
                return true;
            }
            warn!(
                "Port {} occupied but handshake failed; clearing stale server",
                self.port
            );
            self.clear_stale_endpoint(self.port);
            self.clear_stale_endpoint(self.control_port);
            std::thread::sleep(Duration::from_millis(500));
        }

        match spawner.spawn_server(self.port, self.control_port) {
            Ok(child) => {
                info!("Spawned server process {} for port {}", child.id(), self.port);
                self.server_process = Some(child);
            }
            Err(e) => {
                error!("Failed to spawn server process: {}", e);
                return false;
            }
        }

        if !wait_for_server_ready(
            self.port,
            &self.host,
            self.transport_mode,
            &self.config,
            timeout,
        ) {
            error!("Server on port {} not ready within {:?}", self.port, timeout);
            return false;
        }
        self.connected = true;
        true
    }

    fn try_connect_to_existing(&self) -> bool {
        ping_control(
            self.port,
            &self.host,
            self.transport_mode,
            &self.config,
            500,
            true,
        )
    }

    fn clear_stale_endpoint(&self, port: u16) {
        if self.transport_mode == TransportMode::Ipc {
            remove_ipc_socket(port, &self.config);
        } else {
            kill_processes_on_port(port);
        }
    }

    /// Disconnect, terminating a spawned non-persistent server.
    ///
    /// Adopted servers are always left running.
    pub fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        if !self.connected_to_existing && !self.persistent {
            if let Some(mut child) = self.server_process.take() {
                info!("Terminating spawned server process {}", child.id());
                terminate_child(&mut child, Duration::from_secs(5));
            }
        }
        self.connected = false;
    }

    /// One control RPC: fresh REQ socket, send, await the reply.
    ///
    /// Opening a fresh socket per call keeps the REQ/REP state machine
    /// trivially correct even after timeouts, at the cost of a connect
    /// per request.
    ///
    /// ## Parameters
    /// - `request`: the control request to send
    /// - `timeout_ms`: receive timeout; [`CONTROL_REQUEST_TIMEOUT_MS`]
    ///   is the conventional default
    ///
    /// ## Returns
    /// - `Ok(ControlResponse)`: the server's reply for this turn, which
    ///   may itself be an `error` response
    /// - `Err(anyhow::Error)`: no reply arrived or the exchange failed
    ///
    /// ## Error Conditions
    ///
    /// - [`RequestTimeout`] (downcastable): the server did not reply
    ///   within `timeout_ms`
    /// - transport errors from socket setup, send, or receive
    /// - codec errors if the reply cannot be decoded
    pub fn send_control_request(
        &self,
        request: &ControlRequest,
        timeout_ms: i32,
    ) -> Result<ControlResponse> {
        let url = transport_url(
            self.control_port,
            &self.host,
            self.transport_mode,
            &self.config,
        )?;
        let ctx = zmq::Context::new();
        let socket = ctx.socket(zmq::REQ)?;
        socket.set_linger(0)?;
        socket.set_rcvtimeo(timeout_ms)?;
        socket.connect(&url)?;
        socket.send(encode_control_request(request)?, 0)?;
        match socket.recv_bytes(0) {
            Ok(raw) => decode_control_response(&raw),
            Err(zmq::Error::EAGAIN) => Err(RequestTimeout {
                request: request.type_name().to_string(),
                timeout_ms,
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Probe a list of ports, returning a pong per answering server.
    pub fn scan_servers(
        ports: &[u16],
        host: &str,
        timeout_ms: i32,
        transport_mode: Option<TransportMode>,
        config: Option<RuntimeConfig>,
    ) -> Vec<DiscoveredServer> {
        let mode = transport_mode.unwrap_or_else(default_transport_mode);
        let config = config.unwrap_or_default();
        ports
            .iter()
            .filter_map(|&port| {
                ping_control_full(port, host, mode, &config, timeout_ms).map(|pong| {
                    DiscoveredServer {
                        port,
                        control_port: config.control_port(port),
                        pong,
                    }
                })
            })
            .collect()
    }

    /// Stop the server on a port.
    ///
    /// ## Parameters
    /// - `port`: data port of the target server
    /// - `graceful`: choose the polite or the forced path
    /// - `timeout`: reply wait on the graceful path
    ///
    /// ## Returns
    /// - graceful path: `true` iff the server answered `shutdown` with a
    ///   shutdown ack within `timeout`
    /// - forced path: `true` when cleanup ran (IPC socket files removed,
    ///   or at least one port-holding process was killed)
    ///
    /// ## Behavior
    ///
    /// Graceful sends `shutdown` and awaits the ack; per the control
    /// protocol this kills the server's workers but leaves its loop
    /// alive. Forced sends `force_shutdown` without awaiting a reply and
    /// then cleans up regardless: IPC socket files are removed, or
    /// whatever still holds the TCP ports is killed.
    pub fn kill_server_on_port(
        port: u16,
        graceful: bool,
        timeout: Duration,
        transport_mode: Option<TransportMode>,
        host: &str,
        config: Option<RuntimeConfig>,
    ) -> bool {
        let mode = transport_mode.unwrap_or_else(default_transport_mode);
        let config = config.unwrap_or_default();
        let control_port = config.control_port(port);

        let attempt = |request: &ControlRequest, recv_timeout_ms: i32| -> Option<ControlResponse> {
            let url = transport_url(control_port, host, mode, &config).ok()?;
            let ctx = zmq::Context::new();
            let socket = ctx.socket(zmq::REQ).ok()?;
            socket.set_linger(0).ok()?;
            socket.set_sndtimeo(1000).ok()?;
            socket.set_rcvtimeo(recv_timeout_ms).ok()?;
            socket.connect(&url).ok()?;
            socket.send(encode_control_request(request).ok()?, 0).ok()?;
            if recv_timeout_ms == 0 {
                return None;
            }
            decode_control_response(&socket.recv_bytes(0).ok()?).ok()
        };

        if graceful {
            return matches!(
                attempt(&ControlRequest::Shutdown, timeout.as_millis() as i32),
                Some(ControlResponse::ShutdownAck { .. })
            );
        }

        // Forced: the reply is not awaited; cleanup below is the backstop.
        let _ = attempt(&ControlRequest::ForceShutdown, 0);
        if mode == TransportMode::Ipc {
            remove_ipc_socket(port, &config);
            remove_ipc_socket(control_port, &config);
            return true;
        }
        let killed = kill_processes_on_port(port) + kill_processes_on_port(control_port);
        killed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_request_timeout_is_typed() {
        // Nothing listens on this port; the RPC must time out, not hang.
        let core = ClientCore::new(7971, "127.0.0.1", true, Some(TransportMode::Tcp), None);
        let err = core
            .send_control_request(&ControlRequest::Ping, 200)
            .unwrap_err();
        let timeout = err.downcast_ref::<RequestTimeout>().expect("typed timeout");
        assert_eq!(timeout.request, "ping");
        assert_eq!(timeout.timeout_ms, 200);
    }

    #[test]
    fn test_scan_servers_empty_when_nothing_answers() {
        let found = ClientCore::scan_servers(
            &[7972, 7973],
            "127.0.0.1",
            100,
            Some(TransportMode::Tcp),
            None,
        );
        assert!(found.is_empty());
    }

    #[test]
    fn test_ports_derived_from_config() {
        let core = ClientCore::new(7777, "localhost", false, Some(TransportMode::Tcp), None);
        assert_eq!(core.port(), 7777);
        assert_eq!(core.control_port(), 8777);
        assert!(!core.is_connected());
        assert!(!core.connected_to_existing());
    }

    #[test]
    fn test_disconnect_without_connect_is_noop() {
        let mut core = ClientCore::new(7974, "127.0.0.1", false, Some(TransportMode::Tcp), None);
        core.disconnect();
        assert!(!core.is_connected());
    }
}
