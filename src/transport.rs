//! Endpoint construction, liveness probing and readiness waiting.
//!
//! Endpoints come in two modes: TCP (`tcp://host:port`) and IPC
//! (`ipc://~/.<app>/<dir>/<prefix>-<port><ext>`, POSIX only). Every probe
//! in this module returns a boolean and never panics; transient socket
//! errors collapse to "not available" so that connect-or-spawn logic can
//! treat the answers as facts rather than exceptions.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use socket2::{Domain, Socket, Type};
use tracing::{debug, warn};

use crate::config::{RuntimeConfig, TransportMode};
use crate::messages::{
    decode_control_response, encode_control_request, ControlRequest, ControlResponse, PongResponse,
};
use crate::utils::resolve_addr;

/// Platform-appropriate default: IPC on POSIX, TCP on Windows.
pub fn default_transport_mode() -> TransportMode {
    if cfg!(windows) {
        TransportMode::Tcp
    } else {
        TransportMode::Ipc
    }
}

/// Filesystem path of the IPC socket for a port, `None` on Windows.
pub fn ipc_socket_path(port: u16, config: &RuntimeConfig) -> Option<PathBuf> {
    if cfg!(windows) {
        return None;
    }
    let home = etcetera::home_dir().ok()?;
    let socket_name = format!(
        "{}-{}{}",
        config.ipc_socket_prefix, port, config.ipc_socket_extension
    );
    Some(
        home.join(format!(".{}", config.app_name))
            .join(&config.ipc_socket_dir)
            .join(socket_name),
    )
}

/// Transport URL for a port/host/mode.
///
/// ## Parameters
/// - `port`: endpoint port (data, control, or ack)
/// - `host`: host name or `*` for wildcard binds; ignored for IPC
/// - `mode`: TCP or IPC
/// - `config`: supplies the IPC naming scheme
///
/// ## Returns
/// - `Ok(url)`: `tcp://host:port`, or `ipc://<path>` with the socket
///   file's parent directory created on demand
/// - `Err(anyhow::Error)`: IPC requested on Windows, the home directory
///   could not be resolved, or directory creation failed
pub fn transport_url(
    port: u16,
    host: &str,
    mode: TransportMode,
    config: &RuntimeConfig,
) -> Result<String> {
    match mode {
        TransportMode::Tcp => Ok(format!("tcp://{host}:{port}")),
        TransportMode::Ipc => {
            if cfg!(windows) {
                return Err(anyhow!(
                    "IPC transport mode is not supported on Windows; use TCP instead"
                ));
            }
            let path = ipc_socket_path(port, config)
                .ok_or_else(|| anyhow!("IPC socket path could not be determined"))?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            Ok(format!("ipc://{}", path.display()))
        }
    }
}

/// Delete a stale IPC socket file. Returns whether a file was removed.
pub fn remove_ipc_socket(port: u16, config: &RuntimeConfig) -> bool {
    let Some(path) = ipc_socket_path(port, config) else {
        return false;
    };
    if !path.exists() {
        return false;
    }
    match fs::remove_file(&path) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to remove IPC socket {}: {}", path.display(), e);
            false
        }
    }
}

/// Whether an endpoint looks occupied.
///
/// TCP: a bind probe on `(host, port)`; bind failure means something is
/// listening there. IPC: existence of the socket file.
pub fn is_endpoint_in_use(
    port: u16,
    host: &str,
    mode: TransportMode,
    config: &RuntimeConfig,
) -> bool {
    match mode {
        TransportMode::Ipc => ipc_socket_path(port, config).is_some_and(|p| p.exists()),
        TransportMode::Tcp => {
            let Some(addr) = resolve_addr(host, port) else {
                return false;
            };
            let Ok(socket) = Socket::new(Domain::for_address(addr), Type::STREAM, None) else {
                return false;
            };
            socket.bind(&addr.into()).is_err()
        }
    }
}

/// Ping the control endpoint of `port` and return the full pong, if any.
///
/// Opens a fresh REQ socket with `timeout_ms` on both directions; any
/// failure along the way yields `None`.
pub fn ping_control_full(
    port: u16,
    host: &str,
    mode: TransportMode,
    config: &RuntimeConfig,
    timeout_ms: i32,
) -> Option<PongResponse> {
    let control_port = config.control_port(port);
    let url = transport_url(control_port, host, mode, config).ok()?;

    let ctx = zmq::Context::new();
    let socket = ctx.socket(zmq::REQ).ok()?;
    socket.set_linger(0).ok()?;
    socket.set_rcvtimeo(timeout_ms).ok()?;
    socket.set_sndtimeo(timeout_ms).ok()?;
    socket.connect(&url).ok()?;

    let request = encode_control_request(&ControlRequest::Ping).ok()?;
    socket.send(request, 0).ok()?;
    let raw = socket.recv_bytes(0).ok()?;
    match decode_control_response(&raw) {
        Ok(ControlResponse::Pong(pong)) => Some(pong),
        _ => None,
    }
}

/// Boolean ping; with `require_ready` the pong must also report `ready`.
pub fn ping_control(
    port: u16,
    host: &str,
    mode: TransportMode,
    config: &RuntimeConfig,
    timeout_ms: i32,
    require_ready: bool,
) -> bool {
    match ping_control_full(port, host, mode, config, timeout_ms) {
        Some(pong) => !require_ready || pong.ready,
        None => false,
    }
}

/// Wait until a server on `port` is bound and answering ready pongs.
///
/// ## Phases
///
/// Both bounded by the same `timeout`:
///
/// 1. Poll (100 ms cadence) until both the data and the control endpoint
///    look in use, i.e. the server has bound its sockets.
/// 2. Ping (500 ms handshake, 200 ms cadence) until the control endpoint
///    answers a pong with `ready = true`.
///
/// ## Returns
/// - `true`: the server completed setup and answered a ready pong
/// - `false`: the deadline elapsed in either phase; like every probe in
///   this module, the failure is a value, never a panic
pub fn wait_for_server_ready(
    port: u16,
    host: &str,
    mode: TransportMode,
    config: &RuntimeConfig,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    let control_port = config.control_port(port);

    loop {
        if is_endpoint_in_use(port, host, mode, config)
            && is_endpoint_in_use(control_port, host, mode, config)
        {
            debug!("Endpoints for port {} bound; waiting for ready pong", port);
            break;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    while Instant::now() < deadline {
        if ping_control(port, host, mode, config, 500, true) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_default_mode_matches_platform() {
        let mode = default_transport_mode();
        if cfg!(windows) {
            assert_eq!(mode, TransportMode::Tcp);
        } else {
            assert_eq!(mode, TransportMode::Ipc);
        }
    }

    #[test]
    fn test_tcp_url() {
        let config = RuntimeConfig::default();
        let url = transport_url(5555, "localhost", TransportMode::Tcp, &config).unwrap();
        assert_eq!(url, "tcp://localhost:5555");
    }

    #[cfg(unix)]
    #[test]
    fn test_ipc_path_and_url() {
        let config = RuntimeConfig {
            app_name: "zmqruntime-test".to_string(),
            ipc_socket_prefix: "test".to_string(),
            ..Default::default()
        };
        let path = ipc_socket_path(5555, &config).unwrap();
        assert!(path.to_string_lossy().ends_with("test-5555.sock"));
        assert!(path.to_string_lossy().contains(".zmqruntime-test"));

        let url = transport_url(5555, "*", TransportMode::Ipc, &config).unwrap();
        assert!(url.starts_with("ipc://"));
    }

    #[cfg(windows)]
    #[test]
    fn test_ipc_rejected_on_windows() {
        let config = RuntimeConfig::default();
        assert!(ipc_socket_path(5555, &config).is_none());
        assert!(transport_url(5555, "*", TransportMode::Ipc, &config).is_err());
        assert!(!remove_ipc_socket(5555, &config));
    }

    #[cfg(unix)]
    #[test]
    fn test_remove_ipc_socket_clears_endpoint() {
        let config = RuntimeConfig {
            app_name: "zmqruntime-test".to_string(),
            ipc_socket_prefix: "rm".to_string(),
            ..Default::default()
        };
        let path = ipc_socket_path(5601, &config).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"stale").unwrap();

        assert!(is_endpoint_in_use(5601, "*", TransportMode::Ipc, &config));
        assert!(remove_ipc_socket(5601, &config));
        assert!(!is_endpoint_in_use(5601, "*", TransportMode::Ipc, &config));
        assert!(!remove_ipc_socket(5601, &config));
    }

    #[test]
    fn test_tcp_in_use_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = RuntimeConfig::default();

        assert!(is_endpoint_in_use(port, "127.0.0.1", TransportMode::Tcp, &config));
        drop(listener);
        assert!(!is_endpoint_in_use(port, "127.0.0.1", TransportMode::Tcp, &config));
    }

    #[test]
    fn test_ping_unreachable_port_is_false() {
        let config = RuntimeConfig::default();
        assert!(!ping_control(1, "localhost", TransportMode::Tcp, &config, 100, false));
        assert!(
            ping_control_full(1, "localhost", TransportMode::Tcp, &config, 100).is_none()
        );
    }
}
