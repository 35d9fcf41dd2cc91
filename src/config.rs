//! Transport configuration for the runtime.
//!
//! All endpoint math flows through [`RuntimeConfig`]: the data channel binds
//! the user-chosen port and the control channel always sits at
//! `data_port + control_port_offset`. Keeping the arithmetic in one place is
//! what makes the dual-channel invariant testable.

use serde::{Deserialize, Serialize};

/// Transport mode for runtime sockets.
///
/// TCP endpoints are `tcp://host:port`; IPC endpoints are filesystem
/// sockets under the application directory. IPC is unavailable on Windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Tcp,
    Ipc,
}

/// Immutable configuration shared by servers, clients and listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Offset added to the data port to derive the control port.
    pub control_port_offset: u16,

    /// Data port used when a server is created without an explicit port.
    pub default_port: u16,

    /// Directory (under `~/.<app_name>/`) holding IPC socket files.
    pub ipc_socket_dir: String,

    /// Filename prefix for IPC socket files.
    pub ipc_socket_prefix: String,

    /// Filename extension for IPC socket files.
    pub ipc_socket_extension: String,

    /// Process-wide PULL port where viewers push image acknowledgements.
    pub shared_ack_port: u16,

    /// Application name; the IPC directory lives at `~/.<app_name>/`.
    pub app_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            control_port_offset: 1000,
            default_port: 7777,
            ipc_socket_dir: "ipc".to_string(),
            ipc_socket_prefix: "zmq".to_string(),
            ipc_socket_extension: ".sock".to_string(),
            shared_ack_port: 7555,
            app_name: "zmqruntime".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Control port for a given data port. Always `data_port + offset`.
    pub fn control_port(&self, data_port: u16) -> u16 {
        data_port + self.control_port_offset
    }
}
