//! Small helpers shared across the runtime.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as seconds since the Unix epoch.
///
/// Wire timestamps (progress updates, acks, execution records) are all
/// epoch-second floats. If the system clock is before the epoch the
/// function returns 0.0 rather than panicking.
pub fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Resolve a host string and port to a socket address for bind probes.
///
/// The wildcard host `*` used by servers maps to `0.0.0.0`. Returns `None`
/// when resolution fails; probe callers collapse that to "not available".
pub fn resolve_addr(host: &str, port: u16) -> Option<SocketAddr> {
    let host = if host == "*" { "0.0.0.0" } else { host };
    (host, port).to_socket_addrs().ok()?.next()
}
