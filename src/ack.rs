//! Global acknowledgement listener.
//!
//! One PULL socket per process receives [`ImageAck`] messages from every
//! viewer on the shared ack port and fans them out to registered
//! callbacks. The default callback routes each ack through the
//! [`TrackerRegistry`](crate::tracker::TrackerRegistry) to the matching
//! viewer's queue tracker.
//!
//! The listener exclusively owns its receive socket and background
//! thread. `start` is idempotent; `stop` flips the run flag, which the
//! loop observes on its next one-second poll.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::{RuntimeConfig, TransportMode};
use crate::messages::ImageAck;
use crate::tracker::TrackerRegistry;
use crate::transport::{default_transport_mode, transport_url};

type AckCallback = Arc<dyn Fn(&ImageAck) + Send + Sync + 'static>;

/// Singleton listener for acknowledgement messages from viewers.
///
/// ## Loop Behavior
///
/// The background thread polls its PULL socket with a one-second
/// timeout. Each received message is JSON-decoded into an [`ImageAck`]
/// and handed to every registered callback on a snapshot of the
/// callback list, with panic isolation per callback. Transport errors
/// are logged with a 100 ms backoff; a fatal setup error (socket
/// creation or bind) logs and ends the thread.
///
/// ## Callback Semantics
///
/// The callback list is append-only during normal use and iterated
/// under snapshot semantics (copy, then call), so registering a
/// callback from inside a callback is safe. One callback's panic must
/// not prevent the others from running.
pub struct AckListener {
    callbacks: Arc<Mutex<Vec<AckCallback>>>,
    running: Arc<AtomicBool>,
}

static LISTENER: Lazy<AckListener> = Lazy::new(|| {
    let listener = AckListener::new();
    // Default routing: ack -> registry -> tracker.mark_processed.
    listener.register_callback(|ack: &ImageAck| {
        if let Some(tracker) = TrackerRegistry::global().get(ack.viewer_port) {
            tracker.mark_processed(&ack.image_id);
        }
    });
    listener
});

impl AckListener {
    fn new() -> Self {
        Self {
            callbacks: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The process-wide listener instance.
    pub fn global() -> &'static AckListener {
        &LISTENER
    }

    /// Register an additional callback invoked for every received ack.
    pub fn register_callback(&self, callback: impl Fn(&ImageAck) + Send + Sync + 'static) {
        self.callbacks.lock().push(Arc::new(callback));
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the background receive loop on `port`.
    ///
    /// Idempotent: a running listener returns immediately, so every
    /// streaming component in the process can call this unconditionally.
    ///
    /// ## Parameters
    /// - `port`: the shared ack port to bind the PULL socket on
    /// - `mode`: transport mode, platform default when `None`
    /// - `host`: bind host, typically `*`
    /// - `config`: runtime configuration, defaults when `None`
    ///
    /// ## Failure Semantics
    ///
    /// Setup failures (unresolvable endpoint, thread spawn, bind) are
    /// logged and clear the running flag; they never raise, matching the
    /// listener's fire-and-forget role.
    pub fn start(
        &self,
        port: u16,
        mode: Option<TransportMode>,
        host: &str,
        config: Option<RuntimeConfig>,
    ) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Ack listener already running");
            return;
        }
        let mode = mode.unwrap_or_else(default_transport_mode);
        let config = config.unwrap_or_default();
        let url = match transport_url(port, host, mode, &config) {
            Ok(url) => url,
            Err(e) => {
                error!("Cannot resolve ack listener endpoint: {}", e);
                self.running.store(false, Ordering::SeqCst);
                return;
            }
        };

        let running = self.running.clone();
        let callbacks = self.callbacks.clone();
        let spawned = std::thread::Builder::new()
            .name("ack-listener".to_string())
            .spawn(move || listener_loop(&url, &running, &callbacks));
        if let Err(e) = spawned {
            error!("Failed to spawn ack listener thread: {}", e);
            self.running.store(false, Ordering::SeqCst);
        }
    }

    /// Signal the loop to exit; resources are released by the thread.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn listener_loop(url: &str, running: &AtomicBool, callbacks: &Mutex<Vec<AckCallback>>) {
    let ctx = zmq::Context::new();
    let socket = match ctx.socket(zmq::PULL) {
        Ok(socket) => socket,
        Err(e) => {
            error!("Fatal error creating ack socket: {}", e);
            running.store(false, Ordering::SeqCst);
            return;
        }
    };
    if let Err(e) = socket.set_linger(0).and_then(|_| socket.bind(url)) {
        error!("Fatal error binding ack listener to {}: {}", url, e);
        running.store(false, Ordering::SeqCst);
        return;
    }
    info!("Ack listener bound to {}", url);

    while running.load(Ordering::SeqCst) {
        match socket.poll(zmq::POLLIN, 1000) {
            Ok(0) => continue,
            Ok(_) => match socket.recv_string(0) {
                Ok(Ok(raw)) => match serde_json::from_str::<ImageAck>(&raw) {
                    Ok(ack) => dispatch(&ack, callbacks),
                    Err(e) => error!("Failed to parse ack message: {}", e),
                },
                Ok(Err(_)) => error!("Ack message was not valid UTF-8"),
                Err(e) => {
                    if running.load(Ordering::SeqCst) {
                        error!("Socket error in ack listener: {}", e);
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            },
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    error!("Poll error in ack listener: {}", e);
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }
    info!("Ack listener stopped");
}

/// Invoke every callback on a snapshot of the list, isolating failures.
///
/// The snapshot makes registration during a callback safe; a panicking
/// callback is logged and must not prevent the others from running.
fn dispatch(ack: &ImageAck, callbacks: &Mutex<Vec<AckCallback>>) {
    let snapshot: Vec<AckCallback> = callbacks.lock().clone();
    for callback in snapshot {
        if catch_unwind(AssertUnwindSafe(|| callback(ack))).is_err() {
            error!("Ack callback panicked for image {}", ack.image_id);
        }
    }
}
