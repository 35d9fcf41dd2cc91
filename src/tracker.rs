//! Per-viewer queue tracking for streamed images.
//!
//! A [`QueueTracker`] counts images sent to one viewer and images the
//! viewer has acknowledged, so a UI can show progress like "3/10 images
//! processed" and detect images stuck in a blocked viewer. The
//! process-wide [`TrackerRegistry`] indexes trackers by viewer port; the
//! ack listener uses it to route incoming acks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, info};

/// Default time before a pending image counts as stuck.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct TrackerState {
    pending: HashMap<String, Instant>,
    processed: HashSet<String>,
    total_sent: u64,
    total_processed: u64,
}

/// Thread-safe pending/processed accounting for a single viewer.
///
/// Senders call [`register_sent`](Self::register_sent) as images go out;
/// the ack listener calls [`mark_processed`](Self::mark_processed) as acks
/// arrive. All operations are mutually exclusive under one internal lock,
/// so observers never see an id in both the pending and processed sets.
///
/// ## Accounting Invariants
///
/// - `total_processed <= total_sent` at all times.
/// - An ack for an image the tracker never saw counts retroactively as
///   both sent and processed, exactly once; cross-process senders may
///   stream to the viewer without touching this registry.
///
/// ## Stuck Detection
///
/// Every pending entry carries its send instant. Entries older than the
/// tracker's timeout are reported by
/// [`stuck_images`](Self::stuck_images), letting a UI flag a viewer that
/// stopped consuming.
pub struct QueueTracker {
    viewer_port: u16,
    viewer_type: String,
    timeout: Duration,
    state: Mutex<TrackerState>,
}

impl QueueTracker {
    pub fn new(viewer_port: u16, viewer_type: impl Into<String>) -> Self {
        Self::with_timeout(viewer_port, viewer_type, DEFAULT_ACK_TIMEOUT)
    }

    pub fn with_timeout(
        viewer_port: u16,
        viewer_type: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            viewer_port,
            viewer_type: viewer_type.into(),
            timeout,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn viewer_port(&self) -> u16 {
        self.viewer_port
    }

    pub fn viewer_type(&self) -> &str {
        &self.viewer_type
    }

    /// Record that an image was sent to the viewer.
    pub fn register_sent(&self, image_id: &str) {
        let mut state = self.state.lock();
        state.pending.insert(image_id.to_string(), Instant::now());
        state.total_sent += 1;
        debug!(
            "[{}:{}] Registered sent image {} (pending: {})",
            self.viewer_type,
            self.viewer_port,
            image_id,
            state.pending.len()
        );
    }

    /// Mark an image as processed (ack received).
    ///
    /// ## Parameters
    /// - `image_id`: id carried by the viewer's acknowledgement
    ///
    /// ## Behavior
    ///
    /// A pending image moves to the processed set and bumps the
    /// processed counter. An ack for an image this tracker never saw is
    /// counted retroactively as both sent and processed: cross-process
    /// senders may stream to the viewer without going through this
    /// registry. A duplicate ack for an already-processed image is a
    /// no-op either way.
    pub fn mark_processed(&self, image_id: &str) {
        let mut state = self.state.lock();
        if let Some(sent_at) = state.pending.remove(image_id) {
            state.processed.insert(image_id.to_string());
            state.total_processed += 1;
            debug!(
                "[{}:{}] Marked processed {} (took {:.2}s, pending: {})",
                self.viewer_type,
                self.viewer_port,
                image_id,
                sent_at.elapsed().as_secs_f64(),
                state.pending.len()
            );
            if state.pending.is_empty() && state.total_sent > 0 {
                info!(
                    "[{}:{}] All {} images processed",
                    self.viewer_type, self.viewer_port, state.total_sent
                );
            }
        } else if !state.processed.contains(image_id) {
            state.processed.insert(image_id.to_string());
            state.total_processed += 1;
            state.total_sent += 1;
            debug!(
                "[{}:{}] Ack for unregistered image {}, counted retroactively ({}/{})",
                self.viewer_type,
                self.viewer_port,
                image_id,
                state.total_processed,
                state.total_sent
            );
        }
    }

    /// Current progress as `(processed, sent)`.
    pub fn progress(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.total_processed, state.total_sent)
    }

    /// Number of images sent but not yet acknowledged.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether any pending image has outlived the ack timeout.
    pub fn has_stuck_images(&self) -> bool {
        let state = self.state.lock();
        state.pending.values().any(|sent| sent.elapsed() > self.timeout)
    }

    /// Pending images older than the timeout, with elapsed seconds.
    pub fn stuck_images(&self) -> Vec<(String, f64)> {
        let state = self.state.lock();
        state
            .pending
            .iter()
            .filter(|(_, sent)| sent.elapsed() > self.timeout)
            .map(|(id, sent)| (id.clone(), sent.elapsed().as_secs_f64()))
            .collect()
    }

    /// Drop all tracking data, e.g. when the viewer is closed.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        *state = TrackerState::default();
        debug!("[{}:{}] Cleared queue tracker", self.viewer_type, self.viewer_port);
    }

    /// Reset counters for a fresh batch while keeping the tracker alive.
    pub fn reset_for_new_batch(&self) {
        let mut state = self.state.lock();
        *state = TrackerState::default();
        debug!(
            "[{}:{}] Reset queue tracker for new batch",
            self.viewer_type, self.viewer_port
        );
    }
}

/// Process-wide registry of queue trackers, indexed by viewer port.
///
/// A lazily-initialized singleton; the ack listener's default callback
/// resolves each ack's `viewer_port` here. Returned tracker handles stay
/// valid until explicit removal.
pub struct TrackerRegistry {
    trackers: Mutex<HashMap<u16, Arc<QueueTracker>>>,
}

static REGISTRY: Lazy<TrackerRegistry> = Lazy::new(|| {
    info!("Initialized queue tracker registry");
    TrackerRegistry {
        trackers: Mutex::new(HashMap::new()),
    }
});

impl TrackerRegistry {
    /// The process-wide registry instance.
    pub fn global() -> &'static TrackerRegistry {
        &REGISTRY
    }

    /// Existing tracker for the port, or a new one with default timeout.
    pub fn get_or_create(&self, viewer_port: u16, viewer_type: &str) -> Arc<QueueTracker> {
        let mut trackers = self.trackers.lock();
        trackers
            .entry(viewer_port)
            .or_insert_with(|| {
                info!(
                    "Created queue tracker for {} viewer on port {}",
                    viewer_type, viewer_port
                );
                Arc::new(QueueTracker::new(viewer_port, viewer_type))
            })
            .clone()
    }

    pub fn get(&self, viewer_port: u16) -> Option<Arc<QueueTracker>> {
        self.trackers.lock().get(&viewer_port).cloned()
    }

    pub fn remove(&self, viewer_port: u16) {
        if self.trackers.lock().remove(&viewer_port).is_some() {
            info!("Removed queue tracker for viewer on port {}", viewer_port);
        }
    }

    /// Insert a pre-built tracker, replacing any existing one for the port.
    ///
    /// Lets callers register trackers with non-default timeouts.
    pub fn insert(&self, tracker: Arc<QueueTracker>) {
        self.trackers.lock().insert(tracker.viewer_port(), tracker);
    }

    pub fn all(&self) -> HashMap<u16, Arc<QueueTracker>> {
        self.trackers.lock().clone()
    }

    /// Drop every tracker, e.g. on shutdown or between tests.
    pub fn clear_all(&self) {
        self.trackers.lock().clear();
        info!("Cleared all queue trackers");
    }
}
