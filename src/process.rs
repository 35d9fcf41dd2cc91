//! Supervision of spawned worker and companion processes.
//!
//! The execution server must reap its own workers on cancellation without
//! ever touching paired viewer processes. Ownership makes that exact:
//! workers are spawned through a [`WorkerSupervisor`], which keeps the
//! `Child` handles and tags each child's environment, so killing and
//! reaping operate only on processes this server created.

use std::io;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::messages::WorkerInfo;

#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Environment variable stamped on every supervised worker process.
///
/// Holds the supervising process id; lets operators and tooling identify
/// owned workers without command-line matching.
pub const WORKER_ENV_TAG: &str = "ZMQRUNTIME_WORKER";

struct SupervisedChild {
    child: Child,
    spawned_at: Instant,
}

/// Owns every worker process spawned by an execution server.
///
/// ## Ownership Model
///
/// Tasks spawn helper processes exclusively through
/// [`spawn`](Self::spawn), so the supervisor holds the `Child` handle of
/// every worker it may later have to kill. Identification is by
/// ownership, never by command-line matching: paired viewer processes
/// are invisible to the supervisor and can never be collateral damage of
/// a cancellation. Each child's environment additionally carries
/// [`WORKER_ENV_TAG`] with the supervising pid for operators and
/// tooling.
///
/// ## Threading
///
/// All operations take the internal child-list lock, so the control
/// handler (cancellation, pong augmentation) and the queue worker
/// (cleanup after each task) may call in concurrently.
#[derive(Default)]
pub struct WorkerSupervisor {
    children: Mutex<Vec<SupervisedChild>>,
}

impl WorkerSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a worker under supervision, tagging its environment.
    ///
    /// ## Parameters
    /// - `command`: fully configured command; the supervisor only adds
    ///   the [`WORKER_ENV_TAG`] environment variable
    ///
    /// ## Returns
    /// - `Ok(pid)`: the child is running and owned by this supervisor
    /// - `Err(io::Error)`: the spawn failed and nothing is tracked
    pub fn spawn(&self, mut command: Command) -> io::Result<u32> {
        command.env(WORKER_ENV_TAG, std::process::id().to_string());
        let child = command.spawn()?;
        let pid = child.id();
        debug!("Spawned worker process {}", pid);
        self.children.lock().push(SupervisedChild {
            child,
            spawned_at: Instant::now(),
        });
        Ok(pid)
    }

    /// Number of supervised workers that are still alive.
    pub fn live_count(&self) -> usize {
        let mut count = 0;
        for c in self.children.lock().iter_mut() {
            if matches!(c.child.try_wait(), Ok(None)) {
                count += 1;
            }
        }
        count
    }

    /// Harvest workers that already exited on their own.
    pub fn reap_exited(&self) -> usize {
        let mut children = self.children.lock();
        let before = children.len();
        children.retain_mut(|c| !matches!(c.child.try_wait(), Ok(Some(_))));
        let reaped = before - children.len();
        if reaped > 0 {
            debug!("Reaped {} exited worker processes", reaped);
        }
        reaped
    }

    /// Metadata for every supervised worker, for pong augmentation.
    pub fn worker_info(&self) -> Vec<WorkerInfo> {
        self.children
            .lock()
            .iter_mut()
            .map(|c| WorkerInfo {
                pid: c.child.id(),
                status: match c.child.try_wait() {
                    Ok(None) => "running",
                    Ok(Some(_)) => "exited",
                    Err(_) => "unknown",
                }
                .to_string(),
                uptime: c.spawned_at.elapsed().as_secs_f64(),
            })
            .collect()
    }

    /// Kill every supervised worker.
    ///
    /// ## Escalation
    ///
    /// 1. Already-exited children are reaped.
    /// 2. Live workers get a termination signal (SIGTERM on Unix) and up
    ///    to 3 seconds to exit.
    /// 3. Survivors are hard-killed, with one more second of waiting.
    ///
    /// ## Returns
    ///
    /// The total number of processes affected: zombies reaped plus live
    /// workers signalled. The supervisor's child list is empty
    /// afterwards.
    pub fn kill_all(&self) -> usize {
        let drained: Vec<SupervisedChild> = {
            let mut children = self.children.lock();
            children.drain(..).collect()
        };

        let mut zombies = 0usize;
        let mut live: Vec<SupervisedChild> = Vec::new();
        for mut entry in drained {
            match entry.child.try_wait() {
                Ok(Some(_)) => zombies += 1,
                _ => live.push(entry),
            }
        }
        if zombies > 0 {
            info!("Reaped {} zombie worker processes", zombies);
        }
        if live.is_empty() {
            if zombies == 0 {
                debug!("No live worker processes found to kill");
            }
            return zombies;
        }

        info!("Found {} live worker processes to kill", live.len());
        for entry in &live {
            signal_terminate(&entry.child);
        }
        wait_for_exit(&mut live, Duration::from_secs(3));

        for entry in &mut live {
            if matches!(entry.child.try_wait(), Ok(None)) {
                if let Err(e) = entry.child.kill() {
                    warn!("Failed to kill worker {}: {}", entry.child.id(), e);
                }
            }
        }
        wait_for_exit(&mut live, Duration::from_secs(1));

        let total = live.len() + zombies;
        info!(
            "Killed {} worker processes and reaped {} zombies",
            live.len(),
            zombies
        );
        total
    }
}

#[cfg(unix)]
fn signal_terminate(child: &Child) {
    if let Err(e) = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
        debug!("SIGTERM to worker {} failed: {}", child.id(), e);
    }
}

#[cfg(not(unix))]
fn signal_terminate(child: &Child) {
    // No graceful termination signal on this platform; the hard-kill pass
    // in kill_all covers it.
    let _ = child;
}

fn wait_for_exit(children: &mut [SupervisedChild], timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if children
            .iter_mut()
            .all(|c| matches!(c.child.try_wait(), Ok(Some(_))))
        {
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Terminate one child gracefully, escalating to a hard kill.
///
/// Returns true when the child exited within the grace period; a false
/// return means it had to be killed.
pub fn terminate_child(child: &mut Child, grace: Duration) -> bool {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return true;
    }
    signal_terminate(child);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    if let Err(e) = child.kill() {
        warn!("Failed to kill process {}: {}", child.id(), e);
    }
    let _ = child.wait();
    false
}

/// Lifecycle holder for one long-lived companion process, e.g. a viewer.
#[derive(Default)]
pub struct ManagedProcess {
    child: Mutex<Option<Child>>,
}

impl ManagedProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch the process; a no-op returning the pid while it is running.
    ///
    /// With `detached` the child is placed in its own process group so it
    /// survives a terminal-driven interrupt of the parent.
    pub fn start(&self, command: &mut Command, detached: bool) -> io::Result<u32> {
        let mut guard = self.child.lock();
        if let Some(child) = guard.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return Ok(child.id());
            }
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        if detached {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        #[cfg(not(unix))]
        let _ = detached;

        let child = command.spawn()?;
        let pid = child.id();
        info!("Started managed process {}", pid);
        *guard = Some(child);
        Ok(pid)
    }

    /// Stop the process: terminate, wait up to `timeout`, then kill.
    pub fn stop(&self, timeout: Duration) {
        if let Some(mut child) = self.child.lock().take() {
            terminate_child(&mut child, timeout);
        }
    }

    pub fn is_running(&self) -> bool {
        self.child
            .lock()
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sleep_command(seconds: u32) -> Command {
        let mut command = Command::new("sleep");
        command.arg(seconds.to_string());
        command
    }

    #[test]
    fn test_spawn_and_kill_all() {
        let supervisor = WorkerSupervisor::new();
        supervisor.spawn(sleep_command(30)).unwrap();
        supervisor.spawn(sleep_command(30)).unwrap();
        assert_eq!(supervisor.live_count(), 2);

        let info = supervisor.worker_info();
        assert_eq!(info.len(), 2);
        assert!(info.iter().all(|w| w.status == "running" && w.pid > 0));

        assert_eq!(supervisor.kill_all(), 2);
        assert_eq!(supervisor.live_count(), 0);
        // Second pass finds nothing left to do.
        assert_eq!(supervisor.kill_all(), 0);
    }

    #[test]
    fn test_env_tag_reaches_worker() {
        let supervisor = WorkerSupervisor::new();
        // The child exits immediately iff the tag is present, otherwise it
        // lingers; reap_exited then tells us which happened.
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(format!("[ -n \"${WORKER_ENV_TAG}\" ] && exit 0; sleep 30"));
        supervisor.spawn(command).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while supervisor.live_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(supervisor.reap_exited(), 1);
    }

    #[test]
    fn test_kill_all_reaps_zombies() {
        let supervisor = WorkerSupervisor::new();
        let mut command = Command::new("true");
        command.stdout(Stdio::null());
        supervisor.spawn(command).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(supervisor.kill_all(), 1);
    }

    #[test]
    fn test_terminate_child_grace() {
        let mut child = sleep_command(30).spawn().unwrap();
        assert!(terminate_child(&mut child, Duration::from_secs(2)));
    }

    #[test]
    fn test_managed_process_lifecycle() {
        let manager = ManagedProcess::new();
        assert!(!manager.is_running());

        let pid = manager.start(&mut sleep_command(30), true).unwrap();
        assert!(manager.is_running());
        // Starting again while running is a no-op on the same child.
        assert_eq!(manager.start(&mut sleep_command(30), true).unwrap(), pid);

        manager.stop(Duration::from_secs(2));
        assert!(!manager.is_running());
    }
}
