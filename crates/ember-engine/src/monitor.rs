//! Filesystem monitor with silence-window coalescing.
//!
//! One coordinator thread owns the watch table; each watch gets a
//! waiter thread that observes its directory tree and coalesces runs
//! of changes: a notification fires only after the silence period
//! elapses with no further change. Unreachable paths are repolled on
//! the failed-network interval, and healthy remote paths are
//! rescanned on a longer interval to guard against lost
//! notifications. Drive-arrival events feed the same channel.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver, Sender},
    thread,
    time::{Duration, Instant, SystemTime},
};

use ember_core::error::{EmberError, EmberResult};
use tracing::{debug, trace, warn};

/// Retries of the waiter-thread startup handshake, 10 ms apart.
pub const MON_THREAD_INIT_RETRIES: u32 = 1000;
pub const MON_THREAD_INIT_WAIT: Duration = Duration::from_millis(10);

/// Repoll interval while a watched path is unreachable.
pub const MON_NETWORK_FAILED_RETRY: Duration = Duration::from_secs(60);
/// Full rescan interval for healthy watches, in case a change
/// notification was lost.
pub const MON_NETWORK_HEALTHY_RESCAN: Duration = Duration::from_secs(120);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

pub type WatchId = u64;

/// Notification delivered to the monitor's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorNotification {
    /// A watched tree changed and its silence window elapsed.
    Changed { watch: WatchId, path: PathBuf },
    /// A watched path became unreachable.
    Lost { watch: WatchId, path: PathBuf },
    /// A drive appeared or disappeared.
    Drive { letter: char, arrived: bool },
}

enum CoordinatorMessage {
    AddWatch {
        watch: WatchId,
        path: PathBuf,
        recursive: bool,
        silence: Duration,
    },
    RemoveWatch {
        watch: WatchId,
    },
    DriveStatus {
        letter: char,
        arrived: bool,
    },
    Shutdown,
}

/// The filesystem monitor. Dropping it stops the coordinator and all
/// waiters.
pub struct Monitor {
    coordinator: Sender<CoordinatorMessage>,
    coordinator_thread: Option<thread::JoinHandle<()>>,
    ready: Receiver<WatchId>,
    next_watch: WatchId,
}

impl Monitor {
    /// Starts the coordinator. Notifications arrive on the returned
    /// receiver.
    pub fn new() -> EmberResult<(Self, Receiver<MonitorNotification>)> {
        let (coordinator, inbox) = mpsc::channel();
        let (notify, notifications) = mpsc::channel();
        let (ready_tx, ready) = mpsc::channel();

        let coordinator_thread = thread::Builder::new()
            .name("ember-monitor".to_string())
            .spawn(move || coordinator_loop(inbox, notify, ready_tx))
            .map_err(|e| EmberError::Fatal(format!("monitor thread failed to start: {e}")))?;

        Ok((
            Self {
                coordinator,
                coordinator_thread: Some(coordinator_thread),
                ready,
                next_watch: 0,
            },
            notifications,
        ))
    }

    /// Registers a directory watch and waits for its waiter thread's
    /// startup handshake.
    pub fn add_directory_watch(
        &mut self,
        path: &Path,
        recursive: bool,
        silence: Duration,
    ) -> EmberResult<WatchId> {
        self.next_watch += 1;
        let watch = self.next_watch;

        self.coordinator
            .send(CoordinatorMessage::AddWatch {
                watch,
                path: path.to_path_buf(),
                recursive,
                silence,
            })
            .map_err(|_| EmberError::Fatal("monitor coordinator is gone".to_string()))?;

        for _ in 0..MON_THREAD_INIT_RETRIES {
            match self.ready.recv_timeout(MON_THREAD_INIT_WAIT) {
                Ok(ready) if ready == watch => return Ok(watch),
                Ok(_) => continue,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        Err(EmberError::Fatal(
            "monitor waiter failed to start".to_string(),
        ))
    }

    pub fn remove_watch(&self, watch: WatchId) {
        let _ = self.coordinator.send(CoordinatorMessage::RemoveWatch { watch });
    }

    /// Feeds a drive arrival/removal into the notification stream.
    pub fn drive_status(&self, letter: char, arrived: bool) {
        let _ = self
            .coordinator
            .send(CoordinatorMessage::DriveStatus { letter, arrived });
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        let _ = self.coordinator.send(CoordinatorMessage::Shutdown);
        if let Some(handle) = self.coordinator_thread.take() {
            let _ = handle.join();
        }
    }
}

struct WaiterHandle {
    stop: Sender<()>,
    thread: thread::JoinHandle<()>,
}

fn coordinator_loop(
    inbox: Receiver<CoordinatorMessage>,
    notify: Sender<MonitorNotification>,
    ready: Sender<WatchId>,
) {
    let mut waiters: HashMap<WatchId, WaiterHandle> = HashMap::new();

    while let Ok(message) = inbox.recv() {
        match message {
            CoordinatorMessage::AddWatch {
                watch,
                path,
                recursive,
                silence,
            } => {
                let (stop_tx, stop_rx) = mpsc::channel();
                let notify = notify.clone();
                let ready = ready.clone();
                let spawn = thread::Builder::new()
                    .name(format!("ember-monitor-{watch}"))
                    .spawn(move || {
                        let _ = ready.send(watch);
                        waiter_loop(watch, path, recursive, silence, notify, stop_rx);
                    });
                match spawn {
                    Ok(thread) => {
                        waiters.insert(
                            watch,
                            WaiterHandle {
                                stop: stop_tx,
                                thread,
                            },
                        );
                    }
                    Err(err) => warn!(error = %err, "failed to spawn monitor waiter"),
                }
            }
            CoordinatorMessage::RemoveWatch { watch } => {
                if let Some(handle) = waiters.remove(&watch) {
                    let _ = handle.stop.send(());
                    let _ = handle.thread.join();
                }
            }
            CoordinatorMessage::DriveStatus { letter, arrived } => {
                let _ = notify.send(MonitorNotification::Drive { letter, arrived });
            }
            CoordinatorMessage::Shutdown => break,
        }
    }

    for (_, handle) in waiters.drain() {
        let _ = handle.stop.send(());
        let _ = handle.thread.join();
    }
    debug!("monitor coordinator stopped");
}

fn waiter_loop(
    watch: WatchId,
    path: PathBuf,
    recursive: bool,
    silence: Duration,
    notify: Sender<MonitorNotification>,
    stop: Receiver<()>,
) {
    let mut last_signature = tree_signature(&path, recursive);
    let mut pending_since: Option<Instant> = None;
    let mut lost = last_signature.is_none();
    let mut last_scan = Instant::now();

    if lost {
        let _ = notify.send(MonitorNotification::Lost {
            watch,
            path: path.clone(),
        });
    }

    loop {
        match stop.recv_timeout(POLL_INTERVAL) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        // back off while the path is unreachable
        if lost {
            if last_scan.elapsed() < MON_NETWORK_FAILED_RETRY {
                continue;
            }
            last_scan = Instant::now();
            if let Some(signature) = tree_signature(&path, recursive) {
                lost = false;
                last_signature = Some(signature);
                pending_since = Some(Instant::now());
            }
            continue;
        }

        let rescan_due = last_scan.elapsed() >= MON_NETWORK_HEALTHY_RESCAN;
        let current = tree_signature(&path, recursive);
        if rescan_due {
            last_scan = Instant::now();
        }

        match current {
            None => {
                lost = true;
                last_scan = Instant::now();
                pending_since = None;
                let _ = notify.send(MonitorNotification::Lost {
                    watch,
                    path: path.clone(),
                });
            }
            Some(signature) => {
                if last_signature.as_ref() != Some(&signature) {
                    trace!(watch, "change observed, resetting silence window");
                    last_signature = Some(signature);
                    pending_since = Some(Instant::now());
                } else if let Some(since) = pending_since {
                    if since.elapsed() >= silence {
                        debug!(watch, path = %path.display(), "silence elapsed, notifying");
                        pending_since = None;
                        let _ = notify.send(MonitorNotification::Changed {
                            watch,
                            path: path.clone(),
                        });
                    }
                }
            }
        }
    }
}

/// Order-stable digest of a tree's paths, sizes, and mtimes.
fn tree_signature(path: &Path, recursive: bool) -> Option<Vec<(PathBuf, u64, SystemTime)>> {
    let mut entries = Vec::new();
    collect_signature(path, recursive, &mut entries).ok()?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Some(entries)
}

fn collect_signature(
    path: &Path,
    recursive: bool,
    entries: &mut Vec<(PathBuf, u64, SystemTime)>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        let modified = metadata.modified()?;
        entries.push((entry.path(), metadata.len(), modified));
        if recursive && metadata.is_dir() {
            collect_signature(&entry.path(), true, entries)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ember_utils::fs::write_file;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_writes_coalesce_into_one_notification() {
        let dir = TempDir::new().unwrap();
        let (mut monitor, notifications) = Monitor::new().unwrap();
        let silence = Duration::from_millis(500);
        monitor
            .add_directory_watch(dir.path(), false, silence)
            .unwrap();

        // writes at t = 0, 200, 400 ms
        for (step, wait) in [(0u64, 0u64), (1, 200), (2, 200)] {
            thread::sleep(Duration::from_millis(wait));
            write_file(dir.path().join(format!("f{step}")), b"x").unwrap();
        }

        // one notification roughly at last write + silence
        let first = notifications
            .recv_timeout(Duration::from_millis(1500))
            .unwrap();
        assert!(matches!(first, MonitorNotification::Changed { .. }));

        // nothing further while the tree stays quiet
        assert!(notifications
            .recv_timeout(Duration::from_millis(300))
            .is_err());

        // a later write produces a second notification after its own
        // silence window
        write_file(dir.path().join("late"), b"x").unwrap();
        let second = notifications
            .recv_timeout(Duration::from_millis(1500))
            .unwrap();
        assert!(matches!(second, MonitorNotification::Changed { .. }));
    }

    #[test]
    fn test_notification_waits_for_silence() {
        let dir = TempDir::new().unwrap();
        let (mut monitor, notifications) = Monitor::new().unwrap();
        monitor
            .add_directory_watch(dir.path(), false, Duration::from_millis(400))
            .unwrap();

        write_file(dir.path().join("f"), b"x").unwrap();
        // well inside the silence window: nothing yet
        assert!(notifications
            .recv_timeout(Duration::from_millis(150))
            .is_err());
        // after the window: the notification
        assert!(notifications
            .recv_timeout(Duration::from_millis(1000))
            .is_ok());
    }

    #[test]
    fn test_drive_events_share_the_channel() {
        let (monitor, notifications) = Monitor::new().unwrap();
        monitor.drive_status('e', true);
        let event = notifications
            .recv_timeout(Duration::from_millis(500))
            .unwrap();
        assert_eq!(
            event,
            MonitorNotification::Drive {
                letter: 'e',
                arrived: true
            }
        );
    }

    #[test]
    fn test_missing_path_reports_lost() {
        let (mut monitor, notifications) = Monitor::new().unwrap();
        let missing = std::env::temp_dir().join("ember-monitor-missing-path");
        monitor
            .add_directory_watch(&missing, false, Duration::from_millis(100))
            .unwrap();

        let event = notifications
            .recv_timeout(Duration::from_millis(500))
            .unwrap();
        assert!(matches!(event, MonitorNotification::Lost { .. }));
    }
}
