//! Process lifecycle events.
//!
//! [`ProcessEventSource`] is the platform-neutral contract the cleanup trigger
//! consumes. [`ProcessMonitor`] implements it two ways:
//!
//! - children spawned by this process are awaited directly, so their exit code
//!   or terminating signal is known exactly
//! - any other pid is polled through `sysinfo`; disappearance (or a zombie
//!   entry) is reported as a graceful exit with an unknown code

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, RefreshKind, System};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub exit_code: Option<i32>,
    /// Exit or crash reason text
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Graceful exit
    Exited(ProcessInfo),
    /// Abnormal termination (non-zero exit code or signal)
    Killed(ProcessInfo),
    /// Internal fault of the event source itself
    ErrorOccurred(String),
}

impl ProcessEvent {
    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Exited(info) | Self::Killed(info) => Some(info.pid),
            Self::ErrorOccurred(_) => None,
        }
    }
}

/// Supplies exit notifications for watched processes.
pub trait ProcessEventSource: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<ProcessEvent>;

    /// Start reporting the exit of `pid`.
    fn watch(&self, pid: u32, name: &str);

    /// Stop reporting `pid`. Unknown pids are ignored.
    fn unwatch(&self, pid: u32);
}

/// `sysinfo`-backed [`ProcessEventSource`].
#[derive(Clone)]
pub struct ProcessMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    events: broadcast::Sender<ProcessEvent>,
    /// Foreign pids checked on every poll
    polled: Mutex<HashMap<u32, String>>,
    /// Pids of children awaited directly
    owned: Mutex<HashSet<u32>>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl ProcessMonitor {
    pub fn new(poll_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            inner: Arc::new(MonitorInner {
                events,
                polled: Mutex::new(HashMap::new()),
                owned: Mutex::new(HashSet::new()),
                poll_interval,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Spawn the polling task. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.poll_interval);
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = ticker.tick() => inner.poll(),
                }
            }
            tracing::debug!("process monitor stopped");
        });
    }

    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    /// Await a child spawned by this process and report how it ended.
    ///
    /// Returns the pid, or `None` if the child already exited.
    pub fn watch_child(&self, mut child: tokio::process::Child, name: &str) -> Option<u32> {
        let pid = child.id()?;
        self.inner.owned.lock().insert(pid);
        self.inner.polled.lock().remove(&pid);

        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        tokio::spawn(async move {
            let event = match child.wait().await {
                Ok(status) => event_from_status(pid, &name, status),
                Err(err) => ProcessEvent::ErrorOccurred(format!(
                    "failed to wait for {} (pid {}): {}",
                    name, pid, err
                )),
            };
            inner.owned.lock().remove(&pid);
            inner.publish(event);
        });
        Some(pid)
    }

    /// Inject an event as if the monitor had observed it.
    pub fn notify(&self, event: ProcessEvent) {
        self.inner.publish(event);
    }

    pub fn watched_count(&self) -> usize {
        self.inner.polled.lock().len() + self.inner.owned.lock().len()
    }
}

impl ProcessEventSource for ProcessMonitor {
    fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.inner.events.subscribe()
    }

    fn watch(&self, pid: u32, name: &str) {
        if self.inner.owned.lock().contains(&pid) {
            return;
        }
        self.inner.polled.lock().insert(pid, name.to_string());
    }

    fn unwatch(&self, pid: u32) {
        self.inner.polled.lock().remove(&pid);
    }
}

impl MonitorInner {
    fn publish(&self, event: ProcessEvent) {
        tracing::debug!(event = ?event, "process event");
        let _ = self.events.send(event);
    }

    fn poll(&self) {
        let watched: Vec<(u32, String)> = self
            .polled
            .lock()
            .iter()
            .map(|(pid, name)| (*pid, name.clone()))
            .collect();
        if watched.is_empty() {
            return;
        }

        let sys = process_table();
        for (pid, name) in watched {
            let gone = match sys.process(Pid::from_u32(pid)) {
                None => Some("process no longer present"),
                Some(process) if process.status() == ProcessStatus::Zombie => {
                    Some("process exited (zombie)")
                }
                Some(_) => None,
            };
            if let Some(reason) = gone {
                // Only report once, even if unwatch races with this poll.
                if self.polled.lock().remove(&pid).is_some() {
                    self.publish(ProcessEvent::Exited(ProcessInfo {
                        pid,
                        name,
                        exit_code: None,
                        reason: reason.to_string(),
                    }));
                }
            }
        }
    }
}

/// Fresh process table.
pub(crate) fn process_table() -> System {
    System::new_with_specifics(RefreshKind::new().with_processes(ProcessRefreshKind::new()))
}

/// OS start time of the live process behind `pid`, in seconds since the epoch.
/// Together with the pid this identifies one process instance.
pub fn start_time(pid: u32) -> Option<u64> {
    let sys = process_table();
    sys.process(Pid::from_u32(pid))
        .filter(|process| process.status() != ProcessStatus::Zombie)
        .map(|process| process.start_time())
}

/// Whether `pid` currently names a live (non-zombie) process.
pub fn is_running(pid: u32) -> bool {
    let sys = process_table();
    matches!(
        sys.process(Pid::from_u32(pid)),
        Some(process) if process.status() != ProcessStatus::Zombie
    )
}

fn event_from_status(pid: u32, name: &str, status: std::process::ExitStatus) -> ProcessEvent {
    let info = |exit_code: Option<i32>, reason: String| ProcessInfo {
        pid,
        name: name.to_string(),
        exit_code,
        reason,
    };

    match status.code() {
        Some(0) => ProcessEvent::Exited(info(Some(0), "exited normally".to_string())),
        Some(code) => ProcessEvent::Killed(info(Some(code), format!("exited with code {}", code))),
        None => ProcessEvent::Killed(info(None, signal_reason(&status))),
    }
}

#[cfg(unix)]
fn signal_reason(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("terminated by signal {}", signal),
        None => "terminated abnormally".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_reason(_status: &std::process::ExitStatus) -> String {
    "terminated abnormally".to_string()
}
