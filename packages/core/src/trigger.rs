//! Cleanup trigger aggregation.
//!
//! [`CleanupTrigger`] turns every "end of life" signal into one normalized
//! [`TriggerEvent`] and hands it to the registered [`TriggerListener`]s:
//!
//! | Source | Reason | Urgent |
//! |---|---|---|
//! | process monitor, exit code 0 or unknown | `ProcessExit` | no |
//! | process monitor, non-zero code or signal | `ProcessCrash` | yes |
//! | per-process deadline | `Timeout` | yes |
//! | SIGINT / SIGTERM | `HostShutdown` | yes |
//! | panic hook | `UnhandledFault` | yes |
//! | recurring schedule | `Scheduled` | no |
//! | [`CleanupTrigger::request_cleanup`] | `Manual` | caller decides |
//!
//! Listeners are awaited in registration order. No lock is held while a
//! listener runs, so listeners may call back into the trigger. A listener
//! error or panic is logged and the next listener still runs; such panics are
//! not treated as host faults.

use crate::cleaner::{self, HostSignal, HostSignals};
use crate::cleanup::CleanupType;
use crate::config::TriggerConfig;
use crate::error::{EngineError, Result};
use crate::process::{self, ProcessEvent, ProcessEventSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{self, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Context key carrying the requested [`CleanupType`] of a manual trigger.
pub const CONTEXT_CLEANUP_TYPE: &str = "cleanup_type";

/// Context key carrying the OS start time of the process an event is about.
pub const CONTEXT_START_TIME: &str = "start_time";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl std::fmt::Display for TriggerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSource {
    ProcessMonitor,
    Timer,
    HostShutdown,
    UnhandledFault,
    Manual,
    Schedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerReason {
    ProcessExit,
    ProcessCrash,
    Timeout,
    HostShutdown,
    UnhandledFault,
    Scheduled,
    Manual,
}

impl TriggerReason {
    /// Default urgency. `Manual` triggers carry their own.
    pub fn is_urgent(self) -> bool {
        matches!(
            self,
            Self::ProcessCrash | Self::Timeout | Self::HostShutdown | Self::UnhandledFault
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub source: TriggerSource,
    pub reason: TriggerReason,
    pub pid: Option<u32>,
    pub urgent: bool,
    pub context: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn new(source: TriggerSource, reason: TriggerReason, pid: Option<u32>) -> Self {
        Self {
            source,
            reason,
            pid,
            urgent: reason.is_urgent(),
            context: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_context(mut self, key: &str, value: impl ToString) -> Self {
        self.context.insert(key.to_string(), value.to_string());
        self
    }

    /// Cleanup type requested by a manual trigger, if any.
    pub fn requested_type(&self) -> Option<CleanupType> {
        self.context
            .get(CONTEXT_CLEANUP_TYPE)
            .and_then(|value| value.parse().ok())
    }

    /// OS start time recorded when the process was registered, if known.
    pub fn process_start_time(&self) -> Option<u64> {
        self.context
            .get(CONTEXT_START_TIME)
            .and_then(|value| value.parse().ok())
    }
}

/// Receives normalized trigger events.
#[async_trait]
pub trait TriggerListener: Send + Sync {
    async fn on_trigger(&self, event: &TriggerEvent) -> anyhow::Result<()>;
}

/// A process whose end should trigger cleanup.
#[derive(Debug, Clone)]
pub struct MonitoredProcess {
    pub pid: u32,
    pub name: String,
    pub started_at: DateTime<Utc>,
    /// OS start time at registration; `None` if the pid was not live then.
    pub start_time: Option<u64>,
    pub deadline: Option<Instant>,
}

struct Registration {
    process: MonitoredProcess,
    generation: u64,
    timer: Option<CancellationToken>,
}

/// Aggregates process, timer, host and manual signals into [`TriggerEvent`]s.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CleanupTrigger {
    inner: Arc<TriggerInner>,
}

/// Non-owning handle, see [`CleanupTrigger::downgrade`].
#[derive(Clone)]
pub struct WeakTrigger {
    inner: Weak<TriggerInner>,
}

impl WeakTrigger {
    pub fn upgrade(&self) -> Option<CleanupTrigger> {
        self.inner.upgrade().map(|inner| CleanupTrigger { inner })
    }
}

struct TriggerInner {
    config: TriggerConfig,
    source: Arc<dyn ProcessEventSource>,
    signals: HostSignals,
    state: Mutex<TriggerState>,
    monitored: Mutex<HashMap<u32, Registration>>,
    listeners: RwLock<Vec<Arc<dyn TriggerListener>>>,
    cancel: Mutex<CancellationToken>,
    generation: AtomicU64,
    events: broadcast::Sender<TriggerEvent>,
}

impl CleanupTrigger {
    pub fn new(
        config: TriggerConfig,
        source: Arc<dyn ProcessEventSource>,
        signals: HostSignals,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(TriggerInner {
                config,
                source,
                signals,
                state: Mutex::new(TriggerState::Stopped),
                monitored: Mutex::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                cancel: Mutex::new(CancellationToken::new()),
                generation: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn state(&self) -> TriggerState {
        *self.inner.state.lock()
    }

    pub fn downgrade(&self) -> WeakTrigger {
        WeakTrigger {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn TriggerListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// Every dispatched event, for observers that are not listeners.
    pub fn subscribe(&self) -> broadcast::Receiver<TriggerEvent> {
        self.inner.events.subscribe()
    }

    /// Start one task per source. Starting a running trigger is a no-op.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                TriggerState::Running | TriggerState::Starting => return Ok(()),
                TriggerState::Stopping => {
                    return Err(EngineError::TriggerNotRunning(state.to_string()));
                }
                TriggerState::Stopped | TriggerState::Error => {}
            }
            if tokio::runtime::Handle::try_current().is_err() {
                *state = TriggerState::Error;
                tracing::error!("cleanup trigger started outside a tokio runtime");
                return Err(EngineError::TriggerNotRunning(state.to_string()));
            }
            *state = TriggerState::Starting;
        }

        let cancel = CancellationToken::new();
        *self.inner.cancel.lock() = cancel.clone();

        self.spawn_process_source(cancel.clone());
        self.spawn_host_source(cancel.clone());
        if let Some(secs) = self.inner.config.schedule_interval_secs {
            self.spawn_schedule(cancel, Duration::from_secs(secs.max(1)));
        }

        *self.inner.state.lock() = TriggerState::Running;
        tracing::info!(
            schedule_secs = ?self.inner.config.schedule_interval_secs,
            "cleanup trigger running"
        );
        Ok(())
    }

    /// Cancel every source and deadline and forget all monitored processes.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == TriggerState::Stopped {
                return;
            }
            *state = TriggerState::Stopping;
        }

        self.inner.cancel.lock().cancel();
        let drained: Vec<Registration> = self
            .inner
            .monitored
            .lock()
            .drain()
            .map(|(_, registration)| registration)
            .collect();
        for registration in &drained {
            if let Some(timer) = &registration.timer {
                timer.cancel();
            }
            self.inner.source.unwatch(registration.process.pid);
        }

        *self.inner.state.lock() = TriggerState::Stopped;
        tracing::info!(released = drained.len(), "cleanup trigger stopped");
    }

    /// Watch `pid`; with a timeout, fire one urgent `Timeout` trigger if it is
    /// still registered when the deadline passes.
    ///
    /// The timeout is clamped to the configured maximum. Re-registering a pid
    /// replaces its previous deadline.
    pub fn register_process(&self, pid: u32, name: &str, timeout: Option<Duration>) -> Result<()> {
        let state = self.state();
        if state != TriggerState::Running {
            return Err(EngineError::TriggerNotRunning(state.to_string()));
        }

        let timeout = timeout.map(|timeout| timeout.min(self.inner.config.max_process_timeout()));
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let timer = timeout.map(|_| self.inner.cancel.lock().child_token());

        let registration = Registration {
            process: MonitoredProcess {
                pid,
                name: name.to_string(),
                started_at: Utc::now(),
                start_time: process::start_time(pid),
                deadline: timeout.map(|timeout| Instant::now() + timeout),
            },
            generation,
            timer: timer.clone(),
        };
        if let Some(previous) = self.inner.monitored.lock().insert(pid, registration) {
            if let Some(previous) = previous.timer {
                previous.cancel();
            }
        }
        self.inner.source.watch(pid, name);

        if let (Some(timeout), Some(timer)) = (timeout, timer) {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                tokio::select! {
                    _ = timer.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => inner.on_deadline(pid, generation, timeout).await,
                }
            });
        }

        tracing::info!(pid, name, timeout = ?timeout, "process registered for cleanup");
        Ok(())
    }

    /// Stop monitoring `pid` and cancel its deadline. Returns whether it was
    /// registered.
    pub fn unregister_process(&self, pid: u32) -> bool {
        let removed = self.inner.monitored.lock().remove(&pid);
        match removed {
            Some(registration) => {
                if let Some(timer) = registration.timer {
                    timer.cancel();
                }
                self.inner.source.unwatch(pid);
                tracing::debug!(pid, "process unregistered");
                true
            }
            None => false,
        }
    }

    /// Fire a manual trigger for `kind`.
    pub async fn request_cleanup(&self, kind: CleanupType, urgent: bool) {
        let mut event = TriggerEvent::new(TriggerSource::Manual, TriggerReason::Manual, None)
            .with_context(CONTEXT_CLEANUP_TYPE, kind);
        event.urgent = urgent;
        self.inner.dispatch(event).await;
    }

    pub fn monitored_count(&self) -> usize {
        self.inner.monitored.lock().len()
    }

    /// Registered processes that still have a pending deadline.
    pub fn active_timeouts(&self) -> usize {
        self.inner
            .monitored
            .lock()
            .values()
            .filter(|registration| {
                registration
                    .timer
                    .as_ref()
                    .is_some_and(|timer| !timer.is_cancelled())
            })
            .count()
    }

    pub fn monitored(&self) -> Vec<MonitoredProcess> {
        self.inner
            .monitored
            .lock()
            .values()
            .map(|registration| registration.process.clone())
            .collect()
    }

    fn spawn_process_source(&self, cancel: CancellationToken) {
        let mut rx = self.inner.source.subscribe();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => inner.on_process_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "process events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn spawn_host_source(&self, cancel: CancellationToken) {
        let mut rx = self.inner.signals.subscribe();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(HostSignal::Shutdown { signal }) => {
                            let event = TriggerEvent::new(
                                TriggerSource::HostShutdown,
                                TriggerReason::HostShutdown,
                                None,
                            )
                            .with_context("signal", signal);
                            inner.dispatch(event).await;
                        }
                        Ok(HostSignal::Fault { message }) => {
                            let event = TriggerEvent::new(
                                TriggerSource::UnhandledFault,
                                TriggerReason::UnhandledFault,
                                None,
                            )
                            .with_context("message", message);
                            inner.dispatch(event).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "host signals dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn spawn_schedule(&self, cancel: CancellationToken, period: Duration) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let event = TriggerEvent::new(
                            TriggerSource::Schedule,
                            TriggerReason::Scheduled,
                            None,
                        );
                        inner.dispatch(event).await;
                    }
                }
            }
        });
    }
}

impl TriggerInner {
    async fn on_process_event(&self, event: ProcessEvent) {
        let (info, crashed) = match event {
            ProcessEvent::Exited(info) => (info, false),
            ProcessEvent::Killed(info) => (info, true),
            ProcessEvent::ErrorOccurred(message) => {
                tracing::warn!(%message, "process monitor reported an error");
                return;
            }
        };

        let Some(registration) = self.monitored.lock().remove(&info.pid) else {
            tracing::trace!(pid = info.pid, "ignoring event for unmonitored process");
            return;
        };
        if let Some(timer) = registration.timer {
            timer.cancel();
        }
        self.source.unwatch(info.pid);

        let reason = if crashed {
            TriggerReason::ProcessCrash
        } else {
            TriggerReason::ProcessExit
        };
        let mut event = TriggerEvent::new(TriggerSource::ProcessMonitor, reason, Some(info.pid))
            .with_context("name", &info.name)
            .with_context("reason", &info.reason);
        if let Some(code) = info.exit_code {
            event = event.with_context("exit_code", code);
        }
        if let Some(start_time) = registration.process.start_time {
            event = event.with_context(CONTEXT_START_TIME, start_time);
        }
        self.dispatch(event).await;
    }

    async fn on_deadline(&self, pid: u32, generation: u64, timeout: Duration) {
        // Removing under the lock is what makes the deadline fire at most once
        // and never after an unregister or a later re-registration.
        let fired = {
            let mut monitored = self.monitored.lock();
            match monitored.get(&pid) {
                Some(registration) if registration.generation == generation => {
                    monitored.remove(&pid)
                }
                _ => None,
            }
        };
        let Some(registration) = fired else {
            return;
        };
        self.source.unwatch(pid);

        tracing::warn!(pid, name = %registration.process.name, ?timeout, "process timed out");
        let mut event = TriggerEvent::new(TriggerSource::Timer, TriggerReason::Timeout, Some(pid))
            .with_context("name", &registration.process.name)
            .with_context("timeout_secs", timeout.as_secs());
        if let Some(start_time) = registration.process.start_time {
            event = event.with_context(CONTEXT_START_TIME, start_time);
        }
        self.dispatch(event).await;
    }

    async fn dispatch(&self, event: TriggerEvent) {
        tracing::info!(
            source = ?event.source,
            reason = ?event.reason,
            pid = ?event.pid,
            urgent = event.urgent,
            "cleanup triggered"
        );
        let _ = self.events.send(event.clone());

        let listeners: Vec<Arc<dyn TriggerListener>> = self.listeners.read().clone();
        for listener in listeners {
            let mut call = AssertUnwindSafe(listener.on_trigger(&event)).catch_unwind();
            let outcome = future::poll_fn(|cx| cleaner::contained(|| call.poll_unpin(cx))).await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(error = %e, reason = ?event.reason, "trigger listener failed");
                }
                Err(_) => {
                    tracing::error!(reason = ?event.reason, "trigger listener panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ProcessInfo, ProcessMonitor};
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        events: Mutex<Vec<TriggerEvent>>,
    }

    #[async_trait]
    impl TriggerListener for Recorder {
        async fn on_trigger(&self, event: &TriggerEvent) -> anyhow::Result<()> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    struct Failing {
        calls: AtomicUsize,
        panic: bool,
    }

    #[async_trait]
    impl TriggerListener for Failing {
        async fn on_trigger(&self, _event: &TriggerEvent) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("listener blew up");
            }
            anyhow::bail!("listener failed")
        }
    }

    fn setup() -> (CleanupTrigger, ProcessMonitor, Arc<Recorder>) {
        let monitor = ProcessMonitor::new(Duration::from_secs(3600));
        let trigger = CleanupTrigger::new(
            TriggerConfig::default(),
            Arc::new(monitor.clone()),
            HostSignals::new(),
        );
        let recorder = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
        });
        trigger.add_listener(recorder.clone());
        (trigger, monitor, recorder)
    }

    fn info(pid: u32, exit_code: Option<i32>) -> ProcessInfo {
        ProcessInfo {
            pid,
            name: "claude".to_string(),
            exit_code,
            reason: "test".to_string(),
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_register_requires_running() {
        let (trigger, _monitor, _) = setup();
        assert!(matches!(
            trigger.register_process(1, "x", None),
            Err(EngineError::TriggerNotRunning(_))
        ));
        trigger.start().unwrap();
        trigger.start().unwrap();
        assert_eq!(trigger.state(), TriggerState::Running);
        trigger.register_process(1, "x", None).unwrap();
        assert_eq!(trigger.monitored_count(), 1);
        assert_eq!(trigger.active_timeouts(), 0);
    }

    #[tokio::test]
    async fn test_crash_is_urgent_and_exit_is_not() {
        let (trigger, monitor, recorder) = setup();
        trigger.start().unwrap();
        trigger.register_process(10, "claude", None).unwrap();
        trigger.register_process(11, "claude", None).unwrap();

        monitor.notify(ProcessEvent::Killed(info(10, Some(1))));
        monitor.notify(ProcessEvent::Exited(info(11, Some(0))));
        settle().await;

        let events = recorder.events.lock().clone();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].reason, TriggerReason::ProcessCrash);
        assert!(events[0].urgent);
        assert_eq!(events[0].context.get("exit_code").map(String::as_str), Some("1"));
        assert_eq!(events[1].reason, TriggerReason::ProcessExit);
        assert!(!events[1].urgent);
        assert_eq!(trigger.monitored_count(), 0);
    }

    #[tokio::test]
    async fn test_unmonitored_and_error_events_are_ignored() {
        let (trigger, monitor, recorder) = setup();
        trigger.start().unwrap();

        monitor.notify(ProcessEvent::Exited(info(99, Some(0))));
        monitor.notify(ProcessEvent::ErrorOccurred("probe failed".to_string()));
        settle().await;

        assert!(recorder.events.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_exactly_once() {
        let (trigger, _monitor, recorder) = setup();
        trigger.start().unwrap();
        trigger
            .register_process(20, "claude", Some(Duration::from_secs(60)))
            .unwrap();
        assert_eq!(trigger.active_timeouts(), 1);

        tokio::time::sleep(Duration::from_secs(59)).await;
        settle().await;
        assert!(recorder.events.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(600)).await;
        settle().await;

        let events = recorder.events.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, TriggerReason::Timeout);
        assert!(events[0].urgent);
        assert_eq!(events[0].pid, Some(20));
        assert_eq!(trigger.active_timeouts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_cancels_timeout() {
        let (trigger, _monitor, recorder) = setup();
        trigger.start().unwrap();
        trigger
            .register_process(21, "claude", Some(Duration::from_secs(5)))
            .unwrap();
        assert!(trigger.unregister_process(21));
        assert!(!trigger.unregister_process(21));

        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert!(recorder.events.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_clamped() {
        let monitor = ProcessMonitor::new(Duration::from_secs(3600));
        let config = TriggerConfig {
            max_process_timeout_minutes: 1,
            ..TriggerConfig::default()
        };
        let trigger = CleanupTrigger::new(config, Arc::new(monitor), HostSignals::new());
        let mut rx = trigger.subscribe();
        trigger.start().unwrap();
        trigger
            .register_process(22, "claude", Some(Duration::from_secs(24 * 3600)))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.reason, TriggerReason::Timeout);
        assert_eq!(event.context.get("timeout_secs").map(String::as_str), Some("60"));
    }

    #[tokio::test]
    async fn test_failing_listeners_do_not_block_others() {
        let (trigger, _monitor, recorder) = setup();
        let erroring = Arc::new(Failing {
            calls: AtomicUsize::new(0),
            panic: false,
        });
        let panicking = Arc::new(Failing {
            calls: AtomicUsize::new(0),
            panic: true,
        });
        let late = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
        });
        trigger.add_listener(erroring.clone());
        trigger.add_listener(panicking.clone());
        trigger.add_listener(late.clone());

        trigger.request_cleanup(CleanupType::Memory, false).await;
        trigger.request_cleanup(CleanupType::Complete, true).await;

        assert_eq!(recorder.events.lock().len(), 2);
        assert_eq!(erroring.calls.load(Ordering::SeqCst), 2);
        assert_eq!(panicking.calls.load(Ordering::SeqCst), 2);
        let late_events = late.events.lock().clone();
        assert_eq!(late_events.len(), 2);
        assert_eq!(late_events[0].requested_type(), Some(CleanupType::Memory));
        assert!(!late_events[0].urgent);
        assert!(late_events[1].urgent);
    }

    #[tokio::test]
    async fn test_host_signals_are_normalized() {
        let signals = HostSignals::new();
        let monitor = ProcessMonitor::new(Duration::from_secs(3600));
        let trigger = CleanupTrigger::new(
            TriggerConfig::default(),
            Arc::new(monitor),
            signals.clone(),
        );
        let mut rx = trigger.subscribe();
        trigger.start().unwrap();

        assert!(signals.raise_shutdown("SIGTERM"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.reason, TriggerReason::HostShutdown);
        assert!(event.urgent);

        assert!(signals.raise_fault("boom"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.reason, TriggerReason::UnhandledFault);
        assert_eq!(event.context.get("message").map(String::as_str), Some("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_periodically() {
        let monitor = ProcessMonitor::new(Duration::from_secs(3600));
        let config = TriggerConfig {
            schedule_interval_secs: Some(10),
            ..TriggerConfig::default()
        };
        let trigger = CleanupTrigger::new(config, Arc::new(monitor), HostSignals::new());
        let mut rx = trigger.subscribe();
        trigger.start().unwrap();

        tokio::time::sleep(Duration::from_secs(25)).await;
        settle().await;
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.reason, TriggerReason::Scheduled);
            assert!(!event.urgent);
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_stop_releases_processes() {
        let (trigger, _monitor, _) = setup();
        trigger.start().unwrap();
        trigger
            .register_process(30, "claude", Some(Duration::from_secs(60)))
            .unwrap();
        trigger.stop();
        assert_eq!(trigger.state(), TriggerState::Stopped);
        assert_eq!(trigger.monitored_count(), 0);
        assert!(trigger.register_process(31, "x", None).is_err());
    }
}
