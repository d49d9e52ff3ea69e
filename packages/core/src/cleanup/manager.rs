//! Cleanup scheduling.
//!
//! One worker drains a priority queue. Each operation needs an owned permit
//! from a semaphore sized by `max_concurrency` before it is spawned, so at
//! most that many queued operations run at once.
//!
//! Urgent triggers skip the queue: the complete cleanup runs inline, awaited
//! by the trigger, while holding the write side of the urgent gate. Queued
//! operations pass the read side before starting, so nothing queued earlier
//! starts while an urgent cleanup is running.

use super::operation::{CleanupContext, CleanupOperation, CleanupTarget, CleanupType, Priority};
use super::result::CleanupResult;
use crate::config::EngineConfig;
use crate::configuration::ConfigurationManager;
use crate::error::{EngineError, Result};
use crate::trigger::{CleanupTrigger, TriggerEvent, TriggerListener, TriggerReason, WeakTrigger};
use crate::vault::SecureStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Cumulative counters, also persisted in the engine snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupStatistics {
    pub executed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub last_cleanup: Option<DateTime<Utc>>,
    pub pending: usize,
    /// Results currently retained
    pub completed: usize,
    pub in_progress: usize,
    pub peak_in_progress: usize,
    pub monitored_processes: usize,
    pub active_timeouts: usize,
    /// Succeeded / executed, 1.0 when nothing ran yet
    pub success_rate: f64,
}

struct Queued {
    priority: Priority,
    sequence: u64,
    operation: CleanupOperation,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for Queued {}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap: higher priority first, then lower sequence
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Counters {
    executed: u64,
    succeeded: u64,
    failed: u64,
    cancelled: u64,
    last_cleanup: Option<DateTime<Utc>>,
}

struct ManagerInner {
    ctx: CleanupContext,
    queue: Mutex<BinaryHeap<Queued>>,
    queued: Notify,
    permits: Arc<Semaphore>,
    urgent_gate: RwLock<()>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    stopped: AtomicBool,
    sequence: AtomicU64,
    in_progress: AtomicUsize,
    peak_in_progress: AtomicUsize,
    counters: Mutex<Counters>,
    results: Mutex<VecDeque<CleanupResult>>,
    completed: broadcast::Sender<CleanupResult>,
    trigger: Mutex<Option<WeakTrigger>>,
}

/// Queues, runs and records cleanup operations.
///
/// Cheap to clone; clones share the same queue and worker. Must be created
/// inside a tokio runtime.
#[derive(Clone)]
pub struct CleanupManager {
    inner: Arc<ManagerInner>,
}

impl CleanupManager {
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<SecureStore>,
        configuration: Option<Arc<ConfigurationManager>>,
    ) -> Self {
        let (completed, _) = broadcast::channel(64);
        let max_concurrency = config.cleanup.max_concurrency.max(1);
        let inner = Arc::new(ManagerInner {
            ctx: CleanupContext {
                store,
                configuration,
                config,
            },
            queue: Mutex::new(BinaryHeap::new()),
            queued: Notify::new(),
            permits: Arc::new(Semaphore::new(max_concurrency)),
            urgent_gate: RwLock::new(()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            stopped: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            in_progress: AtomicUsize::new(0),
            peak_in_progress: AtomicUsize::new(0),
            counters: Mutex::new(Counters::default()),
            results: Mutex::new(VecDeque::new()),
            completed,
            trigger: Mutex::new(None),
        });

        let worker = Arc::clone(&inner);
        inner.tracker.spawn(worker.work());
        tracing::debug!(max_concurrency, "cleanup manager started");

        Self { inner }
    }

    /// Listen to `trigger` and report its monitored counts in statistics.
    pub fn bind_trigger(&self, trigger: &CleanupTrigger) {
        trigger.add_listener(Arc::new(self.clone()));
        *self.inner.trigger.lock() = Some(trigger.downgrade());
    }

    /// Queue an operation. Empty `targets` means the configured defaults.
    pub fn submit(
        &self,
        kind: CleanupType,
        targets: Vec<CleanupTarget>,
        priority: Priority,
    ) -> Result<Uuid> {
        let operation = CleanupOperation::new(
            kind,
            "submitted",
            targets,
            priority,
            self.inner.ctx.config.cleanup.operation_timeout(),
        );
        self.inner.enqueue(operation)
    }

    /// Run an operation immediately on the urgent path and wait for it.
    pub async fn execute_now(&self, kind: CleanupType, reason: &str) -> Result<CleanupResult> {
        if self.inner.is_stopped() {
            return Err(EngineError::ManagerStopped);
        }
        let operation = CleanupOperation::new(
            kind,
            reason,
            Vec::new(),
            Priority::Critical,
            self.inner.ctx.config.cleanup.operation_timeout(),
        );
        Ok(self.inner.run_urgent(operation).await)
    }

    /// Completed results within the retention window, oldest first.
    pub fn results(&self) -> Vec<CleanupResult> {
        let mut results = self.inner.results.lock();
        self.inner.prune(&mut results);
        results.iter().cloned().collect()
    }

    pub fn result(&self, id: Uuid) -> Option<CleanupResult> {
        self.results()
            .into_iter()
            .find(|result| result.operation_id == id)
    }

    /// Every completed result as it is recorded.
    pub fn subscribe(&self) -> broadcast::Receiver<CleanupResult> {
        self.inner.completed.subscribe()
    }

    /// Carry counters over from an earlier run, so persisted statistics
    /// accumulate across invocations.
    pub fn seed_statistics(&self, previous: &CleanupStatistics) {
        let mut counters = self.inner.counters.lock();
        counters.executed += previous.executed;
        counters.succeeded += previous.succeeded;
        counters.failed += previous.failed;
        counters.cancelled += previous.cancelled;
        counters.last_cleanup = counters.last_cleanup.max(previous.last_cleanup);
    }

    pub fn statistics(&self) -> CleanupStatistics {
        let counters = self.inner.counters.lock();
        let completed = {
            let mut results = self.inner.results.lock();
            self.inner.prune(&mut results);
            results.len()
        };
        let trigger = self
            .inner
            .trigger
            .lock()
            .as_ref()
            .and_then(WeakTrigger::upgrade);

        CleanupStatistics {
            executed: counters.executed,
            succeeded: counters.succeeded,
            failed: counters.failed,
            cancelled: counters.cancelled,
            last_cleanup: counters.last_cleanup,
            pending: self.inner.queue.lock().len(),
            completed,
            in_progress: self.inner.in_progress.load(Ordering::SeqCst),
            peak_in_progress: self.inner.peak_in_progress.load(Ordering::SeqCst),
            monitored_processes: trigger.as_ref().map_or(0, CleanupTrigger::monitored_count),
            active_timeouts: trigger.as_ref().map_or(0, CleanupTrigger::active_timeouts),
            success_rate: if counters.executed == 0 {
                1.0
            } else {
                counters.succeeded as f64 / counters.executed as f64
            },
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Run a final complete cleanup (bounded by `shutdown_timeout_secs`), then
    /// drop everything still queued and wait for in-flight operations.
    ///
    /// Returns the final cleanup result, or `None` if it timed out or the
    /// manager was already shut down.
    pub async fn shutdown(&self) -> Option<CleanupResult> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return None;
        }
        let limit = self.inner.ctx.config.cleanup.shutdown_timeout();

        let operation = CleanupOperation::new(
            CleanupType::Complete,
            "shutdown",
            Vec::new(),
            Priority::Critical,
            limit,
        );
        let final_result =
            match tokio::time::timeout(limit, self.inner.run_urgent(operation)).await {
                Ok(result) => Some(result),
                Err(_) => {
                    tracing::error!(?limit, "final cleanup did not finish before shutdown");
                    None
                }
            };

        self.inner.cancel.cancel();
        let dropped = std::mem::take(&mut *self.inner.queue.lock()).len();
        if dropped > 0 {
            self.inner.counters.lock().cancelled += dropped as u64;
            tracing::warn!(dropped, "queued cleanups cancelled by shutdown");
        }

        self.inner.tracker.close();
        if tokio::time::timeout(limit, self.inner.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("in-flight cleanups still running after shutdown");
        }

        tracing::info!("cleanup manager stopped");
        final_result
    }
}

#[async_trait]
impl TriggerListener for CleanupManager {
    async fn on_trigger(&self, event: &TriggerEvent) -> anyhow::Result<()> {
        if self.inner.is_stopped() {
            tracing::debug!(reason = ?event.reason, "trigger ignored after shutdown");
            return Ok(());
        }

        let reason = format!("{:?}", event.reason);
        let timeout = self.inner.ctx.config.cleanup.operation_timeout();

        if event.urgent {
            let kind = match event.reason {
                TriggerReason::Manual => event.requested_type().unwrap_or(CleanupType::Complete),
                _ => CleanupType::Complete,
            };
            let targets = match (event.reason, event.pid) {
                // A timed-out process is still holding the credentials.
                (TriggerReason::Timeout, Some(pid)) => vec![CleanupTarget::Process(pid)],
                _ => Vec::new(),
            };
            let mut operation =
                CleanupOperation::new(kind, reason, targets, Priority::Critical, timeout);
            if let (TriggerReason::Timeout, Some(pid), Some(start_time)) =
                (event.reason, event.pid, event.process_start_time())
            {
                operation = operation.guard_process(pid, Some(start_time));
            }
            let result = self.inner.run_urgent(operation).await;
            if !result.success {
                anyhow::bail!(
                    "urgent {} cleanup failed: {}",
                    result.kind,
                    result
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("{} item(s) failed", result.failures().count()))
                );
            }
            return Ok(());
        }

        let (kind, targets, priority) = match event.reason {
            TriggerReason::ProcessExit => (
                CleanupType::ProcessTermination,
                event.pid.map(CleanupTarget::Process).into_iter().collect(),
                Priority::Normal,
            ),
            TriggerReason::Scheduled => (CleanupType::Memory, Vec::new(), Priority::Low),
            TriggerReason::Manual => (
                event.requested_type().unwrap_or(CleanupType::Complete),
                Vec::new(),
                Priority::Normal,
            ),
            _ => (CleanupType::Complete, Vec::new(), Priority::High),
        };
        let mut operation = CleanupOperation::new(kind, reason, targets, priority, timeout);
        // The monitor saw this pid exit; only a process that is still the
        // registered instance may be signalled.
        if let (TriggerReason::ProcessExit, Some(pid)) = (event.reason, event.pid) {
            operation = operation.guard_process(pid, event.process_start_time());
        }
        self.inner.enqueue(operation)?;
        Ok(())
    }
}

impl ManagerInner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn enqueue(&self, operation: CleanupOperation) -> Result<Uuid> {
        if self.is_stopped() {
            return Err(EngineError::ManagerStopped);
        }
        let id = operation.id;
        tracing::debug!(%id, kind = %operation.kind, priority = ?operation.priority, "cleanup queued");
        self.queue.lock().push(Queued {
            priority: operation.priority,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            operation,
        });
        self.queued.notify_one();
        Ok(id)
    }

    async fn work(self: Arc<Self>) {
        loop {
            let next = self.queue.lock().pop();
            let Some(queued) = next else {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.queued.notified() => continue,
                }
            };

            let permit = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.counters.lock().cancelled += 1;
                    break;
                }
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let inner = Arc::clone(&self);
            self.tracker.spawn(async move {
                let _permit = permit;
                // Wait out any urgent cleanup before starting.
                drop(inner.urgent_gate.read().await);
                inner.run(queued.operation).await;
            });
        }
        tracing::debug!("cleanup worker stopped");
    }

    async fn run_urgent(&self, operation: CleanupOperation) -> CleanupResult {
        let _gate = self.urgent_gate.write().await;
        self.run(operation).await
    }

    async fn run(&self, operation: CleanupOperation) -> CleanupResult {
        let now = self.in_progress.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_progress.fetch_max(now, Ordering::SeqCst);

        let result = operation.run(&self.ctx).await;

        self.in_progress.fetch_sub(1, Ordering::SeqCst);
        self.record(result.clone());
        result
    }

    fn record(&self, result: CleanupResult) {
        {
            let mut counters = self.counters.lock();
            counters.executed += 1;
            if result.success {
                counters.succeeded += 1;
            } else {
                counters.failed += 1;
            }
            counters.last_cleanup = Some(result.finished_at);
        }
        {
            let mut results = self.results.lock();
            results.push_back(result.clone());
            self.prune(&mut results);
        }
        let _ = self.completed.send(result);
    }

    fn prune(&self, results: &mut VecDeque<CleanupResult>) {
        let cleanup = &self.ctx.config.cleanup;
        while results.len() > cleanup.max_retained_results {
            results.pop_front();
        }
        let cutoff = chrono::Duration::from_std(cleanup.result_retention())
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        if let Some(cutoff) = cutoff {
            while results
                .front()
                .is_some_and(|result| result.finished_at < cutoff)
            {
                results.pop_front();
            }
        }
    }
}
