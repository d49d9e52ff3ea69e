use super::result::{CleanupResult, ItemOutcome};
use crate::config::EngineConfig;
use crate::configuration::ConfigurationManager;
use crate::error::EngineError;
use crate::injector;
use crate::process::{self, process_table};
use crate::vault::{ClearMode, SecureStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, Signal};
use uuid::Uuid;

const TERMINATION_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupType {
    Memory,
    EnvironmentVariable,
    ConfigurationFile,
    ProcessTermination,
    Complete,
}

impl std::fmt::Display for CleanupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Memory => "memory",
            Self::EnvironmentVariable => "environment_variable",
            Self::ConfigurationFile => "configuration_file",
            Self::ProcessTermination => "process_termination",
            Self::Complete => "complete",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for CleanupType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "environment_variable" | "env" => Ok(Self::EnvironmentVariable),
            "configuration_file" | "files" => Ok(Self::ConfigurationFile),
            "process_termination" | "process" => Ok(Self::ProcessTermination),
            "complete" => Ok(Self::Complete),
            other => Err(format!("unknown cleanup type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupTarget {
    EnvVar(String),
    File(PathBuf),
    Process(u32),
    Store,
}

impl std::fmt::Display for CleanupTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EnvVar(name) => write!(f, "env:{}", name),
            Self::File(path) => write!(f, "file:{}", path.display()),
            Self::Process(pid) => write!(f, "pid:{}", pid),
            Self::Store => f.write_str("store"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// One unit of cleanup work. Consumed by [`CleanupOperation::run`].
#[derive(Debug, Clone)]
pub struct CleanupOperation {
    pub id: Uuid,
    pub kind: CleanupType,
    pub reason: String,
    /// Explicit targets. Empty means the configured defaults for `kind`.
    pub targets: Vec<CleanupTarget>,
    pub priority: Priority,
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
    /// Identity-guarded pids and the OS start time they must still have.
    /// `None` means the identity was never known, so the pid is not signalled.
    pub expected_start: BTreeMap<u32, Option<u64>>,
}

/// Everything an operation may touch.
#[derive(Clone)]
pub(crate) struct CleanupContext {
    pub store: Arc<SecureStore>,
    pub configuration: Option<Arc<ConfigurationManager>>,
    pub config: Arc<EngineConfig>,
}

impl CleanupOperation {
    pub fn new(
        kind: CleanupType,
        reason: impl Into<String>,
        targets: Vec<CleanupTarget>,
        priority: Priority,
        timeout: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            reason: reason.into(),
            targets,
            priority,
            timeout,
            created_at: Utc::now(),
            expected_start: BTreeMap::new(),
        }
    }

    /// Only signal `pid` while it is still the process that started at
    /// `start_time` (seconds since the epoch).
    pub fn guard_process(mut self, pid: u32, start_time: Option<u64>) -> Self {
        self.expected_start.insert(pid, start_time);
        self
    }

    /// Execute within the operation timeout, then verify what execution
    /// claimed.
    pub(crate) async fn run(self, ctx: &CleanupContext) -> CleanupResult {
        let mut result = CleanupResult::begin(&self);
        tracing::debug!(id = %self.id, kind = %self.kind, reason = %self.reason, "cleanup started");

        match tokio::time::timeout(self.timeout, self.execute(ctx, &mut result)).await {
            Ok(()) => verify(ctx, &mut result).await,
            Err(_) => {
                let err = EngineError::Timeout {
                    what: format!("{} cleanup", self.kind),
                    after: self.timeout,
                };
                result.fail(err.to_string());
            }
        }

        result.finish();
        if self.kind == CleanupType::Complete && result.success {
            if let Some(configuration) = &ctx.configuration {
                configuration.mark_cleared(&self.reason);
            }
        }

        if result.success {
            tracing::info!(
                id = %self.id,
                kind = %self.kind,
                items = result.items.len(),
                bytes = result.bytes_released,
                variables = result.variables_cleared,
                files = result.files_deleted,
                processes = result.processes_terminated,
                "cleanup complete"
            );
        } else {
            tracing::warn!(
                id = %self.id,
                kind = %self.kind,
                error = ?result.error,
                failures = result.failures().count(),
                verification_failed = result.verification_failed,
                "cleanup incomplete"
            );
        }
        result
    }

    async fn execute(&self, ctx: &CleanupContext, result: &mut CleanupResult) {
        match self.kind {
            CleanupType::Memory => clear_memory(ctx, result),
            CleanupType::EnvironmentVariable => clear_env(&self.env_targets(ctx), result),
            CleanupType::ConfigurationFile => {
                delete_files(&self.file_targets(ctx), result).await;
            }
            CleanupType::ProcessTermination => {
                terminate_processes(ctx, &self.process_targets(), &self.expected_start, result)
                    .await;
            }
            CleanupType::Complete => {
                clear_memory(ctx, result);
                clear_env(&self.env_targets(ctx), result);
                delete_files(&self.file_targets(ctx), result).await;
                let processes = self.process_targets();
                if !processes.is_empty() {
                    terminate_processes(ctx, &processes, &self.expected_start, result).await;
                }
            }
        }
    }

    fn env_targets(&self, ctx: &CleanupContext) -> Vec<String> {
        let explicit: Vec<String> = self
            .targets
            .iter()
            .filter_map(|target| match target {
                CleanupTarget::EnvVar(name) => Some(name.clone()),
                _ => None,
            })
            .collect();
        if !explicit.is_empty() {
            return explicit;
        }

        let mut names = ctx.config.known_env_vars();
        if let Some(configuration) = &ctx.configuration {
            for name in configuration.applied_vars() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    fn file_targets(&self, ctx: &CleanupContext) -> Vec<PathBuf> {
        let explicit: Vec<PathBuf> = self
            .targets
            .iter()
            .filter_map(|target| match target {
                CleanupTarget::File(path) => Some(path.clone()),
                _ => None,
            })
            .collect();
        if explicit.is_empty() {
            ctx.config.cleanup.config_files.clone()
        } else {
            explicit
        }
    }

    fn process_targets(&self) -> Vec<u32> {
        self.targets
            .iter()
            .filter_map(|target| match target {
                CleanupTarget::Process(pid) => Some(*pid),
                _ => None,
            })
            .collect()
    }
}

fn clear_memory(ctx: &CleanupContext, result: &mut CleanupResult) {
    match ctx.store.clear_all(ClearMode::Forced) {
        Ok(outcome) => {
            result.bytes_released += outcome.bytes_released;
            result.push(CleanupTarget::Store, ItemOutcome::Success);
        }
        Err(EngineError::StoreClosed) => {
            result.push(CleanupTarget::Store, ItemOutcome::skipped("store closed"));
        }
        Err(e) => result.push(CleanupTarget::Store, ItemOutcome::failed(e.to_string())),
    }
}

fn clear_env(names: &[String], result: &mut CleanupResult) {
    let env = injector::lock();
    for name in names {
        let target = CleanupTarget::EnvVar(name.clone());
        if env.unset(name) {
            result.variables_cleared += 1;
            result.push(target, ItemOutcome::Success);
        } else {
            result.push(target, ItemOutcome::skipped("not set"));
        }
    }
}

async fn delete_files(paths: &[PathBuf], result: &mut CleanupResult) {
    for path in paths {
        let target = CleanupTarget::File(path.clone());
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                result.files_deleted += 1;
                result.push(target, ItemOutcome::Success);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                result.push(target, ItemOutcome::skipped("file not present"));
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to delete file");
                result.push(target, ItemOutcome::failed(e.to_string()));
            }
        }
    }
}

async fn terminate_processes(
    ctx: &CleanupContext,
    pids: &[u32],
    expected_start: &BTreeMap<u32, Option<u64>>,
    result: &mut CleanupResult,
) {
    let wait = ctx.config.cleanup.process_wait();
    for &pid in pids {
        let target = CleanupTarget::Process(pid);
        if pid == std::process::id() {
            result.push(
                target,
                ItemOutcome::Skipped {
                    reason: "refusing to terminate own process".to_string(),
                    required: true,
                },
            );
            continue;
        }

        let outcome = match expected_start.get(&pid) {
            Some(None) => ItemOutcome::skipped("process identity unknown"),
            Some(Some(start_time)) => terminate(pid, Some(*start_time), wait).await,
            None => terminate(pid, None, wait).await,
        };
        if outcome == ItemOutcome::Success {
            result.processes_terminated += 1;
        }
        result.push(target, outcome);
    }
}

enum Signalled {
    NotRunning,
    Reused,
    Sent(bool),
}

async fn terminate(pid: u32, expected_start: Option<u64>, wait: Duration) -> ItemOutcome {
    let signalled = tokio::task::spawn_blocking(move || {
        let sys = process_table();
        let Some(process) = sys.process(Pid::from_u32(pid)) else {
            return Signalled::NotRunning;
        };
        if expected_start.is_some_and(|start_time| process.start_time() != start_time) {
            tracing::warn!(pid, "pid now belongs to another process, not signalling");
            return Signalled::Reused;
        }
        tracing::info!(pid, name = %process.name().to_string_lossy(), "terminating process");
        Signalled::Sent(process.kill_with(Signal::Term).unwrap_or_else(|| process.kill()))
    })
    .await;

    match signalled {
        Ok(Signalled::NotRunning) => return ItemOutcome::skipped("process not running"),
        Ok(Signalled::Reused) => return ItemOutcome::skipped("pid reused by another process"),
        Ok(Signalled::Sent(false)) => return ItemOutcome::failed("failed to signal process"),
        Ok(Signalled::Sent(true)) => {}
        Err(e) => return ItemOutcome::failed(e.to_string()),
    }

    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if !is_running(pid).await {
            return ItemOutcome::Success;
        }
        if tokio::time::Instant::now() >= deadline {
            let err = EngineError::Timeout {
                what: format!("termination of pid {}", pid),
                after: wait,
            };
            return ItemOutcome::failed(err.to_string());
        }
        tokio::time::sleep(TERMINATION_POLL).await;
    }
}

async fn is_running(pid: u32) -> bool {
    tokio::task::spawn_blocking(move || process::is_running(pid))
        .await
        .unwrap_or(true)
}

/// Check every item execution marked successful. Disagreement downgrades the
/// item and flags the result.
///
/// Store, environment and file checks run under the env lock; process checks
/// run after it is released.
async fn verify(ctx: &CleanupContext, result: &mut CleanupResult) {
    let mut problems: Vec<(usize, String)> = Vec::new();
    let mut processes = Vec::new();
    {
        let env = injector::lock();
        for (index, item) in result.items.iter().enumerate() {
            if item.outcome != ItemOutcome::Success {
                continue;
            }
            let problem = match &item.target {
                CleanupTarget::Store => match ctx.store.is_empty() {
                    Ok(true) | Err(EngineError::StoreClosed) => None,
                    Ok(false) => Some("store still holds secrets".to_string()),
                    Err(e) => Some(e.to_string()),
                },
                CleanupTarget::EnvVar(name) => env
                    .is_set(name)
                    .then(|| "variable still set".to_string()),
                CleanupTarget::File(path) => {
                    path_exists(path).then(|| "file still present".to_string())
                }
                CleanupTarget::Process(pid) => {
                    processes.push((index, *pid));
                    None
                }
            };
            if let Some(problem) = problem {
                problems.push((index, problem));
            }
        }
    }
    for (index, pid) in processes {
        if is_running(pid).await {
            problems.push((index, "process still running".to_string()));
        }
    }

    if problems.is_empty() {
        return;
    }
    for (index, problem) in problems {
        let item = &mut result.items[index];
        let err = EngineError::Verification {
            target: item.target.to_string(),
            message: problem,
        };
        tracing::error!(error = %err, "cleanup verification failed");
        item.outcome = ItemOutcome::failed(err.to_string());
    }
    result.verification_failed = true;
}

fn path_exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn context(config: EngineConfig) -> CleanupContext {
        CleanupContext {
            store: Arc::new(SecureStore::new()),
            configuration: None,
            config: Arc::new(config),
        }
    }

    fn operation(kind: CleanupType, targets: Vec<CleanupTarget>) -> CleanupOperation {
        CleanupOperation::new(kind, "test", targets, Priority::Normal, Duration::from_secs(10))
    }

    #[test]
    fn test_cleanup_type_round_trips_through_text() {
        for kind in [
            CleanupType::Memory,
            CleanupType::EnvironmentVariable,
            CleanupType::ConfigurationFile,
            CleanupType::ProcessTermination,
            CleanupType::Complete,
        ] {
            assert_eq!(kind.to_string().parse::<CleanupType>().unwrap(), kind);
        }
        assert!("bogus".parse::<CleanupType>().is_err());
    }

    #[tokio::test]
    async fn test_memory_cleanup_records_bytes() {
        let ctx = context(EngineConfig::default());
        ctx.store.store("AUTH", "sk-abc123").unwrap();

        let result = operation(CleanupType::Memory, Vec::new()).run(&ctx).await;
        assert!(result.success);
        assert_eq!(result.bytes_released, 9);
        assert!(ctx.store.is_empty().unwrap());

        ctx.store.close().unwrap();
        let result = operation(CleanupType::Memory, Vec::new()).run(&ctx).await;
        assert!(result.success);
        assert!(matches!(result.items[0].outcome, ItemOutcome::Skipped { .. }));
    }

    #[tokio::test]
    #[serial]
    async fn test_env_cleanup_skips_unset_variables() {
        let ctx = context(EngineConfig::default());
        injector::lock().set("ENVSHIELD_OP_SET", b"value").unwrap();

        let result = operation(
            CleanupType::EnvironmentVariable,
            vec![
                CleanupTarget::EnvVar("ENVSHIELD_OP_SET".to_string()),
                CleanupTarget::EnvVar("ENVSHIELD_OP_UNSET".to_string()),
            ],
        )
        .run(&ctx)
        .await;

        assert!(result.success);
        assert_eq!(result.variables_cleared, 1);
        assert_eq!(result.items[1].outcome, ItemOutcome::skipped("not set"));
        assert!(std::env::var("ENVSHIELD_OP_SET").is_err());
    }

    #[tokio::test]
    async fn test_file_cleanup_uses_configured_paths() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("settings.json");
        let missing = dir.path().join("missing.json");
        std::fs::write(&present, "{}").unwrap();

        let mut config = EngineConfig::default();
        config.cleanup.config_files = vec![present.clone(), missing];
        let ctx = context(config);

        let result = operation(CleanupType::ConfigurationFile, Vec::new())
            .run(&ctx)
            .await;
        assert!(result.success);
        assert_eq!(result.files_deleted, 1);
        assert!(!present.exists());
        assert_eq!(result.count(|o| matches!(o, ItemOutcome::Skipped { .. })), 1);
    }

    #[tokio::test]
    async fn test_own_process_is_never_terminated() {
        let ctx = context(EngineConfig::default());
        let result = operation(
            CleanupType::ProcessTermination,
            vec![CleanupTarget::Process(std::process::id())],
        )
        .run(&ctx)
        .await;
        assert!(!result.success);
        assert!(matches!(
            result.items[0].outcome,
            ItemOutcome::Skipped { required: true, .. }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminates_child_process() {
        let ctx = context(EngineConfig::default());
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        // Reap the child so it does not linger as a zombie.
        let reaper = tokio::spawn(async move { child.wait().await });

        let result = operation(
            CleanupType::ProcessTermination,
            vec![CleanupTarget::Process(pid)],
        )
        .run(&ctx)
        .await;

        assert!(result.success, "{:?}", result.items);
        assert_eq!(result.processes_terminated, 1);
        assert!(!reaper.await.unwrap().unwrap().success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_process_is_skipped() {
        let ctx = context(EngineConfig::default());
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let result = operation(
            CleanupType::ProcessTermination,
            vec![CleanupTarget::Process(pid)],
        )
        .run(&ctx)
        .await;
        assert!(result.success);
        assert_eq!(result.items[0].outcome, ItemOutcome::skipped("process not running"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_guarded_process_is_only_signalled_if_identity_matches() {
        let ctx = context(EngineConfig::default());
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let start_time = process::start_time(pid).unwrap();

        let reused = operation(
            CleanupType::ProcessTermination,
            vec![CleanupTarget::Process(pid)],
        )
        .guard_process(pid, Some(start_time + 3600))
        .run(&ctx)
        .await;
        assert!(reused.success);
        assert_eq!(
            reused.items[0].outcome,
            ItemOutcome::skipped("pid reused by another process")
        );

        let unknown = operation(
            CleanupType::ProcessTermination,
            vec![CleanupTarget::Process(pid)],
        )
        .guard_process(pid, None)
        .run(&ctx)
        .await;
        assert_eq!(
            unknown.items[0].outcome,
            ItemOutcome::skipped("process identity unknown")
        );
        assert!(process::is_running(pid));

        let reaper = tokio::spawn(async move { child.wait().await });
        let same = operation(
            CleanupType::ProcessTermination,
            vec![CleanupTarget::Process(pid)],
        )
        .guard_process(pid, Some(start_time))
        .run(&ctx)
        .await;
        assert_eq!(same.processes_terminated, 1);
        assert!(!reaper.await.unwrap().unwrap().success());
    }

    #[tokio::test]
    #[serial]
    async fn test_complete_cleanup_merges_everything() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("credentials");
        std::fs::write(&file, "token").unwrap();

        let mut config = EngineConfig::default();
        config.items[0].env = "ENVSHIELD_OP_COMPLETE".to_string();
        config.items[1].env = "ENVSHIELD_OP_COMPLETE_URL".to_string();
        config.cleanup.config_files = vec![file.clone()];
        let ctx = context(config);
        ctx.store.store("AUTH", "sk-abc123").unwrap();
        injector::lock()
            .set("ENVSHIELD_OP_COMPLETE", b"sk-abc123")
            .unwrap();

        let result = operation(CleanupType::Complete, Vec::new()).run(&ctx).await;

        assert!(result.success, "{:?}", result.items);
        assert_eq!(result.kind, CleanupType::Complete);
        assert_eq!(result.variables_cleared, 1);
        assert_eq!(result.files_deleted, 1);
        assert_eq!(result.bytes_released, 9);
        assert!(!result.verification_failed);
    }

    #[tokio::test]
    async fn test_verification_downgrades_disagreeing_items() {
        let ctx = context(EngineConfig::default());
        let mut result = CleanupResult::begin(&operation(CleanupType::Memory, Vec::new()));
        ctx.store.store("AUTH", "sk-abc123").unwrap();
        result.push(CleanupTarget::Store, ItemOutcome::Success);

        verify(&ctx, &mut result).await;
        result.finish();

        assert!(result.verification_failed);
        assert!(!result.success);
        assert!(matches!(result.items[0].outcome, ItemOutcome::Failed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn test_verification_checks_processes_outside_env_lock() {
        let ctx = context(EngineConfig::default());
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let mut result =
            CleanupResult::begin(&operation(CleanupType::ProcessTermination, Vec::new()));
        result.push(CleanupTarget::Process(pid), ItemOutcome::Success);
        result.push(CleanupTarget::EnvVar("ENVSHIELD_OP_VERIFY".into()), ItemOutcome::Success);

        verify(&ctx, &mut result).await;

        assert!(result.verification_failed);
        assert!(matches!(
            &result.items[0].outcome,
            ItemOutcome::Failed { message } if message.contains("process still running")
        ));
        assert_eq!(result.items[1].outcome, ItemOutcome::Success);
        // the env lock is free again once verification returns
        assert!(injector::try_lock_for(Duration::from_millis(10)).is_some());
        child.kill().await.unwrap();
    }
}
