//! Configuration state machine.
//!
//! Tracks whether credentials are set, applied to the process environment,
//! validated or cleared, and exposes apply / validate / rollback / clear as
//! transactional operations over the [`SecureStore`] and the environment.
//!
//! ```text
//! Uninitialized -> Initialized -> Configured -> Applied
//!                                     ^            |
//!                                     |            v
//!                  Error <------- (failure)     Cleared
//! ```
//!
//! `Applied` is reachable only from `Configured`. Every public operation
//! returns an [`OperationResult`]; nothing here panics past the boundary.

use crate::config::{EngineConfig, ItemDefinition, ItemFormat, ItemKind};
use crate::error::EngineError;
use crate::injector::{self, EnvSnapshot};
use crate::vault::{ClearMode, SecureStore, Secret};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use zeroize::Zeroizing;

const MAX_HISTORY: usize = 100;

/// Tokens shorter than this validate with a warning.
const RECOMMENDED_TOKEN_LENGTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigurationState {
    Uninitialized,
    Initialized,
    Configured,
    Applied,
    Error,
    Cleared,
}

impl std::fmt::Display for ConfigurationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninitialized => "Uninitialized",
            Self::Initialized => "Initialized",
            Self::Configured => "Configured",
            Self::Applied => "Applied",
            Self::Error => "Error",
            Self::Cleared => "Cleared",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ConfigurationState,
    pub to: ConfigurationState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a public operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    pub cause: Option<String>,
    /// Items written, cleared or restored, depending on the operation
    pub items: usize,
}

impl OperationResult {
    fn ok(message: impl Into<String>, items: usize) -> Self {
        Self {
            success: true,
            message: message.into(),
            cause: None,
            items,
        }
    }

    fn failed(message: impl Into<String>, cause: Option<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            cause,
            items: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Ok,
    Warning,
    Error,
    Fatal,
}

/// One validation or probe finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCheck {
    pub key: String,
    pub severity: Severity,
    pub message: String,
}

impl ItemCheck {
    fn new(key: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            severity,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub checks: Vec<ItemCheck>,
}

impl ValidationReport {
    /// No check reported an error or fatal finding.
    pub fn is_valid(&self) -> bool {
        self.checks.iter().all(|check| check.severity < Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ItemCheck> {
        self.checks
            .iter()
            .filter(|check| check.severity == Severity::Warning)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ItemCheck> {
        self.checks
            .iter()
            .filter(|check| check.severity >= Severity::Error)
    }

    pub fn check(&self, key: &str) -> Option<&ItemCheck> {
        self.checks.iter().find(|check| check.key == key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Advisory health: validation plus external probes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub score: u32,
    pub status: HealthStatus,
    pub checks: Vec<ItemCheck>,
}

struct Inner {
    state: ConfigurationState,
    history: VecDeque<StateTransition>,
    /// Keys set through `set_secret` / `set_plain` since the last clear
    values: BTreeSet<String>,
    /// Environment variables written by the last successful apply
    applied: Vec<String>,
    /// Pre-apply values, consumed by rollback
    snapshot: Option<EnvSnapshot>,
}

impl Inner {
    fn transition(
        &mut self,
        to: ConfigurationState,
        reason: impl Into<String>,
    ) -> Option<StateTransition> {
        if self.state == to {
            return None;
        }
        let transition = StateTransition {
            from: self.state,
            to,
            reason: reason.into(),
            timestamp: Utc::now(),
        };
        self.state = to;
        if self.history.len() == MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(transition.clone());
        Some(transition)
    }
}

/// Applies store-held credentials to the process environment and takes them
/// back out again.
pub struct ConfigurationManager {
    config: Arc<EngineConfig>,
    store: Arc<SecureStore>,
    inner: Mutex<Inner>,
    transitions: broadcast::Sender<StateTransition>,
}

impl ConfigurationManager {
    pub fn new(config: Arc<EngineConfig>, store: Arc<SecureStore>) -> Self {
        let (transitions, _) = broadcast::channel(64);
        let mut inner = Inner {
            state: ConfigurationState::Uninitialized,
            history: VecDeque::new(),
            values: BTreeSet::new(),
            applied: Vec::new(),
            snapshot: None,
        };
        inner.transition(ConfigurationState::Initialized, "created");

        Self {
            config,
            store,
            inner: Mutex::new(inner),
            transitions,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SecureStore> {
        &self.store
    }

    pub fn state(&self) -> ConfigurationState {
        self.inner.lock().state
    }

    pub fn history(&self) -> Vec<StateTransition> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// Variables written by the last successful apply and not yet cleared.
    pub fn applied_vars(&self) -> Vec<String> {
        self.inner.lock().applied.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// Store a credential (token) under `key`.
    pub fn set_secret(&self, key: &str, value: impl Into<Secret>) -> OperationResult {
        self.set_value(key, value.into(), ItemKind::Secret)
    }

    /// Store a non-credential setting (e.g. base URL) under `key`.
    pub fn set_plain(&self, key: &str, value: impl Into<Secret>) -> OperationResult {
        self.set_value(key, value.into(), ItemKind::Plain)
    }

    fn set_value(&self, key: &str, value: Secret, kind: ItemKind) -> OperationResult {
        let Some(item) = self.config.item(key) else {
            let err = EngineError::UnknownKey(key.to_string());
            tracing::warn!(key, "rejected value for unknown key");
            return OperationResult::failed(err.to_string(), Some(err.to_string()));
        };
        if item.kind != kind {
            tracing::debug!(key, declared = ?item.kind, used = ?kind, "item kind mismatch");
        }

        if let Err(err) = self.store.store(key, value) {
            return OperationResult::failed(
                format!("failed to store value for '{}'", key),
                Some(err.to_string()),
            );
        }

        let transition = {
            let mut inner = self.inner.lock();
            inner.values.insert(key.to_string());
            inner.transition(
                ConfigurationState::Configured,
                format!("value set for {}", key),
            )
        };
        self.publish(transition);

        OperationResult::ok(format!("value set for '{}'", key), 1)
    }

    /// Write every set value into the process environment.
    ///
    /// Refused, leaving the state at `Configured`, while any required item
    /// has no value. The current value of each target variable is snapshotted first so
    /// [`rollback`](Self::rollback) can restore it.
    pub fn apply(&self) -> OperationResult {
        let mut inner = self.inner.lock();
        match inner.state {
            ConfigurationState::Configured => {}
            ConfigurationState::Applied => {
                return OperationResult::ok("already applied", 0);
            }
            other => {
                return OperationResult::failed(
                    format!("cannot apply from state {}", other),
                    None,
                );
            }
        }

        let missing: Vec<&str> = self
            .config
            .items
            .iter()
            .filter(|item| item.required && !inner.values.contains(&item.key))
            .map(|item| item.env.as_str())
            .collect();
        if !missing.is_empty() {
            let err = EngineError::Apply {
                var: missing.join(", "),
                message: "required value is not set".to_string(),
            };
            tracing::warn!(?missing, "apply refused");
            return OperationResult::failed("apply failed", Some(err.to_string()));
        }

        let items: Vec<&ItemDefinition> = self
            .config
            .items
            .iter()
            .filter(|item| inner.values.contains(&item.key))
            .collect();
        let names: Vec<String> = items.iter().map(|item| item.env.clone()).collect();

        let env = injector::lock();
        inner
            .snapshot
            .get_or_insert_with(|| EnvSnapshot::capture_with(&env, &[]))
            .capture_missing(&env, &names);

        let mut written = Vec::new();
        let mut failure = None;
        for item in &items {
            let outcome = self
                .store
                .with_secret(&item.key, |bytes| env.set(&item.env, bytes));
            let err = match outcome {
                Ok(Some(Ok(()))) => {
                    written.push(item.env.clone());
                    continue;
                }
                Ok(Some(Err(err))) => err,
                Ok(None) => EngineError::Apply {
                    var: item.env.clone(),
                    message: format!("value for '{}' is no longer in the store", item.key),
                },
                Err(err) => err,
            };
            failure = Some(err);
            break;
        }

        if let Some(err) = failure {
            if let Some(snapshot) = inner.snapshot.as_ref() {
                if let Err(restore_err) = snapshot.restore_with(&env) {
                    tracing::error!(error = %restore_err, "failed to undo partial apply");
                }
            }
            inner.applied.clear();
            drop(env);
            tracing::error!(error = %err, "apply failed");
            let transition = inner.transition(ConfigurationState::Error, err.to_string());
            drop(inner);
            self.publish(transition);
            return OperationResult::failed("apply failed", Some(err.to_string()));
        }
        drop(env);

        for name in &written {
            if !inner.applied.contains(name) {
                inner.applied.push(name.clone());
            }
        }
        let count = written.len();
        tracing::info!(variables = count, "credentials applied to environment");
        let transition = inner.transition(
            ConfigurationState::Applied,
            format!("applied {} variable(s)", count),
        );
        drop(inner);
        self.publish(transition);

        OperationResult::ok(format!("applied {} variable(s)", count), count)
    }

    /// Check required presence and format of every item. Does not change state.
    pub fn validate(&self) -> ValidationReport {
        let checks = self
            .config
            .items
            .iter()
            .map(|item| {
                match self
                    .store
                    .with_secret(&item.key, |bytes| check_format(item, bytes))
                {
                    Ok(Some(check)) => check,
                    Ok(None) if item.required => {
                        ItemCheck::new(&item.key, Severity::Error, "required value is not set")
                    }
                    Ok(None) => ItemCheck::new(&item.key, Severity::Ok, "not set (optional)"),
                    Err(err) => ItemCheck::new(&item.key, Severity::Fatal, err.to_string()),
                }
            })
            .collect();

        ValidationReport { checks }
    }

    /// Validation plus advisory probes of the wrapped tool and, optionally,
    /// the configured endpoint.
    pub async fn health_check(&self) -> HealthReport {
        let mut checks = self.validate().checks;
        checks.push(self.probe_tool().await);
        if self.config.tool.probe_endpoint {
            if let Some(check) = self.probe_endpoint().await {
                checks.push(check);
            }
        }

        let health = &self.config.health;
        let score = if checks.is_empty() {
            health.success_weight
        } else {
            let total: u32 = checks
                .iter()
                .map(|check| match check.severity {
                    Severity::Ok => health.success_weight,
                    Severity::Warning => health.warning_weight,
                    Severity::Error | Severity::Fatal => health.error_weight,
                })
                .sum();
            total / checks.len() as u32
        };
        let status = if score >= health.healthy_threshold {
            HealthStatus::Healthy
        } else if score >= health.degraded_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        tracing::debug!(score, status = ?status, "health check complete");
        HealthReport {
            score,
            status,
            checks,
        }
    }

    async fn probe_tool(&self) -> ItemCheck {
        let tool = &self.config.tool;
        let path = match which::which(&tool.command) {
            Ok(path) => path,
            Err(err) => {
                let err = EngineError::ExternalProbe(format!(
                    "'{}' not found in PATH: {}",
                    tool.command, err
                ));
                return ItemCheck::new("tool", Severity::Warning, err.to_string());
            }
        };

        let limit = Duration::from_secs(tool.probe_timeout_secs);
        let output = tokio::process::Command::new(&path)
            .arg(&tool.version_arg)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(limit, output).await {
            Err(_) => {
                let err = EngineError::Timeout {
                    what: format!("probe of '{}'", tool.command),
                    after: limit,
                };
                ItemCheck::new("tool", Severity::Warning, err.to_string())
            }
            Ok(Err(err)) => ItemCheck::new(
                "tool",
                Severity::Warning,
                format!("failed to run '{}': {}", tool.command, err),
            ),
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let first_line = stdout.lines().next().unwrap_or("").trim();
                if output.status.success() && !first_line.is_empty() {
                    ItemCheck::new(
                        "tool",
                        Severity::Ok,
                        format!("{} ({})", path.display(), first_line),
                    )
                } else {
                    ItemCheck::new(
                        "tool",
                        Severity::Warning,
                        format!(
                            "'{} {}' exited with {} and {} output",
                            tool.command,
                            tool.version_arg,
                            output.status,
                            if first_line.is_empty() { "no" } else { "some" }
                        ),
                    )
                }
            }
        }
    }

    async fn probe_endpoint(&self) -> Option<ItemCheck> {
        let item = self
            .config
            .items
            .iter()
            .find(|item| item.format == ItemFormat::Url)?;
        let value: Zeroizing<String> = self
            .store
            .with_secret(&item.key, |bytes| {
                String::from_utf8(bytes.to_vec()).ok().map(Zeroizing::new)
            })
            .ok()
            .flatten()
            .flatten()?;

        let url = url::Url::parse(&value).ok()?;
        let host = url.host_str()?.to_string();
        let port = url.port_or_known_default()?;
        let limit = Duration::from_secs(self.config.tool.probe_timeout_secs);

        let check = match tokio::time::timeout(
            limit,
            tokio::net::TcpStream::connect((host.as_str(), port)),
        )
        .await
        {
            Ok(Ok(_)) => ItemCheck::new(
                "endpoint",
                Severity::Ok,
                format!("{}:{} accepts connections", host, port),
            ),
            Ok(Err(err)) => ItemCheck::new(
                "endpoint",
                Severity::Warning,
                format!("{}:{} unreachable: {}", host, port, err),
            ),
            Err(_) => ItemCheck::new(
                "endpoint",
                Severity::Warning,
                format!("{}:{} did not answer within {:?}", host, port, limit),
            ),
        };
        Some(check)
    }

    /// Unset every applied variable and force-clear the store.
    ///
    /// Idempotent: a second call succeeds with zero items cleared.
    pub fn clear(&self) -> OperationResult {
        let mut inner = self.inner.lock();
        let (result, transition) = self.clear_locked(&mut inner, "clear requested");
        drop(inner);
        self.publish(transition);
        result
    }

    /// [`clear`](Self::clear), then restore the pre-apply snapshot.
    pub fn rollback(&self) -> OperationResult {
        let mut inner = self.inner.lock();
        let (cleared, transition) = self.clear_locked(&mut inner, "rollback");
        if !cleared.success {
            drop(inner);
            self.publish(transition);
            return cleared;
        }

        let Some(snapshot) = inner.snapshot.take() else {
            drop(inner);
            self.publish(transition);
            return OperationResult::ok("nothing to roll back; cleared", cleared.items);
        };

        match snapshot.restore() {
            Ok(restored) => {
                drop(inner);
                self.publish(transition);
                tracing::info!(restored, "environment rolled back");
                OperationResult::ok(
                    format!("rolled back; restored {} pre-existing variable(s)", restored),
                    cleared.items,
                )
            }
            Err(err) => {
                let error_transition =
                    inner.transition(ConfigurationState::Error, err.to_string());
                drop(inner);
                self.publish(transition);
                self.publish(error_transition);
                OperationResult::failed("rollback failed", Some(err.to_string()))
            }
        }
    }

    /// Record that a cleanup elsewhere already unset the variables and
    /// cleared the store.
    pub fn mark_cleared(&self, reason: &str) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.applied.clear();
            inner.values.clear();
            inner.transition(ConfigurationState::Cleared, reason)
        };
        self.publish(transition);
    }

    fn clear_locked(
        &self,
        inner: &mut Inner,
        reason: &str,
    ) -> (OperationResult, Option<StateTransition>) {
        let mut cleared = 0;
        let mut still_set = Vec::new();
        {
            let env = injector::lock();
            for name in inner.applied.drain(..) {
                if env.unset(&name) {
                    cleared += 1;
                }
                if env.is_set(&name) {
                    still_set.push(name);
                }
            }
        }

        match self.store.clear_all(ClearMode::Forced) {
            Ok(outcome) => cleared += outcome.items_cleared,
            // A torn-down store holds nothing.
            Err(EngineError::StoreClosed) => {}
            Err(err) => {
                let transition = inner.transition(ConfigurationState::Error, err.to_string());
                return (
                    OperationResult::failed("failed to clear secure store", Some(err.to_string())),
                    transition,
                );
            }
        }
        inner.values.clear();

        if !still_set.is_empty() {
            let err = EngineError::Verification {
                target: still_set.join(", "),
                message: "variable still set after clear".to_string(),
            };
            tracing::error!(error = %err, "clear verification failed");
            inner.applied = still_set;
            let transition = inner.transition(ConfigurationState::Error, err.to_string());
            return (
                OperationResult::failed("clear incomplete", Some(err.to_string())),
                transition,
            );
        }

        tracing::info!(items = cleared, reason, "configuration cleared");
        let transition = inner.transition(ConfigurationState::Cleared, reason);
        (
            OperationResult::ok(format!("cleared {} item(s)", cleared), cleared),
            transition,
        )
    }

    fn publish(&self, transition: Option<StateTransition>) {
        if let Some(transition) = transition {
            tracing::debug!(
                from = %transition.from,
                to = %transition.to,
                reason = %transition.reason,
                "configuration state changed"
            );
            let _ = self.transitions.send(transition);
        }
    }
}

impl Drop for ConfigurationManager {
    fn drop(&mut self) {
        let needs_clear = !self.inner.get_mut().applied.is_empty()
            || self.store.is_empty().map(|empty| !empty).unwrap_or(false);
        if needs_clear {
            let result = self.clear();
            if !result.success {
                tracing::error!(message = %result.message, "final clear on drop failed");
            }
        }
    }
}

fn check_format(item: &ItemDefinition, bytes: &[u8]) -> ItemCheck {
    let key = item.key.as_str();
    let Ok(value) = std::str::from_utf8(bytes) else {
        return invalid(key, "value is not valid UTF-8");
    };
    if value.trim().is_empty() {
        return invalid(key, "value is empty");
    }

    match &item.format {
        ItemFormat::Token { prefix, min_length } => {
            if !value.starts_with(prefix.as_str()) {
                return invalid(key, format!("token does not start with '{}'", prefix));
            }
            if value.len() <= prefix.len() {
                return invalid(key, "token has no content after prefix");
            }
            if value.len() < *min_length {
                return invalid(key, format!("token is shorter than {} characters", min_length));
            }
            if value.chars().any(char::is_whitespace) {
                return invalid(key, "token contains whitespace");
            }
            if value.len() < RECOMMENDED_TOKEN_LENGTH {
                return ItemCheck::new(key, Severity::Warning, "token is unusually short");
            }
            ItemCheck::new(key, Severity::Ok, "token format valid")
        }
        ItemFormat::Url => {
            let url = match url::Url::parse(value) {
                Ok(url) => url,
                Err(err) => {
                    return invalid(key, format!("invalid URL: {}", err));
                }
            };
            if url.scheme() != "https" && url.scheme() != "http" {
                return invalid(key, format!("unsupported URL scheme '{}'", url.scheme()));
            }
            let Some(host) = url.host_str() else {
                return invalid(key, "URL has no host");
            };
            if url.scheme() == "http" && host != "localhost" && host != "127.0.0.1" {
                return ItemCheck::new(key, Severity::Warning, "URL uses plain http");
            }
            ItemCheck::new(key, Severity::Ok, "URL format valid")
        }
        ItemFormat::Any => ItemCheck::new(key, Severity::Ok, "value set"),
    }
}

/// Error-severity check carrying the validation error text.
fn invalid(key: &str, message: impl Into<String>) -> ItemCheck {
    let err = EngineError::Validation {
        key: key.to_string(),
        message: message.into(),
    };
    ItemCheck::new(key, Severity::Error, err.to_string())
}
