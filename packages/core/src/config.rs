// envshield Configuration Module
//
// This module handles loading and parsing the engine configuration from envshield.yaml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Whether a configuration item holds a credential or a plain setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Secret,
    Plain,
}

/// Format predicate checked by validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemFormat {
    /// Token with a defined prefix and a minimum total length
    Token {
        prefix: String,
        #[serde(default = "default_token_min_length")]
        min_length: usize,
    },
    /// Absolute http(s) URL
    Url,
    /// Any non-empty value
    Any,
}

fn default_token_min_length() -> usize {
    4
}

/// One managed value and the environment variable it is applied to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemDefinition {
    /// Store key (e.g., "AUTH")
    pub key: String,

    /// Environment variable written on apply (e.g., "ANTHROPIC_AUTH_TOKEN")
    pub env: String,

    pub kind: ItemKind,

    #[serde(default)]
    pub required: bool,

    #[serde(default = "default_format")]
    pub format: ItemFormat,
}

fn default_format() -> ItemFormat {
    ItemFormat::Any
}

/// The wrapped third-party CLI tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Executable name or path
    #[serde(default = "default_tool_command")]
    pub command: String,

    /// Argument used by the health probe
    #[serde(default = "default_version_arg")]
    pub version_arg: String,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Also check that the configured endpoint accepts TCP connections
    #[serde(default)]
    pub probe_endpoint: bool,
}

fn default_tool_command() -> String {
    "claude".to_string()
}

fn default_version_arg() -> String {
    "--version".to_string()
}

fn default_probe_timeout_secs() -> u64 {
    10
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            command: default_tool_command(),
            version_arg: default_version_arg(),
            probe_timeout_secs: default_probe_timeout_secs(),
            probe_endpoint: false,
        }
    }
}

/// Cleanup executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// Hard bound on the final cleanup run at shutdown
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// How long to wait for a process to exit after a termination request
    #[serde(default = "default_process_wait_secs")]
    pub process_wait_secs: u64,

    #[serde(default = "default_result_retention_secs")]
    pub result_retention_secs: u64,

    #[serde(default = "default_max_retained_results")]
    pub max_retained_results: usize,

    /// Known configuration files deleted by configuration-file cleanup
    #[serde(default)]
    pub config_files: Vec<PathBuf>,

    /// Variables cleared in addition to the item variables
    #[serde(default)]
    pub extra_env_vars: Vec<String>,
}

fn default_max_concurrency() -> usize {
    3
}

fn default_operation_timeout_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_process_wait_secs() -> u64 {
    5
}

fn default_result_retention_secs() -> u64 {
    3600
}

fn default_max_retained_results() -> usize {
    256
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            operation_timeout_secs: default_operation_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            process_wait_secs: default_process_wait_secs(),
            result_retention_secs: default_result_retention_secs(),
            max_retained_results: default_max_retained_results(),
            config_files: Vec::new(),
            extra_env_vars: Vec::new(),
        }
    }
}

impl CleanupConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn process_wait(&self) -> Duration {
        Duration::from_secs(self.process_wait_secs)
    }

    pub fn result_retention(&self) -> Duration {
        Duration::from_secs(self.result_retention_secs)
    }
}

/// Trigger aggregator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Upper bound applied to per-process inactivity timeouts
    #[serde(default = "default_max_process_timeout_minutes")]
    pub max_process_timeout_minutes: u64,

    /// Recurring low-priority memory cleanup; disabled when absent
    #[serde(default)]
    pub schedule_interval_secs: Option<u64>,

    /// Polling interval for foreign process ids
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_process_timeout_minutes() -> u64 {
    480
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            max_process_timeout_minutes: default_max_process_timeout_minutes(),
            schedule_interval_secs: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl TriggerConfig {
    pub fn max_process_timeout(&self) -> Duration {
        Duration::from_secs(self.max_process_timeout_minutes * 60)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Health score weights and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_success_weight")]
    pub success_weight: u32,
    #[serde(default = "default_warning_weight")]
    pub warning_weight: u32,
    #[serde(default)]
    pub error_weight: u32,
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: u32,
}

fn default_success_weight() -> u32 {
    100
}

fn default_warning_weight() -> u32 {
    70
}

fn default_healthy_threshold() -> u32 {
    70
}

fn default_degraded_threshold() -> u32 {
    50
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            success_weight: default_success_weight(),
            warning_weight: default_warning_weight(),
            error_weight: 0,
            healthy_threshold: default_healthy_threshold(),
            degraded_threshold: default_degraded_threshold(),
        }
    }
}

/// Where the operational snapshot is written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl SnapshotConfig {
    /// Configured path, or `<data_dir>/envshield/state.json`.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path
            .clone()
            .or_else(|| dirs::data_dir().map(|dir| dir.join("envshield").join("state.json")))
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_items")]
    pub items: Vec<ItemDefinition>,

    #[serde(default)]
    pub tool: ToolConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,

    #[serde(default)]
    pub trigger: TriggerConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

fn default_items() -> Vec<ItemDefinition> {
    vec![
        ItemDefinition {
            key: "AUTH".to_string(),
            env: "ANTHROPIC_AUTH_TOKEN".to_string(),
            kind: ItemKind::Secret,
            required: true,
            format: ItemFormat::Token {
                prefix: "sk-".to_string(),
                min_length: default_token_min_length(),
            },
        },
        ItemDefinition {
            key: "BASE_URL".to_string(),
            env: "ANTHROPIC_BASE_URL".to_string(),
            kind: ItemKind::Plain,
            required: false,
            format: ItemFormat::Url,
        },
    ]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            items: default_items(),
            tool: ToolConfig::default(),
            cleanup: CleanupConfig::default(),
            trigger: TriggerConfig::default(),
            health: HealthConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: EngineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        Ok(config)
    }

    /// Load `path` when it exists, otherwise fall back to defaults.
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            tracing::debug!(path = ?path.as_ref(), "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.items.is_empty() {
            anyhow::bail!("At least one item must be configured");
        }

        let mut seen_keys = std::collections::HashSet::new();
        let mut seen_vars = std::collections::HashSet::new();
        for item in &self.items {
            if item.key.is_empty() {
                anyhow::bail!("Item key cannot be empty");
            }
            if !is_valid_env_name(&item.env) {
                anyhow::bail!(
                    "Invalid environment variable name '{}' for item '{}'",
                    item.env,
                    item.key
                );
            }
            if !seen_keys.insert(item.key.as_str()) {
                anyhow::bail!("Duplicate item key '{}'", item.key);
            }
            if !seen_vars.insert(item.env.as_str()) {
                anyhow::bail!("Environment variable '{}' is used by two items", item.env);
            }
        }

        for var in &self.cleanup.extra_env_vars {
            if !is_valid_env_name(var) {
                anyhow::bail!("Invalid environment variable name '{}' in extra_env_vars", var);
            }
        }

        for file in &self.cleanup.config_files {
            if !file.is_absolute() {
                anyhow::bail!("Configuration file target must be absolute: {:?}", file);
            }
        }

        if self.cleanup.max_concurrency == 0 {
            anyhow::bail!("cleanup.max_concurrency must be at least 1");
        }

        if self.tool.command.is_empty() {
            anyhow::bail!("tool.command cannot be empty");
        }

        if self.health.degraded_threshold > self.health.healthy_threshold {
            anyhow::bail!("health.degraded_threshold cannot exceed health.healthy_threshold");
        }

        Ok(())
    }

    /// Item definition for a store key.
    pub fn item(&self, key: &str) -> Option<&ItemDefinition> {
        self.items.iter().find(|item| item.key == key)
    }

    /// Every variable name the engine may have written.
    pub fn known_env_vars(&self) -> Vec<String> {
        let mut vars: Vec<String> = self.items.iter().map(|item| item.env.clone()).collect();
        for extra in &self.cleanup.extra_env_vars {
            if !vars.contains(extra) {
                vars.push(extra.clone());
            }
        }
        vars
    }
}

/// POSIX-style name: non-empty, ASCII alphanumerics and underscores, not starting with a digit.
pub fn is_valid_env_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
