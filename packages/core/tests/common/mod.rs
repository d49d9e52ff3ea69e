//! Common testing utilities for envshield integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use envshield::cleaner::HostSignals;
use envshield::cleanup::CleanupManager;
use envshield::config::EngineConfig;
use envshield::configuration::ConfigurationManager;
use envshield::process::{ProcessEvent, ProcessEventSource, ProcessInfo};
use envshield::trigger::{CleanupTrigger, TriggerEvent, TriggerListener};
use envshield::vault::SecureStore;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Test context that manages temporary files and directories.
pub struct TestContext {
    /// Path to temporary directory
    pub temp_path: PathBuf,
    /// The temporary directory (kept to prevent early deletion)
    _temp_dir: TempDir,
}

impl TestContext {
    /// Create a new test context with a temporary directory.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = TempDir::new()?;
        let temp_path = temp_dir.path().to_path_buf();

        Ok(Self {
            temp_path,
            _temp_dir: temp_dir,
        })
    }

    /// Create a test file with content.
    pub fn create_file(&self, name: &str, content: &str) -> anyhow::Result<PathBuf> {
        let file_path = self.temp_path.join(name);
        let mut file = fs::File::create(&file_path)?;
        file.write_all(content.as_bytes())?;
        Ok(file_path)
    }

    /// Get the path to a file in the temp directory.
    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_path.join(name)
    }

    /// Write `config` as YAML and return its path.
    pub fn write_config(&self, config: &EngineConfig) -> anyhow::Result<PathBuf> {
        let content = serde_yaml::to_string(config)?;
        self.create_file("envshield.yaml", &content)
    }
}

/// Default configuration with env names unique to `tag`, so tests that run
/// in parallel never share a variable. The tool is deliberately missing.
pub fn test_config(tag: &str) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.items[0].env = format!("ENVSHIELD_IT_{}_TOKEN", tag);
    config.items[1].env = format!("ENVSHIELD_IT_{}_URL", tag);
    config.tool.command = "envshield-missing-tool".to_string();
    config
}

/// Process event source driven entirely by the test.
#[derive(Default)]
pub struct StubSource {
    tx: Mutex<Option<broadcast::Sender<ProcessEvent>>>,
    pub watched: Mutex<HashSet<u32>>,
}

impl StubSource {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(32);
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            watched: Mutex::new(HashSet::new()),
        })
    }

    pub fn exit(&self, pid: u32, exit_code: Option<i32>) {
        let info = ProcessInfo {
            pid,
            name: "claude".to_string(),
            exit_code,
            reason: "stub".to_string(),
        };
        let event = match exit_code {
            Some(0) | None => ProcessEvent::Exited(info),
            Some(_) => ProcessEvent::Killed(info),
        };
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }
}

impl ProcessEventSource for StubSource {
    fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.tx
            .lock()
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .unwrap_or_else(|| broadcast::channel(1).1)
    }

    fn watch(&self, pid: u32, _name: &str) {
        self.watched.lock().insert(pid);
    }

    fn unwatch(&self, pid: u32) {
        self.watched.lock().remove(&pid);
    }
}

/// Listener that records every event it sees.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<TriggerEvent>>,
}

#[async_trait]
impl TriggerListener for Recorder {
    async fn on_trigger(&self, event: &TriggerEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Fully wired engine over a [`StubSource`].
pub struct Engine {
    pub config: Arc<EngineConfig>,
    pub store: Arc<SecureStore>,
    pub configuration: Arc<ConfigurationManager>,
    pub cleanup: CleanupManager,
    pub trigger: CleanupTrigger,
    pub source: Arc<StubSource>,
    pub signals: HostSignals,
    pub recorder: Arc<Recorder>,
}

impl Engine {
    /// Must be called inside a tokio runtime.
    pub fn start(config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(SecureStore::new());
        let configuration = Arc::new(ConfigurationManager::new(
            Arc::clone(&config),
            Arc::clone(&store),
        ));
        let source = StubSource::new();
        let signals = HostSignals::new();
        let trigger = CleanupTrigger::new(
            config.trigger.clone(),
            source.clone(),
            signals.clone(),
        );
        let cleanup = CleanupManager::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Some(Arc::clone(&configuration)),
        );
        let recorder = Arc::new(Recorder::default());
        trigger.add_listener(recorder.clone());
        cleanup.bind_trigger(&trigger);
        trigger.start().expect("trigger starts inside a runtime");

        Self {
            config,
            store,
            configuration,
            cleanup,
            trigger,
            source,
            signals,
            recorder,
        }
    }
}

/// Let spawned tasks on a current-thread runtime make progress.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_context_create_file() {
        let ctx = TestContext::new().unwrap();
        let file_path = ctx.create_file("test.txt", "Hello, World!").unwrap();

        assert!(file_path.exists());
        assert_eq!(fs::read_to_string(&file_path).unwrap(), "Hello, World!");
    }

    #[test]
    fn test_config_names_are_unique_per_tag() {
        let a = test_config("A");
        let b = test_config("B");
        assert_ne!(a.items[0].env, b.items[0].env);
        assert!(a.validate().is_ok());
    }

    #[test]
    fn test_stub_source_maps_exit_codes() {
        let source = StubSource::new();
        let mut rx = source.subscribe();
        source.exit(7, Some(0));
        source.exit(8, Some(137));

        tokio_test::block_on(async {
            assert!(matches!(rx.recv().await, Ok(ProcessEvent::Exited(info)) if info.pid == 7));
            assert!(matches!(rx.recv().await, Ok(ProcessEvent::Killed(info)) if info.pid == 8));
        });
    }
}
