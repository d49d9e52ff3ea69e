//! Advisory snapshot of engine state for restart continuity.
//!
//! The engine never depends on a snapshot being present: a missing or
//! unreadable file simply means starting fresh. Secret values are never part
//! of a snapshot.

use crate::cleanup::CleanupStatistics;
use crate::configuration::{ConfigurationState, StateTransition};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub state: ConfigurationState,
    pub transitions: Vec<StateTransition>,
    pub statistics: CleanupStatistics,
    pub saved_at: DateTime<Utc>,
}

impl EngineSnapshot {
    pub fn new(
        state: ConfigurationState,
        transitions: Vec<StateTransition>,
        statistics: CleanupStatistics,
    ) -> Self {
        Self {
            state,
            transitions,
            statistics,
            saved_at: Utc::now(),
        }
    }

    /// Write as pretty JSON, replacing any previous snapshot atomically.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;

        tracing::debug!(path = %path.display(), "engine snapshot saved");
        Ok(())
    }

    /// Read a snapshot. Absent or corrupt files yield `None`.
    pub fn load<P: AsRef<Path>>(path: P) -> Option<Self> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no engine snapshot");
                return None;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable engine snapshot, starting fresh");
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt engine snapshot, starting fresh");
                None
            }
        }
    }
}
