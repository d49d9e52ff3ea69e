use super::operation::{CleanupOperation, CleanupTarget, CleanupType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Success,
    Failed { message: String },
    /// Nothing to do. A required skip still fails the operation.
    Skipped { reason: String, required: bool },
}

impl ItemOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
            required: false,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Whether this outcome makes the whole operation unsuccessful.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed { .. } | Self::Skipped { required: true, .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub target: CleanupTarget,
    pub outcome: ItemOutcome,
}

/// Aggregated outcome of one [`CleanupOperation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupResult {
    pub operation_id: Uuid,
    pub kind: CleanupType,
    pub reason: String,
    pub success: bool,
    /// Execution reported success but the post-check disagreed
    pub verification_failed: bool,
    /// Operation-level failure (timeout, stopped manager)
    pub error: Option<String>,
    pub items: Vec<ItemResult>,
    pub bytes_released: usize,
    pub files_deleted: usize,
    pub variables_cleared: usize,
    pub processes_terminated: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CleanupResult {
    pub(crate) fn begin(operation: &CleanupOperation) -> Self {
        let now = Utc::now();
        Self {
            operation_id: operation.id,
            kind: operation.kind,
            reason: operation.reason.clone(),
            success: false,
            verification_failed: false,
            error: None,
            items: Vec::new(),
            bytes_released: 0,
            files_deleted: 0,
            variables_cleared: 0,
            processes_terminated: 0,
            started_at: now,
            finished_at: now,
        }
    }

    pub(crate) fn push(&mut self, target: CleanupTarget, outcome: ItemOutcome) {
        self.items.push(ItemResult { target, outcome });
    }

    pub(crate) fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    /// Settle `success` and stamp the finish time.
    pub(crate) fn finish(&mut self) {
        self.success = self.error.is_none()
            && !self.verification_failed
            && !self.items.iter().any(|item| item.outcome.is_failure());
        self.finished_at = Utc::now();
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemResult> {
        self.items.iter().filter(|item| item.outcome.is_failure())
    }

    pub fn count(&self, f: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.items.iter().filter(|item| f(&item.outcome)).count()
    }
}
