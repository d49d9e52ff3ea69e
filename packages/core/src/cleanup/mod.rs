//! Cleanup execution.
//!
//! - [`operation`]: what one cleanup does and how it checks itself
//! - [`result`]: per-item outcomes and counters
//! - [`manager`]: queueing, concurrency limits, urgent path and shutdown

pub mod manager;
pub mod operation;
pub mod result;

pub use manager::{CleanupManager, CleanupStatistics};
pub use operation::{CleanupOperation, CleanupTarget, CleanupType, Priority};
pub use result::{CleanupResult, ItemOutcome, ItemResult};
