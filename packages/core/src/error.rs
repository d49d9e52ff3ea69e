// envshield - Error Module
//
// One taxonomy for every failure the engine can surface. Public state-machine
// operations fold these into result objects; lower layers return them directly.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the credential lifecycle engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The secure store has been torn down.
    #[error("secure store is closed")]
    StoreClosed,

    /// A configuration key that no item definition declares.
    #[error("unknown configuration key: {0}")]
    UnknownKey(String),

    /// Malformed token or URL.
    #[error("validation failed for '{key}': {message}")]
    Validation { key: String, message: String },

    /// Writing to the process environment failed.
    #[error("failed to apply '{var}': {message}")]
    Apply { var: String, message: String },

    /// Execution claimed success but the post-check disagrees.
    #[error("verification failed for {target}: {message}")]
    Verification { target: String, message: String },

    /// A monitored process or a cleanup step exceeded its deadline.
    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    /// Health-check executable missing or unreachable.
    #[error("external probe failed: {0}")]
    ExternalProbe(String),

    #[error("cleanup trigger is not running (state: {0})")]
    TriggerNotRunning(String),

    #[error("cleanup manager has been shut down")]
    ManagerStopped,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_target() {
        let err = EngineError::Apply {
            var: "ANTHROPIC_AUTH_TOKEN".to_string(),
            message: "value contains NUL".to_string(),
        };
        assert!(err.to_string().contains("ANTHROPIC_AUTH_TOKEN"));

        let err = EngineError::Timeout {
            what: "process 42".to_string(),
            after: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("process 42"));
    }

    #[test]
    fn test_io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: EngineError = io.into();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
