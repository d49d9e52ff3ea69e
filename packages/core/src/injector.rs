//! Process environment injection.
//!
//! # Guarantees
//!
//! - **Process scope only**: only the current process environment is touched,
//!   never user- or machine-level settings
//! - **Serialized access**: every read-modify-write happens under one
//!   process-wide lock ([`EnvGuard`]), so two operations never interleave
//! - **Exact restore**: [`EnvSnapshot`] records the value (or absence) of each
//!   variable before it is overwritten, so restoring puts back pre-existing
//!   values rather than merely unsetting
//!
//! # Example
//!
//! ```no_run
//! use envshield::injector::{self, EnvSnapshot};
//!
//! # fn main() -> envshield::Result<()> {
//! let names = vec!["ANTHROPIC_BASE_URL".to_string()];
//! let snapshot = EnvSnapshot::capture(&names);
//!
//! injector::lock().set("ANTHROPIC_BASE_URL", b"https://api.anthropic.com")?;
//!
//! // Put the previous value (or absence) back
//! snapshot.restore()?;
//! # Ok(())
//! # }
//! ```

use crate::config::is_valid_env_name;
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use std::time::Duration;
use zeroize::Zeroizing;

/// The process environment is one shared resource.
static ENV_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Exclusive access to the process environment.
pub struct EnvGuard {
    _guard: MutexGuard<'static, ()>,
}

/// Acquire exclusive access to the process environment.
pub fn lock() -> EnvGuard {
    EnvGuard {
        _guard: ENV_LOCK.lock(),
    }
}

/// [`lock`] with a bounded wait. Returns `None` if the lock stayed held.
pub fn try_lock_for(wait: Duration) -> Option<EnvGuard> {
    ENV_LOCK
        .try_lock_for(wait)
        .map(|guard| EnvGuard { _guard: guard })
}

impl EnvGuard {
    /// Current value, `None` when unset or not valid unicode.
    pub fn get(&self, name: &str) -> Option<Zeroizing<String>> {
        std::env::var_os(name)
            .and_then(|value| value.into_string().ok())
            .map(Zeroizing::new)
    }

    pub fn is_set(&self, name: &str) -> bool {
        std::env::var_os(name).is_some()
    }

    /// Write `value` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Apply`] if the name is not a valid variable name
    /// or the value is not UTF-8 or contains a NUL byte.
    pub fn set(&self, name: &str, value: &[u8]) -> Result<()> {
        if !is_valid_env_name(name) {
            return Err(EngineError::Apply {
                var: name.to_string(),
                message: "invalid environment variable name".to_string(),
            });
        }
        let value = std::str::from_utf8(value).map_err(|_| EngineError::Apply {
            var: name.to_string(),
            message: "value is not valid UTF-8".to_string(),
        })?;
        if value.contains('\0') {
            return Err(EngineError::Apply {
                var: name.to_string(),
                message: "value contains a NUL byte".to_string(),
            });
        }
        std::env::set_var(name, value);
        Ok(())
    }

    /// Unset `name`. Returns whether it was set.
    pub fn unset(&self, name: &str) -> bool {
        if !is_valid_env_name(name) {
            return false;
        }
        let was_set = self.is_set(name);
        if was_set {
            std::env::remove_var(name);
        }
        was_set
    }
}

/// Values of a set of variables captured before they were overwritten.
pub struct EnvSnapshot {
    entries: Vec<(String, Option<Zeroizing<String>>)>,
    taken_at: DateTime<Utc>,
}

impl EnvSnapshot {
    /// Record the current value (or absence) of every name.
    pub fn capture(names: &[String]) -> Self {
        let env = lock();
        Self::capture_with(&env, names)
    }

    /// Capture while the caller already holds the environment lock.
    pub fn capture_with(env: &EnvGuard, names: &[String]) -> Self {
        let entries = names
            .iter()
            .map(|name| (name.clone(), env.get(name)))
            .collect();
        Self {
            entries,
            taken_at: Utc::now(),
        }
    }

    /// Add names not yet covered, keeping the values recorded earlier.
    pub fn capture_missing(&mut self, env: &EnvGuard, names: &[String]) {
        for name in names {
            if !self.entries.iter().any(|(entry, _)| entry == name) {
                self.entries.push((name.clone(), env.get(name)));
            }
        }
    }

    /// Put every variable back the way it was. Returns the number of variables
    /// that were restored to a value.
    pub fn restore(&self) -> Result<usize> {
        let env = lock();
        self.restore_with(&env)
    }

    pub fn restore_with(&self, env: &EnvGuard) -> Result<usize> {
        let mut restored = 0;
        for (name, value) in &self.entries {
            match value {
                Some(value) => {
                    env.set(name, value.as_bytes())?;
                    restored += 1;
                }
                None => {
                    env.unset(name);
                }
            }
        }
        tracing::debug!(
            variables = self.entries.len(),
            restored,
            "environment snapshot restored"
        );
        Ok(restored)
    }

    /// Names covered by the snapshot.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Whether `name` had a value when the snapshot was taken.
    pub fn had_value(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|(entry, value)| entry == name && value.is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }
}

impl std::fmt::Debug for EnvSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvSnapshot")
            .field("names", &self.names().collect::<Vec<_>>())
            .field("taken_at", &self.taken_at)
            .finish()
    }
}
