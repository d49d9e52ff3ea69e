//! Secure in-memory store for credentials.
//!
//! # Security Guarantees
//!
//! - **Memory-only**: secrets live in exact-size heap buffers owned by the store
//! - **Deterministic zeroing**: every buffer is overwritten before it is freed,
//!   whether through `remove`, `clear_all`, `close`, replacement or drop
//! - **No durable copies**: reads go through [`SecretView`], which borrows the
//!   store lock and cannot outlive its scope
//!
//! # Example
//!
//! ```
//! use envshield::vault::{ClearMode, SecureStore};
//!
//! let store = SecureStore::new();
//! store.store("AUTH", "sk-abc123").unwrap();
//! {
//!     let view = store.get("AUTH").unwrap().unwrap();
//!     assert_eq!(view.as_bytes(), b"sk-abc123");
//! }
//! let outcome = store.clear_all(ClearMode::Forced).unwrap();
//! assert_eq!(outcome.items_cleared, 1);
//! assert!(!store.contains("AUTH").unwrap());
//! ```

use crate::error::{EngineError, Result};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use zeroize::Zeroize;

/// A token or URL whose bytes are overwritten before deallocation.
pub struct Secret {
    bytes: Box<[u8]>,
}

impl Secret {
    /// Copy `bytes` into a fresh exact-size buffer.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec().into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn expose(&self) -> &[u8] {
        &self.bytes
    }

    /// Overwrite every byte in place. Length is preserved.
    fn wipe(&mut self) {
        self.bytes.as_mut().zeroize();
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::from_slice(value.as_bytes())
    }
}

impl From<&[u8]> for Secret {
    fn from(value: &[u8]) -> Self {
        Self::from_slice(value)
    }
}

/// Takes ownership of the string and zeroes it after copying.
impl From<String> for Secret {
    fn from(mut value: String) -> Self {
        let secret = Self::from_slice(value.as_bytes());
        value.zeroize();
        secret
    }
}

impl From<Vec<u8>> for Secret {
    fn from(mut value: Vec<u8>) -> Self {
        let secret = Self::from_slice(&value);
        value.zeroize();
        secret
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret([REDACTED, {} bytes])", self.bytes.len())
    }
}

/// Read-only view of a stored secret.
///
/// Holds the store lock while alive: keep it in a tight scope and never call
/// back into the same store while holding it.
pub struct SecretView<'a> {
    guard: MappedMutexGuard<'a, Secret>,
}

impl SecretView<'_> {
    pub fn as_bytes(&self) -> &[u8] {
        self.guard.expose()
    }

    /// UTF-8 view, `None` if the secret is not valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.guard.expose()).ok()
    }

    pub fn len(&self) -> usize {
        self.guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }
}

impl std::fmt::Debug for SecretView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretView([REDACTED, {} bytes])", self.guard.len())
    }
}

/// How aggressively `clear_all` releases memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearMode {
    /// Zero and drop every entry, keep the table allocation
    Immediate,
    /// Also zero the keys and free the table allocation
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearOutcome {
    pub items_cleared: usize,
    pub bytes_released: usize,
    pub mode: ClearMode,
}

/// Audit notifications raised by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    MemoryCleared {
        items: usize,
        bytes: usize,
        mode: ClearMode,
    },
}

/// Thread-safe map from key to [`Secret`].
///
/// A single mutex guards the whole map, so readers never observe a partially
/// written secret. Once [`SecureStore::close`] has run every operation returns
/// [`EngineError::StoreClosed`].
pub struct SecureStore {
    entries: Mutex<Option<HashMap<String, Secret>>>,
    events: broadcast::Sender<StoreEvent>,
}

impl SecureStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            entries: Mutex::new(Some(HashMap::new())),
            events,
        }
    }

    /// Store a secret, zeroing whatever was previously held under `key`.
    pub fn store(&self, key: impl Into<String>, secret: impl Into<Secret>) -> Result<()> {
        let secret = secret.into();
        let mut guard = self.entries.lock();
        let entries = guard.as_mut().ok_or(EngineError::StoreClosed)?;
        if let Some(mut previous) = entries.insert(key.into(), secret) {
            previous.wipe();
        }
        Ok(())
    }

    /// Borrow a secret for reading.
    pub fn get(&self, key: &str) -> Result<Option<SecretView<'_>>> {
        let guard = self.entries.lock();
        if guard.is_none() {
            return Err(EngineError::StoreClosed);
        }
        let view = MutexGuard::try_map(guard, |entries| {
            entries.as_mut().and_then(|entries| entries.get_mut(key))
        })
        .ok()
        .map(|guard| SecretView { guard });
        Ok(view)
    }

    /// Run `f` against the secret bytes without exposing a guard.
    pub fn with_secret<R>(&self, key: &str, f: impl FnOnce(&[u8]) -> R) -> Result<Option<R>> {
        Ok(self.get(key)?.map(|view| f(view.as_bytes())))
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        let guard = self.entries.lock();
        let entries = guard.as_ref().ok_or(EngineError::StoreClosed)?;
        Ok(entries.contains_key(key))
    }

    /// Zero and remove a secret. Returns whether the key was present.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut guard = self.entries.lock();
        let entries = guard.as_mut().ok_or(EngineError::StoreClosed)?;
        match entries.remove(key) {
            Some(mut secret) => {
                secret.wipe();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn len(&self) -> Result<usize> {
        let guard = self.entries.lock();
        guard
            .as_ref()
            .map(HashMap::len)
            .ok_or(EngineError::StoreClosed)
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|len| len == 0)
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        let guard = self.entries.lock();
        let entries = guard.as_ref().ok_or(EngineError::StoreClosed)?;
        Ok(entries.keys().cloned().collect())
    }

    pub fn is_closed(&self) -> bool {
        self.entries.lock().is_none()
    }

    /// Zero and drop every secret.
    pub fn clear_all(&self, mode: ClearMode) -> Result<ClearOutcome> {
        let outcome = {
            let mut guard = self.entries.lock();
            let entries = guard.as_mut().ok_or(EngineError::StoreClosed)?;
            wipe_entries(entries, mode)
        };
        self.notify_cleared(outcome);
        Ok(outcome)
    }

    /// [`clear_all`](Self::clear_all) that gives up after `wait` instead of
    /// blocking on a held lock. Returns `None` on timeout.
    ///
    /// Used from the panic hook, where the panicking thread may itself hold
    /// the store lock.
    pub fn try_clear_all(&self, mode: ClearMode, wait: Duration) -> Option<Result<ClearOutcome>> {
        let outcome = {
            let mut guard = self.entries.try_lock_for(wait)?;
            match guard.as_mut() {
                Some(entries) => wipe_entries(entries, mode),
                None => return Some(Err(EngineError::StoreClosed)),
            }
        };
        self.notify_cleared(outcome);
        Some(Ok(outcome))
    }

    /// Forced clear followed by teardown.
    pub fn close(&self) -> Result<ClearOutcome> {
        let outcome = {
            let mut guard = self.entries.lock();
            let mut entries = guard.take().ok_or(EngineError::StoreClosed)?;
            wipe_entries(&mut entries, ClearMode::Forced)
        };
        tracing::debug!(items = outcome.items_cleared, "secure store closed");
        self.notify_cleared(outcome);
        Ok(outcome)
    }

    /// Subscribe to [`StoreEvent`] notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn notify_cleared(&self, outcome: ClearOutcome) {
        tracing::debug!(
            items = outcome.items_cleared,
            bytes = outcome.bytes_released,
            mode = ?outcome.mode,
            "secure store cleared"
        );
        // No subscribers is not an error.
        let _ = self.events.send(StoreEvent::MemoryCleared {
            items: outcome.items_cleared,
            bytes: outcome.bytes_released,
            mode: outcome.mode,
        });
    }
}

impl Default for SecureStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SecureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.entries.lock();
        match guard.as_ref() {
            Some(entries) => write!(f, "SecureStore({} entries)", entries.len()),
            None => write!(f, "SecureStore(closed)"),
        }
    }
}

fn wipe_entries(entries: &mut HashMap<String, Secret>, mode: ClearMode) -> ClearOutcome {
    let items_cleared = entries.len();
    let mut bytes_released = 0;

    for (mut key, mut secret) in entries.drain() {
        bytes_released += secret.len();
        secret.wipe();
        if mode == ClearMode::Forced {
            key.zeroize();
        }
    }

    if mode == ClearMode::Forced {
        *entries = HashMap::new();
    }

    ClearOutcome {
        items_cleared,
        bytes_released,
        mode,
    }
}
