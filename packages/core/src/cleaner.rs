// envshield - Host shutdown hooks
//
// This module handles the two exit paths no tokio task can observe on its own:
// - Signal handling (SIGINT, SIGTERM, SIGHUP via ctrlc "termination")
// - Panic handling
//
// Both are published on a `HostSignals` channel for the cleanup trigger. The
// panic hook additionally scrubs the store and environment synchronously,
// since the runtime may not survive long enough to run a queued cleanup.

use crate::injector;
use crate::vault::{ClearMode, SecureStore};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::broadcast;

/// Exit code used when a second signal (or an unobserved first one) forces
/// the process down.
pub const SIGNAL_EXIT_CODE: i32 = 130;

/// How long the emergency scrub waits for a lock held elsewhere.
const SCRUB_LOCK_WAIT: Duration = Duration::from_millis(500);

static HOOK: OnceLock<()> = OnceLock::new();

thread_local! {
    static CONTAINED: Cell<bool> = const { Cell::new(false) };
}

/// Run `f` with panics on this thread marked as contained: the caller
/// catches them, so the panic hook neither scrubs nor raises a fault.
pub(crate) fn contained<R>(f: impl FnOnce() -> R) -> R {
    struct Reset(bool);

    impl Drop for Reset {
        fn drop(&mut self) {
            CONTAINED.with(|flag| flag.set(self.0));
        }
    }

    let _reset = Reset(CONTAINED.with(|flag| flag.replace(true)));
    f()
}

fn panic_is_contained() -> bool {
    CONTAINED.with(Cell::get)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostSignal {
    Shutdown { signal: String },
    Fault { message: String },
}

/// Broadcast channel carrying host-level shutdown notifications.
///
/// Clones share the channel and the fault latch.
#[derive(Debug, Clone)]
pub struct HostSignals {
    tx: broadcast::Sender<HostSignal>,
    faulted: Arc<AtomicBool>,
}

impl HostSignals {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            tx,
            faulted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostSignal> {
        self.tx.subscribe()
    }

    /// Returns whether anyone was listening.
    pub fn raise_shutdown(&self, signal: &str) -> bool {
        self.tx
            .send(HostSignal::Shutdown {
                signal: signal.to_string(),
            })
            .is_ok()
    }

    /// Only the first fault is sent; later calls return `false`.
    pub fn raise_fault(&self, message: impl Into<String>) -> bool {
        if self.faulted.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.tx
            .send(HostSignal::Fault {
                message: message.into(),
            })
            .is_ok()
    }
}

impl Default for HostSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// Register the process-wide signal and panic handlers.
///
/// Only the first call installs anything; later calls return `false`.
///
/// - First Ctrl+C / SIGTERM is forwarded as [`HostSignal::Shutdown`]. If
///   nothing is subscribed, or a second signal arrives, the store and `env_vars`
///   are scrubbed and the process exits with [`SIGNAL_EXIT_CODE`].
/// - A panic scrubs immediately, is forwarded as [`HostSignal::Fault`], then
///   falls through to the previously installed hook. Panics raised by trigger
///   listeners are caught by the trigger and only reach the previous hook.
///
/// # Example
/// ```no_run
/// use envshield::cleaner::{install_shutdown_hook, HostSignals};
/// use envshield::vault::SecureStore;
/// use std::sync::Arc;
///
/// let signals = HostSignals::new();
/// let store = Arc::new(SecureStore::new());
/// install_shutdown_hook(&signals, store, vec!["ANTHROPIC_AUTH_TOKEN".to_string()]);
/// ```
pub fn install_shutdown_hook(
    signals: &HostSignals,
    store: Arc<SecureStore>,
    env_vars: Vec<String>,
) -> bool {
    if HOOK.set(()).is_err() {
        tracing::debug!("shutdown hook already installed");
        return false;
    }

    let env_vars = Arc::new(env_vars);
    let requested = Arc::new(AtomicBool::new(false));

    {
        let signals = signals.clone();
        let store = Arc::clone(&store);
        let env_vars = Arc::clone(&env_vars);
        if let Err(e) = ctrlc::set_handler(move || {
            let repeated = requested.swap(true, Ordering::SeqCst);
            if !repeated && signals.raise_shutdown("interrupt") {
                tracing::warn!("termination signal received, shutting down");
                return;
            }
            tracing::warn!(repeated, "forcing shutdown");
            emergency_scrub(&store, &env_vars);
            std::process::exit(SIGNAL_EXIT_CODE);
        }) {
            tracing::warn!(error = %e, "failed to set signal handler");
        }
    }

    let signals = signals.clone();
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        if panic_is_contained() {
            previous(panic_info);
            return;
        }
        emergency_scrub(&store, &env_vars);
        signals.raise_fault(panic_info.to_string());
        previous(panic_info);
    }));

    tracing::debug!("shutdown hook registered");
    true
}

/// Zero the store and unset `env_vars` without blocking indefinitely.
///
/// Returns the number of store entries and variables cleared.
pub fn emergency_scrub(store: &SecureStore, env_vars: &[String]) -> usize {
    let mut cleared = 0;

    match store.try_clear_all(ClearMode::Forced, SCRUB_LOCK_WAIT) {
        Some(Ok(outcome)) => cleared += outcome.items_cleared,
        Some(Err(_)) => {}
        None => eprintln!("envshield: secure store busy, could not scrub"),
    }

    match injector::try_lock_for(SCRUB_LOCK_WAIT) {
        Some(env) => {
            for name in env_vars {
                if env.unset(name) {
                    cleared += 1;
                }
            }
        }
        None => eprintln!("envshield: environment busy, could not scrub"),
    }

    cleared
}
