//! Panic hook behaviour next to a live cleanup trigger.
//!
//! Kept in its own test binary: the hook is process-wide and installs once.

mod common;

use async_trait::async_trait;
use common::StubSource;
use envshield::cleaner::{install_shutdown_hook, HostSignal, HostSignals};
use envshield::cleanup::CleanupType;
use envshield::config::TriggerConfig;
use envshield::trigger::{CleanupTrigger, TriggerEvent, TriggerListener, TriggerReason};
use envshield::vault::SecureStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Panicking {
    calls: AtomicUsize,
}

#[async_trait]
impl TriggerListener for Panicking {
    async fn on_trigger(&self, _event: &TriggerEvent) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("listener always panics");
    }
}

#[tokio::test]
async fn test_listener_panic_is_contained_and_faults_raise_once() {
    let signals = HostSignals::new();
    let store = Arc::new(SecureStore::new());
    store.store("AUTH", "sk-abc123").unwrap();
    assert!(install_shutdown_hook(
        &signals,
        Arc::clone(&store),
        vec!["ENVSHIELD_HOOK_TOKEN".to_string()],
    ));

    let trigger = CleanupTrigger::new(
        TriggerConfig::default(),
        StubSource::new(),
        signals.clone(),
    );
    let listener = Arc::new(Panicking {
        calls: AtomicUsize::new(0),
    });
    trigger.add_listener(listener.clone());
    let mut dispatched = trigger.subscribe();
    trigger.start().unwrap();

    // A panic the trigger catches is not a host fault.
    trigger.request_cleanup(CleanupType::Memory, false).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    assert!(store.contains("AUTH").unwrap(), "contained panic scrubbed the store");
    assert_eq!(dispatched.try_recv().unwrap().reason, TriggerReason::Manual);
    assert!(dispatched.try_recv().is_err());

    // An uncaught panic scrubs and is raised as a fault exactly once, even
    // though the fault dispatch itself panics in the listener again.
    let mut faults = signals.subscribe();
    for _ in 0..2 {
        assert!(std::thread::spawn(|| panic!("uncaught")).join().is_err());
    }
    assert!(store.is_empty().unwrap());
    assert!(matches!(faults.recv().await, Ok(HostSignal::Fault { .. })));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(faults.try_recv().is_err());
    let mut unhandled = 0;
    while let Ok(event) = dispatched.try_recv() {
        assert_eq!(event.reason, TriggerReason::UnhandledFault);
        unhandled += 1;
    }
    assert_eq!(unhandled, 1);
    assert_eq!(listener.calls.load(Ordering::SeqCst), 2);
}
