//! Freed secret memory must never still hold the secret.
//!
//! A scanning global allocator inspects every block as it is returned and
//! counts blocks that still contain the canary bytes.

use envshield::vault::{ClearMode, SecureStore, Secret};
use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const CANARY: &[u8] = b"sk-ant-REDACTED";

static ARMED: AtomicBool = AtomicBool::new(false);
static HITS: AtomicUsize = AtomicUsize::new(0);

struct ScanningAllocator;

unsafe impl GlobalAlloc for ScanningAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ARMED.load(Ordering::SeqCst) && layout.size() >= CANARY.len() {
            let block = std::slice::from_raw_parts(ptr, layout.size());
            if block.windows(CANARY.len()).any(|window| window == CANARY) {
                HITS.fetch_add(1, Ordering::SeqCst);
            }
        }
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static ALLOCATOR: ScanningAllocator = ScanningAllocator;

fn hits_during(f: impl FnOnce()) -> usize {
    HITS.store(0, Ordering::SeqCst);
    ARMED.store(true, Ordering::SeqCst);
    f();
    ARMED.store(false, Ordering::SeqCst);
    HITS.load(Ordering::SeqCst)
}

// One test function: the allocator is process-wide and the phases must not
// overlap.
#[test]
fn test_secrets_are_zeroed_before_release() {
    // The scanner itself works: an unwiped buffer is detected.
    let control = hits_during(|| {
        let copy = std::hint::black_box(CANARY.to_vec());
        drop(copy);
    });
    assert_eq!(control, 1, "allocator scan is not active");

    let store = SecureStore::new();

    // remove
    let hits = hits_during(|| {
        store.store("AUTH", CANARY).unwrap();
        {
            let view = store.get("AUTH").unwrap().unwrap();
            assert!(view.as_bytes() == CANARY);
        }
        assert!(store.remove("AUTH").unwrap());
    });
    assert_eq!(hits, 0, "remove released unwiped memory");

    // overwrite
    let hits = hits_during(|| {
        store.store("AUTH", CANARY).unwrap();
        store.store("AUTH", "sk-replacement-value").unwrap();
    });
    assert_eq!(hits, 0, "overwrite released unwiped memory");

    // clear_all, both modes
    for mode in [ClearMode::Immediate, ClearMode::Forced] {
        let hits = hits_during(|| {
            store.store("AUTH", CANARY).unwrap();
            store.store("BASE_URL", CANARY).unwrap();
            let outcome = store.clear_all(mode).unwrap();
            assert_eq!(outcome.items_cleared, 2);
        });
        assert_eq!(hits, 0, "clear_all({:?}) released unwiped memory", mode);
    }

    // owned sources are wiped on conversion
    let hits = hits_during(|| {
        let owned = String::from_utf8(CANARY.to_vec()).unwrap();
        store.store("AUTH", Secret::from(owned)).unwrap();
        let bytes = CANARY.to_vec();
        store.store("BASE_URL", Secret::from(bytes)).unwrap();
    });
    assert_eq!(hits, 0, "conversion left an unwiped source buffer");

    // close
    let hits = hits_during(|| {
        let outcome = store.close().unwrap();
        assert_eq!(outcome.items_cleared, 2);
    });
    assert_eq!(hits, 0, "close released unwiped memory");

    // drop
    let hits = hits_during(|| {
        let store = SecureStore::new();
        store.store("AUTH", CANARY).unwrap();
        drop(store);
    });
    assert_eq!(hits, 0, "dropping the store released unwiped memory");
}
