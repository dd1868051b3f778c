//! Custom locking callback table
//!
//! Installation is process-wide and one-shot, so this binary holds a single
//! test that installs a counting table before any TLS call.

use std::sync::atomic::{AtomicUsize, Ordering};
use vtls::env::Environment;
use vtls::scenario::{AsyncScenario, RunDescriptor, SyncScenario};
use vtls::tls::locking::{
    self, DefaultCallbacks, LockMode, LockingCallbacks, LOCK_SLOTS, SLOT_X509_STORE,
};
use vtls::tls::{TlsConfig, TlsError};

static LOCKS: AtomicUsize = AtomicUsize::new(0);
static UNLOCKS: AtomicUsize = AtomicUsize::new(0);
static HIGHEST_SLOT: AtomicUsize = AtomicUsize::new(0);
static STORE_LOCKS: AtomicUsize = AtomicUsize::new(0);

/// Default table that counts every call
struct Counting {
    inner: DefaultCallbacks,
}

impl LockingCallbacks for Counting {
    fn lock(&self, slot: usize, mode: LockMode) {
        LOCKS.fetch_add(1, Ordering::SeqCst);
        HIGHEST_SLOT.fetch_max(slot, Ordering::SeqCst);
        if slot == SLOT_X509_STORE {
            STORE_LOCKS.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.lock(slot, mode);
    }

    unsafe fn unlock(&self, slot: usize, mode: LockMode) {
        UNLOCKS.fetch_add(1, Ordering::SeqCst);
        unsafe { self.inner.unlock(slot, mode) }
    }

    fn context_id(&self) -> u64 {
        self.inner.context_id()
    }
}

#[test]
fn test_custom_table_guards_every_run() {
    // Nothing works before a table is installed.
    assert!(matches!(locking::installed(), Err(TlsError::NotInitialized)));
    assert!(matches!(TlsConfig::client(), Err(TlsError::NotInitialized)));

    locking::install(Box::new(Counting {
        inner: DefaultCallbacks::new(),
    }))
    .unwrap();
    assert!(matches!(
        locking::install(Box::new(DefaultCallbacks::new())),
        Err(TlsError::AlreadyInstalled)
    ));

    // The default installer keeps the custom table.
    let table = locking::install_default_callbacks();
    let before = LOCKS.load(Ordering::SeqCst);
    drop(locking::acquire(table, 0, LockMode::Read));
    assert_eq!(LOCKS.load(Ordering::SeqCst), before + 1);

    let env = Environment::init().unwrap();
    let sync = SyncScenario::new(RunDescriptor::virtual_net(5)).run().unwrap();
    let coop = AsyncScenario::new(RunDescriptor::virtual_net(5)).run().unwrap();
    assert!(sync.passed(), "{}", sync);
    assert!(coop.passed(), "{}", coop);

    // Loading the trust store for peer verification takes the store slot.
    let store_locks = STORE_LOCKS.load(Ordering::SeqCst);
    let verifying = TlsConfig::client().unwrap().verify_peer(true).unwrap().build().unwrap();
    assert!(verifying.verifies_peer());
    assert_eq!(STORE_LOCKS.load(Ordering::SeqCst), store_locks + 1);
    env.destroy().unwrap();

    assert!(LOCKS.load(Ordering::SeqCst) > before + 20);
    assert_eq!(LOCKS.load(Ordering::SeqCst), UNLOCKS.load(Ordering::SeqCst));
    assert!(HIGHEST_SLOT.load(Ordering::SeqCst) < LOCK_SLOTS);

    // Same thread, same token; another thread gets its own.
    let here = table.context_id();
    assert_eq!(here, table.context_id());
    let there = std::thread::spawn(|| locking::installed().unwrap().context_id())
        .join()
        .unwrap();
    assert_ne!(here, there);
}
