//! Locking callback table
//!
//! The TLS library touches shared internal state (context reference counts,
//! the session cache, certificate stores) from whichever thread calls into
//! it. Callers must provide mutual exclusion: one lock per internal slot,
//! taken and released by index, plus an identifier for the calling context.
//!
//! The table is a strategy object installed once per process. Every TLS
//! entry point fetches it through [`installed`], which fails with
//! [`TlsError::NotInitialized`] until [`install_default_callbacks`] (or
//! [`install`]) has run.
//!
//! Slots are only held around calls that do not block on the peer, so a
//! handshake waiting for network input never holds a slot.

use super::{Result, TlsError};
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing::debug;

/// Number of protected slots, fixed by the TLS library
pub const LOCK_SLOTS: usize = 41;

/// Certificate parsing and reference counts
pub const SLOT_X509: usize = 3;
/// Certificate store
pub const SLOT_X509_STORE: usize = 11;
/// Context construction and reference counts
pub const SLOT_SSL_CTX: usize = 12;
/// Session cache
pub const SLOT_SSL_SESSION: usize = 14;
/// Per-connection object creation
pub const SLOT_SSL: usize = 16;

/// Access mode requested for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// Mutual-exclusion strategy handed to the TLS layer
pub trait LockingCallbacks: Send + Sync {
    /// Acquire `slot` in `mode`, blocking until available
    fn lock(&self, slot: usize, mode: LockMode);

    /// Release `slot` previously acquired in `mode`
    ///
    /// # Safety
    ///
    /// The calling context must currently hold `slot` in `mode`.
    unsafe fn unlock(&self, slot: usize, mode: LockMode);

    /// Token unique to the calling execution context
    fn context_id(&self) -> u64;
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CONTEXT_ID: Cell<u64> = const { Cell::new(0) };
}

/// Unique token for the current thread, assigned on first use
pub fn current_context_id() -> u64 {
    CONTEXT_ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}

/// Default table: one reader-writer lock per slot
pub struct DefaultCallbacks {
    slots: Box<[RawRwLock]>,
}

impl DefaultCallbacks {
    /// Allocate [`LOCK_SLOTS`] locks
    pub fn new() -> Self {
        let slots = (0..LOCK_SLOTS).map(|_| RawRwLock::INIT).collect();
        DefaultCallbacks { slots }
    }

    fn slot(&self, slot: usize) -> &RawRwLock {
        // Out-of-range indices share the last slot rather than panicking
        // inside a library callback.
        &self.slots[slot.min(self.slots.len() - 1)]
    }
}

impl Default for DefaultCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl LockingCallbacks for DefaultCallbacks {
    fn lock(&self, slot: usize, mode: LockMode) {
        match mode {
            LockMode::Read => self.slot(slot).lock_shared(),
            LockMode::Write => self.slot(slot).lock_exclusive(),
        }
    }

    unsafe fn unlock(&self, slot: usize, mode: LockMode) {
        // SAFETY: forwarded from the caller's contract.
        unsafe {
            match mode {
                LockMode::Read => self.slot(slot).unlock_shared(),
                LockMode::Write => self.slot(slot).unlock_exclusive(),
            }
        }
    }

    fn context_id(&self) -> u64 {
        current_context_id()
    }
}

/// Held slot; released on drop
pub struct SlotGuard<'a> {
    table: &'a dyn LockingCallbacks,
    slot: usize,
    mode: LockMode,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard only exists while `slot` is held in `mode`.
        unsafe { self.table.unlock(self.slot, self.mode) }
    }
}

/// Acquire `slot` on `table` for the lifetime of the returned guard
pub fn acquire(table: &dyn LockingCallbacks, slot: usize, mode: LockMode) -> SlotGuard<'_> {
    table.lock(slot, mode);
    SlotGuard { table, slot, mode }
}

static TABLE: OnceLock<Box<dyn LockingCallbacks>> = OnceLock::new();

/// Install the default table; later calls return the table already installed
pub fn install_default_callbacks() -> &'static dyn LockingCallbacks {
    TABLE
        .get_or_init(|| {
            debug!(slots = LOCK_SLOTS, "installing default TLS locking callbacks");
            Box::new(DefaultCallbacks::new())
        })
        .as_ref()
}

/// Install a custom table
///
/// Fails with [`TlsError::AlreadyInstalled`] if any table is present.
pub fn install(callbacks: Box<dyn LockingCallbacks>) -> Result<()> {
    TABLE.set(callbacks).map_err(|_| TlsError::AlreadyInstalled)
}

/// The installed table
pub fn installed() -> Result<&'static dyn LockingCallbacks> {
    TABLE.get().map(|t| t.as_ref()).ok_or(TlsError::NotInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_context_ids_are_per_thread() {
        let here = current_context_id();
        assert_eq!(here, current_context_id());

        let there = thread::spawn(current_context_id).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_readers_share_a_slot() {
        let table = DefaultCallbacks::new();
        let a = acquire(&table, SLOT_SSL_CTX, LockMode::Read);
        let b = acquire(&table, SLOT_SSL_CTX, LockMode::Read);
        drop(a);
        drop(b);
        let _w = acquire(&table, SLOT_SSL_CTX, LockMode::Write);
    }

    #[test]
    fn test_writer_excludes_others() {
        let table = Arc::new(DefaultCallbacks::new());
        let counter = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _g = acquire(table.as_ref(), SLOT_SSL_SESSION, LockMode::Write);
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn test_slots_are_independent() {
        let table = DefaultCallbacks::new();
        let _a = acquire(&table, SLOT_SSL, LockMode::Write);
        let _b = acquire(&table, SLOT_X509, LockMode::Write);
    }

    #[test]
    fn test_out_of_range_slot_is_clamped() {
        let table = DefaultCallbacks::new();
        let _g = acquire(&table, LOCK_SLOTS + 10, LockMode::Write);
    }

    #[test]
    fn test_install_default_is_idempotent() {
        let a = install_default_callbacks() as *const dyn LockingCallbacks as *const ();
        let b = install_default_callbacks() as *const dyn LockingCallbacks as *const ();
        assert_eq!(a, b);
        assert!(installed().is_ok());
        assert!(matches!(
            install(Box::new(DefaultCallbacks::new())),
            Err(TlsError::AlreadyInstalled)
        ));
    }
}
