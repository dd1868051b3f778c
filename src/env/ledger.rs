//! Global object ledger
//!
//! Every object that takes part in a test run (transport endpoints, TLS
//! sessions, exchange buffers, scheduler task frames) carries a [`Tracked`]
//! token. Creating the token bumps the live and created counters; dropping it
//! decrements the live counter. The leak auditor samples the ledger once all
//! scenarios are finished and requires the live count to be zero.
//!
//! Counting is compiled in with the `object-counters` feature (on by default).
//! Without it the tokens are zero-cost and both counters stay at zero.

use super::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

static OBJECTS_COUNT: AtomicI64 = AtomicI64::new(0);
static OBJECTS_CREATED: AtomicU64 = AtomicU64::new(0);

/// Point-in-time view of the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Objects currently alive
    pub live: i64,
    /// Objects created since process start
    pub created: u64,
}

impl Sample {
    /// Difference in live objects between an earlier sample and this one
    pub fn live_delta(&self, earlier: &Sample) -> i64 {
        self.live - earlier.live
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "objectsCount = {}\nobjectsCreated = {}", self.live, self.created)
    }
}

/// Read the ledger counters
pub fn sample() -> Sample {
    Sample {
        live: OBJECTS_COUNT.load(Ordering::Acquire),
        created: OBJECTS_CREATED.load(Ordering::Acquire),
    }
}

/// Sample the ledger and fail if any tracked object is still alive
pub fn audit() -> Result<Sample> {
    let s = sample();
    if s.live != 0 {
        return Err(Error::Leak {
            live: s.live,
            created: s.created,
        });
    }
    Ok(s)
}

/// Ledger membership token
///
/// Embed one in every struct that should be accounted for. The token is not
/// `Clone`: a cloned owner must create its own token.
pub struct Tracked {
    kind: &'static str,
}

impl Tracked {
    /// Register a new live object of the given kind
    pub fn new(kind: &'static str) -> Self {
        if cfg!(feature = "object-counters") {
            OBJECTS_COUNT.fetch_add(1, Ordering::AcqRel);
            OBJECTS_CREATED.fetch_add(1, Ordering::AcqRel);
        }
        Tracked { kind }
    }

    /// Object kind this token was created for
    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        if cfg!(feature = "object-counters") {
            OBJECTS_COUNT.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for Tracked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Tracked").field(&self.kind).finish()
    }
}
