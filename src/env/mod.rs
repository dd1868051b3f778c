//! Runtime environment window
//!
//! Every component of the harness may only be used between
//! [`Environment::init`] and [`EnvGuard::destroy`]. The window is reference
//! counted: the suite binary opens it once, while parallel tests each hold
//! their own guard.
//!
//! ```no_run
//! use vtls::env::{ledger, Environment};
//!
//! let env = Environment::init().unwrap();
//! // ... run scenarios ...
//! println!("{}", ledger::sample());
//! ledger::audit().unwrap();
//! env.destroy().unwrap();
//! ```

pub mod ledger;
pub mod signal;

use parking_lot::Mutex;
use tracing::debug;

/// Result type for environment operations
pub type Result<T> = std::result::Result<T, Error>;

/// Environment errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Environment is already initialized")]
    AlreadyInitialized,

    #[error("Environment is not initialized")]
    NotInitialized,

    #[error("Leaked objects: {live} still alive of {created} created")]
    Leak { live: i64, created: u64 },

    #[error("Environment initialization failed: {0}")]
    Init(String),
}

static OPEN_WINDOWS: Mutex<usize> = Mutex::new(0);

/// Process environment lifecycle
pub struct Environment;

impl Environment {
    /// Open the environment window
    ///
    /// Initializes the TLS library on first use.
    pub fn init() -> Result<EnvGuard> {
        let mut open = OPEN_WINDOWS.lock();
        if *open == 0 {
            openssl::init();
            debug!("environment initialized");
        }
        *open += 1;
        Ok(EnvGuard { closed: false })
    }

    /// Whether at least one environment window is open
    pub fn is_initialized() -> bool {
        *OPEN_WINDOWS.lock() > 0
    }

    /// Fail unless the environment window is open
    pub fn ensure_initialized() -> Result<()> {
        if Self::is_initialized() {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }
}

/// Open environment window; closes it when destroyed or dropped
#[must_use = "dropping the guard closes the environment window"]
pub struct EnvGuard {
    closed: bool,
}

impl EnvGuard {
    /// Close the window explicitly
    pub fn destroy(mut self) -> Result<()> {
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut open = OPEN_WINDOWS.lock();
        if *open == 0 {
            return Err(Error::NotInitialized);
        }
        *open -= 1;
        if *open == 0 {
            debug!("environment destroyed");
        }
        Ok(())
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
