//! TLS connection layer
//!
//! This module wraps transport endpoints in TLS sessions. The wrapper is the
//! same whether the endpoint underneath is a virtual pipe or a TCP socket,
//! and whether it is driven by a blocking worker or a cooperative task.
//!
//! # Architecture
//!
//! 1. [`locking`] holds the process-wide locking callback table that must be
//!    installed before any other TLS call.
//! 2. [`TlsConfig`] defines client/server settings (versions, certificate,
//!    peer verification).
//! 3. [`TlsSession`] owns one [`Endpoint`](crate::net::Endpoint) and moves
//!    through pending → established (or failed) → closed.
//!
//! # Examples
//!
//! ```no_run
//! use vtls::net::{self, TransportKind};
//! use vtls::tls::{locking, TlsConfig};
//! use std::time::Duration;
//!
//! locking::install_default_callbacks();
//!
//! let server_config = TlsConfig::server().unwrap().build().unwrap();
//! let client_config = TlsConfig::client().unwrap().build().unwrap();
//!
//! let transport = net::transport(TransportKind::Physical);
//! let listener = transport.listen(0).unwrap();
//! let port = listener.local_port();
//!
//! let server = std::thread::spawn(move || {
//!     let endpoint = listener.accept(Duration::from_secs(5)).unwrap();
//!     server_config.accept(endpoint).unwrap()
//! });
//!
//! let endpoint = transport.connect(port).unwrap();
//! let mut session = client_config.connect(endpoint).unwrap();
//! session.write_all(b"Hello").unwrap();
//! # drop(server);
//! ```

pub mod builtin_cert;
pub mod config;
pub mod info;
pub mod locking;
pub mod session;

pub use config::{ClientConfigBuilder, Role, ServerConfigBuilder, TlsConfig, TlsVersion};
pub use info::SessionInfo;
pub use session::{Handshake, SessionState, TlsSession};

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Net(#[from] crate::net::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Operation not valid in session state {0:?}")]
    InvalidState(SessionState),

    #[error("Operation would block")]
    WouldBlock,

    #[error("TLS locking callbacks are not installed")]
    NotInitialized,

    #[error("TLS locking callbacks are already installed")]
    AlreadyInstalled,
}

impl TlsError {
    /// Whether the operation should be retried once the endpoint is ready
    pub fn is_would_block(&self) -> bool {
        matches!(self, TlsError::WouldBlock)
    }
}
