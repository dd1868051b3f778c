//! Transport providers
//!
//! A transport produces connection endpoints. There are two interchangeable
//! providers behind one contract:
//!
//! - [`VirtualTransport`]: in-process rendezvous over in-memory pipes. No
//!   kernel socket is created; listeners are registered under a virtual port
//!   in a registry owned by the provider instance.
//! - [`PhysicalTransport`]: real TCP sockets on the loopback interface.
//!
//! Scenario code only sees [`Transport`], [`Listener`] and [`Endpoint`], so the
//! same test logic runs unchanged over both.
//!
//! Port 0 asks for an ephemeral port on both providers (OS-assigned for
//! physical, next free virtual port for virtual). Use
//! [`Listener::local_port`] to find out which one was picked.
//!
//! # Examples
//!
//! ```no_run
//! use vtls::net::{self, TransportKind};
//! use std::io::{Read, Write};
//! use std::time::Duration;
//!
//! let transport = net::transport(TransportKind::Virtual);
//! let listener = transport.listen(0).unwrap();
//!
//! let mut client = transport.connect(listener.local_port()).unwrap();
//! let mut server = listener.accept(Duration::from_secs(1)).unwrap();
//!
//! client.write_all(b"ping").unwrap();
//! let mut buf = [0u8; 4];
//! server.read_exact(&mut buf).unwrap();
//! ```

pub mod endpoint;
pub mod physical;
pub mod pipe;
pub mod virtual_net;

pub use endpoint::Endpoint;
pub use physical::PhysicalTransport;
pub use virtual_net::VirtualTransport;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Address in use: port {0}")]
    AddressInUse(u16),

    #[error("Listener closed")]
    ListenerClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Classify an I/O error raised while talking to `what`
    pub fn from_io(err: io::Error, what: impl fmt::Display) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused(what.to_string()),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout(what.to_string()),
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => Error::PeerClosed,
            _ => Error::Io(err),
        }
    }
}

/// Upper bound for a physical `connect` in blocking mode
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound for `accept`, reads and writes in test mode
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Kind of transport behind an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// In-memory pipes, no kernel networking
    Virtual,
    /// Real TCP sockets
    Physical,
}

impl TransportKind {
    /// Get kind as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Virtual => "virtual",
            TransportKind::Physical => "physical",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection endpoint provider
pub trait Transport: Send + Sync {
    /// Which provider this is
    fn kind(&self) -> TransportKind;

    /// Start listening on `port` (0 = ephemeral)
    fn listen(&self, port: u16) -> Result<Arc<dyn Listener>>;

    /// Connect to a listener, blocking for at most [`CONNECT_TIMEOUT`]
    ///
    /// The returned endpoint is in blocking mode.
    fn connect(&self, port: u16) -> Result<Endpoint>;

    /// Begin a connection without waiting for it to be established
    ///
    /// The returned endpoint is non-blocking; poll
    /// [`Endpoint::finish_connect`] until it reports `true`.
    fn start_connect(&self, port: u16) -> Result<Endpoint>;
}

/// Listening side of a transport
///
/// Shared between the workers or tasks that accept from it.
pub trait Listener: Send + Sync {
    /// Port the listener is bound to
    fn local_port(&self) -> u16;

    /// Wait for a peer for at most `timeout`
    ///
    /// The accepted endpoint is in blocking mode.
    fn accept(&self, timeout: Duration) -> Result<Endpoint>;

    /// Accept a pending peer if there is one
    ///
    /// The accepted endpoint is non-blocking.
    fn try_accept(&self) -> Result<Option<Endpoint>>;

    /// Whether a peer is waiting to be accepted
    fn is_acceptable(&self) -> bool;

    /// Stop accepting; pending peers are dropped
    fn close(&self);
}

/// Create a fresh transport provider of the given kind
pub fn transport(kind: TransportKind) -> Arc<dyn Transport> {
    match kind {
        TransportKind::Virtual => Arc::new(VirtualTransport::new()),
        TransportKind::Physical => Arc::new(PhysicalTransport::new()),
    }
}
