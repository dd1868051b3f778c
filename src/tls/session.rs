//! TLS session
//!
//! A [`TlsSession`] owns one transport endpoint and the handshake state on
//! top of it:
//!
//! ```text
//! Pending ──handshake──▶ Established ──close──▶ Closed
//!    │                        │
//!    └──error──▶ Failed ◀──I/O error
//! ```
//!
//! On a blocking endpoint `handshake_as_client`/`handshake_as_server` run the
//! whole exchange. On a non-blocking endpoint `poll_handshake` performs one
//! step and reports what it is waiting for, so a cooperative task can park
//! until the endpoint is ready.
//!
//! `read` and `write` return `Ok(0)` unless the session is established;
//! callers check [`TlsSession::state`].

use super::config::{Role, TlsConfig};
use super::info::SessionInfo;
use super::locking::{self, LockMode, SLOT_SSL, SLOT_SSL_SESSION};
use super::{Result, TlsError};
use crate::env::ledger::Tracked;
use crate::net::Endpoint;
use openssl::ssl::{ErrorCode, Ssl, SslStream};
use openssl::x509::X509VerifyResult;
use std::io;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Bound on a blocking handshake driven over a non-blocking endpoint
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Established,
    Failed,
    Closed,
}

/// Progress of one non-blocking handshake step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// The session is established
    Done,
    /// Waiting for the endpoint to become readable
    WantRead,
    /// Waiting for the endpoint to become writable
    WantWrite,
}

/// TLS record layer over a transport endpoint
pub struct TlsSession {
    stream: SslStream<Endpoint>,
    role: Role,
    state: SessionState,
    info: Option<SessionInfo>,
    _tracked: Tracked,
}

impl TlsSession {
    /// Create a pending client session
    pub fn client(config: &TlsConfig, endpoint: Endpoint) -> Result<Self> {
        if config.role != Role::Client {
            return Err(TlsError::InvalidConfig(
                "Cannot use server config for client connection".to_string(),
            ));
        }
        let mut ssl = new_ssl(config)?;

        // Set SNI servername if configured
        if let Some(ref servername) = config.servername {
            ssl.set_hostname(servername)?;
            if config.verify_peer {
                ssl.param_mut().set_host(servername)?;
            }
        }

        Self::wrap(ssl, endpoint, Role::Client)
    }

    /// Create a pending server session
    pub fn server(config: &TlsConfig, endpoint: Endpoint) -> Result<Self> {
        if config.role != Role::Server {
            return Err(TlsError::InvalidConfig(
                "Cannot use client config for server accept".to_string(),
            ));
        }
        let ssl = new_ssl(config)?;
        Self::wrap(ssl, endpoint, Role::Server)
    }

    fn wrap(ssl: Ssl, endpoint: Endpoint, role: Role) -> Result<Self> {
        Ok(TlsSession {
            stream: SslStream::new(ssl, endpoint)?,
            role,
            state: SessionState::Pending,
            info: None,
            _tracked: Tracked::new("tls-session"),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether application data may flow
    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Handshake role of this session
    pub fn role(&self) -> Role {
        self.role
    }

    /// Negotiated parameters, once established
    pub fn info(&self) -> Option<&SessionInfo> {
        self.info.as_ref()
    }

    /// Underlying endpoint
    pub fn endpoint(&self) -> &Endpoint {
        self.stream.get_ref()
    }

    /// Whether a read would make progress without waiting
    pub fn is_readable(&self) -> bool {
        self.stream.ssl().pending() > 0 || self.stream.get_ref().is_readable()
    }

    /// Whether a write would make progress without waiting
    pub fn is_writable(&self) -> bool {
        self.stream.get_ref().is_writable()
    }

    /// Run the client handshake to completion
    pub fn handshake_as_client(&mut self) -> Result<()> {
        self.expect_role(Role::Client)?;
        self.drive_handshake()
    }

    /// Run the server handshake to completion
    pub fn handshake_as_server(&mut self) -> Result<()> {
        self.expect_role(Role::Server)?;
        self.drive_handshake()
    }

    fn expect_role(&self, role: Role) -> Result<()> {
        if self.role != role {
            return Err(TlsError::InvalidConfig(format!(
                "{:?} handshake on a {:?} session",
                role, self.role
            )));
        }
        Ok(())
    }

    fn drive_handshake(&mut self) -> Result<()> {
        let deadline = Instant::now() + DEFAULT_HANDSHAKE_TIMEOUT;
        loop {
            let ready = match self.poll_handshake()? {
                Handshake::Done => return Ok(()),
                Handshake::WantRead => self.is_readable(),
                Handshake::WantWrite => self.is_writable(),
            };
            if !ready {
                if Instant::now() >= deadline {
                    self.state = SessionState::Failed;
                    return Err(TlsError::HandshakeFailed("timed out".to_string()));
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Perform one handshake step
    ///
    /// On a blocking endpoint this completes (or fails) the handshake in one
    /// call.
    pub fn poll_handshake(&mut self) -> Result<Handshake> {
        match self.state {
            SessionState::Pending => {}
            SessionState::Established => return Ok(Handshake::Done),
            state => return Err(TlsError::InvalidState(state)),
        }

        let result = match self.role {
            Role::Client => self.stream.connect(),
            Role::Server => self.stream.accept(),
        };

        match result {
            Ok(()) => {
                let info = SessionInfo::from_ssl(self.stream.ssl());
                debug!(role = ?self.role, version = %info.version, cipher = %info.cipher, "handshake complete");
                self.info = Some(info);
                self.state = SessionState::Established;
                Ok(Handshake::Done)
            }
            Err(e) if self.stream.get_ref().is_nonblocking() && e.code() == ErrorCode::WANT_READ => {
                trace!(role = ?self.role, "handshake wants read");
                Ok(Handshake::WantRead)
            }
            Err(e) if self.stream.get_ref().is_nonblocking() && e.code() == ErrorCode::WANT_WRITE => {
                trace!(role = ?self.role, "handshake wants write");
                Ok(Handshake::WantWrite)
            }
            Err(e) => {
                self.state = SessionState::Failed;
                let verify = self.stream.ssl().verify_result();
                if verify != X509VerifyResult::OK {
                    return Err(TlsError::HandshakeFailed(format!(
                        "certificate verification failed: {}",
                        verify
                    )));
                }
                Err(TlsError::HandshakeFailed(describe(&e)))
            }
        }
    }

    /// Read decrypted application data
    ///
    /// Returns `Ok(0)` when the session is not established or the peer sent
    /// close_notify, and [`TlsError::WouldBlock`] when a non-blocking
    /// endpoint has nothing to offer yet.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.state != SessionState::Established || buf.is_empty() {
            return Ok(0);
        }
        match self.stream.ssl_read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.code() == ErrorCode::ZERO_RETURN => Ok(0),
            Err(e) if e.code() == ErrorCode::SYSCALL && e.io_error().is_none() => {
                self.state = SessionState::Failed;
                Err(TlsError::PeerClosed)
            }
            Err(e) => Err(self.record_error(e)),
        }
    }

    /// Write application data, returning how much was accepted
    ///
    /// Returns `Ok(0)` when the session is not established.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.state != SessionState::Established || buf.is_empty() {
            return Ok(0);
        }
        match self.stream.ssl_write(buf) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.record_error(e)),
        }
    }

    fn record_error(&mut self, e: openssl::ssl::Error) -> TlsError {
        if matches!(e.code(), ErrorCode::WANT_READ | ErrorCode::WANT_WRITE) {
            if self.stream.get_ref().is_nonblocking() {
                return TlsError::WouldBlock;
            }
            self.state = SessionState::Failed;
            return TlsError::Io(io::Error::new(io::ErrorKind::TimedOut, "TLS record I/O timed out"));
        }

        self.state = SessionState::Failed;
        match e.into_io_error() {
            Ok(io) => match io.kind() {
                io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::UnexpectedEof => TlsError::PeerClosed,
                _ => TlsError::Io(io),
            },
            Err(e) => TlsError::Io(io::Error::new(io::ErrorKind::Other, describe(&e))),
        }
    }

    /// Write all of `buf` on a blocking session
    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.write(buf)? {
                0 => return Err(TlsError::InvalidState(self.state)),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    /// Fill `buf` completely on a blocking session
    pub fn read_exact(&mut self, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.read(buf)? {
                0 if self.is_established() => return Err(TlsError::PeerClosed),
                0 => return Err(TlsError::InvalidState(self.state)),
                n => buf = &mut buf[n..],
            }
        }
        Ok(())
    }

    /// Send close_notify (if established) and close the endpoint
    ///
    /// Idempotent. The peer's close_notify is not awaited.
    pub fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        if self.state == SessionState::Established {
            let table = locking::installed()?;
            let _slot = locking::acquire(table, SLOT_SSL_SESSION, LockMode::Write);
            let _ = self.stream.shutdown();
        }
        self.stream.get_mut().close();
        self.state = SessionState::Closed;
        Ok(())
    }
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("endpoint", self.stream.get_ref())
            .finish()
    }
}

fn new_ssl(config: &TlsConfig) -> Result<Ssl> {
    let table = locking::installed()?;
    let _slot = locking::acquire(table, SLOT_SSL, LockMode::Write);
    Ok(Ssl::new(&config.ctx)?)
}

fn describe(e: &openssl::ssl::Error) -> String {
    if let Some(io) = e.io_error() {
        return format!("{}", io);
    }
    if let Some(stack) = e.ssl_error() {
        return format!("{}", stack);
    }
    if e.code() == ErrorCode::SYSCALL {
        return "peer closed the connection".to_string();
    }
    format!("{}", e)
}
