//! Physical transport
//!
//! Real TCP sockets on the loopback interface. Listeners are non-blocking
//! internally; a blocking `accept` polls the socket with a bound so an
//! unreachable peer can never hang the suite.

use super::{Endpoint, Error, Listener, Result, Transport, TransportKind, CONNECT_TIMEOUT};
use crate::env::ledger::Tracked;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::debug;

const LISTEN_BACKLOG: i32 = 128;

/// Poll a file descriptor for `events`
///
/// Returns true if the descriptor is ready (or in an error/hang-up state that
/// the next I/O call will report). `None` waits forever.
pub(crate) fn poll_fd(fd: RawFd, events: libc::c_short, timeout: Option<Duration>) -> io::Result<bool> {
    use libc::{poll, pollfd};

    let mut pfd = pollfd {
        fd,
        events,
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1);

    // SAFETY: `pfd` is a valid pollfd and we pass a count of exactly one.
    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(result > 0)
}

/// TCP transport provider bound to the loopback interface
pub struct PhysicalTransport {
    host: Ipv4Addr,
}

impl PhysicalTransport {
    /// Create a provider using 127.0.0.1
    pub fn new() -> Self {
        PhysicalTransport {
            host: Ipv4Addr::LOCALHOST,
        }
    }

    fn addr(&self, port: u16) -> SockAddr {
        SocketAddr::from((self.host, port)).into()
    }

    fn stream_socket() -> io::Result<Socket> {
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
    }
}

impl Default for PhysicalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for PhysicalTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Physical
    }

    fn listen(&self, port: u16) -> Result<std::sync::Arc<dyn Listener>> {
        let socket = Self::stream_socket()?;
        socket.set_reuse_address(true)?;
        socket.bind(&self.addr(port)).map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => Error::AddressInUse(port),
            _ => Error::Io(e),
        })?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;

        let listener: TcpListener = socket.into();
        let port = listener.local_addr()?.port();
        debug!(port, "tcp listener bound");

        Ok(std::sync::Arc::new(PhysicalListener {
            inner: Mutex::new(Some(listener)),
            port,
            _tracked: Tracked::new("listener"),
        }))
    }

    fn connect(&self, port: u16) -> Result<Endpoint> {
        let socket = Self::stream_socket()?;
        socket
            .connect_timeout(&self.addr(port), CONNECT_TIMEOUT)
            .map_err(|e| Error::from_io(e, format!("tcp port {}", port)))?;
        socket.set_nodelay(true)?;
        Ok(Endpoint::from_tcp(socket.into(), false))
    }

    fn start_connect(&self, port: u16) -> Result<Endpoint> {
        let socket = Self::stream_socket()?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        match socket.connect(&self.addr(port)) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(Error::from_io(e, format!("tcp port {}", port))),
        }
        Ok(Endpoint::connecting_tcp(socket.into()))
    }
}

/// Listening TCP socket
pub struct PhysicalListener {
    inner: Mutex<Option<TcpListener>>,
    port: u16,
    _tracked: Tracked,
}

impl PhysicalListener {
    fn handle(&self) -> Result<TcpListener> {
        let guard = self.inner.lock();
        let listener = guard.as_ref().ok_or(Error::ListenerClosed)?;
        Ok(listener.try_clone()?)
    }

    fn accepted(stream: TcpStream, nonblocking: bool) -> Result<Endpoint> {
        stream.set_nonblocking(nonblocking)?;
        stream.set_nodelay(true)?;
        Ok(Endpoint::from_tcp(stream, nonblocking))
    }
}

impl Listener for PhysicalListener {
    fn local_port(&self) -> u16 {
        self.port
    }

    fn accept(&self, timeout: Duration) -> Result<Endpoint> {
        let listener = self.handle()?;
        let deadline = Instant::now() + timeout;
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(port = self.port, %peer, "tcp connection accepted");
                    return Self::accepted(stream, false);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero()
                        || !poll_fd(listener.as_raw_fd(), libc::POLLIN, Some(remaining))?
                    {
                        return Err(Error::Timeout(format!("accept on tcp port {}", self.port)));
                    }
                    if self.inner.lock().is_none() {
                        return Err(Error::ListenerClosed);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn try_accept(&self) -> Result<Option<Endpoint>> {
        let guard = self.inner.lock();
        let listener = guard.as_ref().ok_or(Error::ListenerClosed)?;
        match listener.accept() {
            Ok((stream, _)) => Ok(Some(Self::accepted(stream, true)?)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn is_acceptable(&self) -> bool {
        match self.inner.lock().as_ref() {
            Some(listener) => {
                poll_fd(listener.as_raw_fd(), libc::POLLIN, Some(Duration::ZERO)).unwrap_or(true)
            }
            None => true,
        }
    }

    fn close(&self) {
        if self.inner.lock().take().is_some() {
            debug!(port = self.port, "tcp listener closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_ephemeral_port_is_assigned() {
        let transport = PhysicalTransport::new();
        let listener = transport.listen(0).unwrap();
        assert_ne!(listener.local_port(), 0);
    }

    #[test]
    fn test_connect_accept_roundtrip() {
        let transport = PhysicalTransport::new();
        let listener = transport.listen(0).unwrap();

        let mut client = transport.connect(listener.local_port()).unwrap();
        let mut server = listener.accept(Duration::from_secs(2)).unwrap();
        assert_eq!(server.kind(), TransportKind::Physical);

        client.write_all(b"Hello").unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"Hello");
    }

    #[test]
    fn test_connect_without_listener_is_refused() {
        let transport = PhysicalTransport::new();
        let port = {
            let listener = transport.listen(0).unwrap();
            let port = listener.local_port();
            listener.close();
            port
        };
        let err = transport.connect(port).unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused(_)));
    }

    #[test]
    fn test_accept_times_out() {
        let transport = PhysicalTransport::new();
        let listener = transport.listen(0).unwrap();
        let err = listener.accept(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_nonblocking_connect_completes() {
        let transport = PhysicalTransport::new();
        let listener = transport.listen(0).unwrap();
        let mut client = transport.start_connect(listener.local_port()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !client.finish_connect().unwrap() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }

        let server = loop {
            if let Some(server) = listener.try_accept().unwrap() {
                break server;
            }
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        };
        assert!(server.is_nonblocking());
    }

    #[test]
    fn test_closed_listener_rejects_accept() {
        let transport = PhysicalTransport::new();
        let listener = transport.listen(0).unwrap();
        listener.close();
        assert!(matches!(listener.try_accept(), Err(Error::ListenerClosed)));
        assert!(matches!(listener.accept(Duration::from_millis(10)), Err(Error::ListenerClosed)));
    }
}
