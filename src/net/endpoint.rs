//! Transport endpoint
//!
//! One side of a byte-stream connection, created by a transport on
//! `connect`/`accept`. It is owned by exactly one worker or task and closed
//! when that owner is done with it (or dropped).

use super::physical::poll_fd;
use super::pipe::PipeEnd;
use super::{Error, Result, TransportKind};
use crate::env::ledger::Tracked;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

enum Stream {
    Virtual(PipeEnd),
    Physical(TcpStream),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Open,
    Closed,
}

/// One side of a transport connection
pub struct Endpoint {
    stream: Stream,
    state: State,
    nonblocking: bool,
    _tracked: Tracked,
}

impl Endpoint {
    pub(crate) fn from_pipe(pipe: PipeEnd) -> Self {
        let nonblocking = pipe.is_nonblocking();
        Endpoint {
            stream: Stream::Virtual(pipe),
            state: State::Open,
            nonblocking,
            _tracked: Tracked::new("endpoint"),
        }
    }

    pub(crate) fn from_tcp(stream: TcpStream, nonblocking: bool) -> Self {
        Endpoint {
            stream: Stream::Physical(stream),
            state: State::Open,
            nonblocking,
            _tracked: Tracked::new("endpoint"),
        }
    }

    pub(crate) fn connecting_tcp(stream: TcpStream) -> Self {
        let mut endpoint = Self::from_tcp(stream, true);
        endpoint.state = State::Connecting;
        endpoint
    }

    /// Transport kind of this endpoint
    pub fn kind(&self) -> TransportKind {
        match self.stream {
            Stream::Virtual(_) => TransportKind::Virtual,
            Stream::Physical(_) => TransportKind::Physical,
        }
    }

    /// Whether the endpoint is connected and not yet closed
    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    /// Whether the endpoint is in non-blocking mode
    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    /// Switch between blocking and non-blocking I/O
    pub fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        match &mut self.stream {
            Stream::Virtual(pipe) => pipe.set_nonblocking(nonblocking),
            Stream::Physical(tcp) => tcp.set_nonblocking(nonblocking)?,
        }
        self.nonblocking = nonblocking;
        Ok(())
    }

    /// Bound blocking reads and writes (`None` waits forever)
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match &mut self.stream {
            Stream::Virtual(pipe) => pipe.set_timeout(timeout),
            Stream::Physical(tcp) => {
                tcp.set_read_timeout(timeout)?;
                tcp.set_write_timeout(timeout)?;
            }
        }
        Ok(())
    }

    /// Whether a read would make progress without waiting
    pub fn is_readable(&self) -> bool {
        match &self.stream {
            Stream::Virtual(pipe) => pipe.is_readable(),
            Stream::Physical(tcp) => {
                poll_fd(tcp.as_raw_fd(), libc::POLLIN, Some(Duration::ZERO)).unwrap_or(true)
            }
        }
    }

    /// Whether a write would make progress without waiting
    pub fn is_writable(&self) -> bool {
        match &self.stream {
            Stream::Virtual(pipe) => pipe.is_writable(),
            Stream::Physical(tcp) => {
                poll_fd(tcp.as_raw_fd(), libc::POLLOUT, Some(Duration::ZERO)).unwrap_or(true)
            }
        }
    }

    /// Complete a connection begun with `Transport::start_connect`
    ///
    /// Returns `Ok(false)` while the connection is still in progress.
    pub fn finish_connect(&mut self) -> Result<bool> {
        match self.state {
            State::Open => return Ok(true),
            State::Closed => return Err(Error::PeerClosed),
            State::Connecting => {}
        }

        let Stream::Physical(tcp) = &self.stream else {
            self.state = State::Open;
            return Ok(true);
        };

        if !poll_fd(tcp.as_raw_fd(), libc::POLLOUT, Some(Duration::ZERO))? {
            return Ok(false);
        }
        if let Some(err) = tcp.take_error()? {
            self.state = State::Closed;
            return Err(Error::from_io(err, "connect"));
        }
        self.state = State::Open;
        Ok(true)
    }

    /// Close the connection; further reads return 0 and writes fail
    pub fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }
        self.state = State::Closed;
        match &mut self.stream {
            Stream::Virtual(pipe) => pipe.close(),
            Stream::Physical(tcp) => {
                let _ = tcp.shutdown(Shutdown::Both);
            }
        }
    }
}

impl Read for Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.state {
            State::Closed => return Ok(0),
            State::Connecting => return Err(io::ErrorKind::WouldBlock.into()),
            State::Open => {}
        }
        match &mut self.stream {
            Stream::Virtual(pipe) => pipe.read(buf),
            Stream::Physical(tcp) => tcp.read(buf),
        }
    }
}

impl Write for Endpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.state {
            State::Closed => return Err(io::ErrorKind::NotConnected.into()),
            State::Connecting => return Err(io::ErrorKind::WouldBlock.into()),
            State::Open => {}
        }
        match &mut self.stream {
            Stream::Virtual(pipe) => pipe.write(buf),
            Stream::Physical(tcp) => tcp.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.stream {
            Stream::Virtual(pipe) => pipe.flush(),
            Stream::Physical(tcp) => tcp.flush(),
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("kind", &self.kind())
            .field("state", &self.state)
            .field("nonblocking", &self.nonblocking)
            .finish()
    }
}
