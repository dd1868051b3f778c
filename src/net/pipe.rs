//! In-memory duplex byte pipe
//!
//! A [`PipeEnd`] is one side of a virtual connection. Each direction is a
//! bounded buffer guarded by a mutex and a condition variable, so a blocking
//! end behaves like a socket (waits for data or room) and a non-blocking end
//! reports `WouldBlock` instead of waiting.
//!
//! Reads return whatever is buffered, up to the caller's slice, and writes
//! accept only as much as fits. Short reads and short writes are normal.

use crate::env::ledger::Tracked;
use bytes::{Buf, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bytes buffered per direction before writers see back-pressure
pub const PIPE_CAPACITY: usize = 64 * 1024;

struct Channel {
    buf: BytesMut,
    writer_closed: bool,
    reader_closed: bool,
}

struct Direction {
    chan: Mutex<Channel>,
    changed: Condvar,
    _tracked: Tracked,
}

impl Direction {
    fn new() -> Arc<Self> {
        Arc::new(Direction {
            chan: Mutex::new(Channel {
                buf: BytesMut::with_capacity(4096),
                writer_closed: false,
                reader_closed: false,
            }),
            changed: Condvar::new(),
            _tracked: Tracked::new("pipe-buffer"),
        })
    }
}

/// One end of a virtual duplex connection
pub struct PipeEnd {
    rx: Arc<Direction>,
    tx: Arc<Direction>,
    nonblocking: bool,
    timeout: Option<Duration>,
    yield_points: bool,
    yielded: bool,
    closed: bool,
}

/// Create a connected pair of pipe ends
///
/// Bytes written to one end are read from the other.
pub fn pair() -> (PipeEnd, PipeEnd) {
    let a_to_b = Direction::new();
    let b_to_a = Direction::new();

    let a = PipeEnd::new(Arc::clone(&b_to_a), Arc::clone(&a_to_b));
    let b = PipeEnd::new(a_to_b, b_to_a);
    (a, b)
}

impl PipeEnd {
    fn new(rx: Arc<Direction>, tx: Arc<Direction>) -> Self {
        PipeEnd {
            rx,
            tx,
            nonblocking: false,
            timeout: None,
            yield_points: false,
            yielded: false,
            closed: false,
        }
    }

    /// Switch between blocking and non-blocking mode
    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        self.nonblocking = nonblocking;
    }

    /// Whether this end is in non-blocking mode
    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    /// Bound the wait of blocking reads and writes (`None` waits forever)
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Make every other non-blocking read report `WouldBlock` once
    ///
    /// Forces cooperative tasks through their suspension path even though
    /// the in-memory buffer is usually ready immediately.
    pub fn set_yield_points(&mut self, enabled: bool) {
        self.yield_points = enabled;
    }

    /// Whether a read would make progress without waiting
    pub fn is_readable(&self) -> bool {
        let chan = self.rx.chan.lock();
        !chan.buf.is_empty() || chan.writer_closed || chan.reader_closed
    }

    /// Whether a write would make progress without waiting
    pub fn is_writable(&self) -> bool {
        let chan = self.tx.chan.lock();
        chan.buf.len() < PIPE_CAPACITY || chan.reader_closed || chan.writer_closed
    }

    /// Close both directions of this end
    ///
    /// The peer reads EOF once it drains what was already written, and its
    /// writes fail with `BrokenPipe`.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        {
            let mut chan = self.tx.chan.lock();
            chan.writer_closed = true;
        }
        self.tx.changed.notify_all();

        {
            let mut chan = self.rx.chan.lock();
            chan.reader_closed = true;
            chan.buf.clear();
        }
        self.rx.changed.notify_all();
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| Instant::now() + t)
    }
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("virtual {} timed out", what))
}

impl Read for PipeEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.nonblocking && self.yield_points && !self.yielded {
            self.yielded = true;
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let deadline = self.deadline();
        let mut chan = self.rx.chan.lock();
        loop {
            if !chan.buf.is_empty() {
                let n = buf.len().min(chan.buf.len());
                buf[..n].copy_from_slice(&chan.buf[..n]);
                chan.buf.advance(n);
                drop(chan);
                self.rx.changed.notify_all();
                self.yielded = false;
                return Ok(n);
            }
            if chan.writer_closed || chan.reader_closed {
                return Ok(0);
            }
            if self.nonblocking {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            match deadline {
                Some(deadline) => {
                    if self.rx.changed.wait_until(&mut chan, deadline).timed_out()
                        && chan.buf.is_empty()
                        && !chan.writer_closed
                    {
                        return Err(timed_out("read"));
                    }
                }
                None => self.rx.changed.wait(&mut chan),
            }
        }
    }
}

impl Write for PipeEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let deadline = self.deadline();
        let mut chan = self.tx.chan.lock();
        loop {
            if chan.writer_closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe end closed"));
            }
            if chan.reader_closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"));
            }
            let room = PIPE_CAPACITY - chan.buf.len();
            if room > 0 {
                let n = room.min(buf.len());
                chan.buf.extend_from_slice(&buf[..n]);
                drop(chan);
                self.tx.changed.notify_all();
                return Ok(n);
            }
            if self.nonblocking {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            match deadline {
                Some(deadline) => {
                    if self.tx.changed.wait_until(&mut chan, deadline).timed_out()
                        && chan.buf.len() >= PIPE_CAPACITY
                        && !chan.reader_closed
                    {
                        return Err(timed_out("write"));
                    }
                }
                None => self.tx.changed.wait(&mut chan),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeEnd {
    fn drop(&mut self) {
        self.close();
    }
}
