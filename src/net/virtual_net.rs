//! Virtual transport
//!
//! Listeners register under a virtual port in a registry owned by the
//! provider. `connect` looks the port up, creates an in-memory pipe pair,
//! queues the server end on the listener's backlog and hands back the client
//! end. Nothing ever waits on the network: a connect to an unregistered port
//! fails immediately.

use super::pipe;
use super::{Endpoint, Error, Listener, Result, Transport, TransportKind};
use crate::env::ledger::Tracked;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// First port handed out for ephemeral virtual listeners
const FIRST_EPHEMERAL_PORT: u16 = 49152;

struct Backlog {
    state: Mutex<BacklogState>,
    arrived: Condvar,
}

struct BacklogState {
    pending: VecDeque<pipe::PipeEnd>,
    closed: bool,
}

#[derive(Default)]
struct Registry {
    listeners: HashMap<u16, Arc<Backlog>>,
    next_ephemeral: u16,
}

impl Registry {
    fn allocate(&mut self) -> Option<u16> {
        let span = u16::MAX - FIRST_EPHEMERAL_PORT;
        for _ in 0..=span {
            let port = FIRST_EPHEMERAL_PORT + self.next_ephemeral % span;
            self.next_ephemeral = self.next_ephemeral.wrapping_add(1);
            if !self.listeners.contains_key(&port) {
                return Some(port);
            }
        }
        None
    }
}

/// In-process transport provider
///
/// Each instance has its own registry, so two providers never see each
/// other's listeners.
pub struct VirtualTransport {
    registry: Arc<Mutex<Registry>>,
    yield_points: bool,
}

impl VirtualTransport {
    /// Create a provider with an empty registry
    pub fn new() -> Self {
        VirtualTransport {
            registry: Arc::new(Mutex::new(Registry::default())),
            yield_points: false,
        }
    }

    /// Enable artificial yield points on non-blocking endpoints
    ///
    /// See [`pipe::PipeEnd::set_yield_points`].
    pub fn with_yield_points(mut self, enabled: bool) -> Self {
        self.yield_points = enabled;
        self
    }

    fn rendezvous(&self, port: u16, nonblocking: bool) -> Result<Endpoint> {
        let backlog = self
            .registry
            .lock()
            .listeners
            .get(&port)
            .cloned()
            .ok_or_else(|| Error::ConnectionRefused(format!("virtual port {}", port)))?;

        let (mut client, mut server) = pipe::pair();
        client.set_nonblocking(nonblocking);
        client.set_yield_points(self.yield_points);
        server.set_yield_points(self.yield_points);

        {
            let mut state = backlog.state.lock();
            if state.closed {
                return Err(Error::ConnectionRefused(format!("virtual port {}", port)));
            }
            state.pending.push_back(server);
        }
        backlog.arrived.notify_one();

        trace!(port, "virtual connection queued");
        Ok(Endpoint::from_pipe(client))
    }
}

impl Default for VirtualTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for VirtualTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Virtual
    }

    fn listen(&self, port: u16) -> Result<Arc<dyn Listener>> {
        let mut registry = self.registry.lock();
        let port = if port == 0 {
            registry.allocate().ok_or(Error::AddressInUse(0))?
        } else if registry.listeners.contains_key(&port) {
            return Err(Error::AddressInUse(port));
        } else {
            port
        };

        let backlog = Arc::new(Backlog {
            state: Mutex::new(BacklogState {
                pending: VecDeque::new(),
                closed: false,
            }),
            arrived: Condvar::new(),
        });
        registry.listeners.insert(port, Arc::clone(&backlog));
        debug!(port, "virtual listener registered");

        Ok(Arc::new(VirtualListener {
            port,
            backlog,
            registry: Arc::clone(&self.registry),
            _tracked: Tracked::new("listener"),
        }))
    }

    fn connect(&self, port: u16) -> Result<Endpoint> {
        self.rendezvous(port, false)
    }

    fn start_connect(&self, port: u16) -> Result<Endpoint> {
        self.rendezvous(port, true)
    }
}

/// Listener registered in a [`VirtualTransport`]
pub struct VirtualListener {
    port: u16,
    backlog: Arc<Backlog>,
    registry: Arc<Mutex<Registry>>,
    _tracked: Tracked,
}

impl Listener for VirtualListener {
    fn local_port(&self) -> u16 {
        self.port
    }

    fn accept(&self, timeout: Duration) -> Result<Endpoint> {
        let deadline = Instant::now() + timeout;
        let mut state = self.backlog.state.lock();
        loop {
            if let Some(server) = state.pending.pop_front() {
                return Ok(Endpoint::from_pipe(server));
            }
            if state.closed {
                return Err(Error::ListenerClosed);
            }
            if self.backlog.arrived.wait_until(&mut state, deadline).timed_out()
                && state.pending.is_empty()
            {
                return Err(Error::Timeout(format!("accept on virtual port {}", self.port)));
            }
        }
    }

    fn try_accept(&self) -> Result<Option<Endpoint>> {
        let mut state = self.backlog.state.lock();
        match state.pending.pop_front() {
            Some(mut server) => {
                server.set_nonblocking(true);
                Ok(Some(Endpoint::from_pipe(server)))
            }
            None if state.closed => Err(Error::ListenerClosed),
            None => Ok(None),
        }
    }

    fn is_acceptable(&self) -> bool {
        let state = self.backlog.state.lock();
        !state.pending.is_empty() || state.closed
    }

    fn close(&self) {
        let dropped = {
            let mut state = self.backlog.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.pending)
        };
        self.backlog.arrived.notify_all();

        let mut registry = self.registry.lock();
        if let Some(current) = registry.listeners.get(&self.port) {
            if Arc::ptr_eq(current, &self.backlog) {
                registry.listeners.remove(&self.port);
            }
        }
        debug!(port = self.port, dropped = dropped.len(), "virtual listener closed");
    }
}

impl Drop for VirtualListener {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;

    #[test]
    fn test_connect_accept_roundtrip() {
        let transport = VirtualTransport::new();
        let listener = transport.listen(0).unwrap();
        assert!(listener.local_port() >= FIRST_EPHEMERAL_PORT);

        let mut client = transport.connect(listener.local_port()).unwrap();
        assert!(listener.is_acceptable());
        let mut server = listener.accept(Duration::from_secs(1)).unwrap();

        client.write_all(b"Hello").unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"Hello");
    }

    #[test]
    fn test_connect_unregistered_is_refused() {
        let transport = VirtualTransport::new();
        let err = transport.connect(8443).unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused(_)));
    }

    #[test]
    fn test_registries_are_per_provider() {
        let a = VirtualTransport::new();
        let b = VirtualTransport::new();
        let listener = a.listen(8443).unwrap();
        assert!(b.connect(listener.local_port()).is_err());
        assert!(b.listen(8443).is_ok());
    }

    #[test]
    fn test_explicit_port_in_use() {
        let transport = VirtualTransport::new();
        let _listener = transport.listen(8443).unwrap();
        assert!(matches!(transport.listen(8443), Err(Error::AddressInUse(8443))));
    }

    #[test]
    fn test_ephemeral_ports_are_distinct() {
        let transport = VirtualTransport::new();
        let a = transport.listen(0).unwrap();
        let b = transport.listen(0).unwrap();
        assert_ne!(a.local_port(), b.local_port());
    }

    #[test]
    fn test_accept_times_out() {
        let transport = VirtualTransport::new();
        let listener = transport.listen(0).unwrap();
        let err = listener.accept(Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_accept_wakes_on_connect() {
        let transport = Arc::new(VirtualTransport::new());
        let listener = transport.listen(0).unwrap();
        let port = listener.local_port();

        let t = Arc::clone(&transport);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            t.connect(port).unwrap()
        });

        let server = listener.accept(Duration::from_secs(2)).unwrap();
        assert!(server.is_open());
        handle.join().unwrap();
    }

    #[test]
    fn test_close_unregisters() {
        let transport = VirtualTransport::new();
        let listener = transport.listen(0).unwrap();
        let port = listener.local_port();
        listener.close();

        assert!(transport.connect(port).is_err());
        assert!(matches!(listener.try_accept(), Err(Error::ListenerClosed)));
    }

    #[test]
    fn test_try_accept_is_nonblocking() {
        let transport = VirtualTransport::new();
        let listener = transport.listen(0).unwrap();
        assert!(listener.try_accept().unwrap().is_none());

        let _client = transport.start_connect(listener.local_port()).unwrap();
        let server = listener.try_accept().unwrap().unwrap();
        assert!(server.is_nonblocking());
    }
}
