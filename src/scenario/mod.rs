//! Test scenarios
//!
//! Three scenario families exercise the transport and TLS layers:
//!
//! - [`SyncScenario`]: one blocking client worker and one blocking server
//!   worker per iteration, joined before the next iteration.
//! - [`AsyncScenario`]: all client and server connections as cooperative
//!   tasks on one [`Scheduler`](crate::sched::Scheduler).
//! - [`AsyncClientScenario`]: cooperative clients against a blocking echo
//!   server, repeated with fresh transports.
//!
//! Each scenario is configured by a [`RunDescriptor`] and produces a
//! [`ScenarioReport`]. A failing connection is recorded and the run goes on;
//! only setup errors (no environment, no listener) abort a run.
//!
//! # Examples
//!
//! ```no_run
//! use vtls::env::Environment;
//! use vtls::scenario::{RunDescriptor, SyncScenario};
//! use vtls::tls::locking;
//!
//! let env = Environment::init().unwrap();
//! locking::install_default_callbacks();
//!
//! let report = SyncScenario::new(RunDescriptor::virtual_net(100)).run().unwrap();
//! assert!(report.passed(), "{}", report);
//! env.destroy().unwrap();
//! ```

pub mod async_client;
pub mod frame;
pub mod sync_test;
mod tasks;

pub use async_client::{AsyncClientScenario, EchoServer};
pub use async_test::AsyncScenario;
pub use sync_test::SyncScenario;

use crate::net::{self, Transport, TransportKind, VirtualTransport, DEFAULT_IO_TIMEOUT};
use crate::sched::DEFAULT_WORKERS;
use crate::tls::{TlsConfig, TlsError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Result type for scenario setup
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that prevent a scenario from running at all
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Environment error: {0}")]
    Env(#[from] crate::env::Error),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("Transport setup failed: {0}")]
    Net(#[from] net::Error),

    #[error("Worker could not be started: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Failure classes recorded per connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    ConnectionRefused,
    Timeout,
    HandshakeFailure,
    PeerClosed,
    IoError,
    AssertionFailure,
}

/// A recorded connection failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub detail: String,
}

impl Failure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Failure {
            kind,
            detail: detail.into(),
        }
    }

    /// Test-level mismatch
    pub fn assertion(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::AssertionFailure, detail)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

fn net_failure_kind(err: &net::Error) -> FailureKind {
    match err {
        net::Error::ConnectionRefused(_) => FailureKind::ConnectionRefused,
        net::Error::Timeout(_) => FailureKind::Timeout,
        net::Error::PeerClosed | net::Error::ListenerClosed => FailureKind::PeerClosed,
        net::Error::AddressInUse(_) | net::Error::Io(_) => FailureKind::IoError,
    }
}

impl From<net::Error> for Failure {
    fn from(err: net::Error) -> Self {
        Failure::new(net_failure_kind(&err), err.to_string())
    }
}

impl From<TlsError> for Failure {
    fn from(err: TlsError) -> Self {
        let kind = match &err {
            TlsError::Net(inner) => net_failure_kind(inner),
            TlsError::HandshakeFailed(_) => FailureKind::HandshakeFailure,
            TlsError::PeerClosed => FailureKind::PeerClosed,
            TlsError::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => FailureKind::Timeout,
            _ => FailureKind::IoError,
        };
        Failure::new(kind, err.to_string())
    }
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        Failure::from(net::Error::from_io(err, "endpoint"))
    }
}

impl From<frame::FrameError> for Failure {
    fn from(err: frame::FrameError) -> Self {
        Failure::assertion(err.to_string())
    }
}

/// Scenario configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDescriptor {
    /// Transport every connection uses
    pub transport: TransportKind,
    /// Listening port; 0 picks an ephemeral one
    pub port: u16,
    /// Connection pairs per run
    pub iterations: usize,
    /// Full runs for repeated scenarios
    pub repeats: usize,
    /// Scheduler pool size for cooperative scenarios
    pub workers: usize,
    /// Echo payload bytes per connection
    pub payload_size: usize,
    /// Bound on blocking accept/read/write
    pub io_timeout: Duration,
    /// Wall-clock budget for one cooperative run
    pub deadline: Duration,
    /// Forced `WouldBlock` on alternate non-blocking virtual reads
    pub yield_points: bool,
}

impl RunDescriptor {
    /// Create a descriptor builder
    pub fn builder() -> RunDescriptorBuilder {
        RunDescriptorBuilder::new()
    }

    /// Virtual transport, ephemeral virtual port
    pub fn virtual_net(iterations: usize) -> Self {
        Self::builder().iterations(iterations).build()
    }

    /// Physical transport on `port` (0 = OS-assigned)
    pub fn physical(port: u16, iterations: usize) -> Self {
        Self::builder()
            .transport(TransportKind::Physical)
            .port(port)
            .iterations(iterations)
            .build()
    }

    /// Fresh transport provider for one run
    pub fn transport(&self) -> Arc<dyn Transport> {
        match self.transport {
            TransportKind::Virtual => {
                Arc::new(VirtualTransport::new().with_yield_points(self.yield_points))
            }
            TransportKind::Physical => net::transport(TransportKind::Physical),
        }
    }
}

impl Default for RunDescriptor {
    fn default() -> Self {
        RunDescriptor {
            transport: TransportKind::Virtual,
            port: 0,
            iterations: 1,
            repeats: 1,
            workers: DEFAULT_WORKERS,
            payload_size: 64,
            io_timeout: DEFAULT_IO_TIMEOUT,
            deadline: Duration::from_secs(120),
            yield_points: false,
        }
    }
}

/// Builder for [`RunDescriptor`]
#[derive(Debug, Clone)]
pub struct RunDescriptorBuilder {
    descriptor: RunDescriptor,
}

impl RunDescriptorBuilder {
    fn new() -> Self {
        RunDescriptorBuilder {
            descriptor: RunDescriptor::default(),
        }
    }

    pub fn transport(mut self, kind: TransportKind) -> Self {
        self.descriptor.transport = kind;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.descriptor.port = port;
        self
    }

    /// Connection pairs per run (at least one)
    pub fn iterations(mut self, iterations: usize) -> Self {
        self.descriptor.iterations = iterations.max(1);
        self
    }

    /// Full runs for repeated scenarios (at least one)
    pub fn repeats(mut self, repeats: usize) -> Self {
        self.descriptor.repeats = repeats.max(1);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.descriptor.workers = workers.max(1);
        self
    }

    pub fn payload_size(mut self, size: usize) -> Self {
        self.descriptor.payload_size = size.min(frame::MAX_PAYLOAD);
        self
    }

    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.descriptor.io_timeout = timeout;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.descriptor.deadline = deadline;
        self
    }

    /// Suspend cooperative readers on the virtual transport even when data
    /// is buffered; ignored by the physical transport
    pub fn yield_points(mut self, enabled: bool) -> Self {
        self.descriptor.yield_points = enabled;
        self
    }

    pub fn build(self) -> RunDescriptor {
        self.descriptor
    }
}

/// Terminal result of one connection (or one client/server iteration)
#[derive(Debug, Clone)]
pub struct Outcome {
    pub label: String,
    pub result: std::result::Result<(), Failure>,
}

impl Outcome {
    pub fn new(label: impl Into<String>, result: std::result::Result<(), Failure>) -> Self {
        Outcome {
            label: label.into(),
            result,
        }
    }
}

/// Result of one scenario run
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub name: &'static str,
    pub transport: TransportKind,
    pub iterations: usize,
    /// 0-based repeat index for repeated scenarios
    pub repeat: usize,
    pub outcomes: Vec<Outcome>,
    pub elapsed: Duration,
    /// Change in live ledger objects across the run
    pub live_delta: i64,
}

impl ScenarioReport {
    /// Whether every outcome succeeded
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// Failed outcomes
    pub fn failures(&self) -> impl Iterator<Item = (&str, &Failure)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|f| (o.label.as_str(), f)))
    }

    /// Number of successful outcomes
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] x{} (repeat {}): {}/{} ok in {:?}",
            self.name,
            self.transport,
            self.iterations,
            self.repeat,
            self.succeeded(),
            self.outcomes.len(),
            self.elapsed
        )?;
        for (label, failure) in self.failures() {
            write!(f, "\n  {}: {}", label, failure)?;
        }
        Ok(())
    }
}

/// Server and client configurations for one run
pub(crate) fn tls_configs() -> std::result::Result<(TlsConfig, TlsConfig), TlsError> {
    let server = TlsConfig::server()?.build()?;
    let client = TlsConfig::client()?.build()?;
    Ok((server, client))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_defaults() {
        let d = RunDescriptor::virtual_net(100);
        assert_eq!(d.transport, TransportKind::Virtual);
        assert_eq!(d.port, 0);
        assert_eq!(d.iterations, 100);
        assert_eq!(d.repeats, 1);
        assert_eq!(d.workers, DEFAULT_WORKERS);
        assert!(!d.yield_points);

        let p = RunDescriptor::physical(8443, 10);
        assert_eq!(p.transport, TransportKind::Physical);
        assert_eq!(p.port, 8443);
    }

    #[test]
    fn test_builder_clamps() {
        let d = RunDescriptor::builder()
            .iterations(0)
            .repeats(0)
            .workers(0)
            .payload_size(usize::MAX)
            .build();
        assert_eq!(d.iterations, 1);
        assert_eq!(d.repeats, 1);
        assert_eq!(d.workers, 1);
        assert_eq!(d.payload_size, frame::MAX_PAYLOAD);
    }

    #[test]
    fn test_yield_points_reach_virtual_endpoints() {
        use std::io::{ErrorKind, Read, Write};

        let d = RunDescriptor::builder().yield_points(true).build();
        let transport = d.transport();
        assert_eq!(transport.kind(), TransportKind::Virtual);
        let listener = transport.listen(0).unwrap();
        let mut client = transport.connect(listener.local_port()).unwrap();
        let mut server = listener.accept(Duration::from_secs(5)).unwrap();
        server.set_nonblocking(true).unwrap();

        client.write_all(b"ab").unwrap();
        let mut buf = [0u8; 2];
        let mut yields = 0;
        let mut got = 0;
        while got < 2 {
            match server.read(&mut buf[got..]) {
                Ok(n) => got += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => yields += 1,
                Err(e) => panic!("{}", e),
            }
            assert!(yields < 10);
        }
        assert!(yields > 0);
        assert_eq!(&buf, b"ab");
    }

    #[test]
    fn test_failure_classification() {
        let f = Failure::from(net::Error::ConnectionRefused("x".into()));
        assert_eq!(f.kind, FailureKind::ConnectionRefused);

        let f = Failure::from(TlsError::HandshakeFailed("bad".into()));
        assert_eq!(f.kind, FailureKind::HandshakeFailure);

        let f = Failure::from(TlsError::Net(net::Error::Timeout("accept".into())));
        assert_eq!(f.kind, FailureKind::Timeout);

        let f = Failure::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert_eq!(f.kind, FailureKind::PeerClosed);
    }

    #[test]
    fn test_report_summary() {
        let report = ScenarioReport {
            name: "sync",
            transport: TransportKind::Virtual,
            iterations: 2,
            repeat: 0,
            outcomes: vec![
                Outcome::new("iteration 0", Ok(())),
                Outcome::new("iteration 1", Err(Failure::assertion("payload mismatch"))),
            ],
            elapsed: Duration::from_millis(5),
            live_delta: 0,
        };
        assert!(!report.passed());
        assert_eq!(report.succeeded(), 1);

        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "iteration 1");
        assert!(report.to_string().contains("AssertionFailure: payload mismatch"));
    }
}
