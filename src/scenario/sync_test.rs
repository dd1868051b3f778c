//! Synchronous scenario
//!
//! Each iteration runs one blocking server worker and one blocking client
//! worker on their own threads and joins both before the next iteration
//! starts. The listener is created once and shared by every iteration.

use super::frame::{self, FrameDecoder};
use super::tasks::{receive_step, send_step, TaskResult};
use super::{tls_configs, Failure, FailureKind, Outcome, Result, RunDescriptor, ScenarioReport};
use crate::env::{ledger, Environment};
use crate::net::{Endpoint, Listener, Transport};
use crate::tls::TlsConfig;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ScopedJoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Blocking client/server pairs, one pair per iteration
#[derive(Clone)]
pub struct SyncScenario {
    descriptor: RunDescriptor,
    transport: Option<Arc<dyn Transport>>,
}

impl SyncScenario {
    pub fn new(descriptor: RunDescriptor) -> Self {
        SyncScenario {
            descriptor,
            transport: None,
        }
    }

    /// Run over `transport` instead of a fresh provider of the descriptor's kind
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    fn transport(&self) -> Arc<dyn Transport> {
        match &self.transport {
            Some(transport) => Arc::clone(transport),
            None => self.descriptor.transport(),
        }
    }

    /// Run every iteration and report per-side outcomes
    ///
    /// Fails only if the environment is not initialized or the listener or
    /// TLS configurations cannot be created.
    pub fn run(&self) -> Result<ScenarioReport> {
        Environment::ensure_initialized()?;
        let before = ledger::sample();
        let started = Instant::now();

        let transport = self.transport();
        let outcomes = self.run_iterations(&*transport)?;

        let report = ScenarioReport {
            name: "sync",
            transport: transport.kind(),
            iterations: self.descriptor.iterations,
            repeat: 0,
            outcomes,
            elapsed: started.elapsed(),
            live_delta: ledger::sample().live_delta(&before),
        };
        if report.passed() {
            info!(transport = %report.transport, iterations = report.iterations, elapsed = ?report.elapsed, "sync scenario passed");
        } else {
            warn!("{}", report);
        }
        Ok(report)
    }

    fn run_iterations(&self, transport: &dyn Transport) -> Result<Vec<Outcome>> {
        let d = &self.descriptor;
        let listener = transport.listen(d.port)?;
        let port = listener.local_port();
        let (server_config, client_config) = tls_configs()?;
        debug!(transport = %transport.kind(), port, "sync listener ready");

        let mut outcomes = Vec::with_capacity(d.iterations * 2);
        for i in 0..d.iterations {
            let payload = frame::payload(i, d.payload_size);
            let (server, client) = thread::scope(|s| -> Result<(TaskResult, TaskResult)> {
                let server = thread::Builder::new()
                    .name(format!("sync-server-{}", i))
                    .spawn_scoped(s, || serve_connection(&*listener, &server_config, d.io_timeout))?;
                let client = thread::Builder::new()
                    .name(format!("sync-client-{}", i))
                    .spawn_scoped(s, || {
                        client_exchange(transport, port, &client_config, payload, d.io_timeout)
                    })?;
                Ok((joined(server), joined(client)))
            })?;

            if let Err(failure) = &server {
                debug!(iteration = i, %failure, "server side failed");
            }
            if let Err(failure) = &client {
                debug!(iteration = i, %failure, "client side failed");
            }
            outcomes.push(Outcome::new(format!("iteration {} server", i), server));
            outcomes.push(Outcome::new(format!("iteration {} client", i), client));
        }

        listener.close();
        Ok(outcomes)
    }
}

impl fmt::Debug for SyncScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncScenario")
            .field("descriptor", &self.descriptor)
            .field("transport", &self.transport.as_ref().map(|t| t.kind()))
            .finish()
    }
}

fn joined(handle: ScopedJoinHandle<'_, TaskResult>) -> TaskResult {
    handle
        .join()
        .unwrap_or_else(|_| Err(Failure::assertion("worker panicked")))
}

/// Accept one peer and echo one frame back
pub(crate) fn serve_connection(listener: &dyn Listener, config: &TlsConfig, io_timeout: Duration) -> TaskResult {
    let endpoint = listener.accept(io_timeout)?;
    serve_endpoint(endpoint, config, io_timeout)
}

/// Echo one frame over an accepted blocking endpoint
pub(crate) fn serve_endpoint(mut endpoint: Endpoint, config: &TlsConfig, io_timeout: Duration) -> TaskResult {
    endpoint.set_timeout(Some(io_timeout))?;
    let mut session = config.accept(endpoint)?;

    let mut decoder = FrameDecoder::new();
    let frame = receive_step(&mut session, &mut decoder)?
        .ok_or_else(|| Failure::new(FailureKind::Timeout, "no frame from client"))?;
    let mut out = frame::encode(&frame);
    send_step(&mut session, &mut out)?;
    session.close()?;
    Ok(())
}

/// Connect, send `payload` and check the echo
pub(crate) fn client_exchange(
    transport: &dyn Transport,
    port: u16,
    config: &TlsConfig,
    payload: Bytes,
    io_timeout: Duration,
) -> TaskResult {
    let mut endpoint = transport.connect(port)?;
    endpoint.set_timeout(Some(io_timeout))?;
    let mut session = config.connect(endpoint)?;

    let mut out = frame::encode(&payload);
    send_step(&mut session, &mut out)?;

    let mut decoder = FrameDecoder::new();
    let echo = receive_step(&mut session, &mut decoder)?
        .ok_or_else(|| Failure::new(FailureKind::Timeout, "no echo from server"))?;
    if echo != payload {
        return Err(Failure::assertion(format!(
            "echo mismatch: sent {} bytes, got {} bytes back",
            payload.len(),
            echo.len()
        )));
    }
    session.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{self, TransportKind};
    use crate::tls::locking::install_default_callbacks;

    #[test]
    fn test_client_exchange_refused_without_listener() {
        install_default_callbacks();
        let (_, client_config) = tls_configs().unwrap();
        let transport = net::transport(TransportKind::Virtual);

        let failure = client_exchange(
            &*transport,
            4242,
            &client_config,
            frame::payload(0, 16),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert_eq!(failure.kind, FailureKind::ConnectionRefused);
    }

    #[test]
    fn test_serve_connection_times_out_without_peer() {
        install_default_callbacks();
        let (server_config, _) = tls_configs().unwrap();
        let transport = net::transport(TransportKind::Virtual);
        let listener = transport.listen(0).unwrap();

        let failure = serve_connection(&*listener, &server_config, Duration::from_millis(50)).unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
    }
}
