//! Cooperative clients against a blocking server
//!
//! Each repeat builds a fresh transport, listener and [`EchoServer`], runs
//! `iterations` client tasks on a scheduler, then stops the server. Repeats
//! are independent: nothing but the environment window carries over.

use super::async_test::outcomes_from;
use super::sync_test::serve_endpoint;
use super::tasks::{ClientTask, TaskResult};
use super::{tls_configs, Outcome, Result, RunDescriptor, ScenarioReport};
use crate::env::{ledger, Environment};
use crate::net::{self, Listener};
use crate::sched::Scheduler;
use crate::tls::TlsConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long the acceptor waits before rechecking its stop flag
const ACCEPT_SLICE: Duration = Duration::from_millis(50);

/// Blocking echo server
///
/// One acceptor thread hands every accepted peer to its own handler thread.
/// [`EchoServer::shutdown`] stops accepting, joins every handler and returns
/// one outcome per connection.
pub struct EchoServer {
    port: u16,
    stop: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<Vec<Outcome>>>,
}

impl EchoServer {
    /// Start serving on `listener`
    pub fn start(listener: Arc<dyn Listener>, config: Arc<TlsConfig>, io_timeout: Duration) -> std::io::Result<Self> {
        let port = listener.local_port();
        let stop = Arc::new(AtomicBool::new(false));
        let acceptor = thread::Builder::new().name(format!("echo-acceptor-{}", port)).spawn({
            let stop = Arc::clone(&stop);
            move || accept_loop(listener, config, io_timeout, stop)
        })?;
        debug!(port, "echo server started");

        Ok(EchoServer {
            port,
            stop,
            acceptor: Some(acceptor),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting and collect per-connection outcomes
    pub fn shutdown(mut self) -> Vec<Outcome> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Vec<Outcome> {
        self.stop.store(true, Ordering::Release);
        let Some(acceptor) = self.acceptor.take() else {
            return Vec::new();
        };
        acceptor.join().unwrap_or_else(|_| {
            vec![Outcome::new(
                "echo acceptor",
                Err(super::Failure::assertion("acceptor panicked")),
            )]
        })
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn accept_loop(
    listener: Arc<dyn Listener>,
    config: Arc<TlsConfig>,
    io_timeout: Duration,
    stop: Arc<AtomicBool>,
) -> Vec<Outcome> {
    let mut handlers: Vec<(String, std::io::Result<JoinHandle<TaskResult>>)> = Vec::new();

    while !stop.load(Ordering::Acquire) {
        let endpoint = match listener.accept(ACCEPT_SLICE) {
            Ok(endpoint) => endpoint,
            Err(net::Error::Timeout(_)) => continue,
            Err(net::Error::ListenerClosed) => break,
            Err(e) => {
                warn!(port = listener.local_port(), error = %e, "echo accept failed");
                break;
            }
        };

        let label = format!("echo connection {}", handlers.len());
        let config = Arc::clone(&config);
        let handler = thread::Builder::new()
            .name(format!("echo-handler-{}", handlers.len()))
            .spawn(move || serve_endpoint(endpoint, &config, io_timeout));
        handlers.push((label, handler));
    }

    listener.close();
    handlers
        .into_iter()
        .map(|(label, handler)| {
            let result = match handler {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|_| Err(super::Failure::assertion("handler panicked"))),
                Err(e) => Err(e.into()),
            };
            Outcome::new(label, result)
        })
        .collect()
}

/// Cooperative clients against a blocking [`EchoServer`], repeated
#[derive(Debug, Clone)]
pub struct AsyncClientScenario {
    descriptor: RunDescriptor,
}

impl AsyncClientScenario {
    pub fn new(descriptor: RunDescriptor) -> Self {
        AsyncClientScenario { descriptor }
    }

    /// Run every repeat; one report per repeat
    pub fn run(&self) -> Result<Vec<ScenarioReport>> {
        Environment::ensure_initialized()?;
        (0..self.descriptor.repeats).map(|repeat| self.run_once(repeat)).collect()
    }

    fn run_once(&self, repeat: usize) -> Result<ScenarioReport> {
        let before = ledger::sample();
        let started = Instant::now();

        let outcomes = self.exchange()?;

        let report = ScenarioReport {
            name: "async-client",
            transport: self.descriptor.transport,
            iterations: self.descriptor.iterations,
            repeat,
            outcomes,
            elapsed: started.elapsed(),
            live_delta: ledger::sample().live_delta(&before),
        };
        if report.passed() {
            info!(transport = %report.transport, repeat, elapsed = ?report.elapsed, "async-client repeat passed");
        } else {
            warn!("{}", report);
        }
        Ok(report)
    }

    fn exchange(&self) -> Result<Vec<Outcome>> {
        let d = &self.descriptor;
        let transport = d.transport();
        let listener = transport.listen(d.port)?;
        let port = listener.local_port();
        let (server_config, client_config) = tls_configs()?;
        let client_config = Arc::new(client_config);

        let server = EchoServer::start(listener, Arc::new(server_config), d.io_timeout)?;

        let mut scheduler: Scheduler<TaskResult> = Scheduler::new(d.workers);
        for i in 0..d.iterations {
            scheduler.spawn(Box::new(ClientTask::new(
                format!("client {}", i),
                Arc::clone(&transport),
                port,
                Arc::clone(&client_config),
                super::frame::payload(i, d.payload_size),
            )));
        }
        let summary = scheduler.run(d.deadline);

        let mut outcomes = outcomes_from(summary);
        outcomes.extend(server.shutdown());
        Ok(outcomes)
    }
}
