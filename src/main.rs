//! Full scenario suite
//!
//! Runs every scenario over both transports, prints the object ledger and
//! exits non-zero on the first failed scenario or if any object was leaked.
//! Physical scenarios listen on `VTLS_PORT` (default 8443; 0 picks a free
//! port).

use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vtls::env::{self, ledger, signal, EnvGuard, Environment};
use vtls::scenario::{
    self, AsyncClientScenario, AsyncScenario, RunDescriptor, ScenarioReport, SyncScenario,
};
use vtls::tls::locking;

const DEFAULT_PHYSICAL_PORT: u16 = 8443;

#[derive(Debug, Clone, Copy)]
enum Family {
    Sync,
    Async,
    AsyncClient,
}

impl Family {
    fn run(self, descriptor: RunDescriptor) -> scenario::Result<Vec<ScenarioReport>> {
        match self {
            Family::Sync => Ok(vec![SyncScenario::new(descriptor).run()?]),
            Family::Async => Ok(vec![AsyncScenario::new(descriptor).run()?]),
            Family::AsyncClient => AsyncClientScenario::new(descriptor).run(),
        }
    }
}

fn main() -> ExitCode {
    // Respect RUST_LOG, default to info
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("suite aborted: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn physical_port() -> u16 {
    std::env::var("VTLS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_PHYSICAL_PORT)
}

fn suite(port: u16) -> Vec<(Family, RunDescriptor)> {
    vec![
        (Family::Sync, RunDescriptor::virtual_net(100)),
        (Family::Sync, RunDescriptor::physical(port, 10)),
        (Family::Async, RunDescriptor::virtual_net(100)),
        (Family::Async, RunDescriptor::physical(port, 10)),
        (
            Family::AsyncClient,
            RunDescriptor::builder().iterations(10).repeats(20).build(),
        ),
        (Family::AsyncClient, RunDescriptor::physical(port, 10)),
    ]
}

fn run() -> scenario::Result<bool> {
    let guard = Environment::init()?;
    locking::install_default_callbacks();
    signal::ignore_broken_pipe().map_err(|e| env::Error::Init(e.to_string()))?;

    let mut passed = true;
    for (family, descriptor) in suite(physical_port()) {
        let reports = family.run(descriptor)?;
        for report in &reports {
            println!("{}", report);
            passed &= report.passed();
        }
        if !passed {
            error!("scenario failed, skipping the rest of the suite");
            break;
        }
    }

    Ok(finish(guard)? && passed)
}

/// Print the ledger and audit it, then close the environment window
fn finish(guard: EnvGuard) -> env::Result<bool> {
    println!("{}", ledger::sample());
    let clean = match ledger::audit() {
        Ok(sample) => {
            info!(created = sample.created, "no leaked objects");
            true
        }
        Err(e) => {
            error!("{}", e);
            false
        }
    };
    guard.destroy()?;
    Ok(clean)
}
