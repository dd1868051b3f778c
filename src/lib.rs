//! vtls - TLS connection-layer test harness
//!
//! Drives many TLS client/server exchanges over two interchangeable
//! transports (in-memory virtual pipes and loopback TCP) in three execution
//! styles (blocking worker pairs, cooperative tasks, cooperative clients
//! against a blocking server), and checks that every connection-scoped
//! object is released when a run ends.
//!
//! Modules, bottom-up:
//!
//! - [`env`]: environment window, object ledger and leak audit
//! - [`net`]: virtual and physical transports
//! - [`tls`]: locking callback table, configurations and sessions
//! - [`sched`]: fixed-pool cooperative scheduler
//! - [`scenario`]: the test scenarios and their reports

pub mod env;
pub mod net;
pub mod scenario;
pub mod sched;
pub mod tls;
