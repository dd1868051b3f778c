//! Cooperative clients against the blocking echo server

use vtls::env::Environment;
use vtls::net::TransportKind;
use vtls::scenario::{AsyncClientScenario, RunDescriptor};
use vtls::tls::locking;

fn setup() -> vtls::env::EnvGuard {
    let guard = Environment::init().unwrap();
    locking::install_default_callbacks();
    guard
}

#[test]
fn test_virtual_repeats() {
    let _env = setup();
    let descriptor = RunDescriptor::builder().iterations(10).repeats(5).build();
    let reports = AsyncClientScenario::new(descriptor).run().unwrap();

    assert_eq!(reports.len(), 5);
    for (i, report) in reports.iter().enumerate() {
        assert!(report.passed(), "{}", report);
        assert_eq!(report.repeat, i);
        assert_eq!(report.name, "async-client");
        // Client tasks plus one echo handler per connection.
        assert_eq!(report.outcomes.len(), 20);
    }
}

#[test]
fn test_physical_repeats_reuse_the_port() {
    let _env = setup();
    // Pick a free port, then listen on it again in every repeat.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let descriptor = RunDescriptor::builder()
        .transport(TransportKind::Physical)
        .port(port)
        .iterations(5)
        .repeats(2)
        .build();
    let reports = AsyncClientScenario::new(descriptor).run().unwrap();

    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.passed()), "{:?}", reports);
    assert!(reports.iter().all(|r| r.transport == TransportKind::Physical));
}
