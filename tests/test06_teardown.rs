use std::sync::{Arc, Barrier};
use std::thread;

use sql_multiplex::driver::namespace;
use sql_multiplex::prelude::*;

mod common;

fn multi_registry(driver: &Arc<common::RecordingDriver>) -> Result<Registry, SqlMultiplexError> {
    Registry::with_driver(
        DatabaseTarget::host("postgres", "teardown", "db.local", "app", "svc", "pw"),
        AccessPolicy::new().with_idle_timeout_ms(0),
        common::driver_handle(driver),
    )
}

#[test]
fn destroy_empties_the_map_and_next_query_recreates() -> Result<(), SqlMultiplexError> {
    common::init_test_tracing();
    let driver = common::RecordingDriver::new();
    let registry = multi_registry(&driver)?;

    thread::scope(|s| {
        for _ in 0..3 {
            s.spawn(|| drop(registry.query()));
        }
    });
    assert_eq!(registry.node_count(), 3);
    let names: Vec<String> = registry.nodes().iter().map(|n| n.name().to_string()).collect();
    assert!(names.iter().all(|name| namespace::is_registered(name)));

    registry.destroy_all_connections();
    assert_eq!(registry.node_count(), 0);
    assert_eq!(driver.closes(), 3);
    assert!(names.iter().all(|name| !namespace::is_registered(name)));

    let query = registry.query();
    assert!(query.is_open());
    assert_eq!(registry.node_count(), 1);
    assert_eq!(driver.opens(), 4);
    Ok(())
}

/// A handle that outlives its node keeps working and closes the connection
/// when it is released.
#[test]
fn destroy_with_a_live_handle_closes_on_release() -> Result<(), SqlMultiplexError> {
    let driver = common::RecordingDriver::new();
    let registry = multi_registry(&driver)?;
    let holding = Barrier::new(2);
    let destroyed = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            let mut query = registry.query();
            holding.wait();
            destroyed.wait();
            assert!(query.is_open());
            query.exec("SELECT 1", &[]).expect("handle still usable");
        });

        holding.wait();
        registry.destroy_all_connections();
        assert_eq!(registry.node_count(), 0);
        assert_eq!(driver.closes(), 0);
        destroyed.wait();
    });

    assert_eq!(driver.closes(), 1);
    assert_eq!(driver.executes(), 1);
    Ok(())
}

#[test]
fn dropping_the_registry_closes_everything() -> Result<(), SqlMultiplexError> {
    let driver = common::RecordingDriver::new();
    let registry = multi_registry(&driver)?;
    drop(registry.query());
    thread::scope(|s| {
        s.spawn(|| drop(registry.query()));
    });
    assert_eq!(driver.opens(), 2);

    drop(registry);
    assert_eq!(driver.closes(), 2);
    Ok(())
}

#[test]
fn failed_open_is_reported_and_retried_only_on_request() -> Result<(), SqlMultiplexError> {
    let driver = common::RecordingDriver::new();
    driver.fail_open.store(true, std::sync::atomic::Ordering::SeqCst);
    let registry = multi_registry(&driver)?;

    let mut query = registry.query();
    assert!(!query.is_open());
    let err = query.exec("SELECT 1", &[]).unwrap_err();
    assert!(matches!(err, SqlMultiplexError::ConnectionError(_)));
    drop(query);

    let node = registry
        .node_for_thread(thread::current().id())
        .expect("node exists");
    assert_eq!(node.stats().open_failures, 1);
    assert!(!node.open());

    driver.fail_open.store(false, std::sync::atomic::Ordering::SeqCst);
    assert!(node.open());
    assert!(registry.query().is_open());
    assert_eq!(driver.opens(), 1);
    Ok(())
}
