//! Connection pool behavior across a scripted fleet.

use arrayguard::remote::pool::{ConnectionPool, ConnectionState};

use crate::helpers::*;

#[tokio::test]
async fn test_batch_execute_partial_failure() {
    let fleet = FakeFleet::new();
    fleet.host("h1").rule("uptime", 0, "up 4 days\n");
    fleet.host("h2").set_unreachable(true);
    fleet.host("h3").rule("uptime", 0, "up 9 days\n");

    let pool = ConnectionPool::new(pool_config(), Box::new(fleet));
    for id in ["h1", "h2", "h3"] {
        pool.add_host(host_config(id)).await;
    }

    let hosts: Vec<String> = ["h1", "h2", "h3"].iter().map(|s| s.to_string()).collect();
    let results = pool.batch_execute(&hosts, "uptime").await;

    assert!(results["h1"].is_ok());
    assert!(results["h2"].is_err());
    assert!(results["h3"].is_ok());
    assert_eq!(results["h1"].as_ref().unwrap().stdout, "up 4 days\n");
    assert_eq!(results["h3"].as_ref().unwrap().stdout, "up 9 days\n");
}

#[tokio::test]
async fn test_host_recovers_after_outage() {
    let fleet = FakeFleet::new();
    let host = fleet.host("h1");
    host.set_unreachable(true);

    let pool = ConnectionPool::new(pool_config(), Box::new(fleet));
    pool.add_host(host_config("h1")).await;

    assert!(pool.execute("h1", "uptime").await.is_err());
    assert_eq!(
        pool.connection_state("h1").await,
        Some(ConnectionState::Error)
    );

    // The host comes back; the next call reconnects without intervention.
    host.set_unreachable(false);
    assert!(pool.execute("h1", "uptime").await.is_ok());
    assert_eq!(
        pool.connection_state("h1").await,
        Some(ConnectionState::Connected)
    );
}

#[tokio::test]
async fn test_stale_session_is_replaced_on_reuse() {
    let fleet = FakeFleet::new();
    let host = fleet.host("h1");

    let pool = ConnectionPool::new(pool_config(), Box::new(fleet));
    pool.add_host(host_config("h1")).await;

    pool.execute("h1", "uptime").await.unwrap();
    assert_eq!(pool.live_connection_count().await, 1);

    // The session dies; liveness probing notices and reconnects.
    host.set_unreachable(true);
    assert!(pool.execute("h1", "uptime").await.is_err());

    host.set_unreachable(false);
    assert!(pool.execute("h1", "uptime").await.is_ok());
}

#[tokio::test]
async fn test_idle_connections_absent_after_reaper_pass() {
    let fleet = FakeFleet::new();
    let config: arrayguard::config::PoolConfig = serde_json::from_value(serde_json::json!({
        "max_reconnect_attempts": 2,
        "reconnect_backoff_millis": 1,
        "idle_timeout_secs": 0
    }))
    .unwrap();

    let pool = ConnectionPool::new(config, Box::new(fleet));
    for id in ["h1", "h2"] {
        pool.add_host(host_config(id)).await;
    }

    pool.execute("h1", "uptime").await.unwrap();
    pool.execute("h2", "uptime").await.unwrap();
    assert_eq!(pool.live_connection_count().await, 2);

    pool.reap_idle().await;
    assert_eq!(pool.live_connection_count().await, 0);

    // Reaped hosts reconnect lazily on next use.
    assert!(pool.execute("h1", "uptime").await.is_ok());
    assert_eq!(pool.live_connection_count().await, 1);
}

#[tokio::test]
async fn test_read_file_through_pool() {
    let fleet = FakeFleet::new();
    fleet.host("h1").rule("cat /etc/hostname", 0, "array-1\n");

    let pool = ConnectionPool::new(pool_config(), Box::new(fleet));
    pool.add_host(host_config("h1")).await;

    let content = pool.read_file("h1", "/etc/hostname").await.unwrap();
    assert_eq!(content, "array-1\n");
}

#[tokio::test]
async fn test_read_file_failure_is_error() {
    let fleet = FakeFleet::new();
    fleet.host("h1").rule("cat /missing", 1, "");

    let pool = ConnectionPool::new(pool_config(), Box::new(fleet));
    pool.add_host(host_config("h1")).await;

    assert!(pool.read_file("h1", "/missing").await.is_err());
}
