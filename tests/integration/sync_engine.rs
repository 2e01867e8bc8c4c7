//! Incremental sync scenarios against a scripted fleet.

use std::sync::Arc;

use arrayguard::remote::pool::ConnectionPool;
use arrayguard::storage::memory::MemoryStore;
use arrayguard::storage::AlertStore;
use arrayguard::sync::SyncEngine;
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

use crate::helpers::*;

fn engine_for(fleet: &FakeFleet) -> (Arc<SyncEngine>, Arc<dyn AlertStore>, ConnectionPool) {
    let pool = ConnectionPool::new(pool_config(), Box::new(fleet.clone()));
    let store: Arc<dyn AlertStore> = Arc::new(MemoryStore::new());
    let (alert_tx, _) = broadcast::channel(1024);
    let engine = Arc::new(SyncEngine::new(
        pool.clone(),
        store.clone(),
        alert_tx,
        sync_config(),
    ));
    (engine, store, pool)
}

#[tokio::test]
async fn test_initial_sync_ingests_everything() {
    let fleet = FakeFleet::new();
    fleet.host("array-1").set_log(vec![
        alert_line("link_state", "eth2 link DOWN", 1000),
        alert_line("link_state", "eth2 link UP", 2000),
        alert_line("counters", "eth2.rx_errors +9", 3000),
    ]);

    let (engine, store, pool) = engine_for(&fleet);
    pool.add_host(host_config("array-1")).await;

    let report = engine.sync_host("array-1").await.unwrap();
    assert_eq!(report.new_alerts, 3);
    assert_eq!(report.position, 3);
    assert_eq!(store.count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_sync_twice_with_no_new_lines_is_idempotent() {
    let fleet = FakeFleet::new();
    fleet
        .host("array-1")
        .set_log(vec![alert_line("link_state", "eth2 link DOWN", 1000)]);

    let (engine, store, pool) = engine_for(&fleet);
    pool.add_host(host_config("array-1")).await;

    let first = engine.sync_host("array-1").await.unwrap();
    assert_eq!(first.new_alerts, 1);

    let second = engine.sync_host("array-1").await.unwrap();
    assert_eq!(second.new_alerts, 0);
    assert_eq!(second.position, 1);
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_delta_fetch_and_truncation_reset() {
    let fleet = FakeFleet::new();
    let host = fleet.host("array-1");

    // 1000 lines synced in two capped passes (500 each).
    let lines: Vec<String> = (0..1000)
        .map(|i| alert_line("counters", &format!("growth event {i}"), 1000 + i))
        .collect();
    host.set_log(lines);

    let (engine, store, pool) = engine_for(&fleet);
    pool.add_host(host_config("array-1")).await;

    let pass1 = engine.sync_host("array-1").await.unwrap();
    assert_eq!(pass1.new_alerts, 500);
    assert_eq!(pass1.position, 500);

    let pass2 = engine.sync_host("array-1").await.unwrap();
    assert_eq!(pass2.new_alerts, 500);
    assert_eq!(pass2.position, 1000);

    // Stored position 1000, remote log grows to 1050: exactly 50 new.
    host.append_log(
        (1000..1050)
            .map(|i| alert_line("counters", &format!("growth event {i}"), 1000 + i))
            .collect(),
    );

    let pass3 = engine.sync_host("array-1").await.unwrap();
    assert_eq!(pass3.new_alerts, 50);
    assert_eq!(pass3.position, 1050);
    assert_eq!(store.count().await.unwrap(), 1050);

    // Log rotated down to 200 lines (< 1050): full resync from 0.
    host.set_log(
        (0..200)
            .map(|i| alert_line("counters", &format!("fresh event {i}"), 5_000_000 + i))
            .collect(),
    );

    let pass4 = engine.sync_host("array-1").await.unwrap();
    assert!(pass4.truncated);
    assert_eq!(pass4.new_alerts, 200);
    assert_eq!(pass4.position, 200);
    assert_eq!(store.count().await.unwrap(), 1250);
}

#[tokio::test]
async fn test_malformed_lines_counted_not_fatal() {
    let fleet = FakeFleet::new();
    fleet.host("array-1").set_log(vec![
        alert_line("link_state", "eth2 link DOWN", 1000),
        "{{{{ definitely not json".to_string(),
        alert_line("link_state", "eth3 link DOWN", 2000),
    ]);

    let (engine, store, pool) = engine_for(&fleet);
    pool.add_host(host_config("array-1")).await;

    let report = engine.sync_host("array-1").await.unwrap();
    assert_eq!(report.new_alerts, 2);
    assert_eq!(report.malformed, 1);
    // Position still covers the malformed line; it is not refetched.
    assert_eq!(report.position, 3);
    assert_eq!(store.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_duplicate_content_ingested_once() {
    let fleet = FakeFleet::new();
    let line = alert_line("link_state", "eth2 link DOWN", 1000);
    fleet.host("array-1").set_log(vec![line.clone(), line]);

    let (engine, store, pool) = engine_for(&fleet);
    pool.add_host(host_config("array-1")).await;

    let report = engine.sync_host("array-1").await.unwrap();
    assert_eq!(report.new_alerts, 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_broadcast_on_new_alerts() {
    let fleet = FakeFleet::new();
    fleet.host("array-1").set_log(vec![
        alert_line("link_state", "eth2 link DOWN", 1000),
        alert_line("link_state", "eth3 link DOWN", 2000),
    ]);

    let (engine, _store, pool) = engine_for(&fleet);
    pool.add_host(host_config("array-1")).await;

    let mut rx = engine.subscribe();
    engine.sync_host("array-1").await.unwrap();

    let first = rx.recv().await.unwrap();
    assert_eq!(first.host_id, "array-1");
    assert_eq!(first.envelope.message, "eth2 link DOWN");

    let second = rx.recv().await.unwrap();
    assert_eq!(second.envelope.message, "eth3 link DOWN");

    // No further events for an idempotent re-sync.
    engine.sync_host("array-1").await.unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_missing_log_is_not_an_error() {
    let fleet = FakeFleet::new();
    let host = fleet.host("array-1");
    host.rule("wc -l", 1, "");

    let (engine, store, pool) = engine_for(&fleet);
    pool.add_host(host_config("array-1")).await;

    let report = engine.sync_host("array-1").await.unwrap();
    assert_eq!(report.new_alerts, 0);
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unreachable_host_does_not_poison_others() {
    let fleet = FakeFleet::new();
    fleet
        .host("array-1")
        .set_log(vec![alert_line("link_state", "eth2 link DOWN", 1000)]);
    fleet.host("array-2").set_unreachable(true);

    let (engine, store, pool) = engine_for(&fleet);
    pool.add_host(host_config("array-1")).await;
    pool.add_host(host_config("array-2")).await;

    assert!(engine.sync_host("array-2").await.is_err());
    let report = engine.sync_host("array-1").await.unwrap();
    assert_eq!(report.new_alerts, 1);
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_pull_and_push_share_dedup() {
    let fleet = FakeFleet::new();
    fleet
        .host("array-1")
        .set_log(vec![alert_line("link_state", "eth2 link DOWN", 1000)]);

    let (engine, store, pool) = engine_for(&fleet);
    pool.add_host(host_config("array-1")).await;

    engine.sync_host("array-1").await.unwrap();

    // The same alert pushed directly is recognized as a duplicate.
    let report = engine
        .ingest_push("array-1", vec![envelope("link_state", "eth2 link DOWN", 1000)])
        .await
        .unwrap();
    assert_eq!(report.new_alerts, 0);
    assert_eq!(report.duplicates, 1);
    assert_eq!(store.count().await.unwrap(), 1);
}
