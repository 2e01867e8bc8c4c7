//! Push path: agent HTTP push sink and hub-side push ingestion.

use std::sync::Arc;

use arrayguard::config::ReporterConfig;
use arrayguard::remote::pool::ConnectionPool;
use arrayguard::reporter::Reporter;
use arrayguard::storage::AlertStore;
use arrayguard::storage::memory::MemoryStore;
use arrayguard::sync::SyncEngine;
use arrayguard::{AlertLevel, ObserverResult};
use tokio::sync::broadcast;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_push_sink_posts_envelope() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/ingest"))
        .and(body_partial_json(serde_json::json!({
            "type": "alert",
            "host_id": "array-1",
            "observer_name": "link_state",
            "level": "warning",
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config: ReporterConfig = serde_json::from_value(serde_json::json!({
        "sinks": [{
            "kind": "http_push",
            "url": format!("{}/ingest", mock_server.uri()),
            "host_id": "array-1"
        }],
        "cooldown_seconds": 0
    }))
    .unwrap();
    let mut reporter = Reporter::new(&config, false);

    let result = ObserverResult::new("link_state", AlertLevel::Warning, "eth2 link DOWN");
    assert!(reporter.report(&result).await);

    mock_server.verify().await;
}

#[tokio::test]
async fn test_push_sink_failure_does_not_stop_reporting() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let config: ReporterConfig = serde_json::from_value(serde_json::json!({
        "sinks": [{
            "kind": "http_push",
            "url": format!("{}/ingest", mock_server.uri()),
            "host_id": "array-1"
        }],
        "cooldown_seconds": 0
    }))
    .unwrap();
    let mut reporter = Reporter::new(&config, false);

    // The sink errors; the reporter still counts the alert as emitted and
    // keeps running.
    let result = ObserverResult::new("link_state", AlertLevel::Warning, "eth2 link DOWN");
    assert!(reporter.report(&result).await);
    let second = ObserverResult::new("link_state", AlertLevel::Warning, "eth3 link DOWN");
    assert!(reporter.report(&second).await);
}

#[tokio::test]
async fn test_hub_push_ingestion_dedups_and_broadcasts() {
    let fleet = FakeFleet::new();
    let pool = ConnectionPool::new(pool_config(), Box::new(fleet));
    let store: Arc<dyn AlertStore> = Arc::new(MemoryStore::new());
    let (alert_tx, mut alert_rx) = broadcast::channel(64);
    let engine = SyncEngine::new(pool, store.clone(), alert_tx, sync_config());

    let batch = vec![
        envelope("link_state", "eth2 link DOWN", 1000),
        envelope("counters", "eth2.rx_errors +9", 2000),
    ];

    let report = engine.ingest_push("array-7", batch.clone()).await.unwrap();
    assert_eq!(report.new_alerts, 2);
    assert_eq!(store.count().await.unwrap(), 2);

    let event = alert_rx.recv().await.unwrap();
    assert_eq!(event.host_id, "array-7");

    // Replaying the same batch inserts and broadcasts nothing.
    let replay = engine.ingest_push("array-7", batch).await.unwrap();
    assert_eq!(replay.new_alerts, 0);
    assert_eq!(replay.duplicates, 2);
    assert_eq!(store.count().await.unwrap(), 2);

    let _ = alert_rx.recv().await; // second alert of the first batch
    assert!(alert_rx.try_recv().is_err());
}
