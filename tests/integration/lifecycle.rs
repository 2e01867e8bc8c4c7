//! Agent lifecycle state machine against scripted hosts.

use arrayguard::config::RemoteAgentConfig;
use arrayguard::lifecycle::{AgentManager, AgentState};
use arrayguard::remote::pool::ConnectionPool;
use assert_matches::assert_matches;

use crate::helpers::*;

fn agent_config(bundle: Option<&std::path::Path>) -> RemoteAgentConfig {
    let mut value = serde_json::json!({
        "start_timeout_secs": 2
    });
    if let Some(bundle) = bundle {
        value["bundle_path"] = serde_json::json!(bundle);
    }
    serde_json::from_value(value).unwrap()
}

async fn fleet_with_host(id: &str) -> (FakeFleet, ConnectionPool) {
    let fleet = FakeFleet::new();
    let pool = ConnectionPool::new(pool_config(), Box::new(fleet.clone()));
    pool.add_host(host_config(id)).await;
    (fleet, pool)
}

#[tokio::test]
async fn test_start_verifies_liveness_and_records_pid() {
    let (fleet, pool) = fleet_with_host("array-1").await;
    let host = fleet.host("array-1");
    host.rule("setsid", 0, "4242\n");
    host.rule("kill -0 4242", 0, "alive\n");

    let manager = AgentManager::new(pool, agent_config(None));

    let pid = manager.start("array-1").await.unwrap();
    assert_eq!(pid, 4242);
    assert_eq!(manager.state("array-1").await, AgentState::Running);
}

#[tokio::test]
async fn test_start_failure_returns_startup_log_tail() {
    let (fleet, pool) = fleet_with_host("array-1").await;
    let host = fleet.host("array-1");
    host.rule("setsid", 0, "4242\n");
    // kill -0 probes find nothing alive.
    host.rule("kill -0 4242", 1, "");
    host.rule("tail -n 20", 0, "panic: configuration file missing\n");

    let manager = AgentManager::new(pool, agent_config(None));

    let error = manager.start("array-1").await.unwrap_err();
    let message = format!("{error:#}");
    assert!(message.contains("died after start"));
    // The diagnostic is the remote startup log, not a bare boolean.
    assert!(message.contains("panic: configuration file missing"));
    assert_eq!(manager.state("array-1").await, AgentState::Error);
}

#[tokio::test]
async fn test_start_without_pid_is_error() {
    let (fleet, pool) = fleet_with_host("array-1").await;
    fleet.host("array-1").rule("setsid", 0, "not-a-pid\n");

    let manager = AgentManager::new(pool, agent_config(None));

    let error = manager.start("array-1").await.unwrap_err();
    assert!(format!("{error:#}").contains("no pid"));
    assert_eq!(manager.state("array-1").await, AgentState::Error);
}

#[tokio::test]
async fn test_deploy_requires_bundle() {
    let (_fleet, pool) = fleet_with_host("array-1").await;
    let manager = AgentManager::new(pool, agent_config(None));

    let error = manager.deploy("array-1").await.unwrap_err();
    assert!(format!("{error:#}").contains("no agent bundle"));
}

#[tokio::test]
async fn test_deploy_uploads_and_marks_deployed() {
    let (fleet, pool) = fleet_with_host("array-1").await;
    let bundle = tempfile::NamedTempFile::new().unwrap();

    let manager = AgentManager::new(pool, agent_config(Some(bundle.path())));

    manager.deploy("array-1").await.unwrap();
    assert_eq!(manager.state("array-1").await, AgentState::Deployed);

    let uploads = fleet.host("array-1").uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0].ends_with("-> /opt/arrayguard.tar.gz"));
}

#[tokio::test]
async fn test_deploy_failure_marks_error() {
    let (fleet, pool) = fleet_with_host("array-1").await;
    let bundle = tempfile::NamedTempFile::new().unwrap();
    fleet
        .host("array-1")
        .rule("tar -xzf", 1, "");

    let manager = AgentManager::new(pool, agent_config(Some(bundle.path())));

    assert!(manager.deploy("array-1").await.is_err());
    assert_eq!(manager.state("array-1").await, AgentState::Error);
}

#[tokio::test]
async fn test_stop_signals_recorded_pid() {
    let (fleet, pool) = fleet_with_host("array-1").await;
    let host = fleet.host("array-1");
    host.rule("cat /var/run/arrayguard-agent.pid", 0, "4242\n");

    let manager = AgentManager::new(pool, agent_config(None));

    manager.stop("array-1").await.unwrap();
    assert_eq!(manager.state("array-1").await, AgentState::Stopped);
}

#[tokio::test]
async fn test_restart_reports_failing_phase() {
    let (fleet, pool) = fleet_with_host("array-1").await;
    // Unreachable host: the stop phase cannot even execute.
    fleet.host("array-1").set_unreachable(true);

    let manager = AgentManager::new(pool, agent_config(None));

    let error = manager.restart("array-1").await.unwrap_err();
    assert!(format!("{error:#}").contains("stop phase failed"));
    assert_eq!(manager.state("array-1").await, AgentState::Error);
}

#[tokio::test]
async fn test_restart_reports_start_phase_failure() {
    let (fleet, pool) = fleet_with_host("array-1").await;
    let host = fleet.host("array-1");
    host.rule("setsid", 0, "7.7\n"); // unparsable pid

    let manager = AgentManager::new(pool, agent_config(None));

    let error = manager.restart("array-1").await.unwrap_err();
    assert!(format!("{error:#}").contains("start phase failed"));
}

#[tokio::test]
async fn test_status_reflects_remote_observations() {
    let (fleet, pool) = fleet_with_host("array-1").await;
    let host = fleet.host("array-1");
    host.rule("test -d /opt/arrayguard", 0, "deployed\n");
    host.rule("cat /var/run/arrayguard-agent.pid", 0, "777\n");
    host.rule("kill -0 777", 0, "running\n");
    host.rule("ps -p 777", 0, " 3600\n");

    let manager = AgentManager::new(pool, agent_config(None));

    let status = manager.status("array-1").await.unwrap();
    assert!(status.deployed);
    assert!(status.running);
    assert_matches!(status.pid, Some(777));
    assert_matches!(status.uptime_seconds, Some(3600));
}

#[tokio::test]
async fn test_status_not_running_without_pid_file() {
    let (fleet, pool) = fleet_with_host("array-1").await;
    let host = fleet.host("array-1");
    host.rule("test -d /opt/arrayguard", 0, "deployed\n");
    host.rule("cat /var/run/arrayguard-agent.pid", 1, "");

    let manager = AgentManager::new(pool, agent_config(None));

    let status = manager.status("array-1").await.unwrap();
    assert!(status.deployed);
    assert!(!status.running);
    assert_matches!(status.pid, None);
}
