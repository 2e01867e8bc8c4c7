//! Helpers for integration tests: a scripted in-memory fleet standing in for
//! real hosts behind the transport seam.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrayguard::config::HostConfig;
use arrayguard::remote::{ExecOutput, RemoteTransport, TransportFactory};
use arrayguard::{AlertEnvelope, AlertLevel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// One simulated host: an in-memory alert log plus scripted command
/// responses. The builtin handlers understand the `wc -l` / `sed -n` shapes
/// the sync engine issues, so tests can drive incremental sync by editing the
/// log lines.
#[derive(Clone, Default)]
pub struct FakeHost {
    pub log_lines: Arc<Mutex<Vec<String>>>,
    /// (substring of command, canned response); first match wins.
    pub rules: Arc<Mutex<Vec<(String, ExecOutput)>>>,
    pub unreachable: Arc<AtomicBool>,
    pub uploads: Arc<Mutex<Vec<String>>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_log(&self, lines: Vec<String>) {
        *self.log_lines.lock().unwrap() = lines;
    }

    pub fn append_log(&self, lines: Vec<String>) {
        self.log_lines.lock().unwrap().extend(lines);
    }

    pub fn rule(&self, needle: &str, exit_code: i32, stdout: &str) {
        self.rules.lock().unwrap().push((
            needle.to_string(),
            ExecOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        ));
    }

    pub fn set_unreachable(&self, value: bool) {
        self.unreachable.store(value, Ordering::SeqCst);
    }
}

struct FakeTransport {
    host: FakeHost,
}

#[async_trait]
impl RemoteTransport for FakeTransport {
    async fn exec(&self, command: &str, _timeout: Duration) -> anyhow::Result<ExecOutput> {
        if self.host.unreachable.load(Ordering::SeqCst) {
            anyhow::bail!("connection lost");
        }

        for (needle, output) in self.host.rules.lock().unwrap().iter() {
            if command.contains(needle.as_str()) {
                return Ok(output.clone());
            }
        }

        if command.starts_with("wc -l") {
            let count = self.host.log_lines.lock().unwrap().len();
            return Ok(ok_output(&format!("{count}\n")));
        }

        if let Some(range) = command
            .strip_prefix("sed -n '")
            .and_then(|rest| rest.split('p').next())
        {
            let (start, end) = range
                .split_once(',')
                .ok_or_else(|| anyhow::anyhow!("bad sed range: {range}"))?;
            let start: usize = start.parse()?;
            let end: usize = end.parse()?;

            let lines = self.host.log_lines.lock().unwrap();
            let slice: Vec<String> = lines
                .iter()
                .skip(start.saturating_sub(1))
                .take(end.saturating_sub(start) + 1)
                .cloned()
                .collect();
            return Ok(ok_output(&format!("{}\n", slice.join("\n"))));
        }

        Ok(ok_output(""))
    }

    async fn upload(&self, local: &Path, remote: &str, _timeout: Duration) -> anyhow::Result<()> {
        if self.host.unreachable.load(Ordering::SeqCst) {
            anyhow::bail!("connection lost");
        }
        self.host
            .uploads
            .lock()
            .unwrap()
            .push(format!("{} -> {remote}", local.display()));
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        !self.host.unreachable.load(Ordering::SeqCst)
    }

    async fn close(&self) {}
}

/// Factory over a set of fake hosts, keyed by host id.
#[derive(Clone, Default)]
pub struct FakeFleet {
    hosts: Arc<Mutex<HashMap<String, FakeHost>>>,
}

impl FakeFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(&self, id: &str) -> FakeHost {
        self.hosts
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl TransportFactory for FakeFleet {
    async fn connect(
        &self,
        host: &HostConfig,
        _timeout: Duration,
    ) -> anyhow::Result<Box<dyn RemoteTransport>> {
        let fake = self.host(&host.id);
        if fake.unreachable.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        Ok(Box::new(FakeTransport { host: fake }))
    }
}

fn ok_output(stdout: &str) -> ExecOutput {
    ExecOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn host_config(id: &str) -> HostConfig {
    serde_json::from_value(serde_json::json!({"id": id, "addr": "10.0.0.1"})).unwrap()
}

pub fn pool_config() -> arrayguard::config::PoolConfig {
    serde_json::from_value(serde_json::json!({
        "max_reconnect_attempts": 2,
        "reconnect_backoff_millis": 1
    }))
    .unwrap()
}

pub fn sync_config() -> arrayguard::config::SyncConfig {
    serde_json::from_value(serde_json::json!({
        "alert_log_path": "/var/log/arrayguard/alerts.log"
    }))
    .unwrap()
}

/// A serialized alert-log line as the agent's file sink writes it.
pub fn alert_line(observer: &str, message: &str, ts_millis: i64) -> String {
    let envelope = envelope(observer, message, ts_millis);
    serde_json::to_string(&envelope).unwrap()
}

pub fn envelope(observer: &str, message: &str, ts_millis: i64) -> AlertEnvelope {
    AlertEnvelope {
        observer_name: observer.to_string(),
        level: AlertLevel::Warning,
        message: message.to_string(),
        timestamp: DateTime::<Utc>::from_timestamp_millis(ts_millis).unwrap(),
        details: serde_json::Value::Null,
    }
}
