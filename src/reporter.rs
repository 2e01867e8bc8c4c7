//! Alert emission: cooldown, dedup, sanitization and sink fan-out.
//!
//! Every observer result becomes at most one emitted alert per cooldown
//! window, keyed by `(observer_name, message_skeleton)` - the skeleton
//! collapses timestamps and numeric runs so near-identical messages share a
//! key. Sticky results bypass the key check entirely. Emission fans out to
//! all configured sinks through one normalized envelope; a failing sink is
//! logged and never blocks the others.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{error, info};

use crate::config::{ReporterConfig, SinkConfig};
use crate::{AlertEnvelope, AlertLevel, ObserverResult};

static TIMESTAMP_RUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[T ]?\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:?\d{2})?").unwrap()
});

static NUMERIC_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+(\.\d+)?").unwrap());

/// Secret shapes scrubbed from outgoing alerts.
static SANITIZE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"(?i)(password\s*[=:]\s*)\S+").unwrap(),
            "${1}***",
        ),
        (Regex::new(r"(?i)(passwd\s*[=:]\s*)\S+").unwrap(), "${1}***"),
        (Regex::new(r"(?i)(secret\s*[=:]\s*)\S+").unwrap(), "${1}***"),
        (Regex::new(r"(?i)(token\s*[=:]\s*)\S+").unwrap(), "${1}***"),
        (Regex::new(r"nqn\.[a-zA-Z0-9.\-:]+").unwrap(), "nqn.***"),
        (Regex::new(r"iqn\.[a-zA-Z0-9.\-:]+").unwrap(), "iqn.***"),
    ]
});

/// Bounded prefix length of the skeleton key.
const SKELETON_MAX_LEN: usize = 120;

/// Dedup key for cooldown: the message with timestamps and numeric runs
/// replaced by placeholders, truncated.
pub fn message_skeleton(message: &str) -> String {
    let collapsed = TIMESTAMP_RUN.replace_all(message, "<ts>");
    let collapsed = NUMERIC_RUN.replace_all(&collapsed, "#");
    collapsed.chars().take(SKELETON_MAX_LEN).collect()
}

enum Sink {
    File { path: PathBuf },
    Console,
    Syslog { socket: PathBuf },
    HttpPush {
        url: String,
        host_id: String,
        client: reqwest::Client,
    },
}

pub struct Reporter {
    sinks: Vec<Sink>,
    cooldown: Duration,
    min_level: AlertLevel,
    sanitize: bool,
    dry_run: bool,

    /// Last emission time per dedup key; entries past 2x cooldown are pruned
    /// so the cache stays bounded.
    emitted: HashMap<(String, String), DateTime<Utc>>,
}

impl Reporter {
    pub fn new(config: &ReporterConfig, dry_run: bool) -> Self {
        let sinks = config
            .sinks
            .iter()
            .map(|sink| match sink {
                SinkConfig::File { path } => Sink::File { path: path.clone() },
                SinkConfig::Console => Sink::Console,
                SinkConfig::Syslog { socket } => Sink::Syslog {
                    socket: socket.clone(),
                },
                SinkConfig::HttpPush { url, host_id } => Sink::HttpPush {
                    url: url.clone(),
                    host_id: host_id.clone(),
                    client: reqwest::Client::new(),
                },
            })
            .collect();

        Self {
            sinks,
            cooldown: Duration::from_secs(config.cooldown_seconds),
            min_level: config.min_level,
            sanitize: config.sanitize,
            dry_run,
            emitted: HashMap::new(),
        }
    }

    /// Emit the result unless it is below the minimum level or suppressed by
    /// cooldown. Returns whether an alert actually went out.
    pub async fn report(&mut self, result: &ObserverResult) -> bool {
        if result.level < self.min_level {
            return false;
        }

        let key = (
            result.observer_name.clone(),
            message_skeleton(&result.message),
        );

        // Stickies bypass the key check; everything else cools down.
        if !result.sticky && self.in_cooldown(&key) {
            return false;
        }

        let mut envelope = AlertEnvelope::from(result);
        if self.sanitize {
            envelope.message = sanitize(&envelope.message);
            envelope.details = sanitize_value(envelope.details);
        }
        if result.sticky {
            envelope.message = format!("[ongoing] {}", envelope.message);
        }

        if self.dry_run {
            info!(
                "[DRY-RUN] {}: {}",
                envelope.observer_name, envelope.message
            );
        } else {
            for sink in &self.sinks {
                if let Err(e) = sink.write(&envelope).await {
                    error!("sink write failed: {e:#}");
                }
            }
        }

        self.emitted.insert(key, Utc::now());
        self.prune_emitted();

        info!(
            "[{}] {}: {}",
            envelope.level, envelope.observer_name, envelope.message
        );
        true
    }

    fn in_cooldown(&self, key: &(String, String)) -> bool {
        self.emitted.get(key).is_some_and(|last| {
            let elapsed = Utc::now().signed_duration_since(*last);
            elapsed.to_std().is_ok_and(|e| e < self.cooldown)
        })
    }

    fn prune_emitted(&mut self) {
        let max_age = self.cooldown * 2;
        let now = Utc::now();
        self.emitted.retain(|_, last| {
            now.signed_duration_since(*last)
                .to_std()
                .is_ok_and(|age| age <= max_age)
        });
    }
}

fn sanitize(text: &str) -> String {
    let mut result = text.to_string();
    for (pattern, replacement) in SANITIZE_PATTERNS.iter() {
        result = pattern.replace_all(&result, *replacement).into_owned();
    }
    result
}

fn sanitize_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(sanitize(&s)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sanitize_value).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, sanitize_value(v)))
                .collect(),
        ),
        other => other,
    }
}

impl Sink {
    async fn write(&self, envelope: &AlertEnvelope) -> anyhow::Result<()> {
        let json = serde_json::to_string(envelope)?;

        match self {
            Sink::File { path } => append_line(path, &json).await,

            Sink::Console => {
                println!("[ALERT] {json}");
                Ok(())
            }

            Sink::Syslog { socket } => send_syslog(socket, envelope.level, &json),

            Sink::HttpPush {
                url,
                host_id,
                client,
            } => {
                let payload = serde_json::json!({
                    "type": "alert",
                    "host_id": host_id,
                    "observer_name": envelope.observer_name,
                    "level": envelope.level,
                    "message": envelope.message,
                    "timestamp": envelope.timestamp,
                    "details": envelope.details,
                });

                let response = client.post(url).json(&payload).send().await?;
                if !response.status().is_success() {
                    anyhow::bail!("push sink returned {}", response.status());
                }
                Ok(())
            }
        }
    }
}

async fn append_line(path: &Path, line: &str) -> anyhow::Result<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

/// RFC 3164 datagram to the local syslog socket (facility local0).
fn send_syslog(socket: &Path, level: AlertLevel, message: &str) -> anyhow::Result<()> {
    use std::os::unix::net::UnixDatagram;

    let severity = match level {
        AlertLevel::Info => 6,
        AlertLevel::Warning => 4,
        AlertLevel::Error => 3,
        AlertLevel::Critical => 2,
    };
    let priority = 16 * 8 + severity;

    let sender = UnixDatagram::unbound()?;
    let frame = format!("<{priority}>arrayguard-agent: {message}");
    sender.send_to(frame.as_bytes(), socket)?;
    Ok(())
}
