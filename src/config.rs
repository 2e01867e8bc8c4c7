use std::path::PathBuf;

use tracing::trace;

/// Top-level configuration file.
///
/// One file can carry both sections; each binary reads the section it needs
/// and treats it as immutable after load.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub agent: Option<AgentConfig>,
    pub hub: Option<HubConfig>,
}

// ============================================================================
// Agent side
// ============================================================================

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub observers: Vec<ObserverConfig>,

    #[serde(default)]
    pub reporter: ReporterConfig,

    /// Budget for any single blocking call inside an observer (subprocess,
    /// file read). No observer may stall the loop longer than this.
    #[serde(default = "default_subprocess_timeout")]
    pub subprocess_timeout_secs: u64,

    /// Soft memory ceiling for the agent process; exceeding it is logged.
    pub max_memory_mb: Option<u64>,
}

/// Per-observer configuration: common knobs plus the strategy variant.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ObserverConfig {
    pub name: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_observer_interval")]
    pub interval_secs: u64,

    #[serde(flatten)]
    pub strategy: StrategyConfig,
}

/// Strategy-specific options, validated and defaulted at load time.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Cumulative counter growth (port error counters).
    CounterDelta {
        #[serde(default)]
        threshold: u64,

        /// Ports to watch; empty means auto-discover under `statistics_root`.
        #[serde(default)]
        ports: Vec<String>,

        #[serde(default = "default_net_root")]
        statistics_root: PathBuf,

        #[serde(default = "default_counters")]
        counters: Vec<String>,
    },

    /// Enum state change (link carrier/operstate).
    StateTransition {
        #[serde(default)]
        ports: Vec<String>,

        /// Ports that never alert regardless of transition.
        #[serde(default)]
        whitelist: Vec<String>,

        #[serde(default = "default_net_root")]
        sysfs_root: PathBuf,
    },

    /// Keyword/regex scan over newly appended log content.
    LogScan {
        path: PathBuf,

        patterns: Vec<String>,

        #[serde(default)]
        exclude_patterns: Vec<String>,

        #[serde(default = "default_max_lines_per_check")]
        max_lines_per_check: usize,

        /// Bounded ring of recent matches kept for reporting context.
        #[serde(default = "default_match_history")]
        match_history: usize,

        /// Redact the matched value before it enters the alert.
        #[serde(default)]
        redact: bool,

        #[serde(default = "default_scan_level")]
        level: crate::AlertLevel,
    },

    /// Sliding-window trigger over a sampled metric (memory growth, CPU
    /// saturation). Sticky once the qualifying run reaches `run_length`.
    Windowed {
        source: SampleSource,

        predicate: WindowPredicate,

        #[serde(default = "default_run_length")]
        run_length: usize,

        #[serde(default = "default_windowed_level")]
        level: crate::AlertLevel,
    },

    /// Wall-clock duration of a configured command.
    CommandTiming {
        commands: Vec<String>,

        /// Alert when a command takes longer than this.
        #[serde(default = "default_duration_bound")]
        max_duration_secs: f64,

        /// Hard timeout for the command itself.
        #[serde(default = "default_exec_timeout")]
        exec_timeout_secs: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleSource {
    MemoryUsedMb,
    CpuAveragePercent,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPredicate {
    /// Every sample strictly greater than its predecessor.
    StrictlyIncreasing,
    /// Every sample at or above the threshold.
    AtLeast { threshold: f64 },
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ReporterConfig {
    #[serde(default = "default_sinks")]
    pub sinks: Vec<SinkConfig>,

    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,

    /// Alerts below this level are dropped silently.
    #[serde(default)]
    pub min_level: crate::AlertLevel,

    /// Scrub known secret shapes from messages and details before emission.
    #[serde(default = "default_enabled")]
    pub sanitize: bool,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            sinks: default_sinks(),
            cooldown_seconds: default_cooldown(),
            min_level: crate::AlertLevel::Info,
            sanitize: true,
        }
    }
}

/// Alert sink configuration.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    /// JSON lines appended to a local file. This is the file the hub tails.
    File { path: PathBuf },

    /// One line per alert on stdout.
    Console,

    /// RFC 3164 datagrams to the local syslog socket.
    Syslog {
        #[serde(default = "default_syslog_socket")]
        socket: PathBuf,
    },

    /// POST the envelope to the hub ingestion endpoint.
    HttpPush { url: String, host_id: String },
}

// ============================================================================
// Hub side
// ============================================================================

#[derive(Debug, Clone, serde::Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub hosts: Vec<HostConfig>,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub agent: RemoteAgentConfig,

    /// Central alert storage (optional - defaults to in-memory).
    pub storage: Option<StorageConfig>,
}

/// One managed array host.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct HostConfig {
    pub id: String,
    pub addr: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_username")]
    pub username: String,

    /// Private key used for authentication; agent/identity lookup stays off.
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PoolConfig {
    /// Worker bound: at most this many remote calls in flight at once,
    /// regardless of fleet size.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_millis: u64,

    /// Connections unused longer than this are closed by the reaper.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            max_reconnect_attempts: default_reconnect_attempts(),
            reconnect_backoff_millis: default_reconnect_backoff(),
            idle_timeout_secs: default_idle_timeout(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    /// Remote path of the agent's alert log (JSON lines).
    #[serde(default = "default_alert_log")]
    pub alert_log_path: String,

    /// Cap on lines fetched per sync pass; the remainder is picked up on the
    /// next pass.
    #[serde(default = "default_max_lines_per_sync")]
    pub max_lines_per_sync: u64,

    /// Capacity of the in-memory dedup cache (oldest hashes evicted).
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
            alert_log_path: default_alert_log(),
            max_lines_per_sync: default_max_lines_per_sync(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

/// Where and how the remote agent is installed and supervised.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RemoteAgentConfig {
    /// Local path of the agent bundle (tarball) to upload on deploy.
    pub bundle_path: Option<PathBuf>,

    #[serde(default = "default_deploy_path")]
    pub deploy_path: String,

    #[serde(default = "default_remote_config")]
    pub config_path: String,

    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    #[serde(default = "default_start_log")]
    pub start_log: String,

    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
}

impl Default for RemoteAgentConfig {
    fn default() -> Self {
        Self {
            bundle_path: None,
            deploy_path: default_deploy_path(),
            config_path: default_remote_config(),
            pid_file: default_pid_file(),
            start_log: default_start_log(),
            start_timeout_secs: default_start_timeout(),
        }
    }
}

/// Storage backend configuration.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default for most deployments)
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,

        /// Retention period in days (alerts older than this are deleted)
        #[serde(default = "default_retention_days")]
        retention_days: u32,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
            retention_days: default_retention_days(),
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_enabled() -> bool {
    true
}

fn default_observer_interval() -> u64 {
    30
}

fn default_subprocess_timeout() -> u64 {
    10
}

fn default_net_root() -> PathBuf {
    PathBuf::from("/sys/class/net")
}

fn default_counters() -> Vec<String> {
    [
        "rx_crc_errors",
        "rx_frame_errors",
        "tx_carrier_errors",
        "rx_dropped",
        "tx_dropped",
        "rx_fifo_errors",
        "tx_fifo_errors",
        "rx_errors",
        "tx_errors",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_max_lines_per_check() -> usize {
    1000
}

fn default_match_history() -> usize {
    100
}

fn default_scan_level() -> crate::AlertLevel {
    crate::AlertLevel::Warning
}

fn default_run_length() -> usize {
    6
}

fn default_windowed_level() -> crate::AlertLevel {
    crate::AlertLevel::Error
}

fn default_duration_bound() -> f64 {
    1.0
}

fn default_exec_timeout() -> u64 {
    10
}

fn default_sinks() -> Vec<SinkConfig> {
    vec![SinkConfig::File {
        path: PathBuf::from("/var/log/arrayguard/alerts.log"),
    }]
}

fn default_cooldown() -> u64 {
    300
}

fn default_syslog_socket() -> PathBuf {
    PathBuf::from("/dev/log")
}

fn default_ssh_port() -> u16 {
    22
}

fn default_username() -> String {
    String::from("root")
}

fn default_max_concurrency() -> usize {
    8
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    30
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_backoff() -> u64 {
    500
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_reap_interval() -> u64 {
    60
}

fn default_sync_interval() -> u64 {
    30
}

fn default_alert_log() -> String {
    String::from("/var/log/arrayguard/alerts.log")
}

fn default_max_lines_per_sync() -> u64 {
    500
}

fn default_dedup_capacity() -> usize {
    4096
}

fn default_deploy_path() -> String {
    String::from("/opt/arrayguard")
}

fn default_remote_config() -> String {
    String::from("/etc/arrayguard/config.json")
}

fn default_pid_file() -> String {
    String::from("/var/run/arrayguard-agent.pid")
}

fn default_start_log() -> String {
    String::from("/tmp/arrayguard_start.log")
}

fn default_start_timeout() -> u64 {
    10
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./alerts.db")
}

fn default_retention_days() -> u32 {
    30
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config: &Config| trace!("loaded config: {config:?}"))
}
