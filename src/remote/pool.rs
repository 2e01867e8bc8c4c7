//! Connection pool: one reusable session per host, bounded concurrency.
//!
//! ## Concurrency discipline
//!
//! - Exactly one connection object per host; a per-host async mutex
//!   serializes commands to the same host (ordering preserved).
//! - A pool-wide semaphore bounds how many remote calls are in flight at
//!   once, so the worker bound - not the fleet size - determines parallelism.
//! - The host map itself is only locked for additions/removals and slot
//!   lookup; command execution against distinct hosts proceeds without
//!   contention.
//!
//! Connections open lazily on first use, are liveness-checked before reuse,
//! and reconnect with short backoff up to a bounded attempt count, after
//! which the host is reported unreachable (an error value, not a crash) and
//! retried on the next call. A background reaper closes connections idle
//! beyond the configured threshold.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::{HostConfig, PoolConfig};

use super::{ExecOutput, RemoteTransport, TransportFactory};

/// Connection state of one pooled host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

struct SlotState {
    transport: Option<Box<dyn RemoteTransport>>,
    connection: ConnectionState,
    last_used: Instant,
    consecutive_failures: u32,
}

/// One managed host: config plus the serialized session state.
struct HostSlot {
    host: HostConfig,
    state: Mutex<SlotState>,
}

struct PoolInner {
    /// host id -> slot; mutations to the map are serialized here, command
    /// execution only holds the per-slot lock.
    hosts: Mutex<HashMap<String, Arc<HostSlot>>>,
    factory: Box<dyn TransportFactory>,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, factory: Box<dyn TransportFactory>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            inner: Arc::new(PoolInner {
                hosts: Mutex::new(HashMap::new()),
                factory,
                config,
                semaphore,
            }),
        }
    }

    pub async fn add_host(&self, host: HostConfig) {
        let slot = Arc::new(HostSlot {
            state: Mutex::new(SlotState {
                transport: None,
                connection: ConnectionState::Disconnected,
                last_used: Instant::now(),
                consecutive_failures: 0,
            }),
            host,
        });

        let mut hosts = self.inner.hosts.lock().await;
        if let Some(previous) = hosts.insert(slot.host.id.clone(), slot) {
            // Replacing a host closes the old session.
            let mut state = previous.state.lock().await;
            if let Some(transport) = state.transport.take() {
                transport.close().await;
            }
        }
    }

    pub async fn remove_host(&self, host_id: &str) {
        let removed = self.inner.hosts.lock().await.remove(host_id);
        if let Some(slot) = removed {
            let mut state = slot.state.lock().await;
            if let Some(transport) = state.transport.take() {
                transport.close().await;
            }
            state.connection = ConnectionState::Disconnected;
        }
    }

    pub async fn host_ids(&self) -> Vec<String> {
        self.inner.hosts.lock().await.keys().cloned().collect()
    }

    pub async fn connection_state(&self, host_id: &str) -> Option<ConnectionState> {
        let slot = self.inner.hosts.lock().await.get(host_id)?.clone();
        let state = slot.state.lock().await;
        Some(state.connection)
    }

    /// Number of hosts currently holding a live session.
    pub async fn live_connection_count(&self) -> usize {
        let slots: Vec<Arc<HostSlot>> = self.inner.hosts.lock().await.values().cloned().collect();

        let mut count = 0;
        for slot in slots {
            if slot.state.lock().await.transport.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Execute a command on one host with the pool's command timeout.
    pub async fn execute(&self, host_id: &str, command: &str) -> anyhow::Result<ExecOutput> {
        let timeout = Duration::from_secs(self.inner.config.command_timeout_secs);
        self.execute_with_timeout(host_id, command, timeout).await
    }

    /// Execute a command on one host, bounded by an explicit timeout.
    #[instrument(skip(self), fields(host = %host_id))]
    pub async fn execute_with_timeout(
        &self,
        host_id: &str,
        command: &str,
        timeout: Duration,
    ) -> anyhow::Result<ExecOutput> {
        let slot = {
            let hosts = self.inner.hosts.lock().await;
            hosts
                .get(host_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown host: {host_id}"))?
        };

        // Worker bound first, then the per-host command lock.
        let _permit = self
            .inner
            .semaphore
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("pool shut down"))?;

        let mut state = slot.state.lock().await;
        self.ensure_connected(&slot.host, &mut state).await?;

        let transport = state
            .transport
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("host {host_id} has no live session"))?;

        match transport.exec(command, timeout).await {
            Ok(output) => {
                state.last_used = Instant::now();
                state.consecutive_failures = 0;
                Ok(output)
            }
            Err(e) => {
                // A timeout or exec failure counts against the host but does
                // not assume the session itself is dead.
                state.consecutive_failures += 1;
                state.last_used = Instant::now();
                warn!(
                    "command on {host_id} failed ({} consecutive): {e:#}",
                    state.consecutive_failures
                );
                Err(e)
            }
        }
    }

    /// Offload a command onto the runtime; the caller's loop is never
    /// blocked. Concurrency stays bounded by the pool semaphore.
    pub fn execute_detached(
        &self,
        host_id: String,
        command: String,
    ) -> tokio::task::JoinHandle<anyhow::Result<ExecOutput>> {
        let pool = self.clone();
        tokio::spawn(async move { pool.execute(&host_id, &command).await })
    }

    /// Run a command across many hosts concurrently (bounded by the worker
    /// semaphore). One host's failure never aborts or blocks the others; the
    /// per-host outcome is returned as data.
    #[instrument(skip(self, hosts))]
    pub async fn batch_execute(
        &self,
        hosts: &[String],
        command: &str,
    ) -> HashMap<String, Result<ExecOutput, String>> {
        let futures = hosts.iter().map(|host_id| {
            let pool = self.clone();
            let host_id = host_id.clone();
            let command = command.to_string();
            async move {
                let result = pool
                    .execute(&host_id, &command)
                    .await
                    .map_err(|e| format!("{e:#}"));
                (host_id, result)
            }
        });

        futures::future::join_all(futures).await.into_iter().collect()
    }

    /// Read a remote file's content through the session.
    pub async fn read_file(&self, host_id: &str, path: &str) -> anyhow::Result<String> {
        let output = self.execute(host_id, &format!("cat {path}")).await?;
        if !output.success() {
            anyhow::bail!("reading {path} failed: {}", output.stderr.trim());
        }
        Ok(output.stdout)
    }

    /// Upload a local file to a host, serialized with that host's commands.
    pub async fn upload(
        &self,
        host_id: &str,
        local: &Path,
        remote: &str,
    ) -> anyhow::Result<()> {
        let slot = {
            let hosts = self.inner.hosts.lock().await;
            hosts
                .get(host_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown host: {host_id}"))?
        };

        let _permit = self
            .inner
            .semaphore
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("pool shut down"))?;

        let mut state = slot.state.lock().await;
        self.ensure_connected(&slot.host, &mut state).await?;

        let timeout = Duration::from_secs(self.inner.config.command_timeout_secs);
        let transport = state
            .transport
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("host {host_id} has no live session"))?;

        let result = transport.upload(local, remote, timeout).await;
        state.last_used = Instant::now();
        match result {
            Ok(()) => {
                state.consecutive_failures = 0;
                Ok(())
            }
            Err(e) => {
                state.consecutive_failures += 1;
                Err(e)
            }
        }
    }

    /// Lazily open or revive the slot's session. Caller holds the slot lock.
    async fn ensure_connected(
        &self,
        host: &HostConfig,
        state: &mut SlotState,
    ) -> anyhow::Result<()> {
        if let Some(transport) = state.transport.as_ref() {
            if transport.is_alive().await {
                return Ok(());
            }
            debug!("session to {} went stale, reconnecting", host.id);
            if let Some(old) = state.transport.take() {
                old.close().await;
            }
        }

        state.connection = ConnectionState::Connecting;

        let connect_timeout = Duration::from_secs(self.inner.config.connect_timeout_secs);
        let backoff = Duration::from_millis(self.inner.config.reconnect_backoff_millis);
        let attempts = self.inner.config.max_reconnect_attempts.max(1);

        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.inner.factory.connect(host, connect_timeout).await {
                Ok(transport) => {
                    info!("connected to {} (attempt {attempt})", host.id);
                    state.transport = Some(transport);
                    state.connection = ConnectionState::Connected;
                    state.last_used = Instant::now();
                    return Ok(());
                }
                Err(e) => {
                    warn!("connect to {} failed (attempt {attempt}/{attempts}): {e:#}", host.id);
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        // Unreachable: a surfaced state, retried on the next call.
        state.connection = ConnectionState::Error;
        state.consecutive_failures += 1;
        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("connect failed"))
            .context(format!("host {} unreachable", host.id)))
    }

    /// Close sessions idle longer than the configured threshold. Returns how
    /// many were closed.
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = Duration::from_secs(self.inner.config.idle_timeout_secs);
        let slots: Vec<Arc<HostSlot>> = self.inner.hosts.lock().await.values().cloned().collect();

        let mut reaped = 0;
        for slot in slots {
            let mut state = slot.state.lock().await;
            if state.transport.is_some() && state.last_used.elapsed() >= idle_timeout {
                if let Some(transport) = state.transport.take() {
                    transport.close().await;
                }
                state.connection = ConnectionState::Disconnected;
                debug!("reaped idle connection to {}", slot.host.id);
                reaped += 1;
            }
        }

        if reaped > 0 {
            info!("idle reaper closed {reaped} connections");
        }
        reaped
    }

    /// Background task closing idle connections periodically.
    pub fn spawn_reaper(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        let interval = Duration::from_secs(pool.inner.config.reap_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.reap_idle().await;
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            debug!("reaper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Close every session.
    pub async fn close_all(&self) {
        let slots: Vec<Arc<HostSlot>> = self.inner.hosts.lock().await.values().cloned().collect();
        for slot in slots {
            let mut state = slot.state.lock().await;
            if let Some(transport) = state.transport.take() {
                transport.close().await;
            }
            state.connection = ConnectionState::Disconnected;
        }
    }
}
