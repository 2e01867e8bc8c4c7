//! Remote agent lifecycle: deploy, start, stop, restart.
//!
//! The agent is launched fully detached from the controlling session
//! (`setsid`, I/O redirected) so session teardown cannot kill it, its pid is
//! written to a known file, and startup is verified by polling liveness
//! within a bounded timeout. A failed start returns the tail of the startup
//! log - a remote failure should be diagnosable without logging in by hand.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::config::RemoteAgentConfig;
use crate::remote::pool::ConnectionPool;

/// Lifecycle state of the agent on one host. `Error` is reachable from any
/// state on an unrecoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    NotDeployed,
    Deployed,
    Running,
    Stopped,
    Restarting,
    Error,
}

/// Point-in-time agent status as reported by the host.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentStatus {
    pub deployed: bool,
    pub running: bool,
    pub pid: Option<u32>,
    pub uptime_seconds: Option<u64>,
}

pub struct AgentManager {
    pool: ConnectionPool,
    config: RemoteAgentConfig,
    states: Mutex<HashMap<String, AgentState>>,
}

impl AgentManager {
    pub fn new(pool: ConnectionPool, config: RemoteAgentConfig) -> Self {
        Self {
            pool,
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub async fn state(&self, host_id: &str) -> AgentState {
        self.states
            .lock()
            .await
            .get(host_id)
            .copied()
            .unwrap_or_default()
    }

    async fn set_state(&self, host_id: &str, state: AgentState) {
        self.states.lock().await.insert(host_id.to_string(), state);
    }

    /// Upload and unpack the agent bundle, then install its config.
    #[instrument(skip(self), fields(host = %host_id))]
    pub async fn deploy(&self, host_id: &str) -> anyhow::Result<()> {
        let bundle = self
            .config
            .bundle_path
            .as_ref()
            .context("no agent bundle configured")?;

        let deploy_path = &self.config.deploy_path;
        let deploy_parent = parent_dir(deploy_path);
        let remote_bundle = format!("{deploy_parent}/arrayguard.tar.gz");

        let result: anyhow::Result<()> = async {
            self.pool
                .execute(host_id, &format!("mkdir -p {deploy_parent}"))
                .await?;

            self.pool
                .upload(host_id, bundle, &remote_bundle)
                .await
                .context("agent bundle upload failed")?;

            let config_parent = parent_dir(&self.config.config_path);
            let commands = [
                format!("rm -rf {deploy_path}"),
                format!("tar -xzf {remote_bundle} -C {deploy_parent}"),
                format!("mkdir -p {config_parent}"),
                format!(
                    "cp {deploy_path}/config.json {}",
                    self.config.config_path
                ),
            ];

            for command in &commands {
                let output = self.pool.execute(host_id, command).await?;
                if !output.success() {
                    anyhow::bail!(
                        "remote command failed ({command}): {}",
                        output.stderr.trim()
                    );
                }
            }

            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                info!("agent deployed on {host_id}");
                self.set_state(host_id, AgentState::Deployed).await;
                Ok(())
            }
            Err(e) => {
                self.set_state(host_id, AgentState::Error).await;
                Err(e.context(format!("deploy to {host_id} failed")))
            }
        }
    }

    /// Launch the agent detached, record its pid, verify liveness.
    #[instrument(skip(self), fields(host = %host_id))]
    pub async fn start(&self, host_id: &str) -> anyhow::Result<u32> {
        // A stale instance would race the new one on the pid file.
        let _ = self.stop_inner(host_id).await;

        let RemoteAgentConfig {
            deploy_path,
            config_path,
            pid_file,
            start_log,
            start_timeout_secs,
            ..
        } = &self.config;

        let log_parent = parent_dir(start_log);
        let start_script = format!(
            "mkdir -p {log_parent} && cd {deploy_path} && \
             setsid ./arrayguard-agent -c {config_path} \
             > {start_log} 2>&1 < /dev/null & \
             AGENT_PID=$! && echo $AGENT_PID > {pid_file} && echo $AGENT_PID"
        );

        let output = self.pool.execute(host_id, &start_script).await?;
        if !output.success() {
            let detail = self.startup_log_tail(host_id).await;
            self.set_state(host_id, AgentState::Error).await;
            anyhow::bail!("agent start command failed on {host_id}: {detail}");
        }

        let pid: u32 = match output.stdout.trim().parse() {
            Ok(pid) => pid,
            Err(_) => {
                self.set_state(host_id, AgentState::Error).await;
                anyhow::bail!(
                    "no pid from agent start on {host_id} (got: {:?})",
                    output.stdout.trim()
                );
            }
        };

        // Poll liveness within the bounded startup window.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(*start_timeout_secs);
        let mut alive = false;
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;

            let probe = self
                .pool
                .execute(host_id, &format!("kill -0 {pid} 2>/dev/null && echo alive"))
                .await?;
            if probe.stdout.contains("alive") {
                alive = true;
                // One more beat: catch processes that die right after exec.
                tokio::time::sleep(Duration::from_millis(500)).await;
                let recheck = self
                    .pool
                    .execute(host_id, &format!("kill -0 {pid} 2>/dev/null && echo alive"))
                    .await?;
                alive = recheck.stdout.contains("alive");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                break;
            }
        }

        if !alive {
            let detail = self.startup_log_tail(host_id).await;
            self.set_state(host_id, AgentState::Error).await;
            anyhow::bail!("agent process died after start on {host_id} (pid {pid}): {detail}");
        }

        info!("agent started on {host_id} (pid {pid})");
        self.set_state(host_id, AgentState::Running).await;
        Ok(pid)
    }

    /// Signal the recorded pid, with a pattern-kill fallback for orphans.
    #[instrument(skip(self), fields(host = %host_id))]
    pub async fn stop(&self, host_id: &str) -> anyhow::Result<()> {
        self.stop_inner(host_id).await?;
        self.set_state(host_id, AgentState::Stopped).await;
        info!("agent stopped on {host_id}");
        Ok(())
    }

    async fn stop_inner(&self, host_id: &str) -> anyhow::Result<()> {
        let pid_file = &self.config.pid_file;

        let pid_output = self
            .pool
            .execute(host_id, &format!("cat {pid_file} 2>/dev/null"))
            .await?;

        if pid_output.success()
            && let Ok(pid) = pid_output.stdout.trim().parse::<u32>()
        {
            self.pool
                .execute(host_id, &format!("kill {pid} 2>/dev/null"))
                .await?;
            tokio::time::sleep(Duration::from_millis(500)).await;
            self.pool
                .execute(host_id, &format!("kill -9 {pid} 2>/dev/null"))
                .await?;
            self.pool
                .execute(host_id, &format!("rm -f {pid_file}"))
                .await?;
        }

        // Orphans from lost pid files.
        self.pool
            .execute(host_id, "pkill -f arrayguard-agent 2>/dev/null")
            .await?;

        Ok(())
    }

    /// Stop then start as one logical operation, reporting which half failed.
    #[instrument(skip(self), fields(host = %host_id))]
    pub async fn restart(&self, host_id: &str) -> anyhow::Result<u32> {
        self.set_state(host_id, AgentState::Restarting).await;

        if let Err(e) = self.stop_inner(host_id).await {
            self.set_state(host_id, AgentState::Error).await;
            return Err(e.context(format!("restart of {host_id}: stop phase failed")));
        }

        match self.start(host_id).await {
            Ok(pid) => Ok(pid),
            Err(e) => Err(e.context(format!("restart of {host_id}: start phase failed"))),
        }
    }

    /// Deployed/running/pid/uptime as observed on the host right now.
    pub async fn status(&self, host_id: &str) -> anyhow::Result<AgentStatus> {
        let mut status = AgentStatus::default();

        let deployed = self
            .pool
            .execute(
                host_id,
                &format!("test -d {} && echo deployed", self.config.deploy_path),
            )
            .await?;
        status.deployed = deployed.stdout.contains("deployed");

        let pid_output = self
            .pool
            .execute(host_id, &format!("cat {} 2>/dev/null", self.config.pid_file))
            .await?;

        if pid_output.success()
            && let Ok(pid) = pid_output.stdout.trim().parse::<u32>()
        {
            let probe = self
                .pool
                .execute(host_id, &format!("kill -0 {pid} 2>/dev/null && echo running"))
                .await?;

            if probe.stdout.contains("running") {
                status.running = true;
                status.pid = Some(pid);

                let uptime = self
                    .pool
                    .execute(host_id, &format!("ps -p {pid} -o etimes= 2>/dev/null"))
                    .await?;
                status.uptime_seconds = uptime.stdout.trim().parse().ok();
            }
        }

        Ok(status)
    }

    async fn startup_log_tail(&self, host_id: &str) -> String {
        match self
            .pool
            .execute(
                host_id,
                &format!("tail -n 20 {} 2>/dev/null", self.config.start_log),
            )
            .await
        {
            Ok(output) if !output.stdout.trim().is_empty() => {
                output.stdout.trim().chars().take(500).collect()
            }
            Ok(_) => String::from("process exited with no startup log"),
            Err(e) => {
                warn!("could not read startup log on {host_id}: {e:#}");
                format!("startup log unavailable: {e}")
            }
        }
    }
}

fn parent_dir(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) => String::from("/"),
        Some((parent, _)) => parent.to_string(),
        None => String::from("."),
    }
}
