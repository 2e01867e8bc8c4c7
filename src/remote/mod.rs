//! Remote execution: the transport seam and the connection pool.
//!
//! The pool and everything above it talk to hosts through the
//! [`RemoteTransport`] trait; the bundled implementation drives the system
//! OpenSSH client over a per-host control socket, so one real session is
//! reused across commands. This crate is deliberately not an SSH library -
//! tests swap in scripted transports through [`TransportFactory`].

pub mod pool;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::HostConfig;

/// Result of one remote command.
pub type ExecOutput = crate::util::CommandOutput;

/// One live session to one host.
///
/// Implementations must be cheap to liveness-check; the pool probes before
/// every reuse.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Run a command, bounded by `timeout`. A timeout is an error; it does
    /// not imply the session itself is dead.
    async fn exec(&self, command: &str, timeout: Duration) -> anyhow::Result<ExecOutput>;

    /// Upload a local file to a remote path.
    async fn upload(&self, local: &Path, remote: &str, timeout: Duration) -> anyhow::Result<()>;

    /// Cheap session liveness probe.
    async fn is_alive(&self) -> bool;

    /// Tear the session down. Idempotent.
    async fn close(&self);
}

/// Opens transports; injected into the pool so tests can script sessions.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        host: &HostConfig,
        timeout: Duration,
    ) -> anyhow::Result<Box<dyn RemoteTransport>>;
}

// ============================================================================
// OpenSSH transport
// ============================================================================

/// Factory for [`OpenSshTransport`] sessions.
pub struct OpenSshFactory;

#[async_trait]
impl TransportFactory for OpenSshFactory {
    async fn connect(
        &self,
        host: &HostConfig,
        timeout: Duration,
    ) -> anyhow::Result<Box<dyn RemoteTransport>> {
        let transport = OpenSshTransport::connect(host, timeout).await?;
        Ok(Box::new(transport))
    }
}

/// Session over the system `ssh` binary with a `ControlMaster` socket.
///
/// The master connection is established once; subsequent commands multiplex
/// over the control socket, which makes per-command startup cheap and gives
/// `-O check` as the liveness probe.
pub struct OpenSshTransport {
    destination: String,
    control_path: PathBuf,
    key_path: Option<PathBuf>,
    port: u16,
}

impl OpenSshTransport {
    pub async fn connect(host: &HostConfig, timeout: Duration) -> anyhow::Result<Self> {
        let control_path = std::env::temp_dir().join(format!("arrayguard-{}.ctl", host.id));

        let transport = Self {
            destination: format!("{}@{}", host.username, host.addr),
            control_path,
            key_path: host.key_path.clone(),
            port: host.port,
        };

        // Establish the master connection.
        let mut args = transport.base_args();
        args.push("-o".into());
        args.push(format!("ConnectTimeout={}", timeout.as_secs().max(1)));
        args.push(transport.destination.clone());
        args.push("true".into());

        let output = run_ssh_binary("ssh", &args, timeout + Duration::from_secs(2)).await?;
        if !output.success() {
            anyhow::bail!(
                "ssh master connection to {} failed: {}",
                transport.destination,
                output.stderr.trim()
            );
        }

        debug!("ssh session established: {}", transport.destination);
        Ok(transport)
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=accept-new".into(),
            "-o".into(),
            "ControlMaster=auto".into(),
            "-o".into(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".into(),
            "ControlPersist=600".into(),
            "-p".into(),
            self.port.to_string(),
        ];

        if let Some(key) = &self.key_path {
            args.push("-i".into());
            args.push(key.display().to_string());
        }

        args
    }
}

#[async_trait]
impl RemoteTransport for OpenSshTransport {
    async fn exec(&self, command: &str, timeout: Duration) -> anyhow::Result<ExecOutput> {
        let mut args = self.base_args();
        args.push(self.destination.clone());
        args.push("--".into());
        args.push(command.into());

        run_ssh_binary("ssh", &args, timeout).await
    }

    async fn upload(&self, local: &Path, remote: &str, timeout: Duration) -> anyhow::Result<()> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ControlPath={}", self.control_path.display()),
            "-P".into(),
            self.port.to_string(),
        ];
        if let Some(key) = &self.key_path {
            args.push("-i".into());
            args.push(key.display().to_string());
        }
        args.push(local.display().to_string());
        args.push(format!("{}:{remote}", self.destination));

        let output = run_ssh_binary("scp", &args, timeout).await?;
        if !output.success() {
            anyhow::bail!("upload failed: {}", output.stderr.trim());
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        let mut args = vec![
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-O".into(),
            "check".into(),
            self.destination.clone(),
        ];
        if let Some(key) = &self.key_path {
            args.push("-i".into());
            args.push(key.display().to_string());
        }

        matches!(
            run_ssh_binary("ssh", &args, Duration::from_secs(5)).await,
            Ok(output) if output.success()
        )
    }

    async fn close(&self) {
        let args = vec![
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-O".into(),
            "exit".into(),
            self.destination.clone(),
        ];

        if let Err(e) = run_ssh_binary("ssh", &args, Duration::from_secs(5)).await {
            warn!("closing ssh session to {} failed: {e:#}", self.destination);
        }
    }
}

async fn run_ssh_binary(
    binary: &str,
    args: &[String],
    timeout: Duration,
) -> anyhow::Result<ExecOutput> {
    let future = tokio::process::Command::new(binary)
        .args(args)
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| anyhow::anyhow!("{binary} timed out after {timeout:?}"))?
        .with_context(|| format!("failed to spawn {binary}"))?;

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
