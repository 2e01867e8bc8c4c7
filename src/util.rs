use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::warn;

/// Captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run a local command through the shell with a hard timeout.
///
/// A timeout kills the child and is returned as an error, never swallowed.
pub async fn run_command(command: &str, timeout: Duration) -> anyhow::Result<CommandOutput> {
    let future = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| {
            warn!("command timed out after {timeout:?}: {command}");
            anyhow::anyhow!("command timed out after {timeout:?}: {command}")
        })?
        .with_context(|| format!("failed to spawn command: {command}"))?;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Read lines appended to `path` since `offset` bytes.
///
/// Returns the new lines (at most `max_lines`) and the byte offset to resume
/// from. A file smaller than the stored offset is treated as rotated and read
/// from the start. A missing file yields no lines and offset 0.
pub async fn read_new_lines(
    path: &Path,
    offset: u64,
    max_lines: usize,
) -> anyhow::Result<(Vec<String>, u64)> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e).with_context(|| format!("failed to open {}", path.display())),
    };

    let len = file.metadata().await?.len();
    let mut position = if len < offset { 0 } else { offset };
    file.seek(std::io::SeekFrom::Start(position)).await?;

    let mut content = String::new();
    file.read_to_string(&mut content)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut lines = Vec::new();
    for line in content.split_inclusive('\n') {
        if lines.len() >= max_lines {
            break;
        }
        // A trailing partial line (no newline yet) is left for the next read.
        if !line.ends_with('\n') {
            break;
        }
        position += line.len() as u64;
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }

    Ok((lines, position))
}

/// Current byte length of a file, 0 when missing.
pub async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

pub fn safe_u64(value: &str) -> u64 {
    value.trim().parse().unwrap_or(0)
}
