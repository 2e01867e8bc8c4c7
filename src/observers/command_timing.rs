//! Command response-time probe.
//!
//! Runs each configured command under a hard timeout and alerts when the
//! wall-clock duration exceeds the configured bound. A command that times out
//! or fails is reported as a failed probe, not silently swallowed.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::warn;

use crate::config::{ObserverConfig, StrategyConfig};
use crate::util::run_command;
use crate::{AlertLevel, ObserverResult};

use super::Observer;

pub struct CommandTimingObserver {
    name: String,
    interval_secs: u64,
    commands: Vec<String>,
    max_duration: Duration,
    exec_timeout: Duration,
}

impl CommandTimingObserver {
    pub fn from_config(config: &ObserverConfig) -> anyhow::Result<Self> {
        let StrategyConfig::CommandTiming {
            commands,
            max_duration_secs,
            exec_timeout_secs,
        } = &config.strategy
        else {
            anyhow::bail!("not a command_timing config");
        };

        if commands.is_empty() {
            anyhow::bail!("command_timing requires at least one command");
        }

        Ok(Self {
            name: config.name.clone(),
            interval_secs: config.interval_secs,
            commands: commands.clone(),
            max_duration: Duration::from_secs_f64(*max_duration_secs),
            exec_timeout: Duration::from_secs(*exec_timeout_secs),
        })
    }
}

#[async_trait]
impl Observer for CommandTimingObserver {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    async fn check(&mut self) -> anyhow::Result<Option<ObserverResult>> {
        let mut slow: Vec<String> = Vec::new();
        let mut results = Vec::new();

        for command in &self.commands {
            let started = Instant::now();
            let outcome = run_command(command, self.exec_timeout).await;
            let elapsed = started.elapsed();

            match outcome {
                Ok(output) if output.success() => {
                    let exceeded = elapsed > self.max_duration;
                    if exceeded {
                        warn!(
                            "[{}] {command} took {:.3}s (bound: {:.3}s)",
                            self.name,
                            elapsed.as_secs_f64(),
                            self.max_duration.as_secs_f64()
                        );
                        slow.push(format!("{command} took {:.3}s", elapsed.as_secs_f64()));
                    }
                    results.push(serde_json::json!({
                        "command": command,
                        "elapsed_secs": elapsed.as_secs_f64(),
                        "exceeded": exceeded,
                    }));
                }
                Ok(output) => {
                    // Nonzero exit is a failed probe.
                    slow.push(format!("{command} failed (exit {})", output.exit_code));
                    results.push(serde_json::json!({
                        "command": command,
                        "elapsed_secs": elapsed.as_secs_f64(),
                        "exit_code": output.exit_code,
                        "failed": true,
                    }));
                }
                Err(e) => {
                    // Timeout or spawn failure counts as a failure too.
                    warn!("[{}] {command}: {e:#}", self.name);
                    slow.push(format!("{command} failed ({e})"));
                    results.push(serde_json::json!({
                        "command": command,
                        "error": e.to_string(),
                        "failed": true,
                    }));
                }
            }
        }

        if slow.is_empty() {
            return Ok(None);
        }

        let message = format!("command response: {}", slow.join(", "));

        Ok(Some(
            ObserverResult::new(&self.name, AlertLevel::Error, message).with_details(
                serde_json::json!({
                    "bound_secs": self.max_duration.as_secs_f64(),
                    "results": results,
                }),
            ),
        ))
    }
}
