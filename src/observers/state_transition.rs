//! Link state change detection (carrier/operstate per port).
//!
//! Alerts only on a change from the previously recorded state, never on
//! steady state. Whitelisted ports never alert regardless of transition.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{ObserverConfig, StrategyConfig};
use crate::{AlertLevel, ObserverResult};

use super::Observer;

#[derive(Debug, Clone, PartialEq, Eq)]
struct PortState {
    carrier: String,
    operstate: String,
    speed: Option<u64>,
}

pub struct StateTransitionObserver {
    name: String,
    interval_secs: u64,
    ports: Vec<String>,
    whitelist: HashSet<String>,
    sysfs_root: PathBuf,

    last_states: HashMap<String, PortState>,
    first_run: bool,
}

impl StateTransitionObserver {
    pub fn from_config(config: &ObserverConfig) -> anyhow::Result<Self> {
        let StrategyConfig::StateTransition {
            ports,
            whitelist,
            sysfs_root,
        } = &config.strategy
        else {
            anyhow::bail!("not a state_transition config");
        };

        Ok(Self {
            name: config.name.clone(),
            interval_secs: config.interval_secs,
            ports: ports.clone(),
            whitelist: whitelist.iter().cloned().collect(),
            sysfs_root: sysfs_root.clone(),
            last_states: HashMap::new(),
            first_run: true,
        })
    }

    async fn ports_to_check(&self) -> Vec<String> {
        if !self.ports.is_empty() {
            return self.ports.clone();
        }

        let mut ports = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.sysfs_root).await else {
            return ports;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "lo" || name.starts_with("veth") || name.starts_with("docker") {
                continue;
            }
            ports.push(name);
        }

        ports.sort();
        ports
    }

    async fn read_state(&self, port: &str) -> Option<PortState> {
        let port_dir = self.sysfs_root.join(port);

        let carrier = tokio::fs::read_to_string(port_dir.join("carrier"))
            .await
            .ok()?;
        let operstate = tokio::fs::read_to_string(port_dir.join("operstate"))
            .await
            .unwrap_or_else(|_| String::from("unknown"));
        let speed = tokio::fs::read_to_string(port_dir.join("speed"))
            .await
            .ok()
            .and_then(|s| s.trim().parse().ok());

        Some(PortState {
            carrier: carrier.trim().to_string(),
            operstate: operstate.trim().to_string(),
            speed,
        })
    }

    fn detect_changes(&self, port: &str, last: &PortState, current: &PortState) -> Vec<String> {
        let mut changes = Vec::new();

        if last.carrier != current.carrier {
            if current.carrier == "0" {
                warn!("[{}] {port} link DOWN", self.name);
                changes.push(format!("{port} link DOWN"));
            } else if current.carrier == "1" {
                info!("[{}] {port} link UP", self.name);
                changes.push(format!("{port} link UP"));
            }
        }

        if last.operstate != current.operstate
            && matches!(
                current.operstate.as_str(),
                "down" | "notpresent" | "lowerlayerdown"
            )
        {
            changes.push(format!(
                "{port} operstate: {} -> {}",
                last.operstate, current.operstate
            ));
        }

        // A speed downgrade on a live link usually means renegotiation.
        if let (Some(old), Some(new)) = (last.speed, current.speed)
            && new < old
        {
            changes.push(format!("{port} speed dropped: {old} -> {new} Mbps"));
        }

        changes
    }
}

#[async_trait]
impl Observer for StateTransitionObserver {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    async fn check(&mut self) -> anyhow::Result<Option<ObserverResult>> {
        let mut alerts: Vec<String> = Vec::new();
        let mut states = serde_json::Map::new();

        for port in self.ports_to_check().await {
            let Some(current) = self.read_state(&port).await else {
                continue;
            };

            states.insert(
                port.clone(),
                serde_json::json!({
                    "carrier": current.carrier,
                    "operstate": current.operstate,
                    "speed": current.speed,
                }),
            );

            let whitelisted = self.whitelist.contains(&port);

            if let Some(last) = self.last_states.get(&port)
                && !self.first_run
                && !whitelisted
            {
                alerts.extend(self.detect_changes(&port, last, &current));
            }

            self.last_states.insert(port, current);
        }

        self.first_run = false;

        if alerts.is_empty() {
            return Ok(None);
        }

        let shown = alerts.iter().take(3).cloned().collect::<Vec<_>>().join("; ");
        let message = if alerts.len() > 3 {
            format!("link state changed: {shown} ({} total)", alerts.len())
        } else {
            format!("link state changed: {shown}")
        };

        Ok(Some(
            ObserverResult::new(&self.name, AlertLevel::Warning, message).with_details(
                serde_json::json!({
                    "changes": alerts,
                    "current_states": states,
                }),
            ),
        ))
    }
}
