//! Cumulative counter growth detection (port error counters).
//!
//! Reads counter files under a sysfs-style statistics tree and alerts when a
//! counter grows by at least the configured threshold between two checks.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::warn;

use crate::config::{ObserverConfig, StrategyConfig};
use crate::{AlertLevel, ObserverResult};

use super::Observer;

pub struct CounterDeltaObserver {
    name: String,
    interval_secs: u64,
    threshold: u64,
    ports: Vec<String>,
    statistics_root: PathBuf,
    counters: Vec<String>,

    /// Last seen value per (port, counter). Updated unconditionally on every
    /// read so deltas never accumulate across checks.
    last_values: HashMap<(String, String), u64>,
}

impl CounterDeltaObserver {
    pub fn from_config(config: &ObserverConfig) -> anyhow::Result<Self> {
        let StrategyConfig::CounterDelta {
            threshold,
            ports,
            statistics_root,
            counters,
        } = &config.strategy
        else {
            anyhow::bail!("not a counter_delta config");
        };

        Ok(Self {
            name: config.name.clone(),
            interval_secs: config.interval_secs,
            threshold: *threshold,
            ports: ports.clone(),
            statistics_root: statistics_root.clone(),
            counters: counters.clone(),
            last_values: HashMap::new(),
        })
    }

    /// Ports to check: configured list, or everything under the statistics
    /// root except loopback and virtual interfaces.
    async fn ports_to_check(&self) -> Vec<String> {
        if !self.ports.is_empty() {
            return self.ports.clone();
        }

        let mut ports = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.statistics_root).await else {
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

    async fn read_counters(&self, port: &str) -> HashMap<String, u64> {
        let mut values = HashMap::new();
        let stats_dir = self.statistics_root.join(port).join("statistics");

        for counter in &self.counters {
            match tokio::fs::read_to_string(stats_dir.join(counter)).await {
                Ok(raw) => {
                    values.insert(counter.clone(), crate::util::safe_u64(&raw));
                }
                Err(_) => continue,
            }
        }

        values
    }
}

#[async_trait]
impl Observer for CounterDeltaObserver {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    async fn check(&mut self) -> anyhow::Result<Option<ObserverResult>> {
        let mut grown: Vec<String> = Vec::new();
        let mut current_values = serde_json::Map::new();

        for port in self.ports_to_check().await {
            let counters = self.read_counters(&port).await;

            for (counter, value) in counters {
                let key = (port.clone(), counter.clone());
                let previous = self.last_values.insert(key, value);

                // First observation of a key establishes the baseline.
                let Some(previous) = previous else { continue };

                // Counter wrap or reset - skip, baseline already updated.
                if value < previous {
                    continue;
                }

                let delta = value - previous;
                if delta >= self.threshold && delta > 0 {
                    warn!("[{}] {port}.{counter} +{delta}", self.name);
                    grown.push(format!("{port}.{counter} +{delta}"));
                }

                current_values.insert(format!("{port}.{counter}"), value.into());
            }
        }

        if grown.is_empty() {
            return Ok(None);
        }

        let shown = grown.iter().take(3).cloned().collect::<Vec<_>>().join("; ");
        let message = if grown.len() > 3 {
            format!("counter growth: {shown} ({} total)", grown.len())
        } else {
            format!("counter growth: {shown}")
        };

        Ok(Some(
            ObserverResult::new(&self.name, AlertLevel::Warning, message).with_details(
                serde_json::json!({
                    "grown": grown,
                    "counters": current_values,
                }),
            ),
        ))
    }
}
