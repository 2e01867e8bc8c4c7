//! Observer strategies polled by the agent scheduler.
//!
//! Each observer owns its mutable state (last-seen counters, log offsets,
//! sliding windows) - nothing is shared between instances or reachable as
//! module state. An observer is constructed from its [`ObserverConfig`] at
//! registration time and polled on its own interval.

pub mod command_timing;
pub mod counter_delta;
pub mod log_scan;
pub mod state_transition;
pub mod windowed;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::ObserverResult;
use crate::config::{ObserverConfig, StrategyConfig};

/// A single detection strategy.
///
/// `check` returns `Ok(None)` for "nothing to report this tick"; an `Err` is
/// caught by the scheduler, logged, and never halts the loop.
#[async_trait]
pub trait Observer: Send {
    fn name(&self) -> &str;

    /// Seconds between checks of this observer.
    fn interval_secs(&self) -> u64;

    async fn check(&mut self) -> anyhow::Result<Option<ObserverResult>>;
}

/// Build observer instances from configuration.
///
/// Disabled entries are skipped; an entry that fails to validate (e.g. a bad
/// regex) is logged and skipped rather than failing the whole agent.
pub fn build_observers(configs: &[ObserverConfig]) -> Vec<Box<dyn Observer>> {
    let mut observers: Vec<Box<dyn Observer>> = Vec::new();

    for config in configs {
        if !config.enabled {
            info!("observer {} disabled, skipping", config.name);
            continue;
        }

        let built: anyhow::Result<Box<dyn Observer>> = match &config.strategy {
            StrategyConfig::CounterDelta { .. } => {
                counter_delta::CounterDeltaObserver::from_config(config)
                    .map(|o| Box::new(o) as Box<dyn Observer>)
            }
            StrategyConfig::StateTransition { .. } => {
                state_transition::StateTransitionObserver::from_config(config)
                    .map(|o| Box::new(o) as Box<dyn Observer>)
            }
            StrategyConfig::LogScan { .. } => log_scan::LogScanObserver::from_config(config)
                .map(|o| Box::new(o) as Box<dyn Observer>),
            StrategyConfig::Windowed { .. } => windowed::WindowedObserver::from_config(config)
                .map(|o| Box::new(o) as Box<dyn Observer>),
            StrategyConfig::CommandTiming { .. } => {
                command_timing::CommandTimingObserver::from_config(config)
                    .map(|o| Box::new(o) as Box<dyn Observer>)
            }
        };

        match built {
            Ok(observer) => {
                info!(
                    "observer {} registered, interval: {}s",
                    config.name, config.interval_secs
                );
                observers.push(observer);
            }
            Err(e) => {
                warn!("failed to initialize observer {}: {e:#}", config.name);
            }
        }
    }

    observers
}
