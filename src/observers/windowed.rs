//! Sliding-window trigger over a sampled host metric.
//!
//! Covers memory-growth and CPU-saturation detection: each check pushes a
//! fresh sample into a fixed-capacity window and measures the trailing run of
//! samples satisfying the trigger predicate. Once the run reaches the
//! required length the observer turns sticky and re-alerts on every check
//! until the condition resolves.

use async_trait::async_trait;
use sysinfo::System;
use tracing::{error, info};

use crate::config::{ObserverConfig, SampleSource, StrategyConfig, WindowPredicate};
use crate::window::SlidingWindow;
use crate::{AlertLevel, ObserverResult};

use super::Observer;

/// Source of one metric sample. Split out so tests can script sequences.
pub trait Sampler: Send {
    fn sample(&mut self) -> anyhow::Result<f64>;
}

/// Samples via sysinfo, refreshing only what the source needs.
struct SystemSampler {
    system: System,
    source: SampleSource,
}

impl Sampler for SystemSampler {
    fn sample(&mut self) -> anyhow::Result<f64> {
        match self.source {
            SampleSource::MemoryUsedMb => {
                self.system.refresh_memory();
                Ok(self.system.used_memory() as f64 / 1024.0 / 1024.0)
            }
            SampleSource::CpuAveragePercent => {
                self.system.refresh_cpu_usage();
                let cpus = self.system.cpus();
                if cpus.is_empty() {
                    anyhow::bail!("no cpus reported");
                }
                let sum: f32 = cpus.iter().map(|cpu| cpu.cpu_usage()).sum();
                Ok((sum / cpus.len() as f32) as f64)
            }
        }
    }
}

pub struct WindowedObserver {
    name: String,
    interval_secs: u64,
    predicate: WindowPredicate,
    run_length: usize,
    level: AlertLevel,
    unit: &'static str,

    sampler: Box<dyn Sampler>,
    window: SlidingWindow<f64>,
    sticky: bool,
}

impl WindowedObserver {
    pub fn from_config(config: &ObserverConfig) -> anyhow::Result<Self> {
        let StrategyConfig::Windowed {
            source,
            predicate,
            run_length,
            level,
        } = &config.strategy
        else {
            anyhow::bail!("not a windowed config");
        };

        let unit = match source {
            SampleSource::MemoryUsedMb => "MB",
            SampleSource::CpuAveragePercent => "%",
        };

        Ok(Self::with_sampler(
            config.name.clone(),
            config.interval_secs,
            *predicate,
            *run_length,
            *level,
            unit,
            Box::new(SystemSampler {
                system: System::new(),
                source: *source,
            }),
        ))
    }

    pub fn with_sampler(
        name: String,
        interval_secs: u64,
        predicate: WindowPredicate,
        run_length: usize,
        level: AlertLevel,
        unit: &'static str,
        sampler: Box<dyn Sampler>,
    ) -> Self {
        Self {
            name,
            interval_secs,
            predicate,
            run_length,
            level,
            unit,
            sampler,
            window: SlidingWindow::new(run_length.max(1)),
            sticky: false,
        }
    }

    fn current_run(&self) -> usize {
        match self.predicate {
            WindowPredicate::StrictlyIncreasing => self.window.trailing_pairwise_run(|a, b| b > a),
            WindowPredicate::AtLeast { threshold } => self.window.trailing_run(|&v| v >= threshold),
        }
    }

    fn describe_condition(&self) -> String {
        match self.predicate {
            WindowPredicate::StrictlyIncreasing => {
                format!("{} consecutive increasing samples", self.run_length)
            }
            WindowPredicate::AtLeast { threshold } => format!(
                "{} consecutive samples >= {threshold}{}",
                self.run_length, self.unit
            ),
        }
    }
}

#[async_trait]
impl Observer for WindowedObserver {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    async fn check(&mut self) -> anyhow::Result<Option<ObserverResult>> {
        let value = self.sampler.sample()?;
        self.window.push(value);

        let run = self.current_run();
        let details = serde_json::json!({
            "current": value,
            "run": run,
            "required": self.run_length,
            "window": self.window.iter().copied().collect::<Vec<f64>>(),
        });

        if run >= self.run_length {
            if !self.sticky {
                error!(
                    "[{}] {}: triggered (current: {value:.1}{})",
                    self.name,
                    self.describe_condition(),
                    self.unit
                );
            }
            self.sticky = true;

            let message = format!(
                "{} (current: {value:.1}{})",
                self.describe_condition(),
                self.unit
            );

            return Ok(Some(
                ObserverResult::new(&self.name, self.level, message)
                    .with_details(details)
                    .sticky(),
            ));
        }

        // Condition resolved: drop stickiness and note the recovery once.
        if self.sticky {
            self.sticky = false;
            info!("[{}] condition resolved (current: {value:.1}{})", self.name, self.unit);

            return Ok(Some(
                ObserverResult::new(
                    &self.name,
                    AlertLevel::Info,
                    format!("condition resolved (current: {value:.1}{})", self.unit),
                )
                .with_details(details),
            ));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedSampler {
        values: Vec<f64>,
        index: usize,
    }

    impl Sampler for ScriptedSampler {
        fn sample(&mut self) -> anyhow::Result<f64> {
            let value = self.values[self.index.min(self.values.len() - 1)];
            self.index += 1;
            Ok(value)
        }
    }

    fn cpu_observer(values: &[f64], run_length: usize) -> WindowedObserver {
        WindowedObserver::with_sampler(
            "cpu_saturation".into(),
            30,
            WindowPredicate::AtLeast { threshold: 90.0 },
            run_length,
            AlertLevel::Error,
            "%",
            Box::new(ScriptedSampler {
                values: values.to_vec(),
                index: 0,
            }),
        )
    }

    #[tokio::test]
    async fn test_sticky_enters_exactly_at_required_run() {
        let samples = [95.0, 96.0, 97.0, 95.0, 94.0, 99.0, 98.0];
        let mut obs = cpu_observer(&samples, 6);

        // Samples 1-5: run below 6, no alert.
        for _ in 0..5 {
            assert!(obs.check().await.unwrap().is_none());
        }

        // 6th qualifying sample in a row: sticky alert.
        let result = obs.check().await.unwrap().unwrap();
        assert!(result.sticky);
        assert_eq!(result.level, AlertLevel::Error);

        // And on every check thereafter while the run continues.
        let result = obs.check().await.unwrap().unwrap();
        assert!(result.sticky);
    }

    #[tokio::test]
    async fn test_run_broken_at_five_never_triggers() {
        let samples = [95.0, 96.0, 97.0, 95.0, 94.0, 50.0, 99.0, 98.0];
        let mut obs = cpu_observer(&samples, 6);

        for _ in 0..samples.len() {
            let result = obs.check().await.unwrap();
            if let Some(r) = result {
                panic!("should never trigger, got: {}", r.message);
            }
        }
    }

    #[tokio::test]
    async fn test_sticky_clears_when_condition_resolves() {
        let samples = [95.0, 96.0, 97.0, 40.0, 95.0];
        let mut obs = cpu_observer(&samples, 3);

        assert!(obs.check().await.unwrap().is_none());
        assert!(obs.check().await.unwrap().is_none());

        let result = obs.check().await.unwrap().unwrap();
        assert!(result.sticky);

        // Drop below threshold: one non-sticky recovery notice.
        let result = obs.check().await.unwrap().unwrap();
        assert!(!result.sticky);
        assert_eq!(result.level, AlertLevel::Info);
        assert!(result.message.contains("resolved"));

        // A single qualifying sample afterwards is not enough to re-trigger.
        assert!(obs.check().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_strictly_increasing_memory_growth() {
        let samples = [1000.0, 1010.0, 1020.0, 1030.0, 1025.0];
        let mut obs = WindowedObserver::with_sampler(
            "memory_growth".into(),
            30,
            WindowPredicate::StrictlyIncreasing,
            4,
            AlertLevel::Error,
            "MB",
            Box::new(ScriptedSampler {
                values: samples.to_vec(),
                index: 0,
            }),
        );

        for _ in 0..3 {
            assert!(obs.check().await.unwrap().is_none());
        }

        // 4 samples, each greater than its predecessor.
        let result = obs.check().await.unwrap().unwrap();
        assert!(result.sticky);
        assert!(result.message.contains("increasing"));

        // Growth stops: recovery notice.
        let result = obs.check().await.unwrap().unwrap();
        assert!(!result.sticky);
    }

    #[tokio::test]
    async fn test_sampler_error_propagates() {
        struct FailingSampler;
        impl Sampler for FailingSampler {
            fn sample(&mut self) -> anyhow::Result<f64> {
                anyhow::bail!("source unavailable")
            }
        }

        let mut obs = WindowedObserver::with_sampler(
            "memory_growth".into(),
            30,
            WindowPredicate::StrictlyIncreasing,
            4,
            AlertLevel::Error,
            "MB",
            Box::new(FailingSampler),
        );

        // The scheduler catches this; the observer just reports it.
        assert!(obs.check().await.is_err());
    }
}
