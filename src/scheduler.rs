//! Cooperative observer scheduler.
//!
//! Single task, observers run one at a time. Each observer carries its own
//! next-due instant; every pass runs whatever is due and reschedules it at
//! `now + interval`. A failing or overrunning observer degrades to "no result
//! this tick" - it never halts the loop or affects other observers.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AgentConfig;
use crate::observers::Observer;
use crate::reporter::Reporter;

/// Longest the loop will sleep even with nothing due (keeps shutdown and the
/// memory self-check responsive).
const MAX_IDLE_SLEEP: Duration = Duration::from_secs(60);

const MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(60);

struct Slot {
    observer: Box<dyn Observer>,
    next_due: Instant,
}

pub struct Scheduler {
    slots: Vec<Slot>,
    reporter: Reporter,
    /// Budget for one observer check; derived from the configured subprocess
    /// timeout so a stuck source cannot stall the loop indefinitely.
    check_budget: Duration,
    max_memory_mb: Option<u64>,
}

impl Scheduler {
    pub fn new(config: &AgentConfig, reporter: Reporter) -> Self {
        Self {
            slots: Vec::new(),
            reporter,
            check_budget: Duration::from_secs(config.subprocess_timeout_secs.saturating_add(5)),
            max_memory_mb: config.max_memory_mb,
        }
    }

    /// Register an observer; it becomes due immediately.
    pub fn register(&mut self, observer: Box<dyn Observer>) {
        debug!(
            "registering observer {} (interval {}s)",
            observer.name(),
            observer.interval_secs()
        );
        self.slots.push(Slot {
            observer,
            next_due: Instant::now(),
        });
    }

    pub fn observer_count(&self) -> usize {
        self.slots.len()
    }

    /// Run until the shutdown signal flips.
    #[instrument(skip_all)]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler started with {} observers", self.slots.len());

        let mut last_memory_check = Instant::now();

        loop {
            let wakeup = self.next_wakeup();

            tokio::select! {
                _ = tokio::time::sleep_until(wakeup) => {
                    self.run_due_observers().await;

                    if last_memory_check.elapsed() >= MEMORY_CHECK_INTERVAL {
                        last_memory_check = Instant::now();
                        self.check_memory_budget();
                    }
                }

                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("scheduler stopping");
                        break;
                    }
                }
            }
        }

        info!("scheduler stopped");
    }

    fn next_wakeup(&self) -> Instant {
        let idle_cap = Instant::now() + MAX_IDLE_SLEEP;
        self.slots
            .iter()
            .map(|slot| slot.next_due)
            .min()
            .map_or(idle_cap, |due| due.min(idle_cap))
    }

    async fn run_due_observers(&mut self) {
        let now = Instant::now();
        let check_budget = self.check_budget;
        let Self {
            slots, reporter, ..
        } = self;

        for slot in slots.iter_mut() {
            if slot.next_due > now {
                continue;
            }

            let name = slot.observer.name().to_string();

            match tokio::time::timeout(check_budget, slot.observer.check()).await {
                Ok(Ok(Some(result))) => {
                    reporter.report(&result).await;
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    error!("observer {name} check failed: {e:#}");
                }
                Err(_) => {
                    error!("observer {name} exceeded check budget {check_budget:?}");
                }
            }

            slot.next_due = Instant::now() + Duration::from_secs(slot.observer.interval_secs());
        }
    }

    /// Soft self-check against the configured memory ceiling.
    fn check_memory_budget(&self) {
        let Some(limit_mb) = self.max_memory_mb else {
            return;
        };

        let mut system = sysinfo::System::new();
        let pid = sysinfo::get_current_pid().ok();
        if let Some(pid) = pid {
            system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
            if let Some(process) = system.process(pid) {
                let used_mb = process.memory() / 1024 / 1024;
                if used_mb > limit_mb {
                    warn!("agent memory {used_mb}MB exceeds configured budget {limit_mb}MB");
                }
            }
        }
    }
}
