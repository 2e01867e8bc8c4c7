//! Incremental alert synchronization.
//!
//! Pulls newly appended alert-log lines from each host without re-reading
//! the whole file: the remote line count is queried cheaply, only the delta
//! beyond the stored position is fetched, and every candidate alert passes a
//! hash-based in-memory dedup before insertion. The stored position advances
//! only after the inserts succeed, so a failed batch is re-fetched rather
//! than lost. Hosts may also push envelopes directly through
//! [`SyncEngine::ingest_push`]; both paths share the same dedup.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::SyncConfig;
use crate::remote::pool::ConnectionPool;
use crate::storage::AlertStore;
use crate::storage::schema::AlertRow;
use crate::{AlertEnvelope, AlertEvent};

/// Per-host sync bookkeeping. `position` is monotonically non-decreasing
/// except on detected truncation, where it resets to 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncState {
    pub position: u64,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Outcome of one sync pass against one host.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub new_alerts: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub position: u64,
    pub truncated: bool,
}

/// Bounded FIFO set of recently seen content hashes.
struct DedupCache {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupCache {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record a hash. Returns false when it was already present.
    fn insert(&mut self, hash: &str) -> bool {
        if self.seen.contains(hash) {
            return false;
        }

        if self.order.len() == self.capacity
            && let Some(evicted) = self.order.pop_front()
        {
            self.seen.remove(&evicted);
        }

        self.seen.insert(hash.to_string());
        self.order.push_back(hash.to_string());
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

pub struct SyncEngine {
    pool: ConnectionPool,
    store: Arc<dyn AlertStore>,
    alert_tx: broadcast::Sender<AlertEvent>,
    config: SyncConfig,
    positions: Mutex<HashMap<String, SyncState>>,
    dedup: Mutex<DedupCache>,
}

impl SyncEngine {
    pub fn new(
        pool: ConnectionPool,
        store: Arc<dyn AlertStore>,
        alert_tx: broadcast::Sender<AlertEvent>,
        config: SyncConfig,
    ) -> Self {
        let dedup = DedupCache::new(config.dedup_capacity);
        Self {
            pool,
            store,
            alert_tx,
            config,
            positions: Mutex::new(HashMap::new()),
            dedup: Mutex::new(dedup),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.alert_tx.subscribe()
    }

    pub async fn position(&self, host_id: &str) -> u64 {
        self.positions
            .lock()
            .await
            .get(host_id)
            .map_or(0, |s| s.position)
    }

    /// Pull new alert lines from one host and ingest them.
    #[instrument(skip(self), fields(host = %host_id))]
    pub async fn sync_host(&self, host_id: &str) -> anyhow::Result<SyncReport> {
        let log_path = &self.config.alert_log_path;

        // Step 1: cheap remote line count.
        let count_output = self
            .pool
            .execute(host_id, &format!("wc -l < {log_path} 2>/dev/null"))
            .await?;

        if !count_output.success() {
            // No alert log yet - nothing to ingest.
            debug!("no alert log on {host_id} yet");
            self.touch(host_id, None).await;
            return Ok(SyncReport::default());
        }

        let total: u64 = count_output.stdout.trim().parse().unwrap_or(0);

        let mut position = self.position(host_id).await;
        let mut truncated = false;

        // Truncation/rotation: the file shrank, treat it as fresh.
        if total < position {
            info!("{host_id}: alert log truncated ({total} < {position}), full resync");
            position = 0;
            truncated = true;
        }

        if total == position {
            self.touch(host_id, Some(position)).await;
            return Ok(SyncReport {
                position,
                truncated,
                ..SyncReport::default()
            });
        }

        // Step 2: fetch only the delta, capped per pass. Position advances by
        // what was actually read, so a capped pass leaves the rest for the
        // next one.
        let available = total - position;
        let read_count = available.min(self.config.max_lines_per_sync);
        if read_count < available {
            info!(
                "{host_id}: capping sync to {read_count} of {available} new lines"
            );
        }

        let start = position + 1;
        let end = position + read_count;
        let delta_output = self
            .pool
            .execute(
                host_id,
                &format!("sed -n '{start},{end}p' {log_path} 2>/dev/null"),
            )
            .await?;

        if !delta_output.success() {
            anyhow::bail!(
                "fetching alert delta from {host_id} failed: {}",
                delta_output.stderr.trim()
            );
        }

        // Step 3: parse, dedup, insert, then advance the position.
        let (envelopes, malformed) = parse_alert_lines(&delta_output.stdout);
        if malformed > 0 {
            warn!("{host_id}: skipped {malformed} malformed alert lines");
        }

        let (inserted, duplicates) = self.ingest(host_id, envelopes).await?;

        let new_position = position + read_count;
        self.touch(host_id, Some(new_position)).await;

        if inserted > 0 {
            info!("{host_id}: synced {inserted} new alerts (position {new_position})");
        }

        Ok(SyncReport {
            new_alerts: inserted,
            duplicates,
            malformed,
            position: new_position,
            truncated,
        })
    }

    /// Push-based ingestion entry point: same hash dedup as pull sync.
    #[instrument(skip(self, envelopes), fields(host = %host_id, count = envelopes.len()))]
    pub async fn ingest_push(
        &self,
        host_id: &str,
        envelopes: Vec<AlertEnvelope>,
    ) -> anyhow::Result<SyncReport> {
        let (inserted, duplicates) = self.ingest(host_id, envelopes).await?;
        Ok(SyncReport {
            new_alerts: inserted,
            duplicates,
            ..SyncReport::default()
        })
    }

    /// Shared dedup + insert + broadcast path.
    async fn ingest(
        &self,
        host_id: &str,
        envelopes: Vec<AlertEnvelope>,
    ) -> anyhow::Result<(usize, usize)> {
        let mut fresh: Vec<AlertRow> = Vec::new();
        let mut duplicates = 0usize;

        {
            let mut dedup = self.dedup.lock().await;
            for envelope in &envelopes {
                let row = AlertRow::from_envelope(host_id, envelope);
                if dedup.insert(&row.content_hash) {
                    fresh.push(row);
                } else {
                    duplicates += 1;
                }
            }
            trace!("dedup cache holds {} hashes", dedup.len());
        }

        if fresh.is_empty() {
            return Ok((0, duplicates));
        }

        let inserted = self
            .store
            .insert_batch(fresh.clone())
            .await
            .map_err(|e| anyhow::anyhow!("storing alerts for {host_id} failed: {e}"))?;

        // Broadcast after the store accepted the batch. No subscribers is
        // fine - the store remains the source of truth.
        for row in &fresh {
            let _ = self.alert_tx.send(AlertEvent {
                host_id: row.host_id.clone(),
                envelope: row.envelope(),
            });
        }

        Ok((inserted, duplicates))
    }

    async fn touch(&self, host_id: &str, position: Option<u64>) {
        let mut positions = self.positions.lock().await;
        let state = positions.entry(host_id.to_string()).or_default();
        if let Some(position) = position {
            state.position = position;
        }
        state.last_sync = Some(Utc::now());
    }

    /// Periodic sync over every pooled host. Per-host failures are contained
    /// and reported as data; one unreachable host never stops the loop.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = std::time::Duration::from_secs(self.config.interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("sync engine started (interval {interval:?})");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for host_id in self.pool.host_ids().await {
                        if let Err(e) = self.sync_host(&host_id).await {
                            warn!("sync of {host_id} failed: {e:#}");
                        }
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("sync engine stopping");
                        break;
                    }
                }
            }
        }
    }
}

/// Parse JSON-lines alert content; malformed lines are counted, not fatal.
fn parse_alert_lines(content: &str) -> (Vec<AlertEnvelope>, usize) {
    let mut envelopes = Vec::new();
    let mut malformed = 0usize;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<AlertEnvelope>(line) {
            Ok(envelope) => envelopes.push(envelope),
            Err(_) => malformed += 1,
        }
    }

    (envelopes, malformed)
}
