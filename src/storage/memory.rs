//! In-memory alert store (no persistence).
//!
//! Ring buffer with a fixed capacity: useful for tests, and the default when
//! no persistent backend is configured. When the buffer is full the oldest
//! alerts are evicted, their hashes with them.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::backend::{AlertStore, HealthStatus};
use super::error::StorageResult;
use super::schema::AlertRow;

/// Maximum alerts kept in memory.
const DEFAULT_CAPACITY: usize = 10_000;

struct Inner {
    alerts: VecDeque<AlertRow>,
    hashes: HashSet<String>,
}

pub struct MemoryStore {
    inner: tokio::sync::RwLock<Inner>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: tokio::sync::RwLock::new(Inner {
                alerts: VecDeque::with_capacity(capacity.min(1024)),
                hashes: HashSet::new(),
            }),
            capacity,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn insert_batch(&self, alerts: Vec<AlertRow>) -> StorageResult<usize> {
        let mut inner = self.inner.write().await;
        let mut inserted = 0;

        for alert in alerts {
            if !inner.hashes.insert(alert.content_hash.clone()) {
                continue;
            }

            if inner.alerts.len() == self.capacity
                && let Some(evicted) = inner.alerts.pop_front()
            {
                inner.hashes.remove(&evicted.content_hash);
            }

            inner.alerts.push_back(alert);
            inserted += 1;
        }

        Ok(inserted)
    }

    async fn query_recent(
        &self,
        host_id: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<AlertRow>> {
        let inner = self.inner.read().await;
        Ok(inner
            .alerts
            .iter()
            .rev()
            .filter(|a| host_id.is_none_or(|h| a.host_id == h))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self) -> StorageResult<usize> {
        Ok(self.inner.read().await.alerts.len())
    }

    async fn cleanup_old(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let mut inner = self.inner.write().await;
        let initial = inner.alerts.len();

        let (keep, drop): (VecDeque<AlertRow>, VecDeque<AlertRow>) = inner
            .alerts
            .drain(..)
            .partition(|a| a.timestamp >= before);

        for alert in &drop {
            inner.hashes.remove(&alert.content_hash);
        }
        inner.alerts = keep;

        Ok(initial - inner.alerts.len())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        Ok(HealthStatus {
            healthy: true,
            message: format!(
                "In-memory store: {} alerts",
                self.inner.read().await.alerts.len()
            ),
        })
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}
