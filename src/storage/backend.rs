//! Storage backend trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use super::schema::AlertRow;

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: String,
}

/// Trait for central alert storage backends.
///
/// - **Async**: all methods are async for compatibility with Tokio
/// - **Batch-oriented**: `insert_batch` is the primary write method
/// - **Append-only**: alerts are never updated, only inserted and aged out
///
/// Implementations must be `Send + Sync`; they are shared across tasks.
/// Backends must tolerate duplicate `content_hash` values in the input and
/// insert each alert at most once - the in-memory dedup pass upstream is an
/// optimization, not the only line of defense.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Insert a batch of alerts, skipping rows whose `content_hash` already
    /// exists. Returns how many rows were actually inserted.
    async fn insert_batch(&self, alerts: Vec<AlertRow>) -> StorageResult<usize>;

    /// The most recent alerts, newest first, optionally filtered by host.
    async fn query_recent(
        &self,
        host_id: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<AlertRow>>;

    /// Total stored alert count.
    async fn count(&self) -> StorageResult<usize>;

    /// Delete alerts older than the given timestamp, returning how many were
    /// removed. Used for retention enforcement.
    async fn cleanup_old(&self, before: DateTime<Utc>) -> StorageResult<usize>;

    /// Lightweight operational check.
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Close the backend and release resources.
    async fn close(&self) -> StorageResult<()>;
}
