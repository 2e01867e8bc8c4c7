//! SQLite alert store.
//!
//! Embedded, WAL mode for read concurrency during writes, pooled
//! connections. The schema is created idempotently at startup; the UNIQUE
//! constraint on `content_hash` makes inserts naturally idempotent, so a
//! replayed batch inserts nothing.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument};

use crate::AlertLevel;

use super::backend::{AlertStore, HealthStatus};
use super::error::{StorageError, StorageResult};
use super::schema::AlertRow;

const CREATE_ALERTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id TEXT NOT NULL,
    observer_name TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    details TEXT NOT NULL,
    content_hash TEXT NOT NULL UNIQUE
)
"#;

const CREATE_ALERTS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_alerts_host_time ON alerts (host_id, timestamp)";

pub struct SqliteStore {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteStore {
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite store at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        sqlx::query(CREATE_ALERTS_TABLE)
            .execute(&pool)
            .await
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;
        sqlx::query(CREATE_ALERTS_INDEX)
            .execute(&pool)
            .await
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        debug!("alert schema ready");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn level_from_str(raw: &str) -> AlertLevel {
        match raw {
            "warning" => AlertLevel::Warning,
            "error" => AlertLevel::Error,
            "critical" => AlertLevel::Critical,
            _ => AlertLevel::Info,
        }
    }

    fn row_from_sqlite(row: &sqlx::sqlite::SqliteRow) -> StorageResult<AlertRow> {
        let details_raw: String = row.get("details");
        let details = serde_json::from_str(&details_raw)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        let level_raw: String = row.get("level");
        let timestamp = DateTime::from_timestamp_millis(row.get("timestamp"))
            .ok_or_else(|| StorageError::QueryFailed("invalid timestamp".into()))?;

        Ok(AlertRow {
            host_id: row.get("host_id"),
            observer_name: row.get("observer_name"),
            level: Self::level_from_str(&level_raw),
            message: row.get("message"),
            timestamp,
            details,
            content_hash: row.get("content_hash"),
        })
    }
}

#[async_trait]
impl AlertStore for SqliteStore {
    #[instrument(skip(self, alerts), fields(count = alerts.len()))]
    async fn insert_batch(&self, alerts: Vec<AlertRow>) -> StorageResult<usize> {
        if alerts.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        let mut inserted = 0usize;
        for alert in alerts {
            let details = serde_json::to_string(&alert.details)
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;

            let result = sqlx::query(
                r#"
                INSERT INTO alerts (
                    host_id, observer_name, level, message, timestamp, details, content_hash
                )
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (content_hash) DO NOTHING
                "#,
            )
            .bind(&alert.host_id)
            .bind(&alert.observer_name)
            .bind(alert.level.to_string())
            .bind(&alert.message)
            .bind(alert.timestamp.timestamp_millis())
            .bind(details)
            .bind(&alert.content_hash)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

            inserted += result.rows_affected() as usize;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        debug!("batch insert complete ({inserted} new)");
        Ok(inserted)
    }

    async fn query_recent(
        &self,
        host_id: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<AlertRow>> {
        let rows = match host_id {
            Some(host) => {
                sqlx::query(
                    r#"
                    SELECT host_id, observer_name, level, message, timestamp, details, content_hash
                    FROM alerts WHERE host_id = ?
                    ORDER BY timestamp DESC LIMIT ?
                    "#,
                )
                .bind(host)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT host_id, observer_name, level, message, timestamp, details, content_hash
                    FROM alerts
                    ORDER BY timestamp DESC LIMIT ?
                    "#,
                )
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        rows.iter().map(Self::row_from_sqlite).collect()
    }

    async fn count(&self) -> StorageResult<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM alerts")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        let n: i64 = row.get("n");
        Ok(n as usize)
    }

    #[instrument(skip(self))]
    async fn cleanup_old(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let result = sqlx::query("DELETE FROM alerts WHERE timestamp < ?")
            .bind(before.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        let deleted = result.rows_affected() as usize;
        if deleted > 0 {
            info!("retention cleanup removed {deleted} alerts");
        }
        Ok(deleted)
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => Ok(HealthStatus {
                healthy: true,
                message: format!("SQLite operational at {}", self.db_path),
            }),
            Err(e) => Ok(HealthStatus {
                healthy: false,
                message: format!("SQLite unhealthy: {e}"),
            }),
        }
    }

    async fn close(&self) -> StorageResult<()> {
        self.pool.close().await;
        Ok(())
    }
}
