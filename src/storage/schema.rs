//! Central alert row and its dedup hash.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AlertEnvelope, AlertLevel};

/// One centrally stored alert. Append-only; `content_hash` is the dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRow {
    pub host_id: String,
    pub observer_name: String,
    pub level: AlertLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
    pub content_hash: String,
}

impl AlertRow {
    pub fn from_envelope(host_id: impl Into<String>, envelope: &AlertEnvelope) -> Self {
        let host_id = host_id.into();
        let content_hash = content_hash(
            &host_id,
            &envelope.observer_name,
            &envelope.timestamp,
            &envelope.message,
        );

        Self {
            host_id,
            observer_name: envelope.observer_name.clone(),
            level: envelope.level,
            message: envelope.message.clone(),
            timestamp: envelope.timestamp,
            details: envelope.details.clone(),
            content_hash,
        }
    }

    pub fn envelope(&self) -> AlertEnvelope {
        AlertEnvelope {
            observer_name: self.observer_name.clone(),
            level: self.level,
            message: self.message.clone(),
            timestamp: self.timestamp,
            details: self.details.clone(),
        }
    }
}

/// Stable 64-bit content hash over the identity fields, hex encoded.
///
/// `DefaultHasher::new()` uses fixed keys, so the hash is stable across runs
/// and both ingestion paths (pull and push) derive the same key for the same
/// alert.
pub fn content_hash(
    host_id: &str,
    observer_name: &str,
    timestamp: &DateTime<Utc>,
    message: &str,
) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    host_id.hash(&mut hasher);
    observer_name.hash(&mut hasher);
    timestamp.timestamp_millis().hash(&mut hasher);
    message.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
