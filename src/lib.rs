pub mod config;
pub mod lifecycle;
pub mod observers;
pub mod remote;
pub mod reporter;
pub mod scheduler;
pub mod storage;
pub mod sync;
pub mod util;
pub mod window;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of an alert, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "info"),
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Error => write!(f, "error"),
            AlertLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Outcome of a single observer check.
///
/// Created fresh on every check and handed straight to the reporter; the agent
/// itself never retains results beyond the sink write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverResult {
    pub observer_name: String,
    pub level: AlertLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: serde_json::Value,
    /// A sticky result re-emits on every check while its condition holds,
    /// bypassing reporter cooldown.
    #[serde(default)]
    pub sticky: bool,
}

impl ObserverResult {
    pub fn new(
        observer_name: impl Into<String>,
        level: AlertLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            observer_name: observer_name.into(),
            level,
            message: message.into(),
            timestamp: Utc::now(),
            details: serde_json::Value::Null,
            sticky: false,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn sticky(mut self) -> Self {
        self.sticky = true;
        self
    }
}

/// The normalized alert format written to sinks and shipped to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEnvelope {
    pub observer_name: String,
    pub level: AlertLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl From<&ObserverResult> for AlertEnvelope {
    fn from(result: &ObserverResult) -> Self {
        Self {
            observer_name: result.observer_name.clone(),
            level: result.level,
            message: result.message.clone(),
            timestamp: result.timestamp,
            details: result.details.clone(),
        }
    }
}

/// Event published on the hub broadcast channel whenever a new alert lands in
/// central storage.
///
/// The broadcast channel may lag or drop messages for slow subscribers - that
/// is acceptable, the store remains the source of truth.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub host_id: String,
    pub envelope: AlertEnvelope,
}
