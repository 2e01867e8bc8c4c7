//! Keyword/regex scan over newly appended log content.
//!
//! The read offset is established the moment the observer first runs - there
//! is no historical backfill. Every check reads only the delta since the last
//! offset and the offset advances by the amount read whether or not anything
//! matched. A bounded ring keeps the most recent matches for reporting.

use std::collections::VecDeque;
use std::path::PathBuf;

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

use crate::config::{ObserverConfig, StrategyConfig};
use crate::util::{file_len, read_new_lines};
use crate::{AlertLevel, ObserverResult};

use super::Observer;

#[derive(Debug, Clone, serde::Serialize)]
struct MatchRecord {
    pattern: String,
    context: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}

pub struct LogScanObserver {
    name: String,
    interval_secs: u64,
    path: PathBuf,
    patterns: Vec<Regex>,
    exclude_patterns: Vec<Regex>,
    max_lines_per_check: usize,
    redact: bool,
    level: AlertLevel,

    offset: u64,
    first_run: bool,
    /// Bounded ring of the most recent matches.
    recent_matches: VecDeque<MatchRecord>,
    match_history: usize,
}

impl LogScanObserver {
    pub fn from_config(config: &ObserverConfig) -> anyhow::Result<Self> {
        let StrategyConfig::LogScan {
            path,
            patterns,
            exclude_patterns,
            max_lines_per_check,
            match_history,
            redact,
            level,
        } = &config.strategy
        else {
            anyhow::bail!("not a log_scan config");
        };

        let compile = |raw: &[String]| -> anyhow::Result<Vec<Regex>> {
            raw.iter()
                .map(|p| {
                    Regex::new(&format!("(?i){p}"))
                        .map_err(|e| anyhow::anyhow!("invalid pattern {p:?}: {e}"))
                })
                .collect()
        };

        Ok(Self {
            name: config.name.clone(),
            interval_secs: config.interval_secs,
            path: path.clone(),
            patterns: compile(patterns)?,
            exclude_patterns: compile(exclude_patterns)?,
            max_lines_per_check: *max_lines_per_check,
            redact: *redact,
            level: *level,
            offset: 0,
            first_run: true,
            recent_matches: VecDeque::with_capacity(*match_history),
            match_history: *match_history,
        })
    }

    fn scan_line(&self, line: &str) -> Option<MatchRecord> {
        for exclude in &self.exclude_patterns {
            if exclude.is_match(line) {
                return None;
            }
        }

        for pattern in &self.patterns {
            if let Some(found) = pattern.find(line) {
                let context = if self.redact {
                    redact_match(line, found.start(), found.end())
                } else {
                    line.chars().take(200).collect()
                };

                return Some(MatchRecord {
                    pattern: pattern.as_str().to_string(),
                    context,
                    timestamp: chrono::Utc::now(),
                });
            }
        }

        None
    }

    fn remember(&mut self, record: MatchRecord) {
        if self.recent_matches.len() == self.match_history {
            self.recent_matches.pop_front();
        }
        self.recent_matches.push_back(record);
    }
}

/// Blank out the matched region, keeping a short head and tail for context.
fn redact_match(line: &str, start: usize, end: usize) -> String {
    let head: String = line[..start].chars().take(80).collect();
    let tail: String = line[end..].chars().take(40).collect();
    format!("{head}***{tail}")
}

#[async_trait]
impl Observer for LogScanObserver {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    async fn check(&mut self) -> anyhow::Result<Option<ObserverResult>> {
        // First run pins the offset to the current end of file so history
        // written before the agent started is never scanned.
        if self.first_run {
            self.first_run = false;
            self.offset = file_len(&self.path).await;
            return Ok(None);
        }

        let (lines, new_offset) =
            read_new_lines(&self.path, self.offset, self.max_lines_per_check).await?;
        self.offset = new_offset;

        let mut hits = 0usize;
        let mut first_context = None;

        for line in &lines {
            if let Some(record) = self.scan_line(line) {
                warn!("[{}] matched {:?} in {}", self.name, record.pattern, self.path.display());
                if first_context.is_none() {
                    first_context = Some(record.context.clone());
                }
                self.remember(record);
                hits += 1;
            }
        }

        if hits == 0 {
            return Ok(None);
        }

        let message = match &first_context {
            Some(context) if hits == 1 => format!("log match in {}: {context}", self.path.display()),
            Some(context) => format!(
                "{hits} log matches in {} (latest: {context})",
                self.path.display()
            ),
            None => format!("{hits} log matches in {}", self.path.display()),
        };

        let recent: Vec<&MatchRecord> = self.recent_matches.iter().rev().take(hits.min(10)).collect();

        Ok(Some(
            ObserverResult::new(&self.name, self.level, message).with_details(serde_json::json!({
                "log_path": self.path,
                "matches": hits,
                "recent": recent,
            })),
        ))
    }
}
