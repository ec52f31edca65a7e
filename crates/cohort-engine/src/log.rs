//! Append-only audience log
//!
//! One entry per committed (audience, day), consumed later for reporting.

use crate::config::AudienceMode;
use crate::error::HandoffError;
use crate::outcome::DayOutcome;
use async_trait::async_trait;
use cohort_split::DaySplitResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Summary of one committed day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudienceLogEntry {
    /// Audience
    pub audience: String,

    /// Mode the day ran under
    pub mode: AudienceMode,

    /// Every field of the day's result
    #[serde(flatten)]
    pub result: DaySplitResult,

    /// Size of the day's TEST set
    pub test_user_count: usize,

    /// Size of the day's CONTROL set
    pub control_user_count: usize,

    /// Absent TEST users kept by their window
    pub retained_count: usize,

    /// Records removed
    pub dropped_count: usize,

    /// Configured TEST share
    pub split_ratio: f64,

    /// Cumulative realized TEST share
    pub realized_ratio: Option<f64>,

    /// Realized share outside the tolerance
    pub drift_warning: bool,
}

impl AudienceLogEntry {
    /// Entry for a committed day
    #[must_use]
    pub fn from_outcome(outcome: &DayOutcome) -> Self {
        Self {
            audience: outcome.audience.clone(),
            mode: outcome.mode,
            result: outcome.result.clone(),
            test_user_count: outcome.result.test_user_count(),
            control_user_count: outcome.result.control_user_count(),
            retained_count: outcome.retained_count,
            dropped_count: outcome.dropped_count,
            split_ratio: outcome.drift.target,
            realized_ratio: outcome.drift.realized,
            drift_warning: outcome.drift.warning,
        }
    }
}

/// Append-only log of committed days
#[async_trait]
pub trait AudienceLog: Send + Sync + std::fmt::Debug {
    /// Append one entry
    ///
    /// # Errors
    /// Storage failure; the entry is not recorded
    async fn append(&self, entry: &AudienceLogEntry) -> Result<(), HandoffError>;

    /// Entries of one audience, in append order
    ///
    /// # Errors
    /// Storage failure or undecodable entries
    async fn history(&self, audience: &str) -> Result<Vec<AudienceLogEntry>, HandoffError>;
}

/// Log kept in memory
#[derive(Debug, Default)]
pub struct MemoryAudienceLog {
    entries: Mutex<Vec<AudienceLogEntry>>,
}

impl MemoryAudienceLog {
    /// Create empty log
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries across all audiences
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if nothing was appended
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl AudienceLog for MemoryAudienceLog {
    async fn append(&self, entry: &AudienceLogEntry) -> Result<(), HandoffError> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }

    async fn history(&self, audience: &str) -> Result<Vec<AudienceLogEntry>, HandoffError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|e| e.audience == audience)
            .cloned()
            .collect())
    }
}

/// Log stored as JSON lines, one object per committed day
#[derive(Debug)]
pub struct JsonlAudienceLog {
    path: PathBuf,
    append_lock: tokio::sync::Mutex<()>,
}

impl JsonlAudienceLog {
    /// Log at `path`; the file is created on first append
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Log file
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AudienceLog for JsonlAudienceLog {
    async fn append(&self, entry: &AudienceLogEntry) -> Result<(), HandoffError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.append_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn history(&self, audience: &str) -> Result<Vec<AudienceLogEntry>, HandoffError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: AudienceLogEntry = serde_json::from_str(line).map_err(|source| HandoffError::Malformed {
                line: index + 1,
                source,
            })?;
            if entry.audience == audience {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use cohort_features::UserId;

    fn entry(audience: &str, d: u32) -> AudienceLogEntry {
        AudienceLogEntry {
            audience: audience.to_string(),
            mode: AudienceMode::Test,
            result: DaySplitResult {
                day: NaiveDate::from_ymd_opt(2024, 10, d).unwrap(),
                test_user_ids: vec![UserId::new("a")],
                control_user_ids: vec![UserId::new("b")],
                new_test_count: 1,
                new_control_count: 1,
                total_test_count: 1,
                total_control_count: 1,
            },
            test_user_count: 1,
            control_user_count: 1,
            retained_count: 0,
            dropped_count: 0,
            split_ratio: 0.5,
            realized_ratio: Some(0.5),
            drift_warning: false,
        }
    }

    #[tokio::test]
    async fn memory_history_filters_by_audience() {
        let log = MemoryAudienceLog::new();
        log.append(&entry("a", 1)).await.unwrap();
        log.append(&entry("b", 1)).await.unwrap();
        log.append(&entry("a", 2)).await.unwrap();

        let history = log.history("a").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].result.day.to_string(), "2024-10-02");
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn entry_is_flat_json() {
        let value = serde_json::to_value(entry("a", 1)).unwrap();
        assert_eq!(value["day"], "2024-10-01");
        assert_eq!(value["total_test_count"], 1);
        assert_eq!(value["mode"], "test");
        assert_eq!(value["drift_warning"], false);
    }
}
