//! Engine error taxonomy
//!
//! [`EngineError`] means the day was not committed. [`HandoffError`] is a
//! failure after the commit (log append, upload) and never undoes it.

use crate::config::ConfigError;
use chrono::NaiveDate;
use cohort_features::NormalizeError;
use cohort_split::SplitError;
use cohort_store::StoreError;

/// Errors that stop a day's split
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid audience configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Audience mode is `off`
    #[error("audience {0} is disabled")]
    AudienceDisabled(String),

    /// Day is not after the audience's last committed day
    #[error("audience {audience}: day {day} is not after last committed day {last_committed}")]
    DayOutOfOrder {
        /// Audience
        audience: String,
        /// Last committed day
        last_committed: NaiveDate,
        /// Rejected day
        day: NaiveDate,
    },

    /// Same day submitted twice in one run
    #[error("audience {audience}: day {day} submitted more than once")]
    DuplicateDay {
        /// Audience
        audience: String,
        /// Repeated day
        day: NaiveDate,
    },

    /// Candidate normalization failed
    #[error("normalization failed: {0}")]
    Normalize(#[from] NormalizeError),

    /// Split computation failed
    #[error("split failed: {0}")]
    Split(#[from] SplitError),

    /// Store read or commit failed
    #[error("affinity store: {0}")]
    Store(#[from] StoreError),

    /// Audience task aborted
    #[error("audience {audience} task failed: {reason}")]
    Task {
        /// Audience
        audience: String,
        /// Panic or cancellation message
        reason: String,
    },
}

impl EngineError {
    /// Whether the audience's persisted state is unusable until repaired
    #[inline]
    #[must_use]
    pub fn is_fatal_for_audience(&self) -> bool {
        match self {
            Self::Store(e) => e.is_corrupt() || matches!(e, StoreError::AffinityViolation { .. }),
            Self::Split(e) => e.is_state_inconsistency(),
            _ => false,
        }
    }

    /// Whether running the same day again may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(StoreError::Io(_)) | Self::Task { .. })
    }

    /// Map lower-level ordering errors onto [`Self::DayOutOfOrder`]
    pub(crate) fn for_audience(self, audience: &str) -> Self {
        match self {
            Self::Split(SplitError::DayNotAfterCommitted { last_committed, day })
            | Self::Store(StoreError::DayOutOfOrder { last_committed, day }) => Self::DayOutOfOrder {
                audience: audience.to_string(),
                last_committed,
                day,
            },
            other => other,
        }
    }
}

/// Failures after a successful commit
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    /// I/O failure writing or reading
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding failure
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Stored log line cannot be decoded
    #[error("audience log line {line} is malformed: {source}")]
    Malformed {
        /// 1-based line number
        line: usize,
        /// Decode error
        source: serde_json::Error,
    },

    /// Upload target refused the set
    #[error("upload rejected: {0}")]
    Rejected(String),
}
