//! Inputs and outputs of engine runs

use crate::config::AudienceMode;
use crate::error::EngineError;
use chrono::NaiveDate;
use cohort_features::{FeatureKind, RawCandidate};
use cohort_split::{BalanceReport, DaySplitResult, RatioDrift};
use std::collections::BTreeMap;

/// One day's raw candidates for one audience
#[derive(Debug, Clone, PartialEq)]
pub struct DayBatch {
    /// Sampling day
    pub day: NaiveDate,

    /// Candidate rows, as delivered by the warehouse
    pub candidates: Vec<RawCandidate>,
}

impl DayBatch {
    /// Create batch
    #[inline]
    #[must_use]
    pub fn new(day: NaiveDate, candidates: Vec<RawCandidate>) -> Self {
        Self { day, candidates }
    }

    /// Batch without candidates; retention still runs
    #[inline]
    #[must_use]
    pub fn empty(day: NaiveDate) -> Self {
        Self::new(day, Vec::new())
    }
}

/// Upload hand-off result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStatus {
    /// TEST set handed to the sink
    Published {
        /// Users published
        users: usize,
    },

    /// Audience runs in `test` mode
    Skipped,

    /// Sink failed; affinity is committed regardless
    Failed(String),
}

/// Audience log result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogStatus {
    /// Entry appended
    Appended,

    /// Append failed; affinity is committed regardless
    Failed(String),
}

/// What happened after the commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffStatus {
    /// Upload sink outcome
    pub upload: UploadStatus,

    /// Audience log outcome
    pub log: LogStatus,
}

impl HandoffStatus {
    /// Both downstream steps succeeded or were intentionally skipped
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !matches!(self.upload, UploadStatus::Failed(_)) && self.log == LogStatus::Appended
    }
}

/// Committed day for one audience
#[derive(Debug, Clone)]
pub struct DayOutcome {
    /// Audience
    pub audience: String,

    /// Mode the day ran under
    pub mode: AudienceMode,

    /// Final sets and counts
    pub result: DaySplitResult,

    /// Users present today that already had a record
    pub returning_count: usize,

    /// Absent TEST users kept by their window
    pub retained_count: usize,

    /// Records removed
    pub dropped_count: usize,

    /// Candidate rows ignored as repeats
    pub duplicate_count: usize,

    /// Users per feature that fell into the unknown bucket
    pub unknown_counts: BTreeMap<FeatureKind, usize>,

    /// Bins were fitted and frozen on this day
    pub binning_fitted: bool,

    /// Per-feature TEST/CONTROL balance
    pub balance: BalanceReport,

    /// Realized ratio check
    pub drift: RatioDrift,

    /// Downstream hand-off results
    pub handoff: HandoffStatus,
}

/// Result of running a sequence of days for one audience
#[derive(Debug)]
pub struct AudienceReport {
    /// Audience
    pub audience: String,

    /// Audience was `off` and not touched
    pub skipped: bool,

    /// Submitted days the store had already committed, not rerun
    pub already_committed: Vec<NaiveDate>,

    /// Committed days, in order
    pub outcomes: Vec<DayOutcome>,

    /// Failure that stopped the sequence
    pub error: Option<EngineError>,
}

impl AudienceReport {
    pub(crate) fn skipped(audience: impl Into<String>) -> Self {
        Self {
            audience: audience.into(),
            skipped: true,
            already_committed: Vec::new(),
            outcomes: Vec::new(),
            error: None,
        }
    }

    pub(crate) fn failed(audience: impl Into<String>, error: EngineError) -> Self {
        Self {
            audience: audience.into(),
            skipped: false,
            already_committed: Vec::new(),
            outcomes: Vec::new(),
            error: Some(error),
        }
    }

    /// Every submitted day committed
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Last committed day in this run
    #[must_use]
    pub fn last_day(&self) -> Option<NaiveDate> {
        self.outcomes.last().map(|o| o.result.day)
    }
}
