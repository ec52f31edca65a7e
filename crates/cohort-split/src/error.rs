//! Split errors

use chrono::NaiveDate;
use cohort_features::UserId;

/// Errors raised while computing a day's split
///
/// Every variant means the day was not split; no partial result exists.
#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    /// Split ratio outside `(0, 1]`
    #[error("split ratio {0} is outside (0, 1]")]
    InvalidRatio(f64),

    /// TTL below one day
    #[error("ttl must be at least 1 day, got {0}")]
    InvalidTtl(u32),

    /// Day already committed, or earlier than the last committed day
    #[error("day {day} is not after last committed day {last_committed}")]
    DayNotAfterCommitted {
        /// Last committed day in the snapshot
        last_committed: NaiveDate,
        /// Requested day
        day: NaiveDate,
    },

    /// A stored record claims to have been seen after the day being split
    #[error("user {user_id} was last seen on {last_seen}, after day {day}")]
    RecordFromFuture {
        /// User
        user_id: UserId,
        /// Stored last seen day
        last_seen: NaiveDate,
        /// Requested day
        day: NaiveDate,
    },
}

impl SplitError {
    /// Whether the stored state itself is inconsistent
    #[inline]
    #[must_use]
    pub fn is_state_inconsistency(&self) -> bool {
        matches!(self, Self::RecordFromFuture { .. })
    }
}
