//! Affinity store trait and errors

use crate::record::{AudienceName, Group};
use crate::snapshot::{AffinitySnapshot, DayCommit};
use async_trait::async_trait;
use chrono::NaiveDate;
use cohort_features::UserId;

/// Durable, per-audience keyed store of assignment records
///
/// Each call is scoped to one audience. `write` is all-or-nothing: the commit
/// is validated against the current state before any part of it is applied,
/// and a rejected or failed commit leaves the stored state untouched.
#[async_trait]
pub trait AffinityStore: Send + Sync + std::fmt::Debug {
    /// Read the audience's current state
    ///
    /// An audience that was never written reads as an empty snapshot.
    ///
    /// # Errors
    /// `StoreError::Corrupt` if persisted state cannot be decoded or fails
    /// integrity checks; never silently replaced by an empty state
    async fn read(&self, audience: &AudienceName) -> Result<AffinitySnapshot, StoreError>;

    /// Atomically apply one day's commit
    ///
    /// # Errors
    /// Any commit validation failure, or I/O failure while persisting
    async fn write(&self, audience: &AudienceName, commit: DayCommit) -> Result<CommitAck, StoreError>;
}

/// Acknowledgement of an applied commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitAck {
    /// Committed day
    pub day: NaiveDate,

    /// Live records after the commit
    pub live_records: usize,
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Persisted state is unreadable or inconsistent
    #[error("affinity store for audience {audience} is corrupt: {reason}")]
    Corrupt {
        /// Audience name
        audience: String,
        /// What is wrong
        reason: String,
    },

    /// Commit day is not after the last committed day
    #[error("day {day} is not after last committed day {last_committed}")]
    DayOutOfOrder {
        /// Last committed day
        last_committed: NaiveDate,
        /// Rejected day
        day: NaiveDate,
    },

    /// Commit would flip a user's group
    #[error("user {user_id} is assigned to {existing}, refusing reassignment to {attempted}")]
    AffinityViolation {
        /// User
        user_id: UserId,
        /// Stored group
        existing: Group,
        /// Group in the commit
        attempted: Group,
    },

    /// Commit would move `last_seen_day` backwards or past the commit day
    #[error("user {user_id}: last seen day {attempted} invalid (stored {existing:?}, commit day {day})")]
    LastSeenRegression {
        /// User
        user_id: UserId,
        /// Stored value, if any
        existing: Option<NaiveDate>,
        /// Value in the commit
        attempted: NaiveDate,
        /// Commit day
        day: NaiveDate,
    },

    /// Delete of a record that does not exist
    #[error("cannot delete unknown user {0}")]
    UnknownRecord(UserId),

    /// User appears more than once in a commit
    #[error("user {0} appears more than once in the commit")]
    ConflictingCommit(UserId),

    /// Counter increments disagree with the records created
    #[error("counter increment mismatch: commit says {declared:?}, new records give {actual:?}")]
    CounterMismatch {
        /// Increments carried by the commit
        declared: (u64, u64),
        /// Increments implied by new records
        actual: (u64, u64),
    },

    /// Commit tries to replace already frozen bins
    #[error("numeric bins are already frozen for this audience")]
    BinningFrozen,

    /// Audience name not usable as a key
    #[error("invalid audience name: {0:?}")]
    InvalidAudienceName(String),

    /// I/O failure
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding failure while persisting
    #[error("store encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the error signals unusable persisted state
    #[inline]
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }

    /// Whether the commit itself was rejected (state untouched, nothing to retry)
    #[inline]
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::DayOutOfOrder { .. }
                | Self::AffinityViolation { .. }
                | Self::LastSeenRegression { .. }
                | Self::UnknownRecord(_)
                | Self::ConflictingCommit(_)
                | Self::CounterMismatch { .. }
                | Self::BinningFrozen
        )
    }
}
