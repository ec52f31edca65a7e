//! Assignment records and counters

use cohort_features::UserId;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use crate::store::StoreError;

/// Experiment side a user is assigned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Group {
    /// Treatment: exposed to the campaign
    Test,

    /// Comparison population, excluded from the campaign
    Control,
}

impl Group {
    /// The other side
    #[inline]
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Test => Self::Control,
            Self::Control => Self::Test,
        }
    }
}

impl Display for Group {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Test => f.write_str("TEST"),
            Self::Control => f.write_str("CONTROL"),
        }
    }
}

/// Durable assignment of one user within one audience
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    /// Assigned user
    pub user_id: UserId,
    /// Side, fixed for the lifetime of the record
    pub group: Group,
    /// Last day the user was present in the candidate set
    pub last_seen_day: NaiveDate,
    /// Day the user was first allocated
    pub assigned_day: NaiveDate,
}

impl AssignmentRecord {
    /// Record for a user allocated on `day`
    #[inline]
    #[must_use]
    pub fn allocated(user_id: UserId, group: Group, day: NaiveDate) -> Self {
        Self {
            user_id,
            group,
            last_seen_day: day,
            assigned_day: day,
        }
    }

    /// Same record, seen again on `day`
    #[inline]
    #[must_use]
    pub fn seen_on(&self, day: NaiveDate) -> Self {
        Self {
            last_seen_day: day,
            ..self.clone()
        }
    }

    /// Whole days since the user was last seen
    #[inline]
    #[must_use]
    pub fn days_absent(&self, day: NaiveDate) -> i64 {
        day.signed_duration_since(self.last_seen_day).num_days()
    }
}

/// TEST / CONTROL counter pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCounts {
    /// TEST side
    pub test: u64,
    /// CONTROL side
    pub control: u64,
}

impl GroupCounts {
    /// Create counts
    #[inline]
    #[must_use]
    pub const fn new(test: u64, control: u64) -> Self {
        Self { test, control }
    }

    /// Count for one side
    #[inline]
    #[must_use]
    pub const fn get(&self, group: Group) -> u64 {
        match group {
            Group::Test => self.test,
            Group::Control => self.control,
        }
    }

    /// Increment one side
    #[inline]
    pub fn add(&mut self, group: Group) {
        match group {
            Group::Test => self.test += 1,
            Group::Control => self.control += 1,
        }
    }

    /// Element-wise sum
    #[inline]
    #[must_use]
    pub const fn plus(self, other: Self) -> Self {
        Self {
            test: self.test + other.test,
            control: self.control + other.control,
        }
    }

    /// Both sides together
    #[inline]
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.test + self.control
    }

    /// TEST share of the total, `None` when empty
    #[must_use]
    pub fn test_share(&self) -> Option<f64> {
        let total = self.total();
        (total > 0).then(|| self.test as f64 / total as f64)
    }
}

/// Validated audience name, safe to use as a file stem
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AudienceName(String);

impl AudienceName {
    /// Maximum accepted length
    pub const MAX_LEN: usize = 128;

    /// Validate and wrap
    ///
    /// # Errors
    /// `StoreError::InvalidAudienceName` if empty, too long, or containing
    /// anything but ASCII alphanumerics, `_` and `-`
    pub fn new(name: impl Into<String>) -> Result<Self, StoreError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= Self::MAX_LEN
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(Self(name))
        } else {
            Err(StoreError::InvalidAudienceName(name))
        }
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AudienceName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AudienceName {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for AudienceName {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AudienceName> for String {
    fn from(name: AudienceName) -> Self {
        name.0
    }
}
