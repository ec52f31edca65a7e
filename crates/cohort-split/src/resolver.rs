//! Retention resolver
//!
//! Partitions the union of today's candidates and the audience's existing
//! records into four disjoint sets:
//!
//! | Set | Present today | Record | Outcome |
//! |---|---|---|---|
//! | returning | yes | yes | keep group, refresh `last_seen_day` |
//! | retained | no | TEST, absent `< ttl` days | stay in TEST, `last_seen_day` unchanged |
//! | dropped | no | CONTROL, or TEST absent `>= ttl` days | record deleted |
//! | unseen | yes | no | handed to the allocator |

use crate::error::SplitError;
use chrono::NaiveDate;
use cohort_features::{CandidateUser, UserId};
use cohort_store::{AffinitySnapshot, AssignmentRecord, Group};
use std::collections::{HashMap, HashSet};

/// Retention outcome for one (audience, day)
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Present today with an existing record, paired with today's features
    pub returning: Vec<(AssignmentRecord, CandidateUser)>,

    /// Absent TEST users still inside their retention window
    pub retained: Vec<AssignmentRecord>,

    /// Absent users whose records are removed today
    pub dropped: Vec<AssignmentRecord>,

    /// Present today without any record
    pub unseen: Vec<CandidateUser>,

    /// Candidate rows ignored because the user already appeared earlier in the batch
    pub duplicates: usize,
}

impl Resolution {
    /// Number of distinct candidates considered
    #[inline]
    #[must_use]
    pub fn candidate_count(&self) -> usize {
        self.returning.len() + self.unseen.len()
    }
}

/// Decides, per user, what happens to existing assignments on a day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionResolver {
    ttl: u32,
}

impl RetentionResolver {
    /// Create resolver with a TTL in days
    ///
    /// # Errors
    /// `SplitError::InvalidTtl` if `ttl` is zero
    pub fn new(ttl: u32) -> Result<Self, SplitError> {
        if ttl == 0 {
            return Err(SplitError::InvalidTtl(ttl));
        }
        Ok(Self { ttl })
    }

    /// Configured TTL
    #[inline]
    #[must_use]
    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// Whether a TEST user absent since `last_seen` is still retained on `day`
    #[inline]
    #[must_use]
    pub fn within_window(&self, record: &AssignmentRecord, day: NaiveDate) -> bool {
        record.group == Group::Test && record.days_absent(day) < i64::from(self.ttl)
    }

    /// Partition today's candidates against the audience snapshot
    ///
    /// Duplicate candidate rows keep their first occurrence.
    ///
    /// # Errors
    /// - `DayNotAfterCommitted` if the snapshot already covers `day`
    /// - `RecordFromFuture` if a stored record was seen after `day`
    pub fn resolve(
        &self,
        snapshot: &AffinitySnapshot,
        day: NaiveDate,
        candidates: Vec<CandidateUser>,
    ) -> Result<Resolution, SplitError> {
        if let Some(last_committed) = snapshot.last_committed_day {
            if day <= last_committed {
                return Err(SplitError::DayNotAfterCommitted { last_committed, day });
            }
        }

        let mut resolution = Resolution::default();
        let mut present: HashMap<UserId, CandidateUser> = HashMap::with_capacity(candidates.len());
        let mut order: Vec<UserId> = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            if present.contains_key(&candidate.user_id) {
                resolution.duplicates += 1;
                continue;
            }
            order.push(candidate.user_id.clone());
            present.insert(candidate.user_id.clone(), candidate);
        }

        // Existing records in user order
        let mut matched: HashSet<&UserId> = HashSet::new();
        for (user_id, record) in &snapshot.records {
            if record.last_seen_day > day {
                return Err(SplitError::RecordFromFuture {
                    user_id: user_id.clone(),
                    last_seen: record.last_seen_day,
                    day,
                });
            }
            if let Some(candidate) = present.get(user_id) {
                matched.insert(user_id);
                resolution.returning.push((record.clone(), candidate.clone()));
            } else if self.within_window(record, day) {
                resolution.retained.push(record.clone());
            } else {
                resolution.dropped.push(record.clone());
            }
        }

        for user_id in order {
            if matched.contains(&user_id) {
                continue;
            }
            if let Some(candidate) = present.remove(&user_id) {
                resolution.unseen.push(candidate);
            }
        }

        if resolution.duplicates > 0 {
            tracing::warn!(
                %day,
                duplicates = resolution.duplicates,
                "duplicate candidate rows ignored"
            );
        }
        tracing::debug!(
            %day,
            ttl = self.ttl,
            returning = resolution.returning.len(),
            retained = resolution.retained.len(),
            dropped = resolution.dropped.len(),
            unseen = resolution.unseen.len(),
            "retention resolved"
        );

        Ok(resolution)
    }
}
