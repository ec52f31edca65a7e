//! Day assembler

use crate::allocator::Allocation;
use crate::resolver::Resolution;
use chrono::NaiveDate;
use cohort_features::UserId;
use cohort_store::{Group, GroupCounts};
use serde::{Deserialize, Serialize};

/// Final TEST / CONTROL sets of one (audience, day)
///
/// Immutable once produced. Id lists are sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySplitResult {
    /// Day split
    pub day: NaiveDate,

    /// Returning TEST, retained, and newly allocated TEST users
    pub test_user_ids: Vec<UserId>,

    /// Returning CONTROL and newly allocated CONTROL users
    pub control_user_ids: Vec<UserId>,

    /// Users allocated to TEST today
    pub new_test_count: u64,

    /// Users allocated to CONTROL today
    pub new_control_count: u64,

    /// Records ever created with TEST, including today
    pub total_test_count: u64,

    /// Records ever created with CONTROL, including today
    pub total_control_count: u64,
}

impl DaySplitResult {
    /// Size of today's TEST set
    #[inline]
    #[must_use]
    pub fn test_user_count(&self) -> usize {
        self.test_user_ids.len()
    }

    /// Size of today's CONTROL set
    #[inline]
    #[must_use]
    pub fn control_user_count(&self) -> usize {
        self.control_user_ids.len()
    }

    /// Cumulative totals as counts
    #[inline]
    #[must_use]
    pub fn totals(&self) -> GroupCounts {
        GroupCounts::new(self.total_test_count, self.total_control_count)
    }

    /// Group of a user in today's sets
    #[must_use]
    pub fn group_of(&self, user_id: &UserId) -> Option<Group> {
        if self.test_user_ids.binary_search(user_id).is_ok() {
            Some(Group::Test)
        } else if self.control_user_ids.binary_search(user_id).is_ok() {
            Some(Group::Control)
        } else {
            None
        }
    }
}

/// Merge resolution and allocations into the day's result
///
/// `totals` are the cumulative counters after today's allocations.
#[must_use]
pub fn assemble(
    day: NaiveDate,
    resolution: &Resolution,
    allocations: &[Allocation],
    totals: GroupCounts,
) -> DaySplitResult {
    let mut test_user_ids = Vec::new();
    let mut control_user_ids = Vec::new();
    let mut new_counts = GroupCounts::default();

    let mut push = |group: Group, user_id: &UserId| match group {
        Group::Test => test_user_ids.push(user_id.clone()),
        Group::Control => control_user_ids.push(user_id.clone()),
    };

    for (record, _) in &resolution.returning {
        push(record.group, &record.user_id);
    }
    for record in &resolution.retained {
        push(Group::Test, &record.user_id);
    }
    for allocation in allocations {
        push(allocation.group, &allocation.user.user_id);
        new_counts.add(allocation.group);
    }

    test_user_ids.sort();
    control_user_ids.sort();

    DaySplitResult {
        day,
        test_user_ids,
        control_user_ids,
        new_test_count: new_counts.test,
        new_control_count: new_counts.control,
        total_test_count: totals.test,
        total_control_count: totals.control,
    }
}
