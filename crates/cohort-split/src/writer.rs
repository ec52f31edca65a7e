//! Affinity store writer
//!
//! Turns a day's resolution and allocations into a single [`DayCommit`]:
//!
//! - allocated users: new records with `last_seen_day = day`
//! - returning users: existing record with `last_seen_day` refreshed
//! - retained users: untouched, so their window keeps counting down
//! - dropped users: deleted
//!
//! The commit is applied by the store in one validated step.

use crate::allocator::Allocation;
use crate::resolver::Resolution;
use chrono::NaiveDate;
use cohort_store::{AssignmentRecord, DayCommit};

/// Build the commit for one (audience, day)
#[must_use]
pub fn build_commit(day: NaiveDate, resolution: &Resolution, allocations: &[Allocation]) -> DayCommit {
    let mut commit = DayCommit::new(day);
    commit.upserts.reserve(resolution.returning.len() + allocations.len());

    for (record, _) in &resolution.returning {
        commit.upserts.push(record.seen_on(day));
    }
    for allocation in allocations {
        commit.upserts.push(AssignmentRecord::allocated(
            allocation.user.user_id.clone(),
            allocation.group,
            day,
        ));
        commit.new_counts.add(allocation.group);
        commit
            .stratum_increments
            .entry(allocation.stratum.clone())
            .or_default()
            .add(allocation.group);
    }
    commit.deletes = resolution.dropped.iter().map(|r| r.user_id.clone()).collect();

    commit
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_features::{CandidateUser, FeatureVector, UserId};
    use cohort_store::{AffinitySnapshot, AudienceName, Group, GroupCounts};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, d).unwrap()
    }

    #[test]
    fn commit_applies_cleanly() {
        let mut snap = AffinitySnapshot::empty(AudienceName::new("w").unwrap());
        for (id, group) in [("keep", Group::Test), ("hold", Group::Test), ("gone", Group::Control)] {
            snap.records
                .insert(UserId::new(id), AssignmentRecord::allocated(UserId::new(id), group, day(1)));
            snap.totals.add(group);
            snap.strata
                .entry(FeatureVector::new().stratum_key())
                .or_default()
                .add(group);
        }
        snap.last_committed_day = Some(day(1));

        let resolution = Resolution {
            returning: vec![(
                snap.records[&UserId::new("keep")].clone(),
                CandidateUser::new("keep", FeatureVector::new(), day(2)),
            )],
            retained: vec![snap.records[&UserId::new("hold")].clone()],
            dropped: vec![snap.records[&UserId::new("gone")].clone()],
            unseen: vec![],
            duplicates: 0,
        };
        let allocations = vec![Allocation {
            user: CandidateUser::new("new", FeatureVector::new(), day(2)),
            stratum: FeatureVector::new().stratum_key(),
            group: Group::Control,
        }];

        let commit = build_commit(day(2), &resolution, &allocations);
        assert_eq!(commit.upserts.len(), 2);
        assert_eq!(commit.deletes, vec![UserId::new("gone")]);
        assert_eq!(commit.new_counts, GroupCounts::new(0, 1));

        snap.apply(commit).unwrap();
        assert_eq!(snap.records[&UserId::new("keep")].last_seen_day, day(2));
        assert_eq!(snap.records[&UserId::new("hold")].last_seen_day, day(1));
        assert_eq!(snap.records[&UserId::new("new")].group, Group::Control);
        assert!(snap.get(&UserId::new("gone")).is_none());
        assert_eq!(snap.totals, GroupCounts::new(2, 2));
        assert!(snap.check_integrity().is_ok());
    }
}
