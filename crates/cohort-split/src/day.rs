//! One day's split, end to end
//!
//! Resolver, allocator, assembler and commit builder chained over an
//! [`AffinitySnapshot`]. Pure: the caller reads the snapshot and applies the
//! returned commit.

use crate::allocator::{AllocationState, StratifiedAllocator};
use crate::assembler::{assemble, DaySplitResult};
use crate::diagnostics::{BalanceReport, RatioDrift};
use crate::error::SplitError;
use crate::resolver::RetentionResolver;
use crate::writer::build_commit;
use chrono::NaiveDate;
use cohort_features::{CandidateUser, FeatureKind};
use cohort_store::{AffinitySnapshot, DayCommit};

/// Parameters of an audience's split
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitParams {
    /// Target TEST share, `(0, 1]`
    pub split_ratio: f64,

    /// Retention window for absent TEST users, in days
    pub ttl: u32,

    /// Seed of the allocation order
    pub hash_seed: u64,

    /// Accepted deviation of the realized ratio
    pub drift_tolerance: f64,
}

impl Default for SplitParams {
    fn default() -> Self {
        Self {
            split_ratio: 0.5,
            ttl: 1,
            hash_seed: 0,
            drift_tolerance: 0.05,
        }
    }
}

/// Everything one day's split produced
#[derive(Debug, Clone)]
pub struct DaySplit {
    /// Final sets and counts
    pub result: DaySplitResult,

    /// Changes to apply to the affinity store
    pub commit: DayCommit,

    /// Users present today that already had a record
    pub returning_count: usize,

    /// Absent TEST users kept by their retention window
    pub retained_count: usize,

    /// Records removed today
    pub dropped_count: usize,

    /// Candidate rows ignored as repeats
    pub duplicate_count: usize,

    /// Per-feature balance of users observed today
    pub balance: BalanceReport,

    /// Realized ratio check on cumulative totals
    pub drift: RatioDrift,
}

/// Computes day splits for one audience
#[derive(Debug, Clone)]
pub struct DaySplitter {
    resolver: RetentionResolver,
    allocator: StratifiedAllocator,
    features: Vec<FeatureKind>,
    drift_tolerance: f64,
}

impl DaySplitter {
    /// Create splitter
    ///
    /// # Errors
    /// `InvalidRatio` / `InvalidTtl` on out-of-range parameters
    pub fn new(params: SplitParams, features: Vec<FeatureKind>) -> Result<Self, SplitError> {
        Ok(Self {
            resolver: RetentionResolver::new(params.ttl)?,
            allocator: StratifiedAllocator::new(params.split_ratio, params.hash_seed)?,
            features,
            drift_tolerance: params.drift_tolerance,
        })
    }

    /// Retention resolver in use
    #[inline]
    #[must_use]
    pub fn resolver(&self) -> &RetentionResolver {
        &self.resolver
    }

    /// Allocator in use
    #[inline]
    #[must_use]
    pub fn allocator(&self) -> &StratifiedAllocator {
        &self.allocator
    }

    /// Split `candidates` for `day` against the audience's current state
    ///
    /// Candidates are expected to carry vectors built for this splitter's
    /// feature list. Users that already have a record keep their group no
    /// matter how their features changed.
    ///
    /// # Errors
    /// See [`RetentionResolver::resolve`]
    pub fn split(
        &self,
        snapshot: &AffinitySnapshot,
        day: NaiveDate,
        candidates: Vec<CandidateUser>,
    ) -> Result<DaySplit, SplitError> {
        let mut resolution = self.resolver.resolve(snapshot, day, candidates)?;

        let mut state = AllocationState::new(snapshot.totals, snapshot.strata.clone());
        let allocations = self
            .allocator
            .allocate(std::mem::take(&mut resolution.unseen), &mut state);

        let result = assemble(day, &resolution, &allocations, state.totals);
        let commit = build_commit(day, &resolution, &allocations);

        let observed = resolution
            .returning
            .iter()
            .map(|(record, user)| (record.group, &user.features))
            .chain(allocations.iter().map(|a| (a.group, &a.user.features)));
        let balance = BalanceReport::compute(&self.features, observed);
        let drift = RatioDrift::check(state.totals, self.allocator.ratio(), self.drift_tolerance);

        Ok(DaySplit {
            result,
            commit,
            returning_count: resolution.returning.len(),
            retained_count: resolution.retained.len(),
            dropped_count: resolution.dropped.len(),
            duplicate_count: resolution.duplicates,
            balance,
            drift,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_features::{FeatureBucket, FeatureVector, UserId};
    use cohort_store::{AudienceName, Group, GroupCounts};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, d).unwrap()
    }

    fn users(ids: &[&str], d: NaiveDate) -> Vec<CandidateUser> {
        ids.iter()
            .map(|id| {
                let v: FeatureVector = std::iter::once(FeatureBucket::Categorical("acme".into())).collect();
                CandidateUser::new(*id, v, d)
            })
            .collect()
    }

    #[test]
    fn split_then_apply_round() {
        let splitter = DaySplitter::new(
            SplitParams {
                ttl: 3,
                ..SplitParams::default()
            },
            vec![FeatureKind::DeviceBrand],
        )
        .unwrap();
        let mut snap = AffinitySnapshot::empty(AudienceName::new("s").unwrap());

        let split = splitter.split(&snap, day(1), users(&["a", "b", "c", "d"], day(1))).unwrap();
        assert_eq!(split.result.new_test_count, 2);
        assert_eq!(split.result.new_control_count, 2);
        assert_eq!(split.balance.features[0].max_cdf_gap, Some(0.0));
        snap.apply(split.commit).unwrap();

        let split = splitter.split(&snap, day(2), vec![]).unwrap();
        assert_eq!(split.retained_count, 2);
        assert_eq!(split.dropped_count, 2);
        assert_eq!(split.result.test_user_count(), 2);
        assert_eq!(split.result.control_user_count(), 0);
        assert_eq!(split.result.totals(), GroupCounts::new(2, 2));
        snap.apply(split.commit).unwrap();
        assert_eq!(snap.records.len(), 2);
        assert!(snap.records.values().all(|r| r.group == Group::Test));
    }

    #[test]
    fn returning_user_keeps_group_despite_new_features() {
        let splitter = DaySplitter::new(SplitParams::default(), vec![FeatureKind::DeviceBrand]).unwrap();
        let mut snap = AffinitySnapshot::empty(AudienceName::new("s").unwrap());
        let split = splitter.split(&snap, day(1), users(&["x"], day(1))).unwrap();
        let group = split.result.group_of(&UserId::new("x")).unwrap();
        snap.apply(split.commit).unwrap();

        let changed: FeatureVector = std::iter::once(FeatureBucket::Unknown).collect();
        let split = splitter
            .split(&snap, day(2), vec![CandidateUser::new("x", changed, day(2))])
            .unwrap();
        assert_eq!(split.result.group_of(&UserId::new("x")), Some(group));
        assert_eq!(split.result.new_test_count + split.result.new_control_count, 0);
        assert_eq!(split.returning_count, 1);
    }
}
