//! Stratified allocator
//!
//! Assigns every unseen user to TEST or CONTROL.
//!
//! # Algorithm
//!
//! 1. Group users by stratum (full feature vector).
//! 2. Visit strata from rarest to most common, ties by stratum key.
//! 3. Inside a stratum, visit users by `(UserHash(seed, user_id), user_id)`.
//! 4. For each user, compare the deficits of both groups against the
//!    cumulative totals including this user:
//!    `test_deficit = r * (n + 1) - test`, `control_deficit = (1 - r) * (n + 1) - control`.
//!    The larger deficit wins; a tie goes to TEST. The comparison runs on
//!    integers with the ratio held in millionths, so exact ties are exact.
//! 5. Update the global and per-stratum running counts after each user.
//!    Only the global counts steer the choice; stratum balance comes from
//!    visiting each stratum's users consecutively.
//!
//! Only the running counts and the seed influence the result, so a rerun on
//! the same inputs produces the same assignment.

use crate::error::SplitError;
use cohort_features::{CandidateUser, StratumKey, UserHash};
use cohort_store::{Group, GroupCounts};
use std::collections::BTreeMap;

/// Running counts carried across days
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationState {
    /// Cumulative records ever created, per group
    pub totals: GroupCounts,

    /// Cumulative records ever created, per stratum and group
    ///
    /// Diagnostic only: persisted and logged, never read by
    /// [`StratifiedAllocator::choose`].
    pub strata: BTreeMap<StratumKey, GroupCounts>,
}

impl AllocationState {
    /// Start from persisted counters
    #[inline]
    #[must_use]
    pub fn new(totals: GroupCounts, strata: BTreeMap<StratumKey, GroupCounts>) -> Self {
        Self { totals, strata }
    }

    fn record(&mut self, stratum: &StratumKey, group: Group) {
        self.totals.add(group);
        self.strata.entry(stratum.clone()).or_default().add(group);
    }
}

/// One newly allocated user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// The user, with the features it was stratified on
    pub user: CandidateUser,

    /// Stratum the user was allocated in
    pub stratum: StratumKey,

    /// Assigned group
    pub group: Group,
}

/// Resolution of the TEST share in deficit comparisons
const RATIO_SCALE: u64 = 1_000_000;

/// Deterministic, seedable stratified allocator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StratifiedAllocator {
    ratio: f64,
    /// `ratio` in millionths, at least 1
    ratio_parts: u64,
    seed: u64,
}

impl StratifiedAllocator {
    /// Create allocator for a target TEST share
    ///
    /// # Errors
    /// `SplitError::InvalidRatio` unless `0 < ratio <= 1`
    pub fn new(ratio: f64, seed: u64) -> Result<Self, SplitError> {
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(SplitError::InvalidRatio(ratio));
        }
        // 0 < ratio <= 1, so the product fits and is non-negative
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let ratio_parts = ((ratio * RATIO_SCALE as f64).round() as u64).clamp(1, RATIO_SCALE);
        Ok(Self {
            ratio,
            ratio_parts,
            seed,
        })
    }

    /// Target TEST share
    #[inline]
    #[must_use]
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Hash seed
    #[inline]
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Group the next user goes to, given cumulative counts
    #[must_use]
    pub fn choose(&self, totals: GroupCounts) -> Group {
        let scale = i128::from(RATIO_SCALE);
        let parts = i128::from(self.ratio_parts);
        let next = i128::from(totals.test) + i128::from(totals.control) + 1;

        // both deficits scaled by RATIO_SCALE
        let test_deficit = parts * next - i128::from(totals.test) * scale;
        let control_deficit = (scale - parts) * next - i128::from(totals.control) * scale;

        if test_deficit >= control_deficit {
            Group::Test
        } else {
            Group::Control
        }
    }

    /// Allocate every user, updating `state` as it goes
    ///
    /// Returns allocations in the order they were made. An empty input
    /// yields no allocations.
    pub fn allocate(&self, unseen: Vec<CandidateUser>, state: &mut AllocationState) -> Vec<Allocation> {
        let mut strata: BTreeMap<StratumKey, Vec<(UserHash, CandidateUser)>> = BTreeMap::new();
        for user in unseen {
            let hash = UserHash::compute(self.seed, &user.user_id);
            strata.entry(user.stratum()).or_default().push((hash, user));
        }

        // BTreeMap iteration gives key order; the stable sort keeps it for equal sizes
        let mut ordered: Vec<(StratumKey, Vec<(UserHash, CandidateUser)>)> = strata.into_iter().collect();
        ordered.sort_by_key(|(_, users)| users.len());

        let mut allocations = Vec::with_capacity(ordered.iter().map(|(_, u)| u.len()).sum());
        for (stratum, mut users) in ordered {
            users.sort_by(|(ha, a), (hb, b)| ha.cmp(hb).then_with(|| a.user_id.cmp(&b.user_id)));

            let before = state.strata.get(&stratum).copied().unwrap_or_default();
            for (_, user) in users {
                let group = self.choose(state.totals);
                state.record(&stratum, group);
                allocations.push(Allocation {
                    user,
                    stratum: stratum.clone(),
                    group,
                });
            }
            let after = state.strata.get(&stratum).copied().unwrap_or_default();
            tracing::trace!(
                %stratum,
                test = after.test - before.test,
                control = after.control - before.control,
                "stratum allocated"
            );
        }

        tracing::debug!(
            allocated = allocations.len(),
            total_test = state.totals.test,
            total_control = state.totals.control,
            "unseen users allocated"
        );
        allocations
    }
}
