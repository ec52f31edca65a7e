//! Audience state and day commits
//!
//! [`AffinitySnapshot`] is the whole persisted state of one audience.
//! [`DayCommit`] is the delta produced by one day's split. Applying a commit
//! validates every part of it first, so a snapshot is either fully advanced
//! to the commit day or left exactly as it was.

use crate::record::{AssignmentRecord, AudienceName, GroupCounts};
use crate::store::{CommitAck, StoreError};
use chrono::NaiveDate;
use cohort_features::{FeatureBinning, StratumKey, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Persisted state of one audience
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffinitySnapshot {
    /// Audience this state belongs to
    pub audience: AudienceName,

    /// Most recent committed day
    #[serde(default)]
    pub last_committed_day: Option<NaiveDate>,

    /// Live assignment records, keyed by user
    #[serde(default)]
    pub records: BTreeMap<UserId, AssignmentRecord>,

    /// Cumulative count of every record ever created, per group
    #[serde(default)]
    pub totals: GroupCounts,

    /// Cumulative per-stratum allocation counts
    #[serde(default, with = "strata_entries")]
    pub strata: BTreeMap<StratumKey, GroupCounts>,

    /// Numeric bins frozen on the first non-empty day
    #[serde(default)]
    pub binning: Option<FeatureBinning>,
}

/// Changes produced by one day's split
#[derive(Debug, Clone, PartialEq)]
pub struct DayCommit {
    /// Day being committed
    pub day: NaiveDate,

    /// New records and refreshed records
    pub upserts: Vec<AssignmentRecord>,

    /// Users whose records are removed
    pub deletes: Vec<UserId>,

    /// Increments to the cumulative totals (one per newly created record)
    pub new_counts: GroupCounts,

    /// Increments to the cumulative per-stratum counts
    pub stratum_increments: BTreeMap<StratumKey, GroupCounts>,

    /// Bins to freeze, only when none are stored yet
    pub binning: Option<FeatureBinning>,
}

impl DayCommit {
    /// Empty commit for a day
    #[inline]
    #[must_use]
    pub fn new(day: NaiveDate) -> Self {
        Self {
            day,
            upserts: Vec::new(),
            deletes: Vec::new(),
            new_counts: GroupCounts::default(),
            stratum_increments: BTreeMap::new(),
            binning: None,
        }
    }
}

impl AffinitySnapshot {
    /// State of an audience that was never written
    #[inline]
    #[must_use]
    pub fn empty(audience: AudienceName) -> Self {
        Self {
            audience,
            last_committed_day: None,
            records: BTreeMap::new(),
            totals: GroupCounts::default(),
            strata: BTreeMap::new(),
            binning: None,
        }
    }

    /// Look up a user's record
    #[inline]
    #[must_use]
    pub fn get(&self, user_id: &UserId) -> Option<&AssignmentRecord> {
        self.records.get(user_id)
    }

    /// Live records per group
    #[must_use]
    pub fn live_counts(&self) -> GroupCounts {
        let mut counts = GroupCounts::default();
        for record in self.records.values() {
            counts.add(record.group);
        }
        counts
    }

    /// Validate a commit against this state without applying it
    ///
    /// # Errors
    /// The first violated rule: day ordering, duplicate users, group flips,
    /// `last_seen_day` regressions, unknown deletes, counter mismatches, or
    /// replacing frozen bins
    pub fn validate_commit(&self, commit: &DayCommit) -> Result<(), StoreError> {
        if let Some(last_committed) = self.last_committed_day {
            if commit.day <= last_committed {
                return Err(StoreError::DayOutOfOrder {
                    last_committed,
                    day: commit.day,
                });
            }
        }

        let mut touched: HashSet<&UserId> = HashSet::new();
        let mut created = GroupCounts::default();

        for record in &commit.upserts {
            if !touched.insert(&record.user_id) {
                return Err(StoreError::ConflictingCommit(record.user_id.clone()));
            }
            let existing = self.records.get(&record.user_id);
            let regression = StoreError::LastSeenRegression {
                user_id: record.user_id.clone(),
                existing: existing.map(|r| r.last_seen_day),
                attempted: record.last_seen_day,
                day: commit.day,
            };
            if record.last_seen_day > commit.day {
                return Err(regression);
            }
            match existing {
                Some(existing) => {
                    if existing.group != record.group {
                        return Err(StoreError::AffinityViolation {
                            user_id: record.user_id.clone(),
                            existing: existing.group,
                            attempted: record.group,
                        });
                    }
                    if record.last_seen_day < existing.last_seen_day {
                        return Err(regression);
                    }
                }
                None => created.add(record.group),
            }
        }

        for user_id in &commit.deletes {
            if !touched.insert(user_id) {
                return Err(StoreError::ConflictingCommit(user_id.clone()));
            }
            if !self.records.contains_key(user_id) {
                return Err(StoreError::UnknownRecord(user_id.clone()));
            }
        }

        let stratum_sum = commit
            .stratum_increments
            .values()
            .fold(GroupCounts::default(), |acc, c| acc.plus(*c));
        for declared in [commit.new_counts, stratum_sum] {
            if declared != created {
                return Err(StoreError::CounterMismatch {
                    declared: (declared.test, declared.control),
                    actual: (created.test, created.control),
                });
            }
        }

        if let (Some(stored), Some(proposed)) = (&self.binning, &commit.binning) {
            if stored != proposed {
                return Err(StoreError::BinningFrozen);
            }
        }

        Ok(())
    }

    /// Validate, then apply a commit
    ///
    /// # Errors
    /// See [`Self::validate_commit`]; on error `self` is unchanged
    pub fn apply(&mut self, commit: DayCommit) -> Result<CommitAck, StoreError> {
        self.validate_commit(&commit)?;

        for user_id in &commit.deletes {
            self.records.remove(user_id);
        }
        for record in commit.upserts {
            self.records.insert(record.user_id.clone(), record);
        }
        self.totals = self.totals.plus(commit.new_counts);
        for (stratum, increment) in commit.stratum_increments {
            let entry = self.strata.entry(stratum).or_default();
            *entry = entry.plus(increment);
        }
        if self.binning.is_none() {
            self.binning = commit.binning;
        }
        self.last_committed_day = Some(commit.day);

        Ok(CommitAck {
            day: commit.day,
            live_records: self.records.len(),
        })
    }

    /// Internal consistency of persisted state
    ///
    /// # Errors
    /// Description of the first inconsistency found
    pub fn check_integrity(&self) -> Result<(), String> {
        for (key, record) in &self.records {
            if key != &record.user_id {
                return Err(format!("record keyed {key} holds user {}", record.user_id));
            }
            if record.assigned_day > record.last_seen_day {
                return Err(format!("user {key} assigned after it was last seen"));
            }
            match self.last_committed_day {
                Some(last) if record.last_seen_day <= last => {}
                _ => return Err(format!("user {key} seen after the last committed day")),
            }
        }

        let live = self.live_counts();
        if live.test > self.totals.test || live.control > self.totals.control {
            return Err(format!(
                "live records {live:?} exceed cumulative totals {:?}",
                self.totals
            ));
        }

        let strata_sum = self
            .strata
            .values()
            .fold(GroupCounts::default(), |acc, c| acc.plus(*c));
        if strata_sum != self.totals {
            return Err(format!(
                "stratum counts {strata_sum:?} disagree with totals {:?}",
                self.totals
            ));
        }
        Ok(())
    }
}

mod strata_entries {
    use crate::record::GroupCounts;
    use cohort_features::StratumKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    #[derive(Serialize)]
    struct EntryRef<'a> {
        stratum: &'a StratumKey,
        counts: GroupCounts,
    }

    #[derive(Deserialize)]
    struct Entry {
        stratum: StratumKey,
        counts: GroupCounts,
    }

    pub(super) fn serialize<S>(
        map: &BTreeMap<StratumKey, GroupCounts>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(map.iter().map(|(stratum, counts)| EntryRef {
            stratum,
            counts: *counts,
        }))
    }

    pub(super) fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<BTreeMap<StratumKey, GroupCounts>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let entries = Vec::<Entry>::deserialize(deserializer)?;
        Ok(entries.into_iter().map(|e| (e.stratum, e.counts)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Group;
    use cohort_features::{FeatureBucket, FeatureVector};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    fn audience() -> AudienceName {
        AudienceName::new("lapsed").unwrap()
    }

    fn stratum(tag: &str) -> StratumKey {
        let v: FeatureVector = vec![FeatureBucket::Categorical(tag.into())].into_iter().collect();
        v.stratum_key()
    }

    fn first_day_commit() -> DayCommit {
        let mut commit = DayCommit::new(day(1));
        commit.upserts = vec![
            AssignmentRecord::allocated(UserId::new("u1"), Group::Test, day(1)),
            AssignmentRecord::allocated(UserId::new("u2"), Group::Control, day(1)),
        ];
        commit.new_counts = GroupCounts::new(1, 1);
        commit.stratum_increments.insert(stratum("a"), GroupCounts::new(1, 1));
        commit
    }

    #[test]
    fn apply_first_day() {
        let mut snap = AffinitySnapshot::empty(audience());
        let ack = snap.apply(first_day_commit()).unwrap();

        assert_eq!(ack.live_records, 2);
        assert_eq!(snap.last_committed_day, Some(day(1)));
        assert_eq!(snap.totals, GroupCounts::new(1, 1));
        assert_eq!(snap.strata[&stratum("a")], GroupCounts::new(1, 1));
        assert!(snap.check_integrity().is_ok());
    }

    #[test]
    fn rejects_same_or_earlier_day() {
        let mut snap = AffinitySnapshot::empty(audience());
        snap.apply(first_day_commit()).unwrap();

        let err = snap.apply(DayCommit::new(day(1))).unwrap_err();
        assert!(matches!(err, StoreError::DayOutOfOrder { .. }));
    }

    #[test]
    fn rejects_group_flip_and_leaves_state_untouched() {
        let mut snap = AffinitySnapshot::empty(audience());
        snap.apply(first_day_commit()).unwrap();
        let before = snap.clone();

        let mut commit = DayCommit::new(day(2));
        commit.deletes = vec![UserId::new("u2")];
        commit.upserts = vec![AssignmentRecord::allocated(UserId::new("u1"), Group::Control, day(2))];

        let err = snap.apply(commit).unwrap_err();
        assert!(matches!(err, StoreError::AffinityViolation { .. }));
        assert_eq!(snap, before);
    }

    #[test]
    fn rejects_last_seen_regression() {
        let mut snap = AffinitySnapshot::empty(audience());
        snap.apply(first_day_commit()).unwrap();

        let mut commit = DayCommit::new(day(3));
        commit.upserts = vec![AssignmentRecord {
            user_id: UserId::new("u1"),
            group: Group::Test,
            last_seen_day: day(4),
            assigned_day: day(1),
        }];
        assert!(matches!(
            snap.apply(commit).unwrap_err(),
            StoreError::LastSeenRegression { .. }
        ));
    }

    #[test]
    fn rejects_unknown_delete_and_duplicates() {
        let snap = AffinitySnapshot::empty(audience());
        let mut commit = DayCommit::new(day(1));
        commit.deletes = vec![UserId::new("ghost")];
        assert!(matches!(
            snap.validate_commit(&commit),
            Err(StoreError::UnknownRecord(_))
        ));

        let mut commit = first_day_commit();
        commit.deletes = vec![UserId::new("u1")];
        assert!(matches!(
            snap.validate_commit(&commit),
            Err(StoreError::ConflictingCommit(_))
        ));
    }

    #[test]
    fn rejects_counter_mismatch() {
        let snap = AffinitySnapshot::empty(audience());
        let mut commit = first_day_commit();
        commit.new_counts = GroupCounts::new(2, 0);
        assert!(matches!(
            snap.validate_commit(&commit),
            Err(StoreError::CounterMismatch { .. })
        ));

        let mut commit = first_day_commit();
        commit.stratum_increments.clear();
        assert!(matches!(
            snap.validate_commit(&commit),
            Err(StoreError::CounterMismatch { .. })
        ));
    }

    #[test]
    fn binning_is_frozen_once_stored() {
        use cohort_features::{BinEdges, FeatureKind};

        let mut first = FeatureBinning::default();
        first.insert(FeatureKind::SessionCount, BinEdges::Edges(vec![0.0, 3.0]));
        let mut other = FeatureBinning::default();
        other.insert(FeatureKind::SessionCount, BinEdges::Edges(vec![0.0, 9.0]));

        let mut snap = AffinitySnapshot::empty(audience());
        let mut commit = first_day_commit();
        commit.binning = Some(first.clone());
        snap.apply(commit).unwrap();
        assert_eq!(snap.binning.as_ref(), Some(&first));

        let mut commit = DayCommit::new(day(2));
        commit.binning = Some(other);
        assert!(matches!(snap.apply(commit), Err(StoreError::BinningFrozen)));
    }

    #[test]
    fn integrity_detects_inconsistent_totals() {
        let mut snap = AffinitySnapshot::empty(audience());
        snap.apply(first_day_commit()).unwrap();
        snap.totals = GroupCounts::new(0, 1);
        assert!(snap.check_integrity().is_err());
    }

    #[test]
    fn snapshot_serde_roundtrip_keeps_strata() {
        let mut snap = AffinitySnapshot::empty(audience());
        snap.apply(first_day_commit()).unwrap();

        let json = serde_json::to_string(&snap).unwrap();
        let decoded: AffinitySnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, snap);
    }
}
