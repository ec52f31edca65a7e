//! Feature normalizer
//!
//! Pure mapping from raw attributes to a [`FeatureVector`]. A user is never
//! dropped for missing data: absent or malformed values land in the
//! unknown bucket unless the audience explicitly rejects them.

use crate::binning::{BinningPlan, FeatureBinning};
use crate::candidate::{CandidateUser, RawAttributes, RawCandidate, UserId};
use crate::feature::{FeatureBucket, FeatureKind, FeatureVector};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What to do with a missing or malformed feature value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownPolicy {
    /// Substitute the reserved unknown bucket
    #[default]
    Bucket,

    /// Fail normalization
    Reject,
}

/// Normalization errors
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    /// Value missing and unknown bucket disabled
    #[error("feature {feature} missing for user {user_id} and unknown bucket is disabled")]
    MissingFeature {
        /// Offending user
        user_id: UserId,
        /// Missing feature
        feature: FeatureKind,
    },

    /// Numeric feature configured without fitted bins
    #[error("no bins fitted for numeric feature {0}")]
    UnfittedFeature(FeatureKind),

    /// Binning policy parameters are invalid
    #[error("invalid binning: {0}")]
    InvalidBinning(String),

    /// Feature listed twice
    #[error("feature {0} listed more than once")]
    DuplicateFeature(FeatureKind),

    /// No features configured
    #[error("feature list is empty")]
    EmptyFeatureList,
}

/// Result of normalizing a day's candidates
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    /// Normalized candidates, input order preserved
    pub users: Vec<CandidateUser>,

    /// Per feature, how many users fell into the unknown bucket
    pub unknown_counts: BTreeMap<FeatureKind, usize>,
}

/// Maps raw attributes onto the configured feature list
#[derive(Debug, Clone)]
pub struct FeatureNormalizer {
    features: Vec<FeatureKind>,
    binning: FeatureBinning,
    unknown_policy: UnknownPolicy,
}

impl FeatureNormalizer {
    /// Create normalizer from frozen bins
    ///
    /// # Errors
    /// - `EmptyFeatureList` / `DuplicateFeature` on a bad feature list
    /// - `UnfittedFeature` if a numeric feature has no bins
    pub fn new(
        features: Vec<FeatureKind>,
        binning: FeatureBinning,
        unknown_policy: UnknownPolicy,
    ) -> Result<Self, NormalizeError> {
        validate_features(&features)?;
        if let Some(kind) = features
            .iter()
            .copied()
            .find(|k| k.is_numeric() && binning.get(*k).is_none())
        {
            return Err(NormalizeError::UnfittedFeature(kind));
        }
        Ok(Self {
            features,
            binning,
            unknown_policy,
        })
    }

    /// Fit bins on `candidates` and create normalizer
    ///
    /// # Errors
    /// Invalid binning plan or feature list
    pub fn fit(
        features: Vec<FeatureKind>,
        plan: &BinningPlan,
        candidates: &[RawCandidate],
        unknown_policy: UnknownPolicy,
    ) -> Result<Self, NormalizeError> {
        validate_features(&features)?;
        plan.validate()?;
        let binning = plan.fit(&features, candidates);
        tracing::debug!(
            candidates = candidates.len(),
            features = binning.iter().count(),
            "fitted numeric bins"
        );
        Self::new(features, binning, unknown_policy)
    }

    /// Configured features, in vector order
    #[inline]
    #[must_use]
    pub fn features(&self) -> &[FeatureKind] {
        &self.features
    }

    /// Frozen bins
    #[inline]
    #[must_use]
    pub fn binning(&self) -> &FeatureBinning {
        &self.binning
    }

    /// Normalize one user's attributes
    ///
    /// # Errors
    /// `MissingFeature` only under [`UnknownPolicy::Reject`]
    pub fn normalize(
        &self,
        user_id: &UserId,
        attributes: &RawAttributes,
    ) -> Result<FeatureVector, NormalizeError> {
        self.features
            .iter()
            .map(|kind| {
                let bucket = self.bucket_for(*kind, attributes);
                if bucket.is_unknown() && self.unknown_policy == UnknownPolicy::Reject {
                    return Err(NormalizeError::MissingFeature {
                        user_id: user_id.clone(),
                        feature: *kind,
                    });
                }
                Ok(bucket)
            })
            .collect()
    }

    /// Normalize every candidate of a day
    ///
    /// # Errors
    /// First rejected user under [`UnknownPolicy::Reject`]
    pub fn normalize_all(
        &self,
        day: NaiveDate,
        candidates: &[RawCandidate],
    ) -> Result<NormalizedBatch, NormalizeError> {
        let mut batch = NormalizedBatch {
            users: Vec::with_capacity(candidates.len()),
            unknown_counts: BTreeMap::new(),
        };

        for candidate in candidates {
            let features = self.normalize(&candidate.user_id, &candidate.attributes)?;
            for (kind, bucket) in self.features.iter().zip(features.iter()) {
                if bucket.is_unknown() {
                    *batch.unknown_counts.entry(*kind).or_default() += 1;
                }
            }
            batch
                .users
                .push(CandidateUser::new(candidate.user_id.clone(), features, day));
        }

        Ok(batch)
    }

    fn bucket_for(&self, kind: FeatureKind, attributes: &RawAttributes) -> FeatureBucket {
        if kind.is_numeric() {
            let value = attributes
                .numeric(kind)
                .filter(|v| v.is_finite() && *v >= 0.0);
            match (value, self.binning.get(kind)) {
                (Some(v), Some(edges)) => FeatureBucket::Numeric(edges.bucket(v)),
                _ => FeatureBucket::Unknown,
            }
        } else {
            match attributes.categorical(kind) {
                Some(text) if !text.trim().is_empty() => FeatureBucket::Categorical(text.to_string()),
                _ => FeatureBucket::Unknown,
            }
        }
    }
}

fn validate_features(features: &[FeatureKind]) -> Result<(), NormalizeError> {
    if features.is_empty() {
        return Err(NormalizeError::EmptyFeatureList);
    }
    for (i, kind) in features.iter().enumerate() {
        if features[..i].contains(kind) {
            return Err(NormalizeError::DuplicateFeature(*kind));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::{BinEdges, BinningPolicy};

    fn fixed_binning() -> FeatureBinning {
        let mut binning = FeatureBinning::default();
        binning.insert(
            FeatureKind::DaysSinceInstall,
            BinEdges::FixedWidth { width: 7.0, count: 4 },
        );
        binning.insert(FeatureKind::SessionCount, BinEdges::Edges(vec![0.0, 5.0, 20.0]));
        binning
    }

    fn normalizer(policy: UnknownPolicy) -> FeatureNormalizer {
        FeatureNormalizer::new(FeatureKind::ALL.to_vec(), fixed_binning(), policy).unwrap()
    }

    #[test]
    fn full_attributes_map_to_buckets() {
        let attrs = RawAttributes {
            days_since_install: Some(8.0),
            session_count: Some(6.0),
            device_brand: Some("acme".into()),
            os_version: Some("14.2".into()),
            acquisition_source: Some("organic".into()),
        };
        let v = normalizer(UnknownPolicy::Bucket)
            .normalize(&UserId::new("u"), &attrs)
            .unwrap();

        let expected: FeatureVector = vec![
            FeatureBucket::Numeric(1),
            FeatureBucket::Numeric(2),
            FeatureBucket::Categorical("acme".into()),
            FeatureBucket::Categorical("14.2".into()),
            FeatureBucket::Categorical("organic".into()),
        ]
        .into_iter()
        .collect();
        assert_eq!(v, expected);
    }

    #[test]
    fn missing_and_malformed_become_unknown() {
        let attrs = RawAttributes {
            days_since_install: Some(f64::NAN),
            session_count: Some(-3.0),
            device_brand: Some("   ".into()),
            os_version: None,
            acquisition_source: Some("ads".into()),
        };
        let v = normalizer(UnknownPolicy::Bucket)
            .normalize(&UserId::new("u"), &attrs)
            .unwrap();
        assert_eq!(v.iter().filter(|b| b.is_unknown()).count(), 4);
        assert_eq!(v.get(4), Some(&FeatureBucket::Categorical("ads".into())));
    }

    #[test]
    fn reject_policy_surfaces_missing_feature() {
        let err = normalizer(UnknownPolicy::Reject)
            .normalize(&UserId::new("u7"), &RawAttributes::default())
            .unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::MissingFeature { feature: FeatureKind::DaysSinceInstall, .. }
        ));
        assert!(err.to_string().contains("u7"));
    }

    #[test]
    fn feature_subset_controls_vector_shape() {
        let n = FeatureNormalizer::new(
            vec![FeatureKind::DeviceBrand, FeatureKind::SessionCount],
            fixed_binning(),
            UnknownPolicy::Bucket,
        )
        .unwrap();
        let attrs = RawAttributes {
            session_count: Some(1.0),
            device_brand: Some("acme".into()),
            ..RawAttributes::default()
        };
        let v = n.normalize(&UserId::new("u"), &attrs).unwrap();
        assert_eq!(v.len(), 2);
        assert_eq!(v.get(0), Some(&FeatureBucket::Categorical("acme".into())));
        assert_eq!(v.get(1), Some(&FeatureBucket::Numeric(1)));
    }

    #[test]
    fn rejects_bad_feature_lists() {
        assert!(matches!(
            FeatureNormalizer::new(vec![], fixed_binning(), UnknownPolicy::Bucket),
            Err(NormalizeError::EmptyFeatureList)
        ));
        assert!(matches!(
            FeatureNormalizer::new(
                vec![FeatureKind::OsVersion, FeatureKind::OsVersion],
                fixed_binning(),
                UnknownPolicy::Bucket
            ),
            Err(NormalizeError::DuplicateFeature(FeatureKind::OsVersion))
        ));
        assert!(matches!(
            FeatureNormalizer::new(
                vec![FeatureKind::SessionCount],
                FeatureBinning::default(),
                UnknownPolicy::Bucket
            ),
            Err(NormalizeError::UnfittedFeature(FeatureKind::SessionCount))
        ));
    }

    #[test]
    fn fit_rejects_invalid_plan() {
        let plan = BinningPlan {
            session_count: BinningPolicy::Quantile { percentiles: vec![0.9, 0.1] },
            ..BinningPlan::default()
        };
        let result = FeatureNormalizer::fit(
            FeatureKind::ALL.to_vec(),
            &plan,
            &[],
            UnknownPolicy::Bucket,
        );
        assert!(matches!(result, Err(NormalizeError::InvalidBinning(_))));
    }

    #[test]
    fn normalize_all_counts_unknowns() {
        let candidates = vec![
            RawCandidate::new("a", RawAttributes::default()),
            RawCandidate::new(
                "b",
                RawAttributes {
                    device_brand: Some("acme".into()),
                    ..RawAttributes::default()
                },
            ),
        ];
        let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let batch = normalizer(UnknownPolicy::Bucket)
            .normalize_all(day, &candidates)
            .unwrap();
        assert_eq!(batch.users.len(), 2);
        assert_eq!(batch.unknown_counts[&FeatureKind::DeviceBrand], 1);
        assert_eq!(batch.unknown_counts[&FeatureKind::SessionCount], 2);
    }
}
