//! Balance diagnostics
//!
//! Reported alongside a day's counts, never a reason to fail a split.

use cohort_features::{FeatureBucket, FeatureKind, FeatureVector};
use cohort_store::{Group, GroupCounts};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Distribution distance between TEST and CONTROL for one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureBalance {
    /// Feature compared
    pub feature: FeatureKind,

    /// TEST users contributing
    pub test_users: usize,

    /// CONTROL users contributing
    pub control_users: usize,

    /// Largest gap between the two cumulative bucket distributions,
    /// `None` when either side is empty
    pub max_cdf_gap: Option<f64>,
}

/// Per-feature balance of one day's sets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceReport {
    /// One entry per configured feature, in vector order
    pub features: Vec<FeatureBalance>,
}

impl BalanceReport {
    /// Compare bucket distributions of every feature position
    ///
    /// `users` pairs each user's group with the feature vector observed for
    /// it; vectors are expected to follow `features` order.
    pub fn compute<'a>(
        features: &[FeatureKind],
        users: impl IntoIterator<Item = (Group, &'a FeatureVector)>,
    ) -> Self {
        let mut histograms: Vec<BTreeMap<&FeatureBucket, GroupCounts>> = vec![BTreeMap::new(); features.len()];
        for (group, vector) in users {
            for (histogram, bucket) in histograms.iter_mut().zip(vector.iter()) {
                histogram.entry(bucket).or_default().add(group);
            }
        }

        let features = features
            .iter()
            .zip(histograms)
            .map(|(feature, histogram)| {
                let totals = histogram.values().fold(GroupCounts::default(), |acc, c| acc.plus(*c));
                FeatureBalance {
                    feature: *feature,
                    test_users: usize::try_from(totals.test).unwrap_or(usize::MAX),
                    control_users: usize::try_from(totals.control).unwrap_or(usize::MAX),
                    max_cdf_gap: max_cdf_gap(&histogram, totals),
                }
            })
            .collect();

        Self { features }
    }

    /// Feature with the largest gap
    #[must_use]
    pub fn worst(&self) -> Option<&FeatureBalance> {
        self.features
            .iter()
            .filter(|f| f.max_cdf_gap.is_some())
            .max_by(|a, b| a.max_cdf_gap.partial_cmp(&b.max_cdf_gap).unwrap_or(std::cmp::Ordering::Equal))
    }
}

#[allow(clippy::cast_precision_loss)]
fn max_cdf_gap(histogram: &BTreeMap<&FeatureBucket, GroupCounts>, totals: GroupCounts) -> Option<f64> {
    if totals.test == 0 || totals.control == 0 {
        return None;
    }
    let mut running = GroupCounts::default();
    let mut gap: f64 = 0.0;
    for counts in histogram.values() {
        running = running.plus(*counts);
        let test_cdf = running.test as f64 / totals.test as f64;
        let control_cdf = running.control as f64 / totals.control as f64;
        gap = gap.max((test_cdf - control_cdf).abs());
    }
    Some(gap)
}

/// Realized TEST share versus the configured ratio
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatioDrift {
    /// Configured split ratio
    pub target: f64,

    /// `total_test / (total_test + total_control)`, `None` before any assignment
    pub realized: Option<f64>,

    /// Accepted absolute deviation
    pub tolerance: f64,

    /// Deviation exceeded the tolerance on a large enough population
    pub warning: bool,
}

impl RatioDrift {
    /// Evaluate drift of cumulative totals
    ///
    /// Populations smaller than `1 / tolerance` are never flagged: one user
    /// more or less already moves the ratio by more than the tolerance there.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn check(totals: GroupCounts, target: f64, tolerance: f64) -> Self {
        let realized = totals.test_share();
        let large_enough = tolerance > 0.0 && totals.total() as f64 >= 1.0 / tolerance;
        let warning = match realized {
            Some(share) => large_enough && (share - target).abs() > tolerance,
            None => false,
        };
        Self {
            target,
            realized,
            tolerance,
            warning,
        }
    }
}
