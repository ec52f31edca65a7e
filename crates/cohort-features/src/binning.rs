//! Numeric bucketing
//!
//! Bin edges are determined once per audience: quantile edges are fitted on
//! the first non-empty day and then frozen, fixed-width bins need no fitting.

use crate::candidate::RawCandidate;
use crate::feature::FeatureKind;
use crate::normalizer::NormalizeError;
use serde::{Deserialize, Serialize};

/// Default quantile cut points
pub const DEFAULT_PERCENTILES: [f64; 4] = [0.2, 0.4, 0.6, 0.8];

/// How a numeric feature is bucketed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BinningPolicy {
    /// Edges at the given quantiles of the first observed population
    Quantile {
        /// Cut points, strictly increasing, each in (0, 1)
        percentiles: Vec<f64>,
    },

    /// `count` bins of equal `width` starting at zero, last bin open-ended
    FixedWidth {
        /// Bin width
        width: f64,
        /// Number of bins
        count: u32,
    },
}

impl Default for BinningPolicy {
    fn default() -> Self {
        Self::Quantile {
            percentiles: DEFAULT_PERCENTILES.to_vec(),
        }
    }
}

impl BinningPolicy {
    /// Check the policy parameters
    ///
    /// # Errors
    /// `NormalizeError::InvalidBinning` on empty/out-of-range/non-increasing
    /// percentiles or a non-positive width/count
    pub fn validate(&self) -> Result<(), NormalizeError> {
        match self {
            Self::Quantile { percentiles } => {
                if percentiles.is_empty() {
                    return Err(NormalizeError::InvalidBinning("no percentiles".to_string()));
                }
                if percentiles.iter().any(|p| !(*p > 0.0 && *p < 1.0)) {
                    return Err(NormalizeError::InvalidBinning(format!(
                        "percentiles must lie in (0, 1): {percentiles:?}"
                    )));
                }
                if percentiles.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(NormalizeError::InvalidBinning(format!(
                        "percentiles must be strictly increasing: {percentiles:?}"
                    )));
                }
                Ok(())
            }
            Self::FixedWidth { width, count } => {
                if !(width.is_finite() && *width > 0.0) || *count == 0 {
                    return Err(NormalizeError::InvalidBinning(format!(
                        "fixed width needs width > 0 and count > 0 (width {width}, count {count})"
                    )));
                }
                Ok(())
            }
        }
    }

    /// Freeze the policy into concrete bins using the observed values
    #[must_use]
    pub fn fit(&self, values: &[f64]) -> BinEdges {
        match self {
            Self::Quantile { percentiles } => BinEdges::Edges(quantile_edges(values, percentiles)),
            Self::FixedWidth { width, count } => BinEdges::FixedWidth {
                width: *width,
                count: *count,
            },
        }
    }
}

/// Concrete, frozen bins for one numeric feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinEdges {
    /// Sorted edges starting at 0.0; bucket = number of edges below the value
    Edges(Vec<f64>),

    /// Equal-width bins
    FixedWidth {
        /// Bin width
        width: f64,
        /// Number of bins, the last one open-ended
        count: u32,
    },
}

impl BinEdges {
    /// Bucket index for a valid (finite, non-negative) value
    #[must_use]
    pub fn bucket(&self, value: f64) -> u32 {
        match self {
            Self::Edges(edges) => {
                let idx = edges.partition_point(|edge| *edge < value);
                u32::try_from(idx).unwrap_or(u32::MAX)
            }
            Self::FixedWidth { width, count } => {
                let raw = (value / width).floor();
                let last = count.saturating_sub(1);
                if raw >= f64::from(last) {
                    last
                } else {
                    // 0 <= raw < last, fits in u32
                    raw as u32
                }
            }
        }
    }

    /// Number of distinct buckets a valid value can land in
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        match self {
            Self::Edges(edges) => edges.len() + 1,
            Self::FixedWidth { count, .. } => *count as usize,
        }
    }
}

/// Quantile edges prefixed with `0.0`
///
/// Quantiles use linear interpolation between order statistics. Duplicates
/// and edges not above zero are dropped, so the result is strictly
/// increasing and always starts with `0.0`.
#[must_use]
pub fn quantile_edges(values: &[f64], percentiles: &[f64]) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(f64::total_cmp);

    let mut edges = vec![0.0];
    if sorted.is_empty() {
        return edges;
    }

    let mut cuts: Vec<f64> = percentiles.iter().map(|q| quantile(&sorted, *q)).collect();
    cuts.sort_by(f64::total_cmp);
    for cut in cuts {
        let last = edges[edges.len() - 1];
        if cut > last {
            edges.push(cut);
        }
    }
    edges
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

/// Bucketing policy for each numeric feature
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinningPlan {
    /// Policy for days since install
    pub days_since_install: BinningPolicy,

    /// Policy for session count
    pub session_count: BinningPolicy,
}

impl BinningPlan {
    /// Policy for a numeric feature
    #[must_use]
    pub fn policy(&self, kind: FeatureKind) -> Option<&BinningPolicy> {
        match kind {
            FeatureKind::DaysSinceInstall => Some(&self.days_since_install),
            FeatureKind::SessionCount => Some(&self.session_count),
            _ => None,
        }
    }

    /// Validate every policy
    ///
    /// # Errors
    /// First invalid policy
    pub fn validate(&self) -> Result<(), NormalizeError> {
        self.days_since_install.validate()?;
        self.session_count.validate()
    }

    /// Fit bins for the numeric features among `features`
    ///
    /// Only usable values (finite, non-negative) participate in the fit.
    #[must_use]
    pub fn fit(&self, features: &[FeatureKind], candidates: &[RawCandidate]) -> FeatureBinning {
        let mut binning = FeatureBinning::default();
        for kind in features.iter().copied().filter(|k| k.is_numeric()) {
            let Some(policy) = self.policy(kind) else {
                continue;
            };
            let values: Vec<f64> = candidates
                .iter()
                .filter_map(|c| c.attributes.numeric(kind))
                .filter(|v| v.is_finite() && *v >= 0.0)
                .collect();
            binning.insert(kind, policy.fit(&values));
        }
        binning
    }
}

/// Frozen bins for one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedBins {
    /// Numeric feature
    pub feature: FeatureKind,

    /// Its frozen bins
    pub edges: BinEdges,
}

/// Frozen bins for every numeric feature of an audience
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureBinning(Vec<FittedBins>);

impl FeatureBinning {
    /// Bins for a feature
    #[must_use]
    pub fn get(&self, kind: FeatureKind) -> Option<&BinEdges> {
        self.0.iter().find(|b| b.feature == kind).map(|b| &b.edges)
    }

    /// Insert or replace bins for a feature
    pub fn insert(&mut self, kind: FeatureKind, edges: BinEdges) {
        if let Some(existing) = self.0.iter_mut().find(|b| b.feature == kind) {
            existing.edges = edges;
        } else {
            self.0.push(FittedBins { feature: kind, edges });
            self.0.sort_by_key(|b| b.feature);
        }
    }

    /// Check if no feature has bins
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate fitted bins
    pub fn iter(&self) -> impl Iterator<Item = &FittedBins> {
        self.0.iter()
    }
}
