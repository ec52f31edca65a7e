//! Cohort Feature System
//!
//! Turns a candidate user's raw behavioral attributes into a fixed, bucketed
//! feature vector that the stratified allocator can group on.
//!
//! # Core Concepts
//!
//! - [`FeatureKind`]: The fixed set of stratification features
//! - [`FeatureBucket`]: Tagged bucket value (numeric index, categorical key, unknown)
//! - [`FeatureVector`] / [`StratumKey`]: Ordered buckets, one per configured feature
//! - [`BinningPolicy`] / [`FeatureBinning`]: Numeric bucketing, fitted once per audience
//! - [`FeatureNormalizer`]: Pure raw-attributes to feature-vector mapping
//! - [`UserHash`]: Seeded, stable hash used for deterministic ordering
//!
//! # Example
//!
//! ```rust,ignore
//! use cohort_features::{BinningPlan, FeatureKind, FeatureNormalizer, UnknownPolicy};
//!
//! let normalizer = FeatureNormalizer::fit(
//!     FeatureKind::ALL.to_vec(),
//!     &BinningPlan::default(),
//!     &candidates,
//!     UnknownPolicy::Bucket,
//! )?;
//! let batch = normalizer.normalize_all(day, &candidates)?;
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod binning;
mod candidate;
mod feature;
mod hash;
mod normalizer;

pub use binning::{
    quantile_edges, BinEdges, BinningPlan, BinningPolicy, FeatureBinning, FittedBins,
    DEFAULT_PERCENTILES,
};
pub use candidate::{CandidateUser, RawAttributes, RawCandidate, UserId};
pub use feature::{FeatureBucket, FeatureKind, FeatureVector, StratumKey};
pub use hash::UserHash;
pub use normalizer::{FeatureNormalizer, NormalizeError, NormalizedBatch, UnknownPolicy};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
