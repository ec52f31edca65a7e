//! Feature kinds, bucket values and stratum keys

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::{self, Display, Formatter};

/// The fixed set of stratification features
///
/// Declaration order is the canonical order of a full feature vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// Days elapsed since the app was installed (numeric)
    DaysSinceInstall,

    /// Number of sessions in the sampling window (numeric)
    SessionCount,

    /// Device manufacturer (categorical)
    DeviceBrand,

    /// Operating system version (categorical)
    OsVersion,

    /// Acquisition source / install channel (categorical)
    AcquisitionSource,
}

impl FeatureKind {
    /// All features in canonical order
    pub const ALL: [FeatureKind; 5] = [
        Self::DaysSinceInstall,
        Self::SessionCount,
        Self::DeviceBrand,
        Self::OsVersion,
        Self::AcquisitionSource,
    ];

    /// Whether the feature is bucketed by value range
    #[inline]
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::DaysSinceInstall | Self::SessionCount)
    }

    /// Stable snake_case name
    #[inline]
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::DaysSinceInstall => "days_since_install",
            Self::SessionCount => "session_count",
            Self::DeviceBrand => "device_brand",
            Self::OsVersion => "os_version",
            Self::AcquisitionSource => "acquisition_source",
        }
    }
}

impl Display for FeatureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single bucketed feature value
///
/// Derived ordering puts numeric buckets first (by index), then categorical
/// keys (lexicographic), then the unknown bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FeatureBucket {
    /// Index of the numeric bin the value fell into
    Numeric(u32),

    /// Categorical value used verbatim as the bucket key
    Categorical(String),

    /// Reserved bucket for missing or malformed values
    Unknown,
}

impl FeatureBucket {
    /// Check if this is the unknown bucket
    #[inline]
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

impl Display for FeatureBucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(idx) => write!(f, "#{idx}"),
            Self::Categorical(key) => write!(f, "{key:?}"),
            Self::Unknown => f.write_str("?"),
        }
    }
}

/// Ordered bucket values, one per configured feature
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(SmallVec<[FeatureBucket; 5]>);

impl FeatureVector {
    /// Create an empty vector
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(SmallVec::new())
    }

    /// Append a bucket
    #[inline]
    pub fn push(&mut self, bucket: FeatureBucket) {
        self.0.push(bucket);
    }

    /// Number of buckets
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bucket at position
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&FeatureBucket> {
        self.0.get(index)
    }

    /// Iterate buckets in feature order
    pub fn iter(&self) -> impl Iterator<Item = &FeatureBucket> {
        self.0.iter()
    }

    /// Stratum this vector belongs to
    #[inline]
    #[must_use]
    pub fn stratum_key(&self) -> StratumKey {
        StratumKey(self.clone())
    }
}

impl FromIterator<FeatureBucket> for FeatureVector {
    fn from_iter<I: IntoIterator<Item = FeatureBucket>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Display for FeatureVector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, bucket) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{bucket}")?;
        }
        f.write_str(")")
    }
}

/// Key of a stratum: the full feature-vector tuple
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StratumKey(FeatureVector);

impl StratumKey {
    /// Underlying feature vector
    #[inline]
    #[must_use]
    pub fn features(&self) -> &FeatureVector {
        &self.0
    }
}

impl From<FeatureVector> for StratumKey {
    fn from(vector: FeatureVector) -> Self {
        Self(vector)
    }
}

impl Display for StratumKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_kind_numeric_split() {
        let numeric: Vec<_> = FeatureKind::ALL.iter().filter(|k| k.is_numeric()).collect();
        assert_eq!(numeric, vec![&FeatureKind::DaysSinceInstall, &FeatureKind::SessionCount]);
    }

    #[test]
    fn feature_kind_serde_names() {
        let json = serde_json::to_string(&FeatureKind::OsVersion).unwrap();
        assert_eq!(json, "\"os_version\"");
        assert_eq!(FeatureKind::OsVersion.to_string(), "os_version");
    }

    #[test]
    fn bucket_ordering() {
        assert!(FeatureBucket::Numeric(7) < FeatureBucket::Categorical("a".into()));
        assert!(FeatureBucket::Categorical("z".into()) < FeatureBucket::Unknown);
        assert!(FeatureBucket::Numeric(1) < FeatureBucket::Numeric(2));
    }

    #[test]
    fn vector_display() {
        let v: FeatureVector = vec![
            FeatureBucket::Numeric(2),
            FeatureBucket::Categorical("acme".into()),
            FeatureBucket::Unknown,
        ]
        .into_iter()
        .collect();
        assert_eq!(v.to_string(), "(#2, \"acme\", ?)");
        assert_eq!(v.stratum_key().to_string(), v.to_string());
    }

    #[test]
    fn stratum_key_serde_json() {
        let v: FeatureVector = vec![FeatureBucket::Numeric(0), FeatureBucket::Unknown]
            .into_iter()
            .collect();
        let key = v.stratum_key();
        let json = serde_json::to_string(&key).unwrap();
        let decoded: StratumKey = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, key);
    }
}
