//! Candidate users as delivered by the warehouse

use crate::feature::{FeatureKind, FeatureVector, StratumKey};
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::{self, Display, Formatter};

/// Opaque user identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create from anything string-like
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Raw per-user attributes, any of which may be absent
///
/// Deserialization is lenient: a numeric field given as a numeric string is
/// parsed, anything else unusable becomes `None` instead of failing the row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawAttributes {
    /// Days since the app was installed
    #[serde(default, deserialize_with = "lenient_number")]
    pub days_since_install: Option<f64>,

    /// Sessions in the lookback window
    #[serde(default, deserialize_with = "lenient_number")]
    pub session_count: Option<f64>,

    /// Device manufacturer
    #[serde(default, deserialize_with = "lenient_text")]
    pub device_brand: Option<String>,

    /// Operating system version
    #[serde(default, deserialize_with = "lenient_text")]
    pub os_version: Option<String>,

    /// Install attribution source
    #[serde(default, deserialize_with = "lenient_text")]
    pub acquisition_source: Option<String>,
}

impl RawAttributes {
    /// Raw numeric value for a numeric feature
    #[must_use]
    pub fn numeric(&self, kind: FeatureKind) -> Option<f64> {
        match kind {
            FeatureKind::DaysSinceInstall => self.days_since_install,
            FeatureKind::SessionCount => self.session_count,
            _ => None,
        }
    }

    /// Raw text value for a categorical feature
    #[must_use]
    pub fn categorical(&self, kind: FeatureKind) -> Option<&str> {
        match kind {
            FeatureKind::DeviceBrand => self.device_brand.as_deref(),
            FeatureKind::OsVersion => self.os_version.as_deref(),
            FeatureKind::AcquisitionSource => self.acquisition_source.as_deref(),
            _ => None,
        }
    }
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

/// One row of the day's sampling result, before normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCandidate {
    /// Sampled user
    pub user_id: UserId,

    /// Attributes as delivered, each possibly absent
    #[serde(flatten)]
    pub attributes: RawAttributes,
}

impl RawCandidate {
    /// Create candidate row
    #[inline]
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, attributes: RawAttributes) -> Self {
        Self {
            user_id: user_id.into(),
            attributes,
        }
    }
}

/// A normalized candidate for one day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateUser {
    /// Sampled user
    pub user_id: UserId,

    /// Normalized buckets, one per configured feature
    pub features: FeatureVector,

    /// Day the user was sampled on
    pub sampled_day: NaiveDate,
}

impl CandidateUser {
    /// Create candidate
    #[inline]
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, features: FeatureVector, sampled_day: NaiveDate) -> Self {
        Self {
            user_id: user_id.into(),
            features,
            sampled_day,
        }
    }

    /// Stratum key of this candidate
    #[inline]
    #[must_use]
    pub fn stratum(&self) -> StratumKey {
        self.features.stratum_key()
    }
}
