//! Engine and audience configuration
//!
//! Loaded from TOML:
//!
//! ```toml
//! store_dir = "/var/lib/cohort/store"
//! log_path = "/var/lib/cohort/audience_log.jsonl"
//! publish_dir = "/var/lib/cohort/published"
//! max_concurrent_audiences = 4
//! hash_seed = 0
//! drift_tolerance = 0.05
//!
//! [[audience]]
//! name = "lapsed_buyers"
//! mode = "prod"
//! split_ratio = 0.5
//! ttl = 3
//!
//! [audience.binning.session_count]
//! policy = "fixed_width"
//! width = 5.0
//! count = 4
//! ```

use cohort_features::{BinningPlan, FeatureKind, UnknownPolicy};
use cohort_split::SplitParams;
use cohort_store::AudienceName;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};

/// Whether and how an audience runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudienceMode {
    /// Not processed
    #[default]
    Off,

    /// Split, commit and log; nothing handed to the upload sink
    Test,

    /// Split, commit, log and hand the TEST set to the upload sink
    Prod,
}

impl AudienceMode {
    /// Whether the audience is processed at all
    #[inline]
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        !matches!(self, Self::Off)
    }

    /// Whether the TEST set is published
    #[inline]
    #[must_use]
    pub const fn publishes(self) -> bool {
        matches!(self, Self::Prod)
    }
}

impl Display for AudienceMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => f.write_str("off"),
            Self::Test => f.write_str("test"),
            Self::Prod => f.write_str("prod"),
        }
    }
}

/// Immutable per-audience parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudienceConfig {
    /// Audience name, also the store key
    pub name: String,

    /// Run mode
    #[serde(default)]
    pub mode: AudienceMode,

    /// Target TEST share, `(0, 1]`
    #[serde(default = "default_split_ratio")]
    pub split_ratio: f64,

    /// Days an absent TEST user is retained, `>= 1`
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// Stratification features, in vector order
    #[serde(default = "default_features")]
    pub features: Vec<FeatureKind>,

    /// Bucketing of numeric features
    #[serde(default)]
    pub binning: BinningPlan,

    /// Handling of missing feature values
    #[serde(default)]
    pub unknown_policy: UnknownPolicy,
}

fn default_split_ratio() -> f64 {
    0.5
}

fn default_ttl() -> u32 {
    1
}

fn default_features() -> Vec<FeatureKind> {
    FeatureKind::ALL.to_vec()
}

impl AudienceConfig {
    /// Create config with defaults (mode `off`)
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: AudienceMode::default(),
            split_ratio: default_split_ratio(),
            ttl: default_ttl(),
            features: default_features(),
            binning: BinningPlan::default(),
            unknown_policy: UnknownPolicy::default(),
        }
    }

    /// With split ratio
    #[inline]
    #[must_use]
    pub fn with_ratio(mut self, ratio: f64) -> Self {
        self.split_ratio = ratio;
        self
    }

    /// With TTL
    #[inline]
    #[must_use]
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// With stratification features
    #[inline]
    #[must_use]
    pub fn with_features(mut self, features: Vec<FeatureKind>) -> Self {
        self.features = features;
        self
    }

    /// With mode
    #[inline]
    #[must_use]
    pub fn with_mode(mut self, mode: AudienceMode) -> Self {
        self.mode = mode;
        self
    }

    /// With binning plan
    #[inline]
    #[must_use]
    pub fn with_binning(mut self, binning: BinningPlan) -> Self {
        self.binning = binning;
        self
    }

    /// With unknown value policy
    #[inline]
    #[must_use]
    pub fn with_unknown_policy(mut self, policy: UnknownPolicy) -> Self {
        self.unknown_policy = policy;
        self
    }

    /// Validated store key
    ///
    /// # Errors
    /// `ConfigError::InvalidName` if the name is not a usable key
    pub fn audience_name(&self) -> Result<AudienceName, ConfigError> {
        AudienceName::new(self.name.clone()).map_err(|_| ConfigError::InvalidName(self.name.clone()))
    }

    /// Check every parameter
    ///
    /// # Errors
    /// First invalid parameter
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.audience_name()?;
        if !(self.split_ratio > 0.0 && self.split_ratio <= 1.0) {
            return Err(ConfigError::InvalidRatio {
                audience: self.name.clone(),
                ratio: self.split_ratio,
            });
        }
        if self.ttl == 0 {
            return Err(ConfigError::InvalidTtl {
                audience: self.name.clone(),
                ttl: self.ttl,
            });
        }
        if self.features.is_empty() {
            return Err(ConfigError::EmptyFeatures(self.name.clone()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.features.iter().find(|f| !seen.insert(**f)) {
            return Err(ConfigError::DuplicateFeature {
                audience: self.name.clone(),
                feature: *dup,
            });
        }
        self.binning
            .validate()
            .map_err(|e| ConfigError::InvalidBinning {
                audience: self.name.clone(),
                reason: e.to_string(),
            })
    }

    /// Split parameters under engine-wide settings
    #[must_use]
    pub fn split_params(&self, settings: &EngineSettings) -> SplitParams {
        SplitParams {
            split_ratio: self.split_ratio,
            ttl: self.ttl,
            hash_seed: settings.hash_seed,
            drift_tolerance: settings.drift_tolerance,
        }
    }
}

/// Engine-wide knobs shared by all audiences
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    /// Audiences processed in parallel
    pub max_concurrent_audiences: usize,

    /// Seed of the allocation order
    pub hash_seed: u64,

    /// Accepted realized-ratio deviation
    pub drift_tolerance: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_audiences: default_max_concurrent(),
            hash_seed: 0,
            drift_tolerance: default_drift_tolerance(),
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Affinity store directory
    pub store_dir: PathBuf,

    /// Audience log file (JSON lines)
    pub log_path: PathBuf,

    /// Directory receiving published TEST sets
    #[serde(default = "default_publish_dir")]
    pub publish_dir: PathBuf,

    /// Audiences processed in parallel
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_audiences: usize,

    /// Seed of the allocation order
    #[serde(default)]
    pub hash_seed: u64,

    /// Accepted realized-ratio deviation
    #[serde(default = "default_drift_tolerance")]
    pub drift_tolerance: f64,

    /// Audiences
    #[serde(default, rename = "audience")]
    pub audiences: Vec<AudienceConfig>,
}

fn default_publish_dir() -> PathBuf {
    PathBuf::from("published")
}

fn default_max_concurrent() -> usize {
    4
}

fn default_drift_tolerance() -> f64 {
    0.05
}

impl EngineConfig {
    /// Parse and validate TOML text
    ///
    /// # Errors
    /// `Parse` on malformed TOML, otherwise the first validation error
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// `Io` if unreadable, otherwise as [`Self::from_toml_str`]
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&text)
    }

    /// Engine-wide settings
    #[must_use]
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            max_concurrent_audiences: self.max_concurrent_audiences,
            hash_seed: self.hash_seed,
            drift_tolerance: self.drift_tolerance,
        }
    }

    /// Look up an audience by name
    #[must_use]
    pub fn audience(&self, name: &str) -> Option<&AudienceConfig> {
        self.audiences.iter().find(|a| a.name == name)
    }

    /// Check engine settings and every audience
    ///
    /// # Errors
    /// First invalid setting or audience
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_audiences == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        if !(self.drift_tolerance > 0.0 && self.drift_tolerance < 1.0) {
            return Err(ConfigError::InvalidTolerance(self.drift_tolerance));
        }
        let mut names = HashSet::new();
        for audience in &self.audiences {
            audience.validate()?;
            if !names.insert(audience.name.as_str()) {
                return Err(ConfigError::DuplicateAudience(audience.name.clone()));
            }
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Audience name not usable as a store key
    #[error("invalid audience name {0:?}: use 1-128 of [A-Za-z0-9_-]")]
    InvalidName(String),

    /// Same audience configured twice
    #[error("audience {0} configured more than once")]
    DuplicateAudience(String),

    /// Ratio outside `(0, 1]`
    #[error("audience {audience}: split ratio {ratio} is outside (0, 1]")]
    InvalidRatio {
        /// Audience
        audience: String,
        /// Configured ratio
        ratio: f64,
    },

    /// TTL below one day
    #[error("audience {audience}: ttl must be at least 1, got {ttl}")]
    InvalidTtl {
        /// Audience
        audience: String,
        /// Configured TTL
        ttl: u32,
    },

    /// No features
    #[error("audience {0}: feature list is empty")]
    EmptyFeatures(String),

    /// Feature listed twice
    #[error("audience {audience}: feature {feature} listed more than once")]
    DuplicateFeature {
        /// Audience
        audience: String,
        /// Repeated feature
        feature: FeatureKind,
    },

    /// Bad binning parameters
    #[error("audience {audience}: {reason}")]
    InvalidBinning {
        /// Audience
        audience: String,
        /// What is wrong
        reason: String,
    },

    /// Drift tolerance outside `(0, 1)`
    #[error("drift tolerance {0} is outside (0, 1)")]
    InvalidTolerance(f64),

    /// Zero concurrency
    #[error("max_concurrent_audiences must be at least 1")]
    InvalidConcurrency,

    /// Malformed TOML
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Unreadable file
    #[error("cannot read config {path}: {source}")]
    Io {
        /// File
        path: PathBuf,
        /// Cause
        source: std::io::Error,
    },
}
