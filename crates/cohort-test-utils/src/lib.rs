//! Testing utilities for the cohort workspace
//!
//! Shared candidate builders, fixture configs and failing collaborators.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::NaiveDate;
use cohort_engine::{AudienceConfig, AudienceLog, AudienceLogEntry, AudienceMode, AudienceSink, HandoffError};
use cohort_features::{CandidateUser, FeatureBucket, FeatureVector, RawAttributes, RawCandidate, UserId};
use cohort_store::{
    AffinitySnapshot, AffinityStore, AudienceName, CommitAck, DayCommit, MemoryAffinityStore, StoreError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Day `n` of a fixed test calendar, day 1 being 2024-01-01
pub fn day(n: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Days::new(u64::from(n) - 1)
}

pub fn audience(name: &str) -> AudienceName {
    AudienceName::new(name).unwrap()
}

/// Normalized candidates that all share one stratum
pub fn candidate_users(ids: &[&str], sampled_day: NaiveDate) -> Vec<CandidateUser> {
    ids.iter()
        .map(|id| {
            let features: FeatureVector = std::iter::once(FeatureBucket::Categorical("acme".to_string())).collect();
            CandidateUser::new(*id, features, sampled_day)
        })
        .collect()
}

/// Builder for raw candidate rows
#[derive(Debug, Clone)]
pub struct CandidateBuilder {
    user_id: String,
    attributes: RawAttributes,
}

impl CandidateBuilder {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            attributes: RawAttributes::default(),
        }
    }

    /// Fully populated row with mid-range values
    pub fn complete(user_id: impl Into<String>) -> Self {
        Self::new(user_id)
            .with_days_since_install(10.0)
            .with_session_count(5.0)
            .with_brand("acme")
            .with_os("14")
            .with_source("organic")
    }

    pub fn with_days_since_install(mut self, days: f64) -> Self {
        self.attributes.days_since_install = Some(days);
        self
    }

    pub fn with_session_count(mut self, sessions: f64) -> Self {
        self.attributes.session_count = Some(sessions);
        self
    }

    pub fn with_brand(mut self, brand: &str) -> Self {
        self.attributes.device_brand = Some(brand.to_string());
        self
    }

    pub fn with_os(mut self, os: &str) -> Self {
        self.attributes.os_version = Some(os.to_string());
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.attributes.acquisition_source = Some(source.to_string());
        self
    }

    pub fn build(self) -> RawCandidate {
        RawCandidate::new(self.user_id, self.attributes)
    }
}

/// Complete rows for every id, numeric values spread by position
pub fn raw_candidates(ids: &[&str]) -> Vec<RawCandidate> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| {
            #[allow(clippy::cast_precision_loss)]
            let spread = (i % 7) as f64;
            CandidateBuilder::complete(*id)
                .with_days_since_install(spread * 3.0)
                .with_session_count(spread + 1.0)
                .with_brand(if i % 2 == 0 { "acme" } else { "globex" })
                .build()
        })
        .collect()
}

/// Enabled audience config without publishing
pub fn test_audience(name: &str) -> AudienceConfig {
    AudienceConfig::new(name).with_mode(AudienceMode::Test)
}

/// Store that delegates to memory and fails on demand
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: MemoryAffinityStore,
    fail_writes: AtomicBool,
    corrupt_reads: AtomicBool,
    writes: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn corrupt_reads(&self, corrupt: bool) {
        self.corrupt_reads.store(corrupt, Ordering::SeqCst);
    }

    /// Writes that reached the inner store
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AffinityStore for FailingStore {
    async fn read(&self, audience: &AudienceName) -> Result<AffinitySnapshot, StoreError> {
        if self.corrupt_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt {
                audience: audience.to_string(),
                reason: "injected".to_string(),
            });
        }
        self.inner.read(audience).await
    }

    async fn write(&self, audience: &AudienceName, commit: DayCommit) -> Result<CommitAck, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("injected write failure")));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(audience, commit).await
    }
}

/// Sink that always fails
#[derive(Debug, Default)]
pub struct FailingSink;

#[async_trait]
impl AudienceSink for FailingSink {
    async fn publish(&self, _audience: &AudienceName, _day: NaiveDate, _ids: &[UserId]) -> Result<(), HandoffError> {
        Err(HandoffError::Rejected("platform unavailable".to_string()))
    }
}

/// Log that always fails
#[derive(Debug, Default)]
pub struct FailingLog;

#[async_trait]
impl AudienceLog for FailingLog {
    async fn append(&self, _entry: &AudienceLogEntry) -> Result<(), HandoffError> {
        Err(HandoffError::Io(std::io::Error::other("log volume full")))
    }

    async fn history(&self, _audience: &str) -> Result<Vec<AudienceLogEntry>, HandoffError> {
        Ok(Vec::new())
    }
}
