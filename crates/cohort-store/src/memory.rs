//! In-memory affinity store
//!
//! Owned by whoever constructs it and passed explicitly to the engine. Used
//! by tests and by single-process dry runs.

use crate::record::AudienceName;
use crate::snapshot::{AffinitySnapshot, DayCommit};
use crate::store::{AffinityStore, CommitAck, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;

/// Store keeping every audience's snapshot in a concurrent map
#[derive(Debug, Default)]
pub struct MemoryAffinityStore {
    audiences: DashMap<AudienceName, AffinitySnapshot>,
}

impl MemoryAffinityStore {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of audiences with state
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.audiences.len()
    }

    /// Check if no audience has state
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.audiences.is_empty()
    }
}

#[async_trait]
impl AffinityStore for MemoryAffinityStore {
    async fn read(&self, audience: &AudienceName) -> Result<AffinitySnapshot, StoreError> {
        Ok(self
            .audiences
            .get(audience)
            .map_or_else(|| AffinitySnapshot::empty(audience.clone()), |s| s.clone()))
    }

    async fn write(&self, audience: &AudienceName, commit: DayCommit) -> Result<CommitAck, StoreError> {
        // The entry guard holds the shard lock for the whole validate+apply.
        let mut entry = self
            .audiences
            .entry(audience.clone())
            .or_insert_with(|| AffinitySnapshot::empty(audience.clone()));
        let ack = entry.apply(commit)?;
        tracing::trace!(%audience, day = %ack.day, live = ack.live_records, "memory commit applied");
        Ok(ack)
    }
}
