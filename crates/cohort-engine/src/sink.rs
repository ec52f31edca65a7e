//! Upload hand-off
//!
//! The engine hands each `prod` audience's full TEST set to an
//! [`AudienceSink`] after the day is committed. Every publish replaces the
//! previous set for that audience; nothing is incremental and the engine
//! does not track delivery beyond the call's result.

use crate::error::HandoffError;
use async_trait::async_trait;
use chrono::NaiveDate;
use cohort_features::UserId;
use cohort_store::AudienceName;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Receiver of an audience's TEST set
#[async_trait]
pub trait AudienceSink: Send + Sync + std::fmt::Debug {
    /// Replace the audience's published set
    ///
    /// # Errors
    /// Delivery failure; the commit is not affected
    async fn publish(
        &self,
        audience: &AudienceName,
        day: NaiveDate,
        test_user_ids: &[UserId],
    ) -> Result<(), HandoffError>;
}

/// Last set published for an audience
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedSet {
    /// Day of the set
    pub day: NaiveDate,

    /// TEST users
    pub user_ids: Vec<UserId>,
}

/// Sink keeping the latest set per audience in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    published: DashMap<AudienceName, PublishedSet>,
}

impl MemorySink {
    /// Create empty sink
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest set for an audience
    #[must_use]
    pub fn latest(&self, audience: &AudienceName) -> Option<PublishedSet> {
        self.published.get(audience).map(|s| s.clone())
    }
}

#[async_trait]
impl AudienceSink for MemorySink {
    async fn publish(
        &self,
        audience: &AudienceName,
        day: NaiveDate,
        test_user_ids: &[UserId],
    ) -> Result<(), HandoffError> {
        self.published.insert(
            audience.clone(),
            PublishedSet {
                day,
                user_ids: test_user_ids.to_vec(),
            },
        );
        Ok(())
    }
}

/// Sink writing `<dir>/<audience>.txt`, one user id per line
///
/// The file is replaced atomically on every publish, for pickup by the
/// platform uploader.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    /// Sink writing into `root`, created on first publish
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// File holding an audience's set
    #[must_use]
    pub fn path_for(&self, audience: &AudienceName) -> PathBuf {
        self.root.join(format!("{audience}.txt"))
    }

    /// Output directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl AudienceSink for DirectorySink {
    async fn publish(
        &self,
        audience: &AudienceName,
        day: NaiveDate,
        test_user_ids: &[UserId],
    ) -> Result<(), HandoffError> {
        tokio::fs::create_dir_all(&self.root).await?;

        let mut body = String::with_capacity(test_user_ids.len() * 16);
        for user_id in test_user_ids {
            body.push_str(user_id.as_str());
            body.push('\n');
        }

        let tmp = self.root.join(format!("{audience}.txt.tmp"));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(body.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, self.path_for(audience)).await?;

        tracing::debug!(%audience, %day, users = test_user_ids.len(), "test set published");
        Ok(())
    }
}
