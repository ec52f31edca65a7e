//! File-backed affinity store
//!
//! One JSON document per audience (`<dir>/<audience>.json`). A write reads
//! the current document, applies the commit to the decoded snapshot, writes
//! the result to `<audience>.json.tmp`, syncs it and renames it over the
//! original, so readers observe either the previous day or the new one.

use crate::record::AudienceName;
use crate::snapshot::{AffinitySnapshot, DayCommit};
use crate::store::{AffinityStore, CommitAck, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Store persisting each audience as a JSON file in a directory
#[derive(Debug)]
pub struct FileAffinityStore {
    root: PathBuf,
    /// Serializes writers of the same audience within this process
    writers: DashMap<AudienceName, Arc<Mutex<()>>>,
}

impl FileAffinityStore {
    /// Open (and create if needed) a store directory
    ///
    /// # Errors
    /// I/O error creating the directory
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            writers: DashMap::new(),
        })
    }

    /// Store directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of an audience's document
    #[must_use]
    pub fn path_for(&self, audience: &AudienceName) -> PathBuf {
        self.root.join(format!("{audience}.json"))
    }

    /// Audiences with a document in the store directory
    ///
    /// # Errors
    /// I/O error listing the directory
    pub async fn audiences(&self) -> Result<Vec<AudienceName>, StoreError> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let file_name = entry.file_name();
            let Some(stem) = file_name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(name) = AudienceName::new(stem) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn writer_lock(&self, audience: &AudienceName) -> Arc<Mutex<()>> {
        self.writers
            .entry(audience.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load(&self, audience: &AudienceName) -> Result<AffinitySnapshot, StoreError> {
        let path = self.path_for(audience);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(AffinitySnapshot::empty(audience.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let corrupt = |reason: String| StoreError::Corrupt {
            audience: audience.to_string(),
            reason,
        };
        let snapshot: AffinitySnapshot =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(format!("{}: {e}", path.display())))?;
        if &snapshot.audience != audience {
            return Err(corrupt(format!(
                "document belongs to audience {}",
                snapshot.audience
            )));
        }
        snapshot.check_integrity().map_err(corrupt)?;
        Ok(snapshot)
    }

    async fn persist(&self, audience: &AudienceName, snapshot: &AffinitySnapshot) -> Result<(), StoreError> {
        let path = self.path_for(audience);
        let tmp = self.root.join(format!("{audience}.json.tmp"));
        let bytes = serde_json::to_vec_pretty(snapshot)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl AffinityStore for FileAffinityStore {
    async fn read(&self, audience: &AudienceName) -> Result<AffinitySnapshot, StoreError> {
        self.load(audience).await
    }

    async fn write(&self, audience: &AudienceName, commit: DayCommit) -> Result<CommitAck, StoreError> {
        let lock = self.writer_lock(audience);
        let _guard = lock.lock().await;

        let mut snapshot = self.load(audience).await?;
        let ack = snapshot.apply(commit)?;
        self.persist(audience, &snapshot).await?;

        tracing::debug!(
            %audience,
            day = %ack.day,
            live = ack.live_records,
            path = %self.path_for(audience).display(),
            "affinity document written"
        );
        Ok(ack)
    }
}
