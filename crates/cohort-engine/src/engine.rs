//! Split engine
//!
//! Runs (audience, day) splits against an [`AffinityStore`]:
//!
//! 1. Read the audience snapshot (a corrupt snapshot stops the audience)
//! 2. Normalize candidates with the audience's frozen bins, fitting them on
//!    the first non-empty day
//! 3. Resolve retention, allocate unseen users, assemble the day
//! 4. Commit to the store in one write
//! 5. Append to the audience log and, in `prod` mode, publish the TEST set
//!
//! Steps 1-4 for one audience run under that audience's lock, so two days
//! of the same audience never interleave. Audiences are independent and run
//! in parallel under [`SplitEngine::run_all`].

use crate::config::{AudienceConfig, EngineSettings};
use crate::error::EngineError;
use crate::log::{AudienceLog, AudienceLogEntry};
use crate::outcome::{AudienceReport, DayBatch, DayOutcome, HandoffStatus, LogStatus, UploadStatus};
use crate::sink::AudienceSink;
use chrono::NaiveDate;
use cohort_features::{FeatureBinning, FeatureNormalizer, NormalizedBatch};
use cohort_split::DaySplitter;
use cohort_store::{AffinitySnapshot, AffinityStore, AudienceName};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::Instrument;

/// One audience's work in a [`SplitEngine::run_all`] call
#[derive(Debug, Clone)]
pub struct AudienceRun {
    /// Audience parameters
    pub config: AudienceConfig,

    /// Days to process
    pub batches: Vec<DayBatch>,
}

impl AudienceRun {
    /// Create run
    #[inline]
    #[must_use]
    pub fn new(config: AudienceConfig, batches: Vec<DayBatch>) -> Self {
        Self { config, batches }
    }
}

/// Engine coordinating store, log and upload sink
#[derive(Debug)]
pub struct SplitEngine {
    store: Arc<dyn AffinityStore>,
    log: Arc<dyn AudienceLog>,
    sink: Arc<dyn AudienceSink>,
    settings: EngineSettings,
    /// Serializes days of the same audience
    locks: DashMap<AudienceName, Arc<Mutex<()>>>,
}

impl SplitEngine {
    /// Create engine
    #[must_use]
    pub fn new(
        store: Arc<dyn AffinityStore>,
        log: Arc<dyn AudienceLog>,
        sink: Arc<dyn AudienceSink>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            log,
            sink,
            settings,
            locks: DashMap::new(),
        }
    }

    /// Engine-wide settings
    #[inline]
    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Store in use
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn AffinityStore> {
        &self.store
    }

    /// Audience log in use
    #[inline]
    #[must_use]
    pub fn log(&self) -> &Arc<dyn AudienceLog> {
        &self.log
    }

    fn audience_lock(&self, audience: &AudienceName) -> Arc<Mutex<()>> {
        self.locks
            .entry(audience.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Split and commit one day of one audience
    ///
    /// # Errors
    /// - `Config` / `AudienceDisabled` before any store access
    /// - `DayOutOfOrder` if the day is not after the last committed day
    /// - `Store` / `Split` / `Normalize` if the day could not be committed;
    ///   nothing was written in that case
    ///
    /// Log and upload failures do not fail the call; see [`DayOutcome::handoff`].
    pub async fn run_day(&self, config: &AudienceConfig, batch: DayBatch) -> Result<DayOutcome, EngineError> {
        config.validate()?;
        if !config.mode.is_enabled() {
            return Err(EngineError::AudienceDisabled(config.name.clone()));
        }
        let audience = config.audience_name()?;

        let span = tracing::info_span!("split_day", audience = %audience, day = %batch.day);
        async {
            let result = self.split_and_commit(&audience, config, batch).await;
            match result {
                Ok(outcome) => Ok(self.hand_off(&audience, outcome).await),
                Err(e) => {
                    let e = e.for_audience(&config.name);
                    if e.is_fatal_for_audience() {
                        tracing::error!(error = %e, "audience state unusable, day skipped");
                    } else {
                        tracing::warn!(error = %e, "day not committed");
                    }
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn split_and_commit(
        &self,
        audience: &AudienceName,
        config: &AudienceConfig,
        batch: DayBatch,
    ) -> Result<DayOutcome, EngineError> {
        let lock = self.audience_lock(audience);
        let _guard = lock.lock().await;

        let snapshot = self.store.read(audience).await?;
        let (normalized, fitted) = normalize(config, &snapshot, &batch)?;
        for (feature, count) in &normalized.unknown_counts {
            tracing::warn!(%feature, users = count, "feature missing, unknown bucket used");
        }

        let splitter = DaySplitter::new(config.split_params(&self.settings), config.features.clone())?;
        let mut split = splitter.split(&snapshot, batch.day, normalized.users)?;
        let binning_fitted = fitted.is_some();
        split.commit.binning = fitted;

        let ack = self.store.write(audience, split.commit).await?;

        let result = split.result;
        tracing::info!(
            test = result.test_user_count(),
            control = result.control_user_count(),
            new_test = result.new_test_count,
            new_control = result.new_control_count,
            total_test = result.total_test_count,
            total_control = result.total_control_count,
            retained = split.retained_count,
            dropped = split.dropped_count,
            live_records = ack.live_records,
            "day committed"
        );
        if split.drift.warning {
            tracing::warn!(
                target_ratio = split.drift.target,
                realized = split.drift.realized,
                tolerance = split.drift.tolerance,
                "realized split ratio drifted"
            );
        }
        for balance in &split.balance.features {
            tracing::debug!(
                feature = %balance.feature,
                gap = balance.max_cdf_gap,
                test = balance.test_users,
                control = balance.control_users,
                "feature balance"
            );
        }

        Ok(DayOutcome {
            audience: config.name.clone(),
            mode: config.mode,
            result,
            returning_count: split.returning_count,
            retained_count: split.retained_count,
            dropped_count: split.dropped_count,
            duplicate_count: split.duplicate_count,
            unknown_counts: normalized.unknown_counts,
            binning_fitted,
            balance: split.balance,
            drift: split.drift,
            handoff: HandoffStatus {
                upload: UploadStatus::Skipped,
                log: LogStatus::Appended,
            },
        })
    }

    async fn hand_off(&self, audience: &AudienceName, mut outcome: DayOutcome) -> DayOutcome {
        let entry = AudienceLogEntry::from_outcome(&outcome);
        outcome.handoff.log = match self.log.append(&entry).await {
            Ok(()) => LogStatus::Appended,
            Err(e) => {
                tracing::warn!(error = %e, "audience log append failed");
                LogStatus::Failed(e.to_string())
            }
        };

        outcome.handoff.upload = if outcome.mode.publishes() {
            let ids = &outcome.result.test_user_ids;
            match self.sink.publish(audience, outcome.result.day, ids).await {
                Ok(()) => UploadStatus::Published { users: ids.len() },
                Err(e) => {
                    tracing::warn!(error = %e, "test set hand-off failed");
                    UploadStatus::Failed(e.to_string())
                }
            }
        } else {
            UploadStatus::Skipped
        };

        outcome
    }

    /// Run several days of one audience in chronological order
    ///
    /// Days are sorted first; a repeated day rejects the whole sequence
    /// before anything runs. Processing stops at the first failing day; days
    /// committed before it stay committed.
    pub async fn run_days(&self, config: &AudienceConfig, mut batches: Vec<DayBatch>) -> AudienceReport {
        let mut report = AudienceReport {
            audience: config.name.clone(),
            skipped: false,
            already_committed: Vec::new(),
            outcomes: Vec::with_capacity(batches.len()),
            error: None,
        };

        batches.sort_by_key(|b| b.day);
        let mut seen = HashSet::with_capacity(batches.len());
        if let Some(dup) = batches.iter().find(|b| !seen.insert(b.day)) {
            report.error = Some(EngineError::DuplicateDay {
                audience: config.name.clone(),
                day: dup.day,
            });
            return report;
        }

        for batch in batches {
            match self.run_day(config, batch).await {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(e) => {
                    report.error = Some(e);
                    break;
                }
            }
        }
        report
    }

    /// Run the days the store has not committed yet
    ///
    /// Batches on or before the audience's last committed day are set aside
    /// in [`AudienceReport::already_committed`]; the rest go through
    /// [`Self::run_days`]. Feeding the same input directory every day
    /// therefore only splits the new days.
    pub async fn resume_days(&self, config: &AudienceConfig, batches: Vec<DayBatch>) -> AudienceReport {
        let last_committed = match self.last_committed_day(config).await {
            Ok(day) => day,
            Err(e) => {
                tracing::error!(audience = %config.name, error = %e, "audience state unreadable, nothing run");
                return AudienceReport::failed(config.name.clone(), e);
            }
        };

        let (done, pending): (Vec<DayBatch>, Vec<DayBatch>) = batches
            .into_iter()
            .partition(|b| last_committed.is_some_and(|last| b.day <= last));
        let mut already_committed: Vec<_> = done.into_iter().map(|b| b.day).collect();
        already_committed.sort_unstable();
        already_committed.dedup();
        if !already_committed.is_empty() {
            tracing::info!(
                audience = %config.name,
                days = already_committed.len(),
                "days already committed, not rerun"
            );
        }

        let mut report = self.run_days(config, pending).await;
        report.already_committed = already_committed;
        report
    }

    async fn last_committed_day(&self, config: &AudienceConfig) -> Result<Option<NaiveDate>, EngineError> {
        config.validate()?;
        let audience = config.audience_name()?;
        Ok(self.store.read(&audience).await?.last_committed_day)
    }

    /// Run every audience concurrently, each one's days sequentially
    ///
    /// At most `max_concurrent_audiences` audiences run at once. `off`
    /// audiences are reported as skipped without touching the store. Days
    /// already committed are skipped as in [`Self::resume_days`]. Reports
    /// come back in input order; one audience failing does not affect others.
    pub async fn run_all(self: &Arc<Self>, runs: Vec<AudienceRun>) -> Vec<AudienceReport> {
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_audiences.max(1)));
        let mut names = Vec::with_capacity(runs.len());
        let mut handles = Vec::with_capacity(runs.len());

        for run in runs {
            names.push(run.config.name.clone());
            if !run.config.mode.is_enabled() {
                tracing::info!(audience = %run.config.name, "audience is off, skipped");
                handles.push(None);
                continue;
            }

            let engine = Arc::clone(self);
            let permits = Arc::clone(&permits);
            handles.push(Some(tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return AudienceReport::failed(
                        run.config.name.clone(),
                        EngineError::Task {
                            audience: run.config.name.clone(),
                            reason: "worker pool closed".to_string(),
                        },
                    );
                };
                engine.resume_days(&run.config, run.batches).await
            })));
        }

        let mut reports = Vec::with_capacity(names.len());
        for (name, handle) in names.into_iter().zip(handles) {
            let report = match handle {
                None => AudienceReport::skipped(name),
                Some(handle) => match handle.await {
                    Ok(report) => report,
                    Err(e) => {
                        tracing::error!(audience = %name, error = %e, "audience task aborted");
                        AudienceReport::failed(
                            name.clone(),
                            EngineError::Task {
                                audience: name,
                                reason: e.to_string(),
                            },
                        )
                    }
                },
            };
            reports.push(report);
        }
        reports
    }
}

/// Normalize a batch, fitting bins if the audience has none yet
///
/// Returns the bins to freeze when they were fitted now. A day without
/// candidates and without stored bins neither fits nor normalizes.
fn normalize(
    config: &AudienceConfig,
    snapshot: &AffinitySnapshot,
    batch: &DayBatch,
) -> Result<(NormalizedBatch, Option<FeatureBinning>), EngineError> {
    let (normalizer, fitted) = match &snapshot.binning {
        Some(binning) => (
            FeatureNormalizer::new(config.features.clone(), binning.clone(), config.unknown_policy)?,
            None,
        ),
        None if batch.candidates.is_empty() => return Ok((NormalizedBatch::default(), None)),
        None => {
            let normalizer = FeatureNormalizer::fit(
                config.features.clone(),
                &config.binning,
                &batch.candidates,
                config.unknown_policy,
            )?;
            let fitted = normalizer.binning().clone();
            tracing::info!(features = fitted.iter().count(), "numeric bins fitted and frozen");
            (normalizer, Some(fitted))
        }
    };

    Ok((normalizer.normalize_all(batch.day, &batch.candidates)?, fitted))
}
