//! Engine run tests
//!
//! Tenet: the store commit is the only thing that decides whether a day
//! happened. Everything before it can fail without leaving a trace, and
//! everything after it can fail without undoing it.

use cohort_engine::{
    AudienceLog, AudienceMode, AudienceRun, DayBatch, EngineError, EngineSettings, JsonlAudienceLog, LogStatus,
    MemoryAudienceLog, MemorySink, SplitEngine, UploadStatus,
};
use cohort_features::{FeatureKind, UserId};
use cohort_store::{AffinityStore, FileAffinityStore, Group, MemoryAffinityStore};
use cohort_test_utils::{
    audience, day, raw_candidates, test_audience, CandidateBuilder, FailingLog, FailingSink, FailingStore,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    engine: Arc<SplitEngine>,
    store: Arc<MemoryAffinityStore>,
    log: Arc<MemoryAudienceLog>,
    sink: Arc<MemorySink>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryAffinityStore::new());
    let log = Arc::new(MemoryAudienceLog::new());
    let sink = Arc::new(MemorySink::new());
    let engine = Arc::new(SplitEngine::new(
        store.clone(),
        log.clone(),
        sink.clone(),
        EngineSettings::default(),
    ));
    Harness {
        engine,
        store,
        log,
        sink,
    }
}

fn brand_only(ids: &[&str]) -> Vec<cohort_features::RawCandidate> {
    ids.iter()
        .map(|id| CandidateBuilder::new(*id).with_brand("acme").build())
        .collect()
}

#[tokio::test]
async fn retention_scenario_through_engine() {
    let h = harness();
    let config = test_audience("scenario")
        .with_ttl(3)
        .with_features(vec![FeatureKind::DeviceBrand]);

    let d1 = h
        .engine
        .run_day(&config, DayBatch::new(day(1), brand_only(&["u1", "u2", "u3", "u4"])))
        .await
        .unwrap();
    assert_eq!(d1.result.test_user_count(), 2);
    assert_eq!(d1.result.control_user_count(), 2);
    assert!(d1.binning_fitted);

    let t = d1.result.test_user_ids.clone();
    let c = d1.result.control_user_ids.clone();
    let d2 = h
        .engine
        .run_day(
            &config,
            DayBatch::new(day(2), brand_only(&[t[0].as_str(), c[0].as_str(), "u5", "u6"])),
        )
        .await
        .unwrap();
    assert_eq!(d2.result.group_of(&t[1]), Some(Group::Test));
    assert_eq!(d2.result.group_of(&c[1]), None);
    assert_eq!(d2.retained_count, 1);
    assert_eq!(d2.dropped_count, 1);
    assert!(!d2.binning_fitted);

    let d5 = h.engine.run_day(&config, DayBatch::empty(day(5))).await.unwrap();
    assert_eq!(d5.result.group_of(&t[1]), None);
    // everyone else was last seen on day 2: 5 - 2 = 3 is not below ttl either
    assert_eq!(d5.result.test_user_count(), 0);
    assert_eq!(d5.dropped_count, 5);

    let history = h.log.history("scenario").await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[1].retained_count, 1);
    assert_eq!(history[2].result.day, day(5));
}

#[tokio::test]
async fn disabled_audience_never_touches_store() {
    let h = harness();
    let config = test_audience("quiet").with_mode(AudienceMode::Off);
    let err = h
        .engine
        .run_day(&config, DayBatch::new(day(1), raw_candidates(&["a"])))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AudienceDisabled(_)));
    assert!(h.store.is_empty());
    assert!(h.log.is_empty());
}

#[tokio::test]
async fn invalid_config_is_rejected_before_store_access() {
    let h = harness();
    let config = test_audience("bad").with_ratio(0.0);
    let err = h.engine.run_day(&config, DayBatch::empty(day(1))).await.unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_mode_logs_but_does_not_publish() {
    let h = harness();
    let config = test_audience("dry");
    let outcome = h
        .engine
        .run_day(&config, DayBatch::new(day(1), raw_candidates(&["a", "b", "c"])))
        .await
        .unwrap();
    assert_eq!(outcome.handoff.upload, UploadStatus::Skipped);
    assert_eq!(outcome.handoff.log, LogStatus::Appended);
    assert!(h.sink.latest(&audience("dry")).is_none());
}

#[tokio::test]
async fn prod_mode_publishes_full_test_set() {
    let h = harness();
    let config = test_audience("live").with_mode(AudienceMode::Prod).with_ttl(2);
    let d1 = h
        .engine
        .run_day(&config, DayBatch::new(day(1), raw_candidates(&["a", "b", "c", "d"])))
        .await
        .unwrap();
    let published = h.sink.latest(&audience("live")).unwrap();
    assert_eq!(published.user_ids, d1.result.test_user_ids);
    assert_eq!(
        d1.handoff.upload,
        UploadStatus::Published {
            users: d1.result.test_user_count()
        }
    );

    // Nobody sampled on day 2: TEST users are retained and republished
    h.engine.run_day(&config, DayBatch::empty(day(2))).await.unwrap();
    let published = h.sink.latest(&audience("live")).unwrap();
    assert_eq!(published.day, day(2));
    assert_eq!(published.user_ids, d1.result.test_user_ids);
}

#[tokio::test]
async fn days_must_move_forward() {
    let h = harness();
    let config = test_audience("order");
    h.engine
        .run_day(&config, DayBatch::new(day(3), raw_candidates(&["a"])))
        .await
        .unwrap();

    for d in [day(3), day(2)] {
        let err = h.engine.run_day(&config, DayBatch::empty(d)).await.unwrap_err();
        assert!(matches!(err, EngineError::DayOutOfOrder { .. }), "{err}");
    }
    let snap = h.store.read(&audience("order")).await.unwrap();
    assert_eq!(snap.last_committed_day, Some(day(3)));
}

#[tokio::test]
async fn run_days_sorts_and_rejects_duplicates() {
    let h = harness();
    let config = test_audience("seq");

    let report = h
        .engine
        .run_days(
            &config,
            vec![
                DayBatch::new(day(2), raw_candidates(&["b"])),
                DayBatch::new(day(1), raw_candidates(&["a"])),
            ],
        )
        .await;
    assert!(report.is_success());
    assert_eq!(report.outcomes[0].result.day, day(1));
    assert_eq!(report.last_day(), Some(day(2)));

    let report = h
        .engine
        .run_days(&config, vec![DayBatch::empty(day(4)), DayBatch::empty(day(4))])
        .await;
    assert!(matches!(report.error, Some(EngineError::DuplicateDay { .. })));
    assert!(report.outcomes.is_empty());
}

#[tokio::test]
async fn run_days_stops_at_first_failure() {
    let h = harness();
    let config = test_audience("halt");
    h.engine.run_day(&config, DayBatch::empty(day(5))).await.unwrap();

    let report = h
        .engine
        .run_days(
            &config,
            vec![
                DayBatch::empty(day(4)),
                DayBatch::empty(day(6)),
            ],
        )
        .await;
    assert!(matches!(report.error, Some(EngineError::DayOutOfOrder { .. })));
    assert!(report.outcomes.is_empty());
    let snap = h.store.read(&audience("halt")).await.unwrap();
    assert_eq!(snap.last_committed_day, Some(day(5)));
}

#[tokio::test]
async fn resume_skips_committed_days_and_splits_new_ones() {
    let h = harness();
    let config = test_audience("daily");
    h.engine
        .run_day(&config, DayBatch::new(day(1), raw_candidates(&["a", "b"])))
        .await
        .unwrap();

    let report = h
        .engine
        .resume_days(
            &config,
            vec![
                DayBatch::new(day(1), raw_candidates(&["a", "b"])),
                DayBatch::new(day(2), raw_candidates(&["a", "c"])),
            ],
        )
        .await;
    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(report.already_committed, vec![day(1)]);
    assert_eq!(report.last_day(), Some(day(2)));

    let snap = h.store.read(&audience("daily")).await.unwrap();
    assert_eq!(snap.last_committed_day, Some(day(2)));
    assert!(snap.get(&UserId::new("c")).is_some());
    assert_eq!(h.log.len(), 2);
}

#[tokio::test]
async fn run_all_over_growing_input_only_splits_new_days() {
    let h = harness();
    let config = test_audience("growing");
    let day_one = || DayBatch::new(day(1), raw_candidates(&["a", "b", "c"]));

    let first = h
        .engine
        .run_all(vec![AudienceRun::new(config.clone(), vec![day_one()])])
        .await;
    assert!(first[0].is_success());
    assert!(first[0].already_committed.is_empty());

    let second = h
        .engine
        .run_all(vec![AudienceRun::new(
            config,
            vec![day_one(), DayBatch::new(day(2), raw_candidates(&["b", "c", "d"]))],
        )])
        .await;
    assert!(second[0].is_success(), "{:?}", second[0].error);
    assert_eq!(second[0].already_committed, vec![day(1)]);
    assert_eq!(second[0].outcomes.len(), 1);
    assert_eq!(second[0].last_day(), Some(day(2)));

    let history = h.log.history("growing").await.unwrap();
    let days: Vec<_> = history.iter().map(|e| e.result.day).collect();
    assert_eq!(days, vec![day(1), day(2)]);
}

#[tokio::test]
async fn failed_commit_leaves_nothing_behind() {
    let store = Arc::new(FailingStore::new());
    let log = Arc::new(MemoryAudienceLog::new());
    let engine = SplitEngine::new(store.clone(), log.clone(), Arc::new(MemorySink::new()), EngineSettings::default());
    let config = test_audience("flaky");

    store.fail_writes(true);
    let err = engine
        .run_day(&config, DayBatch::new(day(1), raw_candidates(&["a", "b"])))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(log.is_empty());
    let snap = store.read(&audience("flaky")).await.unwrap();
    assert!(snap.records.is_empty());
    assert_eq!(snap.binning, None);

    // same day again once the store recovers
    store.fail_writes(false);
    let outcome = engine
        .run_day(&config, DayBatch::new(day(1), raw_candidates(&["a", "b"])))
        .await
        .unwrap();
    assert_eq!(outcome.result.new_test_count + outcome.result.new_control_count, 2);
    assert_eq!(store.write_count(), 1);
}

#[tokio::test]
async fn corrupt_store_is_fatal_and_skips_day() {
    let store = Arc::new(FailingStore::new());
    let log = Arc::new(MemoryAudienceLog::new());
    let engine = SplitEngine::new(store.clone(), log.clone(), Arc::new(MemorySink::new()), EngineSettings::default());

    store.corrupt_reads(true);
    let err = engine
        .run_day(&test_audience("broken"), DayBatch::new(day(1), raw_candidates(&["a"])))
        .await
        .unwrap_err();
    assert!(err.is_fatal_for_audience());
    assert_eq!(store.write_count(), 0);
    assert!(log.is_empty());
}

#[tokio::test]
async fn downstream_failures_do_not_undo_commit() {
    let store = Arc::new(MemoryAffinityStore::new());
    let engine = SplitEngine::new(store.clone(), Arc::new(FailingLog), Arc::new(FailingSink), EngineSettings::default());
    let config = test_audience("outage").with_mode(AudienceMode::Prod);

    let outcome = engine
        .run_day(&config, DayBatch::new(day(1), raw_candidates(&["a", "b"])))
        .await
        .unwrap();
    assert!(matches!(outcome.handoff.upload, UploadStatus::Failed(_)));
    assert!(matches!(outcome.handoff.log, LogStatus::Failed(_)));
    assert!(!outcome.handoff.is_clean());

    let snap = store.read(&audience("outage")).await.unwrap();
    assert_eq!(snap.records.len(), 2);
    assert_eq!(snap.last_committed_day, Some(day(1)));
}

#[tokio::test]
async fn unknown_values_are_bucketed_not_dropped() {
    let h = harness();
    let config = test_audience("sparse");
    let rows = vec![
        CandidateBuilder::complete("full").build(),
        CandidateBuilder::new("bare").build(),
    ];
    let outcome = h.engine.run_day(&config, DayBatch::new(day(1), rows)).await.unwrap();
    assert_eq!(outcome.result.new_test_count + outcome.result.new_control_count, 2);
    assert_eq!(outcome.unknown_counts[&FeatureKind::DeviceBrand], 1);
    assert_eq!(outcome.unknown_counts[&FeatureKind::SessionCount], 1);
}

#[tokio::test]
async fn reject_policy_fails_day_without_commit() {
    let h = harness();
    let config = test_audience("strict").with_unknown_policy(cohort_features::UnknownPolicy::Reject);
    let err = h
        .engine
        .run_day(&config, DayBatch::new(day(1), vec![CandidateBuilder::new("bare").build()]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Normalize(_)));
    let snap = h.store.read(&audience("strict")).await.unwrap();
    assert_eq!(snap.last_committed_day, None);
}

#[tokio::test]
async fn binning_is_fitted_once_and_persisted() {
    let h = harness();
    let config = test_audience("bins");

    // an empty first day fits nothing
    let empty = h.engine.run_day(&config, DayBatch::empty(day(1))).await.unwrap();
    assert!(!empty.binning_fitted);
    assert_eq!(h.store.read(&audience("bins")).await.unwrap().binning, None);

    let first = h
        .engine
        .run_day(&config, DayBatch::new(day(2), raw_candidates(&["a", "b", "c", "d", "e"])))
        .await
        .unwrap();
    assert!(first.binning_fitted);
    let frozen = h.store.read(&audience("bins")).await.unwrap().binning.unwrap();
    assert!(frozen.get(FeatureKind::SessionCount).is_some());

    let later = h
        .engine
        .run_day(&config, DayBatch::new(day(3), raw_candidates(&["f"])))
        .await
        .unwrap();
    assert!(!later.binning_fitted);
    assert_eq!(h.store.read(&audience("bins")).await.unwrap().binning, Some(frozen));
}

#[tokio::test]
async fn concurrent_runs_of_same_day_commit_once() {
    let h = harness();
    let config = test_audience("race");

    let (a, b) = tokio::join!(
        h.engine.run_day(&config, DayBatch::new(day(1), raw_candidates(&["a", "b"]))),
        h.engine.run_day(&config, DayBatch::new(day(1), raw_candidates(&["c", "d"]))),
    );
    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(EngineError::DayOutOfOrder { .. }))));
    assert_eq!(h.store.read(&audience("race")).await.unwrap().records.len(), 2);
}

#[tokio::test]
async fn run_all_isolates_audiences() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileAffinityStore::open(dir.path().join("store")).await.unwrap());
    let log = Arc::new(JsonlAudienceLog::new(dir.path().join("log.jsonl")));
    let engine = Arc::new(SplitEngine::new(
        store.clone(),
        log.clone(),
        Arc::new(MemorySink::new()),
        EngineSettings {
            max_concurrent_audiences: 2,
            ..EngineSettings::default()
        },
    ));

    // corrupt one audience's document before the run
    std::fs::write(store.path_for(&audience("damaged")), b"not json").unwrap();

    let batches = || {
        vec![
            DayBatch::new(day(1), raw_candidates(&["a", "b", "c"])),
            DayBatch::new(day(2), raw_candidates(&["b", "c", "d"])),
        ]
    };
    let reports = engine
        .run_all(vec![
            AudienceRun::new(test_audience("alpha"), batches()),
            AudienceRun::new(test_audience("damaged"), batches()),
            AudienceRun::new(test_audience("gamma").with_mode(AudienceMode::Off), batches()),
            AudienceRun::new(test_audience("delta").with_ttl(2), batches()),
        ])
        .await;

    let names: Vec<_> = reports.iter().map(|r| r.audience.as_str()).collect();
    assert_eq!(names, vec!["alpha", "damaged", "gamma", "delta"]);

    assert!(reports[0].is_success());
    assert_eq!(reports[0].outcomes.len(), 2);
    assert!(reports[1].error.as_ref().unwrap().is_fatal_for_audience());
    assert!(reports[2].skipped);
    assert!(reports[3].is_success());

    let history = log.history("alpha").await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(log.history("gamma").await.unwrap().is_empty());
    assert_eq!(store.audiences().await.unwrap().len(), 3);

    let alpha = store.read(&audience("alpha")).await.unwrap();
    for user in ["b", "c", "d"] {
        assert_eq!(alpha.records[&UserId::new(user)].last_seen_day, day(2));
    }
    // ttl 1: absent on day 2 means dropped on day 2
    assert!(alpha.get(&UserId::new("a")).is_none());
}
