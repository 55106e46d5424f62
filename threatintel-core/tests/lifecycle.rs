//! End-to-end job lifecycle against the in-memory store and mock feeds.

mod support;

use support::{FEED_V1, FEED_V2, harness};
use threatintel_core::{
    FeedJobError, JobParameterHandle, JobSelector, JobState, RunOutcome, Schedule, SearchStore,
    UpdateJobRequest,
};

#[tokio::test]
async fn create_fail_and_recover_walkthrough() {
    let mut h = harness().await;
    h.publish("/v1.csv", FEED_V1).await;

    //* Create: the record is registered before the first load runs
    let handle = h
        .runner
        .create_job("feed-x", Schedule::days(1))
        .await
        .expect("create accepted");
    assert_eq!(h.record().await.state, JobState::Creating);

    let outcome = handle.wait().await;
    assert_eq!(outcome, RunOutcome::Refreshed { index: "feed-x-1".into() });
    let record = h.record().await;
    assert_eq!(record.state, JobState::Available);
    assert_eq!(record.indices, vec!["feed-x-1"]);
    assert!(record.update_enabled);
    assert!(record.update_stats.last_succeeded_at.is_some());
    assert_eq!(record.feed_fields, vec!["ip", "tag"]);
    assert_eq!(h.store.doc_count("feed-x-1").await, 2);

    //* Scheduled tick against an unreachable endpoint
    h.break_feed().await;
    let outcome = h.runner.run_job(JobParameterHandle::new("feed-x")).wait().await;
    assert!(matches!(outcome, RunOutcome::Failed(_)), "{outcome:?}");
    let record = h.record().await;
    assert_eq!(record.state, JobState::RefreshFailed);
    assert!(!record.update_enabled);
    assert!(record.enabled_time.is_none());
    assert!(record.update_stats.last_failed_at.is_some());
    assert_eq!(record.indices, vec!["feed-x-1"]);

    //* Manual refresh with a superset feed
    h.publish("/v2.csv", FEED_V2).await;
    let outcome = h.runner.refresh_job("feed-x").await.expect("refresh accepted").wait().await;
    assert_eq!(outcome, RunOutcome::Refreshed { index: "feed-x-2".into() });
    let record = h.record().await;
    assert_eq!(record.state, JobState::Available);
    assert_eq!(record.indices, vec!["feed-x-2"]);
    assert!(record.update_enabled);
    assert_eq!(record.feed_fields, vec!["ip", "tag", "first_seen"]);
    assert_eq!(h.feed_x_indices().await, vec!["feed-x-2"]);
    assert_eq!(h.store.doc_count("feed-x-2").await, 4);
}

#[tokio::test]
async fn indicator_documents_carry_feed_identity() {
    let mut h = harness().await;
    h.create_available().await;

    let docs = h.store.search_all("feed-x-1").await.unwrap();
    let mut values: Vec<String> = docs
        .iter()
        .map(|doc| doc.source["ioc_value"].as_str().unwrap().to_string())
        .collect();
    values.sort();
    assert_eq!(values, vec!["1.2.3.4", "5.6.7.8"]);
    for doc in &docs {
        assert_eq!(doc.source["ioc_type"], "ip");
        assert_eq!(doc.source["feed_id"], "feed-x");
        assert!(doc.source["timestamp"].is_i64());
    }
}

#[tokio::test]
async fn half_built_generation_is_never_referenced() {
    let mut h = harness().await;
    h.create_available().await;
    h.publish("/v2.csv", FEED_V2).await;

    // Fail after the new index exists and is populated, before it is served.
    h.store.stall_shards("feed-x-2").await;
    let outcome = h.runner.refresh_job("feed-x").await.unwrap().wait().await;
    match &outcome {
        RunOutcome::Failed(reason) => assert!(reason.contains("feed-x-2"), "{reason}"),
        other => panic!("expected shard timeout, got {other:?}"),
    }
    let record = h.record().await;
    assert_eq!(record.current_index(), Some("feed-x-1"));
    assert_eq!(record.indices, vec!["feed-x-1"]);
    assert_eq!(record.state, JobState::RefreshFailed);
    assert_eq!(record.feed_fields, vec!["ip", "tag"]);
    assert_eq!(h.store.doc_count("feed-x-1").await, 2);

    // The abandoned index is reclaimed rather than appended to.
    h.store.clear_faults().await;
    let outcome = h.runner.refresh_job("feed-x").await.unwrap().wait().await;
    assert_eq!(outcome, RunOutcome::Refreshed { index: "feed-x-2".into() });
    assert_eq!(h.store.doc_count("feed-x-2").await, 4);
    assert_eq!(h.feed_x_indices().await, vec!["feed-x-2"]);
}

#[tokio::test]
async fn failed_first_load_lands_in_create_failed_and_recovers() {
    let mut h = harness().await;
    h.publish("/v1.csv", FEED_V1).await;
    h.store.fail_bulk_writes("feed-x-1").await;

    let outcome = h
        .runner
        .create_job("feed-x", Schedule::days(1))
        .await
        .unwrap()
        .wait()
        .await;
    assert!(matches!(outcome, RunOutcome::Failed(_)));
    let record = h.record().await;
    assert_eq!(record.state, JobState::CreateFailed);
    assert!(record.indices.is_empty());
    assert!(record.update_stats.last_failed_at.is_some());
    assert!(!record.update_enabled);

    // A tick on a failed job disables it without attempting a rotation.
    let outcome = h.runner.run_scheduled("feed-x").await;
    assert_eq!(outcome, RunOutcome::Invalid(JobState::CreateFailed));

    h.store.clear_faults().await;
    let outcome = h.runner.refresh_job("feed-x").await.unwrap().wait().await;
    assert_eq!(outcome, RunOutcome::Refreshed { index: "feed-x-1".into() });
    assert_eq!(h.record().await.state, JobState::Available);
}

#[tokio::test]
async fn tick_with_auto_refresh_off_is_recorded_as_skipped() {
    let mut h = harness().await;
    h.create_available().await;

    let updated = h
        .runner
        .update_job(
            "feed-x",
            UpdateJobRequest {
                update_enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!updated.update_enabled);

    let outcome = h.runner.run_scheduled("feed-x").await;
    assert_eq!(outcome, RunOutcome::Skipped);
    let record = h.record().await;
    assert!(record.update_stats.last_skipped_at.is_some());
    assert_eq!(record.state, JobState::Available);
    assert_eq!(record.indices, vec!["feed-x-1"]);
}

#[tokio::test]
async fn tick_while_lease_is_held_is_skipped() {
    let mut h = harness().await;
    let before = h.create_available().await;

    let lease = h.runner.locks().acquire("feed-x", 300).await.unwrap().expect("lease");
    assert_eq!(h.runner.run_scheduled("feed-x").await, RunOutcome::Locked);
    assert!(matches!(
        h.runner.refresh_job("feed-x").await,
        Err(FeedJobError::Contention(_))
    ));
    assert!(matches!(
        h.runner.delete_job("feed-x").await,
        Err(FeedJobError::Contention(_))
    ));
    assert_eq!(h.record().await, before);

    h.runner.locks().release(&lease).await.unwrap();
    let outcome = h.runner.run_scheduled("feed-x").await;
    assert_eq!(outcome, RunOutcome::Refreshed { index: "feed-x-2".into() });
}

#[tokio::test]
async fn tick_for_unknown_job_is_reported_missing() {
    let h = harness().await;
    assert_eq!(h.runner.run_scheduled("feed-x").await, RunOutcome::Missing);
}

#[tokio::test]
async fn create_rejects_bad_requests_before_writing() {
    let mut h = harness().await;

    let err = h.runner.create_job("feed-x", Schedule::days(1)).await.unwrap_err();
    assert!(err.is_validation(), "no feed configured: {err}");

    h.publish("/v1.csv", FEED_V1).await;
    let err = h
        .runner
        .create_job("feed-x", Schedule::new(6, threatintel_core::IntervalUnit::Hours))
        .await
        .unwrap_err();
    assert!(matches!(err, FeedJobError::Validation(_)));
    assert!(h.runner.get_jobs(&JobSelector::All).await.unwrap().is_empty());

    h.create_available().await;
    let err = h.runner.create_job("feed-x", Schedule::days(1)).await.unwrap_err();
    assert!(matches!(err, FeedJobError::AlreadyExists(_)));
}

#[tokio::test]
async fn get_jobs_tolerates_missing_index_and_unknown_names() {
    let mut h = harness().await;
    assert!(h.runner.get_jobs(&JobSelector::All).await.unwrap().is_empty());

    h.create_available().await;
    let found = h
        .runner
        .get_jobs(&JobSelector::Names(vec!["feed-x".into(), "nope".into()]))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "feed-x");
}

#[tokio::test]
async fn update_rejects_dropped_header_fields() {
    let mut h = harness().await;
    let before = h.create_available().await;

    h.publish("/narrow.csv", "ip\n1.2.3.4\n").await;
    let err = h
        .runner
        .update_job(
            "feed-x",
            UpdateJobRequest {
                schedule: Some(Schedule::days(2)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    match err {
        FeedJobError::IncompatibleFields { missing } => assert_eq!(missing, vec!["tag"]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.record().await, before);

    // The same gate protects rotations.
    let outcome = h.runner.refresh_job("feed-x").await.unwrap().wait().await;
    assert!(matches!(outcome, RunOutcome::Failed(_)));
    let record = h.record().await;
    assert_eq!(record.indices, before.indices);
    assert_eq!(h.feed_x_indices().await, vec!["feed-x-1"]);
}

#[tokio::test]
async fn update_changes_schedule_and_validates_state() {
    let mut h = harness().await;
    let before = h.create_available().await;

    let err = h
        .runner
        .update_job(
            "feed-x",
            UpdateJobRequest {
                schedule: Some(Schedule::new(30, threatintel_core::IntervalUnit::Minutes)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FeedJobError::Validation(_)));

    let updated = h
        .runner
        .update_job(
            "feed-x",
            UpdateJobRequest {
                schedule: Some(Schedule::days(3)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.schedule.period, 3);
    assert!(updated.schedule.start_time >= before.schedule.start_time);
    assert_eq!(h.record().await.schedule.period, 3);

    let err = h
        .runner
        .update_job("missing", UpdateJobRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FeedJobError::NotFound(_)));

    let mut record = h.record().await;
    record.state = JobState::RefreshFailed;
    h.runner.jobs().update(&mut record).await.unwrap();
    let err = h
        .runner
        .update_job("feed-x", UpdateJobRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FeedJobError::Validation(_)));
}

#[tokio::test]
async fn delete_restores_state_when_indices_cannot_be_removed() {
    let mut h = harness().await;
    h.create_available().await;

    h.store.fail_index_deletion("feed-x-1").await;
    let err = h.runner.delete_job("feed-x").await.unwrap_err();
    assert!(matches!(err, FeedJobError::Store(_)));
    let record = h.record().await;
    assert_eq!(record.state, JobState::Available);
    assert_eq!(h.feed_x_indices().await, vec!["feed-x-1"]);

    h.store.clear_faults().await;
    h.runner.delete_job("feed-x").await.unwrap();
    assert!(h.runner.get_jobs(&JobSelector::All).await.unwrap().is_empty());
    assert!(h.feed_x_indices().await.is_empty());
    assert!(matches!(
        h.runner.delete_job("feed-x").await,
        Err(FeedJobError::NotFound(_))
    ));

    // The lease was released, so the name can be reused.
    h.runner
        .create_job("feed-x", Schedule::days(1))
        .await
        .unwrap()
        .wait()
        .await;
    assert_eq!(h.record().await.indices, vec!["feed-x-1"]);
}

#[tokio::test]
async fn delete_removes_generation_abandoned_by_failed_refresh() {
    let mut h = harness().await;
    h.create_available().await;
    h.publish("/v2.csv", FEED_V2).await;

    h.store.stall_shards("feed-x-2").await;
    let outcome = h.runner.refresh_job("feed-x").await.unwrap().wait().await;
    assert!(matches!(outcome, RunOutcome::Failed(_)), "{outcome:?}");
    assert_eq!(h.record().await.indices, vec!["feed-x-1"]);
    assert_eq!(h.feed_x_indices().await, vec!["feed-x-1", "feed-x-2"]);

    h.store.clear_faults().await;
    h.runner.delete_job("feed-x").await.unwrap();
    assert!(h.feed_x_indices().await.is_empty());
    assert!(h.runner.get_jobs(&JobSelector::All).await.unwrap().is_empty());
}

#[tokio::test]
async fn rotations_converge_to_one_referenced_generation() {
    let mut h = harness().await;
    h.create_available().await;

    for round in 0..5 {
        let outcome = h.runner.run_scheduled("feed-x").await;
        assert!(matches!(outcome, RunOutcome::Refreshed { .. }), "round {round}: {outcome:?}");
        let record = h.record().await;
        let existing = h.feed_x_indices().await;
        assert!(existing.len() <= 2);
        let mut referenced = record.indices.clone();
        referenced.sort();
        assert_eq!(referenced, existing, "round {round}");
    }

    // A failed cleanup keeps the leftover referenced until the next cycle.
    let current = h.record().await.current_index().unwrap().to_string();
    h.store.fail_index_deletion(&current).await;
    h.runner.run_scheduled("feed-x").await;
    let record = h.record().await;
    assert_eq!(record.indices.len(), 2);
    assert_eq!(record.indices[0], current);
    assert_eq!(h.feed_x_indices().await.len(), 2);

    h.store.clear_faults().await;
    h.runner.run_scheduled("feed-x").await;
    let record = h.record().await;
    assert_eq!(record.indices, vec![current.clone()]);
    assert_eq!(h.feed_x_indices().await, vec![current]);
}
