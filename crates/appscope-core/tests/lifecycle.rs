mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use appscope_core::model::Stage;
use appscope_core::pipeline::stage::StageOutcome;
use appscope_core::{StatusReport, SubmitRequest, TaskError, TaskStatus, TtlPolicy};

use common::{harness, FakeStage, FlakyKv};
use tokio::sync::Semaphore;

fn status_of(report: &StatusReport) -> Option<TaskStatus> {
    report.record().map(|record| record.status)
}

#[tokio::test]
async fn new_tasks_get_distinct_ids_and_start_queued() {
    let h = harness().build();
    let mut ids = HashSet::new();
    for package in ["com.a", "com.b", "com.c"] {
        let submission = h.manager.submit(SubmitRequest::new(package, "App")).await.unwrap();
        assert!(submission.is_new);
        let report = h.manager.get_status(&submission.task_id).await;
        assert_eq!(status_of(&report), Some(TaskStatus::Queued));
        let record = report.record().unwrap();
        assert_eq!(record.progress, 0.0);
        assert_eq!(record.message, "Waiting...");
        ids.insert(submission.task_id);
    }
    assert_eq!(ids.len(), 3);
    h.manager.wait_idle().await;
}

#[tokio::test]
async fn resubmitting_a_live_package_returns_the_same_task() {
    let h = harness().build();
    let first = h.manager.submit(SubmitRequest::new("com.dup", "Dup")).await.unwrap();
    let second = h.manager.submit(SubmitRequest::new("com.dup", "Dup again")).await.unwrap();
    assert!(first.is_new);
    assert!(!second.is_new);
    assert_eq!(first.task_id, second.task_id);

    // Terminal tasks still deduplicate until they expire.
    h.manager.wait_idle().await;
    let third = h.manager.submit(SubmitRequest::new("com.dup", "Dup")).await.unwrap();
    assert!(!third.is_new);
    assert_eq!(third.task_id, first.task_id);
    assert_eq!(h.primary.calls(), 1);
}

#[tokio::test]
async fn malformed_submissions_are_rejected() {
    let h = harness().build();
    let err = h.manager.submit(SubmitRequest::new("", "App")).await.unwrap_err();
    assert!(matches!(err, TaskError::InvalidRequest(_)));
    let err = h.manager.submit(SubmitRequest::new("com.x", "   ")).await.unwrap_err();
    assert!(matches!(err, TaskError::InvalidRequest(_)));
    assert!(h.manager.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_task_reports_not_found() {
    let h = harness().build();
    let report = h.manager.get_status("no-such-task").await;
    assert_eq!(
        report,
        StatusReport::NotFound {
            task_id: "no-such-task".into()
        }
    );
    assert!(h.manager.find_by_package("com.none").await.unwrap().is_none());
    assert!(matches!(
        h.manager.cancel("no-such-task").await,
        Err(TaskError::NotFound(_))
    ));
}

#[tokio::test]
async fn batch_isolates_failing_items() {
    let h = harness().build();
    let results = h
        .manager
        .submit_batch(vec![
            SubmitRequest::new("com.one", "One"),
            SubmitRequest::new("bad package", "Two"),
            SubmitRequest::new("com.one", "One"),
            SubmitRequest::new("com.three", "Three"),
        ])
        .await;
    assert_eq!(results.len(), 4);
    assert!(results[0].success && results[0].is_new);
    assert!(!results[1].success);
    assert!(results[1].task_id.is_none());
    assert!(results[2].success && !results[2].is_new);
    assert_eq!(results[2].task_id, results[0].task_id);
    assert!(results[3].success && results[3].is_new);
    h.manager.wait_idle().await;
    assert_eq!(h.manager.list_all().await.unwrap().len(), 2);
}

#[tokio::test]
async fn delete_removes_record_and_index() {
    let h = harness().build();
    let submission = h.manager.submit(SubmitRequest::new("com.del", "Del")).await.unwrap();
    h.manager.wait_idle().await;

    assert!(h.manager.delete(&submission.task_id).await.unwrap());
    assert!(matches!(
        h.manager.get_status(&submission.task_id).await,
        StatusReport::NotFound { .. }
    ));
    assert!(h.manager.find_by_package("com.del").await.unwrap().is_none());
    assert!(!h.manager.delete(&submission.task_id).await.unwrap());

    let again = h.manager.submit(SubmitRequest::new("com.del", "Del")).await.unwrap();
    assert!(again.is_new);
    assert_ne!(again.task_id, submission.task_id);
    h.manager.wait_idle().await;
}

#[tokio::test]
async fn listing_returns_every_live_task() {
    let h = harness().build();
    let a = h.manager.submit(SubmitRequest::new("com.la", "A")).await.unwrap();
    let b = h.manager.submit(SubmitRequest::new("com.lb", "B")).await.unwrap();
    h.manager.wait_idle().await;

    let ids: HashSet<_> = h.manager.list_all().await.unwrap().into_iter().collect();
    assert_eq!(ids, HashSet::from([a.task_id.clone(), b.task_id.clone()]));
    let records = h.manager.list_records().await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status == TaskStatus::Completed));
}

#[tokio::test]
async fn health_reports_the_backend() {
    let h = harness().build();
    assert!(h.manager.health_check().await);
    let report = h.manager.health().await;
    assert!(report.healthy);
    assert_eq!(report.store_backend, "memory");
    assert_eq!(report.active_workers, 0);
}

#[tokio::test(start_paused = true)]
async fn expired_tasks_disappear_and_free_the_package() {
    let h = harness().ttl(Duration::from_secs(60), TtlPolicy::Refresh).build();
    let first = h.manager.submit(SubmitRequest::new("com.ttl", "Ttl")).await.unwrap();
    h.manager.wait_idle().await;

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(matches!(
        h.manager.get_status(&first.task_id).await,
        StatusReport::NotFound { .. }
    ));
    assert!(h.manager.find_by_package("com.ttl").await.unwrap().is_none());

    let second = h.manager.submit(SubmitRequest::new("com.ttl", "Ttl")).await.unwrap();
    assert!(second.is_new);
    assert_ne!(second.task_id, first.task_id);
    h.manager.wait_idle().await;
}

#[tokio::test(start_paused = true)]
async fn refresh_policy_rearms_the_deadline_on_update() {
    let h = harness()
        .primary(FakeStage::ok(Stage::Primary, "Poker").delayed(Duration::from_secs(60)))
        .ttl(Duration::from_secs(100), TtlPolicy::Refresh)
        .build();
    let submission = h.manager.submit(SubmitRequest::new("com.refresh", "R")).await.unwrap();
    h.manager.wait_idle().await;

    // Last write happened at t=60, so the record lives until t=160.
    tokio::time::advance(Duration::from_secs(50)).await;
    let report = h.manager.get_status(&submission.task_id).await;
    assert_eq!(status_of(&report), Some(TaskStatus::Completed));
    assert_eq!(
        h.manager.find_by_package("com.refresh").await.unwrap(),
        Some(submission.task_id)
    );
}

#[tokio::test(start_paused = true)]
async fn fixed_policy_keeps_the_creation_deadline() {
    let h = harness()
        .primary(FakeStage::ok(Stage::Primary, "Poker").delayed(Duration::from_secs(60)))
        .ttl(Duration::from_secs(100), TtlPolicy::Fixed)
        .build();
    let submission = h.manager.submit(SubmitRequest::new("com.fixed", "F")).await.unwrap();
    h.manager.wait_idle().await;

    tokio::time::advance(Duration::from_secs(50)).await;
    assert!(matches!(
        h.manager.get_status(&submission.task_id).await,
        StatusReport::NotFound { .. }
    ));
    assert!(h.manager.find_by_package("com.fixed").await.unwrap().is_none());
}

#[tokio::test]
async fn failed_primary_keeps_partial_progress_below_one() {
    let h = harness()
        .primary(FakeStage::new(
            Stage::Primary,
            "Poker",
            StageOutcome::failure(Some(1), "adb: device offline"),
        ))
        .build();
    let submission = h.manager.submit(SubmitRequest::new("com.p", "P")).await.unwrap();
    h.manager.wait_idle().await;
    let report = h.manager.get_status(&submission.task_id).await;
    let record = report.record().unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record.progress < 1.0);
    assert!(record.log_path.is_some());
}

fn rank(status: TaskStatus) -> u8 {
    match status {
        TaskStatus::Queued => 0,
        TaskStatus::Running => 1,
        TaskStatus::Completed | TaskStatus::Failed => 2,
    }
}

#[tokio::test]
async fn repeated_status_reads_return_the_same_snapshot() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness()
        .primary(FakeStage::ok(Stage::Primary, "Poker").gated(gate.clone()))
        .build();
    let submission = h.manager.submit(SubmitRequest::new("com.same", "Same")).await.unwrap();
    h.primary.started.notified().await;

    let first = h.manager.get_status(&submission.task_id).await;
    let second = h.manager.get_status(&submission.task_id).await;
    assert_eq!(status_of(&first), Some(TaskStatus::Running));
    assert_eq!(first, second);

    gate.add_permits(1);
    h.manager.wait_idle().await;
    let done = h.manager.get_status(&submission.task_id).await;
    assert_eq!(done, h.manager.get_status(&submission.task_id).await);
    assert_eq!(status_of(&done), Some(TaskStatus::Completed));
}

#[tokio::test]
async fn observed_status_never_moves_backwards() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness()
        .primary(FakeStage::ok(Stage::Primary, "Poker").gated(gate.clone()))
        .build();
    let first = h.manager.submit(SubmitRequest::new("com.first", "First")).await.unwrap();
    h.primary.started.notified().await;

    // The single worker slot is busy, so the second task waits queued.
    let second = h.manager.submit(SubmitRequest::new("com.second", "Second")).await.unwrap();
    let mut seen = Vec::new();
    seen.push(status_of(&h.manager.get_status(&second.task_id).await).unwrap());

    gate.add_permits(1);
    h.primary.started.notified().await;
    seen.push(status_of(&h.manager.get_status(&second.task_id).await).unwrap());
    assert_eq!(
        status_of(&h.manager.get_status(&first.task_id).await),
        Some(TaskStatus::Completed)
    );

    gate.add_permits(1);
    h.manager.wait_idle().await;
    seen.push(status_of(&h.manager.get_status(&second.task_id).await).unwrap());

    assert_eq!(
        seen,
        vec![TaskStatus::Queued, TaskStatus::Running, TaskStatus::Completed]
    );
    assert!(seen.windows(2).all(|pair| rank(pair[0]) <= rank(pair[1])));
}

#[tokio::test]
async fn unreachable_store_degrades_instead_of_failing() {
    let kv = Arc::new(FlakyKv::new());
    let h = harness().kv(kv.clone()).build();
    let submission = h.manager.submit(SubmitRequest::new("com.up", "Up")).await.unwrap();
    h.manager.wait_idle().await;
    assert!(h.manager.health_check().await);

    kv.set_down(true);
    assert!(!h.manager.health_check().await);
    assert!(!h.manager.health().await.healthy);
    match h.manager.get_status(&submission.task_id).await {
        StatusReport::StoreUnavailable { task_id, reason } => {
            assert_eq!(task_id, submission.task_id);
            assert!(reason.contains("connection refused"));
        }
        other => panic!("unexpected report: {other:?}"),
    }
    let err = h.manager.submit(SubmitRequest::new("com.down", "Down")).await.unwrap_err();
    assert!(matches!(err, TaskError::StoreUnavailable(_)));

    kv.set_down(false);
    assert!(h.manager.health_check().await);
    assert_eq!(
        status_of(&h.manager.get_status(&submission.task_id).await),
        Some(TaskStatus::Completed)
    );
}
