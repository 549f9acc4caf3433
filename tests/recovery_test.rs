//! Integration tests for the recovery engine.

mod common;

use std::path::Path;
use std::time::Duration;

use common::{ScriptedStage, engine, engine_with, fast_tuning, write_doc};
use docq::engine::{Engine, ItemOutcome};
use docq::model::{Provenance, StageState, TransitionPayload, WorkId, WorkItem};
use docq::recovery::{INTERRUPTED, RetryOutcome, checkpoint};
use docq::store::RECOVERY_DOC;
use serde_json::json;

/// Enqueue one document and run it once; it is expected to fail.
async fn fail_once(engine: &Engine, dir: &Path) -> WorkId {
    let path = write_doc(dir, "stuck.md").await;
    engine.enqueue(&path, Provenance::Manual).await.unwrap();
    let report = engine.process_next().await.unwrap().unwrap();
    assert!(matches!(report.outcome, ItemOutcome::Failed { .. }));
    report.work_id
}

async fn dequeued(engine: &Engine, dir: &Path) -> WorkItem {
    let path = write_doc(dir, "note.md").await;
    engine.enqueue(&path, Provenance::Manual).await.unwrap();
    engine.queue().dequeue_next().await.unwrap().unwrap()
}

async fn write_recovery_state(dir: &Path, state: serde_json::Value) {
    let path = dir.join("data").join(RECOVERY_DOC);
    tokio::fs::write(path, serde_json::to_vec(&state).unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn replay_resumes_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let a = ScriptedStage::ok("a");
    let b = ScriptedStage::ok("b");
    let c = ScriptedStage::always_failing("c");
    let d = ScriptedStage::ok("d");
    let engine = engine(dir.path(), &[a.clone(), b.clone(), c.clone(), d.clone()]).await;

    let id = fail_once(&engine, dir.path()).await;
    let record = engine.ledger().get(id).await.unwrap();
    let states: Vec<StageState> = record.stage_pipeline.iter().map(|s| s.status).collect();
    assert_eq!(
        states,
        vec![
            StageState::Completed,
            StageState::Completed,
            StageState::Failed,
            StageState::Pending
        ]
    );
    let cp = checkpoint(&record);
    assert_eq!(cp.resume_from_index, 2);
    assert_eq!(cp.last_completed_stage.as_deref(), Some("b"));

    c.heal();
    let c_calls = c.calls();
    let report = engine.recover().await.unwrap();

    assert_eq!(report.candidates, 1);
    assert_eq!(report.recovered, 1);
    assert_eq!(report.items[0].outcome, RetryOutcome::Recovered);
    // Completed stages were not re-entered.
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 1);
    assert_eq!(c.calls(), c_calls + 1);
    assert_eq!(d.calls(), 1);

    assert!(engine.ledger().get(id).await.is_none());
    assert!(engine.completions().contains(id).await);
    let status = engine.recovery().status().await;
    assert_eq!(status.attempts(id), 0);
    assert!(!status.last_retry.contains_key(&id));
}

#[tokio::test]
async fn stuck_item_is_quarantined_after_max_retries() {
    let dir = tempfile::tempdir().unwrap();
    let stage = ScriptedStage::always_failing("a");
    let engine = engine(dir.path(), &[stage.clone()]).await;
    let id = fail_once(&engine, dir.path()).await;

    for pass in 1..=2u32 {
        let report = engine.recover().await.unwrap();
        assert_eq!(report.still_failing, 1, "pass {pass}");
        assert!(!report.has_quarantined());
        assert_eq!(engine.recovery().status().await.attempts(id), pass);
        assert!(engine.ledger().get(id).await.is_some());
    }

    let report = engine.recover().await.unwrap();
    assert_eq!(report.permanently_failed, 1);
    assert!(report.has_quarantined());
    assert_eq!(report.items[0].attempts, 3);
    assert!(matches!(
        report.items[0].outcome,
        RetryOutcome::PermanentFailure { .. }
    ));
    assert!(engine.ledger().get(id).await.is_none());

    // Quarantine drops the retry bookkeeping along with the ledger record.
    let status = engine.recovery().status().await;
    assert_eq!(status.permanent_failures, vec![id]);
    assert!(!status.retries.contains_key(&id));
    assert!(!status.last_retry.contains_key(&id));

    let report = engine.recover().await.unwrap();
    assert_eq!(report.candidates, 0);
    assert!(!engine.completions().contains(id).await);
}

#[tokio::test]
async fn counter_at_max_minus_one_quarantines_on_next_pass() {
    let dir = tempfile::tempdir().unwrap();
    let stage = ScriptedStage::always_failing("a");
    let id = {
        let engine = engine(dir.path(), &[stage.clone()]).await;
        fail_once(&engine, dir.path()).await
    };
    write_recovery_state(
        dir.path(),
        json!({"retries": {id.0.to_string(): 2}, "lastRetry": {}, "permanentFailures": []}),
    )
    .await;

    let engine = engine(dir.path(), &[stage.clone()]).await;
    let report = engine.recover().await.unwrap();
    assert_eq!(report.permanently_failed, 1);
    assert!(engine.ledger().get(id).await.is_none());

    let report = engine.recover().await.unwrap();
    assert_eq!(report.candidates, 0);
}

#[tokio::test]
async fn counter_already_at_max_quarantines_without_replay() {
    let dir = tempfile::tempdir().unwrap();
    let stage = ScriptedStage::always_failing("a");
    let id = {
        let engine = engine(dir.path(), &[stage.clone()]).await;
        fail_once(&engine, dir.path()).await
    };
    write_recovery_state(
        dir.path(),
        json!({"retries": {id.0.to_string(): 3}, "lastRetry": {}, "permanentFailures": []}),
    )
    .await;
    let calls = stage.calls();

    let engine = engine(dir.path(), &[stage.clone()]).await;
    let report = engine.recover().await.unwrap();
    assert_eq!(report.permanently_failed, 1);
    assert_eq!(report.items[0].attempts, 3);
    assert_eq!(stage.calls(), calls);
    let status = engine.recovery().status().await;
    assert_eq!(status.attempts(id), 0);
    assert!(status.is_quarantined(id));
}

#[tokio::test]
async fn quarantined_record_left_in_ledger_is_purged() {
    let dir = tempfile::tempdir().unwrap();
    let stage = ScriptedStage::always_failing("a");
    let id = {
        let engine = engine(dir.path(), &[stage.clone()]).await;
        fail_once(&engine, dir.path()).await
    };
    write_recovery_state(
        dir.path(),
        json!({"retries": {}, "lastRetry": {}, "permanentFailures": [id.0.to_string()]}),
    )
    .await;

    let engine = engine(dir.path(), &[stage]).await;
    assert!(engine.ledger().get(id).await.is_some());
    let candidates = engine.recovery().detect_candidates().await.unwrap();
    assert!(candidates.is_empty());
    assert!(engine.ledger().get(id).await.is_none());
}

#[tokio::test]
async fn finished_record_is_retired_once() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), &[ScriptedStage::ok("a")]).await;
    let item = dequeued(&engine, dir.path()).await;
    let ledger = engine.ledger();
    ledger.register(&item).await.unwrap();
    ledger
        .transition(item.id, "a", StageState::InProgress, TransitionPayload::None)
        .await
        .unwrap();
    let record = ledger
        .transition(
            item.id,
            "a",
            StageState::Completed,
            TransitionPayload::Output(json!({"ok": true})),
        )
        .await
        .unwrap();

    // Crash after the completion append, before the ledger removal.
    engine.completions().add(&record, json!({})).await.unwrap();

    let report = engine.recover().await.unwrap();
    assert_eq!(report.recovered, 1);
    assert!(engine.ledger().is_empty().await);
    assert_eq!(engine.completions().len().await, 1);
    assert_eq!(engine.recovery().status().await.attempts(item.id), 0);
}

#[tokio::test]
async fn stalled_stage_is_interrupted_and_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let stage = ScriptedStage::ok("a");
    let mut tuning = fast_tuning(&["a"]);
    tuning.recovery.stall_timeout_secs = 0;
    let engine = engine_with(dir.path(), &[stage.clone()], tuning).await;

    let item = dequeued(&engine, dir.path()).await;
    engine.ledger().register(&item).await.unwrap();
    engine
        .ledger()
        .transition(item.id, "a", StageState::InProgress, TransitionPayload::None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = engine.recover().await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(stage.calls(), 1);

    let done = &engine.completions().list().await[0];
    assert_eq!(done.work_id, item.id);
    assert_eq!(done.errors[0].message, INTERRUPTED);
}

#[tokio::test]
async fn in_flight_stage_is_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), &[ScriptedStage::ok("a")]).await;
    let item = dequeued(&engine, dir.path()).await;
    let ledger = engine.ledger();
    ledger.register(&item).await.unwrap();
    ledger
        .transition(item.id, "a", StageState::InProgress, TransitionPayload::None)
        .await
        .unwrap();
    // Spent its local retry budget, so it is a candidate, but still running.
    ledger.record_retry(item.id, "a", "slow").await.unwrap();
    ledger.record_retry(item.id, "a", "slow").await.unwrap();

    let report = engine.recover().await.unwrap();
    assert_eq!(report.candidates, 1);
    assert_eq!(report.skipped, 1);
    assert!(ledger.get(item.id).await.is_some());
    assert_eq!(engine.recovery().status().await.attempts(item.id), 0);
}

#[tokio::test]
async fn old_failures_are_ignored_unless_kept() {
    let dir = tempfile::tempdir().unwrap();
    let stage = ScriptedStage::always_failing("a");
    let mut tuning = fast_tuning(&["a"]);
    tuning.recovery.max_age_hours = 0;
    let engine = engine_with(dir.path(), &[stage], tuning).await;
    let id = fail_once(&engine, dir.path()).await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = engine.recover().await.unwrap();
    assert_eq!(report.candidates, 0);
    assert!(engine.ledger().get(id).await.is_some());

    let mut options = engine.recovery().options().clone();
    options.keep_old_failures = true;
    let report = engine.recover_with(options).await.unwrap();
    assert_eq!(report.candidates, 1);
    assert_eq!(report.still_failing, 1);
}

#[tokio::test]
async fn cleanup_prunes_state_for_absent_items() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), &[ScriptedStage::always_failing("a")]).await;
    let id = fail_once(&engine, dir.path()).await;

    engine.recover().await.unwrap();
    assert_eq!(engine.recovery().cleanup().await.unwrap(), 0);
    assert_eq!(engine.recovery().status().await.attempts(id), 1);

    engine.ledger().remove(id).await.unwrap();
    assert_eq!(engine.recovery().cleanup().await.unwrap(), 1);
    let status = engine.recovery().status().await;
    assert!(status.retries.is_empty());
    assert!(status.last_retry.is_empty());
}

#[tokio::test]
async fn recovery_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let stage = ScriptedStage::always_failing("a");
    let id = {
        let engine = engine(dir.path(), &[stage.clone()]).await;
        let id = fail_once(&engine, dir.path()).await;
        engine.recover().await.unwrap();
        id
    };

    let engine = engine(dir.path(), &[stage]).await;
    let status = engine.recovery().status().await;
    assert_eq!(status.attempts(id), 1);
    assert!(status.last_retry.contains_key(&id));
}
