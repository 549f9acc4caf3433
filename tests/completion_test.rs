//! Integration tests for the completion ledger.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{ScriptedStage, engine, write_doc};
use docq::completion::{CompletionQuery, TimeRange};
use docq::engine::Engine;
use docq::model::{Provenance, WorkId};
use serde_json::json;

/// Run one document through the engine and return its id.
async fn complete(engine: &Engine, dir: &std::path::Path, name: &str) -> WorkId {
    let path = write_doc(dir, name).await;
    engine.enqueue(&path, Provenance::Manual).await.unwrap();
    let report = engine.process_next().await.unwrap().unwrap();
    assert!(report.succeeded(), "{name} did not complete");
    report.work_id
}

#[tokio::test]
async fn add_is_idempotent_per_work_id() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), &[ScriptedStage::ok("a")]).await;
    let id = complete(&engine, dir.path(), "note.md").await;

    let existing = engine.completions().list().await.remove(0);
    // Rebuild a processing record shape from a fresh run and try to add it again.
    let path = write_doc(dir.path(), "other.md").await;
    engine.enqueue(&path, Provenance::Manual).await.unwrap();
    let item = engine.queue().dequeue_next().await.unwrap().unwrap();
    let mut record = engine.ledger().register(&item).await.unwrap();
    for stage in &mut record.stage_pipeline {
        stage.status = docq::model::StageState::Completed;
    }
    record.work_id = id;

    let again = engine.completions().add(&record, json!({"x": 1})).await.unwrap();
    assert_eq!(again, existing);
    assert_eq!(engine.completions().len().await, 1);
    assert!(engine.completions().contains(id).await);
}

#[tokio::test]
async fn add_rejects_unfinished_record() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), &[ScriptedStage::ok("a")]).await;
    let path = write_doc(dir.path(), "note.md").await;
    engine.enqueue(&path, Provenance::Manual).await.unwrap();
    let item = engine.queue().dequeue_next().await.unwrap().unwrap();
    let record = engine.ledger().register(&item).await.unwrap();

    assert!(engine.completions().add(&record, json!({})).await.is_err());
    assert!(engine.completions().is_empty().await);
}

#[tokio::test]
async fn query_filters_and_sorts_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    let flaky = ScriptedStage::ok("a");
    let engine = engine(dir.path(), &[flaky.clone()]).await;

    let first = complete(&engine, dir.path(), "alpha.md").await;
    flaky.set_failures(1);
    let second = complete(&engine, dir.path(), "beta.md").await;
    let third = complete(&engine, dir.path(), "alphabet.md").await;

    let all = engine.completions().query(&CompletionQuery::default()).await;
    let ids: Vec<WorkId> = all.iter().map(|r| r.work_id).collect();
    assert_eq!(ids, vec![third, second, first]);

    let alpha = engine
        .completions()
        .query(&CompletionQuery {
            path_contains: Some("alpha".to_string()),
            ..Default::default()
        })
        .await;
    assert_eq!(alpha.len(), 2);

    let retried = engine
        .completions()
        .query(&CompletionQuery {
            has_retries: Some(true),
            ..Default::default()
        })
        .await;
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].work_id, second);
    assert!(retried[0].has_errors());

    let clean = engine
        .completions()
        .query(&CompletionQuery {
            has_errors: Some(false),
            ..Default::default()
        })
        .await;
    assert_eq!(clean.len(), 2);

    let limited = engine
        .completions()
        .query(&CompletionQuery {
            limit: Some(1),
            ..Default::default()
        })
        .await;
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].work_id, third);

    let by_id = engine
        .completions()
        .query(&CompletionQuery {
            work_id: Some(first),
            ..Default::default()
        })
        .await;
    assert_eq!(by_id.len(), 1);

    let future = engine
        .completions()
        .query(&CompletionQuery {
            range: TimeRange {
                since: Some(Utc::now() + chrono::Duration::hours(1)),
                until: None,
            },
            ..Default::default()
        })
        .await;
    assert!(future.is_empty());
}

#[tokio::test]
async fn statistics_aggregate_runs_and_stages() {
    let dir = tempfile::tempdir().unwrap();
    let a = ScriptedStage::ok("a");
    let b = ScriptedStage::ok("b");
    let engine = engine(dir.path(), &[a.clone(), b.clone()]).await;

    complete(&engine, dir.path(), "one.md").await;
    b.set_failures(1);
    complete(&engine, dir.path(), "two.md").await;
    complete(&engine, dir.path(), "three.md").await;
    complete(&engine, dir.path(), "four.md").await;

    let stats = engine.completions().statistics(TimeRange::last_days(1).unwrap()).await;
    assert_eq!(stats.total, 4);
    assert_eq!(stats.with_errors, 1);
    assert_eq!(stats.with_retries, 1);
    assert!((stats.success_rate - 0.75).abs() < f64::EPSILON);
    assert_eq!(stats.stages.len(), 2);
    assert_eq!(stats.stages["a"].count, 4);
    assert_eq!(stats.stages["b"].count, 4);
    assert!(stats.stages["b"].max_ms >= stats.stages["b"].mean_ms as u64);

    let empty = engine
        .completions()
        .statistics(TimeRange {
            since: None,
            until: Some(Utc::now() - chrono::Duration::days(1)),
        })
        .await;
    assert_eq!(empty.total, 0);
    assert_eq!(empty.success_rate, 0.0);
}

#[tokio::test]
async fn cleanup_prunes_by_age() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), &[ScriptedStage::ok("a")]).await;
    complete(&engine, dir.path(), "one.md").await;
    complete(&engine, dir.path(), "two.md").await;

    assert_eq!(engine.completions().cleanup(30).await.unwrap(), 0);
    assert_eq!(engine.completions().len().await, 2);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(engine.completions().cleanup(0).await.unwrap(), 2);
    assert!(engine.completions().is_empty().await);
}

#[tokio::test]
async fn out_of_range_day_counts_are_errors() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), &[ScriptedStage::ok("a")]).await;
    complete(&engine, dir.path(), "one.md").await;

    assert!(TimeRange::last_days(i64::MAX).is_err());
    assert!(TimeRange::last_days(365_000_000).is_err());
    assert!(engine.completions().cleanup(i64::MAX).await.is_err());
    assert_eq!(engine.completions().len().await, 1);
}

#[tokio::test]
async fn history_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let engine = engine(dir.path(), &[ScriptedStage::ok("a")]).await;
        complete(&engine, dir.path(), "note.md").await
    };

    let engine = engine(dir.path(), &[ScriptedStage::ok("a")]).await;
    assert!(engine.completions().contains(id).await);
}
