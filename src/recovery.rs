//! Recovery engine: replays failed work from its last checkpoint.
//!
//! A recovery pass looks at the processing ledger, picks out records that
//! failed, stalled, or finished without being retired, and drives each one
//! forward. Attempts per item are counted in the recovery state document;
//! when the count reaches `max_retries` the item is quarantined: removed
//! from the ledger and listed as a permanent failure, never retried again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::completion::CompletionLedger;
use crate::config::{PipelineSettings, RecoverySettings};
use crate::error::Result;
use crate::ledger::ProcessingLedger;
use crate::model::{ProcessingRecord, StageState, TransitionPayload, WorkId};
use crate::pipeline::{PipelineExecutor, PipelineOutcome};
use crate::retry::recovery_delay;
use crate::store::{Document, DocumentStore, RECOVERY_DOC};
use crate::telemetry::metrics;

/// Error text recorded on a stage that was found stuck in progress.
pub const INTERRUPTED: &str = "interrupted";

/// On-disk recovery bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStateDocument {
    /// Recovery attempts spent per item.
    #[serde(default)]
    pub retries: BTreeMap<WorkId, u32>,
    #[serde(default, rename = "lastRetry")]
    pub last_retry: BTreeMap<WorkId, DateTime<Utc>>,
    /// Quarantined items. Never contains duplicates.
    #[serde(default, rename = "permanentFailures")]
    pub permanent_failures: Vec<WorkId>,
}

impl RecoveryStateDocument {
    pub fn attempts(&self, work_id: WorkId) -> u32 {
        self.retries.get(&work_id).copied().unwrap_or(0)
    }

    pub fn is_quarantined(&self, work_id: WorkId) -> bool {
        self.permanent_failures.contains(&work_id)
    }
}

/// Knobs for one recovery engine.
#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff: bool,
    /// Consider failures older than `max_age` too.
    pub keep_old_failures: bool,
    pub max_age: chrono::Duration,
    pub stall_timeout: chrono::Duration,
    /// Local retry budget of the pipeline executor; a record that spent it
    /// is a candidate even without a failed stage.
    pub max_local_retries: u32,
}

impl RecoveryOptions {
    pub fn from_settings(recovery: &RecoverySettings, pipeline: &PipelineSettings) -> Self {
        Self {
            max_retries: recovery.max_retries,
            base_delay: Duration::from_millis(recovery.base_delay_ms),
            backoff: recovery.backoff,
            keep_old_failures: false,
            max_age: saturating(recovery.max_age_hours, chrono::Duration::try_hours),
            stall_timeout: saturating(recovery.stall_timeout_secs, chrono::Duration::try_seconds),
            max_local_retries: pipeline.max_local_retries,
        }
    }
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self::from_settings(&RecoverySettings::default(), &PipelineSettings::default())
    }
}

/// Out-of-range settings mean "effectively never".
fn saturating(value: u64, to_delta: fn(i64) -> Option<chrono::Duration>) -> chrono::Duration {
    i64::try_from(value)
        .ok()
        .and_then(to_delta)
        .unwrap_or(chrono::Duration::MAX)
}

/// Where a replay picks up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    /// Last stage, in pipeline order, with status `completed`.
    pub last_completed_stage: Option<String>,
    /// One past the checkpoint, or 0 when nothing completed.
    pub resume_from_index: usize,
}

/// Compute the checkpoint of a record.
pub fn checkpoint(record: &ProcessingRecord) -> Checkpoint {
    match record
        .stage_pipeline
        .iter()
        .rposition(|s| s.status == StageState::Completed)
    {
        Some(idx) => Checkpoint {
            last_completed_stage: Some(record.stage_pipeline[idx].name.clone()),
            resume_from_index: idx + 1,
        },
        None => Checkpoint {
            last_completed_stage: None,
            resume_from_index: 0,
        },
    }
}

/// Outcome of one [`RecoveryEngine::retry`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetryOutcome {
    /// Pipeline finished; the item is in the completion ledger.
    Recovered,
    /// Replay failed again; the record stays for a later pass.
    StillFailing { stage: String, error: String },
    /// Recovery budget spent; the item is quarantined.
    PermanentFailure { reason: String },
    /// Left alone this pass.
    Skipped { reason: String },
}

impl RetryOutcome {
    fn label(&self) -> &'static str {
        match self {
            RetryOutcome::Recovered => "recovered",
            RetryOutcome::StillFailing { .. } => "still_failing",
            RetryOutcome::PermanentFailure { .. } => "quarantined",
            RetryOutcome::Skipped { .. } => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryItem {
    pub work_id: WorkId,
    pub file_path: std::path::PathBuf,
    /// Recovery attempts spent after this pass.
    pub attempts: u32,
    #[serde(flatten)]
    pub outcome: RetryOutcome,
}

/// What one recovery pass did. Printed by the CLI and optionally saved.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub candidates: usize,
    pub recovered: usize,
    pub permanently_failed: usize,
    pub still_failing: usize,
    pub skipped: usize,
    pub items: Vec<RecoveryItem>,
}

impl RecoveryReport {
    fn new(started_at: DateTime<Utc>, candidates: usize, items: Vec<RecoveryItem>) -> Self {
        let count = |label: &str| items.iter().filter(|i| i.outcome.label() == label).count();
        let finished_at = Utc::now();
        Self {
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            candidates,
            recovered: count("recovered"),
            permanently_failed: count("quarantined"),
            still_failing: count("still_failing"),
            skipped: count("skipped"),
            items,
        }
    }

    /// Whether anything was quarantined during the pass.
    pub fn has_quarantined(&self) -> bool {
        self.permanently_failed > 0
    }
}

#[derive(Clone)]
pub struct RecoveryEngine {
    ledger: Arc<ProcessingLedger>,
    completions: Arc<CompletionLedger>,
    executor: Arc<PipelineExecutor>,
    state: Arc<Document<RecoveryStateDocument>>,
    options: RecoveryOptions,
}

impl RecoveryEngine {
    pub async fn open(
        store: &DocumentStore,
        ledger: Arc<ProcessingLedger>,
        completions: Arc<CompletionLedger>,
        executor: Arc<PipelineExecutor>,
        options: RecoveryOptions,
    ) -> Result<Self> {
        Ok(Self {
            ledger,
            completions,
            executor,
            state: Arc::new(store.document(RECOVERY_DOC).await?),
            options,
        })
    }

    pub fn options(&self) -> &RecoveryOptions {
        &self.options
    }

    /// Same ledgers and state document, different knobs.
    pub fn with_options(&self, options: RecoveryOptions) -> Self {
        Self {
            options,
            ..self.clone()
        }
    }

    /// Records that need recovery.
    ///
    /// Quarantined ids still present in the ledger (crash between quarantine
    /// and removal) are purged here and never returned.
    pub async fn detect_candidates(&self) -> Result<Vec<ProcessingRecord>> {
        let state = self.state.snapshot().await;
        let now = Utc::now();
        let mut candidates = Vec::new();

        for record in self.ledger.list_all().await {
            if state.is_quarantined(record.work_id) {
                warn!(work_id = %record.work_id, "quarantined item still in ledger, purging");
                self.ledger.remove(record.work_id).await?;
                continue;
            }
            if !self.needs_recovery(&record, now) {
                continue;
            }
            if !self.options.keep_old_failures && now - record.started_at > self.options.max_age {
                continue;
            }
            candidates.push(record);
        }
        Ok(candidates)
    }

    fn needs_recovery(&self, record: &ProcessingRecord, now: DateTime<Utc>) -> bool {
        record.has_failed_stage()
            || record.retry_count >= self.options.max_local_retries
            || record.is_finished()
            || self.is_stalled(record, now)
    }

    /// A stage stuck in progress, or a record that was registered but never
    /// started, for longer than the stall timeout.
    fn is_stalled(&self, record: &ProcessingRecord, now: DateTime<Utc>) -> bool {
        let timeout = self.options.stall_timeout;
        let stuck = record.stage_pipeline.iter().any(|s| {
            s.status == StageState::InProgress && s.started_at.is_some_and(|t| now - t > timeout)
        });
        let never_started = record
            .stage_pipeline
            .iter()
            .all(|s| s.status == StageState::Pending)
            && now - record.started_at > timeout;
        stuck || never_started
    }

    /// Drive one record forward. See the module docs for the policy.
    pub async fn retry(&self, record: &ProcessingRecord) -> Result<RetryOutcome> {
        self.retry_counted(record).await.map(|(outcome, _)| outcome)
    }

    /// [`retry`](Self::retry), also returning the recovery attempt count the
    /// item had reached. Bookkeeping is cleared on recovery and quarantine, so
    /// the count has to be taken here.
    async fn retry_counted(&self, record: &ProcessingRecord) -> Result<(RetryOutcome, u32)> {
        let work_id = record.work_id;
        let state = self.state.snapshot().await;
        let attempts = state.attempts(work_id);

        if state.is_quarantined(work_id) {
            let reason = "already quarantined".to_string();
            return Ok((RetryOutcome::Skipped { reason }, attempts));
        }

        if record.is_finished() {
            self.completions.retire(&self.ledger, work_id).await?;
            self.clear(work_id).await?;
            info!(work_id = %work_id, "retired finished record");
            return Ok((RetryOutcome::Recovered, attempts));
        }

        if attempts >= self.options.max_retries {
            let reason = format!("recovery attempts exhausted ({attempts})");
            self.quarantine(work_id, &reason).await?;
            return Ok((RetryOutcome::PermanentFailure { reason }, attempts));
        }

        let now = Utc::now();
        let in_flight = record
            .stage_pipeline
            .iter()
            .any(|s| s.status == StageState::InProgress);
        if in_flight && !self.is_stalled(record, now) {
            let reason = "stage in progress".to_string();
            return Ok((RetryOutcome::Skipped { reason }, attempts));
        }
        self.interrupt_stalled(record).await?;

        let attempts = self
            .state
            .update(|doc| {
                let n = doc.retries.entry(work_id).or_insert(0);
                *n += 1;
                let n = *n;
                doc.last_retry.insert(work_id, now);
                Ok(n)
            })
            .await?;

        let delay = recovery_delay(self.options.base_delay, attempts, self.options.backoff);
        let cp = checkpoint(record);
        info!(
            work_id = %work_id,
            attempt = attempts,
            max = self.options.max_retries,
            resume_from = cp.resume_from_index,
            last_completed = cp.last_completed_stage.as_deref().unwrap_or("-"),
            delay_ms = delay.as_millis() as u64,
            "recovering work item"
        );
        tokio::time::sleep(delay).await;

        let refreshed = self
            .ledger
            .reset_failed(work_id, cp.resume_from_index)
            .await?;
        let item = refreshed.work_item();

        let outcome = match self.executor.run(&item, cp.resume_from_index).await? {
            PipelineOutcome::Completed { .. } => {
                self.completions.retire(&self.ledger, work_id).await?;
                self.clear(work_id).await?;
                info!(work_id = %work_id, attempt = attempts, "work item recovered");
                RetryOutcome::Recovered
            }
            PipelineOutcome::Failed { stage, error } if attempts >= self.options.max_retries => {
                let reason = format!(
                    "stage {stage} still failing after {attempts} recovery attempts: {error}"
                );
                self.quarantine(work_id, &reason).await?;
                RetryOutcome::PermanentFailure { reason }
            }
            PipelineOutcome::Failed { stage, error } => {
                warn!(
                    work_id = %work_id,
                    stage = %stage,
                    attempt = attempts,
                    error = %error,
                    "recovery attempt failed"
                );
                RetryOutcome::StillFailing { stage, error }
            }
        };
        Ok((outcome, attempts))
    }

    /// Mark every stalled in-progress stage as failed so it can be replayed.
    async fn interrupt_stalled(&self, record: &ProcessingRecord) -> Result<()> {
        let now = Utc::now();
        for stage in &record.stage_pipeline {
            let stalled = stage.status == StageState::InProgress
                && stage
                    .started_at
                    .is_some_and(|t| now - t > self.options.stall_timeout);
            if stalled {
                warn!(work_id = %record.work_id, stage = %stage.name, "stage stalled, marking interrupted");
                self.ledger
                    .transition(
                        record.work_id,
                        &stage.name,
                        StageState::Failed,
                        TransitionPayload::Error(INTERRUPTED.to_string()),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Stop retrying an item for good.
    ///
    /// The id is recorded as a permanent failure, and its retry bookkeeping
    /// dropped, before its ledger record is removed; a crash in between is
    /// cleaned up by the next detection pass.
    pub async fn quarantine(&self, work_id: WorkId, reason: &str) -> Result<()> {
        self.state
            .update(|doc| {
                if !doc.permanent_failures.contains(&work_id) {
                    doc.permanent_failures.push(work_id);
                }
                doc.retries.remove(&work_id);
                doc.last_retry.remove(&work_id);
                Ok(())
            })
            .await?;
        self.ledger.remove(work_id).await?;
        error!(work_id = %work_id, reason, "work item quarantined");
        Ok(())
    }

    async fn clear(&self, work_id: WorkId) -> Result<()> {
        self.state
            .update(|doc| {
                doc.retries.remove(&work_id);
                doc.last_retry.remove(&work_id);
                Ok(())
            })
            .await
    }

    /// One full recovery pass over every candidate.
    ///
    /// A store error on one item is logged and reported as skipped; the pass
    /// carries on with the rest.
    pub async fn recover_all(&self) -> Result<RecoveryReport> {
        let started_at = Utc::now();
        let candidates = self.detect_candidates().await?;
        info!(candidates = candidates.len(), "recovery pass started");

        let mut items = Vec::with_capacity(candidates.len());
        for record in &candidates {
            let (outcome, attempts) = match self.retry_counted(record).await {
                Ok(counted) => counted,
                Err(e) => {
                    error!(work_id = %record.work_id, error = %e, "recovery attempt errored");
                    let attempts = self.state.read(|doc| doc.attempts(record.work_id)).await;
                    let reason = e.to_string();
                    (RetryOutcome::Skipped { reason }, attempts)
                }
            };
            metrics::recovery_outcomes().add(1, &[KeyValue::new("outcome", outcome.label())]);
            items.push(RecoveryItem {
                work_id: record.work_id,
                file_path: record.file_path.clone(),
                attempts,
                outcome,
            });
        }

        let report = RecoveryReport::new(started_at, candidates.len(), items);
        info!(
            candidates = report.candidates,
            recovered = report.recovered,
            still_failing = report.still_failing,
            quarantined = report.permanently_failed,
            skipped = report.skipped,
            duration_ms = report.duration_ms,
            "recovery pass finished"
        );
        Ok(report)
    }

    /// Drop retry bookkeeping for items no longer in the ledger.
    ///
    /// Permanent failures are kept. Returns the number of items pruned.
    pub async fn cleanup(&self) -> Result<usize> {
        let live: Vec<WorkId> = self
            .ledger
            .list_all()
            .await
            .into_iter()
            .map(|r| r.work_id)
            .collect();
        let pruned = self
            .state
            .update(|doc| {
                let stale: Vec<WorkId> = doc
                    .retries
                    .keys()
                    .chain(doc.last_retry.keys())
                    .filter(|id| !live.contains(id))
                    .copied()
                    .collect::<std::collections::BTreeSet<_>>()
                    .into_iter()
                    .collect();
                for id in &stale {
                    doc.retries.remove(id);
                    doc.last_retry.remove(id);
                }
                Ok(stale.len())
            })
            .await?;
        info!(pruned, "recovery state cleaned up");
        Ok(pruned)
    }

    /// Current retry counts and permanent failures.
    pub async fn status(&self) -> RecoveryStateDocument {
        self.state.snapshot().await
    }
}
