//! Pipeline executor: runs an item's stages in order with bounded local retry.
//!
//! Stages of one item never overlap; later stages read what earlier stages
//! wrote. A stage that keeps failing is marked `failed` and the run stops,
//! but the ledger record stays put for the recovery engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::{Instrument, info, warn};

use crate::config::PipelineSettings;
use crate::error::{Error, Result};
use crate::ledger::ProcessingLedger;
use crate::model::{StageState, TransitionPayload, WorkItem};
use crate::retry::backoff_delay;
use crate::stage::{StageError, StageInput, StageRegistry, StageReply};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_stage_transition, start_work_span};

/// Result of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Every stage from the start index is completed or skipped.
    Completed {
        outputs: BTreeMap<String, serde_json::Value>,
    },
    /// A stage exhausted its local retries. The ledger holds the details.
    Failed { stage: String, error: String },
}

impl PipelineOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PipelineOutcome::Completed { .. })
    }
}

pub struct PipelineExecutor {
    ledger: Arc<ProcessingLedger>,
    registry: Arc<StageRegistry>,
    settings: PipelineSettings,
}

impl PipelineExecutor {
    pub fn new(
        ledger: Arc<ProcessingLedger>,
        registry: Arc<StageRegistry>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            ledger,
            registry,
            settings,
        }
    }

    /// Run `item`'s stages starting at `from_index`.
    ///
    /// The item must already be registered in the ledger. Stages already
    /// completed or skipped are passed over. `Err` is reserved for ledger
    /// and store failures; stage failures come back as
    /// [`PipelineOutcome::Failed`].
    pub async fn run(&self, item: &WorkItem, from_index: usize) -> Result<PipelineOutcome> {
        let span = start_work_span(&item.kind, &item.id);
        self.run_stages(item, from_index, &span)
            .instrument(span.clone())
            .await
    }

    async fn run_stages(
        &self,
        item: &WorkItem,
        from_index: usize,
        span: &tracing::Span,
    ) -> Result<PipelineOutcome> {
        for stage_name in item.stages.iter().skip(from_index) {
            let record = self
                .ledger
                .get(item.id)
                .await
                .ok_or_else(|| Error::NotFound(item.id.to_string()))?;
            let current = record
                .stage(stage_name)
                .map(|s| s.status)
                .ok_or_else(|| Error::NotFound(format!("stage {stage_name} of {}", item.id)))?;
            if current.is_done() {
                continue;
            }

            let record = self
                .ledger
                .transition(item.id, stage_name, StageState::InProgress, TransitionPayload::None)
                .await?;
            record_stage_transition(span, stage_name, current, StageState::InProgress);

            let Some(stage) = self.registry.get(stage_name).cloned() else {
                let error = Error::UnknownStage(stage_name.clone()).to_string();
                return self.fail_stage(item, stage_name, error, span).await;
            };
            let timeout = stage.timeout().unwrap_or_else(|| self.settings.stage_timeout());

            let mut input = StageInput {
                work_id: item.id,
                kind: item.kind.clone(),
                stage: stage_name.clone(),
                file: item.file.clone(),
                attempt: 0,
                previous: record.outputs(),
            };

            let mut retries = 0u32;
            loop {
                input.attempt = retries + 1;
                let started = Instant::now();
                let result = match tokio::time::timeout(timeout, stage.run(&input)).await {
                    Ok(r) => r,
                    Err(_) => Err(StageError::timeout(timeout)),
                };
                record_duration(stage_name, started.elapsed());

                match result {
                    Ok(StageReply::Completed(output)) => {
                        self.ledger
                            .transition(
                                item.id,
                                stage_name,
                                StageState::Completed,
                                TransitionPayload::Output(output),
                            )
                            .await?;
                        record_stage_transition(
                            span,
                            stage_name,
                            StageState::InProgress,
                            StageState::Completed,
                        );
                        break;
                    }
                    Ok(StageReply::Skipped(reason)) => {
                        self.ledger
                            .transition(
                                item.id,
                                stage_name,
                                StageState::Skipped,
                                TransitionPayload::Output(serde_json::json!({ "reason": reason })),
                            )
                            .await?;
                        record_stage_transition(
                            span,
                            stage_name,
                            StageState::InProgress,
                            StageState::Skipped,
                        );
                        break;
                    }
                    Err(e) if e.retryable && retries < self.settings.max_local_retries => {
                        retries += 1;
                        self.ledger.record_retry(item.id, stage_name, &e.message).await?;
                        metrics::stage_retries()
                            .add(1, &[KeyValue::new("stage", stage_name.clone())]);

                        let delay = backoff_delay(self.settings.base_delay(), retries);
                        warn!(
                            work_id = %item.id,
                            stage = %stage_name,
                            attempt = retries,
                            max = self.settings.max_local_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "stage failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        return self.fail_stage(item, stage_name, e.message, span).await;
                    }
                }
            }
        }

        let outputs = self
            .ledger
            .get(item.id)
            .await
            .map(|r| r.outputs())
            .unwrap_or_default();
        info!(work_id = %item.id, stages = item.stages.len(), "pipeline completed");
        Ok(PipelineOutcome::Completed { outputs })
    }

    async fn fail_stage(
        &self,
        item: &WorkItem,
        stage_name: &str,
        error: String,
        span: &tracing::Span,
    ) -> Result<PipelineOutcome> {
        self.ledger
            .transition(
                item.id,
                stage_name,
                StageState::Failed,
                TransitionPayload::Error(error.clone()),
            )
            .await?;
        record_stage_transition(span, stage_name, StageState::InProgress, StageState::Failed);
        warn!(
            work_id = %item.id,
            stage = %stage_name,
            error = %error,
            "stage failed, pipeline stopped"
        );
        Ok(PipelineOutcome::Failed {
            stage: stage_name.to_string(),
            error,
        })
    }
}

fn record_duration(stage: &str, elapsed: Duration) {
    metrics::operation_duration_ms().record(
        elapsed.as_secs_f64() * 1000.0,
        &[
            KeyValue::new("operation", "stage"),
            KeyValue::new("stage", stage.to_string()),
        ],
    );
}
