//! Processing ledger: live state of every dispatched work item.
//!
//! One record per item, one status per stage. Every mutation rewrites the
//! whole ledger document as a unit. A failed stage never removes its record;
//! the ledger, not a return value, is the durable record of failure.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{
    CompletionRecord, ErrorEntry, ProcessingRecord, StageState, StageStatus, TransitionPayload,
    WorkId, WorkItem,
};
use crate::store::{Document, DocumentStore, LEDGER_DOC};
use crate::telemetry::metrics;

pub const LEDGER_DOC_VERSION: u32 = 1;

/// On-disk shape of the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerDocument {
    pub version: u32,
    pub current_processing: Vec<ProcessingRecord>,
}

impl Default for LedgerDocument {
    fn default() -> Self {
        Self {
            version: LEDGER_DOC_VERSION,
            current_processing: Vec::new(),
        }
    }
}

impl LedgerDocument {
    fn record_mut(&mut self, work_id: WorkId) -> Result<&mut ProcessingRecord> {
        self.current_processing
            .iter_mut()
            .find(|r| r.work_id == work_id)
            .ok_or_else(|| Error::NotFound(work_id.to_string()))
    }
}

pub struct ProcessingLedger {
    doc: Document<LedgerDocument>,
}

impl ProcessingLedger {
    pub async fn open(store: &DocumentStore) -> Result<Self> {
        Ok(Self {
            doc: store.document(LEDGER_DOC).await?,
        })
    }

    /// Create the record for a freshly dispatched item, all stages pending.
    pub async fn register(&self, item: &WorkItem) -> Result<ProcessingRecord> {
        let record = ProcessingRecord::new(item);
        self.doc
            .update(|doc| {
                if doc.current_processing.iter().any(|r| r.work_id == item.id) {
                    return Err(Error::Other(format!(
                        "work item {} is already in the processing ledger",
                        item.id
                    )));
                }
                doc.current_processing.push(record.clone());
                Ok(())
            })
            .await?;
        debug!(work_id = %item.id, stages = item.stages.len(), "registered in ledger");
        Ok(record)
    }

    /// Move one stage to `to`, enforcing the stage state machine.
    ///
    /// A transition to `failed` also appends to the record's error list.
    pub async fn transition(
        &self,
        work_id: WorkId,
        stage: &str,
        to: StageState,
        payload: TransitionPayload,
    ) -> Result<ProcessingRecord> {
        let record = self
            .doc
            .update(|doc| {
                let record = doc.record_mut(work_id)?;
                let now = Utc::now();
                let status = record
                    .stage_pipeline
                    .iter_mut()
                    .find(|s| s.name == stage)
                    .ok_or_else(|| Error::NotFound(format!("stage {stage} of {work_id}")))?;

                if !status.status.can_transition_to(to) {
                    return Err(Error::InvalidTransition {
                        stage: stage.to_string(),
                        from: status.status,
                        to,
                    });
                }
                apply_transition(status, to, payload, now);
                let error = status.error.clone();

                if to == StageState::Failed {
                    record.errors.push(ErrorEntry {
                        stage: stage.to_string(),
                        message: error.unwrap_or_default(),
                        at: now,
                    });
                }
                Ok(record.clone())
            })
            .await?;

        metrics::stage_transitions().add(
            1,
            &[
                KeyValue::new("stage", stage.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
        Ok(record)
    }

    /// Count one local retry of `stage` and remember why it was needed.
    pub async fn record_retry(&self, work_id: WorkId, stage: &str, error: &str) -> Result<u32> {
        self.doc
            .update(|doc| {
                let record = doc.record_mut(work_id)?;
                record.retry_count += 1;
                record.errors.push(ErrorEntry {
                    stage: stage.to_string(),
                    message: error.to_string(),
                    at: Utc::now(),
                });
                Ok(record.retry_count)
            })
            .await
    }

    /// Reset every `failed` stage at or after `from_index` to `pending`.
    pub async fn reset_failed(&self, work_id: WorkId, from_index: usize) -> Result<ProcessingRecord> {
        self.doc
            .update(|doc| {
                let record = doc.record_mut(work_id)?;
                let now = Utc::now();
                for status in record.stage_pipeline.iter_mut().skip(from_index) {
                    if status.status == StageState::Failed {
                        apply_transition(status, StageState::Pending, TransitionPayload::None, now);
                    }
                }
                Ok(record.clone())
            })
            .await
    }

    pub async fn get(&self, work_id: WorkId) -> Option<ProcessingRecord> {
        self.doc
            .read(|doc| {
                doc.current_processing
                    .iter()
                    .find(|r| r.work_id == work_id)
                    .cloned()
            })
            .await
    }

    pub async fn list_all(&self) -> Vec<ProcessingRecord> {
        self.doc.read(|doc| doc.current_processing.clone()).await
    }

    pub async fn len(&self) -> usize {
        self.doc.read(|doc| doc.current_processing.len()).await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot a finished record for the completion ledger and remove it.
    pub async fn complete(
        &self,
        work_id: WorkId,
        final_output: serde_json::Value,
    ) -> Result<CompletionRecord> {
        self.doc
            .update(|doc| {
                let idx = doc
                    .current_processing
                    .iter()
                    .position(|r| r.work_id == work_id)
                    .ok_or_else(|| Error::NotFound(work_id.to_string()))?;
                let snapshot = CompletionRecord::from_processing(
                    &doc.current_processing[idx],
                    final_output,
                    Utc::now(),
                )?;
                doc.current_processing.remove(idx);
                Ok(snapshot)
            })
            .await
    }

    /// Purge a record. Only for the success path or explicit quarantine.
    pub async fn remove(&self, work_id: WorkId) -> Result<bool> {
        self.doc
            .update(|doc| {
                let before = doc.current_processing.len();
                doc.current_processing.retain(|r| r.work_id != work_id);
                Ok(doc.current_processing.len() != before)
            })
            .await
    }
}

fn apply_transition(
    status: &mut StageStatus,
    to: StageState,
    payload: TransitionPayload,
    now: DateTime<Utc>,
) {
    let elapsed_ms = |started: Option<DateTime<Utc>>| {
        started.map(|s| (now - s).num_milliseconds().max(0) as u64)
    };

    match to {
        StageState::Pending => {
            status.started_at = None;
            status.completed_at = None;
            status.duration_ms = None;
            status.output = None;
            status.error = None;
        }
        StageState::InProgress => {
            status.started_at = Some(now);
            status.completed_at = None;
            status.duration_ms = None;
            status.error = None;
        }
        StageState::Completed | StageState::Skipped | StageState::Failed => {
            status.completed_at = Some(now);
            status.duration_ms = elapsed_ms(status.started_at);
            match payload {
                TransitionPayload::Output(v) => status.output = Some(v),
                TransitionPayload::Error(e) => status.error = Some(e),
                TransitionPayload::None => {}
            }
        }
    }
    status.status = to;
}
