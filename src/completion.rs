//! Completion ledger: append-only history of finished work items.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::ledger::ProcessingLedger;
use crate::model::{CompletionRecord, ProcessingRecord, StageState, WorkId};
use crate::store::{COMPLETION_DOC, Document, DocumentStore};
use crate::telemetry::metrics;

pub const COMPLETION_DOC_VERSION: u32 = 1;

/// On-disk shape of the completion history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionDocument {
    pub version: u32,
    pub completed: Vec<CompletionRecord>,
}

impl Default for CompletionDocument {
    fn default() -> Self {
        Self {
            version: COMPLETION_DOC_VERSION,
            completed: Vec::new(),
        }
    }
}

/// Inclusive time window; open ends are unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeRange {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TimeRange {
    /// Everything from `days` ago onwards. Fails if the cutoff is not a
    /// representable date.
    pub fn last_days(days: i64) -> Result<Self> {
        Ok(Self {
            since: Some(days_ago(days)?),
            until: None,
        })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.since.is_none_or(|s| at >= s) && self.until.is_none_or(|u| at <= u)
    }
}

/// Filters for [`CompletionLedger::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct CompletionQuery {
    pub range: TimeRange,
    pub work_id: Option<WorkId>,
    pub path_contains: Option<String>,
    pub has_errors: Option<bool>,
    pub has_retries: Option<bool>,
    pub limit: Option<usize>,
}

impl CompletionQuery {
    fn matches(&self, record: &CompletionRecord) -> bool {
        self.range.contains(record.completed_at)
            && self.work_id.is_none_or(|id| record.work_id == id)
            && self
                .path_contains
                .as_deref()
                .is_none_or(|p| record.file_path.to_string_lossy().contains(p))
            && self.has_errors.is_none_or(|want| record.has_errors() == want)
            && self.has_retries.is_none_or(|want| record.has_retries() == want)
    }
}

/// Aggregate timing for one stage name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageTiming {
    pub count: usize,
    pub total_ms: u64,
    pub mean_ms: f64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompletionStats {
    pub total: usize,
    pub with_errors: usize,
    pub with_retries: usize,
    pub mean_duration_ms: f64,
    /// Share of records that finished without any recorded error.
    pub success_rate: f64,
    pub stages: BTreeMap<String, StageTiming>,
}

pub struct CompletionLedger {
    doc: Document<CompletionDocument>,
}

impl CompletionLedger {
    pub async fn open(store: &DocumentStore) -> Result<Self> {
        Ok(Self {
            doc: store.document(COMPLETION_DOC).await?,
        })
    }

    /// Append the completion record for a finished processing record.
    ///
    /// Idempotent per work id: a second add returns the existing record.
    pub async fn add(
        &self,
        record: &ProcessingRecord,
        final_output: serde_json::Value,
    ) -> Result<CompletionRecord> {
        let candidate = CompletionRecord::from_processing(record, final_output, Utc::now())?;
        let (completion, appended) = self
            .doc
            .update(|doc| {
                if let Some(existing) = doc.completed.iter().find(|c| c.work_id == record.work_id) {
                    return Ok((existing.clone(), false));
                }
                doc.completed.push(candidate.clone());
                Ok((candidate, true))
            })
            .await?;

        if appended {
            metrics::items_completed().add(1, &[KeyValue::new("kind", completion.kind.clone())]);
            info!(
                work_id = %completion.work_id,
                duration_ms = completion.duration_ms,
                retries = completion.retry_count,
                "work completed"
            );
        } else {
            debug!(work_id = %completion.work_id, "completion already recorded");
        }
        Ok(completion)
    }

    /// Move a finished item out of the processing ledger.
    ///
    /// The completion is appended before the ledger record is removed, so a
    /// crash in between leaves a finished record that recovery can retire
    /// again without creating a duplicate.
    pub async fn retire(
        &self,
        ledger: &ProcessingLedger,
        work_id: WorkId,
    ) -> Result<CompletionRecord> {
        let record = ledger
            .get(work_id)
            .await
            .ok_or_else(|| Error::NotFound(work_id.to_string()))?;
        let output = serde_json::Value::Object(record.outputs().into_iter().collect());
        let completion = self.add(&record, output.clone()).await?;
        ledger.complete(work_id, output).await?;
        Ok(completion)
    }

    pub async fn contains(&self, work_id: WorkId) -> bool {
        self.doc
            .read(|doc| doc.completed.iter().any(|c| c.work_id == work_id))
            .await
    }

    /// Every record, in append order.
    pub async fn list(&self) -> Vec<CompletionRecord> {
        self.doc.read(|doc| doc.completed.clone()).await
    }

    pub async fn len(&self) -> usize {
        self.doc.read(|doc| doc.completed.len()).await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Matching records, newest first.
    pub async fn query(&self, query: &CompletionQuery) -> Vec<CompletionRecord> {
        let mut hits: Vec<CompletionRecord> = self
            .doc
            .read(|doc| {
                doc.completed
                    .iter()
                    .filter(|r| query.matches(r))
                    .cloned()
                    .collect()
            })
            .await;
        hits.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }
        hits
    }

    pub async fn statistics(&self, range: TimeRange) -> CompletionStats {
        self.doc
            .read(|doc| {
                let records: Vec<&CompletionRecord> = doc
                    .completed
                    .iter()
                    .filter(|r| range.contains(r.completed_at))
                    .collect();
                aggregate(&records)
            })
            .await
    }

    /// Drop records completed more than `max_age_days` ago. Returns how many.
    pub async fn cleanup(&self, max_age_days: i64) -> Result<usize> {
        let cutoff = days_ago(max_age_days)?;
        let removed = self
            .doc
            .update(|doc| {
                let before = doc.completed.len();
                doc.completed.retain(|r| r.completed_at >= cutoff);
                Ok(before - doc.completed.len())
            })
            .await?;
        info!(removed, max_age_days, "pruned completion history");
        Ok(removed)
    }
}

fn days_ago(days: i64) -> Result<DateTime<Utc>> {
    Duration::try_days(days)
        .and_then(|d| Utc::now().checked_sub_signed(d))
        .ok_or_else(|| Error::Other(format!("day count out of range: {days}")))
}

fn aggregate(records: &[&CompletionRecord]) -> CompletionStats {
    let total = records.len();
    if total == 0 {
        return CompletionStats::default();
    }

    let with_errors = records.iter().filter(|r| r.has_errors()).count();
    let with_retries = records.iter().filter(|r| r.has_retries()).count();
    let total_ms: u64 = records.iter().map(|r| r.duration_ms).sum();

    let mut stages: BTreeMap<String, StageTiming> = BTreeMap::new();
    for stage in records.iter().flat_map(|r| r.stage_pipeline.iter()) {
        if stage.status != StageState::Completed {
            continue;
        }
        let ms = stage.duration_ms.unwrap_or(0);
        let timing = stages.entry(stage.name.clone()).or_default();
        timing.count += 1;
        timing.total_ms += ms;
        timing.max_ms = timing.max_ms.max(ms);
    }
    for timing in stages.values_mut() {
        timing.mean_ms = timing.total_ms as f64 / timing.count as f64;
    }

    CompletionStats {
        total,
        with_errors,
        with_retries,
        mean_duration_ms: total_ms as f64 / total as f64,
        success_rate: (total - with_errors) as f64 / total as f64,
        stages,
    }
}
