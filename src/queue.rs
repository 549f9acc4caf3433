//! Work queue: admitted, not-yet-started work items.
//!
//! Dequeue order is priority (lower first), then creation time, then
//! insertion order. De-duplication is by source path only: a path already
//! waiting in the queue is never admitted twice, even if its content changed.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::StagePlans;
use crate::error::{Error, Result};
use crate::model::{FileRef, Provenance, WorkId, WorkItem};
use crate::store::{Document, DocumentStore, QUEUE_DOC};
use crate::telemetry::metrics;

pub const QUEUE_DOC_VERSION: u32 = 1;

/// On-disk shape of the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDocument {
    pub version: u32,
    pub last_updated: DateTime<Utc>,
    pub queue: Vec<WorkItem>,
}

impl Default for QueueDocument {
    fn default() -> Self {
        Self {
            version: QUEUE_DOC_VERSION,
            last_updated: Utc::now(),
            queue: Vec::new(),
        }
    }
}

/// What happened when work was enqueued.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueResult {
    /// New work item created and queued.
    Queued(WorkItem),
    /// The path is already waiting; nothing was added.
    AlreadyQueued(WorkId),
}

/// Queue counts by kind and priority.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<i32, usize>,
    pub oldest: Option<DateTime<Utc>>,
}

pub struct WorkQueue {
    doc: Document<QueueDocument>,
    plans: StagePlans,
}

impl WorkQueue {
    pub async fn open(store: &DocumentStore, plans: StagePlans) -> Result<Self> {
        Ok(Self {
            doc: store.document(QUEUE_DOC).await?,
            plans,
        })
    }

    /// Fingerprint the file at `path` and enqueue it.
    pub async fn admit(&self, path: impl AsRef<Path>, provenance: Provenance) -> Result<EnqueueResult> {
        let file = match FileRef::from_path(path, provenance).await {
            Ok(f) => f,
            Err(e @ Error::SourceNotFound(_)) => {
                record_enqueue(provenance, "not_found");
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.enqueue(file).await
    }

    /// Enqueue an already-fingerprinted file.
    ///
    /// Priority and the stage list are computed here, once, from provenance.
    pub async fn enqueue(&self, file: FileRef) -> Result<EnqueueResult> {
        let provenance = file.provenance;
        if !tokio::fs::try_exists(&file.path).await? {
            record_enqueue(provenance, "not_found");
            return Err(Error::SourceNotFound(file.path));
        }

        let stages = self.plans.stages_for(provenance);
        let result = self
            .doc
            .update(|doc| {
                if let Some(existing) = doc.queue.iter().find(|i| i.file.path == file.path) {
                    return Ok(EnqueueResult::AlreadyQueued(existing.id));
                }

                let item = WorkItem {
                    id: WorkId::new(),
                    kind: provenance.as_str().to_string(),
                    priority: provenance.priority(),
                    file,
                    stages,
                    created_at: Utc::now(),
                };
                doc.queue.push(item.clone());
                doc.last_updated = Utc::now();
                Ok(EnqueueResult::Queued(item))
            })
            .await?;

        match &result {
            EnqueueResult::Queued(item) => {
                record_enqueue(provenance, "queued");
                info!(
                    work_id = %item.id,
                    path = %item.file.path.display(),
                    priority = item.priority,
                    stages = item.stages.len(),
                    "work queued"
                );
            }
            EnqueueResult::AlreadyQueued(id) => {
                record_enqueue(provenance, "already_queued");
                debug!(work_id = %id, "path already queued");
            }
        }
        Ok(result)
    }

    /// Remove and return the most urgent item. No other caller can observe it.
    pub async fn dequeue_next(&self) -> Result<Option<WorkItem>> {
        if self.doc.read(|doc| doc.queue.is_empty()).await {
            return Ok(None);
        }

        self.doc
            .update(|doc| {
                let Some(idx) = next_index(&doc.queue) else {
                    return Ok(None);
                };
                let item = doc.queue.remove(idx);
                doc.last_updated = Utc::now();
                Ok(Some(item))
            })
            .await
    }

    /// Remove an item by id. Returns whether it was present.
    pub async fn remove(&self, id: WorkId) -> Result<bool> {
        self.doc
            .update(|doc| {
                let before = doc.queue.len();
                doc.queue.retain(|i| i.id != id);
                let removed = doc.queue.len() != before;
                if removed {
                    doc.last_updated = Utc::now();
                }
                Ok(removed)
            })
            .await
    }

    pub async fn len(&self) -> usize {
        self.doc.read(|doc| doc.queue.len()).await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Queued items in dispatch order.
    pub async fn list(&self) -> Vec<WorkItem> {
        let mut items = self.doc.read(|doc| doc.queue.clone()).await;
        // Stable sort keeps insertion order within equal keys.
        items.sort_by_key(|i| (i.priority, i.created_at));
        items
    }

    pub async fn stats(&self) -> QueueStats {
        self.doc
            .read(|doc| {
                let mut stats = QueueStats {
                    total: doc.queue.len(),
                    ..Default::default()
                };
                for item in &doc.queue {
                    *stats.by_kind.entry(item.kind.clone()).or_default() += 1;
                    *stats.by_priority.entry(item.priority).or_default() += 1;
                    stats.oldest = Some(match stats.oldest {
                        Some(t) => t.min(item.created_at),
                        None => item.created_at,
                    });
                }
                stats
            })
            .await
    }
}

/// Index of the item with the smallest (priority, created_at); first wins ties.
fn next_index(queue: &[WorkItem]) -> Option<usize> {
    queue
        .iter()
        .enumerate()
        .min_by_key(|(_, i)| (i.priority, i.created_at))
        .map(|(idx, _)| idx)
}

fn record_enqueue(provenance: Provenance, result: &'static str) {
    metrics::work_enqueued().add(
        1,
        &[
            KeyValue::new("kind", provenance.as_str()),
            KeyValue::new("result", result),
        ],
    );
}
