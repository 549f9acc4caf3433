//! Core data model.
//!
//! A work item is a document admitted for enrichment. It has identity
//! (time-ordered id + source path), provenance (where it came from), a
//! priority derived from that provenance, and the ordered list of stages it
//! must pass through. Once dispatched, its live progress is a
//! [`ProcessingRecord`]; once finished, an immutable [`CompletionRecord`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of admitted work waiting in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique, time-ordered identifier.
    pub id: WorkId,

    /// Derived from provenance (e.g. "commit", "clipper").
    pub kind: String,

    /// Lower = more urgent. Pure function of provenance.
    pub priority: i32,

    /// The document this work is about.
    pub file: FileRef,

    /// Stages this item must pass through, in order. Fixed at enqueue time.
    pub stages: Vec<String>,

    pub created_at: DateTime<Utc>,
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    /// UUIDv7, so ids sort by creation time.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl std::str::FromStr for WorkId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(WorkId)
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// Where a document came from. Determines priority and stage plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Derived from an automated commit.
    Commit,
    /// Clipped from an external source.
    Clipper,
    /// Dropped in by hand.
    Manual,
    Other,
}

impl Provenance {
    pub const ALL: [Provenance; 4] = [
        Provenance::Commit,
        Provenance::Clipper,
        Provenance::Manual,
        Provenance::Other,
    ];

    /// Queue priority. Lower is more urgent; the order is strict.
    pub fn priority(self) -> i32 {
        match self {
            Provenance::Commit => 1,
            Provenance::Clipper => 2,
            Provenance::Manual => 3,
            Provenance::Other => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::Commit => "commit",
            Provenance::Clipper => "clipper",
            Provenance::Manual => "manual",
            Provenance::Other => "other",
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provenance {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "commit" => Ok(Provenance::Commit),
            "clipper" => Ok(Provenance::Clipper),
            "manual" => Ok(Provenance::Manual),
            "other" => Ok(Provenance::Other),
            _ => Err(Error::Other(format!("unknown provenance: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// FileRef
// ---------------------------------------------------------------------------

/// A reference to the source document, captured at admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// SHA-256 of the content, hex encoded.
    pub fingerprint: String,
    pub provenance: Provenance,
}

impl FileRef {
    /// Stat and fingerprint a file on disk.
    ///
    /// Fails with [`Error::SourceNotFound`] if the path does not exist.
    pub async fn from_path(path: impl AsRef<Path>, provenance: Provenance) -> Result<Self> {
        let path = path.as_ref();
        let mut file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::SourceNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut size_bytes = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size_bytes += n as u64;
        }

        Ok(Self {
            path: path.to_path_buf(),
            size_bytes,
            fingerprint: hex::encode(hasher.finalize()),
            provenance,
        })
    }
}

// ---------------------------------------------------------------------------
// Stage status
// ---------------------------------------------------------------------------

/// Status of one stage within a processing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StageState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: StageState) -> bool {
        use StageState::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Skipped)
                | (Failed, Pending) // recovery replay
        )
    }

    /// Completed or skipped stages are never re-entered.
    pub fn is_done(self) -> bool {
        matches!(self, StageState::Completed | StageState::Skipped)
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageState::Pending => "pending",
            StageState::InProgress => "in-progress",
            StageState::Completed => "completed",
            StageState::Failed => "failed",
            StageState::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatus {
    pub name: String,
    pub status: StageState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl StageStatus {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StageState::Pending,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            output: None,
            error: None,
        }
    }
}

/// Payload carried by a stage transition.
#[derive(Debug, Clone, Default)]
pub enum TransitionPayload {
    #[default]
    None,
    Output(serde_json::Value),
    Error(String),
}

// ---------------------------------------------------------------------------
// Processing record
// ---------------------------------------------------------------------------

/// An error recorded against a processing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub stage: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Live state of one dispatched work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub work_id: WorkId,
    pub file_path: PathBuf,
    pub started_at: DateTime<Utc>,
    /// Mirrors `WorkItem::stages`; order never changes.
    pub stage_pipeline: Vec<StageStatus>,
    /// Local retries spent by the pipeline executor.
    pub retry_count: u32,
    pub errors: Vec<ErrorEntry>,

    // Enough of the originating work item to replay it.
    pub kind: String,
    pub priority: i32,
    pub file: FileRef,
    pub created_at: DateTime<Utc>,
}

impl ProcessingRecord {
    pub fn new(item: &WorkItem) -> Self {
        Self {
            work_id: item.id,
            file_path: item.file.path.clone(),
            started_at: Utc::now(),
            stage_pipeline: item.stages.iter().map(StageStatus::pending).collect(),
            retry_count: 0,
            errors: Vec::new(),
            kind: item.kind.clone(),
            priority: item.priority,
            file: item.file.clone(),
            created_at: item.created_at,
        }
    }

    /// Rebuild the work item this record was created from.
    pub fn work_item(&self) -> WorkItem {
        WorkItem {
            id: self.work_id,
            kind: self.kind.clone(),
            priority: self.priority,
            file: self.file.clone(),
            stages: self.stage_pipeline.iter().map(|s| s.name.clone()).collect(),
            created_at: self.created_at,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageStatus> {
        self.stage_pipeline.iter().find(|s| s.name == name)
    }

    pub fn has_failed_stage(&self) -> bool {
        self.stage_pipeline
            .iter()
            .any(|s| s.status == StageState::Failed)
    }

    /// Every stage completed or skipped.
    pub fn is_finished(&self) -> bool {
        self.stage_pipeline.iter().all(|s| s.status.is_done())
    }

    /// Outputs of completed stages, keyed by stage name.
    pub fn outputs(&self) -> BTreeMap<String, serde_json::Value> {
        self.stage_pipeline
            .iter()
            .filter(|s| s.status == StageState::Completed)
            .filter_map(|s| s.output.clone().map(|o| (s.name.clone(), o)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Completion record
// ---------------------------------------------------------------------------

/// Immutable snapshot of a successfully finished work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub work_id: WorkId,
    pub file_path: PathBuf,
    pub kind: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stage_pipeline: Vec<StageStatus>,
    pub retry_count: u32,
    pub errors: Vec<ErrorEntry>,
    /// Stage outputs keyed by stage name, as returned by the collaborators.
    pub output: serde_json::Value,
}

impl CompletionRecord {
    /// Snapshot a finished processing record.
    ///
    /// Fails if any stage is not yet completed or skipped.
    pub fn from_processing(
        record: &ProcessingRecord,
        final_output: serde_json::Value,
        completed_at: DateTime<Utc>,
    ) -> Result<Self> {
        if !record.is_finished() {
            return Err(Error::Other(format!(
                "work item {} has unfinished stages",
                record.work_id
            )));
        }
        Ok(Self {
            work_id: record.work_id,
            file_path: record.file_path.clone(),
            kind: record.kind.clone(),
            started_at: record.started_at,
            completed_at,
            duration_ms: (completed_at - record.started_at).num_milliseconds().max(0) as u64,
            stage_pipeline: record.stage_pipeline.clone(),
            retry_count: record.retry_count,
            errors: record.errors.clone(),
            output: final_output,
        })
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_retries(&self) -> bool {
        self.retry_count > 0
    }
}
