//! Stage collaborators and their registry.
//!
//! A stage is a pluggable transformation step invoked by name. The engine
//! treats it as an opaque pass/fail operation: it gets the current document
//! state and returns an output, a skip, or an error. Stages must tolerate
//! being replayed after a partial failure.

pub mod command;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{FileRef, WorkId};

pub use command::CommandStage;

/// What a stage sees when it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInput {
    pub work_id: WorkId,
    pub kind: String,
    pub stage: String,
    pub file: FileRef,
    /// 1-based attempt number within this pipeline run.
    pub attempt: u32,
    /// Outputs of stages already completed for this item.
    pub previous: BTreeMap<String, serde_json::Value>,
}

/// Successful stage results.
#[derive(Debug, Clone, PartialEq)]
pub enum StageReply {
    Completed(serde_json::Value),
    Skipped(String),
}

/// A stage failure. Non-retryable failures skip the local retry loop.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct StageError {
    pub message: String,
    pub retryable: bool,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::transient(format!("stage timed out after {}ms", after.as_millis()))
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Per-stage timeout; `None` uses the pipeline default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn run(&self, input: &StageInput) -> std::result::Result<StageReply, StageError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Top-level TOML wrapper for a stage file.
#[derive(Debug, Deserialize)]
struct StageFile {
    stage: StageDefinition,
}

/// A stage backed by an external executable.
#[derive(Debug, Clone, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    pub command: std::path::PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_secs: Option<u64>,
}

/// Registry of stages, indexed by name.
#[derive(Default, Clone)]
pub struct StageRegistry {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register (or replace) a stage under its own name.
    pub fn register(&mut self, stage: Arc<dyn Stage>) {
        self.stages.insert(stage.name().to_string(), stage);
    }

    pub fn with(mut self, stage: Arc<dyn Stage>) -> Self {
        self.register(stage);
        self
    }

    /// Load all `.toml` stage definitions from a directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::empty();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read stages dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let file: StageFile = toml::from_str(&content).map_err(|e| {
                    Error::Config(format!("bad stage definition {}: {e}", path.display()))
                })?;
                registry.register(Arc::new(CommandStage::new(file.stage)));
            }
        }

        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Stage>> {
        self.stages.get(name)
    }

    /// Look up a stage, failing with [`Error::UnknownStage`].
    pub fn require(&self, name: &str) -> Result<&Arc<dyn Stage>> {
        self.get(name)
            .ok_or_else(|| Error::UnknownStage(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stages.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names in `wanted` with no registered stage.
    pub fn missing<'a>(&self, wanted: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        wanted
            .into_iter()
            .filter(|name| !self.stages.contains_key(name.as_str()))
            .cloned()
            .collect()
    }
}
