//! Error types for docq.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::StageState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("invalid transition for stage {stage}: {from} -> {to}")]
    InvalidTransition {
        stage: String,
        from: StageState,
        to: StageState,
    },

    #[error("source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("no stage registered under name {0:?}")]
    UnknownStage(String),

    #[error("corrupt document {}: {reason}", path.display())]
    StoreCorruption { path: PathBuf, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
