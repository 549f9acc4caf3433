//! Typed configuration from environment variables and an optional TOML file.
//!
//! Loads once at startup, fails fast if required vars are missing. Tuning
//! knobs live in named structs; nothing is looked up by string path.

pub mod plans;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

pub use plans::StagePlans;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the persisted documents.
    pub data_dir: PathBuf,
    /// Directory of stage definition TOML files.
    pub stages_dir: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub tuning: Tuning,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// If `DOCQ_CONFIG` points at a TOML file, tuning is read from it.
    pub fn from_env() -> Result<Self> {
        let tuning = match std::env::var("DOCQ_CONFIG") {
            Ok(path) => Tuning::from_file(Path::new(&path))?,
            Err(_) => Tuning::default(),
        };

        Ok(Self {
            data_dir: PathBuf::from(required_var("DOCQ_DATA_DIR")?),
            stages_dir: std::env::var("DOCQ_STAGES_DIR").ok().map(PathBuf::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            tuning,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Engine tuning, usually from a TOML file. Every field has a default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub pipeline: PipelineSettings,
    pub recovery: RecoverySettings,
    pub dispatch: DispatchSettings,
    pub plans: StagePlans,
}

impl Tuning {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read config {}: {e}", path.display())))?;
        let tuning = Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad config {}: {e}", path.display())))?;
        tuning.validate()?;
        Ok(tuning)
    }

    /// Checks that deserialization alone cannot express.
    pub fn validate(&self) -> Result<()> {
        self.plans.validate()
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

/// Local, per-stage retry inside one pipeline run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub max_local_retries: u32,
    pub base_delay_ms: u64,
    pub stage_timeout_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_local_retries: 3,
            base_delay_ms: 1000,
            stage_timeout_secs: 300,
        }
    }
}

impl PipelineSettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

/// Cross-run recovery of failed items.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff: bool,
    /// Failures older than this are left out of a recovery pass.
    pub max_age_hours: u64,
    /// An in-progress stage older than this is treated as interrupted.
    pub stall_timeout_secs: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 5000,
            backoff: true,
            max_age_hours: 168,
            stall_timeout_secs: 1800,
        }
    }
}

/// Bulk dispatch and the long-running control loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub max_parallel: usize,
    pub delay_between_items_ms: u64,
    pub poll_interval_secs: u64,
    pub recovery_interval_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            delay_between_items_ms: 0,
            poll_interval_secs: 5,
            recovery_interval_secs: 300,
        }
    }
}
