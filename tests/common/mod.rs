//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use docq::config::{StagePlans, Tuning};
use docq::engine::Engine;
use docq::model::Provenance;
use docq::stage::{Stage, StageError, StageInput, StageRegistry, StageReply};
use serde_json::json;

/// In-process stage with a scripted number of failures.
pub struct ScriptedStage {
    name: String,
    /// Calls left that fail before the stage starts succeeding.
    failures: AtomicU32,
    retryable: bool,
    skip: Option<String>,
    delay: Option<Duration>,
    timeout: Option<Duration>,
    calls: AtomicU32,
}

impl ScriptedStage {
    fn build(name: &str) -> Self {
        Self {
            name: name.to_string(),
            failures: AtomicU32::new(0),
            retryable: true,
            skip: None,
            delay: None,
            timeout: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn ok(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name))
    }

    /// Fails `times` calls with a transient error, then succeeds.
    pub fn failing(name: &str, times: u32) -> Arc<Self> {
        let stage = Self::build(name);
        stage.failures.store(times, Ordering::SeqCst);
        Arc::new(stage)
    }

    pub fn always_failing(name: &str) -> Arc<Self> {
        Self::failing(name, u32::MAX)
    }

    /// Fails every call with a non-retryable error.
    pub fn fatal(name: &str) -> Arc<Self> {
        let mut stage = Self::build(name);
        stage.failures = AtomicU32::new(u32::MAX);
        stage.retryable = false;
        Arc::new(stage)
    }

    pub fn skipping(name: &str, reason: &str) -> Arc<Self> {
        let mut stage = Self::build(name);
        stage.skip = Some(reason.to_string());
        Arc::new(stage)
    }

    /// Sleeps `delay` on every call, bounded by `timeout`.
    pub fn slow(name: &str, delay: Duration, timeout: Duration) -> Arc<Self> {
        let mut stage = Self::build(name);
        stage.delay = Some(delay);
        stage.timeout = Some(timeout);
        Arc::new(stage)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Rescript: fail the next `times` calls.
    pub fn set_failures(&self, times: u32) {
        self.failures.store(times, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.set_failures(0);
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn run(&self, input: &StageInput) -> Result<StageReply, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            let message = format!("{} failed on attempt {}", self.name, input.attempt);
            return Err(if self.retryable {
                StageError::transient(message)
            } else {
                StageError::fatal(message)
            });
        }

        if let Some(reason) = &self.skip {
            return Ok(StageReply::Skipped(reason.clone()));
        }
        Ok(StageReply::Completed(json!({
            "stage": self.name,
            "attempt": input.attempt,
            "seen": input.previous.keys().collect::<Vec<_>>(),
        })))
    }
}

/// Tuning with millisecond delays and every provenance running `stages`.
pub fn fast_tuning(stages: &[&str]) -> Tuning {
    let plan: Vec<String> = stages.iter().map(|s| s.to_string()).collect();
    let plans: BTreeMap<Provenance, Vec<String>> =
        Provenance::ALL.iter().map(|p| (*p, plan.clone())).collect();

    let mut tuning = Tuning::default();
    tuning.pipeline.max_local_retries = 2;
    tuning.pipeline.base_delay_ms = 1;
    tuning.recovery.base_delay_ms = 1;
    tuning.recovery.max_retries = 3;
    tuning.plans = StagePlans::new(plans);
    tuning
}

pub fn registry(stages: &[Arc<ScriptedStage>]) -> StageRegistry {
    stages
        .iter()
        .fold(StageRegistry::empty(), |reg, s| reg.with(s.clone() as Arc<dyn Stage>))
}

/// Engine over `<dir>/data` running `stages` in order.
pub async fn engine(dir: &Path, stages: &[Arc<ScriptedStage>]) -> Engine {
    let names: Vec<&str> = stages.iter().map(|s| s.name()).collect();
    engine_with(dir, stages, fast_tuning(&names)).await
}

pub async fn engine_with(dir: &Path, stages: &[Arc<ScriptedStage>], tuning: Tuning) -> Engine {
    Engine::open(dir.join("data"), tuning, registry(stages))
        .await
        .expect("failed to open engine")
}

/// Write a source document under `<dir>/docs`.
pub async fn write_doc(dir: &Path, name: &str) -> PathBuf {
    let docs = dir.join("docs");
    tokio::fs::create_dir_all(&docs).await.unwrap();
    let path = docs.join(name);
    tokio::fs::write(&path, format!("# {name}\n")).await.unwrap();
    path
}
