//! Core engine. The public API for admitting, dispatching and recovering work.
//!
//! The engine owns the document store and every component built on it. All
//! lifecycle transitions go through here: queue → ledger → pipeline →
//! completion ledger, with the recovery engine picking up what fails.

pub mod control;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::completion::CompletionLedger;
use crate::config::{Config, DispatchSettings, Tuning};
use crate::error::Result;
use crate::ledger::ProcessingLedger;
use crate::model::{Provenance, WorkId, WorkItem};
use crate::pipeline::{PipelineExecutor, PipelineOutcome};
use crate::queue::{EnqueueResult, WorkQueue};
use crate::recovery::{RecoveryEngine, RecoveryOptions, RecoveryReport};
use crate::stage::StageRegistry;
use crate::store::DocumentStore;
use crate::telemetry::metrics;

pub use control::ControlPlane;

/// The work engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Engine {
    store: DocumentStore,
    queue: Arc<WorkQueue>,
    ledger: Arc<ProcessingLedger>,
    completions: Arc<CompletionLedger>,
    executor: Arc<PipelineExecutor>,
    recovery: RecoveryEngine,
    registry: Arc<StageRegistry>,
    tuning: Tuning,
}

/// How one dispatched item ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Completed,
    /// A stage exhausted its local retries; the record stays in the ledger.
    Failed { stage: String, error: String },
    /// A store error interrupted dispatch.
    Errored { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub work_id: WorkId,
    pub kind: String,
    pub file_path: PathBuf,
    pub duration_ms: u64,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

impl ItemReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == ItemOutcome::Completed
    }
}

/// Knobs for [`Engine::process_all`].
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Run items concurrently on a bounded worker pool.
    pub parallel: bool,
    pub max_parallel: usize,
    /// Stop dispatching new items after the first failure.
    pub stop_on_error: bool,
    pub delay_between_items: Duration,
}

impl BatchOptions {
    pub fn from_settings(settings: &DispatchSettings) -> Self {
        Self {
            parallel: false,
            max_parallel: settings.max_parallel.max(1),
            stop_on_error: false,
            delay_between_items: Duration::from_millis(settings.delay_between_items_ms),
        }
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from_settings(&DispatchSettings::default())
    }
}

/// What one batch run did.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub items: Vec<ItemReport>,
}

impl BatchReport {
    fn new(started_at: DateTime<Utc>, items: Vec<ItemReport>) -> Self {
        let finished_at = Utc::now();
        let succeeded = items.iter().filter(|i| i.succeeded()).count();
        Self {
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            processed: items.len(),
            succeeded,
            failed: items.len() - succeeded,
            items,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

impl Engine {
    /// Open an engine over the documents in `data_dir`.
    pub async fn open(
        data_dir: impl AsRef<Path>,
        tuning: Tuning,
        registry: StageRegistry,
    ) -> Result<Self> {
        tuning.validate()?;
        let store = DocumentStore::open(data_dir).await?;
        let registry = Arc::new(registry);

        let queue = Arc::new(WorkQueue::open(&store, tuning.plans.clone()).await?);
        let ledger = Arc::new(ProcessingLedger::open(&store).await?);
        let completions = Arc::new(CompletionLedger::open(&store).await?);
        let executor = Arc::new(PipelineExecutor::new(
            Arc::clone(&ledger),
            Arc::clone(&registry),
            tuning.pipeline.clone(),
        ));
        let recovery = RecoveryEngine::open(
            &store,
            Arc::clone(&ledger),
            Arc::clone(&completions),
            Arc::clone(&executor),
            RecoveryOptions::from_settings(&tuning.recovery, &tuning.pipeline),
        )
        .await?;

        let missing = registry.missing(&tuning.plans.stage_names());
        if !missing.is_empty() {
            warn!(?missing, "stage plans name stages with no registered collaborator");
        }

        Ok(Self {
            store,
            queue,
            ledger,
            completions,
            executor,
            recovery,
            registry,
            tuning,
        })
    }

    /// Open from loaded configuration, reading stage definitions from
    /// `stages_dir` when set.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let registry = match &config.stages_dir {
            Some(dir) => StageRegistry::load_from_dir(dir)?,
            None => StageRegistry::empty(),
        };
        Self::open(&config.data_dir, config.tuning.clone(), registry).await
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn ledger(&self) -> &ProcessingLedger {
        &self.ledger
    }

    pub fn completions(&self) -> &CompletionLedger {
        &self.completions
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    /// Admit the document at `path`.
    pub async fn enqueue(
        &self,
        path: impl AsRef<Path>,
        provenance: Provenance,
    ) -> Result<EnqueueResult> {
        self.queue.admit(path, provenance).await
    }

    /// Dequeue and process the most urgent item, if any.
    pub async fn process_next(&self) -> Result<Option<ItemReport>> {
        match self.queue.dequeue_next().await? {
            Some(item) => self.process_item(&item).await.map(Some),
            None => Ok(None),
        }
    }

    /// Register, run and (on success) retire one dequeued item.
    ///
    /// A failed pipeline leaves the record in the ledger for recovery.
    pub async fn process_item(&self, item: &WorkItem) -> Result<ItemReport> {
        let started = Instant::now();
        self.ledger.register(item).await?;

        let outcome = match self.executor.run(item, 0).await? {
            PipelineOutcome::Completed { .. } => {
                self.completions.retire(&self.ledger, item.id).await?;
                ItemOutcome::Completed
            }
            PipelineOutcome::Failed { stage, error } => ItemOutcome::Failed { stage, error },
        };

        let elapsed = started.elapsed();
        metrics::operation_duration_ms().record(
            elapsed.as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "process_item")],
        );
        Ok(ItemReport {
            work_id: item.id,
            kind: item.kind.clone(),
            file_path: item.file.path.clone(),
            duration_ms: elapsed.as_millis() as u64,
            outcome,
        })
    }

    /// Drain the queue.
    pub async fn process_all(&self, options: &BatchOptions) -> Result<BatchReport> {
        let started_at = Utc::now();
        let queued = self.queue.len().await;
        info!(
            queued = queued,
            parallel = options.parallel,
            max_parallel = options.max_parallel,
            "batch started"
        );

        let items = if options.parallel {
            self.process_parallel(options).await?
        } else {
            self.process_sequential(options).await?
        };

        let report = BatchReport::new(started_at, items);
        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            duration_ms = report.duration_ms,
            "batch finished"
        );
        Ok(report)
    }

    async fn process_sequential(&self, options: &BatchOptions) -> Result<Vec<ItemReport>> {
        let mut reports = Vec::new();
        while let Some(item) = self.queue.dequeue_next().await? {
            if !reports.is_empty() && !options.delay_between_items.is_zero() {
                tokio::time::sleep(options.delay_between_items).await;
            }
            let report = self.dispatch(item).await;
            let failed = !report.succeeded();
            reports.push(report);
            if failed && options.stop_on_error {
                warn!("stopping batch after failure");
                break;
            }
        }
        Ok(reports)
    }

    async fn process_parallel(&self, options: &BatchOptions) -> Result<Vec<ItemReport>> {
        let permits = Arc::new(Semaphore::new(options.max_parallel.max(1)));
        let stop = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();
        let mut dispatched = 0usize;

        loop {
            if stop.load(Ordering::Relaxed) {
                warn!("stopping batch after failure");
                break;
            }
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|e| crate::error::Error::Other(e.to_string()))?;
            // A worker may have failed while we waited for the permit.
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let Some(item) = self.queue.dequeue_next().await? else {
                break;
            };
            if dispatched > 0 && !options.delay_between_items.is_zero() {
                tokio::time::sleep(options.delay_between_items).await;
            }
            dispatched += 1;

            let engine = self.clone();
            let stop = Arc::clone(&stop);
            let stop_on_error = options.stop_on_error;
            tasks.spawn(async move {
                let report = engine.dispatch(item).await;
                if !report.succeeded() && stop_on_error {
                    stop.store(true, Ordering::Relaxed);
                }
                drop(permit);
                report
            });
        }

        let mut reports = Vec::with_capacity(dispatched);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "worker task panicked"),
            }
        }
        Ok(reports)
    }

    /// Process one item, folding store errors into the report.
    async fn dispatch(&self, item: WorkItem) -> ItemReport {
        match self.process_item(&item).await {
            Ok(report) => report,
            Err(e) => {
                error!(work_id = %item.id, error = %e, "dispatch failed");
                ItemReport {
                    work_id: item.id,
                    kind: item.kind.clone(),
                    file_path: item.file.path.clone(),
                    duration_ms: 0,
                    outcome: ItemOutcome::Errored {
                        error: e.to_string(),
                    },
                }
            }
        }
    }

    /// One recovery pass with the configured options.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.recovery.recover_all().await
    }

    /// One recovery pass with one-off options.
    pub async fn recover_with(&self, options: RecoveryOptions) -> Result<RecoveryReport> {
        self.recovery.with_options(options).recover_all().await
    }
}
