//! Control plane: drains the queue on a poll interval and runs periodic recovery.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::DispatchSettings;
use crate::error::Result;

use super::{BatchOptions, Engine};

/// The long-running dispatch loop behind `docq serve`.
#[derive(Clone)]
pub struct ControlPlane {
    engine: Engine,
    batch: BatchOptions,
    poll_interval: Duration,
    recovery_interval: Duration,
    shutdown: Arc<Notify>,
}

impl ControlPlane {
    pub fn new(engine: Engine, settings: &DispatchSettings) -> Self {
        Self {
            engine,
            batch: BatchOptions {
                parallel: settings.max_parallel > 1,
                ..BatchOptions::from_settings(settings)
            },
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            recovery_interval: Duration::from_secs(settings.recovery_interval_secs),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_intervals(mut self, poll: Duration, recovery: Duration) -> Self {
        self.poll_interval = poll;
        self.recovery_interval = recovery;
        self
    }

    /// Signal the control plane to shut down.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until shutdown.
    ///
    /// Errors from a single tick are logged and the loop carries on.
    pub async fn run(&self) -> Result<()> {
        info!(
            poll_secs = self.poll_interval.as_secs_f64(),
            recovery_secs = self.recovery_interval.as_secs_f64(),
            "control plane started"
        );
        let mut last_recovery = Instant::now();

        loop {
            if let Err(e) = self.drain().await {
                error!("drain error: {e}");
            }
            if last_recovery.elapsed() >= self.recovery_interval {
                last_recovery = Instant::now();
                match self.engine.recover().await {
                    Ok(report) if report.has_quarantined() => {
                        warn!(quarantined = report.permanently_failed, "items quarantined");
                    }
                    Ok(_) => {}
                    Err(e) => error!("recovery error: {e}"),
                }
            }

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("control plane shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn drain(&self) -> Result<()> {
        if self.engine.queue().is_empty().await {
            return Ok(());
        }
        let report = self.engine.process_all(&self.batch).await?;
        if report.has_failures() {
            warn!(failed = report.failed, "batch had failures, left for recovery");
        }
        Ok(())
    }
}
