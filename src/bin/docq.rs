//! docq CLI — operator interface to the document work engine.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use docq::completion::{CompletionQuery, TimeRange};
use docq::config::Config;
use docq::engine::{BatchOptions, ControlPlane, Engine, ItemOutcome};
use docq::model::{Provenance, WorkId};
use docq::queue::EnqueueResult;
use docq::recovery::{RecoveryOptions, RecoveryReport, RetryOutcome};
use docq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "docq", about = "Durable work queue for document enrichment")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Admit documents into the work queue
    Enqueue {
        /// Files to admit
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Where the documents came from (commit, clipper, manual, other)
        #[arg(long, default_value = "manual")]
        provenance: Provenance,
    },
    /// Show queued work
    Queue,
    /// Process every queued item
    ProcessAll {
        /// Run items on a bounded worker pool
        #[arg(long)]
        parallel: bool,
        /// Worker pool size
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Stop dispatching after the first failure
        #[arg(long)]
        stop_on_error: bool,
        /// Pause between items, in milliseconds
        #[arg(long)]
        delay_between_items: Option<u64>,
    },
    /// Run one recovery pass over failed work
    Recover {
        /// Recovery attempts before an item is quarantined
        #[arg(long)]
        max_retries: Option<u32>,
        /// Base delay between attempts, in milliseconds
        #[arg(long)]
        delay: Option<u64>,
        /// Use a constant delay instead of exponential backoff
        #[arg(long)]
        no_backoff: bool,
        /// Also retry failures older than the configured max age
        #[arg(long)]
        keep_old_failures: bool,
        /// Write the JSON report under <data_dir>/reports
        #[arg(long)]
        save_report: bool,
    },
    /// Prune recovery state for items no longer in the ledger
    Cleanup,
    /// Show recovery retry counts and quarantined items
    Status,
    /// Query completed work
    History {
        /// Only the last N days
        #[arg(long)]
        days: Option<i64>,
        /// Full work item id
        #[arg(long)]
        work_id: Option<String>,
        /// Path substring
        #[arg(long)]
        path: Option<String>,
        /// Only items that recorded errors
        #[arg(long)]
        errors: bool,
        /// Only items that needed retries
        #[arg(long)]
        retries: bool,
        /// Maximum items to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Aggregate completion statistics
    Stats {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Drop completion history older than a cutoff
    Prune {
        #[arg(long, default_value_t = 90)]
        max_age_days: i64,
    },
    /// Run the dispatch and recovery loop until Ctrl-C
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "docq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let engine = Engine::from_config(&config).await?;

    match cli.command {
        Command::Enqueue { paths, provenance } => cmd_enqueue(&engine, paths, provenance).await,
        Command::Queue => cmd_queue(&engine).await,
        Command::ProcessAll {
            parallel,
            max_parallel,
            stop_on_error,
            delay_between_items,
        } => {
            let defaults = BatchOptions::from_settings(&config.tuning.dispatch);
            let options = BatchOptions {
                parallel,
                max_parallel: max_parallel.unwrap_or(defaults.max_parallel),
                stop_on_error,
                delay_between_items: delay_between_items
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.delay_between_items),
            };
            cmd_process_all(&engine, options).await
        }
        Command::Recover {
            max_retries,
            delay,
            no_backoff,
            keep_old_failures,
            save_report,
        } => {
            let mut options = engine.recovery().options().clone();
            if let Some(n) = max_retries {
                options.max_retries = n;
            }
            if let Some(ms) = delay {
                options.base_delay = Duration::from_millis(ms);
            }
            options.backoff &= !no_backoff;
            options.keep_old_failures |= keep_old_failures;
            cmd_recover(&engine, &config, options, save_report).await
        }
        Command::Cleanup => {
            let pruned = engine.recovery().cleanup().await?;
            println!("Pruned recovery state for {pruned} item(s).");
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => cmd_status(&engine).await,
        Command::History {
            days,
            work_id,
            path,
            errors,
            retries,
            limit,
        } => {
            let work_id = match work_id {
                Some(s) => Some(
                    s.parse::<WorkId>()
                        .map_err(|e| anyhow::anyhow!("invalid work id {s}: {e}"))?,
                ),
                None => None,
            };
            let query = CompletionQuery {
                range: days.map(TimeRange::last_days).transpose()?.unwrap_or_default(),
                work_id,
                path_contains: path,
                has_errors: errors.then_some(true),
                has_retries: retries.then_some(true),
                limit: Some(limit),
            };
            cmd_history(&engine, query).await
        }
        Command::Stats { days } => {
            let stats = engine
                .completions()
                .statistics(TimeRange::last_days(days)?)
                .await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Prune { max_age_days } => {
            let removed = engine.completions().cleanup(max_age_days).await?;
            println!("Removed {removed} completion record(s) older than {max_age_days} day(s).");
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve => cmd_serve(engine, &config).await,
    }
}

async fn cmd_enqueue(
    engine: &Engine,
    paths: Vec<PathBuf>,
    provenance: Provenance,
) -> anyhow::Result<ExitCode> {
    let mut missing = 0;
    for path in paths {
        match engine.enqueue(&path, provenance).await {
            Ok(EnqueueResult::Queued(item)) => {
                println!(
                    "Queued: {} {} (priority {}, {} stages)",
                    item.id,
                    path.display(),
                    item.priority,
                    item.stages.len()
                );
            }
            Ok(EnqueueResult::AlreadyQueued(id)) => {
                println!("Already queued: {id} {}", path.display());
            }
            Err(docq::error::Error::SourceNotFound(p)) => {
                eprintln!("Not found: {}", p.display());
                missing += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(if missing > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn cmd_queue(engine: &Engine) -> anyhow::Result<ExitCode> {
    let items = engine.queue().list().await;
    if items.is_empty() {
        println!("Queue is empty.");
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{:<8}  {:<8}  {:<4}  {:<16}  PATH",
        "ID", "KIND", "PRI", "CREATED"
    );
    println!("{}", "-".repeat(80));
    for item in &items {
        println!(
            "{:<8}  {:<8}  {:<4}  {:<16}  {}",
            item.id,
            item.kind,
            item.priority,
            item.created_at.format("%Y-%m-%d %H:%M"),
            item.file.path.display()
        );
    }

    let stats = engine.queue().stats().await;
    println!("\n{} item(s)", stats.total);
    for (kind, n) in &stats.by_kind {
        println!("  {kind}: {n}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_process_all(engine: &Engine, options: BatchOptions) -> anyhow::Result<ExitCode> {
    let report = engine.process_all(&options).await?;

    for item in &report.items {
        match &item.outcome {
            ItemOutcome::Completed => {
                println!(
                    "ok      {}  {}ms  {}",
                    item.work_id,
                    item.duration_ms,
                    item.file_path.display()
                );
            }
            ItemOutcome::Failed { stage, error } => {
                println!(
                    "FAILED  {}  {stage}: {error}  {}",
                    item.work_id,
                    item.file_path.display()
                );
            }
            ItemOutcome::Errored { error } => {
                println!(
                    "ERROR   {}  {error}  {}",
                    item.work_id,
                    item.file_path.display()
                );
            }
        }
    }
    println!(
        "\nProcessed {} item(s): {} succeeded, {} failed in {}ms",
        report.processed, report.succeeded, report.failed, report.duration_ms
    );

    Ok(if report.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn cmd_recover(
    engine: &Engine,
    config: &Config,
    options: RecoveryOptions,
    save_report: bool,
) -> anyhow::Result<ExitCode> {
    let report = engine.recover_with(options).await?;
    print_recovery_report(&report);

    if save_report {
        let dir = config.data_dir.join("reports");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!(
            "recovery-{}.json",
            report.started_at.format("%Y%m%dT%H%M%SZ")
        ));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&report)?).await?;
        println!("Report saved to {}", path.display());
    }

    Ok(if report.has_quarantined() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_recovery_report(report: &RecoveryReport) {
    for item in &report.items {
        let detail = match &item.outcome {
            RetryOutcome::Recovered => "recovered".to_string(),
            RetryOutcome::StillFailing { stage, error } => {
                format!("still failing at {stage}: {error}")
            }
            RetryOutcome::PermanentFailure { reason } => format!("QUARANTINED: {reason}"),
            RetryOutcome::Skipped { reason } => format!("skipped: {reason}"),
        };
        println!(
            "{}  attempts={}  {}  {}",
            item.work_id,
            item.attempts,
            detail,
            item.file_path.display()
        );
    }
    println!(
        "\n{} candidate(s): {} recovered, {} still failing, {} quarantined, {} skipped in {}ms",
        report.candidates,
        report.recovered,
        report.still_failing,
        report.permanently_failed,
        report.skipped,
        report.duration_ms
    );
}

async fn cmd_status(engine: &Engine) -> anyhow::Result<ExitCode> {
    let status = engine.recovery().status().await;

    if status.retries.is_empty() {
        println!("No active retries.");
    } else {
        println!("{:<36}  {:<8}  LAST RETRY", "ID", "ATTEMPTS");
        for (id, attempts) in &status.retries {
            let last = status
                .last_retry
                .get(id)
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("{:<36}  {:<8}  {last}", id.0, attempts);
        }
    }

    println!("\n{} permanent failure(s)", status.permanent_failures.len());
    for id in &status.permanent_failures {
        println!("  {}", id.0);
    }
    println!("{} item(s) in the processing ledger", engine.ledger().len().await);
    Ok(ExitCode::SUCCESS)
}

async fn cmd_history(engine: &Engine, query: CompletionQuery) -> anyhow::Result<ExitCode> {
    let records = engine.completions().query(&query).await;
    if records.is_empty() {
        println!("No completed work found.");
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{:<8}  {:<8}  {:<16}  {:>8}  {:>7}  {:>6}  PATH",
        "ID", "KIND", "COMPLETED", "MS", "RETRIES", "ERRORS"
    );
    println!("{}", "-".repeat(90));
    for r in &records {
        println!(
            "{:<8}  {:<8}  {:<16}  {:>8}  {:>7}  {:>6}  {}",
            r.work_id,
            r.kind,
            r.completed_at.format("%Y-%m-%d %H:%M"),
            r.duration_ms,
            r.retry_count,
            r.errors.len(),
            r.file_path.display()
        );
    }
    println!("\n{} item(s)", records.len());
    Ok(ExitCode::SUCCESS)
}

async fn cmd_serve(engine: Engine, config: &Config) -> anyhow::Result<ExitCode> {
    let control = ControlPlane::new(engine, &config.tuning.dispatch);

    let ctrl = control.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    control.run().await?;
    Ok(ExitCode::SUCCESS)
}
