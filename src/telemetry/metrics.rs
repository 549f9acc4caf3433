//! Metric instruments for docq.
//!
//! Created from the globally-registered `MeterProvider`; without one they are
//! no-ops, so library code can record unconditionally.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("docq")
}

/// Counter: enqueue attempts.
/// Labels: `kind`, `result` ("queued" | "already_queued" | "not_found").
pub fn work_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("docq.work.enqueued")
        .with_description("Number of enqueue attempts")
        .build()
}

/// Counter: stage status transitions.
/// Labels: `stage`, `to`.
pub fn stage_transitions() -> Counter<u64> {
    meter()
        .u64_counter("docq.stage.transitions")
        .with_description("Number of stage status transitions")
        .build()
}

/// Counter: local stage retries inside the pipeline executor.
/// Labels: `stage`.
pub fn stage_retries() -> Counter<u64> {
    meter()
        .u64_counter("docq.stage.retries")
        .with_description("Number of local stage retries")
        .build()
}

/// Counter: recovery outcomes.
/// Labels: `outcome` ("recovered" | "still_failing" | "quarantined" | "skipped").
pub fn recovery_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("docq.recovery.outcomes")
        .with_description("Outcomes of recovery attempts")
        .build()
}

/// Counter: work items retired to the completion ledger.
/// Labels: `kind`.
pub fn items_completed() -> Counter<u64> {
    meter()
        .u64_counter("docq.work.completed")
        .with_description("Number of work items completed")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("docq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
