//! Work execution span helpers.

use tracing::Span;

use crate::model::{StageState, WorkId};

/// Start a span covering one pipeline run of a work item.
///
/// `work.stage` is declared empty and filled in by [`record_stage_transition`].
pub fn start_work_span(kind: &str, work_id: &WorkId) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.kind" = kind,
        "work.id" = %work_id.0,
        "work.stage" = tracing::field::Empty,
    )
}

/// Record a stage status change on the given span.
pub fn record_stage_transition(span: &Span, stage: &str, from: StageState, to: StageState) {
    span.record("work.stage", stage);
    span.in_scope(|| {
        tracing::info!(stage, %from, %to, "stage_transition");
    });
}
