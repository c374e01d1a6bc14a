//! Step execution span helpers.

use tracing::Span;

/// Start a span for one step attempt.
///
/// `flow.outcome` is declared empty and filled in by [`record_outcome`].
pub fn start_step_span(flow: &str, run_id: &str, step: &str, attempt: u32) -> Span {
    tracing::info_span!(
        "flow.step",
        "flow.name" = flow,
        "flow.run_id" = run_id,
        "flow.step" = step,
        "flow.attempt" = attempt,
        "flow.outcome" = tracing::field::Empty,
    )
}

/// Record how the attempt ended on its span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("flow.outcome", outcome);
}

/// Record a run state transition as an `info` event.
pub fn record_run_transition(flow: &str, run_id: &str, from: &str, to: &str) {
    tracing::info!(flow, run_id, from, to, "run state transition");
}
