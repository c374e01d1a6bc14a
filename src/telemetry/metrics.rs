//! Metric instrument factories for flowq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"flowq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for flowq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("flowq")
}

/// Counter: events appended to the store.
/// Labels: `adapter`, `kind`.
pub fn events_appended() -> Counter<u64> {
    meter()
        .u64_counter("flowq.events.appended")
        .with_description("Number of events appended to the event store")
        .build()
}

/// Counter: flow runs started.
/// Labels: `flow`.
pub fn runs_started() -> Counter<u64> {
    meter()
        .u64_counter("flowq.runs.started")
        .with_description("Number of flow runs started")
        .build()
}

/// Counter: flow runs reaching a terminal state.
/// Labels: `flow`, `status` ("completed" | "failed" | "cancelled").
pub fn runs_finished() -> Counter<u64> {
    meter()
        .u64_counter("flowq.runs.finished")
        .with_description("Number of flow runs reaching a terminal state")
        .build()
}

/// Counter: step invocations.
/// Labels: `flow`, `step`, `outcome` ("ok" | "error" | "timeout").
pub fn step_invocations() -> Counter<u64> {
    meter()
        .u64_counter("flowq.steps.invocations")
        .with_description("Number of step handler invocations")
        .build()
}

/// Counter: await resolution attempts.
/// Labels: `type`, `outcome` ("resumed" | "not_found" | "timeout").
pub fn await_resolutions() -> Counter<u64> {
    meter()
        .u64_counter("flowq.awaits.resolutions")
        .with_description("Number of await resolution attempts")
        .build()
}

/// Counter: scheduled job executions.
/// Labels: `job`, `outcome` ("ok" | "error").
pub fn job_executions() -> Counter<u64> {
    meter()
        .u64_counter("flowq.scheduler.executions")
        .with_description("Number of scheduled job executions")
        .build()
}

/// Counter: due jobs skipped because another instance held the lock.
/// Labels: `job`.
pub fn lock_contention() -> Counter<u64> {
    meter()
        .u64_counter("flowq.scheduler.lock_contention")
        .with_description("Number of scheduler lock acquisitions lost to another instance")
        .build()
}

/// Counter: trigger emissions.
/// Labels: `trigger`, `type`.
pub fn trigger_emissions() -> Counter<u64> {
    meter()
        .u64_counter("flowq.triggers.emitted")
        .with_description("Number of trigger emissions")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("flowq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
