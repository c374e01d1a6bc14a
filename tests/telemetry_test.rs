//! Integration tests for telemetry initialization and span helpers.

use flowq::telemetry::{TelemetryConfig, init_telemetry, metrics, step};
use opentelemetry::KeyValue;

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can be installed once per process; a second
    // attempt reports an error instead of panicking.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "flowq-test".to_string(),
        log_level: "debug".to_string(),
    };
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn step_span_records_outcome() {
    let span = step::start_step_span("order-flow", "run-1", "ship", 2);
    step::record_outcome(&span, "ok");
    step::record_run_transition("order-flow", "run-1", "running", "completed");
}

#[test]
fn metrics_record_without_a_provider() {
    metrics::runs_started().add(1, &[KeyValue::new("flow", "order-flow")]);
    metrics::step_invocations().add(1, &[KeyValue::new("outcome", "ok")]);
    metrics::operation_duration_ms().record(1.5, &[KeyValue::new("operation", "test")]);
}
