//! Integration tests for the flow engine on the in-memory store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flowq::error::Error;
use flowq::flow::{EngineConfig, FlowEngine, FlowRegistration, StepHandler, step_fn};
use flowq::model::event::{IndexRange, ReadOptions};
use flowq::model::flow::{AwaitSpec, FlowDefinition, RetryPolicy, StepSpec, TimeoutAction};
use flowq::model::run::{FlowRun, Resolution, RunId, RunStatus, StepStatus};
use flowq::scheduler::{Scheduler, SchedulerConfig};
use flowq::store::EventStore;
use flowq::trigger::{TriggerRegistry, WebhookOutcome};
use serde_json::{Value, json};
use tokio::sync::Notify;

struct Harness {
    scheduler: Scheduler,
    engine: FlowEngine,
    triggers: TriggerRegistry,
}

fn harness() -> Harness {
    let store = EventStore::memory();
    let scheduler = Scheduler::new(
        store.clone(),
        SchedulerConfig::new("engine-test")
            .tick(Duration::from_millis(20))
            .lease(Duration::from_secs(2)),
    );
    let engine = FlowEngine::new(store.clone(), scheduler.clone(), EngineConfig::default());
    let triggers = TriggerRegistry::new(store, engine.clone(), scheduler.clone());
    Harness {
        scheduler,
        engine,
        triggers,
    }
}

/// Handler recording every input it sees and returning `{}`.
fn recorder(seen: &Arc<Mutex<Vec<Value>>>) -> Arc<dyn StepHandler> {
    let seen = Arc::clone(seen);
    step_fn(move |_ctx, input| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().unwrap().push(input);
            Ok(json!({}))
        }
    })
}

/// Handler emitting `kind` with its own input.
fn forward(kind: &'static str) -> Arc<dyn StepHandler> {
    step_fn(move |ctx, input| async move {
        ctx.emit(kind, input.clone())?;
        Ok(input)
    })
}

async fn wait_for(engine: &FlowEngine, run_id: &RunId, status: RunStatus) -> FlowRun {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let run = engine.get_run(run_id).await.unwrap().unwrap();
        if run.status == status {
            return run;
        }
        assert!(
            Instant::now() < deadline,
            "run stuck in {} waiting for {status}",
            run.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_step(engine: &FlowEngine, run_id: &RunId, step: &str, status: StepStatus) -> FlowRun {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let run = engine.get_run(run_id).await.unwrap().unwrap();
        if run.step(step).map(|s| s.status) == Some(status) {
            return run;
        }
        assert!(Instant::now() < deadline, "step {step} never reached {status}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn event_kinds(engine: &FlowEngine, run_id: &RunId) -> Vec<String> {
    engine
        .get_run_events(run_id, &ReadOptions::forward(1000))
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.kind)
        .collect()
}

fn order_flow() -> FlowDefinition {
    FlowDefinition::new("order-flow")
        .step(StepSpec::entry("start").emits(["start.completed"]))
        .step(StepSpec::step("ship").subscribes(["start.completed"]))
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn order_flow_routes_entry_output_to_ship() {
    let h = harness();
    let shipped = Arc::new(Mutex::new(Vec::new()));
    h.engine
        .register_flow(
            FlowRegistration::new(order_flow())
                .on("start", forward("start.completed"))
                .on("ship", recorder(&shipped)),
        )
        .unwrap();

    let run = h
        .engine
        .start_flow("order-flow", json!({ "orderId": 1 }))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Running);

    let done = wait_for(&h.engine, &run.run_id, RunStatus::Completed).await;
    let expected = json!({ "start.completed": { "orderId": 1 } });
    assert_eq!(*shipped.lock().unwrap(), vec![expected.clone()]);
    let ship = done.step("ship").unwrap();
    assert_eq!(ship.status, StepStatus::Completed);
    assert_eq!(ship.input, Some(expected));

    let kinds = event_kinds(&h.engine, &run.run_id).await;
    assert_eq!(kinds.first().map(String::as_str), Some("flow.started"));
    assert_eq!(kinds.last().map(String::as_str), Some("flow.completed"));
    assert!(kinds.iter().any(|k| k == "step.emitted"));
}

/// Handler that emits `kind` with `payload` once `gate` opens.
fn gated(gate: &Arc<Notify>, kind: &'static str, payload: Value) -> Arc<dyn StepHandler> {
    let gate = Arc::clone(gate);
    step_fn(move |ctx, _input| {
        let gate = Arc::clone(&gate);
        let payload = payload.clone();
        async move {
            gate.notified().await;
            ctx.emit(kind, payload)?;
            Ok(json!(null))
        }
    })
}

/// Releases the `first` branch of a two-way join, checks the merge still
/// waits, then releases the other.
async fn check_join_order(first: &str) {
    let h = harness();
    let joined = Arc::new(Mutex::new(Vec::new()));
    let gates: std::collections::HashMap<&str, Arc<Notify>> =
        [("left", Arc::new(Notify::new())), ("right", Arc::new(Notify::new()))].into();
    h.engine
        .register_flow(
            FlowRegistration::new(
                FlowDefinition::new("join")
                    .step(StepSpec::entry("start").emits(["start.completed"]))
                    .step(
                        StepSpec::step("left")
                            .subscribes(["start.completed"])
                            .emits(["left.done"]),
                    )
                    .step(
                        StepSpec::step("right")
                            .subscribes(["start.completed"])
                            .emits(["right.done"]),
                    )
                    .step(StepSpec::step("merge").subscribes(["left.done", "right.done"])),
            )
            .on("start", forward("start.completed"))
            .on("left", gated(&gates["left"], "left.done", json!("L")))
            .on("right", gated(&gates["right"], "right.done", json!("R")))
            .on("merge", recorder(&joined)),
        )
        .unwrap();

    let run = h.engine.start_flow("join", json!({})).await.unwrap();
    let second = if first == "left" { "right" } else { "left" };

    gates[first].notify_one();
    let partial = wait_for_step(&h.engine, &run.run_id, first, StepStatus::Completed).await;
    assert_eq!(partial.step(second).unwrap().status, StepStatus::Running);
    let merge = partial.step("merge").unwrap();
    assert_eq!(merge.status, StepStatus::Pending);
    assert_eq!(
        merge.received.keys().cloned().collect::<Vec<_>>(),
        vec![format!("{first}.done")]
    );
    assert!(joined.lock().unwrap().is_empty());

    gates[second].notify_one();
    wait_for(&h.engine, &run.run_id, RunStatus::Completed).await;
    assert_eq!(
        *joined.lock().unwrap(),
        vec![json!({ "left.done": "L", "right.done": "R" })]
    );
}

#[tokio::test]
async fn join_waits_for_left_then_right() {
    check_join_order("left").await;
}

#[tokio::test]
async fn join_waits_for_right_then_left() {
    check_join_order("right").await;
}

#[tokio::test]
async fn join_takes_the_latest_payload_of_a_repeated_kind() {
    let h = harness();
    let joined = Arc::new(Mutex::new(Vec::new()));
    let (early, late, other) = (
        Arc::new(Notify::new()),
        Arc::new(Notify::new()),
        Arc::new(Notify::new()),
    );
    h.engine
        .register_flow(
            FlowRegistration::new(
                FlowDefinition::new("rejoin")
                    .step(StepSpec::entry("start").emits(["start.completed"]))
                    .step(StepSpec::step("early").subscribes(["start.completed"]).emits(["part"]))
                    .step(StepSpec::step("late").subscribes(["start.completed"]).emits(["part"]))
                    .step(StepSpec::step("other").subscribes(["start.completed"]).emits(["extra"]))
                    .step(StepSpec::step("merge").subscribes(["part", "extra"])),
            )
            .on("start", forward("start.completed"))
            .on("early", gated(&early, "part", json!("first")))
            .on("late", gated(&late, "part", json!("second")))
            .on("other", gated(&other, "extra", json!("X")))
            .on("merge", recorder(&joined)),
        )
        .unwrap();

    let run = h.engine.start_flow("rejoin", json!({})).await.unwrap();
    early.notify_one();
    wait_for_step(&h.engine, &run.run_id, "early", StepStatus::Completed).await;
    late.notify_one();
    let partial = wait_for_step(&h.engine, &run.run_id, "late", StepStatus::Completed).await;
    let merge = partial.step("merge").unwrap();
    assert_eq!(merge.status, StepStatus::Pending);
    assert_eq!(merge.received.get("part"), Some(&json!("second")));

    other.notify_one();
    let done = wait_for(&h.engine, &run.run_id, RunStatus::Completed).await;
    assert_eq!(
        *joined.lock().unwrap(),
        vec![json!({ "part": "second", "extra": "X" })]
    );
    assert_eq!(done.step("merge").unwrap().invocations, 1);
}

#[tokio::test]
async fn unsatisfied_steps_stay_pending_when_run_completes() {
    let h = harness();
    h.engine
        .register_flow(
            FlowRegistration::new(
                FlowDefinition::new("partial")
                    .step(StepSpec::entry("start").emits(["a", "b"]))
                    .step(StepSpec::step("needs-both").subscribes(["a", "b"])),
            )
            // Emits only `a`.
            .on("start", forward("a"))
            .on("needs-both", recorder(&Arc::new(Mutex::new(Vec::new())))),
        )
        .unwrap();

    let run = h.engine.start_flow("partial", json!({})).await.unwrap();
    let done = wait_for(&h.engine, &run.run_id, RunStatus::Completed).await;
    let waiting = done.step("needs-both").unwrap();
    assert_eq!(waiting.status, StepStatus::Pending);
    assert!(waiting.received.contains_key("a"));
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_flow_is_not_found() {
    let h = harness();
    let err = h.engine.start_flow("nope", json!({})).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn registration_requires_handlers_and_acyclic_graph() {
    let h = harness();
    let missing = FlowRegistration::new(order_flow()).on("start", forward("start.completed"));
    assert!(matches!(
        h.engine.register_flow(missing),
        Err(Error::Validation(_))
    ));

    let cyclic = FlowRegistration::new(
        FlowDefinition::new("loop")
            .step(StepSpec::entry("start").emits(["a"]))
            .step(StepSpec::step("x").subscribes(["a", "c"]).emits(["b"]))
            .step(StepSpec::step("y").subscribes(["b"]).emits(["c"])),
    )
    .on("start", forward("a"))
    .on("x", forward("b"))
    .on("y", forward("c"));
    let err = h.engine.register_flow(cyclic).unwrap_err();
    assert!(err.to_string().contains("cycle"), "{err}");
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

fn flaky(failures: u32, calls: &Arc<AtomicU32>) -> Arc<dyn StepHandler> {
    let calls = Arc::clone(calls);
    step_fn(move |_ctx, _input| {
        let calls = Arc::clone(&calls);
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                Err(Error::Other(format!("transient failure {n}")))
            } else {
                Ok(json!({ "calls": n }))
            }
        }
    })
}

#[tokio::test]
async fn retries_until_success() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    h.engine
        .register_flow(
            FlowRegistration::new(
                FlowDefinition::new("retry")
                    .step(StepSpec::entry("call").retry(RetryPolicy::attempts(3))),
            )
            .on("call", flaky(2, &calls)),
        )
        .unwrap();

    let run = h.engine.start_flow("retry", json!({})).await.unwrap();
    let done = wait_for(&h.engine, &run.run_id, RunStatus::Completed).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let step = done.step("call").unwrap();
    assert_eq!(step.attempts, 3);
    assert_eq!(step.output, Some(json!({ "calls": 3 })));
}

#[tokio::test]
async fn exhausted_retries_fail_the_run() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    h.engine
        .register_flow(
            FlowRegistration::new(
                FlowDefinition::new("doomed")
                    .step(StepSpec::entry("call").retry(RetryPolicy::attempts(2))),
            )
            .on("call", flaky(u32::MAX, &calls)),
        )
        .unwrap();

    let run = h.engine.start_flow("doomed", json!({})).await.unwrap();
    let failed = wait_for(&h.engine, &run.run_id, RunStatus::Failed).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let step = failed.step("call").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.error.as_deref().unwrap().contains("call"));
    assert!(!h.engine.is_running("doomed").await.unwrap());
    assert!(event_kinds(&h.engine, &run.run_id)
        .await
        .contains(&"flow.failed".to_string()));
}

#[tokio::test]
async fn continue_on_failure_completes_the_run() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let after = Arc::new(Mutex::new(Vec::new()));
    h.engine
        .register_flow(
            FlowRegistration::new(
                FlowDefinition::new("tolerant")
                    .continue_on_failure(true)
                    .step(StepSpec::entry("bad"))
                    .step(StepSpec::entry("good")),
            )
            .on("bad", flaky(u32::MAX, &calls))
            .on("good", recorder(&after)),
        )
        .unwrap();

    let run = h.engine.start_flow("tolerant", json!({ "x": 1 })).await.unwrap();
    let done = wait_for(&h.engine, &run.run_id, RunStatus::Completed).await;
    assert_eq!(done.step("bad").unwrap().status, StepStatus::Failed);
    assert_eq!(done.step("good").unwrap().status, StepStatus::Completed);
}

#[tokio::test]
async fn step_timeout_counts_as_failed_attempt() {
    let h = harness();
    let slow = step_fn(|_ctx, _input| async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(json!(null))
    });
    h.engine
        .register_flow(
            FlowRegistration::new(
                FlowDefinition::new("slow")
                    .step(StepSpec::entry("crawl").timeout(Duration::from_millis(20))),
            )
            .on("crawl", slow),
        )
        .unwrap();

    let run = h.engine.start_flow("slow", json!({})).await.unwrap();
    let failed = wait_for(&h.engine, &run.run_id, RunStatus::Failed).await;
    assert!(failed.step("crawl").unwrap().error.as_deref().unwrap().contains("timed out"));
}

// ---------------------------------------------------------------------------
// Awaits
// ---------------------------------------------------------------------------

fn approval_flow(await_spec: AwaitSpec) -> FlowDefinition {
    FlowDefinition::new("approval")
        .step(StepSpec::entry("request").emits(["request.sent"]))
        .step(
            StepSpec::step("approve")
                .subscribes(["request.sent"])
                .await_before(await_spec),
        )
}

/// Handler counting calls and keeping the last resolution payload.
fn approver(calls: &Arc<AtomicU32>, resolution: &Arc<Mutex<Option<Value>>>) -> Arc<dyn StepHandler> {
    let calls = Arc::clone(calls);
    let resolution = Arc::clone(resolution);
    step_fn(move |ctx, _input| {
        let calls = Arc::clone(&calls);
        let resolution = Arc::clone(&resolution);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            *resolution.lock().unwrap() = ctx.resolution().cloned();
            Ok(json!({ "approved": true }))
        }
    })
}

#[tokio::test]
async fn webhook_await_resolves_exactly_once() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let resolution = Arc::new(Mutex::new(None));
    h.engine
        .register_flow(
            FlowRegistration::new(approval_flow(AwaitSpec::webhook(
                "POST",
                "/approve/{runId}/{stepName}",
            )))
            .on("request", forward("request.sent"))
            .on("approve", approver(&calls, &resolution)),
        )
        .unwrap();

    let run = h.engine.start_flow("approval", json!({})).await.unwrap();
    wait_for_step(&h.engine, &run.run_id, "approve", StepStatus::Awaiting).await;
    h.engine.wait_idle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let pending = h.engine.pending_awaits(&run.run_id).await.unwrap();
    assert_eq!(pending.len(), 1);
    let path = format!("/approve/{}/approve", run.run_id);
    assert_eq!(pending[0].webhook_path.as_deref(), Some(path.as_str()));

    let wrong_method = h
        .triggers
        .handle_webhook("GET", &path, json!({}))
        .await
        .unwrap();
    assert!(matches!(wrong_method, WebhookOutcome::MethodNotAllowed { .. }));

    let first = h
        .triggers
        .handle_webhook("POST", &path, json!({ "by": "ops" }))
        .await
        .unwrap();
    assert_eq!(
        first,
        WebhookOutcome::Resumed {
            run_id: run.run_id.clone(),
            step: "approve".to_string()
        }
    );
    let second = h
        .triggers
        .handle_webhook("POST", &path, json!({ "by": "ops" }))
        .await
        .unwrap();
    assert_eq!(second, WebhookOutcome::NotFound);

    wait_for(&h.engine, &run.run_id, RunStatus::Completed).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*resolution.lock().unwrap(), Some(json!({ "by": "ops" })));
}

#[tokio::test]
async fn concurrent_resolutions_have_one_winner() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let resolution = Arc::new(Mutex::new(None));
    h.engine
        .register_flow(
            FlowRegistration::new(approval_flow(AwaitSpec::webhook("POST", "/ok/{runId}")))
                .on("request", forward("request.sent"))
                .on("approve", approver(&calls, &resolution)),
        )
        .unwrap();
    let run = h.engine.start_flow("approval", json!({})).await.unwrap();
    wait_for_step(&h.engine, &run.run_id, "approve", StepStatus::Awaiting).await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let engine = h.engine.clone();
        let run_id = run.run_id.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .resolve_await(&run_id, "approve", json!({ "i": i }))
                .await
                .unwrap()
        }));
    }
    let mut resumed = 0;
    for t in tasks {
        if t.await.unwrap().is_resumed() {
            resumed += 1;
        }
    }
    assert_eq!(resumed, 1);
    wait_for(&h.engine, &run.run_id, RunStatus::Completed).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn await_after_holds_emits_until_resolved() {
    let h = harness();
    let downstream = Arc::new(Mutex::new(Vec::new()));
    h.engine
        .register_flow(
            FlowRegistration::new(
                FlowDefinition::new("review")
                    .step(
                        StepSpec::entry("draft")
                            .emits(["draft.ready"])
                            .await_after(AwaitSpec::webhook("POST", "/review/{runId}")),
                    )
                    .step(StepSpec::step("publish").subscribes(["draft.ready"])),
            )
            .on("draft", forward("draft.ready"))
            .on("publish", recorder(&downstream)),
        )
        .unwrap();

    let run = h.engine.start_flow("review", json!({ "doc": 7 })).await.unwrap();
    let held = wait_for_step(&h.engine, &run.run_id, "draft", StepStatus::Awaiting).await;
    h.engine.wait_idle().await;
    assert!(downstream.lock().unwrap().is_empty());
    assert_eq!(held.step("draft").unwrap().output, Some(json!({ "doc": 7 })));
    assert_eq!(held.status, RunStatus::Running);

    let resolved = h
        .engine
        .resolve_await(&run.run_id, "draft", json!({ "ok": true }))
        .await
        .unwrap();
    assert!(resolved.is_resumed());

    wait_for(&h.engine, &run.run_id, RunStatus::Completed).await;
    assert_eq!(
        *downstream.lock().unwrap(),
        vec![json!({ "draft.ready": { "doc": 7 } })]
    );
}

#[tokio::test]
async fn time_await_fires_through_the_scheduler() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let resolution = Arc::new(Mutex::new(None));
    h.engine
        .register_flow(
            FlowRegistration::new(approval_flow(AwaitSpec::time(Duration::from_millis(50))))
                .on("request", forward("request.sent"))
                .on("approve", approver(&calls, &resolution)),
        )
        .unwrap();
    h.scheduler.start();

    let run = h.engine.start_flow("approval", json!({})).await.unwrap();
    wait_for(&h.engine, &run.run_id, RunStatus::Completed).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(resolution.lock().unwrap().as_ref().unwrap().get("firedAt").is_some());

    // The one-time resolver job is gone once it fired.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.scheduler.get_jobs_by_pattern("await:*").await.unwrap().is_empty());
    h.scheduler.stop().await;
}

#[tokio::test]
async fn await_timeout_can_continue_with_default() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let resolution = Arc::new(Mutex::new(None));
    h.engine
        .register_flow(
            FlowRegistration::new(approval_flow(
                AwaitSpec::webhook("POST", "/late/{runId}").timeout(
                    Duration::from_millis(80),
                    TimeoutAction::ContinueWithDefault(json!({ "approved": false })),
                ),
            ))
            .on("request", forward("request.sent"))
            .on("approve", approver(&calls, &resolution)),
        )
        .unwrap();
    h.scheduler.start();

    let run = h.engine.start_flow("approval", json!({})).await.unwrap();
    wait_for(&h.engine, &run.run_id, RunStatus::Completed).await;
    assert_eq!(*resolution.lock().unwrap(), Some(json!({ "approved": false })));
    assert!(event_kinds(&h.engine, &run.run_id)
        .await
        .contains(&"await.timeout".to_string()));

    // The timeout consumed the registration.
    let late = h
        .triggers
        .handle_webhook("POST", &format!("/late/{}", run.run_id), json!({}))
        .await
        .unwrap();
    assert_eq!(late, WebhookOutcome::NotFound);
    h.scheduler.stop().await;
}

#[tokio::test]
async fn await_timeout_can_fail_the_run() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let resolution = Arc::new(Mutex::new(None));
    h.engine
        .register_flow(
            FlowRegistration::new(approval_flow(
                AwaitSpec::webhook("POST", "/strict/{runId}")
                    .timeout(Duration::from_millis(80), TimeoutAction::Fail),
            ))
            .on("request", forward("request.sent"))
            .on("approve", approver(&calls, &resolution)),
        )
        .unwrap();
    h.scheduler.start();

    let run = h.engine.start_flow("approval", json!({})).await.unwrap();
    let failed = wait_for(&h.engine, &run.run_id, RunStatus::Failed).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(failed.step("approve").unwrap().status, StepStatus::Failed);
    h.scheduler.stop().await;
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_is_idempotent_and_drops_awaits() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let resolution = Arc::new(Mutex::new(None));
    h.engine
        .register_flow(
            FlowRegistration::new(approval_flow(
                AwaitSpec::webhook("POST", "/c/{runId}")
                    .timeout(Duration::from_secs(60), TimeoutAction::Fail),
            ))
            .on("request", forward("request.sent"))
            .on("approve", approver(&calls, &resolution)),
        )
        .unwrap();

    let run = h.engine.start_flow("approval", json!({})).await.unwrap();
    wait_for_step(&h.engine, &run.run_id, "approve", StepStatus::Awaiting).await;
    assert_eq!(h.scheduler.get_jobs_by_pattern("await:*").await.unwrap().len(), 1);

    let cancelled = h.engine.cancel_flow("approval", &run.run_id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert!(h.engine.pending_awaits(&run.run_id).await.unwrap().is_empty());
    assert!(h.scheduler.get_jobs_by_pattern("await:*").await.unwrap().is_empty());

    let again = h.engine.cancel_flow("approval", &run.run_id).await.unwrap();
    assert_eq!(again.status, RunStatus::Cancelled);
    assert_eq!(
        h.engine
            .resolve_await(&run.run_id, "approve", json!({}))
            .await
            .unwrap(),
        Resolution::NotFound
    );
    let webhook = h
        .triggers
        .handle_webhook("POST", &format!("/c/{}", run.run_id), json!({}))
        .await
        .unwrap();
    assert_eq!(webhook, WebhookOutcome::NotFound);

    let after = h.engine.get_run(&run.run_id).await.unwrap().unwrap();
    assert_eq!(after.status, RunStatus::Cancelled);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let kinds = event_kinds(&h.engine, &run.run_id).await;
    assert_eq!(kinds.iter().filter(|k| *k == "flow.cancelled").count(), 1);
}

#[tokio::test]
async fn emits_of_in_flight_step_are_ignored_after_cancel() {
    let h = harness();
    let gate = Arc::new(Notify::new());
    let downstream = Arc::new(Mutex::new(Vec::new()));
    let held = Arc::clone(&gate);
    let blocked = step_fn(move |ctx, input| {
        let held = Arc::clone(&held);
        async move {
            held.notified().await;
            ctx.emit("start.completed", input)?;
            Ok(json!(null))
        }
    });
    h.engine
        .register_flow(
            FlowRegistration::new(order_flow())
                .on("start", blocked)
                .on("ship", recorder(&downstream)),
        )
        .unwrap();

    let run = h.engine.start_flow("order-flow", json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    h.engine.cancel_flow("order-flow", &run.run_id).await.unwrap();
    gate.notify_one();
    h.engine.wait_idle().await;

    let after = h.engine.get_run(&run.run_id).await.unwrap().unwrap();
    assert_eq!(after.status, RunStatus::Cancelled);
    assert!(downstream.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cancel_of_unknown_run_is_not_found() {
    let h = harness();
    let err = h
        .engine
        .cancel_flow("order-flow", &RunId::from("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

// ---------------------------------------------------------------------------
// Queries and history
// ---------------------------------------------------------------------------

fn register_waiting_flow(engine: &FlowEngine, name: &str) {
    engine
        .register_flow(
            FlowRegistration::new(
                FlowDefinition::new(name).step(
                    StepSpec::entry("wait").await_before(AwaitSpec::webhook("POST", "/w/{runId}")),
                ),
            )
            .on("wait", recorder(&Arc::new(Mutex::new(Vec::new())))),
        )
        .unwrap();
}

#[tokio::test]
async fn running_flows_support_single_flight() {
    let h = harness();
    register_waiting_flow(&h.engine, "sync");

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(h.engine.start_flow("sync", json!({})).await.unwrap().run_id);
    }
    assert!(h.engine.is_running("sync").await.unwrap());
    let others = h
        .engine
        .get_running_flows("sync", &ids[2..])
        .await
        .unwrap();
    let mut other_ids: Vec<_> = others.iter().map(|r| r.run_id.clone()).collect();
    other_ids.sort();
    let mut expected = ids[..2].to_vec();
    expected.sort();
    assert_eq!(other_ids, expected);

    for run in others {
        h.engine.cancel_flow("sync", &run.run_id).await.unwrap();
    }
    let left = h.engine.get_running_flows("sync", &[]).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].run_id, ids[2]);
}

#[tokio::test]
async fn flow_runs_are_paged_with_a_total() {
    let h = harness();
    register_waiting_flow(&h.engine, "paged");
    for _ in 0..5 {
        h.engine.start_flow("paged", json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let page = h
        .engine
        .get_flow_runs("paged", &IndexRange::page(0, 2).newest_first())
        .await
        .unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.runs.len(), 2);
    assert!(page.runs[0].started_at >= page.runs[1].started_at);
}

#[tokio::test]
async fn clearing_history_only_touches_one_flow() {
    let h = harness();
    register_waiting_flow(&h.engine, "f");
    register_waiting_flow(&h.engine, "g");
    let f_run = h.engine.start_flow("f", json!({})).await.unwrap();
    h.engine.start_flow("f", json!({})).await.unwrap();
    h.engine.start_flow("g", json!({})).await.unwrap();
    h.engine.start_flow("g", json!({})).await.unwrap();

    assert_eq!(h.engine.clear_history("f").await.unwrap(), 2);

    let f_runs = h.engine.get_flow_runs("f", &IndexRange::all()).await.unwrap();
    assert_eq!(f_runs.total, 0);
    assert!(f_runs.runs.is_empty());
    assert!(!h.engine.is_running("f").await.unwrap());
    assert!(h
        .engine
        .get_run_events(&f_run.run_id, &ReadOptions::forward(10))
        .await
        .unwrap()
        .is_empty());
    assert!(h.engine.get_run(&f_run.run_id).await.unwrap().is_none());

    let g_runs = h.engine.get_flow_runs("g", &IndexRange::all()).await.unwrap();
    assert_eq!(g_runs.total, 2);
    assert!(h.engine.is_running("g").await.unwrap());
}

#[tokio::test]
async fn watch_streams_run_events() {
    let h = harness();
    register_waiting_flow(&h.engine, "watched");
    let run = h.engine.start_flow("watched", json!({})).await.unwrap();
    let mut feed = h.engine.watch(&run.run_id).await.unwrap();

    h.engine
        .resolve_await(&run.run_id, "wait", json!({}))
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while !kinds.iter().any(|k| k == "flow.completed") {
        let record = tokio::time::timeout(Duration::from_secs(5), feed.recv())
            .await
            .unwrap()
            .unwrap();
        kinds.push(record.kind);
    }
    assert_eq!(kinds.first().map(String::as_str), Some("await.resolved"));
}

#[tokio::test]
async fn paused_queue_holds_invocations() {
    let h = harness();
    let shipped = Arc::new(Mutex::new(Vec::new()));
    h.engine
        .register_flow(
            FlowRegistration::new(order_flow())
                .on("start", forward("start.completed"))
                .on("ship", recorder(&shipped)),
        )
        .unwrap();

    h.engine.pause_queue();
    let run = h.engine.start_flow("order-flow", json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let stats = h.engine.queue_stats();
    assert!(stats.paused);
    assert_eq!(stats.waiting, 1);
    assert_eq!(
        h.engine.get_run(&run.run_id).await.unwrap().unwrap().status,
        RunStatus::Running
    );

    h.engine.resume_queue();
    wait_for(&h.engine, &run.run_id, RunStatus::Completed).await;
    h.engine.wait_idle().await;
    assert_eq!(h.engine.queue_stats().completed, 2);
}

// ---------------------------------------------------------------------------
// Crash recovery
// ---------------------------------------------------------------------------

fn node(store: &EventStore, id: &str) -> FlowEngine {
    let scheduler = Scheduler::new(
        store.clone(),
        SchedulerConfig::new(id)
            .tick(Duration::from_millis(20))
            .lease(Duration::from_secs(2)),
    );
    FlowEngine::new(
        store.clone(),
        scheduler,
        EngineConfig {
            invocation_lease: Duration::from_millis(300),
            ..EngineConfig::default()
        },
    )
}

/// Handler that signals entry and then never finishes.
fn hang(entered: &Arc<Notify>) -> Arc<dyn StepHandler> {
    let entered = Arc::clone(entered);
    step_fn(move |_ctx, _input| {
        let entered = Arc::clone(&entered);
        async move {
            entered.notify_one();
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!(null))
        }
    })
}

#[tokio::test]
async fn crashed_instance_loses_its_step_invocation() {
    let store = EventStore::memory();
    let crashed = node(&store, "crashed");
    let survivor = node(&store, "survivor");
    let entered = Arc::new(Notify::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let definition = || {
        FlowDefinition::new("ingest")
            .step(StepSpec::entry("load").emits(["load.done"]))
            .step(StepSpec::step("index").subscribes(["load.done"]))
    };
    crashed
        .register_flow(
            FlowRegistration::new(definition())
                .on("load", hang(&entered))
                .on("index", recorder(&Arc::new(Mutex::new(Vec::new())))),
        )
        .unwrap();
    survivor
        .register_flow(
            FlowRegistration::new(definition())
                .on("load", forward("load.done"))
                .on("index", recorder(&seen)),
        )
        .unwrap();

    let run = crashed
        .start_flow("ingest", json!({ "file": "a.csv" }))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), entered.notified())
        .await
        .unwrap();
    crashed.abort();

    let lease = store
        .kv("flow-invocations")
        .get(&format!("{}/load", run.run_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lease["owner"], "crashed");
    // Still leased: nothing to take over yet.
    assert_eq!(survivor.recover_invocations().await.unwrap(), 0);

    survivor.scheduler().start();
    let done = wait_for(&survivor, &run.run_id, RunStatus::Completed).await;
    survivor.scheduler().stop().await;

    assert_eq!(*seen.lock().unwrap(), vec![json!({ "load.done": { "file": "a.csv" } })]);
    assert_eq!(done.step("load").unwrap().status, StepStatus::Completed);
    let kinds = event_kinds(&survivor, &run.run_id).await;
    assert_eq!(kinds.iter().filter(|k| *k == "step.recovered").count(), 1);
    assert!(
        store
            .kv("flow-invocations")
            .get(&format!("{}/load", run.run_id))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn recovered_step_keeps_its_await_resolution() {
    let store = EventStore::memory();
    let crashed = node(&store, "crashed");
    let survivor = node(&store, "survivor");
    let entered = Arc::new(Notify::new());
    let calls = Arc::new(AtomicU32::new(0));
    let resolution = Arc::new(Mutex::new(None));
    let spec = || AwaitSpec::webhook("POST", "/approve/{runId}");
    crashed
        .register_flow(
            FlowRegistration::new(approval_flow(spec()))
                .on("request", forward("request.sent"))
                .on("approve", hang(&entered)),
        )
        .unwrap();
    survivor
        .register_flow(
            FlowRegistration::new(approval_flow(spec()))
                .on("request", forward("request.sent"))
                .on("approve", approver(&calls, &resolution)),
        )
        .unwrap();

    let run = crashed.start_flow("approval", json!({})).await.unwrap();
    wait_for_step(&crashed, &run.run_id, "approve", StepStatus::Awaiting).await;
    let resumed = crashed
        .resolve_await(&run.run_id, "approve", json!({ "by": "ops" }))
        .await
        .unwrap();
    assert!(resumed.is_resumed());
    tokio::time::timeout(Duration::from_secs(2), entered.notified())
        .await
        .unwrap();
    crashed.abort();

    survivor.scheduler().start();
    wait_for(&survivor, &run.run_id, RunStatus::Completed).await;
    survivor.scheduler().stop().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*resolution.lock().unwrap(), Some(json!({ "by": "ops" })));
}

#[tokio::test]
async fn settled_invocations_release_their_lease() {
    let h = harness();
    h.engine
        .register_flow(
            FlowRegistration::new(order_flow())
                .on("start", forward("start.completed"))
                .on("ship", recorder(&Arc::new(Mutex::new(Vec::new())))),
        )
        .unwrap();
    let run = h.engine.start_flow("order-flow", json!({})).await.unwrap();
    wait_for(&h.engine, &run.run_id, RunStatus::Completed).await;
    h.engine.wait_idle().await;

    let leases = h.engine.store().kv("flow-invocations");
    for step in ["start", "ship"] {
        assert!(leases.get(&format!("{}/{step}", run.run_id)).await.unwrap().is_none());
    }
    assert_eq!(h.engine.recover_invocations().await.unwrap(), 0);
}
