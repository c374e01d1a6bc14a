//! The flow execution engine.
//!
//! A run's snapshot lives at `flow-runs/<runId>` and its history on the
//! `run:<runId>` stream. Every mutation of a run happens under the run lock
//! (an in-process mutex plus a store lease at `run-locks/<runId>`), so
//! concurrent emits, resolutions and cancellations for one run serialize
//! while different runs proceed in parallel. Handlers themselves run outside
//! the lock on the dispatch queue.
//!
//! Every dispatched invocation holds a lease at
//! `flow-invocations/<runId>/<step>`, renewed until the invocation settles.
//! A scheduler tick task on each instance looks for `Running` steps whose
//! lease lapsed, claims the lease set-if-absent or by compare-and-set, and
//! invokes the step again. Invocation is therefore at least once.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use super::dispatch::{DispatchQueue, QueueStats};
use super::graph::FlowGraph;
use super::{FlowRegistration, StepContext, StepHandler};
use crate::error::{Error, Result};
use crate::model::event::{EventRecord, IndexRange, NewEvent, ReadOptions};
use crate::model::flow::{AwaitKind, AwaitSpec, FlowDefinition, StepSpec, TimeoutAction};
use crate::model::job::{JobId, NewJob, ScheduledJob};
use crate::model::run::{
    AwaitPhase, AwaitRegistration, FlowRun, InvocationLease, Resolution, RunId, RunPage,
    RunStatus, StepStatus,
};
use crate::scheduler::{JobHandler, Scheduler, TickTask, schedule};
use crate::store::{EventStore, KvScope, Subscription};
use crate::telemetry::{metrics, step as step_telemetry};

const RUNS: &str = "flow-runs";
const AWAITS: &str = "flow-awaits";
const ROUTES: &str = "webhook-routes";
const RUN_LOCKS: &str = "run-locks";
const INVOCATIONS: &str = "flow-invocations";

/// Scheduler handler resolving time and schedule awaits.
pub const AWAIT_RESOLVE_HANDLER: &str = "flowq.await.resolve";
/// Scheduler handler expiring awaits past their deadline.
pub const AWAIT_TIMEOUT_HANDLER: &str = "flowq.await.timeout";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum step invocations in flight on this instance.
    pub worker_concurrency: usize,
    /// Lease on a run's store lock; bounds how long a crashed holder blocks it.
    pub run_lock_lease: Duration,
    /// Lease on a dispatched invocation. Once it lapses unrenewed, another
    /// instance invokes the step again.
    pub invocation_lease: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 16,
            run_lock_lease: Duration::from_secs(30),
            invocation_lease: Duration::from_secs(30),
        }
    }
}

/// Where a webhook await path leads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRoute {
    pub run_id: RunId,
    pub step: String,
    pub method: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AwaitTarget {
    run_id: RunId,
    step: String,
}

struct RegisteredFlow {
    definition: FlowDefinition,
    graph: FlowGraph,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl RegisteredFlow {
    fn step(&self, name: &str) -> Result<&StepSpec> {
        self.definition.get_step(name).ok_or_else(|| {
            Error::NotFound(format!("step '{name}' in flow '{}'", self.definition.name))
        })
    }
}

struct EngineInner {
    store: EventStore,
    scheduler: Scheduler,
    flows: RwLock<HashMap<String, Arc<RegisteredFlow>>>,
    run_locks: Mutex<HashMap<RunId, Arc<tokio::sync::Mutex<()>>>>,
    queue: DispatchQueue,
    /// Invocation keys leased by this instance.
    invoking: Arc<Mutex<HashSet<String>>>,
    config: EngineConfig,
}

/// The engine service. Cheap to clone; clones share flows, locks and queue.
#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

/// Scheduler-side entry point for await jobs. Holds the engine weakly so the
/// scheduler does not keep a dropped engine alive.
struct AwaitJob {
    engine: Weak<EngineInner>,
    expire: bool,
}

/// Per-tick takeover of lapsed invocations, at most once per renewal period
/// and never two sweeps at a time.
struct InvocationSweep {
    engine: Weak<EngineInner>,
    last: Mutex<Option<Instant>>,
    sweeping: Arc<AtomicBool>,
}

#[async_trait]
impl TickTask for InvocationSweep {
    async fn tick(&self) -> Result<()> {
        let Some(inner) = self.engine.upgrade() else {
            return Ok(());
        };
        {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            let every = inner.config.invocation_lease / 3;
            if last.is_some_and(|at| at.elapsed() < every) || self.sweeping.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            *last = Some(Instant::now());
        }
        // Taking run locks can wait; keep the scheduler loop moving.
        let engine = FlowEngine { inner };
        let sweeping = Arc::clone(&self.sweeping);
        tokio::spawn(async move {
            match engine.recover_invocations().await {
                Ok(0) => {}
                Ok(taken) => info!(taken, "lapsed step invocations taken over"),
                Err(e) => warn!(error = %e, "invocation sweep failed"),
            }
            sweeping.store(false, Ordering::SeqCst);
        });
        Ok(())
    }
}

#[async_trait]
impl JobHandler for AwaitJob {
    async fn run(&self, job: ScheduledJob) -> Result<()> {
        let Some(inner) = self.engine.upgrade() else {
            return Ok(());
        };
        let engine = FlowEngine { inner };
        let target: AwaitTarget = serde_json::from_value(job.payload)?;
        if self.expire {
            engine.expire_await(&target.run_id, &target.step).await
        } else {
            engine
                .resolve_await(&target.run_id, &target.step, json!({ "firedAt": Utc::now() }))
                .await
                .map(|_| ())
        }
    }
}

impl FlowEngine {
    pub fn new(store: EventStore, scheduler: Scheduler, config: EngineConfig) -> Self {
        let inner = Arc::new(EngineInner {
            store,
            queue: DispatchQueue::new(config.worker_concurrency),
            scheduler,
            flows: RwLock::new(HashMap::new()),
            run_locks: Mutex::new(HashMap::new()),
            invoking: Arc::new(Mutex::new(HashSet::new())),
            config,
        });
        for (name, expire) in [(AWAIT_RESOLVE_HANDLER, false), (AWAIT_TIMEOUT_HANDLER, true)] {
            inner.scheduler.register_handler(
                name,
                Arc::new(AwaitJob {
                    engine: Arc::downgrade(&inner),
                    expire,
                }),
            );
        }
        inner.scheduler.register_tick_task(Arc::new(InvocationSweep {
            engine: Arc::downgrade(&inner),
            last: Mutex::new(None),
            sweeping: Arc::new(AtomicBool::new(false)),
        }));
        Self { inner }
    }

    pub fn store(&self) -> &EventStore {
        &self.inner.store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    fn runs(&self) -> KvScope {
        self.inner.store.kv(RUNS)
    }

    fn awaits(&self) -> KvScope {
        self.inner.store.kv(AWAITS)
    }

    fn routes(&self) -> KvScope {
        self.inner.store.kv(ROUTES)
    }

    fn invocations(&self) -> KvScope {
        self.inner.store.kv(INVOCATIONS)
    }

    // -----------------------------------------------------------------------
    // Flow registry
    // -----------------------------------------------------------------------

    /// Validate a flow and bind its handlers. Re-registering a name replaces it.
    pub fn register_flow(&self, registration: FlowRegistration) -> Result<()> {
        let FlowRegistration {
            definition,
            handlers,
        } = registration;
        let graph = FlowGraph::analyze(&definition)?;
        for step in &definition.steps {
            if !handlers.contains_key(&step.name) {
                return Err(Error::Validation(format!(
                    "step '{}' of flow '{}' has no handler",
                    step.name, definition.name
                )));
            }
        }
        if let Some(stray) = handlers.keys().find(|h| definition.get_step(h).is_none()) {
            return Err(Error::Validation(format!(
                "handler bound to unknown step '{stray}' of flow '{}'",
                definition.name
            )));
        }

        let name = definition.name.clone();
        let replaced = self
            .inner
            .flows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                name.clone(),
                Arc::new(RegisteredFlow {
                    definition,
                    graph,
                    handlers,
                }),
            )
            .is_some();
        info!(flow = %name, replaced, "flow registered");
        Ok(())
    }

    fn flow(&self, name: &str) -> Result<Arc<RegisteredFlow>> {
        self.inner
            .flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("flow '{name}'")))
    }

    /// Registered definitions, sorted by name.
    pub fn flows(&self) -> Vec<FlowDefinition> {
        let mut flows: Vec<_> = self
            .inner
            .flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|f| f.definition.clone())
            .collect();
        flows.sort_by(|a, b| a.name.cmp(&b.name));
        flows
    }

    pub fn flow_graph(&self, name: &str) -> Result<FlowGraph> {
        Ok(self.flow(name)?.graph.clone())
    }

    // -----------------------------------------------------------------------
    // Run lifecycle
    // -----------------------------------------------------------------------

    /// Create a run, activate its entry steps with `payload`, and return the
    /// snapshot as of activation.
    pub async fn start_flow(&self, flow_name: &str, payload: Value) -> Result<FlowRun> {
        let flow = self.flow(flow_name)?;
        let run_id = self.create_run(&flow, payload.clone()).await?;
        self.activate_entries(&flow, &run_id, payload).await
    }

    /// Persist and index a new running run.
    async fn create_run(&self, flow: &Arc<RegisteredFlow>, payload: Value) -> Result<RunId> {
        let flow_name = flow.definition.name.as_str();
        let mut run = FlowRun::new(
            flow_name,
            payload.clone(),
            flow.definition.steps.iter().map(|s| s.name.as_str()),
        );
        run.transition(RunStatus::Running)?;
        let run_id = run.run_id.clone();
        let score = run.started_at.timestamp_millis() as f64;

        self.save_run(&mut run).await?;
        self.inner
            .store
            .index_write(&runs_index(flow_name), run_id.as_str(), score)
            .await?;
        self.inner
            .store
            .index_write(&running_index(flow_name), run_id.as_str(), score)
            .await?;
        self.record(&run_id, "flow.started", json!({ "flow": flow_name, "payload": payload }))
            .await?;
        metrics::runs_started().add(1, &[KeyValue::new("flow", flow_name.to_string())]);
        step_telemetry::record_run_transition(flow_name, run_id.as_str(), "pending", "running");
        Ok(run_id)
    }

    /// Hand `payload` to the entry steps, unless the run already finished.
    async fn activate_entries(
        &self,
        flow: &Arc<RegisteredFlow>,
        run_id: &RunId,
        payload: Value,
    ) -> Result<FlowRun> {
        self.locked(run_id, async {
            let mut run = self.load_run(run_id).await?;
            if run.status.is_terminal() {
                debug!(run_id = %run_id, status = %run.status, "run finished before activation");
                return Ok(run);
            }
            for entry in flow.definition.entry_steps() {
                self.activate(flow, &mut run, entry, payload.clone()).await?;
            }
            self.advance(&mut run).await?;
            Ok(run)
        })
        .await
    }

    /// Cancel a live run. Cancelling a terminal run returns it unchanged.
    pub async fn cancel_flow(&self, flow_name: &str, run_id: &RunId) -> Result<FlowRun> {
        self.locked(run_id, async {
            let mut run = self.load_run(run_id).await?;
            if run.flow_name != flow_name {
                return Err(Error::NotFound(format!("run {run_id} of flow '{flow_name}'")));
            }
            if run.status.is_terminal() {
                debug!(run_id = %run_id, status = %run.status, "cancel of finished run ignored");
                return Ok(run);
            }
            let from = run.status;
            run.transition(RunStatus::Cancelled)?;
            self.drop_awaits(&run).await?;
            self.finish(&mut run, from, "flow.cancelled", json!({ "flow": flow_name }))
                .await?;
            Ok(run)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Awaits
    // -----------------------------------------------------------------------

    /// Consume the await registration of `(run_id, step)` and resume the step.
    ///
    /// Of any number of concurrent calls, timers and timeouts racing on one
    /// registration, exactly one sees `Resumed`; the rest get `NotFound`.
    pub async fn resolve_await(&self, run_id: &RunId, step: &str, payload: Value) -> Result<Resolution> {
        let Some(registration) = self
            .awaits()
            .take_as::<AwaitRegistration>(&await_key(run_id, step))
            .await?
        else {
            metrics::await_resolutions().add(
                1,
                &[KeyValue::new("type", "unknown"), KeyValue::new("outcome", "not_found")],
            );
            debug!(run_id = %run_id, step, "no live await to resolve");
            return Ok(Resolution::NotFound);
        };
        self.release_await(&registration, true).await;
        metrics::await_resolutions().add(
            1,
            &[
                KeyValue::new("type", registration.kind.type_name()),
                KeyValue::new("outcome", "resumed"),
            ],
        );

        self.locked(run_id, self.resume(&registration, payload, "await.resolved"))
            .await?;
        Ok(Resolution::Resumed {
            run_id: run_id.clone(),
            step: step.to_string(),
        })
    }

    /// Deadline handler: act on the timeout unless something resolved first.
    async fn expire_await(&self, run_id: &RunId, step: &str) -> Result<()> {
        let Some(registration) = self
            .awaits()
            .take_as::<AwaitRegistration>(&await_key(run_id, step))
            .await?
        else {
            return Ok(());
        };
        // The timeout job is the one running; only the resolver is left.
        self.release_await(&registration, false).await;
        metrics::await_resolutions().add(
            1,
            &[
                KeyValue::new("type", registration.kind.type_name()),
                KeyValue::new("outcome", "timeout"),
            ],
        );
        warn!(run_id = %run_id, step, phase = %registration.phase, "await timed out");

        match registration.timeout_action.clone() {
            TimeoutAction::ContinueWithDefault(default) => {
                self.locked(run_id, self.resume(&registration, default, "await.timeout"))
                    .await
            }
            TimeoutAction::Fail => {
                self.locked(run_id, async {
                    let flow = self.flow(&registration.flow_name)?;
                    let mut run = self.load_run(run_id).await?;
                    if run.status.is_terminal() {
                        return Ok(());
                    }
                    self.record(
                        run_id,
                        "await.timeout",
                        json!({ "step": step, "phase": registration.phase, "action": "fail" }),
                    )
                    .await?;
                    let message = format!("await on step '{step}' timed out");
                    self.fail_step(&flow, &mut run, step, &message).await
                })
                .await
            }
        }
    }

    /// Live await registrations of a run.
    pub async fn pending_awaits(&self, run_id: &RunId) -> Result<Vec<AwaitRegistration>> {
        let run = self.load_run(run_id).await?;
        let awaits = self.awaits();
        let mut out = Vec::new();
        for step in run.awaiting_steps() {
            if let Some(registration) = awaits.get_as(&await_key(run_id, step)).await? {
                out.push(registration);
            }
        }
        Ok(out)
    }

    /// Look up the await a concrete webhook path belongs to.
    pub async fn webhook_route(&self, path: &str) -> Result<Option<WebhookRoute>> {
        self.routes().get_as(&normalize_path(path)).await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_run(&self, run_id: &RunId) -> Result<Option<FlowRun>> {
        self.runs().get_as(run_id.as_str()).await
    }

    /// A page of a flow's runs ordered by start time, plus the total count.
    pub async fn get_flow_runs(&self, flow_name: &str, range: &IndexRange) -> Result<RunPage> {
        let key = runs_index(flow_name);
        let total = self.inner.store.index_count(&key).await?;
        let runs = self.load_members(&key, range).await?;
        Ok(RunPage { runs, total })
    }

    pub async fn get_run_events(&self, run_id: &RunId, opts: &ReadOptions) -> Result<Vec<EventRecord>> {
        self.inner.store.read(&run_id.subject(), opts).await
    }

    pub async fn is_running(&self, flow_name: &str) -> Result<bool> {
        Ok(self.inner.store.index_count(&running_index(flow_name)).await? > 0)
    }

    /// Live runs of a flow, oldest first, minus `exclude`.
    pub async fn get_running_flows(&self, flow_name: &str, exclude: &[RunId]) -> Result<Vec<FlowRun>> {
        let runs = self
            .load_members(&running_index(flow_name), &IndexRange::all())
            .await?;
        Ok(runs
            .into_iter()
            .filter(|run| !run.status.is_terminal() && !exclude.contains(&run.run_id))
            .collect())
    }

    /// Cancel a flow's live runs, then delete every run stream, snapshot and
    /// both run indexes. Returns how many runs were removed.
    pub async fn clear_history(&self, flow_name: &str) -> Result<u64> {
        let key = runs_index(flow_name);
        let members = self.inner.store.index_read(&key, &IndexRange::all()).await?;
        let runs = self.runs();
        for entry in &members {
            let run_id = RunId::from(entry.member.as_str());
            if let Some(run) = runs.get_as::<FlowRun>(run_id.as_str()).await? {
                if !run.status.is_terminal() {
                    self.cancel_flow(flow_name, &run_id).await?;
                }
            }
            self.inner.store.delete_stream(&run_id.subject()).await?;
            runs.delete(run_id.as_str()).await?;
        }
        self.inner.store.delete_index(&key).await?;
        self.inner.store.delete_index(&running_index(flow_name)).await?;
        info!(flow = %flow_name, runs = members.len(), "flow history cleared");
        Ok(members.len() as u64)
    }

    /// Live feed of a run's events.
    pub async fn watch(&self, run_id: &RunId) -> Result<Subscription> {
        self.inner.store.subscribe(&run_id.subject()).await
    }

    // -----------------------------------------------------------------------
    // Queue
    // -----------------------------------------------------------------------

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    pub fn pause_queue(&self) {
        info!("dispatch queue paused");
        self.inner.queue.pause();
    }

    pub fn resume_queue(&self) {
        info!("dispatch queue resumed");
        self.inner.queue.resume();
    }

    /// Wait until no step invocation is queued or running.
    pub async fn wait_idle(&self) {
        self.inner.queue.wait_idle().await;
    }

    /// Drop queued invocations and wait for running ones to finish.
    pub async fn shutdown(&self) {
        self.inner.queue.close().await;
        info!("flow engine stopped");
    }

    /// Kill every queued and running invocation without releasing its lease,
    /// as a crashed process would. Other instances invoke those steps again
    /// once the leases lapse. The engine accepts no further work.
    pub fn abort(&self) {
        warn!("flow engine aborted");
        self.inner.queue.abort();
    }

    // -----------------------------------------------------------------------
    // Invocation leases
    // -----------------------------------------------------------------------

    /// Invoke again every `Running` step of a locally registered flow whose
    /// invocation lease lapsed. Returns how many invocations this instance
    /// took over.
    pub async fn recover_invocations(&self) -> Result<usize> {
        let flows: Vec<Arc<RegisteredFlow>> = self
            .inner
            .flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let invocations = self.invocations();
        let mut taken = 0;
        for flow in flows {
            for run in self.get_running_flows(&flow.definition.name, &[]).await? {
                for step in run.running_steps() {
                    let key = await_key(&run.run_id, step);
                    if self.is_invoking_here(&key) {
                        continue;
                    }
                    let now = Utc::now();
                    let lapsed = invocations
                        .get_as::<InvocationLease>(&key)
                        .await?
                        .is_none_or(|lease| lease.is_expired(now));
                    if !lapsed {
                        continue;
                    }
                    match self
                        .locked(&run.run_id, self.take_over(&flow, &run.run_id, step))
                        .await
                    {
                        Ok(true) => taken += 1,
                        Ok(false) => {}
                        Err(e) => {
                            warn!(run_id = %run.run_id, step, error = %e, "invocation takeover failed");
                        }
                    }
                }
            }
        }
        Ok(taken)
    }

    fn is_invoking_here(&self, key: &str) -> bool {
        self.inner
            .invoking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    /// Under the run lock: claim a lapsed invocation of `step` and queue it.
    async fn take_over(&self, flow: &Arc<RegisteredFlow>, run_id: &RunId, step: &str) -> Result<bool> {
        let run = self.load_run(run_id).await?;
        let Some(state) = run
            .step(step)
            .filter(|s| !run.status.is_terminal() && s.status == StepStatus::Running)
        else {
            return Ok(false);
        };
        let Some((lease, previous)) = self.claim_lapsed(run_id, step).await? else {
            return Ok(false);
        };
        self.record(
            run_id,
            "step.recovered",
            json!({
                "step": step,
                "owner": self.inner.scheduler.instance_id(),
                "previousOwner": previous,
            }),
        )
        .await?;
        info!(run_id = %run_id, step, previous = ?previous, "step invocation taken over");
        self.submit_invocation(
            flow,
            run_id,
            step,
            state.input.clone().unwrap_or(Value::Null),
            state.resolution.clone(),
            lease,
        );
        Ok(true)
    }

    /// Claim the lease of `step` if it is missing or expired. Returns the
    /// new lease and the previous owner, if any.
    async fn claim_lapsed(&self, run_id: &RunId, step: &str) -> Result<Option<(Value, Option<String>)>> {
        let key = await_key(run_id, step);
        let invocations = self.invocations();
        let ttl = Some(self.inner.config.invocation_lease);
        let mine = serde_json::to_value(self.new_invocation_lease(run_id, step)?)?;
        match invocations.get(&key).await? {
            None => Ok(invocations
                .set_if_absent(&key, mine.clone(), ttl)
                .await?
                .then_some((mine, None))),
            Some(current) => {
                let lease: InvocationLease = serde_json::from_value(current.clone())?;
                if !lease.is_expired(Utc::now()) {
                    return Ok(None);
                }
                Ok(invocations
                    .compare_and_set(&key, &current, Some(mine.clone()), ttl)
                    .await?
                    .then_some((mine, Some(lease.owner))))
            }
        }
    }

    fn new_invocation_lease(&self, run_id: &RunId, step: &str) -> Result<InvocationLease> {
        let now = Utc::now();
        Ok(InvocationLease {
            run_id: run_id.clone(),
            step: step.to_string(),
            owner: self.inner.scheduler.instance_id().to_string(),
            token: Uuid::new_v4().to_string(),
            acquired_at: now,
            expires_at: now + to_chrono(self.inner.config.invocation_lease)?,
        })
    }

    /// Start renewing `lease` in the background.
    fn keep_lease(&self, key: String, lease: Value) -> LeaseKeeper {
        self.inner
            .invoking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        let held = Arc::new(Mutex::new(lease));
        let renewal = tokio::spawn(renew_lease(
            self.invocations(),
            key.clone(),
            Arc::clone(&held),
            self.inner.config.invocation_lease,
        ));
        LeaseKeeper {
            key,
            held,
            renewal,
            invoking: Arc::clone(&self.inner.invoking),
        }
    }

    /// Stop renewing and delete the lease unless someone else holds it now.
    async fn release_lease(&self, keeper: LeaseKeeper) {
        keeper.renewal.abort();
        let current = keeper
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Err(e) = self
            .invocations()
            .compare_and_set(&keeper.key, &current, None, None)
            .await
        {
            warn!(key = %keeper.key, error = %e, "failed to release invocation lease");
        }
    }

    // -----------------------------------------------------------------------
    // Internals: activation and execution
    // -----------------------------------------------------------------------

    /// Give `step` its input: suspend on `await_before` or dispatch.
    async fn activate(
        &self,
        flow: &Arc<RegisteredFlow>,
        run: &mut FlowRun,
        step: &StepSpec,
        input: Value,
    ) -> Result<()> {
        let state = run.step_mut(&step.name);
        state.input = Some(input.clone());
        state.started_at = Some(Utc::now());
        match &step.await_before {
            Some(spec) => self.register_await(run, step, AwaitPhase::Before, spec).await,
            None => {
                self.dispatch(flow, &run.run_id, &step.name, input, None)
                    .await?;
                run.step_mut(&step.name).status = StepStatus::Running;
                Ok(())
            }
        }
    }

    /// Lease the invocation of `step` to this instance and queue it.
    async fn dispatch(
        &self,
        flow: &Arc<RegisteredFlow>,
        run_id: &RunId,
        step: &str,
        input: Value,
        resolution: Option<Value>,
    ) -> Result<()> {
        let lease = serde_json::to_value(self.new_invocation_lease(run_id, step)?)?;
        self.invocations()
            .set(
                &await_key(run_id, step),
                lease.clone(),
                Some(self.inner.config.invocation_lease),
            )
            .await?;
        self.submit_invocation(flow, run_id, step, input, resolution, lease);
        Ok(())
    }

    fn submit_invocation(
        &self,
        flow: &Arc<RegisteredFlow>,
        run_id: &RunId,
        step: &str,
        input: Value,
        resolution: Option<Value>,
        lease: Value,
    ) {
        let keeper = self.keep_lease(await_key(run_id, step), lease);
        let engine = self.clone();
        let flow = Arc::clone(flow);
        let run_id = run_id.clone();
        let step = step.to_string();
        self.inner.queue.submit(async move {
            let outcome = engine
                .clone()
                .execute(flow, run_id, step, input, resolution)
                .await;
            engine.release_lease(keeper).await;
            outcome
        });
    }

    /// Run a step's handler with its retry policy, then record the outcome.
    async fn execute(
        self,
        flow: Arc<RegisteredFlow>,
        run_id: RunId,
        step_name: String,
        input: Value,
        resolution: Option<Value>,
    ) -> Result<()> {
        let spec = flow.step(&step_name)?;
        let handler = flow
            .handlers
            .get(&step_name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("handler for step '{step_name}'")))?;
        let allowed = Arc::new(spec.emits.iter().cloned().collect::<BTreeSet<_>>());
        let flow_name = flow.definition.name.as_str();

        let mut attempt = 1;
        loop {
            if self
                .get_run(&run_id)
                .await?
                .is_none_or(|run| run.status.is_terminal())
            {
                debug!(run_id = %run_id, step = %step_name, "run finished; invocation dropped");
                return Ok(());
            }
            self.record(&run_id, "step.started", json!({ "step": step_name, "attempt": attempt }))
                .await?;

            let ctx = StepContext::new(
                run_id.clone(),
                flow_name,
                &step_name,
                attempt,
                resolution.clone(),
                Arc::clone(&allowed),
            );
            let span = step_telemetry::start_step_span(flow_name, run_id.as_str(), &step_name, attempt);
            let call = handler.call(ctx.clone(), input.clone()).instrument(span.clone());
            let clock = Instant::now();
            let outcome = match spec.execution_timeout() {
                Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                    Err(Error::Timeout(format!(
                        "step '{step_name}' exceeded {}ms",
                        limit.as_millis()
                    )))
                }),
                None => call.await,
            };
            let label = match &outcome {
                Ok(_) => "ok",
                Err(Error::Timeout(_)) => "timeout",
                Err(_) => "error",
            };
            step_telemetry::record_outcome(&span, label);
            metrics::step_invocations().add(
                1,
                &[
                    KeyValue::new("flow", flow_name.to_string()),
                    KeyValue::new("step", step_name.clone()),
                    KeyValue::new("outcome", label),
                ],
            );
            metrics::operation_duration_ms().record(
                clock.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("operation", "step.invoke")],
            );

            match outcome {
                Ok(output) => {
                    let emits = ctx.take_emits();
                    return self
                        .locked(
                            &run_id,
                            self.on_step_success(&flow, &run_id, &step_name, attempt, output, emits),
                        )
                        .await;
                }
                Err(e) if attempt < spec.retry.attempts => {
                    let delay = spec.retry.delay_before(attempt + 1);
                    warn!(
                        run_id = %run_id,
                        step = %step_name,
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "step attempt failed"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    let failure = Error::StepExecution {
                        step: step_name.clone(),
                        attempts: attempt,
                        message: e.to_string(),
                    };
                    let message = failure.to_string();
                    self.locked(&run_id, async {
                        let mut run = self.load_run(&run_id).await?;
                        if run.status.is_terminal() {
                            return Ok(());
                        }
                        let state = run.step_mut(&step_name);
                        state.attempts = attempt;
                        state.invocations += attempt;
                        self.fail_step(&flow, &mut run, &step_name, &message).await
                    })
                    .await?;
                    return Err(failure);
                }
            }
        }
    }

    async fn on_step_success(
        &self,
        flow: &Arc<RegisteredFlow>,
        run_id: &RunId,
        step_name: &str,
        attempts: u32,
        output: Value,
        emits: Vec<(String, Value)>,
    ) -> Result<()> {
        let mut run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            debug!(run_id = %run_id, step = step_name, "emits of finished run ignored");
            return Ok(());
        }
        let state = run.step_mut(step_name);
        if state.status != StepStatus::Running {
            return Ok(());
        }
        state.attempts = attempts;
        state.invocations += attempts;
        state.output = Some(output);

        let spec = flow.step(step_name)?;
        match &spec.await_after {
            Some(await_spec) => {
                run.step_mut(step_name).held_emits = emits;
                self.register_await(&mut run, spec, AwaitPhase::After, await_spec)
                    .await?;
            }
            None => self.complete_step(flow, &mut run, step_name, emits).await?,
        }
        self.advance(&mut run).await
    }

    /// Mark a step completed and route its emits to subscribers.
    async fn complete_step(
        &self,
        flow: &Arc<RegisteredFlow>,
        run: &mut FlowRun,
        step_name: &str,
        emits: Vec<(String, Value)>,
    ) -> Result<()> {
        let run_id = run.run_id.clone();
        let state = run.step_mut(step_name);
        state.status = StepStatus::Completed;
        state.await_phase = None;
        state.finished_at = Some(Utc::now());
        let output = state.output.clone();
        self.record(&run_id, "step.completed", json!({ "step": step_name, "output": output }))
            .await?;

        for (kind, payload) in emits {
            self.record(
                &run_id,
                "step.emitted",
                json!({ "step": step_name, "kind": kind, "payload": payload }),
            )
            .await?;
            for subscriber in flow.definition.subscribers_of(&kind) {
                let state = run.step_mut(&subscriber.name);
                if state.status != StepStatus::Pending {
                    debug!(step = %subscriber.name, kind = %kind, "late input ignored");
                    continue;
                }
                state.received.insert(kind.clone(), payload.clone());
                if !subscriber.subscribes.iter().all(|k| state.received.contains_key(k)) {
                    continue;
                }
                let input = Value::Object(
                    state
                        .received
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                );
                self.activate(flow, run, subscriber, input).await?;
            }
        }
        Ok(())
    }

    /// Record a failed step and fail the run unless the flow continues past failures.
    async fn fail_step(
        &self,
        flow: &Arc<RegisteredFlow>,
        run: &mut FlowRun,
        step_name: &str,
        message: &str,
    ) -> Result<()> {
        let run_id = run.run_id.clone();
        let state = run.step_mut(step_name);
        state.status = StepStatus::Failed;
        state.await_phase = None;
        state.error = Some(message.to_string());
        state.finished_at = Some(Utc::now());
        let attempts = state.attempts;
        self.record(
            &run_id,
            "step.failed",
            json!({ "step": step_name, "attempts": attempts, "error": message }),
        )
        .await?;
        warn!(run_id = %run_id, step = step_name, error = message, "step failed");

        if flow.definition.continue_on_failure {
            return self.advance(run).await;
        }
        let from = run.status;
        run.transition(RunStatus::Failed)?;
        run.error = Some(message.to_string());
        self.drop_awaits(run).await?;
        self.finish(run, from, "flow.failed", json!({ "step": step_name, "error": message }))
            .await
    }

    /// Continue a suspended step after its registration was consumed.
    async fn resume(&self, registration: &AwaitRegistration, payload: Value, kind: &str) -> Result<()> {
        let flow = self.flow(&registration.flow_name)?;
        let run_id = &registration.run_id;
        let step = registration.step.as_str();
        let mut run = self.load_run(run_id).await?;
        if run.status.is_terminal() || run.step_mut(step).status != StepStatus::Awaiting {
            return Ok(());
        }
        self.record(
            run_id,
            kind,
            json!({ "step": step, "phase": registration.phase, "payload": payload }),
        )
        .await?;

        match registration.phase {
            AwaitPhase::Before => {
                let input = run.step_mut(step).input.clone().unwrap_or(Value::Null);
                self.dispatch(&flow, run_id, step, input, Some(payload.clone()))
                    .await?;
                let state = run.step_mut(step);
                state.status = StepStatus::Running;
                state.await_phase = None;
                state.resolution = Some(payload);
            }
            AwaitPhase::After => {
                let emits = std::mem::take(&mut run.step_mut(step).held_emits);
                self.complete_step(&flow, &mut run, step, emits).await?;
            }
        }
        self.advance(&mut run).await
    }

    /// Complete the run once nothing is left in flight, then persist it.
    async fn advance(&self, run: &mut FlowRun) -> Result<()> {
        if run.status == RunStatus::Running && !run.has_in_flight_steps() {
            run.transition(RunStatus::Completed)?;
            let flow = run.flow_name.clone();
            return self
                .finish(run, RunStatus::Running, "flow.completed", json!({ "flow": flow }))
                .await;
        }
        self.save_run(run).await
    }

    /// Bookkeeping for a run that just entered a terminal state.
    async fn finish(&self, run: &mut FlowRun, from: RunStatus, kind: &str, payload: Value) -> Result<()> {
        let run_id = run.run_id.clone();
        self.save_run(run).await?;
        self.inner
            .store
            .index_remove(&running_index(&run.flow_name), run_id.as_str())
            .await?;
        self.record(&run_id, kind, payload).await?;
        metrics::runs_finished().add(
            1,
            &[
                KeyValue::new("flow", run.flow_name.clone()),
                KeyValue::new("status", run.status.to_string()),
            ],
        );
        step_telemetry::record_run_transition(
            &run.flow_name,
            run_id.as_str(),
            &from.to_string(),
            &run.status.to_string(),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals: await registrations
    // -----------------------------------------------------------------------

    async fn register_await(
        &self,
        run: &mut FlowRun,
        step: &StepSpec,
        phase: AwaitPhase,
        spec: &AwaitSpec,
    ) -> Result<()> {
        let run_id = run.run_id.clone();
        let now = Utc::now();
        let deadline = match spec.deadline() {
            Some(d) => Some(now + to_chrono(d)?),
            None => None,
        };
        let mut registration = AwaitRegistration {
            run_id: run_id.clone(),
            flow_name: run.flow_name.clone(),
            step: step.name.clone(),
            phase,
            kind: spec.kind.clone(),
            webhook_path: None,
            resolve_job: None,
            timeout_job: None,
            deadline,
            timeout_action: spec.timeout_action.clone(),
            registered_at: now,
        };
        let target = serde_json::to_value(AwaitTarget {
            run_id: run_id.clone(),
            step: step.name.clone(),
        })?;

        let fire_at = match &spec.kind {
            AwaitKind::Webhook { method, path } => {
                let path = normalize_path(
                    &path
                        .replace("{runId}", run_id.as_str())
                        .replace("{stepName}", &step.name),
                );
                let route = WebhookRoute {
                    run_id: run_id.clone(),
                    step: step.name.clone(),
                    method: method.clone(),
                };
                self.routes().put(&path, &route, None).await?;
                registration.webhook_path = Some(path);
                None
            }
            AwaitKind::Time { delay_ms } => Some(now + to_chrono(Duration::from_millis(*delay_ms))?),
            AwaitKind::Schedule { cron, timezone } => {
                let parsed = schedule::parse_cron(cron)?;
                let tz = schedule::parse_timezone(timezone.as_deref())?;
                Some(schedule::next_cron(&parsed, tz, now).ok_or_else(|| {
                    Error::Validation(format!("cron '{cron}' has no future occurrence"))
                })?)
            }
        };
        if let Some(at) = fire_at {
            let id = await_job_id(&run_id, &step.name, "resolve");
            self.inner
                .scheduler
                .schedule(
                    NewJob::once(id.as_str(), AWAIT_RESOLVE_HANDLER, at)
                        .id(id.clone())
                        .payload(target.clone()),
                )
                .await?;
            registration.resolve_job = Some(id);
        }
        if let Some(at) = deadline {
            let id = await_job_id(&run_id, &step.name, "timeout");
            self.inner
                .scheduler
                .schedule(
                    NewJob::once(id.as_str(), AWAIT_TIMEOUT_HANDLER, at)
                        .id(id.clone())
                        .payload(target),
                )
                .await?;
            registration.timeout_job = Some(id);
        }

        self.awaits()
            .put(&await_key(&run_id, &step.name), &registration, None)
            .await?;
        let state = run.step_mut(&step.name);
        state.status = StepStatus::Awaiting;
        state.await_phase = Some(phase);
        self.record(
            &run_id,
            "await.registered",
            json!({
                "step": step.name,
                "phase": phase,
                "type": spec.kind.type_name(),
                "path": registration.webhook_path,
                "deadline": deadline,
            }),
        )
        .await?;
        debug!(run_id = %run_id, step = %step.name, %phase, kind = spec.kind.type_name(), "await registered");
        Ok(())
    }

    /// Drop a consumed registration's route and jobs. Best effort: the
    /// registration itself is already gone, so stale leftovers are inert.
    async fn release_await(&self, registration: &AwaitRegistration, with_timeout: bool) {
        if let Some(path) = &registration.webhook_path {
            if let Err(e) = self.routes().delete(path).await {
                warn!(path = %path, error = %e, "failed to remove webhook route");
            }
        }
        let timeout_job = registration.timeout_job.as_ref().filter(|_| with_timeout);
        for job in registration.resolve_job.iter().chain(timeout_job) {
            if let Err(e) = self.inner.scheduler.unschedule(&JobId::from(job.as_str())).await {
                warn!(job = %job, error = %e, "failed to unschedule await job");
            }
        }
    }

    /// Consume every live registration of a run that is finishing.
    async fn drop_awaits(&self, run: &FlowRun) -> Result<()> {
        let awaits = self.awaits();
        for step in run.awaiting_steps() {
            if let Some(registration) = awaits
                .take_as::<AwaitRegistration>(&await_key(&run.run_id, step))
                .await?
            {
                self.release_await(&registration, true).await;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals: persistence and locking
    // -----------------------------------------------------------------------

    async fn load_run(&self, run_id: &RunId) -> Result<FlowRun> {
        self.get_run(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("run {run_id}")))
    }

    async fn save_run(&self, run: &mut FlowRun) -> Result<()> {
        run.updated_at = Utc::now();
        self.runs().put(run.run_id.as_str(), run, None).await
    }

    async fn load_members(&self, key: &str, range: &IndexRange) -> Result<Vec<FlowRun>> {
        let runs = self.runs();
        let mut out = Vec::new();
        for entry in self.inner.store.index_read(key, range).await? {
            if let Some(run) = runs.get_as::<FlowRun>(&entry.member).await? {
                out.push(run);
            }
        }
        Ok(out)
    }

    async fn record(&self, run_id: &RunId, kind: &str, payload: Value) -> Result<EventRecord> {
        self.inner
            .store
            .append(
                &run_id.subject(),
                NewEvent::new(kind, payload).correlation(run_id.as_str()),
            )
            .await
    }

    /// Run `work` holding the run's lock.
    async fn locked<T>(&self, run_id: &RunId, work: impl Future<Output = Result<T>>) -> Result<T> {
        let local = {
            let mut locks = self
                .inner
                .run_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(run_id.clone()).or_default())
        };
        let guard = local.lock().await;
        let outcome = match self.acquire_run_lease(run_id).await {
            Ok(lease) => {
                let outcome = work.await;
                if let Err(e) = self
                    .inner
                    .store
                    .kv(RUN_LOCKS)
                    .compare_and_set(run_id.as_str(), &lease, None, None)
                    .await
                {
                    warn!(run_id = %run_id, error = %e, "failed to release run lock");
                }
                outcome
            }
            Err(e) => Err(e),
        };
        drop(guard);

        let mut locks = self
            .inner
            .run_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        drop(local);
        if locks.get(run_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(run_id);
        }
        outcome
    }

    async fn acquire_run_lease(&self, run_id: &RunId) -> Result<Value> {
        let lease = self.inner.config.run_lock_lease;
        let token = json!({
            "owner": self.inner.scheduler.instance_id(),
            "token": Uuid::new_v4().to_string(),
        });
        let locks = self.inner.store.kv(RUN_LOCKS);
        let give_up = Instant::now() + lease * 2;
        let mut backoff = Duration::from_millis(5);
        loop {
            if locks
                .set_if_absent(run_id.as_str(), token.clone(), Some(lease))
                .await?
            {
                return Ok(token);
            }
            metrics::lock_contention().add(1, &[KeyValue::new("resource", "run")]);
            if Instant::now() >= give_up {
                return Err(Error::LockContention(format!("run {run_id}")));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_millis(100));
        }
    }
}

/// Keeps an invocation lease renewed until dropped.
struct LeaseKeeper {
    key: String,
    held: Arc<Mutex<Value>>,
    renewal: JoinHandle<()>,
    invoking: Arc<Mutex<HashSet<String>>>,
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.renewal.abort();
        self.invoking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Extend the held lease every third of its length, until aborted or lost.
async fn renew_lease(invocations: KvScope, key: String, held: Arc<Mutex<Value>>, length: Duration) {
    loop {
        tokio::time::sleep(length / 3).await;
        let current = held.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let renewed = match extend_lease(&current, length) {
            Ok(renewed) => renewed,
            Err(e) => {
                warn!(key = %key, error = %e, "cannot extend invocation lease");
                return;
            }
        };
        match invocations
            .compare_and_set(&key, &current, Some(renewed.clone()), Some(length))
            .await
        {
            Ok(true) => *held.lock().unwrap_or_else(PoisonError::into_inner) = renewed,
            Ok(false) => {
                warn!(key = %key, "invocation lease lost");
                return;
            }
            Err(e) => warn!(key = %key, error = %e, "invocation lease renewal failed"),
        }
    }
}

fn extend_lease(current: &Value, length: Duration) -> Result<Value> {
    let mut lease: InvocationLease = serde_json::from_value(current.clone())?;
    lease.expires_at = Utc::now() + to_chrono(length)?;
    Ok(serde_json::to_value(lease)?)
}

fn runs_index(flow: &str) -> String {
    format!("flow:{flow}:runs")
}

fn running_index(flow: &str) -> String {
    format!("flow:{flow}:running")
}

fn await_key(run_id: &RunId, step: &str) -> String {
    format!("{run_id}/{step}")
}

fn await_job_id(run_id: &RunId, step: &str, purpose: &str) -> String {
    format!("await:{run_id}:{step}:{purpose}")
}

/// Leading slash, no trailing slash.
pub(crate) fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    format!("/{trimmed}")
}

fn to_chrono(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|e| Error::Validation(format!("duration out of range: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::flow::step_fn;
    use crate::scheduler::SchedulerConfig;

    #[tokio::test]
    async fn run_cancelled_before_activation_registers_nothing() {
        let store = EventStore::memory();
        let engine = FlowEngine::new(
            store.clone(),
            Scheduler::new(store, SchedulerConfig::new("unit")),
            EngineConfig::default(),
        );
        engine
            .register_flow(
                FlowRegistration::new(
                    FlowDefinition::new("gate").step(
                        StepSpec::entry("sign").await_before(AwaitSpec::webhook("POST", "/sign/{runId}")),
                    ),
                )
                .on("sign", step_fn(|_ctx, input| async move { Ok(input) })),
            )
            .unwrap();
        let flow = engine.flow("gate").unwrap();

        let run_id = engine.create_run(&flow, json!({})).await.unwrap();
        engine.cancel_flow("gate", &run_id).await.unwrap();
        let run = engine
            .activate_entries(&flow, &run_id, json!({}))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.step("sign").unwrap().status, StepStatus::Pending);
        assert!(engine.pending_awaits(&run_id).await.unwrap().is_empty());
        assert!(engine.webhook_route(&format!("/sign/{run_id}")).await.unwrap().is_none());
        let resolution = engine.resolve_await(&run_id, "sign", json!({})).await.unwrap();
        assert_eq!(resolution, Resolution::NotFound);
    }

    #[test]
    fn paths_are_normalized() {
        assert_eq!(normalize_path("approve/r1/ship/"), "/approve/r1/ship");
        assert_eq!(normalize_path("/approve"), "/approve");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn await_keys_are_per_step() {
        let run = RunId::from("r1");
        assert_eq!(await_key(&run, "ship"), "r1/ship");
        assert_eq!(await_job_id(&run, "ship", "timeout"), "await:r1:ship:timeout");
    }
}
