//! Distributed scheduler: cron, interval and one-time jobs shared by every
//! instance on one store.
//!
//! Jobs persist at `scheduler-jobs/<id>`, listed by the `scheduler:jobs`
//! index. Each due occurrence is claimed through a leased lock at
//! `scheduler-locks/<id>`: acquired set-if-absent, renewed by compare-and-set
//! on the exact previous lock value, released by a guarded delete. The
//! winner re-reads the job, advances `next_run` before running the handler,
//! so an occurrence executes once even if the lease lapses mid-run.
//!
//! The loop spawns each claimed execution and keeps ticking, so a slow
//! handler never delays other due jobs. A job already executing here is not
//! claimed again until it finishes.

pub mod schedule;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::error::{Error, Result};
use crate::model::event::IndexRange;
use crate::model::job::{JobId, NewJob, ScheduledJob, SchedulerLock};
use crate::store::{EventStore, KeyPattern, KvScope};
use crate::telemetry::metrics;

const JOBS: &str = "scheduler-jobs";
const LOCKS: &str = "scheduler-locks";
const JOB_INDEX: &str = "scheduler:jobs";

/// Code run when a job fires. Registered by name on every instance that
/// should be able to execute the job.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, job: ScheduledJob) -> Result<()>;
}

struct FnJob<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnJob<F>
where
    F: Fn(ScheduledJob) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(&self, job: ScheduledJob) -> Result<()> {
        (self.0)(job).await
    }
}

/// Work every instance performs on each loop iteration, beside due jobs.
#[async_trait]
pub trait TickTask: Send + Sync + 'static {
    async fn tick(&self) -> Result<()>;
}

/// Adapt an async closure into a [`JobHandler`].
pub fn job_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(ScheduledJob) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnJob(f))
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Lock owner identity. Must differ between instances.
    pub instance_id: String,
    /// How often the loop looks for due jobs.
    pub tick: Duration,
    /// Lock lease length.
    pub lease: Duration,
    /// How often a running job's lease is renewed. Keep well under `lease`.
    pub renew_every: Duration,
}

impl SchedulerConfig {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            tick: Duration::from_secs(1),
            lease: Duration::from_secs(30),
            renew_every: Duration::from_secs(10),
        }
    }

    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Set the lease; renewal defaults to a third of it.
    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self.renew_every = lease / 3;
        self
    }
}

struct Health {
    last_tick: Option<Instant>,
    /// Latest failed lease renewal; cleared by a later success.
    renewal_failed_at: Option<Instant>,
}

struct SchedulerInner {
    store: EventStore,
    config: SchedulerConfig,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    tick_tasks: RwLock<Vec<Arc<dyn TickTask>>>,
    local: Mutex<HashMap<JobId, ScheduledJob>>,
    /// Jobs executing on this instance right now.
    executing: Mutex<HashSet<JobId>>,
    health: Mutex<Health>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Notify,
}

/// The scheduler service. Cheap to clone; clones share one loop.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(store: EventStore, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                config,
                handlers: RwLock::new(HashMap::new()),
                tick_tasks: RwLock::new(Vec::new()),
                local: Mutex::new(HashMap::new()),
                executing: Mutex::new(HashSet::new()),
                health: Mutex::new(Health {
                    last_tick: None,
                    renewal_failed_at: None,
                }),
                task: Mutex::new(None),
                shutdown: Notify::new(),
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.config.instance_id
    }

    fn jobs(&self) -> KvScope {
        self.inner.store.kv(JOBS)
    }

    fn locks(&self) -> KvScope {
        self.inner.store.kv(LOCKS)
    }

    fn local(&self) -> MutexGuard<'_, HashMap<JobId, ScheduledJob>> {
        self.inner.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn health(&self) -> MutexGuard<'_, Health> {
        self.inner.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_handler(&self, name: &str, handler: Arc<dyn JobHandler>) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), handler);
    }

    /// Run `task` on every loop iteration of this instance.
    pub fn register_tick_task(&self, task: Arc<dyn TickTask>) {
        self.inner
            .tick_tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    fn handler(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Register a job in the shared store and return its id.
    ///
    /// Registering an id that already exists keeps the persisted run history;
    /// a changed schedule, handler or payload replaces the definition.
    pub async fn schedule(&self, new: NewJob) -> Result<JobId> {
        if new.name.trim().is_empty() {
            return Err(Error::Validation("job name must not be empty".into()));
        }
        if new.handler.trim().is_empty() {
            return Err(Error::Validation(format!("job '{}' has no handler", new.name)));
        }
        schedule::validate(&new.schedule)?;

        let now = Utc::now();
        let id = new.id.clone().unwrap_or_else(|| JobId::from(new.name.as_str()));
        let job = ScheduledJob {
            id: id.clone(),
            name: new.name,
            next_run: schedule::first_run(&new.schedule, now, now)?,
            schedule: new.schedule,
            handler: new.handler,
            payload: new.payload,
            enabled: new.enabled,
            max_failures: new.max_failures,
            anchor: now,
            last_run: None,
            run_count: 0,
            fail_count: 0,
            consecutive_failures: 0,
            created_at: now,
        };

        let jobs = self.jobs();
        let created = jobs
            .set_if_absent(id.as_str(), serde_json::to_value(&job)?, None)
            .await?;
        let stored = if created {
            info!(job = %id, kind = job.schedule.type_name(), next_run = ?job.next_run, "job scheduled");
            job
        } else {
            self.refresh_definition(&jobs, job).await?
        };
        self.inner
            .store
            .index_write(JOB_INDEX, id.as_str(), stored.created_at.timestamp_millis() as f64)
            .await?;
        self.local().insert(id.clone(), stored);
        Ok(id)
    }

    /// Reconcile a re-registration with the persisted job.
    async fn refresh_definition(&self, jobs: &KvScope, wanted: ScheduledJob) -> Result<ScheduledJob> {
        loop {
            let Some(current_value) = jobs.get(wanted.id.as_str()).await? else {
                // Removed in between: register fresh.
                jobs.set(wanted.id.as_str(), serde_json::to_value(&wanted)?, None)
                    .await?;
                return Ok(wanted);
            };
            let current: ScheduledJob = serde_json::from_value(current_value.clone())?;
            if current.schedule == wanted.schedule
                && current.handler == wanted.handler
                && current.payload == wanted.payload
                && current.max_failures == wanted.max_failures
            {
                debug!(job = %current.id, "job already registered");
                return Ok(current);
            }

            let mut updated = current.clone();
            updated.name = wanted.name.clone();
            updated.handler = wanted.handler.clone();
            updated.payload = wanted.payload.clone();
            updated.max_failures = wanted.max_failures;
            if updated.schedule != wanted.schedule {
                updated.schedule = wanted.schedule.clone();
                updated.anchor = wanted.anchor;
                updated.next_run = wanted.next_run;
            }
            if jobs
                .compare_and_set(
                    wanted.id.as_str(),
                    &current_value,
                    Some(serde_json::to_value(&updated)?),
                    None,
                )
                .await?
            {
                info!(job = %updated.id, "job definition updated");
                return Ok(updated);
            }
        }
    }

    /// Remove a job everywhere. Returns whether it existed.
    pub async fn unschedule(&self, id: &JobId) -> Result<bool> {
        let existed = self.jobs().delete(id.as_str()).await?;
        self.inner.store.index_remove(JOB_INDEX, id.as_str()).await?;
        self.local().remove(id);
        if existed {
            info!(job = %id, "job unscheduled");
        }
        Ok(existed)
    }

    /// Jobs registered through this instance, as registered.
    pub fn get_scheduled_jobs(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<_> = self.local().values().cloned().collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Option<ScheduledJob>> {
        self.jobs().get_as(id.as_str()).await
    }

    /// Every job in the shared store.
    pub async fn get_all_persisted_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let entries = self
            .inner
            .store
            .index_read(JOB_INDEX, &IndexRange::all())
            .await?;
        let jobs = self.jobs();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(job) = jobs.get_as::<ScheduledJob>(&entry.member).await? {
                out.push(job);
            }
        }
        Ok(out)
    }

    /// Persisted jobs whose id or name matches a glob pattern.
    pub async fn get_jobs_by_pattern(&self, pattern: &str) -> Result<Vec<ScheduledJob>> {
        let pattern = KeyPattern::new(pattern)?;
        Ok(self
            .get_all_persisted_jobs()
            .await?
            .into_iter()
            .filter(|job| pattern.matches(job.id.as_str()) || pattern.matches(&job.name))
            .collect())
    }

    /// Spawn the execution loop. Idempotent.
    pub fn start(&self) {
        let mut task = self.inner.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let this = self.clone();
        let span = info_span!("scheduler", instance = %self.inner.config.instance_id);
        *task = Some(tokio::spawn(
            async move {
                info!("scheduler started");
                // Dropping the set aborts whatever is still executing.
                let mut executions = JoinSet::new();
                loop {
                    this.health().last_tick = Some(Instant::now());
                    while let Some(done) = executions.try_join_next() {
                        log_join(done);
                    }
                    if let Err(e) = this.spawn_due_jobs(&mut executions).await {
                        warn!(error = %e, "scheduler iteration failed");
                    }
                    this.run_tick_tasks().await;
                    tokio::select! {
                        _ = this.inner.shutdown.notified() => {
                            info!(running = executions.len(), "scheduler stopping");
                            while let Some(done) = executions.join_next().await {
                                log_join(done);
                            }
                            return;
                        }
                        _ = tokio::time::sleep(this.inner.config.tick) => {}
                    }
                }
            }
            .instrument(span),
        ));
    }

    async fn run_tick_tasks(&self) {
        let tasks = self
            .inner
            .tick_tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for task in tasks {
            if let Err(e) = task.tick().await {
                warn!(error = %e, "tick task failed");
            }
        }
    }

    /// Stop the loop and wait for executing jobs to finish.
    pub async fn stop(&self) {
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            self.inner.shutdown.notify_one();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = %e, "scheduler loop panicked");
                }
            }
        }
    }

    /// Kill the loop and its executing jobs without releasing their locks.
    pub fn abort(&self) {
        if let Some(task) = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    /// True iff the loop is alive, has ticked within three tick periods, and
    /// no lease renewal failed within the last lease period.
    pub fn is_healthy(&self) -> bool {
        let alive = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished());
        if !alive {
            return false;
        }
        // An iteration only lists jobs and spawns them; the floor covers
        // slow store round trips on very short ticks.
        let tolerance = (self.inner.config.tick * 3).max(Duration::from_secs(1));
        let health = self.health();
        let ticking = health
            .last_tick
            .is_some_and(|t| t.elapsed() <= tolerance);
        let renewing = health
            .renewal_failed_at
            .is_none_or(|t| t.elapsed() > self.inner.config.lease);
        ticking && renewing
    }

    /// Due jobs with a local handler that are not already executing here.
    async fn due_jobs(&self) -> Result<Vec<(ScheduledJob, Arc<dyn JobHandler>, Claim)>> {
        let now = Utc::now();
        let mut due = Vec::new();
        for job in self.get_all_persisted_jobs().await? {
            if !job.enabled || job.next_run.is_none_or(|at| at > now) {
                continue;
            }
            let Some(handler) = self.handler(&job.handler) else {
                debug!(job = %job.id, handler = %job.handler, "no local handler for due job");
                continue;
            };
            let Some(claim) = self.claim(&job.id) else {
                debug!(job = %job.id, "job still executing here");
                continue;
            };
            due.push((job, handler, claim));
        }
        Ok(due)
    }

    fn claim(&self, id: &JobId) -> Option<Claim> {
        let fresh = self
            .inner
            .executing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());
        fresh.then(|| Claim {
            id: id.clone(),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Execute every due job this instance can claim and wait for them.
    /// Returns how many jobs ran here.
    pub async fn run_due_jobs(&self) -> Result<usize> {
        let runs = self
            .due_jobs()
            .await?
            .into_iter()
            .map(|(job, handler, claim)| async move {
                let outcome = self.try_execute(job.id, handler).await;
                drop(claim);
                outcome
            });
        let mut executed = 0;
        for outcome in futures::future::join_all(runs).await {
            if note_outcome(outcome) {
                executed += 1;
            }
        }
        Ok(executed)
    }

    /// Spawn every due job this instance can claim into `executions`.
    async fn spawn_due_jobs(&self, executions: &mut JoinSet<()>) -> Result<usize> {
        let due = self.due_jobs().await?;
        let spawned = due.len();
        for (job, handler, claim) in due {
            let this = self.clone();
            executions.spawn(
                async move {
                    let _claim = claim;
                    note_outcome(this.try_execute(job.id, handler).await);
                }
                .in_current_span(),
            );
        }
        Ok(spawned)
    }

    async fn try_execute(&self, id: JobId, handler: Arc<dyn JobHandler>) -> Result<bool> {
        let config = &self.inner.config;
        let locks = self.locks();
        let lock_value = serde_json::to_value(self.new_lock(&id)?)?;
        if !locks
            .set_if_absent(id.as_str(), lock_value.clone(), Some(config.lease))
            .await?
        {
            metrics::lock_contention().add(1, &[KeyValue::new("job", id.to_string())]);
            return Err(Error::LockContention(id.to_string()));
        }
        self.health().renewal_failed_at = None;
        let held = Mutex::new(lock_value);

        let outcome = self.execute_locked(&id, handler, &held).await;

        let current = held.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Err(e) = locks.compare_and_set(id.as_str(), &current, None, None).await {
            warn!(job = %id, error = %e, "failed to release job lock");
        }
        outcome
    }

    async fn execute_locked(
        &self,
        id: &JobId,
        handler: Arc<dyn JobHandler>,
        held: &Mutex<Value>,
    ) -> Result<bool> {
        let jobs = self.jobs();
        let started = Utc::now();

        // Another instance may have run this occurrence between our listing
        // and our lock.
        let Some(mut job) = jobs.get_as::<ScheduledJob>(id.as_str()).await? else {
            return Ok(false);
        };
        let Some(due) = job.next_run.filter(|at| job.enabled && *at <= started) else {
            return Ok(false);
        };

        job.next_run = schedule::following_run(&job.schedule, job.anchor, started.max(due))?;
        job.last_run = Some(started);
        jobs.put(id.as_str(), &job, None).await?;

        let span = info_span!("job.execute", job = %id, handler = %job.handler);
        let clock = Instant::now();
        let result = tokio::select! {
            result = handler.run(job.clone()).instrument(span) => result,
            never = self.renew(id, held) => match never {},
        };
        let elapsed_ms = clock.elapsed().as_secs_f64() * 1000.0;
        metrics::operation_duration_ms()
            .record(elapsed_ms, &[KeyValue::new("operation", "scheduler.execute")]);

        self.record_outcome(id, &job, result).await?;
        Ok(true)
    }

    /// Renew the held lease forever. After a failed renewal it stops
    /// renewing but keeps pending, so the running handler is not cut short.
    async fn renew(&self, id: &JobId, held: &Mutex<Value>) -> std::convert::Infallible {
        let locks = self.locks();
        loop {
            tokio::time::sleep(self.inner.config.renew_every).await;
            let current = held.lock().unwrap_or_else(PoisonError::into_inner).clone();
            let renewed = match self.new_lock(id).and_then(|l| Ok(serde_json::to_value(l)?)) {
                Ok(v) => v,
                Err(e) => {
                    warn!(job = %id, error = %e, "cannot build renewed lock");
                    self.renewal_failed();
                    continue;
                }
            };
            match locks
                .compare_and_set(
                    id.as_str(),
                    &current,
                    Some(renewed.clone()),
                    Some(self.inner.config.lease),
                )
                .await
            {
                Ok(true) => {
                    *held.lock().unwrap_or_else(PoisonError::into_inner) = renewed;
                    self.health().renewal_failed_at = None;
                }
                Ok(false) => {
                    warn!(job = %id, "job lease lost before completion");
                    self.renewal_failed();
                    return std::future::pending().await;
                }
                Err(e) => {
                    warn!(job = %id, error = %e, "job lease renewal failed");
                    self.renewal_failed();
                }
            }
        }
    }

    fn renewal_failed(&self) {
        self.health().renewal_failed_at = Some(Instant::now());
    }

    fn new_lock(&self, id: &JobId) -> Result<SchedulerLock> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.inner.config.lease)
            .map_err(|e| Error::Config(format!("lease out of range: {e}")))?;
        Ok(SchedulerLock {
            job_id: id.clone(),
            owner: self.inner.config.instance_id.clone(),
            acquired_at: now,
            expires_at: now + lease,
        })
    }

    async fn record_outcome(&self, id: &JobId, ran: &ScheduledJob, result: Result<()>) -> Result<()> {
        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::job_executions().add(
            1,
            &[
                KeyValue::new("job", id.to_string()),
                KeyValue::new("outcome", outcome),
            ],
        );

        if ran.schedule.is_once() {
            if let Err(e) = &result {
                warn!(job = %id, error = %e, "one-time job failed");
            }
            self.jobs().delete(id.as_str()).await?;
            self.inner.store.index_remove(JOB_INDEX, id.as_str()).await?;
            self.local().remove(id);
            debug!(job = %id, "one-time job removed");
            return Ok(());
        }

        let jobs = self.jobs();
        let Some(mut job) = jobs.get_as::<ScheduledJob>(id.as_str()).await? else {
            return Ok(());
        };
        job.run_count += 1;
        match result {
            Ok(()) => {
                job.consecutive_failures = 0;
                debug!(job = %id, next_run = ?job.next_run, "job executed");
            }
            Err(e) => {
                job.fail_count += 1;
                job.consecutive_failures += 1;
                warn!(job = %id, error = %e, fail_count = job.fail_count, "job handler failed");
                if job
                    .max_failures
                    .is_some_and(|max| job.consecutive_failures >= max)
                {
                    job.enabled = false;
                    warn!(job = %id, "job disabled after repeated failures");
                }
            }
        }
        jobs.put(id.as_str(), &job, None).await
    }
}

/// Marks a job as executing on this instance until dropped.
struct Claim {
    id: JobId,
    inner: Arc<SchedulerInner>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.inner
            .executing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Log an execution outcome; true if the job ran here.
fn note_outcome(outcome: Result<bool>) -> bool {
    match outcome {
        Ok(ran) => ran,
        Err(e) if e.is_retryable() => {
            debug!(error = %e, "job skipped this cycle");
            false
        }
        Err(e) => {
            warn!(error = %e, "job execution bookkeeping failed");
            false
        }
    }
}

fn log_join(done: std::result::Result<(), JoinError>) {
    if let Err(e) = done {
        if !e.is_cancelled() {
            error!(error = %e, "job execution panicked");
        }
    }
}
