//! Triggers: named sources that start flows or resolve awaits.
//!
//! Every firing is audited on the trigger's own `trigger:<name>` stream.
//! Counters live in the key-value layer so stats never scan that stream.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::flow::FlowEngine;
use crate::flow::engine::normalize_path;
use crate::model::event::{EventRecord, IndexRange, NewEvent, ReadOptions};
use crate::model::job::{JobId, NewJob, ScheduledJob};
use crate::model::run::{Resolution, RunId};
use crate::model::trigger::{
    HistoryQuery, Subscription, SubscriptionMode, Trigger, TriggerScope, TriggerSpec,
    TriggerStats, TriggerStatus, TriggerType,
};
use crate::scheduler::{JobHandler, Scheduler, schedule};
use crate::store::{EventStore, KvScope};
use crate::telemetry::metrics;

const TRIGGERS: &str = "triggers";
const TRIGGER_INDEX: &str = "triggers:all";
const SUBSCRIPTIONS: &str = "trigger-subscriptions";
const WEBHOOKS: &str = "trigger-webhooks";
const STATS: &str = "trigger-stats";

/// Scheduler handler firing schedule-type triggers.
pub const TRIGGER_HANDLER: &str = "flowq.trigger.emit";

/// What one emission did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmitReport {
    pub trigger: String,
    /// Id of the `trigger.fired` record.
    pub event_id: u64,
    pub runs_started: Vec<RunId>,
    pub resolution: Option<Resolution>,
    pub errors: Vec<String>,
}

/// How an inbound webhook call was handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Consumed a webhook await and resumed its step.
    Resumed { run_id: RunId, step: String },
    TriggerFired(EmitReport),
    /// The path exists but expects another method. Nothing was consumed.
    MethodNotAllowed { allowed: String },
    /// Unknown path, or an await that was already resolved or expired.
    NotFound,
}

#[derive(Debug, Serialize, Deserialize)]
struct WebhookBinding {
    trigger: String,
    method: String,
}

struct RegistryInner {
    store: EventStore,
    engine: FlowEngine,
    scheduler: Scheduler,
}

#[derive(Clone)]
pub struct TriggerRegistry {
    inner: Arc<RegistryInner>,
}

struct ScheduledEmit {
    registry: Weak<RegistryInner>,
}

#[async_trait]
impl JobHandler for ScheduledEmit {
    async fn run(&self, job: ScheduledJob) -> Result<()> {
        let Some(inner) = self.registry.upgrade() else {
            return Ok(());
        };
        let registry = TriggerRegistry { inner };
        let name = job
            .payload
            .get("trigger")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation(format!("job {} names no trigger", job.id)))?;
        let report = registry
            .emit_trigger(name, json!({ "scheduledAt": job.last_run, "jobId": job.id }))
            .await?;
        if report.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Other(report.errors.join("; ")))
        }
    }
}

impl TriggerRegistry {
    pub fn new(store: EventStore, engine: FlowEngine, scheduler: Scheduler) -> Self {
        let inner = Arc::new(RegistryInner {
            store,
            engine,
            scheduler,
        });
        inner.scheduler.register_handler(
            TRIGGER_HANDLER,
            Arc::new(ScheduledEmit {
                registry: Arc::downgrade(&inner),
            }),
        );
        Self { inner }
    }

    fn triggers(&self) -> KvScope {
        self.inner.store.kv(TRIGGERS)
    }

    fn subscriptions(&self) -> KvScope {
        self.inner.store.kv(SUBSCRIPTIONS)
    }

    fn webhooks(&self) -> KvScope {
        self.inner.store.kv(WEBHOOKS)
    }

    fn stats(&self) -> KvScope {
        self.inner.store.kv(STATS)
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Register (or redefine) a trigger.
    pub async fn define_trigger(&self, spec: TriggerSpec) -> Result<Trigger> {
        if spec.name.trim().is_empty() {
            return Err(Error::Validation("trigger name must not be empty".into()));
        }
        let now = Utc::now();
        let trigger = Trigger {
            name: spec.name.clone(),
            trigger_type: spec.trigger_type,
            scope: spec.scope,
            config: spec.config.clone(),
            registered_at: now,
            registered_by: spec.registered_by.clone(),
            last_activity_at: None,
            status: TriggerStatus::Active,
        };

        match spec.trigger_type {
            TriggerType::Manual => {}
            TriggerType::Webhook => {
                let (method, path) = webhook_config(&spec)?;
                self.webhooks()
                    .put(
                        &path,
                        &WebhookBinding {
                            trigger: spec.name.clone(),
                            method,
                        },
                        None,
                    )
                    .await?;
            }
            TriggerType::Schedule => {
                let job = schedule_job(&spec)?;
                self.inner.scheduler.schedule(job).await?;
            }
        }

        self.triggers().put(&trigger.name, &trigger, None).await?;
        self.inner
            .store
            .index_write(TRIGGER_INDEX, &trigger.name, now.timestamp_millis() as f64)
            .await?;
        info!(trigger = %trigger.name, kind = %trigger.trigger_type, "trigger defined");
        Ok(trigger)
    }

    pub async fn get_trigger(&self, name: &str) -> Result<Option<Trigger>> {
        let Some(mut trigger) = self.triggers().get_as::<Trigger>(name).await? else {
            return Ok(None);
        };
        trigger.last_activity_at = self.last_activity(name).await?;
        Ok(Some(trigger))
    }

    async fn require_trigger(&self, name: &str) -> Result<Trigger> {
        self.get_trigger(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("trigger '{name}'")))
    }

    /// All triggers in registration order.
    pub async fn get_all_triggers(&self) -> Result<Vec<Trigger>> {
        let mut out = Vec::new();
        for entry in self
            .inner
            .store
            .index_read(TRIGGER_INDEX, &IndexRange::all())
            .await?
        {
            if let Some(trigger) = self.get_trigger(&entry.member).await? {
                out.push(trigger);
            }
        }
        Ok(out)
    }

    pub async fn set_status(&self, name: &str, status: TriggerStatus) -> Result<Trigger> {
        let mut trigger = self.require_trigger(name).await?;
        trigger.status = status;
        self.triggers().put(name, &trigger, None).await?;
        Ok(trigger)
    }

    /// Remove a trigger, its subscriptions, webhook binding and schedule.
    /// The audit stream is kept.
    pub async fn remove_trigger(&self, name: &str) -> Result<bool> {
        let Some(trigger) = self.get_trigger(name).await? else {
            return Ok(false);
        };
        match trigger.trigger_type {
            TriggerType::Webhook => {
                if let Some(path) = trigger.config.get("path").and_then(Value::as_str) {
                    self.webhooks().delete(&normalize_path(path)).await?;
                }
            }
            TriggerType::Schedule => {
                self.inner.scheduler.unschedule(&trigger_job_id(name)).await?;
            }
            TriggerType::Manual => {}
        }
        let subscriptions = self.subscriptions();
        for subscription in self.get_subscribed_flows(name).await? {
            subscriptions
                .delete(&subscription_key(name, &subscription.flow))
                .await?;
        }
        self.inner.store.delete_index(&subscriptions_index(name)).await?;
        self.inner.store.index_remove(TRIGGER_INDEX, name).await?;
        self.triggers().delete(name).await?;
        info!(trigger = name, "trigger removed");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Map a trigger to a registered flow. Idempotent; the latest mode wins.
    pub async fn subscribe(&self, subscription: Subscription) -> Result<()> {
        self.require_trigger(&subscription.trigger).await?;
        self.inner.engine.flow_graph(&subscription.flow)?;
        self.subscriptions()
            .put(
                &subscription_key(&subscription.trigger, &subscription.flow),
                &subscription,
                None,
            )
            .await?;
        self.inner
            .store
            .index_write(
                &subscriptions_index(&subscription.trigger),
                &subscription.flow,
                Utc::now().timestamp_millis() as f64,
            )
            .await?;
        debug!(trigger = %subscription.trigger, flow = %subscription.flow, "flow subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, trigger: &str, flow: &str) -> Result<bool> {
        let existed = self
            .subscriptions()
            .delete(&subscription_key(trigger, flow))
            .await?;
        self.inner
            .store
            .index_remove(&subscriptions_index(trigger), flow)
            .await?;
        Ok(existed)
    }

    pub async fn get_subscribed_flows(&self, trigger: &str) -> Result<Vec<Subscription>> {
        let subscriptions = self.subscriptions();
        let mut out = Vec::new();
        for entry in self
            .inner
            .store
            .index_read(&subscriptions_index(trigger), &IndexRange::all())
            .await?
        {
            if let Some(s) = subscriptions
                .get_as::<Subscription>(&subscription_key(trigger, &entry.member))
                .await?
            {
                out.push(s);
            }
        }
        Ok(out)
    }

    pub async fn get_all_subscriptions(&self) -> Result<Vec<Subscription>> {
        let mut out = Vec::new();
        for trigger in self.get_all_triggers().await? {
            out.extend(self.get_subscribed_flows(&trigger.name).await?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Firing
    // -----------------------------------------------------------------------

    /// Fire a trigger: audit it, then start subscribed flows (flow scope) or
    /// resolve the await named by `data.runId` / `data.stepName` (run scope).
    pub async fn emit_trigger(&self, name: &str, data: Value) -> Result<EmitReport> {
        let trigger = self.require_trigger(name).await?;
        if trigger.status == TriggerStatus::Disabled {
            return Err(Error::Validation(format!("trigger '{name}' is disabled")));
        }
        let fired = self.audit(name, "trigger.fired", json!({ "data": data })).await?;
        self.bump(name, "fired").await?;
        metrics::trigger_emissions().add(
            1,
            &[
                KeyValue::new("trigger", name.to_string()),
                KeyValue::new("type", trigger.trigger_type.to_string()),
            ],
        );

        let mut report = EmitReport {
            trigger: name.to_string(),
            event_id: fired.id,
            ..EmitReport::default()
        };
        let subscribed: Vec<Subscription> = self
            .get_subscribed_flows(name)
            .await?
            .into_iter()
            .filter(|s| s.mode == SubscriptionMode::Auto)
            .collect();

        match trigger.scope {
            TriggerScope::Flow => {
                for subscription in subscribed {
                    match self.inner.engine.start_flow(&subscription.flow, data.clone()).await {
                        Ok(run) => {
                            self.audit(
                                name,
                                "trigger.flow_started",
                                json!({ "flow": subscription.flow, "runId": run.run_id }),
                            )
                            .await?;
                            self.bump(name, "flows_started").await?;
                            report.runs_started.push(run.run_id);
                        }
                        Err(e) => {
                            self.record_error(name, &mut report, &subscription.flow, &e)
                                .await?;
                        }
                    }
                }
            }
            TriggerScope::Run => {
                let resolution = match self.resolve_from(&data, &subscribed).await {
                    Ok(resolution) => resolution,
                    Err(e) => {
                        self.record_error(name, &mut report, "", &e).await?;
                        Resolution::NotFound
                    }
                };
                if let Resolution::Resumed { run_id, step } = &resolution {
                    self.audit(
                        name,
                        "trigger.await_resolved",
                        json!({ "runId": run_id, "step": step }),
                    )
                    .await?;
                    self.bump(name, "awaits_resolved").await?;
                }
                report.resolution = Some(resolution);
            }
        }
        Ok(report)
    }

    /// Resolve the await a run-scope emission points at.
    async fn resolve_from(&self, data: &Value, subscribed: &[Subscription]) -> Result<Resolution> {
        let run_id = data
            .get("runId")
            .and_then(Value::as_str)
            .map(RunId::from)
            .ok_or_else(|| Error::Validation("run-scope emit needs a runId".into()))?;
        let Some(run) = self.inner.engine.get_run(&run_id).await? else {
            return Ok(Resolution::NotFound);
        };
        if !subscribed.iter().any(|s| s.flow == run.flow_name) {
            return Err(Error::Validation(format!(
                "flow '{}' is not subscribed to this trigger",
                run.flow_name
            )));
        }
        let step = match data.get("stepName").and_then(Value::as_str) {
            Some(step) => step.to_string(),
            None => match self.inner.engine.pending_awaits(&run_id).await?.into_iter().next() {
                Some(registration) => registration.step,
                None => return Ok(Resolution::NotFound),
            },
        };
        self.inner.engine.resolve_await(&run_id, &step, data.clone()).await
    }

    /// Route an inbound webhook call: await paths first, then webhook triggers.
    pub async fn handle_webhook(&self, method: &str, path: &str, body: Value) -> Result<WebhookOutcome> {
        let path = normalize_path(path);

        if let Some(route) = self.inner.engine.webhook_route(&path).await? {
            if route.method != method {
                return Ok(WebhookOutcome::MethodNotAllowed {
                    allowed: route.method,
                });
            }
            return Ok(
                match self
                    .inner
                    .engine
                    .resolve_await(&route.run_id, &route.step, body)
                    .await?
                {
                    Resolution::Resumed { run_id, step } => WebhookOutcome::Resumed { run_id, step },
                    Resolution::NotFound => WebhookOutcome::NotFound,
                },
            );
        }

        if let Some(binding) = self.webhooks().get_as::<WebhookBinding>(&path).await? {
            if binding.method != method {
                return Ok(WebhookOutcome::MethodNotAllowed {
                    allowed: binding.method,
                });
            }
            let report = self.emit_trigger(&binding.trigger, body).await?;
            return Ok(WebhookOutcome::TriggerFired(report));
        }

        debug!(method, path = %path, "webhook matched nothing");
        Ok(WebhookOutcome::NotFound)
    }

    // -----------------------------------------------------------------------
    // Stats and history
    // -----------------------------------------------------------------------

    pub async fn get_trigger_stats(&self, name: &str) -> Result<TriggerStats> {
        self.require_trigger(name).await?;
        let stats = self.stats();
        let counter = |value: Option<Value>| value.and_then(|v| v.as_i64()).unwrap_or(0);
        Ok(TriggerStats {
            fired: counter(stats.get(&stat_key(name, "fired")).await?),
            flows_started: counter(stats.get(&stat_key(name, "flows_started")).await?),
            awaits_resolved: counter(stats.get(&stat_key(name, "awaits_resolved")).await?),
            errors: counter(stats.get(&stat_key(name, "errors")).await?),
            total_events: self.inner.store.count(&Trigger::subject(name)).await?,
            last_activity_at: self.last_activity(name).await?,
        })
    }

    /// Newest-first audit records, filtered by kind and capped at `query.limit`.
    pub async fn get_trigger_history(&self, name: &str, query: &HistoryQuery) -> Result<Vec<EventRecord>> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        let page = query.limit.clamp(1, 100);
        let mut records = Box::pin(
            self.inner
                .store
                .stream(&Trigger::subject(name), ReadOptions::backward(page)),
        );
        let mut out = Vec::new();
        while let Some(record) = records.next().await {
            let record = record?;
            if query.kinds.is_empty() || query.kinds.contains(&record.kind) {
                out.push(record);
                if out.len() == query.limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn audit(&self, name: &str, kind: &str, payload: Value) -> Result<EventRecord> {
        let record = self
            .inner
            .store
            .append(&Trigger::subject(name), NewEvent::new(kind, payload))
            .await?;
        self.stats()
            .put(&stat_key(name, "last_activity"), &record.timestamp, None)
            .await?;
        Ok(record)
    }

    async fn bump(&self, name: &str, counter: &str) -> Result<()> {
        self.stats().increment(&stat_key(name, counter), 1).await?;
        Ok(())
    }

    async fn record_error(&self, name: &str, report: &mut EmitReport, flow: &str, error: &Error) -> Result<()> {
        warn!(trigger = name, flow, error = %error, "trigger emission failed");
        self.audit(
            name,
            "trigger.error",
            json!({ "flow": flow, "error": error.to_string() }),
        )
        .await?;
        self.bump(name, "errors").await?;
        report.errors.push(error.to_string());
        Ok(())
    }

    async fn last_activity(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        self.stats().get_as(&stat_key(name, "last_activity")).await
    }
}

fn webhook_config(spec: &TriggerSpec) -> Result<(String, String)> {
    let path = spec
        .config
        .get("path")
        .and_then(Value::as_str)
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| Error::Validation(format!("webhook trigger '{}' needs a path", spec.name)))?;
    let method = spec
        .config
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("POST");
    Ok((method.to_string(), normalize_path(path)))
}

fn schedule_job(spec: &TriggerSpec) -> Result<NewJob> {
    let id = trigger_job_id(&spec.name);
    let payload = json!({ "trigger": spec.name });
    let config = &spec.config;
    let job = if let Some(cron) = config.get("cron").and_then(Value::as_str) {
        let timezone = config.get("timezone").and_then(Value::as_str);
        schedule::parse_cron(cron)?;
        schedule::parse_timezone(timezone)?;
        let job = NewJob::cron(id.as_str(), TRIGGER_HANDLER, cron);
        match timezone {
            Some(tz) => job.timezone(tz),
            None => job,
        }
    } else if let Some(every) = config.get("interval_ms").and_then(Value::as_u64) {
        NewJob::interval(
            id.as_str(),
            TRIGGER_HANDLER,
            std::time::Duration::from_millis(every),
        )
    } else {
        return Err(Error::Validation(format!(
            "schedule trigger '{}' needs a cron or interval_ms",
            spec.name
        )));
    };
    Ok(job.id(id).payload(payload))
}

fn trigger_job_id(name: &str) -> JobId {
    JobId::from(Trigger::subject(name))
}

fn subscriptions_index(trigger: &str) -> String {
    format!("trigger:{trigger}:subscriptions")
}

fn subscription_key(trigger: &str, flow: &str) -> String {
    format!("{trigger}/{flow}")
}

fn stat_key(name: &str, counter: &str) -> String {
    format!("{name}/{counter}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_triggers_need_a_cadence() {
        let spec = TriggerSpec {
            config: json!({}),
            ..TriggerSpec::schedule("nightly", "0 3 * * *")
        };
        assert!(matches!(schedule_job(&spec), Err(Error::Validation(_))));

        let bad_cron = TriggerSpec::schedule("nightly", "whenever");
        assert!(schedule_job(&bad_cron).is_err());

        let ok = TriggerSpec::schedule("nightly", "0 3 * * *");
        assert!(schedule_job(&ok).is_ok());
    }

    #[test]
    fn webhook_paths_are_normalized_and_method_defaults_to_post() {
        let spec = TriggerSpec {
            config: json!({ "path": "hooks/deploy/" }),
            ..TriggerSpec::webhook("deploy", "PUT", "/x")
        };
        assert_eq!(
            webhook_config(&spec).unwrap(),
            ("POST".to_string(), "/hooks/deploy".to_string())
        );
    }
}
