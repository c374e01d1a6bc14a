//! Flow execution: step handlers, graph analysis, catalog loading, and the engine.

pub mod catalog;
pub mod dispatch;
pub mod engine;
pub mod graph;

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::flow::FlowDefinition;
use crate::model::run::RunId;

pub use catalog::FlowCatalog;
pub use dispatch::QueueStats;
pub use engine::{EngineConfig, FlowEngine};
pub use graph::FlowGraph;

/// User code bound to one step.
///
/// Invoked at least once per activation; retries call it again with the same
/// input, so side effects should be idempotent.
#[async_trait]
pub trait StepHandler: Send + Sync + 'static {
    async fn call(&self, ctx: StepContext, input: Value) -> Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, ctx: StepContext, input: Value) -> Result<Value> {
        (self.0)(ctx, input).await
    }
}

/// Adapt an async closure into a [`StepHandler`].
pub fn step_fn<F, Fut>(f: F) -> Arc<dyn StepHandler>
where
    F: Fn(StepContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// What a handler sees about the invocation it is serving.
#[derive(Clone)]
pub struct StepContext {
    run_id: RunId,
    flow_name: String,
    step_name: String,
    attempt: u32,
    resolution: Option<Value>,
    allowed: Arc<BTreeSet<String>>,
    emitted: Arc<Mutex<Vec<(String, Value)>>>,
}

impl StepContext {
    pub(crate) fn new(
        run_id: RunId,
        flow_name: &str,
        step_name: &str,
        attempt: u32,
        resolution: Option<Value>,
        allowed: Arc<BTreeSet<String>>,
    ) -> Self {
        Self {
            run_id,
            flow_name: flow_name.to_string(),
            step_name: step_name.to_string(),
            attempt,
            resolution,
            allowed,
            emitted: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Payload of the `await_before` resolution that released this step.
    pub fn resolution(&self) -> Option<&Value> {
        self.resolution.as_ref()
    }

    /// Queue an event for routing. Delivered only if this attempt succeeds.
    pub fn emit(&self, kind: &str, payload: Value) -> Result<()> {
        if !self.allowed.contains(kind) {
            return Err(Error::Validation(format!(
                "step '{}' may not emit '{kind}'",
                self.step_name
            )));
        }
        self.emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind.to_string(), payload));
        Ok(())
    }

    pub(crate) fn take_emits(&self) -> Vec<(String, Value)> {
        std::mem::take(&mut *self.emitted.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// A flow topology plus the handlers bound to its steps.
pub struct FlowRegistration {
    pub definition: FlowDefinition,
    pub handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl FlowRegistration {
    pub fn new(definition: FlowDefinition) -> Self {
        Self {
            definition,
            handlers: HashMap::new(),
        }
    }

    pub fn on(mut self, step: &str, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.insert(step.to_string(), handler);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_rejects_undeclared_kinds() {
        let allowed = Arc::new(BTreeSet::from(["start.completed".to_string()]));
        let ctx = StepContext::new(RunId::new(), "order-flow", "start", 1, None, allowed);
        ctx.emit("start.completed", Value::Null).unwrap();
        assert!(matches!(
            ctx.emit("ship.completed", Value::Null),
            Err(Error::Validation(_))
        ));
        assert_eq!(ctx.take_emits().len(), 1);
        assert!(ctx.take_emits().is_empty());
    }
}
