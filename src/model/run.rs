//! Flow runs, per-step state, and await registrations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::flow::{AwaitKind, TimeoutAction};

/// Newtype for run ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stream subject holding this run's events.
    pub fn subject(&self) -> String {
        format!("run:{}", self.0)
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle state of a run. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn can_transition_to(self, to: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(crate::error::Error::Validation(format!(
                "unknown run status: {s}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting for subscribed inputs.
    #[default]
    Pending,
    /// Suspended on an await registration.
    Awaiting,
    /// Dispatched; an invocation is queued or in flight.
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    /// The run cannot complete while any step is in flight.
    pub fn is_in_flight(self) -> bool {
        matches!(self, StepStatus::Awaiting | StepStatus::Running)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Awaiting => "awaiting",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Which side of the invocation an await guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitPhase {
    Before,
    After,
}

impl std::fmt::Display for AwaitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AwaitPhase::Before => write!(f, "before"),
            AwaitPhase::After => write!(f, "after"),
        }
    }
}

/// Per-step state within a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    /// Received `kind -> payload` pairs (last write wins per kind).
    pub received: BTreeMap<String, serde_json::Value>,
    /// Input the step was (or will be) invoked with.
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub invocations: u32,
    pub await_phase: Option<AwaitPhase>,
    /// Emits held back until an `await_after` resolves.
    #[serde(default)]
    pub held_emits: Vec<(String, serde_json::Value)>,
    /// Payload an `await_before` resumed the step with.
    #[serde(default)]
    pub resolution: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One execution of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRun {
    pub run_id: RunId,
    pub flow_name: String,
    pub status: RunStatus,
    pub payload: serde_json::Value,
    pub steps: BTreeMap<String, StepState>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl FlowRun {
    pub fn new<'a>(
        flow_name: &str,
        payload: serde_json::Value,
        step_names: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::new(),
            flow_name: flow_name.to_string(),
            status: RunStatus::Pending,
            payload,
            steps: step_names
                .into_iter()
                .map(|name| (name.to_string(), StepState::default()))
                .collect(),
            error: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Move to `to`, validating the state machine.
    pub fn transition(&mut self, to: RunStatus) -> crate::error::Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(crate::error::Error::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        let now = Utc::now();
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    pub fn step(&self, name: &str) -> Option<&StepState> {
        self.steps.get(name)
    }

    pub fn step_mut(&mut self, name: &str) -> &mut StepState {
        self.steps.entry(name.to_string()).or_default()
    }

    pub fn has_in_flight_steps(&self) -> bool {
        self.steps.values().any(|s| s.status.is_in_flight())
    }

    pub fn awaiting_steps(&self) -> impl Iterator<Item = &str> {
        self.steps_in(StepStatus::Awaiting)
    }

    pub fn running_steps(&self) -> impl Iterator<Item = &str> {
        self.steps_in(StepStatus::Running)
    }

    fn steps_in(&self, status: StepStatus) -> impl Iterator<Item = &str> {
        self.steps
            .iter()
            .filter(move |(_, s)| s.status == status)
            .map(|(name, _)| name.as_str())
    }
}

/// Claim on a dispatched step invocation. Its owner renews it while the
/// invocation is queued or running; once it lapses, any instance may take
/// the invocation over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationLease {
    pub run_id: RunId,
    pub step: String,
    pub owner: String,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl InvocationLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A suspension record for `(run_id, step)`. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwaitRegistration {
    pub run_id: RunId,
    pub flow_name: String,
    pub step: String,
    pub phase: AwaitPhase,
    pub kind: AwaitKind,
    /// Concrete webhook path, once the template is expanded.
    pub webhook_path: Option<String>,
    /// Scheduler job that resolves a time/schedule await.
    pub resolve_job: Option<String>,
    /// Scheduler job that fires the timeout.
    pub timeout_job: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub timeout_action: TimeoutAction,
    pub registered_at: DateTime<Utc>,
}

/// How a resolution attempt ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Resolution {
    /// This call consumed the registration and resumed the step.
    Resumed { run_id: RunId, step: String },
    /// No live registration: never existed, already resolved, timed out, or cancelled.
    NotFound,
}

impl Resolution {
    pub fn is_resumed(&self) -> bool {
        matches!(self, Resolution::Resumed { .. })
    }
}

/// A page of runs plus the total count for the listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPage {
    pub runs: Vec<FlowRun>,
    pub total: u64,
}
