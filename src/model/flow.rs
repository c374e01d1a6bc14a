//! Flow definitions: steps linked by emitted and subscribed event kinds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// A named DAG of steps. Topology only; handlers are bound separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    /// Keep the run alive when a step exhausts its retries.
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl FlowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            continue_on_failure: false,
        }
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn continue_on_failure(mut self, enabled: bool) -> Self {
        self.continue_on_failure = enabled;
        self
    }

    pub fn get_step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn entry_steps(&self) -> impl Iterator<Item = &StepSpec> {
        self.steps.iter().filter(|s| s.role == StepRole::Entry)
    }

    /// Steps subscribed to `kind`, in definition order.
    pub fn subscribers_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a StepSpec> {
        self.steps.iter().filter(move |s| s.subscribes.contains(kind))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRole {
    /// Invoked with the run's start payload.
    Entry,
    /// Invoked once every subscribed kind has arrived.
    #[default]
    Step,
}

impl std::fmt::Display for StepRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepRole::Entry => write!(f, "entry"),
            StepRole::Step => write!(f, "step"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    #[serde(default)]
    pub role: StepRole,
    #[serde(default)]
    pub emits: BTreeSet<String>,
    #[serde(default)]
    pub subscribes: BTreeSet<String>,
    #[serde(default)]
    pub await_before: Option<AwaitSpec>,
    #[serde(default)]
    pub await_after: Option<AwaitSpec>,
    /// Per-attempt execution timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl StepSpec {
    pub fn entry(name: impl Into<String>) -> Self {
        Self::with_role(name, StepRole::Entry)
    }

    pub fn step(name: impl Into<String>) -> Self {
        Self::with_role(name, StepRole::Step)
    }

    fn with_role(name: impl Into<String>, role: StepRole) -> Self {
        Self {
            name: name.into(),
            role,
            emits: BTreeSet::new(),
            subscribes: BTreeSet::new(),
            await_before: None,
            await_after: None,
            timeout_ms: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn emits<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.emits.extend(kinds.into_iter().map(Into::into));
        self
    }

    pub fn subscribes<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscribes.extend(kinds.into_iter().map(Into::into));
        self
    }

    pub fn await_before(mut self, spec: AwaitSpec) -> Self {
        self.await_before = Some(spec);
        self
    }

    pub fn await_after(mut self, spec: AwaitSpec) -> Self {
        self.await_after = Some(spec);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn is_join(&self) -> bool {
        self.subscribes.len() > 1
    }
}

/// A suspension point guarding a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwaitSpec {
    #[serde(flatten)]
    pub kind: AwaitKind,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub timeout_action: TimeoutAction,
}

impl AwaitSpec {
    /// Webhook await. `{runId}` and `{stepName}` in the path template are
    /// substituted at registration time.
    pub fn webhook(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self::of(AwaitKind::Webhook {
            method: method.into(),
            path: path.into(),
        })
    }

    pub fn schedule(cron: impl Into<String>) -> Self {
        Self::of(AwaitKind::Schedule {
            cron: cron.into(),
            timezone: None,
        })
    }

    pub fn time(delay: Duration) -> Self {
        Self::of(AwaitKind::Time {
            delay_ms: delay.as_millis() as u64,
        })
    }

    fn of(kind: AwaitKind) -> Self {
        Self {
            kind,
            timeout_ms: None,
            timeout_action: TimeoutAction::Fail,
        }
    }

    pub fn timeout(mut self, timeout: Duration, action: TimeoutAction) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self.timeout_action = action;
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AwaitKind {
    Webhook {
        #[serde(default = "default_method")]
        method: String,
        path: String,
    },
    Schedule {
        cron: String,
        #[serde(default)]
        timezone: Option<String>,
    },
    Time {
        delay_ms: u64,
    },
}

fn default_method() -> String {
    "POST".to_string()
}

impl AwaitKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            AwaitKind::Webhook { .. } => "webhook",
            AwaitKind::Schedule { .. } => "schedule",
            AwaitKind::Time { .. } => "time",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "action", content = "default", rename_all = "snake_case")]
pub enum TimeoutAction {
    #[default]
    Fail,
    /// Resume the step as if resolved with this payload.
    ContinueWithDefault(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay before attempt `next_attempt` (2-based: the first retry is attempt 2).
    pub fn delay_before(&self, next_attempt: u32) -> Duration {
        let retry_index = next_attempt.saturating_sub(2);
        match self.backoff {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { base_ms, max_ms } => {
                let factor = 2u64.saturating_pow(retry_index);
                Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed { delay_ms: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = RetryPolicy::attempts(5).with_backoff(Backoff::Exponential {
            base_ms: 100,
            max_ms: 300,
        });
        assert_eq!(policy.delay_before(2), Duration::from_millis(100));
        assert_eq!(policy.delay_before(3), Duration::from_millis(200));
        assert_eq!(policy.delay_before(4), Duration::from_millis(300));
    }

    #[test]
    fn await_spec_deserializes_from_toml_shape() {
        let spec: AwaitSpec = serde_json::from_value(serde_json::json!({
            "type": "webhook",
            "path": "/approve/{runId}/{stepName}",
            "timeout_ms": 5000,
            "timeout_action": { "action": "continue_with_default", "default": { "approved": false } }
        }))
        .unwrap();
        assert_eq!(
            spec.kind,
            AwaitKind::Webhook {
                method: "POST".to_string(),
                path: "/approve/{runId}/{stepName}".to_string()
            }
        );
        assert_eq!(
            spec.timeout_action,
            TimeoutAction::ContinueWithDefault(serde_json::json!({ "approved": false }))
        );
    }
}
