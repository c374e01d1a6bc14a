//! Triggers and the subscriptions that map them to flows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Webhook,
    Schedule,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerType::Manual => write!(f, "manual"),
            TriggerType::Webhook => write!(f, "webhook"),
            TriggerType::Schedule => write!(f, "schedule"),
        }
    }
}

/// Whether a firing starts new runs or resolves awaits of existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerScope {
    #[default]
    Flow,
    Run,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Active,
    Disabled,
}

/// Definition handed to `define_trigger`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub scope: TriggerScope,
    /// Type-specific settings: `{method, path}` for webhooks,
    /// `{cron, timezone?}` or `{interval_ms}` for schedules.
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub registered_by: Option<String>,
}

impl TriggerSpec {
    pub fn manual(name: impl Into<String>) -> Self {
        Self::of(name, TriggerType::Manual, serde_json::Value::Null)
    }

    pub fn webhook(name: impl Into<String>, method: &str, path: &str) -> Self {
        Self::of(
            name,
            TriggerType::Webhook,
            serde_json::json!({ "method": method, "path": path }),
        )
    }

    pub fn schedule(name: impl Into<String>, cron: &str) -> Self {
        Self::of(
            name,
            TriggerType::Schedule,
            serde_json::json!({ "cron": cron }),
        )
    }

    fn of(name: impl Into<String>, trigger_type: TriggerType, config: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            trigger_type,
            scope: TriggerScope::Flow,
            config,
            registered_by: None,
        }
    }

    pub fn scope(mut self, scope: TriggerScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn registered_by(mut self, who: impl Into<String>) -> Self {
        self.registered_by = Some(who.into());
        self
    }
}

/// A registered trigger with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub name: String,
    pub trigger_type: TriggerType,
    pub scope: TriggerScope,
    pub config: serde_json::Value,
    pub registered_at: DateTime<Utc>,
    pub registered_by: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub status: TriggerStatus,
}

impl Trigger {
    /// Stream subject for this trigger's audit log.
    pub fn subject(name: &str) -> String {
        format!("trigger:{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// Firing starts the flow.
    #[default]
    Auto,
    /// Listed for discovery but not started automatically.
    Manual,
}

/// Maps a trigger to a flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub trigger: String,
    pub flow: String,
    #[serde(default)]
    pub mode: SubscriptionMode,
}

impl Subscription {
    pub fn new(trigger: impl Into<String>, flow: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            flow: flow.into(),
            mode: SubscriptionMode::Auto,
        }
    }

    pub fn manual(mut self) -> Self {
        self.mode = SubscriptionMode::Manual;
        self
    }
}

/// Counters derived for a trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerStats {
    pub fired: i64,
    pub flows_started: i64,
    pub awaits_resolved: i64,
    pub errors: i64,
    pub total_events: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Filter for trigger history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    pub limit: usize,
    /// Restrict to these event kinds; empty means all.
    pub kinds: Vec<String>,
}

impl HistoryQuery {
    pub fn latest(limit: usize) -> Self {
        Self {
            limit,
            kinds: Vec::new(),
        }
    }

    pub fn kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kinds = kinds.into_iter().map(Into::into).collect();
        self
    }
}
