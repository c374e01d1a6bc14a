//! Scheduled jobs and the leases that guard their execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Newtype for job ids. Derived from the job name unless given explicitly,
/// so identical registrations on several instances share one persisted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSchedule {
    /// Field-based cron (5, 6 or 7 fields) evaluated in `timezone` (IANA, default UTC).
    Cron {
        expression: String,
        #[serde(default)]
        timezone: Option<String>,
    },
    /// Fixed cadence anchored at the job's `anchor`.
    Interval { every_ms: u64 },
    /// Fires once at `at`, then the job is removed.
    Once { at: DateTime<Utc> },
}

impl JobSchedule {
    pub fn type_name(&self) -> &'static str {
        match self {
            JobSchedule::Cron { .. } => "cron",
            JobSchedule::Interval { .. } => "interval",
            JobSchedule::Once { .. } => "one-time",
        }
    }

    pub fn is_once(&self) -> bool {
        matches!(self, JobSchedule::Once { .. })
    }
}

/// A persisted job definition plus its run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: JobId,
    pub name: String,
    pub schedule: JobSchedule,
    /// Name of the handler registered on each instance.
    pub handler: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub enabled: bool,
    /// Disable the job after this many consecutive failures.
    #[serde(default)]
    pub max_failures: Option<u32>,
    /// Fixed epoch interval occurrences are computed from.
    pub anchor: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub fail_count: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
}

/// Builder for registering a job. The scheduler's public API for new jobs.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) id: Option<JobId>,
    pub(crate) name: String,
    pub(crate) schedule: JobSchedule,
    pub(crate) handler: String,
    pub(crate) payload: serde_json::Value,
    pub(crate) enabled: bool,
    pub(crate) max_failures: Option<u32>,
}

impl NewJob {
    pub fn new(name: impl Into<String>, handler: impl Into<String>, schedule: JobSchedule) -> Self {
        Self {
            id: None,
            name: name.into(),
            schedule,
            handler: handler.into(),
            payload: serde_json::Value::Null,
            enabled: true,
            max_failures: None,
        }
    }

    pub fn cron(
        name: impl Into<String>,
        handler: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            handler,
            JobSchedule::Cron {
                expression: expression.into(),
                timezone: None,
            },
        )
    }

    pub fn interval(
        name: impl Into<String>,
        handler: impl Into<String>,
        every: std::time::Duration,
    ) -> Self {
        Self::new(
            name,
            handler,
            JobSchedule::Interval {
                every_ms: every.as_millis() as u64,
            },
        )
    }

    pub fn once(name: impl Into<String>, handler: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::new(name, handler, JobSchedule::Once { at })
    }

    pub fn id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn timezone(mut self, tz: impl Into<String>) -> Self {
        if let JobSchedule::Cron { timezone, .. } = &mut self.schedule {
            *timezone = Some(tz.into());
        }
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn max_failures(mut self, n: u32) -> Self {
        self.max_failures = Some(n);
        self
    }
}

/// Cross-instance lease on a job. Exists only while the job is claimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerLock {
    pub job_id: JobId,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
