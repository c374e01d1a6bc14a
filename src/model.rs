//! Core data model.
//!
//! Flows are DAGs of steps linked by event kinds. A run is one execution of a
//! flow; every run, trigger and job writes its history to the event store.

pub mod event;
pub mod flow;
pub mod job;
pub mod run;
pub mod trigger;

pub use event::{Direction, EventRecord, IndexEntry, IndexRange, NewEvent, ReadOptions};
pub use flow::{
    AwaitKind, AwaitSpec, Backoff, FlowDefinition, RetryPolicy, StepRole, StepSpec, TimeoutAction,
};
pub use job::{JobId, JobSchedule, NewJob, ScheduledJob, SchedulerLock};
pub use run::{
    AwaitPhase, AwaitRegistration, FlowRun, Resolution, RunId, RunPage, RunStatus, StepState,
    StepStatus,
};
pub use trigger::{
    HistoryQuery, Subscription, SubscriptionMode, Trigger, TriggerScope, TriggerSpec,
    TriggerStats, TriggerStatus, TriggerType,
};
