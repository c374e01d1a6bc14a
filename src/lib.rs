//! # flowq
//!
//! Flow orchestration runtime: append-only event streams, step DAGs joined
//! by event kinds, awaits resolved by webhooks or time, a distributed
//! scheduler, and triggers that start flows.
//!
//! Services are built explicitly and passed around:
//!
//! ```no_run
//! # async fn demo() -> flowq::error::Result<()> {
//! use flowq::flow::{EngineConfig, FlowEngine};
//! use flowq::scheduler::{Scheduler, SchedulerConfig};
//! use flowq::store::{StoreConfig, connect};
//! use flowq::trigger::TriggerRegistry;
//!
//! let store = connect(&StoreConfig::Memory).await?;
//! let scheduler = Scheduler::new(store.clone(), SchedulerConfig::new("instance-a"));
//! let engine = FlowEngine::new(store.clone(), scheduler.clone(), EngineConfig::default());
//! let triggers = TriggerRegistry::new(store, engine.clone(), scheduler.clone());
//! scheduler.start();
//! # let _ = triggers;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod flow;
pub mod model;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod trigger;
