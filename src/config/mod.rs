//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on missing or malformed values.
//! The database URL is wrapped in `secrecy::SecretString` to keep it out of logs.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::{Error, Result};
use crate::flow::EngineConfig;
use crate::scheduler::SchedulerConfig;
use crate::store::StoreConfig;
use crate::telemetry::TelemetryConfig;

/// Which store adapter to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    File,
    Postgres,
}

impl FromStr for StoreKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreKind::Memory),
            "file" => Ok(StoreKind::File),
            "postgres" => Ok(StoreKind::Postgres),
            other => Err(Error::Config(format!(
                "FLOWQ_STORE must be memory, file or postgres, got '{other}'"
            ))),
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub store: StoreKind,
    pub store_dir: PathBuf,
    /// Present iff `store` is `Postgres`.
    pub database_url: Option<SecretString>,
    pub instance_id: String,
    pub worker_concurrency: usize,
    pub scheduler_tick: Duration,
    pub lock_lease: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from any variable source. `from_env` uses the process environment.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let store = match var("FLOWQ_STORE") {
            Some(s) => s.parse()?,
            None => StoreKind::Memory,
        };
        let database_url = match store {
            StoreKind::Postgres => Some(SecretString::from(var("DATABASE_URL").ok_or_else(
                || Error::Config("DATABASE_URL is required when FLOWQ_STORE=postgres".into()),
            )?)),
            _ => None,
        };
        let instance_id = var("FLOWQ_INSTANCE_ID").unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("instance-{}", &id[..8])
        });

        Ok(Self {
            store,
            store_dir: PathBuf::from(var("FLOWQ_STORE_DIR").unwrap_or_else(|| ".flowq".into())),
            database_url,
            instance_id,
            worker_concurrency: parsed(&var, "FLOWQ_WORKER_CONCURRENCY", 16)?,
            scheduler_tick: Duration::from_millis(parsed(&var, "FLOWQ_SCHEDULER_TICK_MS", 1000)?),
            lock_lease: Duration::from_millis(parsed(&var, "FLOWQ_LOCK_LEASE_MS", 30_000)?),
            otel_endpoint: var("OTEL_ENDPOINT").filter(|e| !e.is_empty()),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn store_config(&self) -> Result<StoreConfig> {
        Ok(match self.store {
            StoreKind::Memory => StoreConfig::Memory,
            StoreKind::File => StoreConfig::File(self.store_dir.clone()),
            StoreKind::Postgres => StoreConfig::Postgres(
                self.database_url
                    .clone()
                    .ok_or_else(|| Error::Config("DATABASE_URL is not set".into()))?,
            ),
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::new(self.instance_id.clone())
            .tick(self.scheduler_tick)
            .lease(self.lock_lease)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            worker_concurrency: self.worker_concurrency,
            run_lock_lease: self.lock_lease,
            invocation_lease: self.lock_lease,
        }
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            endpoint: self.otel_endpoint.clone(),
            log_level: self.log_level.clone(),
            ..TelemetryConfig::default()
        }
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw} is invalid: {e}"))),
    }
}
