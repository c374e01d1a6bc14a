//! Postgres adapter: connection pool, migrations, and the event store contract.
//!
//! Streams, indexes and key-value state live in the tables created by
//! `migrations/`. Appends publish a `NOTIFY` on a per-subject channel inside
//! the appending transaction, so listeners never see an uncommitted id.

pub mod events;
pub mod index;
pub mod kv;
pub mod listener;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::{Error, Result};
use crate::model::event::{EventRecord, IndexEntry, IndexRange, NewEvent, ReadOptions};
use crate::store::{KeyPattern, StoreAdapter, Transport};

/// Database handle. Owns the connection pool shared by every submodule.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(|e| Error::AdapterUnavailable(format!("connect failed: {e}")))?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl StoreAdapter for Db {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn health_check(&self) -> Result<()> {
        Db::health_check(self).await
    }

    async fn append(&self, subject: &str, event: NewEvent) -> Result<EventRecord> {
        self.append_event(subject, event).await
    }

    async fn read(&self, subject: &str, opts: &ReadOptions) -> Result<Vec<EventRecord>> {
        self.read_events(subject, opts).await
    }

    async fn count(&self, subject: &str) -> Result<u64> {
        self.count_events(subject).await
    }

    async fn delete_stream(&self, subject: &str) -> Result<()> {
        self.delete_events(subject).await
    }

    async fn index_write(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.write_index_member(key, member, score).await
    }

    async fn index_read(&self, key: &str, range: &IndexRange) -> Result<Vec<IndexEntry>> {
        self.read_index(key, range).await
    }

    async fn index_count(&self, key: &str) -> Result<u64> {
        self.count_index(key).await
    }

    async fn index_remove(&self, key: &str, member: &str) -> Result<()> {
        self.remove_index_member(key, member).await
    }

    async fn delete_index(&self, key: &str) -> Result<()> {
        self.drop_index(key).await
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Value>> {
        self.kv_fetch(key).await
    }

    async fn kv_set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.kv_upsert(key, value, ttl).await
    }

    async fn kv_delete(&self, key: &str) -> Result<bool> {
        self.kv_remove(key).await
    }

    async fn kv_clear(&self, pattern: &KeyPattern) -> Result<u64> {
        self.kv_remove_matching(pattern).await
    }

    async fn kv_increment(&self, key: &str, by: i64) -> Result<i64> {
        self.kv_add(key, by).await
    }

    async fn kv_set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.kv_insert_if_absent(key, value, ttl).await
    }

    async fn kv_compare_and_set(
        &self,
        key: &str,
        expected: &Value,
        value: Option<Value>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.kv_swap(key, expected, value, ttl).await
    }

    async fn kv_take(&self, key: &str) -> Result<Option<Value>> {
        self.kv_consume(key).await
    }

    fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(listener::PgTransport::start(self.pool.clone()))
    }
}
