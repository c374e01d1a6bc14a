//! Event store: append-only per-subject logs, sorted indexes, scoped
//! key-value state, and change notification.
//!
//! Adapters implement [`StoreAdapter`]; everything else talks to the
//! [`EventStore`] service, which owns one adapter and one notification
//! gateway. The adapter is picked once by [`connect`].

pub mod file;
pub mod gateway;
pub mod memory;
pub mod pattern;

use async_trait::async_trait;
use futures::Stream;
use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::event::{EventRecord, IndexEntry, IndexRange, NewEvent, ReadOptions};
use crate::telemetry::metrics;

pub use file::FileStore;
pub use gateway::Subscription;
pub use memory::MemoryStore;
pub use pattern::KeyPattern;

/// Announcement that `(subject, id)` was appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub subject: String,
    pub id: u64,
}

/// The low-level change feed an adapter offers. One per gateway.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start delivering notices for `subject`. Idempotent.
    async fn listen(&self, subject: &str) -> Result<()>;
    /// Stop delivering notices for `subject`. Idempotent.
    async fn unlisten(&self, subject: &str) -> Result<()>;
    /// Next notice for a listened subject; `None` once the feed is closed.
    async fn recv(&self) -> Option<Notice>;
}

/// Contract every backing store implements. Keys are fully qualified.
#[async_trait]
pub trait StoreAdapter: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn health_check(&self) -> Result<()>;

    /// Append with the next id for `subject`, then notify.
    async fn append(&self, subject: &str, event: NewEvent) -> Result<EventRecord>;
    async fn read(&self, subject: &str, opts: &ReadOptions) -> Result<Vec<EventRecord>>;
    async fn count(&self, subject: &str) -> Result<u64>;
    async fn delete_stream(&self, subject: &str) -> Result<()>;

    async fn index_write(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn index_read(&self, key: &str, range: &IndexRange) -> Result<Vec<IndexEntry>>;
    async fn index_count(&self, key: &str) -> Result<u64>;
    async fn index_remove(&self, key: &str, member: &str) -> Result<()>;
    async fn delete_index(&self, key: &str) -> Result<()>;

    async fn kv_get(&self, key: &str) -> Result<Option<Value>>;
    async fn kv_set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;
    /// Returns whether a live entry was removed.
    async fn kv_delete(&self, key: &str) -> Result<bool>;
    /// Delete every key matching `pattern`; returns how many went.
    async fn kv_clear(&self, pattern: &KeyPattern) -> Result<u64> {
        let _ = pattern;
        Err(Error::UnsupportedOperation {
            adapter: self.name(),
            operation: "kv_clear",
        })
    }
    async fn kv_increment(&self, key: &str, by: i64) -> Result<i64>;
    /// Write only if the key is absent or expired.
    async fn kv_set_if_absent(&self, key: &str, value: Value, ttl: Option<Duration>)
    -> Result<bool>;
    /// Replace (or delete, when `value` is `None`) only if the live value equals `expected`.
    async fn kv_compare_and_set(
        &self,
        key: &str,
        expected: &Value,
        value: Option<Value>,
        ttl: Option<Duration>,
    ) -> Result<bool>;
    /// Atomically read and delete a live entry.
    async fn kv_take(&self, key: &str) -> Result<Option<Value>>;

    /// Open this process's change feed.
    fn transport(&self) -> Arc<dyn Transport>;
}

/// Which adapter to run on.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    Memory,
    File(PathBuf),
    Postgres(secrecy::SecretString),
}

/// Build the configured adapter and wrap it in an [`EventStore`].
pub async fn connect(config: &StoreConfig) -> Result<EventStore> {
    use secrecy::ExposeSecret;

    let adapter: Arc<dyn StoreAdapter> = match config {
        StoreConfig::Memory => Arc::new(MemoryStore::new()),
        StoreConfig::File(dir) => Arc::new(FileStore::open(dir).await?),
        StoreConfig::Postgres(url) => {
            let db = crate::db::Db::connect(url.expose_secret()).await?;
            db.migrate().await?;
            Arc::new(db)
        }
    };
    Ok(EventStore::new(adapter))
}

/// The event store service. Cheap to clone; clones share one gateway.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    adapter: Arc<dyn StoreAdapter>,
    gateway: gateway::Gateway,
}

impl EventStore {
    /// Wrap an adapter. Must be called inside a tokio runtime: the gateway's
    /// dispatch task starts here and stops when the last clone is dropped.
    pub fn new(adapter: Arc<dyn StoreAdapter>) -> Self {
        let gateway = gateway::Gateway::start(Arc::clone(&adapter));
        Self {
            inner: Arc::new(StoreInner { adapter, gateway }),
        }
    }

    /// A store on a fresh in-memory adapter.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn adapter(&self) -> &Arc<dyn StoreAdapter> {
        &self.inner.adapter
    }

    pub fn adapter_name(&self) -> &'static str {
        self.inner.adapter.name()
    }

    pub async fn health_check(&self) -> Result<()> {
        self.inner.adapter.health_check().await
    }

    // -----------------------------------------------------------------------
    // Streams
    // -----------------------------------------------------------------------

    pub async fn append(&self, subject: &str, event: NewEvent) -> Result<EventRecord> {
        if subject.is_empty() {
            return Err(Error::Validation("event subject must not be empty".into()));
        }
        let record = self.inner.adapter.append(subject, event).await?;
        debug!(subject, id = record.id, kind = %record.kind, "event appended");
        metrics::events_appended().add(
            1,
            &[
                KeyValue::new("adapter", self.adapter_name()),
                KeyValue::new("kind", record.kind.clone()),
            ],
        );
        Ok(record)
    }

    /// One page of records.
    pub async fn read(&self, subject: &str, opts: &ReadOptions) -> Result<Vec<EventRecord>> {
        self.inner.adapter.read(subject, opts).await
    }

    /// Every record on the requested side of the cursor, fetched lazily one
    /// page (`opts.limit` records) at a time.
    pub fn stream(
        &self,
        subject: &str,
        opts: ReadOptions,
    ) -> impl Stream<Item = Result<EventRecord>> + Send + 'static {
        use futures::StreamExt;

        let adapter = Arc::clone(&self.inner.adapter);
        let subject = subject.to_string();
        let page_size = opts.limit.max(1);
        let first = ReadOptions {
            limit: page_size,
            ..opts
        };

        futures::stream::unfold(Some(first), move |cursor| {
            let adapter = Arc::clone(&adapter);
            let subject = subject.clone();
            async move {
                let opts = cursor?;
                match adapter.read(&subject, &opts).await {
                    Ok(page) => {
                        let next = if page.len() < opts.limit {
                            None
                        } else {
                            page.last().map(|last| opts.after(last.id))
                        };
                        Some((Ok(page), next))
                    }
                    Err(e) => Some((Err(e), None)),
                }
            }
        })
        .flat_map(|page: Result<Vec<EventRecord>>| {
            let items: Vec<Result<EventRecord>> = match page {
                Ok(records) => records.into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            futures::stream::iter(items)
        })
    }

    pub async fn count(&self, subject: &str) -> Result<u64> {
        self.inner.adapter.count(subject).await
    }

    /// Irreversibly drop a subject's log.
    pub async fn delete_stream(&self, subject: &str) -> Result<()> {
        self.inner.adapter.delete_stream(subject).await
    }

    // -----------------------------------------------------------------------
    // Sorted indexes
    // -----------------------------------------------------------------------

    pub async fn index_write(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.inner.adapter.index_write(key, member, score).await
    }

    pub async fn index_read(&self, key: &str, range: &IndexRange) -> Result<Vec<IndexEntry>> {
        self.inner.adapter.index_read(key, range).await
    }

    pub async fn index_count(&self, key: &str) -> Result<u64> {
        self.inner.adapter.index_count(key).await
    }

    pub async fn index_remove(&self, key: &str, member: &str) -> Result<()> {
        self.inner.adapter.index_remove(key, member).await
    }

    pub async fn delete_index(&self, key: &str) -> Result<()> {
        self.inner.adapter.delete_index(key).await
    }

    // -----------------------------------------------------------------------
    // Key-value
    // -----------------------------------------------------------------------

    /// Key-value access confined to `namespace`.
    pub fn kv(&self, namespace: &str) -> KvScope {
        KvScope {
            adapter: Arc::clone(&self.inner.adapter),
            namespace: namespace.to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Notification
    // -----------------------------------------------------------------------

    /// Deliver records appended to `subject` from now on.
    pub async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        self.inner.gateway.subscribe(subject, None).await
    }

    /// Like [`subscribe`](Self::subscribe), restricted to one event kind.
    pub async fn subscribe_kind(&self, subject: &str, kind: &str) -> Result<Subscription> {
        self.inner
            .gateway
            .subscribe(subject, Some(kind.to_string()))
            .await
    }

    /// Number of subjects the gateway currently listens on.
    pub fn listened_subjects(&self) -> usize {
        self.inner.gateway.listened_subjects()
    }
}

/// A key-value namespace. Keys are stored as `<namespace>/<key>`.
#[derive(Clone)]
pub struct KvScope {
    adapter: Arc<dyn StoreAdapter>,
    namespace: String,
}

impl KvScope {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, key: &str) -> String {
        format!("{}/{}", self.namespace, key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.adapter.kv_get(&self.key(key)).await
    }

    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.adapter.kv_set(&self.key(key), value, ttl).await
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        self.set(key, serde_json::to_value(value)?, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.adapter.kv_delete(&self.key(key)).await
    }

    /// Delete keys in this namespace matching `pattern`.
    pub async fn clear(&self, pattern: &str) -> Result<u64> {
        let pattern = KeyPattern::new(&self.key(pattern))?;
        self.adapter.kv_clear(&pattern).await
    }

    pub async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        self.adapter.kv_increment(&self.key(key), by).await
    }

    pub async fn set_if_absent(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        self.adapter.kv_set_if_absent(&self.key(key), value, ttl).await
    }

    pub async fn compare_and_set(
        &self,
        key: &str,
        expected: &Value,
        value: Option<Value>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.adapter
            .kv_compare_and_set(&self.key(key), expected, value, ttl)
            .await
    }

    /// Consume a live entry. Of any number of concurrent callers, one gets it.
    pub async fn take(&self, key: &str) -> Result<Option<Value>> {
        self.adapter.kv_take(&self.key(key)).await
    }

    pub async fn take_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.take(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}
