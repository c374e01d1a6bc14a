//! In-process adapter. Single instance only; state dies with the process.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use super::{KeyPattern, Notice, StoreAdapter, Transport};
use crate::error::{Error, Result};
use crate::model::event::{
    Direction, EventRecord, IndexEntry, IndexRange, NewEvent, ReadOptions, sort_entries,
};

const NOTICE_CAPACITY: usize = 1024;

#[derive(Default)]
struct StreamLog {
    last_id: u64,
    records: Vec<EventRecord>,
}

struct KvEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamLog>,
    indexes: HashMap<String, HashMap<String, f64>>,
    kv: HashMap<String, KvEntry>,
}

impl State {
    /// Live value for `key`, evicting it if expired.
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut KvEntry> {
        if self.kv.get(key).is_some_and(|e| !e.is_live(now)) {
            self.kv.remove(key);
        }
        self.kv.get_mut(key)
    }
}

fn expiry(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

pub struct MemoryStore {
    state: Mutex<State>,
    notices: broadcast::Sender<Notice>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            notices,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn append(&self, subject: &str, event: NewEvent) -> Result<EventRecord> {
        let record = {
            let mut state = self.state();
            let log = state.streams.entry(subject.to_string()).or_default();
            log.last_id += 1;
            let record = event.into_record(subject, log.last_id);
            log.records.push(record.clone());
            record
        };
        // No receivers is fine: nobody is listening yet.
        let _ = self.notices.send(Notice {
            subject: subject.to_string(),
            id: record.id,
        });
        Ok(record)
    }

    async fn read(&self, subject: &str, opts: &ReadOptions) -> Result<Vec<EventRecord>> {
        let state = self.state();
        let Some(log) = state.streams.get(subject) else {
            return Ok(Vec::new());
        };
        // Ids are contiguous from 1, so record `id` sits at `id - 1`.
        let page = &log.records[opts.span(log.records.len())];
        Ok(match opts.direction {
            Direction::Forward => page.to_vec(),
            Direction::Backward => page.iter().rev().cloned().collect(),
        })
    }

    async fn count(&self, subject: &str) -> Result<u64> {
        Ok(self
            .state()
            .streams
            .get(subject)
            .map_or(0, |log| log.records.len() as u64))
    }

    async fn delete_stream(&self, subject: &str) -> Result<()> {
        self.state().streams.remove(subject);
        Ok(())
    }

    async fn index_write(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.state()
            .indexes
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn index_read(&self, key: &str, range: &IndexRange) -> Result<Vec<IndexEntry>> {
        let mut entries: Vec<IndexEntry> = self
            .state()
            .indexes
            .get(key)
            .map(|members| {
                members
                    .iter()
                    .map(|(member, score)| IndexEntry {
                        member: member.clone(),
                        score: *score,
                    })
                    .collect()
            })
            .unwrap_or_default();
        sort_entries(&mut entries);
        Ok(range.apply(entries))
    }

    async fn index_count(&self, key: &str) -> Result<u64> {
        Ok(self
            .state()
            .indexes
            .get(key)
            .map_or(0, |members| members.len() as u64))
    }

    async fn index_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.state();
        if let Some(members) = state.indexes.get_mut(key) {
            members.remove(member);
            if members.is_empty() {
                state.indexes.remove(key);
            }
        }
        Ok(())
    }

    async fn delete_index(&self, key: &str) -> Result<()> {
        self.state().indexes.remove(key);
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Value>> {
        let mut state = self.state();
        Ok(state.live(key, Instant::now()).map(|e| e.value.clone()))
    }

    async fn kv_set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.state().kv.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: expiry(ttl),
            },
        );
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state();
        let live = state.live(key, Instant::now()).is_some();
        state.kv.remove(key);
        Ok(live)
    }

    async fn kv_clear(&self, pattern: &KeyPattern) -> Result<u64> {
        let mut state = self.state();
        let now = Instant::now();
        let mut removed = 0;
        state.kv.retain(|key, entry| {
            if pattern.matches(key) {
                if entry.is_live(now) {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn kv_increment(&self, key: &str, by: i64) -> Result<i64> {
        let mut state = self.state();
        let now = Instant::now();
        let next = match state.live(key, now) {
            Some(entry) => {
                let current = entry.value.as_i64().ok_or_else(|| {
                    Error::Validation(format!("kv key '{key}' does not hold an integer"))
                })?;
                let next = current + by;
                entry.value = Value::from(next);
                next
            }
            None => {
                state.kv.insert(
                    key.to_string(),
                    KvEntry {
                        value: Value::from(by),
                        expires_at: None,
                    },
                );
                by
            }
        };
        Ok(next)
    }

    async fn kv_set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut state = self.state();
        if state.live(key, Instant::now()).is_some() {
            return Ok(false);
        }
        state.kv.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: expiry(ttl),
            },
        );
        Ok(true)
    }

    async fn kv_compare_and_set(
        &self,
        key: &str,
        expected: &Value,
        value: Option<Value>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut state = self.state();
        let matches = state
            .live(key, Instant::now())
            .is_some_and(|entry| &entry.value == expected);
        if !matches {
            return Ok(false);
        }
        match value {
            Some(value) => {
                state.kv.insert(
                    key.to_string(),
                    KvEntry {
                        value,
                        expires_at: expiry(ttl),
                    },
                );
            }
            None => {
                state.kv.remove(key);
            }
        }
        Ok(true)
    }

    async fn kv_take(&self, key: &str) -> Result<Option<Value>> {
        let mut state = self.state();
        if state.live(key, Instant::now()).is_none() {
            return Ok(None);
        }
        Ok(state.kv.remove(key).map(|e| e.value))
    }

    fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport::new(self.notices.subscribe()))
    }
}

/// Broadcast-channel feed filtered to the listened subjects.
pub(crate) struct MemoryTransport {
    rx: tokio::sync::Mutex<broadcast::Receiver<Notice>>,
    listened: Mutex<HashSet<String>>,
}

impl MemoryTransport {
    pub(crate) fn new(rx: broadcast::Receiver<Notice>) -> Self {
        Self {
            rx: tokio::sync::Mutex::new(rx),
            listened: Mutex::new(HashSet::new()),
        }
    }

    fn listened(&self) -> MutexGuard<'_, HashSet<String>> {
        self.listened.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self, subject: &str) -> Result<()> {
        self.listened().insert(subject.to_string());
        Ok(())
    }

    async fn unlisten(&self, subject: &str) -> Result<()> {
        self.listened().remove(subject);
        Ok(())
    }

    async fn recv(&self) -> Option<Notice> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(notice) => {
                    if self.listened().contains(&notice.subject) {
                        return Some(notice);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notification feed lagged, notices dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_entries_are_absent() {
        let store = MemoryStore::new();
        store
            .kv_set("k", Value::from(1), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.kv_get("k").await.unwrap(), None);
        assert!(
            store
                .kv_set_if_absent("k", Value::from(2), None)
                .await
                .unwrap()
        );
        assert_eq!(store.kv_get("k").await.unwrap(), Some(Value::from(2)));
    }

    #[tokio::test]
    async fn increment_rejects_non_integers() {
        let store = MemoryStore::new();
        store.kv_set("k", Value::from("x"), None).await.unwrap();
        assert!(store.kv_increment("k", 1).await.is_err());
    }
}
