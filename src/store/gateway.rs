//! Notification gateway: one transport per store, fanned out to many
//! in-process subscribers.
//!
//! The registry is keyed by subject. The transport is told to listen when the
//! first handler for a subject attaches and to unlisten when the last one
//! detaches. Each notice names `(subject, id)`; the dispatch task fetches that
//! record once and hands a copy to every handler whose kind filter admits it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Notice, StoreAdapter, Transport};
use crate::error::Result;
use crate::model::event::{EventRecord, ReadOptions};

struct Handler {
    kind: Option<String>,
    tx: mpsc::UnboundedSender<EventRecord>,
}

pub(crate) struct GatewayShared {
    adapter: Arc<dyn StoreAdapter>,
    transport: Arc<dyn Transport>,
    registry: Mutex<HashMap<String, HashMap<u64, Handler>>>,
    /// Serializes listen/unlisten so the transport's view follows the registry.
    membership: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
}

impl GatewayShared {
    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<u64, Handler>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn detach(&self, subject: &str, id: u64) -> Result<()> {
        let _membership = self.membership.lock().await;
        let now_idle = {
            let mut registry = self.registry();
            match registry.get_mut(subject) {
                Some(handlers) => {
                    handlers.remove(&id);
                    if handlers.is_empty() {
                        registry.remove(subject);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if now_idle {
            debug!(subject, "last subscriber detached, unlistening");
            self.transport.unlisten(subject).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, notice: Notice) {
        let interested = self
            .registry()
            .get(&notice.subject)
            .is_some_and(|handlers| !handlers.is_empty());
        if !interested {
            return;
        }

        let opts = ReadOptions::forward(1).after(notice.id.saturating_sub(1));
        let record = match self.adapter.read(&notice.subject, &opts).await {
            Ok(mut page) if !page.is_empty() && page[0].id == notice.id => page.remove(0),
            Ok(_) => {
                debug!(subject = %notice.subject, id = notice.id, "notified record no longer present");
                return;
            }
            Err(e) => {
                warn!(subject = %notice.subject, id = notice.id, error = %e, "failed to fetch notified record");
                return;
            }
        };

        let mut registry = self.registry();
        if let Some(handlers) = registry.get_mut(&notice.subject) {
            handlers.retain(|_, handler| {
                let wanted = handler.kind.as_deref().is_none_or(|k| k == record.kind);
                !wanted || handler.tx.send(record.clone()).is_ok()
            });
        }
    }
}

pub(crate) struct Gateway {
    shared: Arc<GatewayShared>,
    task: JoinHandle<()>,
}

impl Gateway {
    pub(crate) fn start(adapter: Arc<dyn StoreAdapter>) -> Self {
        let transport = adapter.transport();
        let shared = Arc::new(GatewayShared {
            adapter,
            transport,
            registry: Mutex::new(HashMap::new()),
            membership: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
        });

        let loop_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            while let Some(notice) = loop_shared.transport.recv().await {
                loop_shared.dispatch(notice).await;
            }
            debug!("notification transport closed");
        });

        Self { shared, task }
    }

    pub(crate) async fn subscribe(&self, subject: &str, kind: Option<String>) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        let _membership = self.shared.membership.lock().await;
        let first = {
            let mut registry = self.shared.registry();
            let handlers = registry.entry(subject.to_string()).or_default();
            handlers.insert(id, Handler { kind, tx });
            handlers.len() == 1
        };
        if first {
            debug!(subject, "first subscriber attached, listening");
            if let Err(e) = self.shared.transport.listen(subject).await {
                let mut registry = self.shared.registry();
                if let Some(handlers) = registry.get_mut(subject) {
                    handlers.remove(&id);
                    if handlers.is_empty() {
                        registry.remove(subject);
                    }
                }
                return Err(e);
            }
        }

        Ok(Subscription {
            id,
            subject: subject.to_string(),
            rx,
            shared: Arc::downgrade(&self.shared),
            detached: false,
        })
    }

    pub(crate) fn listened_subjects(&self) -> usize {
        self.shared.registry().len()
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A live subscription to one subject. Detaches on drop.
pub struct Subscription {
    id: u64,
    subject: String,
    rx: mpsc::UnboundedReceiver<EventRecord>,
    shared: Weak<GatewayShared>,
    detached: bool,
}

impl Subscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next delivered record; `None` once the store has shut down.
    pub async fn recv(&mut self) -> Option<EventRecord> {
        self.rx.recv().await
    }

    /// Detach now, waiting for the transport to unlisten if this was the last handler.
    pub async fn unsubscribe(mut self) -> Result<()> {
        self.detached = true;
        match self.shared.upgrade() {
            Some(shared) => shared.detach(&self.subject, self.id).await,
            None => Ok(()),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let subject = std::mem::take(&mut self.subject);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = shared.detach(&subject, id).await {
                        warn!(subject = %subject, error = %e, "failed to detach subscription");
                    }
                });
            }
            Err(_) => {
                // No runtime left to unlisten on; just forget the handler.
                let mut registry = shared.registry();
                if let Some(handlers) = registry.get_mut(&subject) {
                    handlers.remove(&id);
                    if handlers.is_empty() {
                        registry.remove(&subject);
                    }
                }
            }
        }
    }
}
