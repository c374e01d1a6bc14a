//! In-process dispatch queue for step invocations.
//!
//! Work waits while the queue is paused, then runs once one of
//! `concurrency` permits is free.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::error::Result;

/// Job counts, as reported to operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: bool,
}

#[derive(Default)]
struct Counters {
    waiting: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Saturates at zero: `abort` may reset a counter under a finishing job.
fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
}

pub(crate) struct DispatchQueue {
    permits: Arc<Semaphore>,
    paused: watch::Sender<bool>,
    counters: Arc<Counters>,
    idle: Arc<Notify>,
    tasks: Mutex<JoinSet<()>>,
}

impl DispatchQueue {
    pub(crate) fn new(concurrency: usize) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            paused,
            counters: Arc::new(Counters::default()),
            idle: Arc::new(Notify::new()),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Queue `job`. A job returning `Err` counts as failed.
    pub(crate) fn submit<F>(&self, job: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let mut paused = self.paused.subscribe();
        let counters = Arc::clone(&self.counters);
        let idle = Arc::clone(&self.idle);
        counters.waiting.fetch_add(1, Ordering::SeqCst);

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                if e.is_panic() {
                    error!(error = %e, "dispatched job panicked");
                }
            }
        }
        tasks.spawn(async move {
            // Sender lives as long as the queue; a closed channel means shutdown.
            let _ = paused.wait_for(|p| !*p).await;
            let Ok(_permit) = permits.acquire_owned().await else {
                decrement(&counters.waiting);
                idle.notify_waiters();
                return;
            };
            counters.active.fetch_add(1, Ordering::SeqCst);
            decrement(&counters.waiting);

            let outcome = job.await;
            match &outcome {
                Ok(()) => counters.completed.fetch_add(1, Ordering::SeqCst),
                Err(e) => {
                    debug!(error = %e, "dispatched job failed");
                    counters.failed.fetch_add(1, Ordering::SeqCst)
                }
            };
            decrement(&counters.active);
            idle.notify_waiters();
        });
    }

    pub(crate) fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub(crate) fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub(crate) fn stats(&self) -> QueueStats {
        QueueStats {
            waiting: self.counters.waiting.load(Ordering::SeqCst),
            active: self.counters.active.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            paused: *self.paused.borrow(),
        }
    }

    fn is_idle(&self) -> bool {
        self.counters.waiting.load(Ordering::SeqCst) == 0
            && self.counters.active.load(Ordering::SeqCst) == 0
    }

    /// Resolve once nothing is waiting or running.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Kill every queued and running job on the spot. Nothing they hold is
    /// released; the queue accepts no further work.
    pub(crate) fn abort(&self) {
        self.permits.close();
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
        self.counters.waiting.store(0, Ordering::SeqCst);
        self.counters.active.store(0, Ordering::SeqCst);
        self.idle.notify_waiters();
    }

    /// Stop accepting permits; queued jobs are dropped, running ones finish.
    pub(crate) async fn close(&self) {
        self.permits.close();
        self.resume();
        while self.counters.active.load(Ordering::SeqCst) > 0 {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.counters.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrency_is_bounded_and_pause_holds_work() {
        let queue = DispatchQueue::new(2);
        queue.pause();
        for _ in 0..4 {
            queue.submit(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            });
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.stats().waiting, 4);
        assert_eq!(queue.stats().active, 0);

        queue.resume();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.stats().active <= 2);

        queue.wait_idle().await;
        let stats = queue.stats();
        assert_eq!(stats.completed, 4);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn abort_kills_running_jobs() {
        let queue = DispatchQueue::new(1);
        let finished = Arc::new(AtomicU64::new(0));
        let done = Arc::clone(&finished);
        queue.submit(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.stats().active, 1);

        queue.abort();
        queue.wait_idle().await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert_eq!(queue.stats().completed, 0);
    }

    #[tokio::test]
    async fn failures_are_counted() {
        let queue = DispatchQueue::new(1);
        queue.submit(async { Err(crate::error::Error::Other("boom".into())) });
        queue.wait_idle().await;
        assert_eq!(queue.stats().failed, 1);
    }
}
