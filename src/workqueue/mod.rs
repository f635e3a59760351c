//! # Work queue
//!
//! A deduplicating queue of string keys with rate-limited retries.
//!
//! ```text
//!   add ──► dirty? ──yes──► dropped
//!             │no
//!             ▼
//!       processing? ──yes──► requeued by done()
//!             │no
//!             ▼
//!          [queue] ──► get ──► processing ──► done
//! ```
//!
//! A key is in the queue at most once. A key added while a worker holds it is
//! queued again once that worker calls [`WorkQueue::done`], so the newest
//! change is always processed after the current one.

pub mod limiter;

pub use limiter::ItemRateLimiter;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

pub struct WorkQueue {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    limiter: ItemRateLimiter,
    delayed: CancellationToken,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_limiter(name, ItemRateLimiter::default())
    }

    pub fn with_limiter(name: impl Into<String>, limiter: ItemRateLimiter) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            limiter,
            delayed: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `key` unless it is already waiting
    pub async fn add(&self, key: &str) {
        let mut state = self.state.lock().await;
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            trace!("{}: {} is being processed, deferring", self.name, key);
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Queue `key` after `delay`; dropped if the queue shuts down first
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        let queue = Arc::clone(self);
        let cancelled = self.delayed.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    trace!("{}: dropping delayed {}", queue.name, key);
                }
                _ = tokio::time::sleep(delay) => {
                    queue.add(&key).await;
                }
            }
        });
    }

    /// Queue `key` again after its backoff delay
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = self.limiter.when(key);
        trace!("{}: requeueing {} in {:?}", self.name, key, delay);
        self.add_after(key, delay);
    }

    /// Wait for the next key; `None` once the queue is shut down
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as no longer being processed
    pub async fn done(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Reset the retry history of `key`
    pub fn forget(&self, key: &str) {
        self.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Stop handing out keys; blocked and future `get` calls return `None`
    pub async fn shutdown(&self) {
        self.state.lock().await.shutting_down = true;
        self.delayed.cancel();
        self.notify.notify_waiters();
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.state.lock().await.shutting_down
    }

    /// Number of keys waiting
    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
