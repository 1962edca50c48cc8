//! Rate-limited work queue of string keys.
//!
//! Semantics:
//!
//! - a key is queued at most once; adding a queued key is a no-op;
//! - a key handed out by [`WorkQueue::get`] is *processing* until [`WorkQueue::done`]; re-adding
//!   it meanwhile marks it dirty and it is queued again on `done`, so one key is never processed
//!   by two consumers at once;
//! - [`WorkQueue::add_rate_limited`] delays the re-add by the limiter's verdict for that key;
//!   [`WorkQueue::forget`] clears that history;
//! - [`WorkQueue::shut_down`] wakes every blocked `get`, which then returns `None`.

pub mod rate_limiter;

use rate_limiter::RateLimiter;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

struct Shared {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    limiter: Arc<dyn RateLimiter>,
    shutdown: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, key: String) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }
}

/// FIFO of keys with dedup, per-key backoff and shutdown.
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("WorkQueue")
            .field("name", &self.shared.name)
            .field("queued", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                limiter,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Queue `key` unless it is already queued. Ignored after shutdown.
    pub fn add(&self, key: impl Into<String>) {
        self.shared.add(key.into());
    }

    /// Queue `key` after `delay`. A pending delayed add is dropped on shutdown.
    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.shared.add(key);
            return;
        }
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => shared.add(key),
            }
        });
    }

    /// Queue `key` after the limiter's delay for it.
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = self.shared.limiter.when(&key);
        self.add_after(key, delay);
    }

    /// Clear the limiter's history for `key`.
    pub fn forget(&self, key: &str) {
        self.shared.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &str) -> usize {
        self.shared.limiter.num_requeues(key)
    }

    /// Wait for the next key. `None` once the queue has shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as processed; re-queues it if it was added while processing.
    pub fn done(&self, key: &str) {
        let mut state = self.shared.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiter.
    pub fn shut_down(&self) {
        {
            let mut state = self.shared.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
        }
        self.shared.shutdown.cancel();
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.lock().shutting_down
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}
