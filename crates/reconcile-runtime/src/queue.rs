//! Coalescing, rate-limited work queue.
//!
//! Keys, not events, are queued: any number of `add` calls for a key that is
//! already waiting collapse into one entry, and an `add` for a key that is
//! being processed is parked until that worker calls `done`. A key is never
//! handed to two workers at the same time.
//!
//! Failed keys are retried with per-key exponential backoff until
//! `max_retries` is exceeded, after which they are dropped and the caller is
//! told so through [`Disposition::Dropped`].

use crate::backoff::{ExponentialBackoff, DEFAULT_BASE, DEFAULT_MAX};
use crate::key::ObjectKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Default retry budget per key
pub const DEFAULT_MAX_RETRIES: u32 = 15;

/// Retry policy of a work queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// First retry delay
    pub backoff_base: Duration,
    /// Retry delay cap
    pub backoff_max: Duration,
    /// Failures tolerated before a key is dropped
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff_base: DEFAULT_BASE,
            backoff_max: DEFAULT_MAX,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// What happened to a key handed back through [`WorkQueue::done`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed successfully, failure history forgotten
    Completed,
    /// Failed, scheduled again after `delay`
    Requeued {
        /// Consecutive failures so far
        attempt: u32,
        /// Delay before the key is re-added
        delay: Duration,
    },
    /// Failed too often, dropped from the queue
    Dropped {
        /// Consecutive failures including this one
        attempts: u32,
    },
}

#[derive(Debug, Default)]
struct QueueState {
    /// Keys ready to be handed out, in order
    queue: VecDeque<ObjectKey>,
    /// Keys waiting for processing (queued, or re-added while in flight)
    dirty: HashSet<ObjectKey>,
    /// Keys currently held by a worker
    processing: HashSet<ObjectKey>,
    /// Consecutive failures per key
    failures: HashMap<ObjectKey, u32>,
    shutting_down: bool,
}

#[derive(Debug)]
struct Inner {
    name: String,
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Work queue of object keys for one kind.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    /// Creates a queue named after the kind it serves.
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                config,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Queue name (the kind it serves)
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Retry policy
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `key` as needing processing.
    ///
    /// Returns `false` when the add was coalesced into an existing pending
    /// entry or the queue is shutting down.
    pub fn add(&self, key: ObjectKey) -> bool {
        let mut state = self.lock();
        if state.shutting_down {
            return false;
        }
        if !state.dirty.insert(key.clone()) {
            trace!("{} queue: {} already pending", self.inner.name, key);
            return false;
        }
        if state.processing.contains(&key) {
            // Picked up again by `done`
            trace!("{} queue: {} in flight, parked", self.inner.name, key);
            return true;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
        true
    }

    /// Adds `key` once `delay` has elapsed.
    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Waits for the next key and marks it in flight.
    ///
    /// Returns `None` once the queue is shut down; keys still waiting are
    /// not handed out after that point.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
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

    /// Hands `key` back after processing.
    ///
    /// On success the failure history is cleared; on failure the key is
    /// re-added with backoff, or dropped once the retry budget is spent. In
    /// both cases a key re-added while in flight is queued again right away.
    pub fn done<E>(&self, key: &ObjectKey, result: &Result<(), E>) -> Disposition {
        let mut state = self.lock();
        state.processing.remove(key);

        let requeue_now = state.dirty.contains(key) && !state.shutting_down;
        if requeue_now {
            state.queue.push_back(key.clone());
        }

        let disposition = if result.is_ok() {
            state.failures.remove(key);
            Disposition::Completed
        } else {
            let attempt = {
                let failures = state.failures.entry(key.clone()).or_insert(0);
                *failures = failures.saturating_add(1);
                *failures
            };
            if attempt > self.inner.config.max_retries {
                state.failures.remove(key);
                Disposition::Dropped { attempts: attempt }
            } else {
                let delay = ExponentialBackoff::calculate_for_error_count(
                    attempt.saturating_sub(1),
                    self.inner.config.backoff_base,
                    self.inner.config.backoff_max,
                );
                Disposition::Requeued { attempt, delay }
            }
        };
        drop(state);

        if requeue_now {
            self.inner.notify.notify_one();
        }
        if let Disposition::Requeued { delay, .. } = disposition {
            debug!("{} queue: retrying {} in {:?}", self.inner.name, key, delay);
            self.add_after(key.clone(), delay);
        }
        disposition
    }

    /// Clears the failure history of `key`.
    pub fn forget(&self, key: &ObjectKey) {
        self.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for `key`.
    pub fn retries(&self, key: &ObjectKey) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// True when no key is ready.
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// True while `key` is held by a worker.
    pub fn is_processing(&self, key: &ObjectKey) -> bool {
        self.lock().processing.contains(key)
    }

    /// Stops handing out keys and wakes every waiting worker.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// True after [`shut_down`](Self::shut_down).
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod queue_test;
