//! Change dispatcher.
//!
//! One dispatcher per watched kind. It owns the kind's cache and work queue,
//! turns cache updates into queued keys and runs a pool of workers that hand
//! each dequeued key to the registered handlers.
//!
//! A pass for a key works on the cache's current state, not on the event that
//! queued it:
//! - change handlers run in registration order with the cached object, or
//!   `None` when the key is gone. A handler returning `Some(obj)` replaces
//!   the object the next handler sees.
//! - when the key is gone and the cache holds a tombstone for it, remove
//!   handlers run with that last known state. The tombstone is cleared once
//!   the pass succeeds.
//!
//! The first handler error ends the pass; the key is retried with backoff.
//! A panicking handler counts as an error.

use crate::cache::{Cache, CacheEvent};
use crate::key::ObjectKey;
use crate::metrics::RuntimeMetrics;
use crate::queue::{Disposition, WorkQueue};
use crate::sink::ErrorSink;
use anyhow::Context;
use async_trait::async_trait;
use futures::FutureExt;
use kube::Resource;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reacts to the current state of a key.
#[async_trait]
pub trait ChangeHandler<K: Send + 'static>: Send + Sync {
    /// `obj` is `None` when the key no longer exists. Return `Some` to
    /// replace the object passed to the next handler.
    async fn on_change(&self, key: &ObjectKey, obj: Option<K>) -> anyhow::Result<Option<K>>;
}

/// Reacts to the removal of a key.
#[async_trait]
pub trait RemoveHandler<K: Send + 'static>: Send + Sync {
    /// `obj` is the last known state of the deleted object.
    async fn on_remove(&self, key: &ObjectKey, obj: K) -> anyhow::Result<()>;
}

/// [`ChangeHandler`] from a closure, see [`change_fn`].
pub struct ChangeFn<F>(F);

/// Wraps `f(key, obj)` as a change handler.
pub fn change_fn<F>(f: F) -> ChangeFn<F> {
    ChangeFn(f)
}

#[async_trait]
impl<K, F, Fut> ChangeHandler<K> for ChangeFn<F>
where
    K: Send + 'static,
    F: Fn(ObjectKey, Option<K>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<K>>> + Send,
{
    async fn on_change(&self, key: &ObjectKey, obj: Option<K>) -> anyhow::Result<Option<K>> {
        (self.0)(key.clone(), obj).await
    }
}

/// [`RemoveHandler`] from a closure, see [`remove_fn`].
pub struct RemoveFn<F>(F);

/// Wraps `f(key, obj)` as a remove handler.
pub fn remove_fn<F>(f: F) -> RemoveFn<F> {
    RemoveFn(f)
}

#[async_trait]
impl<K, F, Fut> RemoveHandler<K> for RemoveFn<F>
where
    K: Send + 'static,
    F: Fn(ObjectKey, K) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn on_remove(&self, key: &ObjectKey, obj: K) -> anyhow::Result<()> {
        (self.0)(key.clone(), obj).await
    }
}

/// Cheap handle on one kind's cache and queue, for watchers and for other
/// kinds' handlers.
pub struct KindHandle<K> {
    kind: String,
    group: String,
    cache: Cache<K>,
    queue: WorkQueue,
}

impl<K> Clone for KindHandle<K> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            group: self.group.clone(),
            cache: self.cache.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<K> std::fmt::Debug for KindHandle<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindHandle")
            .field("kind", &self.kind)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

impl<K> KindHandle<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    /// Kind served by this handle
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// API group of the kind (`""` for the core group)
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Cache of the kind
    pub fn cache(&self) -> &Cache<K> {
        &self.cache
    }

    /// Work queue of the kind
    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Cached object, `None` when not found.
    pub fn get(&self, namespace: &str, name: &str) -> Option<K> {
        self.cache.get(namespace, name)
    }

    /// Queues `namespace/name` for a pass.
    pub fn enqueue(&self, namespace: &str, name: &str) {
        self.enqueue_key(ObjectKey::new(namespace, name));
    }

    /// Queues `key` for a pass.
    pub fn enqueue_key(&self, key: ObjectKey) {
        if self.queue.add(key.clone()) {
            debug!("Enqueued {} {}", self.kind, key);
        }
    }

    /// Applies a watch event to the cache and queues its key.
    pub fn ingest(&self, event: CacheEvent<K>) {
        let key = self.cache.apply(event);
        self.enqueue_key(key);
    }

    /// Replaces the cache content after a (re)list and queues every key
    /// whose state changed.
    pub fn resync(&self, objects: Vec<K>) {
        let changed = self.cache.replace(objects);
        info!("{} cache synced, {} keys changed", self.kind, changed.len());
        for key in changed {
            self.enqueue_key(key);
        }
    }
}

/// Dispatches queued keys of one kind to its handlers.
pub struct Dispatcher<K: Send + 'static> {
    handle: KindHandle<K>,
    change_handlers: Vec<(String, Arc<dyn ChangeHandler<K>>)>,
    remove_handlers: Vec<(String, Arc<dyn RemoveHandler<K>>)>,
    error_sink: Arc<dyn ErrorSink>,
    metrics: Option<RuntimeMetrics>,
}

impl<K> Dispatcher<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    /// Dispatcher for `kind` over its own cache and queue.
    pub fn new(
        kind: impl Into<String>,
        cache: Cache<K>,
        queue: WorkQueue,
        error_sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            handle: KindHandle {
                kind: kind.into(),
                group: K::group(&()).into_owned(),
                cache,
                queue,
            },
            change_handlers: Vec::new(),
            remove_handlers: Vec::new(),
            error_sink,
            metrics: None,
        }
    }

    /// Records pass outcomes and queue depth in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: RuntimeMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Registers a change handler. Handlers run in registration order.
    pub fn on_change(&mut self, name: impl Into<String>, handler: impl ChangeHandler<K> + 'static) {
        let name = name.into();
        debug!("Registering {} change handler {}", self.handle.kind, name);
        self.change_handlers.push((name, Arc::new(handler)));
    }

    /// Registers a remove handler.
    pub fn on_remove(&mut self, name: impl Into<String>, handler: impl RemoveHandler<K> + 'static) {
        let name = name.into();
        debug!("Registering {} remove handler {}", self.handle.kind, name);
        self.remove_handlers.push((name, Arc::new(handler)));
    }

    /// Kind this dispatcher serves
    pub fn kind(&self) -> &str {
        &self.handle.kind
    }

    /// Cache of the kind
    pub fn cache(&self) -> &Cache<K> {
        &self.handle.cache
    }

    /// Work queue of the kind
    pub fn queue(&self) -> &WorkQueue {
        &self.handle.queue
    }

    /// Handle for watchers and other kinds' handlers.
    pub fn handle(&self) -> KindHandle<K> {
        self.handle.clone()
    }

    /// See [`KindHandle::enqueue`].
    pub fn enqueue(&self, namespace: &str, name: &str) {
        self.handle.enqueue(namespace, name);
    }

    /// See [`KindHandle::enqueue_key`].
    pub fn enqueue_key(&self, key: ObjectKey) {
        self.handle.enqueue_key(key);
    }

    /// See [`KindHandle::ingest`].
    pub fn ingest(&self, event: CacheEvent<K>) {
        self.handle.ingest(event);
    }

    /// See [`KindHandle::resync`].
    pub fn resync(&self, objects: Vec<K>) {
        self.handle.resync(objects);
    }

    /// Runs `workers` workers until `shutdown` fires.
    ///
    /// Cancellation shuts the queue down and abandons passes still running;
    /// their keys are handed back to the queue as failed. Keys still waiting
    /// are abandoned too. Returns once every worker has exited.
    pub async fn run(self, workers: usize, shutdown: CancellationToken) {
        let workers = workers.max(1);
        let kind = self.handle.kind.clone();
        let queue = self.handle.queue.clone();
        let this = Arc::new(self);

        info!("Starting {} workers for {}", workers, kind);
        let mut set = JoinSet::new();
        for id in 0..workers {
            set.spawn(Arc::clone(&this).worker(id, shutdown.clone()));
        }

        let stopper = tokio::spawn(async move {
            shutdown.cancelled().await;
            queue.shut_down();
        });

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!("{} worker terminated abnormally: {}", kind, e);
            }
        }
        stopper.abort();
        info!("Stopped {} workers", kind);
    }

    async fn worker(self: Arc<Self>, id: usize, shutdown: CancellationToken) {
        debug!("{} worker {} started", self.handle.kind, id);
        while let Some(key) = self.handle.queue.get().await {
            tokio::select! {
                () = self.process(key.clone()) => {}
                () = shutdown.cancelled() => {
                    warn!("Abandoning {} {} pass on shutdown", self.handle.kind, key);
                    self.handle.queue.done(&key, &Err::<(), _>("cancelled"));
                    break;
                }
            }
        }
        debug!("{} worker {} exiting", self.handle.kind, id);
    }

    async fn process(&self, key: ObjectKey) {
        let kind = self.handle.kind.as_str();
        let started = Instant::now();
        let result = match AssertUnwindSafe(self.sync(&key)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!("handler panicked: {}", panic_message(&*panic))),
        };

        if let Some(metrics) = &self.metrics {
            metrics.observe_reconcile(kind, result.is_ok(), started.elapsed());
        }
        if let Err(e) = &result {
            self.error_sink.report(kind, &key, e);
        }

        match self.handle.queue.done(&key, &result) {
            Disposition::Completed => debug!("Synced {} {}", kind, key),
            Disposition::Requeued { attempt, delay } => {
                debug!("Requeued {} {} (attempt {}, in {:?})", kind, key, attempt, delay);
                if let Some(metrics) = &self.metrics {
                    metrics.inc_retries(kind);
                }
            }
            Disposition::Dropped { attempts } => {
                warn!("Dropping {} {} out of the queue after {} attempts", kind, key, attempts);
                self.error_sink.report(
                    kind,
                    &key,
                    &anyhow::anyhow!("giving up on {key} after {attempts} attempts"),
                );
                if let Some(metrics) = &self.metrics {
                    metrics.inc_dropped(kind);
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(kind, self.handle.queue.len());
        }
    }

    async fn sync(&self, key: &ObjectKey) -> anyhow::Result<()> {
        let cache = &self.handle.cache;
        let mut obj = cache.get_by_key(key);
        let removed = if obj.is_none() {
            cache.tombstone(key)
        } else {
            None
        };

        for (name, handler) in &self.change_handlers {
            let replacement = handler
                .on_change(key, obj.clone())
                .await
                .with_context(|| format!("{name} failed"))?;
            if replacement.is_some() {
                obj = replacement;
            }
        }

        if let Some(last_known) = removed {
            for (name, handler) in &self.remove_handlers {
                handler
                    .on_remove(key, last_known.clone())
                    .await
                    .with_context(|| format!("{name} failed"))?;
            }
            cache.clear_tombstone(key);
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

impl<K: Send + 'static> std::fmt::Debug for Dispatcher<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let change: Vec<&str> = self.change_handlers.iter().map(|(n, _)| n.as_str()).collect();
        let remove: Vec<&str> = self.remove_handlers.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("Dispatcher")
            .field("kind", &self.handle.kind)
            .field("change_handlers", &change)
            .field("remove_handlers", &remove)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "dispatcher_test.rs"]
mod dispatcher_test;
