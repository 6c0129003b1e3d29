//! Reconcile Runtime
//!
//! Building blocks for level-triggered Kubernetes controllers: a read-only
//! object cache per kind, a coalescing rate-limited work queue, and a change
//! dispatcher that runs registered handlers once per dequeued key, never on
//! the same key concurrently.
//!
//! # Example
//!
//! ```no_run
//! use k8s_openapi::api::apps::v1::Deployment;
//! use reconcile_runtime::{
//!     change_fn, Cache, Dispatcher, ObjectKey, QueueConfig, TracingErrorSink, WorkQueue,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let mut dispatcher = Dispatcher::new(
//!     "Deployment",
//!     Cache::<Deployment>::new(),
//!     WorkQueue::new("Deployment", QueueConfig::default()),
//!     Arc::new(TracingErrorSink),
//! );
//! dispatcher.on_change(
//!     "log",
//!     change_fn(|key: ObjectKey, _obj: Option<Deployment>| async move {
//!         tracing::info!("{} changed", key);
//!         anyhow::Ok(None)
//!     }),
//! );
//! dispatcher.run(2, CancellationToken::new()).await;
//! # }
//! ```
//!
//! # Features
//!
//! - **Object Cache**: owned-clone reads, owner index, tombstones for deleted keys
//! - **Work Queue**: per-key coalescing and exponential retry backoff
//! - **Owner routing**: dependent changes re-enqueue their controller
//! - **Stores**: typed write access through [`ObjectStore`], mockable with `test-util`

pub mod backoff;
pub mod cache;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod key;
pub mod metrics;
pub mod owner;
pub mod queue;
pub mod registry;
pub mod sink;
pub mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use backoff::ExponentialBackoff;
pub use cache::{Cache, CacheEvent};
pub use dispatcher::{
    change_fn, remove_fn, ChangeFn, ChangeHandler, Dispatcher, KindHandle, RemoveFn,
    RemoveHandler,
};
pub use error::{RegistryError, RuntimeError, StoreError};
pub use events::{
    EventBroadcaster, EventRecorder, EventSeverity, EventSink, KubeEventSink, RecordedEvent,
};
pub use key::{ObjectKey, OwnerKey};
pub use metrics::RuntimeMetrics;
pub use owner::{
    controller_of, controller_owner_ref, is_controlled_by, OwnerRoute, OwnerRoutes, RouteOutcome,
};
pub use queue::{Disposition, QueueConfig, WorkQueue, DEFAULT_MAX_RETRIES};
pub use registry::{KindInfo, KindRegistry};
pub use sink::{ErrorSink, TracingErrorSink};
pub use store::{KubeStore, ObjectStore};
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockStore, RecordingErrorSink, RecordingEventRecorder, ReportedError, StoreCall, Verb};
