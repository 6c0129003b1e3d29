//! Kubernetes resource watchers.
//!
//! Bridges `kube_runtime::watcher` streams into a kind's cache and queue.
//! A (re)list arrives as `Init`, `InitApply`..., `InitDone`; it is buffered
//! and applied as one resync so keys that vanished while the watch was down
//! still get their removal handled. Stream errors are logged and retried by
//! the watcher's default backoff.

use crate::error::ControllerError;
use futures::StreamExt;
use kube::{Api, Resource};
use kube_runtime::{watcher, WatchStreamExt};
use reconcile_runtime::{CacheEvent, KindHandle};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Watches `api` and feeds `handle` until `shutdown` fires.
pub async fn watch<K>(
    api: Api<K>,
    handle: KindHandle<K>,
    shutdown: CancellationToken,
) -> Result<(), ControllerError>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    info!("Starting {} watcher", handle.kind());
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    let mut relist: Option<Vec<K>> = None;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("Stopping {} watcher", handle.kind());
                return Ok(());
            }
            item = stream.next() => match item {
                Some(Ok(event)) => apply_event(&handle, &mut relist, event),
                Some(Err(e)) => warn!("{} watch error (retrying): {}", handle.kind(), e),
                None => {
                    return Err(ControllerError::Watch(format!(
                        "{} watch stream ended",
                        handle.kind()
                    )));
                }
            },
        }
    }
}

/// Applies one watcher event. `relist` buffers objects of a list in progress.
pub fn apply_event<K>(handle: &KindHandle<K>, relist: &mut Option<Vec<K>>, event: watcher::Event<K>)
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    match event {
        watcher::Event::Init => {
            debug!("{} list started", handle.kind());
            *relist = Some(Vec::new());
        }
        watcher::Event::InitApply(obj) => relist.get_or_insert_with(Vec::new).push(obj),
        watcher::Event::InitDone => {
            handle.resync(relist.take().unwrap_or_default());
        }
        watcher::Event::Apply(obj) => handle.ingest(CacheEvent::Applied(obj)),
        watcher::Event::Delete(obj) => handle.ingest(CacheEvent::Deleted(obj)),
    }
}
