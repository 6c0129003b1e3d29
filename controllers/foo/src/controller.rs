//! Main controller implementation.
//!
//! Wires the Foo and Deployment caches, queues and dispatchers together,
//! starts the watchers, and runs the workers once both caches are synced.

use crate::config::Config;
use crate::error::ControllerError;
use crate::reconciler::{self, Handler, CONTROLLER_AGENT_NAME};
use crate::server::{self, ServerState};
use crate::watcher;
use crds::{Foo, FOO_KIND};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use prometheus::Registry;
use reconcile_runtime::{
    Cache, Dispatcher, ErrorSink, EventBroadcaster, KindRegistry, KubeEventSink, KubeStore,
    OwnerRoutes, RuntimeMetrics, TracingErrorSink, WorkQueue,
};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEPLOYMENT_KIND: &str = "Deployment";

/// Foo controller process.
pub struct Controller {
    config: Config,
    client: Client,
    foos: Dispatcher<Foo>,
    deployments: Dispatcher<Deployment>,
    metrics: RuntimeMetrics,
    events: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("foos", &self.foos)
            .field("deployments", &self.deployments)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Connects to the cluster and registers the handlers.
    pub async fn new(config: Config, shutdown: CancellationToken) -> Result<Self, ControllerError> {
        info!("Initializing Foo Controller");

        let mut kube_config = kube::Config::infer().await?;
        if let Some(url) = &config.master_url {
            kube_config.cluster_url = url.parse().map_err(|e| {
                ControllerError::InvalidConfig(format!("MASTER_URL {url:?}: {e}"))
            })?;
        }
        let client = Client::try_from(kube_config)?;

        let metrics = RuntimeMetrics::new(&Registry::new())?;
        let error_sink: Arc<dyn ErrorSink> = Arc::new(TracingErrorSink);

        let mut foos = Dispatcher::new(
            FOO_KIND,
            Cache::new(),
            WorkQueue::new(FOO_KIND, config.queue.clone()),
            Arc::clone(&error_sink),
        )
        .with_metrics(metrics.clone());
        let mut deployments = Dispatcher::new(
            DEPLOYMENT_KIND,
            Cache::new(),
            WorkQueue::new(DEPLOYMENT_KIND, config.queue.clone()),
            Arc::clone(&error_sink),
        )
        .with_metrics(metrics.clone());

        let mut owners = OwnerRoutes::new();
        owners.register(foos.handle());

        let (recorder, events) = EventBroadcaster::start(
            config.event_buffer,
            Arc::new(KubeEventSink::new(client.clone(), CONTROLLER_AGENT_NAME)),
            shutdown.clone(),
        );

        let handler = Arc::new(Handler {
            deployments: deployments.handle(),
            deployment_store: Arc::new(KubeStore::<Deployment>::new(client.clone())),
            foo_store: Arc::new(KubeStore::<Foo>::new(client.clone())),
            owners,
            registry: KindRegistry::new().register::<Foo>().register::<Deployment>(),
            recorder: Arc::new(recorder),
            error_sink,
        });
        reconciler::register(&handler, &mut foos, &mut deployments);

        Ok(Self {
            config,
            client,
            foos,
            deployments,
            metrics,
            events,
            shutdown,
        })
    }

    /// Runs until the shutdown token fires or a watcher fails.
    pub async fn run(self) -> Result<(), ControllerError> {
        let Self {
            config,
            client,
            foos,
            deployments,
            metrics,
            events,
            shutdown,
        } = self;
        let namespace = config.namespace.as_deref();

        let mut tasks: JoinSet<Result<(), ControllerError>> = JoinSet::new();
        tasks.spawn(watcher::watch(
            api::<Foo>(&client, namespace),
            foos.handle(),
            shutdown.clone(),
        ));
        tasks.spawn(watcher::watch(
            api::<Deployment>(&client, namespace),
            deployments.handle(),
            shutdown.clone(),
        ));

        let ready = {
            let foo_cache = foos.cache().clone();
            let deployment_cache = deployments.cache().clone();
            move || foo_cache.is_synced() && deployment_cache.is_synced()
        };
        tasks.spawn(server::serve(
            config.metrics_addr,
            ServerState::new(metrics, ready),
            shutdown.clone(),
        ));

        info!("Waiting for informer caches to sync");
        let startup = tokio::select! {
            synced = async {
                foos.cache().wait_synced().await && deployments.cache().wait_synced().await
            } => Ok(synced),
            () = shutdown.cancelled() => Ok(false),
            Some(joined) = tasks.join_next() => Err(flatten(joined)),
        };
        match startup {
            Ok(true) => {}
            Ok(false) => {
                info!("Shutdown requested before caches synced");
                shutdown.cancel();
                drain(&mut tasks).await;
                return Ok(());
            }
            // A watcher or the server ended before the caches synced
            Err(outcome) => {
                shutdown.cancel();
                drain(&mut tasks).await;
                return outcome;
            }
        }

        info!("Starting workers");
        let foo_workers = tokio::spawn(foos.run(config.workers, shutdown.clone()));
        let deployment_workers = tokio::spawn(deployments.run(config.workers, shutdown.clone()));
        info!("Started workers");

        let outcome = tokio::select! {
            () = shutdown.cancelled() => Ok(()),
            Some(joined) = tasks.join_next() => flatten(joined),
        };
        if let Err(e) = &outcome {
            error!("Controller task failed: {}", e);
        }

        info!("Shutting down workers");
        shutdown.cancel();
        for (kind, workers) in [(FOO_KIND, foo_workers), (DEPLOYMENT_KIND, deployment_workers)] {
            if let Err(e) = workers.await {
                error!("{} workers panicked: {}", kind, e);
            }
        }
        drain(&mut tasks).await;
        if let Err(e) = events.await {
            warn!("Event broadcaster panicked: {}", e);
        }
        outcome
    }
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn flatten(joined: Result<Result<(), ControllerError>, JoinError>) -> Result<(), ControllerError> {
    joined.map_err(|e| ControllerError::Watch(format!("task panicked: {e}")))?
}

/// Waits for every remaining task, logging failures.
async fn drain(tasks: &mut JoinSet<Result<(), ControllerError>>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = flatten(joined) {
            warn!("Task failed during shutdown: {}", e);
        }
    }
}
